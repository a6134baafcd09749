/*!
Checkout and payment orchestration service for an online storefront.

The core flow: validate a cart, atomically reserve stock, create a pending
order, open a hosted-payment session with the selected gateway, then settle
the order from client confirmations, status polls or provider webhooks.
All amounts are integer minor currency units.
*/

use axum::Router;
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod migrator;
pub mod services;

pub use config::AppConfig;
pub use errors::ServiceError;

use config::PaymentsConfig;
use events::EventSender;
use services::{
    carts::DbCartService,
    checkout::CheckoutService,
    order_lifecycle::OrderLifecycle,
    payments::{GatewayRegistry, PhonepeGateway, RazorpayGateway},
    stock_ledger::StockLedger,
};

/// Shared state handed to every handler.
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: AppConfig,
    pub gateways: GatewayRegistry,
    pub checkout: CheckoutService,
    pub lifecycle: OrderLifecycle,
    pub cart: Arc<DbCartService>,
}

impl AppState {
    /// Wires the service graph from a connection and configuration.
    pub fn build(
        db: Arc<DatabaseConnection>,
        config: AppConfig,
        gateways: GatewayRegistry,
        event_sender: EventSender,
    ) -> Arc<Self> {
        let stock_ledger = StockLedger::new(
            db.clone(),
            event_sender.clone(),
            config.low_stock_threshold,
        );
        let lifecycle = OrderLifecycle::new(db.clone(), event_sender.clone(), stock_ledger.clone());
        let cart = Arc::new(DbCartService::new(db.clone(), event_sender.clone()));
        let checkout = CheckoutService::new(
            db.clone(),
            stock_ledger,
            lifecycle.clone(),
            gateways.clone(),
            cart.clone(),
            event_sender,
            config.currency.clone(),
            config.max_quantity_per_line,
        );

        Arc::new(Self {
            db,
            config,
            gateways,
            checkout,
            lifecycle,
            cart,
        })
    }
}

/// Builds the gateway registry from configuration. Providers with missing
/// credentials are skipped, not registered as broken.
pub fn build_gateway_registry(payments: &PaymentsConfig) -> GatewayRegistry {
    let mut registry = GatewayRegistry::new();
    if payments.razorpay.is_configured() {
        registry.register(Arc::new(RazorpayGateway::new(&payments.razorpay)));
    }
    if payments.phonepe.is_configured() {
        registry.register(Arc::new(PhonepeGateway::new(&payments.phonepe)));
    }
    registry
}

/// Assembles the full HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .nest("/checkout", handlers::checkout_routes())
        .nest("/orders", handlers::order_routes())
        .nest("/payments", handlers::payment_routes());

    Router::new()
        .nest("/api/v1", api)
        .nest("/webhooks", handlers::webhook_routes())
        .nest("/health", handlers::health_routes())
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(Duration::from_secs(30))),
        )
        .with_state(state)
}
