use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use std::sync::Arc;

use crate::{errors::ServiceError, handlers::common::success_response, AppState};

pub fn payment_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/config", get(gateway_configs))
        .route("/:receipt/status", get(payment_status))
}

/// Polls the provider for a payment's state, settling the order when the
/// provider reports a terminal result. Safe to call repeatedly.
async fn payment_status(
    State(state): State<Arc<AppState>>,
    Path(receipt): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let response = state.checkout.check_payment_status(&receipt).await?;
    Ok(success_response(response))
}

/// Public (non-secret) gateway configuration for checkout frontends.
async fn gateway_configs(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ServiceError> {
    Ok(success_response(state.gateways.frontend_configs()))
}
