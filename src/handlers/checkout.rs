use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::post,
    Router,
};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    errors::ServiceError,
    handlers::common::{created_response, success_response},
    services::checkout::CheckoutRequest,
    AppState,
};

pub fn checkout_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(initiate_checkout))
        .route("/:order_id/verify", post(verify_payment))
}

/// Starts a checkout: reserves stock, creates the pending order and opens a
/// hosted-payment session.
async fn initiate_checkout(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CheckoutRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let response = state.checkout.initiate_checkout(payload).await?;
    Ok(created_response(response))
}

/// Confirms a client-reported payment result for an order.
async fn verify_payment(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
    Json(payload): Json<Value>,
) -> Result<impl IntoResponse, ServiceError> {
    let response = state.checkout.verify_payment(order_id, &payload).await?;
    Ok(success_response(response))
}
