use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::post,
    Router,
};
use std::sync::Arc;

use crate::{errors::ServiceError, handlers::common::success_response, AppState};

pub fn webhook_routes() -> Router<Arc<AppState>> {
    Router::new().route("/:gateway", post(receive_webhook))
}

/// Provider webhook entry point. The body is taken as raw bytes so the
/// signature is verified over exactly what the provider sent, before any
/// JSON parsing.
async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    Path(gateway_name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    let gateway = state.gateways.get(&gateway_name)?;
    let signature = headers
        .get(gateway.signature_header())
        .and_then(|value| value.to_str().ok());

    let response = state
        .checkout
        .handle_webhook(&gateway_name, &body, signature)
        .await?;
    Ok(success_response(response))
}
