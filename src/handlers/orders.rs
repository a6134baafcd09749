use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::{errors::ServiceError, handlers::common::success_response, AppState};

pub fn order_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_orders))
        .route("/:order_id", get(get_order))
        .route("/:order_id/cancel", post(cancel_order))
}

#[derive(Debug, Deserialize)]
struct ListOrdersQuery {
    user_id: Uuid,
    #[serde(default = "default_limit")]
    limit: u64,
    #[serde(default)]
    offset: u64,
}

fn default_limit() -> u64 {
    20
}

async fn list_orders(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListOrdersQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let limit = query.limit.min(100);
    let orders = state
        .lifecycle
        .list_orders_for_user(query.user_id, limit, query.offset)
        .await?;
    Ok(success_response(orders))
}

/// Returns an order with its line items.
async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state.lifecycle.get_order(order_id).await?;
    let items = state.lifecycle.get_order_items(order_id).await?;
    Ok(success_response(json!({ "order": order, "items": items })))
}

/// Cancels a pending order and restores its reserved stock.
async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state.lifecycle.cancel(order_id).await?;
    Ok(success_response(order))
}
