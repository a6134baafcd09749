use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;

use crate::{db, AppState};

pub fn health_routes() -> Router<Arc<AppState>> {
    Router::new().route("/", get(health_check))
}

/// Liveness plus a database ping.
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let database = match db::check_connection(&state.db).await {
        Ok(()) => "up",
        Err(_) => "down",
    };

    Json(json!({
        "status": if database == "up" { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "database": database,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}
