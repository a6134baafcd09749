use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use serde_json::json;

/// Standard success envelope.
pub fn success_response<T: Serialize>(data: T) -> impl IntoResponse {
    Json(json!({ "success": true, "data": data }))
}

/// 201 envelope for newly created resources.
pub fn created_response<T: Serialize>(data: T) -> impl IntoResponse {
    (
        StatusCode::CREATED,
        Json(json!({ "success": true, "data": data })),
    )
}
