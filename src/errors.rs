use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::order::OrderStatus;

/// Standard error body returned by every endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Conflict")
    pub error: String,
    /// Human-readable error description
    pub message: String,
    /// Additional details (per-field validation messages)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<String>>,
    /// ISO 8601 timestamp when the error occurred
    pub timestamp: String,
}

/// Service-level error taxonomy.
///
/// Every failure kind is tagged at its origin; callers branch on the variant,
/// never on message text.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sea_orm::error::DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {}", errors.join("; "))]
    Validation { errors: Vec<String> },

    /// A concurrent checkout consumed the stock first. Retryable conflict,
    /// not a fatal error.
    #[error("Insufficient stock for product {product_id}: requested {requested}, available {available}")]
    StockConflict {
        product_id: Uuid,
        requested: i32,
        available: i32,
    },

    #[error("Payment gateway '{0}' is not configured")]
    GatewayConfiguration(String),

    #[error("Payment gateway call failed: {0}")]
    GatewayCall(String),

    #[error("Invalid order status transition from '{from}' to '{to}'")]
    InvalidTransition {
        from: OrderStatus,
        to: OrderStatus,
    },

    /// Missing or invalid webhook signature. The payload is never processed.
    #[error("Webhook signature rejected for gateway '{gateway}': {reason}")]
    WebhookSignature { gateway: String, reason: String },

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ServiceError::Validation {
            errors: vec![msg.into()],
        }
    }

    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(_) | Self::InternalError(_) | Self::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::StockConflict { .. } => StatusCode::CONFLICT,
            Self::GatewayConfiguration(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::GatewayCall(_) => StatusCode::BAD_GATEWAY,
            Self::InvalidTransition { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::WebhookSignature { .. } => StatusCode::UNAUTHORIZED,
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::InternalError(_) | Self::Other(_) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }

    fn response_details(&self) -> Option<Vec<String>> {
        match self {
            Self::Validation { errors } => Some(errors.clone()),
            _ => None,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            details: self.response_details(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[test]
    fn status_code_mapping() {
        assert_eq!(
            ServiceError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServiceError::validation("x").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::StockConflict {
                product_id: Uuid::new_v4(),
                requested: 2,
                available: 1,
            }
            .status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServiceError::GatewayConfiguration("razorpay".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ServiceError::GatewayCall("timeout".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ServiceError::InvalidTransition {
                from: OrderStatus::Delivered,
                to: OrderStatus::Pending,
            }
            .status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ServiceError::WebhookSignature {
                gateway: "phonepe".into(),
                reason: "missing header".into(),
            }
            .status_code(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn response_message_hides_internal_details() {
        assert_eq!(
            ServiceError::InternalError("secret path".into()).response_message(),
            "Internal server error"
        );
        assert_eq!(
            ServiceError::NotFound("Order missing".into()).response_message(),
            "Not found: Order missing"
        );
    }

    #[tokio::test]
    async fn validation_response_carries_details() {
        let err = ServiceError::Validation {
            errors: vec!["cart is empty".into(), "invalid email".into()],
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload.details.unwrap().len(), 2);
    }
}
