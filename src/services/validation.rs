use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use uuid::Uuid;

use crate::errors::ServiceError;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$").unwrap());
static PHONE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\+?[0-9]{7,15}$").unwrap());
static POSTAL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9 -]{4,10}$").unwrap());

const MIN_NAME_LEN: usize = 2;
const MAX_NAME_LEN: usize = 100;

/// One requested order line.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CartLine {
    pub product_id: Uuid,
    pub quantity: i32,
}

/// Shipping address captured at checkout; persisted as an immutable
/// JSON snapshot on the order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShippingAddress {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub line1: String,
    #[serde(default)]
    pub line2: Option<String>,
    pub city: String,
    pub state: String,
    pub postal_code: String,
    pub country: String,
}

/// Structured validation result; callers render `errors` to the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub is_valid: bool,
    pub errors: Vec<String>,
}

impl ValidationOutcome {
    fn from_errors(errors: Vec<String>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
        }
    }

    /// Converts an invalid outcome into a `Validation` error.
    pub fn into_result(self) -> Result<(), ServiceError> {
        if self.is_valid {
            Ok(())
        } else {
            Err(ServiceError::Validation {
                errors: self.errors,
            })
        }
    }
}

/// Validates cart contents: non-empty, positive quantities, configured
/// per-line maximum.
pub fn validate_cart_items(items: &[CartLine], max_quantity_per_line: i32) -> ValidationOutcome {
    let mut errors = Vec::new();

    if items.is_empty() {
        errors.push("Cart is empty".to_string());
    }

    for (idx, item) in items.iter().enumerate() {
        if item.product_id.is_nil() {
            errors.push(format!("Item {}: missing product id", idx + 1));
        }
        if item.quantity <= 0 {
            errors.push(format!(
                "Item {}: quantity must be a positive integer, got {}",
                idx + 1,
                item.quantity
            ));
        } else if item.quantity > max_quantity_per_line {
            errors.push(format!(
                "Item {}: quantity {} exceeds the per-line maximum of {}",
                idx + 1,
                item.quantity,
                max_quantity_per_line
            ));
        }
    }

    ValidationOutcome::from_errors(errors)
}

/// Validates the shipping address fields and formats.
pub fn validate_shipping_address(address: &ShippingAddress) -> ValidationOutcome {
    let mut errors = Vec::new();

    let name = address.name.trim();
    if name.len() < MIN_NAME_LEN || name.len() > MAX_NAME_LEN {
        errors.push(format!(
            "Name must be between {MIN_NAME_LEN} and {MAX_NAME_LEN} characters"
        ));
    }
    if !EMAIL_RE.is_match(address.email.trim()) {
        errors.push("Email address is malformed".to_string());
    }
    if !PHONE_RE.is_match(address.phone.trim()) {
        errors.push("Phone number is malformed".to_string());
    }
    if !POSTAL_RE.is_match(address.postal_code.trim()) {
        errors.push("Postal code is malformed".to_string());
    }
    for (field, value) in [
        ("Address line 1", &address.line1),
        ("City", &address.city),
        ("State", &address.state),
        ("Country", &address.country),
    ] {
        if value.trim().is_empty() {
            errors.push(format!("{field} is required"));
        }
    }

    ValidationOutcome::from_errors(errors)
}

/// Advisory stock pre-check for fast user feedback. This is NOT the
/// concurrency-safety mechanism; that is the ledger's conditional
/// reservation performed later, inside the checkout transaction.
pub async fn validate_stock_availability<F, Fut>(
    items: &[CartLine],
    stock_lookup: F,
) -> Result<ValidationOutcome, ServiceError>
where
    F: Fn(Uuid) -> Fut,
    Fut: Future<Output = Result<Option<i32>, ServiceError>>,
{
    let mut errors = Vec::new();

    for item in items {
        match stock_lookup(item.product_id).await? {
            None => errors.push(format!("Product {} not found", item.product_id)),
            Some(stock) if stock < item.quantity => errors.push(format!(
                "Product {}: requested {}, only {} in stock",
                item.product_id, item.quantity, stock
            )),
            Some(_) => {}
        }
    }

    Ok(ValidationOutcome::from_errors(errors))
}

/// Required-field presence check on an inbound payment-confirmation
/// payload, before it is trusted enough to verify. The field list comes
/// from the gateway handling the order.
pub fn validate_payment_payload(payload: &Value, required: &[&str]) -> ValidationOutcome {
    let mut errors = Vec::new();
    for field in required {
        let present = payload
            .get(field)
            .and_then(Value::as_str)
            .map(|s| !s.is_empty())
            .unwrap_or(false);
        if !present {
            errors.push(format!("Missing required payment field '{field}'"));
        }
    }

    ValidationOutcome::from_errors(errors)
}
