use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{instrument, warn};

use crate::{
    config::GatewayCredentials,
    errors::ServiceError,
    services::payments::{
        PaymentContext, PaymentGateway, PaymentRequest, PaymentStatus, RefundContext,
        VerificationOutcome, WebhookNotice,
    },
};

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_BASE_URL: &str = "https://api.razorpay.com/v1";
pub const REF_ORDER_ID: &str = "razorpay_order_id";
pub const REF_PAYMENT_ID: &str = "razorpay_payment_id";

/// Razorpay hosted-checkout gateway: orders are opened through the Orders
/// API and callback payloads are trusted via the documented
/// `order_id|payment_id` HMAC-SHA256 signature.
#[derive(Clone)]
pub struct RazorpayGateway {
    client: reqwest::Client,
    key_id: String,
    key_secret: String,
    webhook_secret: String,
    base_url: String,
    checkout_url: String,
}

#[derive(Debug, Deserialize)]
struct RazorpayOrder {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct RazorpayOrderList {
    items: Vec<RazorpayOrder>,
}

impl RazorpayGateway {
    pub fn new(creds: &GatewayCredentials) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            key_id: creds.key_id.clone(),
            key_secret: creds.key_secret.clone(),
            webhook_secret: creds.webhook_secret().to_string(),
            base_url: creds
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            checkout_url: creds
                .callback_url
                .clone()
                .unwrap_or_else(|| "https://checkout.razorpay.com/v1/checkout".to_string()),
        }
    }

    fn signature_matches(key: &str, message: &[u8], signature_hex: &str) -> bool {
        let Ok(signature) = hex::decode(signature_hex) else {
            return false;
        };
        let mut mac = match HmacSha256::new_from_slice(key.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return false,
        };
        mac.update(message);
        mac.verify_slice(&signature).is_ok()
    }

    fn map_order_status(status: &str) -> PaymentStatus {
        match status {
            "paid" => PaymentStatus::Success,
            "attempted" => PaymentStatus::Pending,
            _ => PaymentStatus::Created,
        }
    }
}

#[async_trait]
impl PaymentGateway for RazorpayGateway {
    fn name(&self) -> &'static str {
        "razorpay"
    }

    fn is_configured(&self) -> bool {
        !self.key_id.is_empty() && !self.key_secret.is_empty()
    }

    fn payment_ref_key(&self) -> &'static str {
        REF_PAYMENT_ID
    }

    fn signature_header(&self) -> &'static str {
        "X-Razorpay-Signature"
    }

    fn required_payment_fields(&self) -> &'static [&'static str] {
        &[REF_ORDER_ID, REF_PAYMENT_ID, "razorpay_signature"]
    }

    fn frontend_config(&self) -> Option<Value> {
        Some(json!({ "key_id": self.key_id }))
    }

    #[instrument(skip(self, ctx), fields(receipt = %ctx.receipt))]
    async fn create_payment_request(
        &self,
        ctx: &PaymentContext,
    ) -> Result<PaymentRequest, ServiceError> {
        let body = json!({
            "amount": ctx.amount_minor,
            "currency": ctx.currency,
            "receipt": ctx.receipt,
            "payment_capture": 1,
            "notes": { "order_id": ctx.order_id.to_string() }
        });

        let response = self
            .client
            .post(format!("{}/orders", self.base_url))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .json(&body)
            .send()
            .await
            .map_err(|e| ServiceError::GatewayCall(format!("razorpay order create: {e}")))?;

        if !response.status().is_success() {
            return Err(ServiceError::GatewayCall(format!(
                "razorpay order create returned {}",
                response.status()
            )));
        }

        let order: RazorpayOrder = response
            .json()
            .await
            .map_err(|e| ServiceError::GatewayCall(format!("razorpay order decode: {e}")))?;

        let mut refs = HashMap::new();
        refs.insert(REF_ORDER_ID.to_string(), order.id.clone());

        Ok(PaymentRequest {
            payment_url: format!("{}?order_id={}", self.checkout_url, order.id),
            provider_txn_id: order.id,
            refs,
        })
    }

    /// Signature-based trust of the checkout callback payload: the
    /// documented HMAC over `order_id|payment_id` with the key secret.
    async fn verify_payment(&self, payload: &Value) -> Result<VerificationOutcome, ServiceError> {
        let order_id = payload
            .get(REF_ORDER_ID)
            .and_then(Value::as_str)
            .unwrap_or_default();
        let payment_id = payload
            .get(REF_PAYMENT_ID)
            .and_then(Value::as_str)
            .unwrap_or_default();
        let signature = payload
            .get("razorpay_signature")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let message = format!("{order_id}|{payment_id}");
        let verified =
            Self::signature_matches(&self.key_secret, message.as_bytes(), signature);

        if !verified {
            warn!(order_id = %order_id, "Razorpay payment signature mismatch");
        }

        Ok(VerificationOutcome {
            success: verified,
            verified,
            provider_txn_id: Some(payment_id.to_string()),
            amount_minor: None,
            message: if verified {
                "payment signature verified".to_string()
            } else {
                "payment signature mismatch".to_string()
            },
        })
    }

    async fn check_payment_status(&self, receipt: &str) -> Result<PaymentStatus, ServiceError> {
        let response = self
            .client
            .get(format!("{}/orders", self.base_url))
            .query(&[("receipt", receipt), ("count", "1")])
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .send()
            .await
            .map_err(|e| ServiceError::GatewayCall(format!("razorpay status: {e}")))?;

        if !response.status().is_success() {
            return Err(ServiceError::GatewayCall(format!(
                "razorpay status returned {}",
                response.status()
            )));
        }

        let list: RazorpayOrderList = response
            .json()
            .await
            .map_err(|e| ServiceError::GatewayCall(format!("razorpay status decode: {e}")))?;

        let order = list.items.into_iter().next().ok_or_else(|| {
            ServiceError::GatewayCall(format!("razorpay has no order for receipt {receipt}"))
        })?;

        Ok(Self::map_order_status(&order.status))
    }

    fn verify_webhook_signature(&self, raw_payload: &[u8], signature: Option<&str>) -> bool {
        match signature {
            Some(sig) if !sig.is_empty() => {
                Self::signature_matches(&self.webhook_secret, raw_payload, sig)
            }
            _ => false,
        }
    }

    fn parse_webhook(&self, payload: &Value) -> Result<WebhookNotice, ServiceError> {
        let event = payload
            .get("event")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let entity = &payload["payload"]["payment"]["entity"];
        let receipt = payload["payload"]["order"]["entity"]["receipt"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                ServiceError::validation("Razorpay webhook payload carries no order receipt")
            })?;

        let success = matches!(event, "order.paid" | "payment.captured");

        Ok(WebhookNotice {
            receipt,
            outcome: VerificationOutcome {
                success,
                // The webhook signature was checked before parsing.
                verified: true,
                provider_txn_id: entity.get("id").and_then(Value::as_str).map(str::to_string),
                amount_minor: entity.get("amount").and_then(Value::as_i64),
                message: format!("razorpay webhook event '{event}'"),
            },
        })
    }

    async fn initiate_refund(&self, ctx: &RefundContext) -> Result<(), ServiceError> {
        let response = self
            .client
            .post(format!(
                "{}/payments/{}/refund",
                self.base_url, ctx.provider_txn_id
            ))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .json(&json!({ "amount": ctx.amount_minor }))
            .send()
            .await
            .map_err(|e| ServiceError::GatewayCall(format!("razorpay refund: {e}")))?;

        if !response.status().is_success() {
            return Err(ServiceError::GatewayCall(format!(
                "razorpay refund returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}
