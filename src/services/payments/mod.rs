use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::{entities::order::OrderStatus, errors::ServiceError};

pub mod phonepe;
pub mod razorpay;

pub use phonepe::PhonepeGateway;
pub use razorpay::RazorpayGateway;

/// Everything a gateway needs to open a hosted-payment session.
#[derive(Debug, Clone)]
pub struct PaymentContext {
    pub order_id: Uuid,
    /// Merchant transaction identifier, unique per checkout attempt.
    pub receipt: String,
    pub amount_minor: i64,
    pub currency: String,
    pub customer_email: String,
    pub customer_phone: String,
}

/// Result of opening a hosted-payment session.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentRequest {
    pub payment_url: String,
    pub provider_txn_id: String,
    /// Provider correlation identifiers to persist on the order,
    /// keyed by the documented per-provider key set.
    pub refs: HashMap<String, String>,
}

/// Canonical result of confirming a payment event against a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub success: bool,
    pub verified: bool,
    pub provider_txn_id: Option<String>,
    pub amount_minor: Option<i64>,
    pub message: String,
}

/// Idempotent polling status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Created,
    Pending,
    Success,
    Failed,
}

/// Refund request context.
#[derive(Debug, Clone)]
pub struct RefundContext {
    pub order_id: Uuid,
    pub receipt: String,
    pub provider_txn_id: String,
    pub amount_minor: i64,
}

/// A signature-verified webhook, reduced to the merchant receipt it
/// correlates to and the canonical verification outcome it carries.
#[derive(Debug, Clone)]
pub struct WebhookNotice {
    pub receipt: String,
    pub outcome: VerificationOutcome,
}

/// Uniform contract over heterogeneous payment providers. Callers treat all
/// gateways polymorphically; nothing downstream branches on gateway identity
/// beyond the correlation fields each provider returns.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_configured(&self) -> bool;

    /// `gateway_refs` key under which a confirmed payment's provider
    /// transaction id is recorded.
    fn payment_ref_key(&self) -> &'static str;

    /// HTTP header the provider signs its webhooks with.
    fn signature_header(&self) -> &'static str;

    /// Fields a client payment-confirmation payload must carry before it
    /// is handed to `verify_payment`.
    fn required_payment_fields(&self) -> &'static [&'static str] {
        &[]
    }

    /// Public configuration safe to hand to a frontend (key ids, never
    /// secrets).
    fn frontend_config(&self) -> Option<Value> {
        None
    }

    /// Initiates a hosted-payment session with the provider.
    async fn create_payment_request(
        &self,
        ctx: &PaymentContext,
    ) -> Result<PaymentRequest, ServiceError>;

    /// Confirms a payment event against the provider: either a signature
    /// check of a callback payload or a fresh status query, depending on
    /// what the provider supports.
    async fn verify_payment(&self, payload: &Value) -> Result<VerificationOutcome, ServiceError>;

    /// Idempotent status poll by merchant correlation id.
    async fn check_payment_status(&self, receipt: &str) -> Result<PaymentStatus, ServiceError>;

    /// Verifies a webhook signature over the raw payload bytes. Must be
    /// called, and must return true, before the payload is acted upon.
    /// A missing signature is always rejected regardless of content.
    fn verify_webhook_signature(&self, raw_payload: &[u8], signature: Option<&str>) -> bool;

    /// Extracts the merchant receipt and canonical outcome from an
    /// already-signature-verified webhook payload, using the provider's
    /// field names.
    fn parse_webhook(&self, payload: &Value) -> Result<WebhookNotice, ServiceError>;

    /// Optional capability; providers without refund support fail loudly
    /// instead of silently succeeding.
    async fn initiate_refund(&self, _ctx: &RefundContext) -> Result<(), ServiceError> {
        Err(ServiceError::GatewayCall(format!(
            "Gateway '{}' does not support refunds",
            self.name()
        )))
    }
}

/// Gateways constructed once at startup and injected into the orchestrator.
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    gateways: HashMap<String, Arc<dyn PaymentGateway>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, gateway: Arc<dyn PaymentGateway>) {
        self.gateways.insert(gateway.name().to_string(), gateway);
    }

    /// Resolves a configured gateway by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn PaymentGateway>, ServiceError> {
        let gateway = self
            .gateways
            .get(name)
            .ok_or_else(|| ServiceError::GatewayConfiguration(name.to_string()))?;
        if !gateway.is_configured() {
            return Err(ServiceError::GatewayConfiguration(name.to_string()));
        }
        Ok(gateway.clone())
    }

    pub fn names(&self) -> Vec<&str> {
        self.gateways.keys().map(String::as_str).collect()
    }

    /// Frontend configuration for every configured gateway.
    pub fn frontend_configs(&self) -> HashMap<String, Value> {
        self.gateways
            .iter()
            .filter(|(_, g)| g.is_configured())
            .filter_map(|(name, g)| g.frontend_config().map(|cfg| (name.clone(), cfg)))
            .collect()
    }
}

/// Translates a gateway's raw verification result into the canonical target
/// order status.
pub struct PaymentVerifier;

impl PaymentVerifier {
    /// A payment settles the order only when the provider both verified the
    /// event and reported success; anything else fails the order.
    pub fn target_status(outcome: &VerificationOutcome) -> OrderStatus {
        if outcome.verified && outcome.success {
            OrderStatus::Paid
        } else {
            OrderStatus::Failed
        }
    }

    pub fn status_from_poll(status: PaymentStatus) -> Option<OrderStatus> {
        match status {
            PaymentStatus::Success => Some(OrderStatus::Paid),
            PaymentStatus::Failed => Some(OrderStatus::Failed),
            PaymentStatus::Created | PaymentStatus::Pending => None,
        }
    }
}
