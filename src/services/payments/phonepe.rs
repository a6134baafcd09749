use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{instrument, warn};

use crate::{
    config::GatewayCredentials,
    errors::ServiceError,
    services::payments::{
        PaymentContext, PaymentGateway, PaymentRequest, PaymentStatus, VerificationOutcome,
        WebhookNotice,
    },
};

const DEFAULT_BASE_URL: &str = "https://api.phonepe.com/apis/hermes";
const PAY_PATH: &str = "/pg/v1/pay";
const SALT_INDEX: &str = "1";
pub const REF_TRANSACTION_ID: &str = "phonepe_transaction_id";

/// PhonePe pay-page gateway. Every call and callback is authenticated with
/// the X-VERIFY checksum: `sha256(payload + path + salt_key) + "###" + index`
/// over the base64-encoded request body (path omitted for webhooks).
#[derive(Clone)]
pub struct PhonepeGateway {
    client: reqwest::Client,
    merchant_id: String,
    salt_key: String,
    base_url: String,
    callback_url: String,
}

#[derive(Debug, Deserialize)]
struct PhonepeEnvelope {
    success: bool,
    #[serde(default)]
    code: String,
    #[serde(default)]
    data: Value,
}

impl PhonepeGateway {
    pub fn new(creds: &GatewayCredentials) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            merchant_id: creds.key_id.clone(),
            salt_key: creds.key_secret.clone(),
            base_url: creds
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            callback_url: creds.callback_url.clone().unwrap_or_default(),
        }
    }

    fn checksum(&self, message: &str) -> String {
        let digest = Sha256::digest(format!("{message}{}", self.salt_key).as_bytes());
        format!("{}###{SALT_INDEX}", hex::encode(digest))
    }

    fn map_code(code: &str) -> PaymentStatus {
        match code {
            "PAYMENT_SUCCESS" => PaymentStatus::Success,
            "PAYMENT_PENDING" => PaymentStatus::Pending,
            "PAYMENT_INITIATED" => PaymentStatus::Created,
            _ => PaymentStatus::Failed,
        }
    }

    fn outcome_from_status(
        status: PaymentStatus,
        provider_txn_id: Option<String>,
        amount_minor: Option<i64>,
        code: &str,
    ) -> VerificationOutcome {
        VerificationOutcome {
            success: status == PaymentStatus::Success,
            verified: true,
            provider_txn_id,
            amount_minor,
            message: format!("phonepe reported '{code}'"),
        }
    }
}

#[async_trait]
impl PaymentGateway for PhonepeGateway {
    fn name(&self) -> &'static str {
        "phonepe"
    }

    fn is_configured(&self) -> bool {
        !self.merchant_id.is_empty() && !self.salt_key.is_empty()
    }

    fn payment_ref_key(&self) -> &'static str {
        REF_TRANSACTION_ID
    }

    fn signature_header(&self) -> &'static str {
        "X-VERIFY"
    }

    fn required_payment_fields(&self) -> &'static [&'static str] {
        &["merchantTransactionId"]
    }

    #[instrument(skip(self, ctx), fields(receipt = %ctx.receipt))]
    async fn create_payment_request(
        &self,
        ctx: &PaymentContext,
    ) -> Result<PaymentRequest, ServiceError> {
        let body = json!({
            "merchantId": self.merchant_id,
            "merchantTransactionId": ctx.receipt,
            "merchantUserId": ctx.order_id.to_string(),
            "amount": ctx.amount_minor,
            "redirectUrl": self.callback_url,
            "redirectMode": "REDIRECT",
            "callbackUrl": self.callback_url,
            "mobileNumber": ctx.customer_phone,
            "paymentInstrument": { "type": "PAY_PAGE" }
        });
        let encoded = BASE64.encode(body.to_string());

        let response = self
            .client
            .post(format!("{}{PAY_PATH}", self.base_url))
            .header("X-VERIFY", self.checksum(&format!("{encoded}{PAY_PATH}")))
            .json(&json!({ "request": encoded }))
            .send()
            .await
            .map_err(|e| ServiceError::GatewayCall(format!("phonepe pay: {e}")))?;

        if !response.status().is_success() {
            return Err(ServiceError::GatewayCall(format!(
                "phonepe pay returned {}",
                response.status()
            )));
        }

        let envelope: PhonepeEnvelope = response
            .json()
            .await
            .map_err(|e| ServiceError::GatewayCall(format!("phonepe pay decode: {e}")))?;

        if !envelope.success {
            return Err(ServiceError::GatewayCall(format!(
                "phonepe rejected the payment request: {}",
                envelope.code
            )));
        }

        let payment_url = envelope.data["instrumentResponse"]["redirectInfo"]["url"]
            .as_str()
            .ok_or_else(|| {
                ServiceError::GatewayCall("phonepe pay response carries no redirect url".into())
            })?
            .to_string();
        let provider_txn_id = envelope.data["transactionId"]
            .as_str()
            .unwrap_or(&ctx.receipt)
            .to_string();

        let mut refs = HashMap::new();
        refs.insert(REF_TRANSACTION_ID.to_string(), provider_txn_id.clone());

        Ok(PaymentRequest {
            payment_url,
            provider_txn_id,
            refs,
        })
    }

    /// PhonePe callbacks carry no client-verifiable signature, so
    /// verification is a fresh server-to-server status query for the
    /// merchant transaction id named in the payload. A still-pending
    /// payment is reported as a gateway error so the order stays pending
    /// and the client can retry.
    async fn verify_payment(&self, payload: &Value) -> Result<VerificationOutcome, ServiceError> {
        let receipt = payload
            .get("merchantTransactionId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ServiceError::validation("PhonePe verification payload carries no merchantTransactionId")
            })?;

        let (status, envelope) = self.query_status(receipt).await?;
        if matches!(status, PaymentStatus::Created | PaymentStatus::Pending) {
            return Err(ServiceError::GatewayCall(format!(
                "phonepe payment for {receipt} is not final yet"
            )));
        }

        Ok(Self::outcome_from_status(
            status,
            envelope.data["transactionId"].as_str().map(str::to_string),
            envelope.data["amount"].as_i64(),
            &envelope.code,
        ))
    }

    async fn check_payment_status(&self, receipt: &str) -> Result<PaymentStatus, ServiceError> {
        let (status, _) = self.query_status(receipt).await?;
        Ok(status)
    }

    /// The webhook body is `{"response": "<base64>"}` and X-VERIFY covers
    /// the base64 string itself, so the envelope has to be opened to reach
    /// the signed material. The inner payload stays untrusted until the
    /// checksum matches.
    fn verify_webhook_signature(&self, raw_payload: &[u8], signature: Option<&str>) -> bool {
        let Some(signature) = signature.filter(|s| !s.is_empty()) else {
            return false;
        };
        let Ok(body) = serde_json::from_slice::<Value>(raw_payload) else {
            return false;
        };
        let Some(encoded) = body.get("response").and_then(Value::as_str) else {
            return false;
        };
        self.checksum(encoded) == signature
    }

    fn parse_webhook(&self, payload: &Value) -> Result<WebhookNotice, ServiceError> {
        let encoded = payload
            .get("response")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ServiceError::validation("PhonePe webhook carries no response envelope")
            })?;
        let decoded = BASE64.decode(encoded).map_err(|e| {
            ServiceError::validation(format!("PhonePe webhook envelope is not base64: {e}"))
        })?;
        let inner: Value = serde_json::from_slice(&decoded).map_err(|e| {
            ServiceError::validation(format!("PhonePe webhook envelope is not JSON: {e}"))
        })?;

        let receipt = inner["data"]["merchantTransactionId"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                ServiceError::validation("PhonePe webhook carries no merchantTransactionId")
            })?;
        let code = inner["code"].as_str().unwrap_or_default();
        let status = Self::map_code(code);

        if matches!(status, PaymentStatus::Created | PaymentStatus::Pending) {
            warn!(receipt = %receipt, code, "Ignoring non-final PhonePe webhook");
            return Err(ServiceError::validation(format!(
                "PhonePe webhook for {receipt} is not final"
            )));
        }

        Ok(WebhookNotice {
            receipt,
            outcome: Self::outcome_from_status(
                status,
                inner["data"]["transactionId"].as_str().map(str::to_string),
                inner["data"]["amount"].as_i64(),
                code,
            ),
        })
    }
}

impl PhonepeGateway {
    async fn query_status(
        &self,
        receipt: &str,
    ) -> Result<(PaymentStatus, PhonepeEnvelope), ServiceError> {
        let path = format!("/pg/v1/status/{}/{receipt}", self.merchant_id);
        let response = self
            .client
            .get(format!("{}{path}", self.base_url))
            .header("X-VERIFY", self.checksum(&path))
            .header("X-MERCHANT-ID", &self.merchant_id)
            .send()
            .await
            .map_err(|e| ServiceError::GatewayCall(format!("phonepe status: {e}")))?;

        if !response.status().is_success() {
            return Err(ServiceError::GatewayCall(format!(
                "phonepe status returned {}",
                response.status()
            )));
        }

        let envelope: PhonepeEnvelope = response
            .json()
            .await
            .map_err(|e| ServiceError::GatewayCall(format!("phonepe status decode: {e}")))?;

        Ok((Self::map_code(&envelope.code), envelope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> PhonepeGateway {
        PhonepeGateway::new(&GatewayCredentials {
            key_id: "MERCHANT1".into(),
            key_secret: "salt-key".into(),
            webhook_secret: None,
            base_url: None,
            callback_url: Some("https://shop.example/payments/return".into()),
        })
    }

    fn signed_webhook(gw: &PhonepeGateway, inner: Value) -> (Vec<u8>, String) {
        let encoded = BASE64.encode(inner.to_string());
        let signature = gw.checksum(&encoded);
        let body = json!({ "response": encoded }).to_string().into_bytes();
        (body, signature)
    }

    #[test]
    fn webhook_signature_round_trip() {
        let gw = gateway();
        let inner = json!({
            "code": "PAYMENT_SUCCESS",
            "data": { "merchantTransactionId": "RCPT-1", "transactionId": "T1", "amount": 50000 }
        });
        let (body, signature) = signed_webhook(&gw, inner);

        assert!(gw.verify_webhook_signature(&body, Some(&signature)));
        assert!(!gw.verify_webhook_signature(&body, Some("bad###1")));
        assert!(!gw.verify_webhook_signature(&body, None));
    }

    #[test]
    fn parse_webhook_maps_success_and_failure() {
        let gw = gateway();
        let ok = json!({
            "response": BASE64.encode(
                json!({
                    "code": "PAYMENT_SUCCESS",
                    "data": { "merchantTransactionId": "RCPT-1", "transactionId": "T1", "amount": 50000 }
                })
                .to_string()
            )
        });
        let notice = gw.parse_webhook(&ok).unwrap();
        assert_eq!(notice.receipt, "RCPT-1");
        assert!(notice.outcome.success);
        assert_eq!(notice.outcome.amount_minor, Some(50000));

        let failed = json!({
            "response": BASE64.encode(
                json!({
                    "code": "PAYMENT_ERROR",
                    "data": { "merchantTransactionId": "RCPT-2" }
                })
                .to_string()
            )
        });
        let notice = gw.parse_webhook(&failed).unwrap();
        assert!(!notice.outcome.success);
        assert!(notice.outcome.verified);
    }

    #[test]
    fn parse_webhook_rejects_non_final_codes() {
        let gw = gateway();
        let pending = json!({
            "response": BASE64.encode(
                json!({
                    "code": "PAYMENT_PENDING",
                    "data": { "merchantTransactionId": "RCPT-3" }
                })
                .to_string()
            )
        });
        assert!(gw.parse_webhook(&pending).is_err());
    }

    #[test]
    fn status_codes_map_to_canonical_statuses() {
        assert_eq!(
            PhonepeGateway::map_code("PAYMENT_SUCCESS"),
            PaymentStatus::Success
        );
        assert_eq!(
            PhonepeGateway::map_code("PAYMENT_PENDING"),
            PaymentStatus::Pending
        );
        assert_eq!(
            PhonepeGateway::map_code("PAYMENT_ERROR"),
            PaymentStatus::Failed
        );
        assert_eq!(
            PhonepeGateway::map_code("PAYMENT_DECLINED"),
            PaymentStatus::Failed
        );
    }

    #[test]
    fn checksum_has_salt_index_suffix() {
        let gw = gateway();
        let sum = gw.checksum("payload/pg/v1/pay");
        assert!(sum.ends_with("###1"));
        assert_eq!(sum.len(), 64 + 4);
    }
}
