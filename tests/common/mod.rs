#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use shopfront_api::{
    config::AppConfig,
    create_router, db,
    entities::{order, product},
    errors::ServiceError,
    events,
    services::payments::{
        GatewayRegistry, PaymentContext, PaymentGateway, PaymentRequest, PaymentStatus,
        RefundContext, VerificationOutcome, WebhookNotice,
    },
    AppState,
};

pub const TEST_GATEWAY: &str = "testpay";
pub const TEST_SIGNATURE: &str = "valid-signature";

/// In-process gateway double. Behaviour is adjustable after registration
/// through the shared control block.
#[derive(Clone)]
pub struct TestGateway {
    pub control: Arc<GatewayControl>,
}

pub struct GatewayControl {
    pub fail_create: AtomicBool,
    pub poll_status: Mutex<PaymentStatus>,
    /// Number of `verify_payment` round trips made against the provider.
    pub verify_calls: AtomicUsize,
}

impl TestGateway {
    pub fn new() -> Self {
        Self {
            control: Arc::new(GatewayControl {
                fail_create: AtomicBool::new(false),
                poll_status: Mutex::new(PaymentStatus::Pending),
                verify_calls: AtomicUsize::new(0),
            }),
        }
    }
}

#[async_trait]
impl PaymentGateway for TestGateway {
    fn name(&self) -> &'static str {
        TEST_GATEWAY
    }

    fn is_configured(&self) -> bool {
        true
    }

    fn payment_ref_key(&self) -> &'static str {
        "testpay_payment_id"
    }

    fn signature_header(&self) -> &'static str {
        "X-Test-Signature"
    }

    fn required_payment_fields(&self) -> &'static [&'static str] {
        &["result"]
    }

    async fn create_payment_request(
        &self,
        ctx: &PaymentContext,
    ) -> Result<PaymentRequest, ServiceError> {
        if self.control.fail_create.load(Ordering::SeqCst) {
            return Err(ServiceError::GatewayCall(
                "testpay is refusing payment sessions".to_string(),
            ));
        }
        let provider_txn_id = format!("TESTPAY-{}", ctx.receipt);
        Ok(PaymentRequest {
            payment_url: format!("https://pay.test/session/{}", ctx.receipt),
            provider_txn_id: provider_txn_id.clone(),
            refs: [("testpay_order_id".to_string(), provider_txn_id)]
                .into_iter()
                .collect(),
        })
    }

    async fn verify_payment(&self, payload: &Value) -> Result<VerificationOutcome, ServiceError> {
        self.control.verify_calls.fetch_add(1, Ordering::SeqCst);
        let success = payload.get("result").and_then(Value::as_str) == Some("success");
        Ok(VerificationOutcome {
            success,
            verified: true,
            provider_txn_id: Some("pay_test_1".to_string()),
            amount_minor: None,
            message: format!("testpay result {success}"),
        })
    }

    async fn check_payment_status(&self, _receipt: &str) -> Result<PaymentStatus, ServiceError> {
        Ok(*self.control.poll_status.lock().unwrap())
    }

    fn verify_webhook_signature(&self, _raw_payload: &[u8], signature: Option<&str>) -> bool {
        signature == Some(TEST_SIGNATURE)
    }

    fn parse_webhook(&self, payload: &Value) -> Result<WebhookNotice, ServiceError> {
        let receipt = payload
            .get("receipt")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::validation("testpay webhook without receipt"))?
            .to_string();
        let success = payload.get("result").and_then(Value::as_str) == Some("success");
        Ok(WebhookNotice {
            receipt,
            outcome: VerificationOutcome {
                success,
                verified: true,
                provider_txn_id: Some("pay_test_hook".to_string()),
                amount_minor: payload.get("amount").and_then(Value::as_i64),
                message: "testpay webhook".to_string(),
            },
        })
    }

    async fn initiate_refund(&self, _ctx: &RefundContext) -> Result<(), ServiceError> {
        Ok(())
    }
}

/// Application harness over a fresh file-backed SQLite database.
pub struct TestApp {
    pub state: Arc<AppState>,
    pub db: Arc<DatabaseConnection>,
    pub gateway: TestGateway,
    router: Router,
    _db_file: tempfile::NamedTempFile,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        let db_file = tempfile::NamedTempFile::new().expect("temp db file");
        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_file.path().display()),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db_arc = Arc::new(pool);
        let (event_sender, event_rx) = events::channel();
        let event_task = tokio::spawn(events::process_events(event_rx));

        let gateway = TestGateway::new();
        let mut registry = GatewayRegistry::new();
        registry.register(Arc::new(gateway.clone()));

        let state = AppState::build(db_arc.clone(), cfg, registry, event_sender);
        let router = create_router(state.clone());

        Self {
            state,
            db: db_arc,
            gateway,
            router,
            _db_file: db_file,
            _event_task: event_task,
        }
    }

    /// Inserts a product and returns its id.
    pub async fn seed_product(&self, stock: i32, price_minor: i64) -> Uuid {
        let id = Uuid::new_v4();
        let row = product::ActiveModel {
            id: Set(id),
            name: Set(format!("Product {id}")),
            description: Set("test product".to_string()),
            stock: Set(stock),
            price_minor: Set(price_minor),
            sale_price_minor: Set(None),
            created_at: Set(Utc::now()),
            updated_at: Set(None),
        };
        row.insert(&*self.db).await.expect("seed product");
        id
    }

    pub async fn product_stock(&self, product_id: Uuid) -> i32 {
        product::Entity::find_by_id(product_id)
            .one(&*self.db)
            .await
            .expect("load product")
            .expect("product exists")
            .stock
    }

    pub async fn order(&self, order_id: Uuid) -> order::Model {
        order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await
            .expect("load order")
            .expect("order exists")
    }

    pub async fn post_json(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request");
        self.send(request).await
    }

    pub async fn post_raw(
        &self,
        path: &str,
        body: Vec<u8>,
        headers: &[(&str, &str)],
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder.body(Body::from(body)).expect("request");
        self.send(request).await
    }

    pub async fn get(&self, path: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("GET")
            .uri(path)
            .body(Body::empty())
            .expect("request");
        self.send(request).await
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let value = if bytes.is_empty() {
            json!(null)
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| json!(null))
        };
        (status, value)
    }

    /// Runs a checkout for one product line and returns `(order_id, receipt)`.
    pub async fn checkout_one(&self, product_id: Uuid, quantity: i32) -> (Uuid, String) {
        let (status, body) = self
            .post_json(
                "/api/v1/checkout",
                json!({
                    "user_id": Uuid::new_v4(),
                    "items": [{ "product_id": product_id, "quantity": quantity }],
                    "gateway": TEST_GATEWAY,
                    "shipping_address": shipping_address(),
                }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "checkout failed: {body}");
        let data = &body["data"];
        (
            data["order_id"].as_str().unwrap().parse().unwrap(),
            data["receipt"].as_str().unwrap().to_string(),
        )
    }
}

pub fn shipping_address() -> Value {
    json!({
        "name": "Asha Rao",
        "email": "asha@example.com",
        "phone": "+919876543210",
        "line1": "12 MG Road",
        "city": "Bengaluru",
        "state": "KA",
        "postal_code": "560001",
        "country": "IN"
    })
}
