mod common;

use std::sync::Arc;

use async_trait::async_trait;
use mockall::predicate::eq;
use serde_json::json;
use uuid::Uuid;

use common::{shipping_address, TestApp, TestGateway, TEST_GATEWAY};
use shopfront_api::{
    entities::order::OrderStatus,
    errors::ServiceError,
    events,
    services::{
        carts::CartProvider,
        checkout::{CheckoutRequest, CheckoutService},
        order_lifecycle::OrderLifecycle,
        payments::GatewayRegistry,
        stock_ledger::StockLedger,
        validation::{CartLine, ShippingAddress},
    },
};

#[tokio::test]
async fn cart_lines_accumulate_and_clear() {
    let app = TestApp::new().await;
    let cart = &app.state.cart;
    let user = Uuid::new_v4();
    let product_a = app.seed_product(10, 1_000).await;
    let product_b = app.seed_product(10, 2_000).await;

    cart.add_item(user, product_a, 1).await.unwrap();
    cart.add_item(user, product_a, 2).await.unwrap();
    cart.add_item(user, product_b, 1).await.unwrap();

    let lines = cart.lines_for_user(user).await.unwrap();
    assert_eq!(lines.len(), 2);
    let line_a = lines.iter().find(|l| l.product_id == product_a).unwrap();
    assert_eq!(line_a.quantity, 3);

    cart.remove_item(user, product_b).await.unwrap();
    assert_eq!(cart.lines_for_user(user).await.unwrap().len(), 1);

    cart.clear(user).await.unwrap();
    assert!(cart.lines_for_user(user).await.unwrap().is_empty());
}

#[tokio::test]
async fn cart_rejects_non_positive_quantities() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let product = app.seed_product(10, 1_000).await;

    let err = app.state.cart.add_item(user, product, 0).await.unwrap_err();
    assert!(matches!(err, ServiceError::Validation { .. }));
}

#[tokio::test]
async fn checkout_without_explicit_items_consumes_the_stored_cart() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let product = app.seed_product(10, 2_500).await;
    app.state.cart.add_item(user, product, 2).await.unwrap();

    let (status, body) = app
        .post_json(
            "/api/v1/checkout",
            json!({
                "user_id": user,
                "gateway": TEST_GATEWAY,
                "shipping_address": shipping_address(),
            }),
        )
        .await;

    assert_eq!(status, axum::http::StatusCode::CREATED, "{body}");
    assert_eq!(body["data"]["total_amount_minor"], 5_000);
    assert_eq!(app.product_stock(product).await, 8);

    // The cart survives initiation; an abandoned payment must not lose it.
    assert_eq!(app.state.cart.lines_for_user(user).await.unwrap().len(), 1);

    // Once the payment settles to paid, the cart is consumed.
    let order_id = body["data"]["order_id"].as_str().unwrap();
    let (status, _) = app
        .post_json(
            &format!("/api/v1/checkout/{order_id}/verify"),
            json!({ "result": "success" }),
        )
        .await;
    assert_eq!(status, axum::http::StatusCode::OK);
    assert!(app
        .state
        .cart
        .lines_for_user(user)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn paid_settlement_clears_the_stored_cart_even_with_explicit_items() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let product = app.seed_product(10, 2_500).await;
    app.state.cart.add_item(user, product, 1).await.unwrap();

    let (status, body) = app
        .post_json(
            "/api/v1/checkout",
            json!({
                "user_id": user,
                "items": [{ "product_id": product, "quantity": 1 }],
                "gateway": TEST_GATEWAY,
                "shipping_address": shipping_address(),
            }),
        )
        .await;
    assert_eq!(status, axum::http::StatusCode::CREATED, "{body}");
    let order_id = body["data"]["order_id"].as_str().unwrap().to_string();

    let (status, _) = app
        .post_json(
            &format!("/api/v1/checkout/{order_id}/verify"),
            json!({ "result": "success" }),
        )
        .await;
    assert_eq!(status, axum::http::StatusCode::OK);
    assert!(app
        .state
        .cart
        .lines_for_user(user)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn failed_settlement_keeps_the_stored_cart() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let product = app.seed_product(10, 2_500).await;
    app.state.cart.add_item(user, product, 2).await.unwrap();

    let (status, body) = app
        .post_json(
            "/api/v1/checkout",
            json!({
                "user_id": user,
                "gateway": TEST_GATEWAY,
                "shipping_address": shipping_address(),
            }),
        )
        .await;
    assert_eq!(status, axum::http::StatusCode::CREATED, "{body}");
    let order_id = body["data"]["order_id"].as_str().unwrap().to_string();

    let (status, body) = app
        .post_json(
            &format!("/api/v1/checkout/{order_id}/verify"),
            json!({ "result": "failure" }),
        )
        .await;
    assert_eq!(status, axum::http::StatusCode::OK, "{body}");
    assert_eq!(body["data"]["status"], "failed");

    // The shopper can retry from the same cart.
    assert_eq!(app.state.cart.lines_for_user(user).await.unwrap().len(), 1);
}

mockall::mock! {
    Cart {}

    #[async_trait]
    impl CartProvider for Cart {
        async fn lines_for_user(&self, user_id: Uuid) -> Result<Vec<CartLine>, ServiceError>;
        async fn clear(&self, user_id: Uuid) -> Result<(), ServiceError>;
    }
}

#[tokio::test]
async fn payment_settles_even_when_the_cart_clear_fails() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let product = app.seed_product(10, 2_500).await;

    let mut cart = MockCart::new();
    cart.expect_lines_for_user()
        .with(eq(user))
        .returning(move |_| {
            Ok(vec![CartLine {
                product_id: product,
                quantity: 1,
            }])
        });
    cart.expect_clear()
        .with(eq(user))
        .times(1)
        .returning(|_| Err(ServiceError::InternalError("cart store down".into())));

    let (event_sender, _rx) = events::channel();
    let ledger = StockLedger::new(app.db.clone(), event_sender.clone(), 5);
    let lifecycle = OrderLifecycle::new(app.db.clone(), event_sender.clone(), ledger.clone());
    let mut registry = GatewayRegistry::new();
    registry.register(Arc::new(TestGateway::new()));

    let checkout = CheckoutService::new(
        app.db.clone(),
        ledger,
        lifecycle,
        registry,
        Arc::new(cart),
        event_sender,
        "INR".to_string(),
        10,
    );

    let address: ShippingAddress = serde_json::from_value(shipping_address()).unwrap();
    let response = checkout
        .initiate_checkout(CheckoutRequest {
            user_id: user,
            items: None,
            gateway: TEST_GATEWAY.to_string(),
            shipping_address: address,
        })
        .await
        .unwrap();
    assert_eq!(response.status, OrderStatus::Pending);
    assert_eq!(app.product_stock(product).await, 9);

    // The failed clear is logged, not propagated; the order is still paid.
    let verified = checkout
        .verify_payment(response.order_id, &json!({ "result": "success" }))
        .await
        .unwrap();
    assert_eq!(verified.status, OrderStatus::Paid);
}
