mod common;

use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use uuid::Uuid;

use common::TestApp;
use shopfront_api::entities::stock_movement;
use shopfront_api::services::stock_ledger::StockLedger;

/// 20 competitors race for 10 units; the conditional decrement must hand
/// out exactly 10 reservations and the stock must land at exactly zero.
#[tokio::test]
async fn concurrent_reservations_never_oversell() {
    let app = TestApp::new().await;
    let product = app.seed_product(10, 1_000).await;

    let ledger = StockLedger::new(
        app.db.clone(),
        shopfront_api::events::channel().0,
        5,
    );

    let mut tasks = Vec::new();
    for _ in 0..20 {
        let ledger = ledger.clone();
        let db = app.db.clone();
        tasks.push(tokio::spawn(async move {
            ledger
                .try_reserve(&*db, product, 1, Uuid::new_v4())
                .await
                .map(|r| r.ok)
                .unwrap_or(false)
        }));
    }

    let mut successes = 0;
    for task in tasks {
        if task.await.unwrap_or(false) {
            successes += 1;
        }
    }

    assert_eq!(
        successes, 10,
        "exactly 10 of 20 reservations should win; got {successes}"
    );
    assert_eq!(app.product_stock(product).await, 0);

    // One ledger entry per successful reservation, each for -1.
    let movements = stock_movement::Entity::find()
        .filter(stock_movement::Column::ProductId.eq(product))
        .all(&*app.db)
        .await
        .unwrap();
    assert_eq!(movements.len(), 10);
    assert!(movements.iter().all(|m| m.delta == -1));
}

/// A losing reservation must leave no trace: no decrement, no movement.
#[tokio::test]
async fn failed_reservation_has_no_side_effects() {
    let app = TestApp::new().await;
    let product = app.seed_product(3, 1_000).await;

    let ledger = StockLedger::new(app.db.clone(), shopfront_api::events::channel().0, 5);

    let reservation = ledger
        .try_reserve(&*app.db, product, 5, Uuid::new_v4())
        .await
        .unwrap();

    assert!(!reservation.ok);
    assert_eq!(reservation.available, 3);
    assert_eq!(app.product_stock(product).await, 3);

    let movements = stock_movement::Entity::find()
        .filter(stock_movement::Column::ProductId.eq(product))
        .all(&*app.db)
        .await
        .unwrap();
    assert!(movements.is_empty());
}

#[tokio::test]
async fn restore_adds_stock_back_with_a_release_movement() {
    let app = TestApp::new().await;
    let product = app.seed_product(10, 1_000).await;
    let order_id = Uuid::new_v4();

    let ledger = StockLedger::new(app.db.clone(), shopfront_api::events::channel().0, 5);

    let reservation = ledger
        .try_reserve(&*app.db, product, 4, order_id)
        .await
        .unwrap();
    assert!(reservation.ok);
    assert_eq!(app.product_stock(product).await, 6);

    ledger
        .restore(&*app.db, product, 4, Some(order_id))
        .await
        .unwrap();
    assert_eq!(app.product_stock(product).await, 10);

    let movements = stock_movement::Entity::find()
        .filter(stock_movement::Column::ProductId.eq(product))
        .all(&*app.db)
        .await
        .unwrap();
    assert_eq!(movements.len(), 2);
    assert!(movements.iter().any(|m| m.delta == 4));
}

#[tokio::test]
async fn manual_adjustment_refuses_to_go_negative() {
    let app = TestApp::new().await;
    let product = app.seed_product(2, 1_000).await;

    let ledger = StockLedger::new(app.db.clone(), shopfront_api::events::channel().0, 5);

    assert!(ledger.adjust(product, -5).await.is_err());
    assert_eq!(app.product_stock(product).await, 2);

    let new_level = ledger.adjust(product, 8).await.unwrap();
    assert_eq!(new_level, 10);
}
