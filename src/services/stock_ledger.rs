use chrono::Utc;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, Set,
};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::{
        product::{self, Entity as ProductEntity},
        stock_movement::{self, MovementReason},
    },
    errors::ServiceError,
    events::{Event, EventSender},
};

/// Outcome of a reservation attempt.
#[derive(Debug, Clone, Copy)]
pub struct Reservation {
    pub ok: bool,
    /// Stock observed when the reservation failed (best effort; the value
    /// may already be stale by the time the caller sees it).
    pub available: i32,
}

/// Atomic read/check/decrement/restore of per-product stock.
///
/// The reservation is a single conditional UPDATE with a `stock >= quantity`
/// predicate, checked via the affected-row count. A plain read-then-write is
/// not safe under concurrent checkouts and is never used here.
#[derive(Clone)]
pub struct StockLedger {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
    low_stock_threshold: i32,
}

impl StockLedger {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: EventSender,
        low_stock_threshold: i32,
    ) -> Self {
        Self {
            db,
            event_sender,
            low_stock_threshold,
        }
    }

    /// Attempts to reserve `quantity` units of a product within the caller's
    /// transaction. Returns `ok = false` without side effects when the
    /// conditional decrement matches zero rows (stock already consumed by a
    /// concurrent reservation).
    #[instrument(skip(self, conn), fields(product_id = %product_id, quantity))]
    pub async fn try_reserve<C: ConnectionTrait>(
        &self,
        conn: &C,
        product_id: Uuid,
        quantity: i32,
        order_id: Uuid,
    ) -> Result<Reservation, ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::validation(format!(
                "Reservation quantity must be positive, got {quantity}"
            )));
        }

        let result = ProductEntity::update_many()
            .col_expr(
                product::Column::Stock,
                Expr::col(product::Column::Stock).sub(quantity),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(product::Column::Id.eq(product_id))
            .filter(product::Column::Stock.gte(quantity))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            let available = self.stock_of_on(conn, product_id).await?.unwrap_or(0);
            warn!(
                product_id = %product_id,
                requested = quantity,
                available,
                "Stock reservation failed"
            );
            return Ok(Reservation {
                ok: false,
                available,
            });
        }

        let resulting = self
            .stock_of_on(conn, product_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {product_id} not found")))?;

        self.record_movement(
            conn,
            product_id,
            -quantity,
            resulting,
            MovementReason::OrderReservation,
            Some(order_id),
        )
        .await?;

        Ok(Reservation {
            ok: true,
            available: resulting,
        })
    }

    /// Restores previously reserved stock (cancellation path). Runs within
    /// the caller's transaction so status update and restore are atomic.
    #[instrument(skip(self, conn), fields(product_id = %product_id, quantity))]
    pub async fn restore<C: ConnectionTrait>(
        &self,
        conn: &C,
        product_id: Uuid,
        quantity: i32,
        order_id: Option<Uuid>,
    ) -> Result<(), ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::validation(format!(
                "Restore quantity must be positive, got {quantity}"
            )));
        }

        let result = ProductEntity::update_many()
            .col_expr(
                product::Column::Stock,
                Expr::col(product::Column::Stock).add(quantity),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(product::Column::Id.eq(product_id))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::NotFound(format!(
                "Product {product_id} not found"
            )));
        }

        let resulting = self
            .stock_of_on(conn, product_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {product_id} not found")))?;

        self.record_movement(
            conn,
            product_id,
            quantity,
            resulting,
            MovementReason::ReservationRelease,
            order_id,
        )
        .await?;

        Ok(())
    }

    /// Manual stock adjustment (seeding, operations). Emits a low-stock
    /// alert when the result drops under the configured threshold.
    #[instrument(skip(self), fields(product_id = %product_id, delta))]
    pub async fn adjust(&self, product_id: Uuid, delta: i32) -> Result<i32, ServiceError> {
        let db = &*self.db;

        let result = ProductEntity::update_many()
            .col_expr(
                product::Column::Stock,
                Expr::col(product::Column::Stock).add(delta),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(product::Column::Id.eq(product_id))
            .filter(product::Column::Stock.gte(-delta.min(0)))
            .exec(db)
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::NotFound(format!(
                "Product {product_id} not found or adjustment would go negative"
            )));
        }

        let resulting = self
            .stock_of_on(db, product_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {product_id} not found")))?;

        self.record_movement(
            db,
            product_id,
            delta,
            resulting,
            MovementReason::ManualAdjustment,
            None,
        )
        .await?;

        if resulting < self.low_stock_threshold {
            self.event_sender
                .send(Event::LowStockAlert {
                    product_id,
                    remaining: resulting,
                })
                .await;
        }

        info!(product_id = %product_id, delta, resulting, "Stock adjusted");
        Ok(resulting)
    }

    /// Current stock for a product, read through the pool. Used as the
    /// advisory lookup for the checkout pre-check.
    pub async fn stock_of(&self, product_id: Uuid) -> Result<Option<i32>, ServiceError> {
        self.stock_of_on(&*self.db, product_id).await
    }

    async fn stock_of_on<C: ConnectionTrait>(
        &self,
        conn: &C,
        product_id: Uuid,
    ) -> Result<Option<i32>, ServiceError> {
        let product = ProductEntity::find_by_id(product_id).one(conn).await?;
        Ok(product.map(|p| p.stock))
    }

    async fn record_movement<C: ConnectionTrait>(
        &self,
        conn: &C,
        product_id: Uuid,
        delta: i32,
        resulting_stock: i32,
        reason: MovementReason,
        order_id: Option<Uuid>,
    ) -> Result<(), ServiceError> {
        let movement = stock_movement::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(product_id),
            delta: Set(delta),
            resulting_stock: Set(resulting_stock),
            reason: Set(reason),
            order_id: Set(order_id),
            created_at: Set(Utc::now()),
        };
        movement.insert(conn).await?;
        Ok(())
    }
}
