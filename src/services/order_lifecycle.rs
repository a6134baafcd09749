use chrono::Utc;
use sea_orm::{
    sea_query::Expr, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, TransactionTrait,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    entities::{
        order::{self, Entity as OrderEntity, OrderStatus},
        order_item::{self, Entity as OrderItemEntity},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::stock_ledger::StockLedger,
};

/// Whether `from -> to` is an allowed lifecycle step. Terminal states
/// (`delivered`, `cancelled`, `failed`, `refunded`) have no exits.
pub fn can_transition(from: OrderStatus, to: OrderStatus) -> bool {
    use OrderStatus::*;
    matches!(
        (from, to),
        (Pending, Paid)
            | (Pending, Failed)
            | (Pending, Cancelled)
            | (Paid, Processing)
            | (Paid, Refunded)
            | (Processing, Shipped)
            | (Shipped, Delivered)
    )
}

/// Result of an idempotent settlement attempt.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub order: order::Model,
    /// False when the order was already in the target state and nothing
    /// was written.
    pub changed: bool,
}

/// Single writer for order status. Every change re-reads the row, checks
/// the transition table and applies through a version-guarded conditional
/// UPDATE, so replayed confirmations and concurrent webhooks cannot
/// double-apply or overwrite each other's terminal state.
#[derive(Clone)]
pub struct OrderLifecycle {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
    stock_ledger: StockLedger,
}

impl OrderLifecycle {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: EventSender,
        stock_ledger: StockLedger,
    ) -> Self {
        Self {
            db,
            event_sender,
            stock_ledger,
        }
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        OrderEntity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {order_id} not found")))
    }

    pub async fn get_order_by_receipt(&self, receipt: &str) -> Result<order::Model, ServiceError> {
        OrderEntity::find()
            .filter(order::Column::Receipt.eq(receipt))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order with receipt {receipt} not found")))
    }

    pub async fn get_order_items(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<order_item::Model>, ServiceError> {
        Ok(OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&*self.db)
            .await?)
    }

    /// Newest-first page of a user's orders.
    pub async fn list_orders_for_user(
        &self,
        user_id: Uuid,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<order::Model>, ServiceError> {
        Ok(OrderEntity::find()
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(order::Column::CreatedAt)
            .limit(limit)
            .offset(offset)
            .all(&*self.db)
            .await?)
    }

    /// Moves an order one lifecycle step. Same-status calls are no-ops;
    /// disallowed steps fail with `InvalidTransition` and write nothing.
    #[instrument(skip(self), fields(order_id = %order_id, to = %to))]
    pub async fn transition(
        &self,
        order_id: Uuid,
        to: OrderStatus,
    ) -> Result<order::Model, ServiceError> {
        // Lost version races mean another writer moved the order; re-read
        // and re-evaluate against the fresh state. Statuses only move
        // forward, so this terminates.
        loop {
            let current = self.get_order(order_id).await?;
            if current.status == to {
                return Ok(current);
            }
            if !can_transition(current.status, to) {
                return Err(ServiceError::InvalidTransition {
                    from: current.status,
                    to,
                });
            }

            let old_status = current.status;
            if let Some(updated) =
                Self::guarded_write(&*self.db, &current, Some(to), None).await?
            {
                self.emit_status_change(&updated, old_status).await;
                return Ok(updated);
            }
        }
    }

    /// Settles a pending order to `paid` or `failed`, optionally merging
    /// additional provider correlation ids into `gateway_refs`.
    ///
    /// Idempotent under replay: an order already in the target state is
    /// returned unchanged. An order settled to the *other* terminal payment
    /// state refuses the step with `InvalidTransition`.
    #[instrument(skip(self, extra_refs), fields(order_id = %order_id, target = %target))]
    pub async fn settle(
        &self,
        order_id: Uuid,
        target: OrderStatus,
        extra_refs: Option<HashMap<String, String>>,
    ) -> Result<Settlement, ServiceError> {
        if !matches!(target, OrderStatus::Paid | OrderStatus::Failed) {
            return Err(ServiceError::InternalError(format!(
                "settle target must be paid or failed, got {target}"
            )));
        }

        loop {
            let current = self.get_order(order_id).await?;
            if current.status == target {
                return Ok(Settlement {
                    order: current,
                    changed: false,
                });
            }
            if current.status != OrderStatus::Pending {
                return Err(ServiceError::InvalidTransition {
                    from: current.status,
                    to: target,
                });
            }

            let old_status = current.status;
            if let Some(updated) =
                Self::guarded_write(&*self.db, &current, Some(target), extra_refs.as_ref())
                    .await?
            {
                self.emit_status_change(&updated, old_status).await;
                return Ok(Settlement {
                    order: updated,
                    changed: true,
                });
            }
            // A concurrent settle or refs merge won the version race;
            // the guards above decide on the next read.
        }
    }

    /// Cancels a pending order and restores its reserved stock in the same
    /// transaction. Orders past `pending` cannot be cancelled here; paid
    /// orders go through the refund path instead.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn cancel(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        let (updated, old_status, items) = loop {
            let txn = self.db.begin().await?;
            let current = OrderEntity::find_by_id(order_id)
                .one(&txn)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("Order {order_id} not found")))?;

            if current.status == OrderStatus::Cancelled {
                txn.commit().await?;
                return Ok(current);
            }
            if !can_transition(current.status, OrderStatus::Cancelled) {
                return Err(ServiceError::InvalidTransition {
                    from: current.status,
                    to: OrderStatus::Cancelled,
                });
            }

            let items = OrderItemEntity::find()
                .filter(order_item::Column::OrderId.eq(order_id))
                .all(&txn)
                .await?;
            for item in &items {
                self.stock_ledger
                    .restore(&txn, item.product_id, item.quantity, Some(order_id))
                    .await?;
            }

            let old_status = current.status;
            match Self::guarded_write(&txn, &current, Some(OrderStatus::Cancelled), None).await? {
                Some(updated) => {
                    txn.commit().await?;
                    break (updated, old_status, items);
                }
                // Lost the version race; dropping the transaction rolls the
                // restore back before the retry re-reads.
                None => drop(txn),
            }
        };

        for item in &items {
            self.event_sender
                .send(Event::StockRestored {
                    product_id: item.product_id,
                    quantity: item.quantity,
                    order_id: Some(order_id),
                })
                .await;
        }
        self.emit_status_change(&updated, old_status).await;

        info!(order_id = %order_id, items = items.len(), "Order cancelled, stock restored");
        Ok(updated)
    }

    /// Merges provider correlation ids into `gateway_refs` without touching
    /// the status. Used right after a hosted-payment session is opened.
    pub async fn record_gateway_refs(
        &self,
        order_id: Uuid,
        refs: HashMap<String, String>,
    ) -> Result<order::Model, ServiceError> {
        loop {
            let current = self.get_order(order_id).await?;
            if let Some(updated) =
                Self::guarded_write(&*self.db, &current, None, Some(&refs)).await?
            {
                return Ok(updated);
            }
        }
    }

    /// Single conditional UPDATE matching the row only at the version the
    /// caller read, checked via the affected-row count. A plain
    /// read-then-write would let two concurrent settlers both apply; this
    /// is the same idiom the stock ledger uses for reservations. Returns
    /// `None` when another writer bumped the version first; `new_status`
    /// of `None` leaves the status column untouched.
    async fn guarded_write<C: ConnectionTrait>(
        conn: &C,
        current: &order::Model,
        new_status: Option<OrderStatus>,
        extra_refs: Option<&HashMap<String, String>>,
    ) -> Result<Option<order::Model>, ServiceError> {
        let now = Utc::now();
        let mut merged = match &current.gateway_refs {
            serde_json::Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        if let Some(refs) = extra_refs {
            for (key, value) in refs {
                merged.insert(key.clone(), serde_json::Value::String(value.clone()));
            }
        }
        let gateway_refs = serde_json::Value::Object(merged);

        let mut update = OrderEntity::update_many()
            .col_expr(order::Column::Version, Expr::value(current.version + 1))
            .col_expr(order::Column::UpdatedAt, Expr::value(now))
            .col_expr(order::Column::GatewayRefs, Expr::value(gateway_refs.clone()))
            .filter(order::Column::Id.eq(current.id))
            .filter(order::Column::Version.eq(current.version));
        if let Some(status) = new_status {
            update = update.col_expr(order::Column::Status, Expr::value(status));
        }

        if update.exec(conn).await?.rows_affected == 0 {
            return Ok(None);
        }

        Ok(Some(order::Model {
            status: new_status.unwrap_or(current.status),
            version: current.version + 1,
            updated_at: Some(now),
            gateway_refs,
            ..current.clone()
        }))
    }

    async fn emit_status_change(&self, order: &order::Model, old_status: OrderStatus) {
        self.event_sender
            .send(Event::OrderStatusChanged {
                order_id: order.id,
                old_status,
                new_status: order.status,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use OrderStatus::*;

    #[test]
    fn pending_fans_out_to_payment_outcomes_and_cancel() {
        assert!(can_transition(Pending, Paid));
        assert!(can_transition(Pending, Failed));
        assert!(can_transition(Pending, Cancelled));
        assert!(!can_transition(Pending, Shipped));
        assert!(!can_transition(Pending, Delivered));
    }

    #[test]
    fn fulfilment_is_strictly_ordered() {
        assert!(can_transition(Paid, Processing));
        assert!(can_transition(Processing, Shipped));
        assert!(can_transition(Shipped, Delivered));
        assert!(!can_transition(Paid, Shipped));
        assert!(!can_transition(Processing, Delivered));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for terminal in [Delivered, Cancelled, Failed, Refunded] {
            for target in [
                Pending, Paid, Processing, Shipped, Delivered, Cancelled, Failed, Refunded,
            ] {
                assert!(
                    !can_transition(terminal, target),
                    "{terminal} -> {target} must be refused"
                );
            }
        }
    }

    #[test]
    fn paid_orders_refund_but_never_cancel() {
        assert!(can_transition(Paid, Refunded));
        assert!(!can_transition(Paid, Cancelled));
        assert!(!can_transition(Paid, Failed));
    }
}
