use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::order::OrderStatus;

/// Events emitted by the checkout core. Emission is post-commit and
/// best-effort: a send failure is logged and never aborts the operation
/// that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        user_id: Uuid,
        total_amount_minor: i64,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
    PaymentVerified {
        order_id: Uuid,
        gateway: String,
        provider_txn_id: Option<String>,
    },
    PaymentFailed {
        order_id: Uuid,
        gateway: String,
        reason: String,
    },
    StockReserved {
        product_id: Uuid,
        quantity: i32,
        order_id: Uuid,
    },
    StockRestored {
        product_id: Uuid,
        quantity: i32,
        order_id: Option<Uuid>,
    },
    LowStockAlert {
        product_id: Uuid,
        remaining: i32,
    },
    CartCleared {
        user_id: Uuid,
    },
    /// A webhook arrived with a missing or invalid signature. Recorded as a
    /// security event; the payload was never processed.
    WebhookRejected {
        gateway: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event, logging (not propagating) failures. Notification and
    /// audit side effects must never fail the operation that emitted them.
    pub async fn send(&self, event: Event) {
        if let Err(e) = self.sender.send(event).await {
            warn!("Failed to send event: {}", e);
        }
    }
}

/// Creates a channel pair with the standard buffer size.
pub fn channel() -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(256);
    (EventSender::new(tx), rx)
}

/// Consumes events and dispatches them to notification hooks. This is the
/// post-commit boundary for all fire-and-forget side effects.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match event {
            Event::OrderCreated {
                order_id,
                user_id,
                total_amount_minor,
            } => {
                info!(
                    order_id = %order_id,
                    user_id = %user_id,
                    total_amount_minor,
                    "Order created; queueing confirmation notification"
                );
            }
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            } => {
                info!(
                    order_id = %order_id,
                    old_status = %old_status,
                    new_status = %new_status,
                    "Order status changed; queueing status notification"
                );
            }
            Event::PaymentVerified {
                order_id,
                gateway,
                provider_txn_id,
            } => {
                info!(
                    order_id = %order_id,
                    gateway = %gateway,
                    provider_txn_id = ?provider_txn_id,
                    "Payment verified"
                );
            }
            Event::PaymentFailed {
                order_id,
                gateway,
                reason,
            } => {
                warn!(order_id = %order_id, gateway = %gateway, reason = %reason, "Payment failed");
            }
            Event::LowStockAlert {
                product_id,
                remaining,
            } => {
                warn!(
                    product_id = %product_id,
                    remaining,
                    "Low stock alert; queueing restock notification"
                );
            }
            Event::WebhookRejected { gateway, reason } => {
                warn!(gateway = %gateway, reason = %reason, "Rejected webhook (security event)");
            }
            Event::StockReserved {
                product_id,
                quantity,
                order_id,
            } => {
                info!(product_id = %product_id, quantity, order_id = %order_id, "Stock reserved");
            }
            Event::StockRestored {
                product_id,
                quantity,
                order_id,
            } => {
                info!(product_id = %product_id, quantity, order_id = ?order_id, "Stock restored");
            }
            Event::CartCleared { user_id } => {
                info!(user_id = %user_id, "Cart cleared");
            }
        }
    }

    warn!("Event processing loop has ended");
}
