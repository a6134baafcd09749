use chrono::Utc;
use rand::Rng;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set, TransactionTrait};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::{
        order::{self, OrderStatus},
        order_item,
        product::Entity as ProductEntity,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        carts::CartProvider,
        order_lifecycle::OrderLifecycle,
        payments::{
            GatewayRegistry, PaymentContext, PaymentStatus, PaymentVerifier, RefundContext,
            VerificationOutcome,
        },
        stock_ledger::StockLedger,
        validation::{
            validate_cart_items, validate_payment_payload, validate_shipping_address,
            validate_stock_availability, CartLine, ShippingAddress,
        },
    },
};

/// Checkout initiation request. Lines may be given explicitly or omitted to
/// consume the user's stored cart.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutRequest {
    pub user_id: Uuid,
    #[serde(default)]
    pub items: Option<Vec<CartLine>>,
    pub gateway: String,
    pub shipping_address: ShippingAddress,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutResponse {
    pub order_id: Uuid,
    pub receipt: String,
    pub status: OrderStatus,
    pub total_amount_minor: i64,
    pub currency: String,
    pub gateway: String,
    pub payment_url: String,
    pub provider_txn_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyResponse {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub verified: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentStatusResponse {
    pub order_id: Uuid,
    pub receipt: String,
    pub order_status: OrderStatus,
    pub payment_status: PaymentStatus,
}

/// Orchestrates the checkout flow: validation, atomic stock reservation,
/// order creation, hosted-payment initiation and payment settlement.
///
/// Gateways are only ever called outside database transactions. A gateway
/// failure after the order row is committed compensates forward (the order
/// moves to `failed`); committed work is never rolled back.
#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    stock_ledger: StockLedger,
    lifecycle: OrderLifecycle,
    gateways: GatewayRegistry,
    cart: Arc<dyn CartProvider>,
    event_sender: EventSender,
    currency: String,
    max_quantity_per_line: i32,
}

struct ReservedLine {
    product_id: Uuid,
    quantity: i32,
    unit_price_minor: i64,
    product_name: String,
    product_description: String,
}

impl CheckoutService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<DatabaseConnection>,
        stock_ledger: StockLedger,
        lifecycle: OrderLifecycle,
        gateways: GatewayRegistry,
        cart: Arc<dyn CartProvider>,
        event_sender: EventSender,
        currency: String,
        max_quantity_per_line: i32,
    ) -> Self {
        Self {
            db,
            stock_ledger,
            lifecycle,
            gateways,
            cart,
            event_sender,
            currency,
            max_quantity_per_line,
        }
    }

    /// Runs a full checkout:
    /// 1. validates lines and shipping address,
    /// 2. advisory stock pre-check for fast feedback,
    /// 3. resolves the gateway (configuration errors surface before any write),
    /// 4. in one transaction, snapshots prices, conditionally reserves stock
    ///    and inserts the pending order with its items,
    /// 5. emits post-commit events,
    /// 6. opens the hosted-payment session and records the provider refs.
    ///
    /// The stored cart is left in place here; it is cleared once the
    /// payment settles to `paid`, so a failed or abandoned payment keeps
    /// the cart intact.
    ///
    /// If the gateway call in step 6 fails, the committed order moves to
    /// `failed`. The reservation is deliberately kept: the attempt is
    /// auditable in the stock ledger and operations reconcile failed orders
    /// in bulk rather than auto-restocking on every provider hiccup.
    #[instrument(skip(self, request), fields(user_id = %request.user_id, gateway = %request.gateway))]
    pub async fn initiate_checkout(
        &self,
        request: CheckoutRequest,
    ) -> Result<CheckoutResponse, ServiceError> {
        let lines = match &request.items {
            Some(items) => items.clone(),
            None => self.cart.lines_for_user(request.user_id).await?,
        };

        validate_cart_items(&lines, self.max_quantity_per_line).into_result()?;
        validate_shipping_address(&request.shipping_address).into_result()?;
        validate_stock_availability(&lines, |product_id| async move {
            self.stock_ledger.stock_of(product_id).await
        })
        .await?
        .into_result()?;

        let gateway = self.gateways.get(&request.gateway)?;

        let order_id = Uuid::new_v4();
        let receipt = generate_receipt();

        let txn = self.db.begin().await?;
        let mut reserved: Vec<ReservedLine> = Vec::with_capacity(lines.len());
        for line in &lines {
            let product = ProductEntity::find_by_id(line.product_id)
                .one(&txn)
                .await?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("Product {} not found", line.product_id))
                })?;

            let reservation = self
                .stock_ledger
                .try_reserve(&txn, line.product_id, line.quantity, order_id)
                .await?;
            if !reservation.ok {
                // Dropping the transaction rolls back every reservation
                // made so far.
                return Err(ServiceError::StockConflict {
                    product_id: line.product_id,
                    requested: line.quantity,
                    available: reservation.available,
                });
            }

            reserved.push(ReservedLine {
                product_id: line.product_id,
                quantity: line.quantity,
                unit_price_minor: product.effective_price_minor(),
                product_name: product.name,
                product_description: product.description,
            });
        }

        let total_amount_minor = order_total_minor(&reserved)?;

        let order_row = order::ActiveModel {
            id: Set(order_id),
            user_id: Set(request.user_id),
            receipt: Set(receipt.clone()),
            total_amount_minor: Set(total_amount_minor),
            currency: Set(self.currency.clone()),
            status: Set(OrderStatus::Pending),
            gateway: Set(request.gateway.clone()),
            gateway_refs: Set(json!({})),
            shipping_address: Set(serde_json::to_value(&request.shipping_address)
                .map_err(|e| ServiceError::InternalError(e.to_string()))?),
            version: Set(1),
            ..Default::default()
        };
        order_row.insert(&txn).await?;

        for line in &reserved {
            let item = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(line.product_id),
                quantity: Set(line.quantity),
                unit_price_minor: Set(line.unit_price_minor),
                product_name: Set(line.product_name.clone()),
                product_description: Set(line.product_description.clone()),
                created_at: Set(Utc::now()),
            };
            item.insert(&txn).await?;
        }
        txn.commit().await?;

        self.event_sender
            .send(Event::OrderCreated {
                order_id,
                user_id: request.user_id,
                total_amount_minor,
            })
            .await;
        for line in &reserved {
            self.event_sender
                .send(Event::StockReserved {
                    product_id: line.product_id,
                    quantity: line.quantity,
                    order_id,
                })
                .await;
        }

        let payment = match gateway
            .create_payment_request(&PaymentContext {
                order_id,
                receipt: receipt.clone(),
                amount_minor: total_amount_minor,
                currency: self.currency.clone(),
                customer_email: request.shipping_address.email.clone(),
                customer_phone: request.shipping_address.phone.clone(),
            })
            .await
        {
            Ok(payment) => payment,
            Err(e) => {
                error!(order_id = %order_id, error = %e, "Payment initiation failed, failing order");
                self.lifecycle
                    .settle(order_id, OrderStatus::Failed, None)
                    .await?;
                self.event_sender
                    .send(Event::PaymentFailed {
                        order_id,
                        gateway: request.gateway.clone(),
                        reason: e.to_string(),
                    })
                    .await;
                return Err(e);
            }
        };

        self.lifecycle
            .record_gateway_refs(order_id, payment.refs)
            .await?;

        info!(
            order_id = %order_id,
            receipt = %receipt,
            total_amount_minor,
            "Checkout initiated"
        );

        Ok(CheckoutResponse {
            order_id,
            receipt,
            status: OrderStatus::Pending,
            total_amount_minor,
            currency: self.currency.clone(),
            gateway: request.gateway,
            payment_url: payment.payment_url,
            provider_txn_id: payment.provider_txn_id,
        })
    }

    /// Confirms a client-reported payment for an order and settles it.
    /// A replay against an already-settled order answers from the database
    /// without another provider round trip.
    #[instrument(skip(self, payload), fields(order_id = %order_id))]
    pub async fn verify_payment(
        &self,
        order_id: Uuid,
        payload: &Value,
    ) -> Result<VerifyResponse, ServiceError> {
        let order = self.lifecycle.get_order(order_id).await?;
        if order.status != OrderStatus::Pending {
            return Ok(Self::settled_response(&order));
        }

        let gateway = self.gateways.get(&order.gateway)?;
        validate_payment_payload(payload, gateway.required_payment_fields()).into_result()?;

        let outcome = gateway.verify_payment(payload).await?;
        let target = PaymentVerifier::target_status(&outcome);
        let refs = outcome
            .provider_txn_id
            .clone()
            .map(|id| HashMap::from([(gateway.payment_ref_key().to_string(), id)]));

        self.apply_settlement(&order, target, refs, &outcome).await
    }

    /// Polls the provider for the payment behind a receipt and settles the
    /// order when the provider reports a terminal state. Safe to call
    /// repeatedly.
    #[instrument(skip(self), fields(receipt = %receipt))]
    pub async fn check_payment_status(
        &self,
        receipt: &str,
    ) -> Result<PaymentStatusResponse, ServiceError> {
        let order = self.lifecycle.get_order_by_receipt(receipt).await?;

        // Settled orders answer from the database; the provider is only
        // consulted while the payment is still open.
        if order.status != OrderStatus::Pending {
            return Ok(PaymentStatusResponse {
                order_id: order.id,
                receipt: order.receipt,
                payment_status: match order.status {
                    OrderStatus::Failed | OrderStatus::Cancelled => PaymentStatus::Failed,
                    _ => PaymentStatus::Success,
                },
                order_status: order.status,
            });
        }

        let gateway = self.gateways.get(&order.gateway)?;
        let payment_status = gateway.check_payment_status(receipt).await?;

        let order_status = match PaymentVerifier::status_from_poll(payment_status) {
            Some(target) => {
                let outcome = VerificationOutcome {
                    success: target == OrderStatus::Paid,
                    verified: true,
                    provider_txn_id: None,
                    amount_minor: None,
                    message: "settled from status poll".to_string(),
                };
                self.apply_settlement(&order, target, None, &outcome)
                    .await?
                    .status
            }
            None => order.status,
        };

        Ok(PaymentStatusResponse {
            order_id: order.id,
            receipt: order.receipt,
            order_status,
            payment_status,
        })
    }

    /// Processes a provider webhook. The signature is checked over the raw
    /// body before anything is parsed; rejected webhooks are recorded as
    /// security events and never touch an order.
    #[instrument(skip(self, raw_body, signature), fields(gateway = %gateway_name))]
    pub async fn handle_webhook(
        &self,
        gateway_name: &str,
        raw_body: &[u8],
        signature: Option<&str>,
    ) -> Result<VerifyResponse, ServiceError> {
        let gateway = self.gateways.get(gateway_name)?;

        if !gateway.verify_webhook_signature(raw_body, signature) {
            let reason = if signature.is_none() {
                "missing signature header"
            } else {
                "signature mismatch"
            };
            self.event_sender
                .send(Event::WebhookRejected {
                    gateway: gateway_name.to_string(),
                    reason: reason.to_string(),
                })
                .await;
            return Err(ServiceError::WebhookSignature {
                gateway: gateway_name.to_string(),
                reason: reason.to_string(),
            });
        }

        let payload: Value = serde_json::from_slice(raw_body)
            .map_err(|e| ServiceError::validation(format!("Webhook body is not JSON: {e}")))?;
        let notice = gateway.parse_webhook(&payload)?;

        let order = self.lifecycle.get_order_by_receipt(&notice.receipt).await?;
        if order.gateway != gateway_name {
            return Err(ServiceError::validation(format!(
                "Order {} belongs to gateway '{}', webhook came from '{gateway_name}'",
                order.id, order.gateway
            )));
        }
        // Redelivery after settlement, including one carrying a conflicting
        // outcome, acknowledges with the current state.
        if order.status != OrderStatus::Pending {
            return Ok(Self::settled_response(&order));
        }

        let target = PaymentVerifier::target_status(&notice.outcome);
        let refs = notice
            .outcome
            .provider_txn_id
            .clone()
            .map(|id| HashMap::from([(gateway.payment_ref_key().to_string(), id)]));

        self.apply_settlement(&order, target, refs, &notice.outcome)
            .await
    }

    /// Refunds a paid order through its gateway, then moves it to
    /// `refunded`. The gateway call happens first; an order is only marked
    /// refunded once the provider accepted the refund.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn refund_order(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        let order = self.lifecycle.get_order(order_id).await?;
        if order.status != OrderStatus::Paid {
            return Err(ServiceError::InvalidTransition {
                from: order.status,
                to: OrderStatus::Refunded,
            });
        }

        let gateway = self.gateways.get(&order.gateway)?;
        let provider_txn_id = order
            .gateway_refs
            .get(gateway.payment_ref_key())
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ServiceError::validation(format!(
                    "Order {order_id} has no recorded provider transaction id"
                ))
            })?
            .to_string();

        gateway
            .initiate_refund(&RefundContext {
                order_id,
                receipt: order.receipt.clone(),
                provider_txn_id,
                amount_minor: order.total_amount_minor,
            })
            .await?;

        self.lifecycle
            .transition(order_id, OrderStatus::Refunded)
            .await
    }

    /// Idempotent answer for confirmations arriving after settlement.
    fn settled_response(order: &order::Model) -> VerifyResponse {
        VerifyResponse {
            order_id: order.id,
            status: order.status,
            verified: !matches!(
                order.status,
                OrderStatus::Failed | OrderStatus::Cancelled
            ),
            message: format!("Order already settled to '{}'", order.status),
        }
    }

    async fn apply_settlement(
        &self,
        order: &order::Model,
        target: OrderStatus,
        refs: Option<HashMap<String, String>>,
        outcome: &VerificationOutcome,
    ) -> Result<VerifyResponse, ServiceError> {
        let settlement = self.lifecycle.settle(order.id, target, refs).await?;

        if settlement.changed {
            match target {
                OrderStatus::Paid => {
                    self.event_sender
                        .send(Event::PaymentVerified {
                            order_id: order.id,
                            gateway: order.gateway.clone(),
                            provider_txn_id: outcome.provider_txn_id.clone(),
                        })
                        .await;
                    // The stored cart is consumed exactly once, on the
                    // settlement that moved the order to paid. Best effort:
                    // a failing cart store must not unsettle a payment.
                    if let Err(e) = self.cart.clear(order.user_id).await {
                        warn!(
                            user_id = %order.user_id,
                            order_id = %order.id,
                            error = %e,
                            "Failed to clear cart after payment"
                        );
                    }
                }
                _ => {
                    self.event_sender
                        .send(Event::PaymentFailed {
                            order_id: order.id,
                            gateway: order.gateway.clone(),
                            reason: outcome.message.clone(),
                        })
                        .await;
                }
            }
        }

        Ok(VerifyResponse {
            order_id: order.id,
            status: settlement.order.status,
            verified: outcome.verified,
            message: outcome.message.clone(),
        })
    }
}

/// Sums line subtotals with overflow checks. Quantities and prices are
/// validated upstream, so overflow here means corrupt data, not bad input.
fn order_total_minor(lines: &[ReservedLine]) -> Result<i64, ServiceError> {
    let mut total: i64 = 0;
    for line in lines {
        let subtotal = line
            .unit_price_minor
            .checked_mul(i64::from(line.quantity))
            .ok_or_else(|| {
                ServiceError::InternalError(format!(
                    "Line subtotal overflows for product {}",
                    line.product_id
                ))
            })?;
        total = total
            .checked_add(subtotal)
            .ok_or_else(|| ServiceError::InternalError("Order total overflows".to_string()))?;
    }
    Ok(total)
}

/// Merchant receipt: timestamp plus random suffix, unique per checkout
/// attempt and safe to hand to providers as the merchant transaction id.
fn generate_receipt() -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("RCPT-{}-{suffix:06}", Utc::now().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receipts_are_prefixed_and_distinct() {
        let a = generate_receipt();
        let b = generate_receipt();
        assert!(a.starts_with("RCPT-"));
        assert_ne!(a, b);
    }

    #[test]
    fn order_total_sums_line_subtotals() {
        let lines = vec![
            ReservedLine {
                product_id: Uuid::new_v4(),
                quantity: 2,
                unit_price_minor: 49_900,
                product_name: String::new(),
                product_description: String::new(),
            },
            ReservedLine {
                product_id: Uuid::new_v4(),
                quantity: 1,
                unit_price_minor: 9_900,
                product_name: String::new(),
                product_description: String::new(),
            },
        ];
        assert_eq!(order_total_minor(&lines).unwrap(), 109_700);
    }

    proptest::proptest! {
        #[test]
        fn order_total_matches_widened_reference_sum(
            lines in proptest::collection::vec((1..=10i32, 1..=10_000_000i64), 0..8)
        ) {
            let reserved: Vec<ReservedLine> = lines
                .iter()
                .map(|&(quantity, unit_price_minor)| ReservedLine {
                    product_id: Uuid::new_v4(),
                    quantity,
                    unit_price_minor,
                    product_name: String::new(),
                    product_description: String::new(),
                })
                .collect();

            let expected: i128 = lines
                .iter()
                .map(|&(q, p)| i128::from(q) * i128::from(p))
                .sum();

            let total = order_total_minor(&reserved).unwrap();
            proptest::prop_assert_eq!(i128::from(total), expected);
        }
    }

    #[test]
    fn order_total_rejects_overflow() {
        let lines = vec![ReservedLine {
            product_id: Uuid::new_v4(),
            quantity: i32::MAX,
            unit_price_minor: i64::MAX / 2,
            product_name: String::new(),
            product_description: String::new(),
        }];
        assert!(order_total_minor(&lines).is_err());
    }
}
