use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::{
    entities::cart_item::{self, Entity as CartItemEntity},
    errors::ServiceError,
    events::{Event, EventSender},
    services::validation::CartLine,
};

/// Cart collaborator seam. Checkout only ever reads a user's lines and
/// clears them after a successful order; anything else (merging, pricing
/// rules, saved carts) lives behind this trait.
#[async_trait]
pub trait CartProvider: Send + Sync {
    async fn lines_for_user(&self, user_id: Uuid) -> Result<Vec<CartLine>, ServiceError>;

    /// Clears the user's cart. Called after the order row is committed;
    /// failures are surfaced so the caller can log them, but checkout
    /// treats a failed clear as non-fatal.
    async fn clear(&self, user_id: Uuid) -> Result<(), ServiceError>;
}

/// Database-backed cart over the `cart_items` table.
#[derive(Clone)]
pub struct DbCartService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
}

impl DbCartService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        Self { db, event_sender }
    }

    /// Adds quantity to an existing line or inserts a new one.
    #[instrument(skip(self), fields(user_id = %user_id, product_id = %product_id, quantity))]
    pub async fn add_item(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::validation(format!(
                "Cart quantity must be positive, got {quantity}"
            )));
        }

        let existing = CartItemEntity::find()
            .filter(cart_item::Column::UserId.eq(user_id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .one(&*self.db)
            .await?;

        match existing {
            Some(line) => {
                let new_quantity = line.quantity + quantity;
                let mut active: cart_item::ActiveModel = line.into();
                active.quantity = Set(new_quantity);
                active.update(&*self.db).await?;
            }
            None => {
                let line = cart_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    user_id: Set(user_id),
                    product_id: Set(product_id),
                    quantity: Set(quantity),
                    created_at: Set(Utc::now()),
                };
                line.insert(&*self.db).await?;
            }
        }
        Ok(())
    }

    pub async fn remove_item(&self, user_id: Uuid, product_id: Uuid) -> Result<(), ServiceError> {
        CartItemEntity::delete_many()
            .filter(cart_item::Column::UserId.eq(user_id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .exec(&*self.db)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CartProvider for DbCartService {
    async fn lines_for_user(&self, user_id: Uuid) -> Result<Vec<CartLine>, ServiceError> {
        let rows = CartItemEntity::find()
            .filter(cart_item::Column::UserId.eq(user_id))
            .order_by_asc(cart_item::Column::CreatedAt)
            .all(&*self.db)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| CartLine {
                product_id: row.product_id,
                quantity: row.quantity,
            })
            .collect())
    }

    async fn clear(&self, user_id: Uuid) -> Result<(), ServiceError> {
        CartItemEntity::delete_many()
            .filter(cart_item::Column::UserId.eq(user_id))
            .exec(&*self.db)
            .await?;
        self.event_sender.send(Event::CartCleared { user_id }).await;
        Ok(())
    }
}
