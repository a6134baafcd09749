pub mod checkout;
pub mod common;
pub mod health;
pub mod orders;
pub mod payments;
pub mod webhooks;

pub use checkout::checkout_routes;
pub use health::health_routes;
pub use orders::order_routes;
pub use payments::payment_routes;
pub use webhooks::webhook_routes;
