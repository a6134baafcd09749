pub mod carts;
pub mod checkout;
pub mod order_lifecycle;
pub mod payments;
pub mod stock_ledger;
pub mod validation;

pub use carts::{CartProvider, DbCartService};
pub use checkout::CheckoutService;
pub use order_lifecycle::OrderLifecycle;
pub use payments::{GatewayRegistry, PaymentGateway, PhonepeGateway, RazorpayGateway};
pub use stock_ledger::StockLedger;
