//! Payment provider implementations

pub mod bank_deposit;
pub mod paypal;
pub mod square;

pub use bank_deposit::BankDepositProvider;
pub use paypal::PayPalProvider;
pub use square::{SquareCardDetails, SquareProvider};
