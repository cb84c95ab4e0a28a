//! Payment types and data structures shared by every provider

use crate::crypto::SealedDetails;
use crate::error::{PaymentError, Result};
use crate::money::{Currency, Money};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Closed set of payment providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProviderId {
    /// Card processor
    #[serde(rename = "square")]
    Square,
    /// International wallet
    #[serde(rename = "paypal")]
    PayPal,
    /// Manual bank deposit
    #[serde(rename = "bank_deposit")]
    BankDeposit,
}

impl ProviderId {
    /// All providers in registry order
    pub const ALL: [ProviderId; 3] = [Self::Square, Self::PayPal, Self::BankDeposit];

    /// Stable identifier used in config, routes and records
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Square => "square",
            Self::PayPal => "paypal",
            Self::BankDeposit => "bank_deposit",
        }
    }

    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "square" => Some(Self::Square),
            "paypal" => Some(Self::PayPal),
            "bank_deposit" | "bank-deposit" => Some(Self::BankDeposit),
            _ => None,
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Language for customer-facing text emitted by the core
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    #[default]
    Es,
    En,
}

/// Checkout request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutRequest {
    /// Amount in major currency units
    pub amount: Decimal,
    /// Currency
    pub currency: Currency,
    /// Internal customer ID
    pub customer_id: String,
    /// Customer email
    pub customer_email: Option<String>,
    /// Description shown to the payer
    pub description: String,
    /// Where the provider sends the payer after paying
    pub return_url: Option<String>,
    /// Where the provider sends the payer after abandoning
    pub cancel_url: Option<String>,
    /// Customer's country (ISO 3166-1 alpha-2)
    pub country: Option<String>,
    /// Language for generated instructions
    pub locale: Locale,
    /// Metadata
    pub metadata: HashMap<String, String>,
}

impl CheckoutRequest {
    /// Create a checkout request
    pub fn new(
        amount: Decimal,
        currency: Currency,
        customer_id: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            amount,
            currency,
            customer_id: customer_id.into(),
            customer_email: None,
            description: description.into(),
            return_url: None,
            cancel_url: None,
            country: None,
            locale: Locale::default(),
            metadata: HashMap::new(),
        }
    }

    /// With customer email
    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.customer_email = Some(email.into());
        self
    }

    /// With return and cancel URLs
    pub fn urls(mut self, return_url: impl Into<String>, cancel_url: impl Into<String>) -> Self {
        self.return_url = Some(return_url.into());
        self.cancel_url = Some(cancel_url.into());
        self
    }

    /// With customer country
    pub fn country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    /// With locale
    pub fn locale(mut self, locale: Locale) -> Self {
        self.locale = locale;
        self
    }

    /// With metadata
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Amount converted to minor units
    pub fn money(&self) -> Result<Money> {
        Money::from_major(self.amount, self.currency)
    }

    /// Validate before any provider is contacted
    pub fn validate(&self) -> Result<()> {
        validate_amount(self.amount)?;
        if self.customer_id.trim().is_empty() {
            return Err(PaymentError::Validation("customer_id is required".into()));
        }
        for url in [&self.return_url, &self.cancel_url].into_iter().flatten() {
            url::Url::parse(url)
                .map_err(|e| PaymentError::Validation(format!("invalid URL {}: {}", url, e)))?;
        }
        Ok(())
    }
}

/// Checkout session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutStatus {
    Pending,
    Completed,
    Failed,
}

/// Initiated purchase returned by a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSession {
    /// Provider-assigned checkout ID
    pub checkout_id: String,
    /// Provider
    pub provider: ProviderId,
    /// Hosted payment / approval URL, if the provider has one
    pub checkout_url: Option<String>,
    /// Provider order the checkout settles into, used to match webhooks
    pub order_reference: Option<String>,
    /// Status
    pub status: CheckoutStatus,
    /// Amount
    pub amount: Money,
    /// Customer ID
    pub customer_id: String,
    /// Description
    pub description: String,
    /// Return URL
    pub return_url: Option<String>,
    /// Cancel URL
    pub cancel_url: Option<String>,
    /// Manual deposit instructions (bank deposit only)
    pub deposit_instructions: Option<DepositInstructions>,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

/// Instructions the customer follows to pay by bank transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositInstructions {
    /// Bank name
    pub bank_name: String,
    /// Legal account holder
    pub account_holder: String,
    /// Holder tax ID
    pub tax_id: String,
    /// Masked account identifier
    pub masked_account: String,
    /// Account type (checking, savings)
    pub account_type: Option<String>,
    /// Amount to deposit
    pub amount: Money,
    /// Reference code the customer quotes with the deposit
    pub reference_code: String,
    /// Deposit deadline
    pub due_date: DateTime<Utc>,
    /// Localized instruction text
    pub message: String,
}

/// Payment request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    /// Amount in major currency units
    pub amount: Decimal,
    /// Currency
    pub currency: Currency,
    /// Provider-issued token, nonce or order ID to finalize
    pub payment_method_id: Option<String>,
    /// Saved method to charge when no token is supplied
    pub saved_method: Option<SavedMethod>,
    /// Internal customer ID
    pub customer_id: String,
    /// Customer's country (ISO 3166-1 alpha-2)
    pub country: Option<String>,
    /// Idempotency key
    pub idempotency_key: Option<String>,
    /// Internal reference (invoice ID) sent to the provider
    pub reference: Option<String>,
}

impl PaymentRequest {
    /// Create a payment request
    pub fn new(amount: Decimal, currency: Currency, customer_id: impl Into<String>) -> Self {
        Self {
            amount,
            currency,
            payment_method_id: None,
            saved_method: None,
            customer_id: customer_id.into(),
            country: None,
            idempotency_key: None,
            reference: None,
        }
    }

    /// Finalize with a provider token or order ID
    pub fn payment_method(mut self, id: impl Into<String>) -> Self {
        self.payment_method_id = Some(id.into());
        self
    }

    /// Charge a saved method
    pub fn saved_method(mut self, method: SavedMethod) -> Self {
        self.saved_method = Some(method);
        self
    }

    /// With customer country
    pub fn country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    /// With idempotency key
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// With internal reference
    pub fn reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    /// Amount converted to minor units
    pub fn money(&self) -> Result<Money> {
        Money::from_major(self.amount, self.currency)
    }

    /// Validate before any provider is contacted
    pub fn validate(&self) -> Result<()> {
        validate_amount(self.amount)?;
        if self.customer_id.trim().is_empty() {
            return Err(PaymentError::Validation("customer_id is required".into()));
        }
        Ok(())
    }
}

/// Saved payment method as handed to the owning adapter.
///
/// The details stay sealed until the adapter opens them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedMethod {
    /// Provider-side customer reference
    pub provider_customer_ref: Option<String>,
    /// Sealed account details
    pub details: SealedDetails,
}

/// Payment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Succeeded,
    Pending,
    Failed,
    Refunded,
}

/// Outcome of a single payment attempt. A retry produces a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentResult {
    /// Provider-scoped payment ID
    pub payment_id: String,
    /// Provider
    pub provider: ProviderId,
    /// Status
    pub status: PaymentStatus,
    /// Amount
    pub amount: Money,
    /// Receipt URL or reference
    pub receipt_reference: Option<String>,
    /// Human-readable failure reason
    pub error: Option<String>,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

impl PaymentResult {
    /// Build a result with the given status
    pub fn new(
        provider: ProviderId,
        payment_id: impl Into<String>,
        status: PaymentStatus,
        amount: Money,
    ) -> Self {
        Self {
            payment_id: payment_id.into(),
            provider,
            status,
            amount,
            receipt_reference: None,
            error: None,
            created_at: Utc::now(),
        }
    }

    /// Declined or failed attempt with a customer-facing reason
    pub fn failed(
        provider: ProviderId,
        payment_id: impl Into<String>,
        amount: Money,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::new(provider, payment_id, PaymentStatus::Failed, amount)
        }
    }

    /// With receipt reference
    pub fn with_receipt(mut self, receipt: Option<String>) -> Self {
        self.receipt_reference = receipt;
        self
    }

    /// Did the attempt succeed
    pub fn is_success(&self) -> bool {
        self.status == PaymentStatus::Succeeded
    }
}

/// Subscription request handed to an adapter (plan already resolved)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    /// Internal customer ID
    pub customer_id: String,
    /// Provider-side customer reference (card processor)
    pub provider_customer_ref: Option<String>,
    /// Customer email
    pub customer_email: Option<String>,
    /// Provider plan / price identifier
    pub plan_id: String,
    /// Return URL after approval
    pub return_url: Option<String>,
    /// Cancel URL
    pub cancel_url: Option<String>,
    /// Customer's country (ISO 3166-1 alpha-2)
    pub country: Option<String>,
    /// Metadata
    pub metadata: HashMap<String, String>,
}

impl SubscriptionRequest {
    /// Create a subscription request
    pub fn new(customer_id: impl Into<String>, plan_id: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            provider_customer_ref: None,
            customer_email: None,
            plan_id: plan_id.into(),
            return_url: None,
            cancel_url: None,
            country: None,
            metadata: HashMap::new(),
        }
    }

    /// With provider-side customer reference
    pub fn provider_customer(mut self, reference: impl Into<String>) -> Self {
        self.provider_customer_ref = Some(reference.into());
        self
    }

    /// With customer email
    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.customer_email = Some(email.into());
        self
    }

    /// With approval return and cancel URLs
    pub fn urls(mut self, return_url: impl Into<String>, cancel_url: impl Into<String>) -> Self {
        self.return_url = Some(return_url.into());
        self.cancel_url = Some(cancel_url.into());
        self
    }

    /// With customer country
    pub fn country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }
}

/// Subscription as reported by a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// Provider subscription reference
    pub id: String,
    /// Provider
    pub provider: ProviderId,
    /// Status
    pub status: SubscriptionStatus,
    /// URL the customer must visit to approve, if any
    pub approval_url: Option<String>,
    /// Current period end
    pub current_period_end: Option<DateTime<Utc>>,
    /// Provider plan ID
    pub plan_id: String,
}

/// Subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    RequiresPaymentMethod,
}

impl SubscriptionStatus {
    /// Is active (can use service)
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }

    /// Needs attention
    pub fn needs_attention(&self) -> bool {
        matches!(self, Self::PastDue | Self::RequiresPaymentMethod)
    }
}

/// Refund status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Pending,
    Succeeded,
    Failed,
    /// Money has to be moved by a person
    ManualActionRequired,
}

/// Refund result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundResult {
    /// Refund ID
    pub refund_id: Option<String>,
    /// Refunded payment
    pub payment_id: String,
    /// Provider
    pub provider: ProviderId,
    /// Amount refunded
    pub amount: Option<Money>,
    /// Status
    pub status: RefundStatus,
}

fn validate_amount(amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(PaymentError::InvalidAmount(format!(
            "amount must be positive, got {}",
            amount
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkout_request_builder() {
        let req = CheckoutRequest::new(Decimal::new(2999, 2), Currency::USD, "cus_1", "Pro plan")
            .email("ana@example.com")
            .country("DO")
            .metadata("invoice_id", "inv_1");

        assert_eq!(req.money().unwrap(), Money::usd(2999));
        assert_eq!(req.customer_email.as_deref(), Some("ana@example.com"));
        assert_eq!(req.metadata.get("invoice_id"), Some(&"inv_1".to_string()));
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_checkout_request_rejects_bad_input() {
        let zero = CheckoutRequest::new(Decimal::ZERO, Currency::USD, "cus_1", "x");
        assert!(matches!(zero.validate(), Err(PaymentError::InvalidAmount(_))));

        let bad_url = CheckoutRequest::new(Decimal::ONE, Currency::USD, "cus_1", "x")
            .urls("not a url", "https://example.com/cancel");
        assert!(matches!(bad_url.validate(), Err(PaymentError::Validation(_))));
    }

    #[test]
    fn test_provider_id_round_trip() {
        for id in ProviderId::ALL {
            assert_eq!(ProviderId::parse(id.as_str()), Some(id));
        }
        assert_eq!(ProviderId::parse("PayPal"), Some(ProviderId::PayPal));
        assert_eq!(ProviderId::parse("stripe"), None);
    }

    #[test]
    fn test_failed_payment_result() {
        let result = PaymentResult::failed(
            ProviderId::Square,
            "pay_1",
            Money::usd(500),
            "Your card was declined.",
        );
        assert_eq!(result.status, PaymentStatus::Failed);
        assert!(!result.is_success());
        assert_eq!(result.error.as_deref(), Some("Your card was declined."));
    }

    #[test]
    fn test_subscription_status() {
        assert!(SubscriptionStatus::Active.is_active());
        assert!(SubscriptionStatus::Trialing.is_active());
        assert!(!SubscriptionStatus::Canceled.is_active());
        assert!(SubscriptionStatus::RequiresPaymentMethod.needs_attention());
    }
}
