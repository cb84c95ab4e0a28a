//! Persisted billing records. Customer is the aggregate root of all of them.

use crate::crypto::SealedDetails;
use crate::money::Money;
use crate::types::{ProviderId, SubscriptionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Customer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub email: Option<String>,
    pub country: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Saved payment method. Soft-deleted through `active`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentMethodRecord {
    pub id: String,
    pub customer_id: String,
    pub provider: ProviderId,
    /// Provider-side customer reference, absent for deposit-only methods
    pub provider_customer_ref: Option<String>,
    pub account_details: SealedDetails,
    pub is_default: bool,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    /// Free-form metadata, includes `country`
    pub metadata: HashMap<String, String>,
}

/// Customer subscription to a recurring plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub id: String,
    pub customer_id: String,
    pub provider: ProviderId,
    pub provider_subscription_id: String,
    /// Internal plan tier
    pub plan: String,
    pub status: SubscriptionStatus,
    pub current_period_end: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubscriptionRecord {
    /// New record for a subscription the provider just created
    pub fn new(
        customer_id: impl Into<String>,
        provider: ProviderId,
        provider_subscription_id: impl Into<String>,
        plan: impl Into<String>,
        status: SubscriptionStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: format!("sub_{}", Uuid::new_v4().simple()),
            customer_id: customer_id.into(),
            provider,
            provider_subscription_id: provider_subscription_id.into(),
            plan: plan.into(),
            status,
            current_period_end: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Invoice status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Open,
    Paid,
    Void,
    Refunded,
}

/// Invoice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub customer_id: String,
    pub subscription_id: Option<String>,
    pub amount: Money,
    pub status: InvoiceStatus,
    /// Provider expected to settle the invoice
    pub provider: Option<ProviderId>,
    /// Provider order / checkout reference used to match webhooks
    pub provider_reference: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Invoice {
    /// New open invoice
    pub fn open(customer_id: impl Into<String>, amount: Money) -> Self {
        Self {
            id: format!("inv_{}", Uuid::new_v4().simple()),
            customer_id: customer_id.into(),
            subscription_id: None,
            amount,
            status: InvoiceStatus::Open,
            provider: None,
            provider_reference: None,
            paid_at: None,
            created_at: Utc::now(),
        }
    }

    /// Link to a subscription
    pub fn for_subscription(mut self, subscription_id: impl Into<String>) -> Self {
        self.subscription_id = Some(subscription_id.into());
        self
    }

    /// Link to the provider reference a webhook will carry
    pub fn settled_by(mut self, provider: ProviderId, reference: impl Into<String>) -> Self {
        self.provider = Some(provider);
        self.provider_reference = Some(reference.into());
        self
    }
}

/// Webhook processing status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Pending,
    Processed,
    Failed,
}

/// Inbound webhook event, unique on (provider, event_id)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEventRecord {
    pub id: String,
    pub provider: ProviderId,
    pub event_type: String,
    /// Provider event ID (dedup key)
    pub event_id: String,
    pub payload: serde_json::Value,
    pub status: WebhookStatus,
    pub error: Option<String>,
    pub attempts: u32,
    /// Processing claim held until this instant
    pub locked_until: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl WebhookEventRecord {
    /// New pending record
    pub fn pending(
        provider: ProviderId,
        event_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: format!("whe_{}", Uuid::new_v4().simple()),
            provider,
            event_type: event_type.into(),
            event_id: event_id.into(),
            payload,
            status: WebhookStatus::Pending,
            error: None,
            attempts: 0,
            locked_until: None,
            received_at: Utc::now(),
            processed_at: None,
        }
    }
}

/// Bank deposit status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    Pending,
    Verified,
    Rejected,
}

impl DepositStatus {
    /// Verified and rejected deposits never change again
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Verified => "verified",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for DepositStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Customer-declared bank deposit awaiting human verification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankDeposit {
    pub id: String,
    pub customer_id: String,
    pub invoice_id: Option<String>,
    pub amount: Money,
    pub bank_name: String,
    /// Last four digits of the originating account; the full number is never stored
    pub account_last4: String,
    /// Caller-supplied transfer reference
    pub reference_code: String,
    pub receipt_reference: Option<String>,
    pub status: DepositStatus,
    pub verified_by: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl BankDeposit {
    /// Message shown to the customer about this deposit
    pub fn customer_message(&self) -> Option<&str> {
        match self.status {
            DepositStatus::Rejected => self.rejection_reason.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deposit_status_terminal() {
        assert!(!DepositStatus::Pending.is_terminal());
        assert!(DepositStatus::Verified.is_terminal());
        assert!(DepositStatus::Rejected.is_terminal());
        assert_eq!(DepositStatus::Rejected.to_string(), "rejected");
    }

    #[test]
    fn test_invoice_builder() {
        let invoice = Invoice::open("cus_1", Money::usd(1500))
            .for_subscription("sub_1")
            .settled_by(ProviderId::PayPal, "ORDER-1");
        assert_eq!(invoice.status, InvoiceStatus::Open);
        assert_eq!(invoice.provider, Some(ProviderId::PayPal));
        assert_eq!(invoice.provider_reference.as_deref(), Some("ORDER-1"));
        assert!(invoice.id.starts_with("inv_"));
    }
}
