//! Normalized webhook events.
//!
//! Each adapter verifies and parses its own notifications into a
//! [`WebhookEvent`]; the reconciler only ever sees this shape.

use crate::money::Money;
use crate::types::{ProviderId, SubscriptionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Longest payload excerpt written to logs
pub const LOG_EXCERPT_LEN: usize = 256;

/// Webhook event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Provider event ID (dedup key)
    pub id: String,
    /// Provider
    pub provider: ProviderId,
    /// Normalized event type
    pub event_type: WebhookEventType,
    /// Event type exactly as the provider sent it
    pub raw_type: String,
    /// Timestamp
    pub created_at: DateTime<Utc>,
    /// Resource the event refers to
    pub resource: WebhookResource,
    /// Verified payload
    pub payload: serde_json::Value,
}

/// References extracted from the event resource
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebhookResource {
    /// Provider payment / capture ID
    pub payment_id: Option<String>,
    /// Order or checkout reference, matches `Invoice::provider_reference`
    pub order_reference: Option<String>,
    /// Provider subscription ID
    pub subscription_id: Option<String>,
    /// Subscription status reported by the provider
    pub subscription_status: Option<SubscriptionStatus>,
    /// Current billing period end
    pub current_period_end: Option<DateTime<Utc>>,
    /// Amount
    pub amount: Option<Money>,
}

/// Webhook event types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventType {
    // Payment events
    PaymentCompleted,
    PaymentFailed,
    PaymentRefunded,
    CheckoutApproved,

    // Subscription events
    SubscriptionActivated,
    SubscriptionUpdated,
    SubscriptionCanceled,
    SubscriptionSuspended,
    SubscriptionPaymentFailed,

    // Invoice events
    InvoicePaid,

    // Unknown event
    Unknown(String),
}

impl WebhookEventType {
    /// Is a one-off payment event
    pub fn is_payment_event(&self) -> bool {
        matches!(
            self,
            Self::PaymentCompleted
                | Self::PaymentFailed
                | Self::PaymentRefunded
                | Self::CheckoutApproved
        )
    }

    /// Is a subscription event
    pub fn is_subscription_event(&self) -> bool {
        matches!(
            self,
            Self::SubscriptionActivated
                | Self::SubscriptionUpdated
                | Self::SubscriptionCanceled
                | Self::SubscriptionSuspended
                | Self::SubscriptionPaymentFailed
        )
    }
}

/// Outcome of handing a notification to an adapter
#[derive(Debug, Clone)]
pub struct WebhookResult {
    /// Adapter accepts notifications at all
    pub received: bool,
    /// Verified and parsed event
    pub event: Option<WebhookEvent>,
}

impl WebhookResult {
    /// Verified event
    pub fn accepted(event: WebhookEvent) -> Self {
        Self {
            received: true,
            event: Some(event),
        }
    }

    /// Provider has no webhooks
    pub fn unsupported() -> Self {
        Self {
            received: false,
            event: None,
        }
    }
}

/// Short, lossy excerpt of a payload for log lines
pub fn log_excerpt(payload: &[u8]) -> String {
    let text = String::from_utf8_lossy(payload);
    match text.char_indices().nth(LOG_EXCERPT_LEN) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.into_owned(),
    }
}

/// Parse an RFC 3339 timestamp, if present and valid
pub(crate) fn parse_timestamp(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_categories() {
        assert!(WebhookEventType::PaymentCompleted.is_payment_event());
        assert!(!WebhookEventType::PaymentCompleted.is_subscription_event());
        assert!(WebhookEventType::SubscriptionSuspended.is_subscription_event());
        assert!(!WebhookEventType::InvoicePaid.is_payment_event());
    }

    #[test]
    fn test_log_excerpt_truncates() {
        let long = "x".repeat(1000);
        let excerpt = log_excerpt(long.as_bytes());
        assert_eq!(excerpt.len(), LOG_EXCERPT_LEN + 3);
        assert_eq!(log_excerpt(b"{\"ok\":true}"), "{\"ok\":true}");
    }

    #[test]
    fn test_parse_timestamp() {
        assert!(parse_timestamp(Some("2026-01-15T10:00:00Z")).is_some());
        assert!(parse_timestamp(Some("yesterday")).is_none());
        assert!(parse_timestamp(None).is_none());
    }
}
