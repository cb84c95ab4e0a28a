//! Error types for payment processing

use crate::money::Currency;
use crate::records::DepositStatus;
use crate::types::ProviderId;
use thiserror::Error;

/// Payment error types
///
/// Every error raised by an adapter carries the provider that produced it, so
/// callers can decide whether to retry with another eligible provider.
#[derive(Error, Debug)]
pub enum PaymentError {
    /// Provider was never registered (credentials absent or init failed)
    #[error("Payment provider {0} is not available")]
    ProviderUnavailable(ProviderId),

    /// Identifier does not name a known provider
    #[error("Unknown payment provider: {0}")]
    UnknownProvider(String),

    /// Registry is empty
    #[error("No payment provider is available")]
    NoProviderAvailable,

    /// Provider not permitted for the customer's country
    #[error("Payment provider {provider} is not permitted for country {country}")]
    NotPermitted { provider: ProviderId, country: String },

    /// Startup credential check failed
    #[error("Failed to initialize {provider}: {message}")]
    ProviderInit {
        provider: ProviderId,
        message: String,
    },

    /// Network error
    #[error("Network error from {provider}: {message}")]
    Network {
        provider: ProviderId,
        message: String,
    },

    /// Outbound request exceeded its timeout
    #[error("Request to {provider} timed out")]
    Timeout { provider: ProviderId },

    /// Authentication error
    #[error("Authentication with {provider} failed: {message}")]
    Authentication {
        provider: ProviderId,
        message: String,
    },

    /// Unexpected response from the provider
    #[error("{provider} responded with status {status}: {message}")]
    Upstream {
        provider: ProviderId,
        status: u16,
        message: String,
    },

    /// Invalid webhook signature
    #[error("Invalid webhook signature from {provider}")]
    InvalidSignature { provider: ProviderId },

    /// Operation not offered by this provider
    #[error("{provider} does not support {operation}")]
    Unsupported {
        provider: ProviderId,
        operation: &'static str,
    },

    /// No active bank account configured for the currency
    #[error("No active bank account configured for {0}")]
    NoActiveAccount(Currency),

    /// Invalid amount
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Deposit already verified or rejected
    #[error("Bank deposit {deposit_id} is already {status}")]
    AlreadyFinalized {
        deposit_id: String,
        status: DepositStatus,
    },

    /// Record not found
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Another worker holds the claim on this webhook event
    #[error("Webhook event {event_id} from {provider} is already being processed")]
    WebhookInFlight {
        provider: ProviderId,
        event_id: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Sealing or opening account details failed
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Record store error
    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),
}

impl PaymentError {
    /// Map a transport failure from `reqwest` to the matching variant
    pub fn transport(provider: ProviderId, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PaymentError::Timeout { provider }
        } else {
            PaymentError::Network {
                provider,
                message: err.to_string(),
            }
        }
    }

    /// Provider that raised the error, if any
    pub fn provider(&self) -> Option<ProviderId> {
        match self {
            Self::ProviderUnavailable(provider)
            | Self::NotPermitted { provider, .. }
            | Self::ProviderInit { provider, .. }
            | Self::Network { provider, .. }
            | Self::Timeout { provider }
            | Self::Authentication { provider, .. }
            | Self::Upstream { provider, .. }
            | Self::InvalidSignature { provider }
            | Self::Unsupported { provider, .. }
            | Self::WebhookInFlight { provider, .. } => Some(*provider),
            Self::NoActiveAccount(_) => Some(ProviderId::BankDeposit),
            _ => None,
        }
    }

    /// Whether the same request may succeed if retried later
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } | Self::WebhookInFlight { .. } => true,
            Self::Upstream { status, .. } => *status >= 500 || *status == 429,
            Self::Store(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Customer-facing message. Never includes raw provider error text.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::ProviderUnavailable(_)
            | Self::UnknownProvider(_)
            | Self::NotPermitted { .. }
            | Self::NoActiveAccount(_)
            | Self::Unsupported { .. } => {
                "This payment method is not available. Please try a different payment method."
            }
            Self::NoProviderAvailable => {
                "Online payments are temporarily unavailable. Please contact support."
            }
            Self::Network { .. } | Self::Timeout { .. } | Self::Upstream { .. } => {
                "The payment service did not respond. Please try again or use a different payment method."
            }
            Self::InvalidAmount(_) | Self::Validation(_) => {
                "Some payment details are invalid. Please review them and try again."
            }
            Self::AlreadyFinalized { .. } => "This deposit has already been reviewed.",
            _ => "We could not process the payment. Please try a different payment method.",
        }
    }
}

impl From<serde_json::Error> for PaymentError {
    fn from(err: serde_json::Error) -> Self {
        PaymentError::Serialization(err.to_string())
    }
}

/// Result type for payment operations
pub type Result<T> = std::result::Result<T, PaymentError>;

/// Card decline reasons reported by the card processor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclineCode {
    /// Generic decline
    GenericDecline,
    /// Insufficient funds
    InsufficientFunds,
    /// CVV check failed
    CvvFailure,
    /// Address verification failed
    AddressVerificationFailure,
    /// Expired card
    ExpiredCard,
    /// Invalid expiration
    InvalidExpiration,
    /// Card not supported
    CardNotSupported,
    /// Flagged by the processor's risk checks
    Fraudulent,
    /// Wallet instrument declined by the payer's funding source
    InstrumentDeclined,
    /// Unknown
    Unknown,
}

impl DeclineCode {
    /// Parse a provider decline code
    pub fn parse(code: &str) -> Self {
        match code.to_uppercase().as_str() {
            "GENERIC_DECLINE" | "CARD_DECLINED" | "DO_NOT_HONOR" => Self::GenericDecline,
            "INSUFFICIENT_FUNDS" => Self::InsufficientFunds,
            "CVV_FAILURE" | "INCORRECT_CVC" => Self::CvvFailure,
            "ADDRESS_VERIFICATION_FAILURE" => Self::AddressVerificationFailure,
            "CARD_EXPIRED" | "EXPIRED_CARD" => Self::ExpiredCard,
            "INVALID_EXPIRATION" => Self::InvalidExpiration,
            "CARD_NOT_SUPPORTED" | "CARD_TYPE_NOT_ACCEPTED" => Self::CardNotSupported,
            "CARD_DECLINED_VERIFICATION_REQUIRED" | "TRANSACTION_LIMIT" | "FRAUDULENT" => {
                Self::Fraudulent
            }
            "INSTRUMENT_DECLINED" | "PAYER_CANNOT_PAY" => Self::InstrumentDeclined,
            _ => Self::Unknown,
        }
    }

    /// Get user-friendly message
    pub fn message(&self) -> &'static str {
        match self {
            Self::GenericDecline => "Your card was declined. Please try another card.",
            Self::InsufficientFunds => "Your card has insufficient funds.",
            Self::CvvFailure => "The security code is incorrect.",
            Self::AddressVerificationFailure => {
                "The billing address does not match the card. Please check it and try again."
            }
            Self::ExpiredCard => "Your card has expired.",
            Self::InvalidExpiration => "The expiration date is invalid.",
            Self::CardNotSupported => "This card type is not accepted. Please use a different card.",
            Self::Fraudulent => {
                "The payment could not be completed. Please contact your bank or use a different payment method."
            }
            Self::InstrumentDeclined => {
                "Your PayPal funding source was declined. Please choose another funding source."
            }
            Self::Unknown => "Your payment was declined. Please try a different payment method.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decline_code_parsing() {
        assert_eq!(DeclineCode::parse("CARD_DECLINED"), DeclineCode::GenericDecline);
        assert_eq!(
            DeclineCode::parse("insufficient_funds"),
            DeclineCode::InsufficientFunds
        );
        assert_eq!(
            DeclineCode::parse("INSTRUMENT_DECLINED"),
            DeclineCode::InstrumentDeclined
        );
        assert_eq!(DeclineCode::parse("SOMETHING_NEW"), DeclineCode::Unknown);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(
            PaymentError::Timeout {
                provider: ProviderId::Square
            }
            .is_retryable()
        );
        assert!(
            PaymentError::Upstream {
                provider: ProviderId::PayPal,
                status: 503,
                message: "unavailable".into(),
            }
            .is_retryable()
        );
        assert!(
            !PaymentError::Upstream {
                provider: ProviderId::PayPal,
                status: 400,
                message: "bad request".into(),
            }
            .is_retryable()
        );
        assert!(
            !PaymentError::InvalidSignature {
                provider: ProviderId::Square
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_provider_identity_attached() {
        let err = PaymentError::Network {
            provider: ProviderId::PayPal,
            message: "connection reset".into(),
        };
        assert_eq!(err.provider(), Some(ProviderId::PayPal));
        assert_eq!(PaymentError::NoProviderAvailable.provider(), None);
    }

    #[test]
    fn test_user_message_hides_provider_text() {
        let err = PaymentError::Upstream {
            provider: ProviderId::Square,
            status: 500,
            message: "INTERNAL_SERVER_ERROR: stack trace".into(),
        };
        assert!(!err.user_message().contains("stack trace"));
        assert!(err.user_message().contains("different payment method"));
    }
}
