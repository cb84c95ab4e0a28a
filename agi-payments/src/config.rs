//! Gateway configuration.
//!
//! Loaded from the process environment (after reading `.env` with dotenvy) or
//! from a TOML file. A provider section is only present when its credentials
//! are; the manager skips providers without one.

use crate::crypto::DetailsCipher;
use crate::money::Currency;
use crate::types::ProviderId;
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

/// Default outbound request timeout
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default webhook listener address
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing configuration value: {0}")]
    Missing(String),

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Provider API environment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Sandbox,
    Production,
}

impl Environment {
    /// Parse from string (`sandbox`, `production`, `live`)
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "sandbox" | "test" => Some(Self::Sandbox),
            "production" | "live" => Some(Self::Production),
            _ => None,
        }
    }
}

/// Card processor (Square) settings
#[derive(Debug, Clone, Deserialize)]
pub struct SquareConfig {
    #[serde(deserialize_with = "secret")]
    pub access_token: SecretString,
    pub location_id: String,
    #[serde(default)]
    pub environment: Environment,
    /// Key used to sign webhook notifications
    #[serde(default, deserialize_with = "optional_secret")]
    pub webhook_signature_key: Option<SecretString>,
    /// Notification URL registered with Square; part of the signed message
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// API base URL override
    #[serde(default)]
    pub base_url: Option<String>,
}

impl SquareConfig {
    pub fn new(access_token: impl Into<String>, location_id: impl Into<String>) -> Self {
        Self {
            access_token: SecretString::from(access_token.into()),
            location_id: location_id.into(),
            environment: Environment::Sandbox,
            webhook_signature_key: None,
            webhook_url: None,
            base_url: None,
        }
    }

    /// With webhook signature key and notification URL
    pub fn webhook(mut self, signature_key: impl Into<String>, url: Option<String>) -> Self {
        self.webhook_signature_key = Some(SecretString::from(signature_key.into()));
        self.webhook_url = url;
        self
    }

    /// With API base URL
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }
}

/// Wallet (PayPal) settings
#[derive(Debug, Clone, Deserialize)]
pub struct PayPalConfig {
    pub client_id: String,
    #[serde(deserialize_with = "secret")]
    pub client_secret: SecretString,
    #[serde(default)]
    pub environment: Environment,
    /// Webhook ID assigned by PayPal; required to verify notifications
    #[serde(default)]
    pub webhook_id: Option<String>,
    /// API base URL override
    #[serde(default)]
    pub base_url: Option<String>,
}

impl PayPalConfig {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: SecretString::from(client_secret.into()),
            environment: Environment::Sandbox,
            webhook_id: None,
            base_url: None,
        }
    }

    /// With webhook ID
    pub fn webhook_id(mut self, id: impl Into<String>) -> Self {
        self.webhook_id = Some(id.into());
        self
    }

    /// With API base URL
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }
}

/// Bank account customers deposit into
#[derive(Debug, Clone, Deserialize)]
pub struct BankAccount {
    pub bank_name: String,
    /// Full account number; only its masked form leaves the adapter
    pub account_number: String,
    pub account_holder: String,
    pub tax_id: String,
    pub currency: Currency,
    #[serde(default)]
    pub account_type: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl BankAccount {
    pub fn new(
        bank_name: impl Into<String>,
        account_number: impl Into<String>,
        account_holder: impl Into<String>,
        tax_id: impl Into<String>,
        currency: Currency,
    ) -> Self {
        Self {
            bank_name: bank_name.into(),
            account_number: account_number.into(),
            account_holder: account_holder.into(),
            tax_id: tax_id.into(),
            currency,
            account_type: None,
            active: true,
        }
    }
}

/// Full gateway configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentsConfig {
    #[serde(default)]
    pub square: Option<SquareConfig>,
    #[serde(default)]
    pub paypal: Option<PayPalConfig>,
    #[serde(default)]
    pub bank_accounts: Vec<BankAccount>,
    #[serde(default = "default_timeout")]
    pub request_timeout_secs: u64,
    /// Base64 AES-256 key for sealing payment method details
    #[serde(default, deserialize_with = "optional_secret")]
    pub encryption_key: Option<SecretString>,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Plan ID overrides: provider -> tier -> provider plan ID
    #[serde(default)]
    pub plans: HashMap<String, HashMap<String, String>>,
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            square: None,
            paypal: None,
            bank_accounts: Vec::new(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            encryption_key: None,
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            plans: HashMap::new(),
        }
    }
}

impl PaymentsConfig {
    /// Load from `.env` (if present) and the process environment
    pub fn from_env() -> ConfigResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let square = match (get("SQUARE_ACCESS_TOKEN"), get("SQUARE_LOCATION_ID")) {
            (Some(token), Some(location)) => Some(SquareConfig {
                access_token: SecretString::from(token),
                location_id: location,
                environment: parse_environment("SQUARE_ENVIRONMENT", get("SQUARE_ENVIRONMENT"))?,
                webhook_signature_key: get("SQUARE_WEBHOOK_SIGNATURE_KEY").map(SecretString::from),
                webhook_url: get("SQUARE_WEBHOOK_URL"),
                base_url: get("SQUARE_BASE_URL"),
            }),
            (None, None) => None,
            _ => {
                warn!("Square credentials incomplete; SQUARE_ACCESS_TOKEN and SQUARE_LOCATION_ID are both required");
                None
            }
        };

        let paypal = match (get("PAYPAL_CLIENT_ID"), get("PAYPAL_CLIENT_SECRET")) {
            (Some(client_id), Some(secret)) => Some(PayPalConfig {
                client_id,
                client_secret: SecretString::from(secret),
                environment: parse_environment("PAYPAL_ENVIRONMENT", get("PAYPAL_ENVIRONMENT"))?,
                webhook_id: get("PAYPAL_WEBHOOK_ID"),
                base_url: get("PAYPAL_BASE_URL"),
            }),
            (None, None) => None,
            _ => {
                warn!("PayPal credentials incomplete; PAYPAL_CLIENT_ID and PAYPAL_CLIENT_SECRET are both required");
                None
            }
        };

        let bank_accounts = match get("BANK_ACCOUNTS") {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| ConfigError::Parse(format!("BANK_ACCOUNTS: {}", e)))?,
            None => Vec::new(),
        };

        let request_timeout_secs = match get("PAYMENTS_REQUEST_TIMEOUT_SECS") {
            Some(raw) => raw.parse().map_err(|e| ConfigError::Invalid {
                key: "PAYMENTS_REQUEST_TIMEOUT_SECS".into(),
                message: format!("{}", e),
            })?,
            None => DEFAULT_REQUEST_TIMEOUT_SECS,
        };

        let plans = match get("PAYMENTS_PLANS") {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| ConfigError::Parse(format!("PAYMENTS_PLANS: {}", e)))?,
            None => HashMap::new(),
        };

        let config = Self {
            square,
            paypal,
            bank_accounts,
            request_timeout_secs,
            encryption_key: get("PAYMENTS_ENCRYPTION_KEY").map(SecretString::from),
            bind_addr: get("PAYMENTS_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            plans,
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::Parse(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file
    pub fn load_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Check values that deserialization alone cannot
    pub fn validate(&self) -> ConfigResult<()> {
        if self.request_timeout_secs == 0 {
            return Err(invalid("request_timeout_secs", "must be greater than zero"));
        }

        for (index, account) in self.bank_accounts.iter().enumerate() {
            let fields = [
                ("bank_name", &account.bank_name),
                ("account_number", &account.account_number),
                ("account_holder", &account.account_holder),
                ("tax_id", &account.tax_id),
            ];
            for (name, value) in fields {
                if value.trim().is_empty() {
                    return Err(invalid(&format!("bank_accounts[{}].{}", index, name), "must not be empty"));
                }
            }
        }

        if let Some(key) = &self.encryption_key {
            DetailsCipher::from_base64(key)
                .map_err(|e| invalid("encryption_key", &e.to_string()))?;
        }

        for (provider, tiers) in &self.plans {
            if ProviderId::parse(provider).is_none() {
                return Err(invalid("plans", &format!("unknown provider {}", provider)));
            }
            if tiers.values().any(|plan| plan.trim().is_empty()) {
                return Err(invalid("plans", &format!("empty plan ID for {}", provider)));
            }
        }

        Ok(())
    }

    /// Active accounts, in configured order
    pub fn active_bank_accounts(&self) -> Vec<BankAccount> {
        self.bank_accounts.iter().filter(|a| a.active).cloned().collect()
    }

    /// Plan overrides keyed by provider
    pub fn plan_overrides(&self) -> HashMap<ProviderId, HashMap<String, String>> {
        self.plans
            .iter()
            .filter_map(|(provider, tiers)| ProviderId::parse(provider).map(|id| (id, tiers.clone())))
            .collect()
    }
}

fn parse_environment(key: &str, value: Option<String>) -> ConfigResult<Environment> {
    match value {
        None => Ok(Environment::Sandbox),
        Some(raw) => Environment::parse(&raw).ok_or_else(|| ConfigError::Invalid {
            key: key.to_string(),
            message: format!("expected sandbox or production, got {}", raw),
        }),
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_bind_addr() -> String {
    DEFAULT_BIND_ADDR.to_string()
}

fn secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::from)
}

fn optional_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::from))
}
