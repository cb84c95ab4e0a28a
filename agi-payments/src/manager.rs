//! Provider registry and single entry point for payment operations.
//!
//! The manager only routes: it resolves the provider, enforces country
//! eligibility before any network call and maps plan tiers to provider plan
//! IDs. Adapter errors are passed through untouched so callers still see which
//! provider failed.

use crate::config::PaymentsConfig;
use crate::crypto::DetailsCipher;
use crate::eligibility;
use crate::error::{PaymentError, Result};
use crate::money::{Currency, Money};
use crate::plans::PlanCatalog;
use crate::provider::PaymentProvider;
use crate::providers::{BankDepositProvider, PayPalProvider, SquareProvider};
use crate::types::*;
use crate::webhook::WebhookResult;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Registry of initialized providers
pub struct PaymentManager {
    providers: BTreeMap<ProviderId, Arc<dyn PaymentProvider>>,
    plans: PlanCatalog,
}

impl PaymentManager {
    /// Build every provider whose credentials are configured.
    ///
    /// A provider that fails to build or initialize is logged and left out;
    /// this never fails as a whole.
    pub async fn initialize(config: &PaymentsConfig) -> Self {
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let cipher = config.encryption_key.as_ref().and_then(|key| {
            DetailsCipher::from_base64(key)
                .map_err(|e| warn!(error = %e, "Ignoring invalid payment method encryption key"))
                .ok()
        });

        let mut candidates: Vec<Result<Arc<dyn PaymentProvider>>> = Vec::new();

        if let Some(square) = &config.square {
            candidates.push(SquareProvider::new(square, timeout).map(|provider| {
                let provider = match &cipher {
                    Some(cipher) => provider.with_cipher(cipher.clone()),
                    None => provider,
                };
                Arc::new(provider) as Arc<dyn PaymentProvider>
            }));
        } else {
            debug!(provider = %ProviderId::Square, "Not configured");
        }

        if let Some(paypal) = &config.paypal {
            candidates.push(
                PayPalProvider::new(paypal, timeout)
                    .map(|provider| Arc::new(provider) as Arc<dyn PaymentProvider>),
            );
        } else {
            debug!(provider = %ProviderId::PayPal, "Not configured");
        }

        let accounts = config.active_bank_accounts();
        if accounts.is_empty() {
            debug!(provider = %ProviderId::BankDeposit, "No active bank account configured");
        } else {
            candidates.push(Ok(Arc::new(BankDepositProvider::new(accounts))));
        }

        let mut providers = Vec::new();
        for candidate in candidates {
            let provider = match candidate {
                Ok(provider) => provider,
                Err(err) => {
                    warn!(provider = ?err.provider(), error = %err, "Payment provider could not be built");
                    continue;
                }
            };
            match provider.initialize().await {
                Ok(()) => providers.push(provider),
                Err(err) => {
                    warn!(provider = %provider.id(), error = %err, "Payment provider disabled");
                }
            }
        }

        let manager = Self::with_providers(providers).with_plans(PlanCatalog::new(config.plan_overrides()));
        if manager.is_empty() {
            warn!("No payment provider is available");
        } else {
            info!(providers = ?manager.available_providers(), "Payment providers activated");
        }
        manager
    }

    /// Registry from already built providers
    pub fn with_providers(providers: Vec<Arc<dyn PaymentProvider>>) -> Self {
        Self {
            providers: providers.into_iter().map(|p| (p.id(), p)).collect(),
            plans: PlanCatalog::default(),
        }
    }

    /// Replace the plan catalog
    pub fn with_plans(mut self, plans: PlanCatalog) -> Self {
        self.plans = plans;
        self
    }

    /// Registered provider
    pub fn provider(&self, id: ProviderId) -> Result<Arc<dyn PaymentProvider>> {
        self.providers
            .get(&id)
            .cloned()
            .ok_or(PaymentError::ProviderUnavailable(id))
    }

    /// Registered provider by identifier
    pub fn provider_by_name(&self, name: &str) -> Result<Arc<dyn PaymentProvider>> {
        let id = ProviderId::parse(name).ok_or_else(|| PaymentError::UnknownProvider(name.to_string()))?;
        self.provider(id)
    }

    /// Registered providers in registry order
    pub fn available_providers(&self) -> Vec<ProviderId> {
        self.providers.keys().copied().collect()
    }

    /// Whether no provider is registered
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Registered providers permitted for the country, most preferred first
    pub fn eligible_providers(&self, country: Option<&str>, currency: Currency) -> Vec<ProviderId> {
        eligibility::permitted_providers(country, currency)
            .into_iter()
            .filter(|id| self.providers.contains_key(id))
            .collect()
    }

    /// Resolve a provider, rejecting it up front when the country forbids it
    fn eligible(&self, id: ProviderId, country: Option<&str>) -> Result<Arc<dyn PaymentProvider>> {
        let provider = self.provider(id)?;
        if country.is_some() && !eligibility::is_permitted(id, country) {
            return Err(PaymentError::NotPermitted {
                provider: id,
                country: eligibility::normalize_country(country).unwrap_or_default(),
            });
        }
        Ok(provider)
    }

    /// Start a purchase with the given provider
    pub async fn create_checkout(
        &self,
        provider: ProviderId,
        request: CheckoutRequest,
    ) -> Result<CheckoutSession> {
        let adapter = self.eligible(provider, request.country.as_deref())?;
        request.validate()?;
        debug!(provider = %provider, customer_id = %request.customer_id, "Creating checkout");
        adapter.create_checkout(request).await
    }

    /// Finalize a payment with the given provider
    pub async fn process_payment(
        &self,
        provider: ProviderId,
        request: PaymentRequest,
    ) -> Result<PaymentResult> {
        let adapter = self.eligible(provider, request.country.as_deref())?;
        request.validate()?;
        let result = adapter.process_payment(request).await?;
        if !result.is_success() {
            info!(
                provider = %provider,
                payment_id = %result.payment_id,
                status = ?result.status,
                "Payment not completed"
            );
        }
        Ok(result)
    }

    /// Verify and parse a notification for the given provider
    pub async fn handle_webhook(
        &self,
        provider: ProviderId,
        payload: &[u8],
        signature: &str,
    ) -> Result<WebhookResult> {
        self.provider(provider)?
            .handle_webhook(payload, signature)
            .await
    }

    /// Current status of a payment
    pub async fn payment_status(&self, provider: ProviderId, payment_id: &str) -> Result<PaymentStatus> {
        self.provider(provider)?.payment_status(payment_id).await
    }

    /// Subscribe a customer to an internal plan tier.
    ///
    /// `request.plan_id` is replaced by the provider plan mapped from `tier`.
    pub async fn create_subscription(
        &self,
        provider: ProviderId,
        tier: &str,
        mut request: SubscriptionRequest,
    ) -> Result<Subscription> {
        let adapter = self.eligible(provider, request.country.as_deref())?;
        request.plan_id = self.plans.resolve(provider, tier)?;
        adapter.create_subscription(request).await
    }

    /// Cancel a provider subscription
    pub async fn cancel_subscription(&self, provider: ProviderId, subscription_id: &str) -> Result<bool> {
        self.provider(provider)?
            .cancel_subscription(subscription_id)
            .await
    }

    /// Refund a payment, fully when `amount` is `None`
    pub async fn refund(
        &self,
        provider: ProviderId,
        payment_id: &str,
        amount: Option<Money>,
    ) -> Result<RefundResult> {
        if let Some(amount) = &amount {
            if amount.amount <= 0 {
                return Err(PaymentError::InvalidAmount(format!(
                    "refund amount must be positive, got {}",
                    amount
                )));
            }
        }
        self.provider(provider)?.refund(payment_id, amount).await
    }

    /// Pick the provider to offer first.
    ///
    /// Preference order: the caller's preferred provider, the country default,
    /// bank deposit for DOP payments from the Dominican Republic, then the
    /// first registered provider.
    pub fn recommend_payment_method(
        &self,
        amount: Decimal,
        currency: Currency,
        country: Option<&str>,
        preferred: Option<ProviderId>,
    ) -> Result<ProviderId> {
        if self.providers.is_empty() {
            return Err(PaymentError::NoProviderAvailable);
        }
        if amount <= Decimal::ZERO {
            return Err(PaymentError::Validation(format!(
                "amount must be positive, got {}",
                amount
            )));
        }

        if let Some(preferred) = preferred.filter(|p| self.providers.contains_key(p)) {
            return Ok(preferred);
        }

        let default = eligibility::default_provider(country);
        if self.providers.contains_key(&default) {
            return Ok(default);
        }

        let dominican = eligibility::normalize_country(country).as_deref() == Some("DO");
        if dominican && currency == Currency::DOP && self.providers.contains_key(&ProviderId::BankDeposit) {
            return Ok(ProviderId::BankDeposit);
        }

        self.providers
            .keys()
            .next()
            .copied()
            .ok_or(PaymentError::NoProviderAvailable)
    }
}
