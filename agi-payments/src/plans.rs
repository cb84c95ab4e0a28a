//! Internal plan tiers and their provider plan identifiers

use crate::error::{PaymentError, Result};
use crate::types::ProviderId;
use std::collections::HashMap;

/// Internal tiers offered to customers
pub const TIERS: [&str; 3] = ["starter", "professional", "enterprise"];

const SQUARE_PLANS: [(&str, &str); 3] = [
    ("starter", "AGI_STARTER_MONTHLY"),
    ("professional", "AGI_PROFESSIONAL_MONTHLY"),
    ("enterprise", "AGI_ENTERPRISE_MONTHLY"),
];

const PAYPAL_PLANS: [(&str, &str); 3] = [
    ("starter", "P-AGI-STARTER-MONTHLY"),
    ("professional", "P-AGI-PROFESSIONAL-MONTHLY"),
    ("enterprise", "P-AGI-ENTERPRISE-MONTHLY"),
];

/// Bank deposit subscriptions are bookkeeping only; the tier is the plan
const BANK_DEPOSIT_PLANS: [(&str, &str); 3] = [
    ("starter", "starter"),
    ("professional", "professional"),
    ("enterprise", "enterprise"),
];

/// Tier to provider plan ID mapping, static defaults plus configured overrides
#[derive(Debug, Clone, Default)]
pub struct PlanCatalog {
    overrides: HashMap<ProviderId, HashMap<String, String>>,
}

impl PlanCatalog {
    pub fn new(overrides: HashMap<ProviderId, HashMap<String, String>>) -> Self {
        Self { overrides }
    }

    /// Provider plan ID for an internal tier
    pub fn resolve(&self, provider: ProviderId, tier: &str) -> Result<String> {
        let tier = tier.trim().to_lowercase();
        if !TIERS.contains(&tier.as_str()) {
            return Err(PaymentError::Validation(format!("unknown plan tier: {}", tier)));
        }

        if let Some(plan) = self.overrides.get(&provider).and_then(|t| t.get(&tier)) {
            return Ok(plan.clone());
        }

        let table = match provider {
            ProviderId::Square => &SQUARE_PLANS,
            ProviderId::PayPal => &PAYPAL_PLANS,
            ProviderId::BankDeposit => &BANK_DEPOSIT_PLANS,
        };
        table
            .iter()
            .find(|(name, _)| *name == tier)
            .map(|(_, plan)| plan.to_string())
            .ok_or_else(|| PaymentError::Validation(format!("no {} plan for tier {}", provider, tier)))
    }
}
