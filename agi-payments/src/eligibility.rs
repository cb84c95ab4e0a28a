//! Country-based provider eligibility.
//!
//! Pure functions over a small rule table. Country codes are trimmed and
//! upper-cased; anything other than `DO` or `US` falls into the
//! international rule. A missing or empty country is treated as `US`.

use crate::money::Currency;
use crate::types::ProviderId;

/// Eligibility rule for one market
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EligibilityRule {
    /// Permitted providers, most preferred first
    pub permitted: &'static [ProviderId],
    /// Provider selected when the customer expresses no preference
    pub default: ProviderId,
    /// Payments settle only after a person confirms them
    pub manual_verification: bool,
}

const DOMINICAN_REPUBLIC: EligibilityRule = EligibilityRule {
    permitted: &[ProviderId::BankDeposit, ProviderId::PayPal],
    default: ProviderId::BankDeposit,
    manual_verification: true,
};

const UNITED_STATES: EligibilityRule = EligibilityRule {
    permitted: &[ProviderId::Square],
    default: ProviderId::Square,
    manual_verification: false,
};

const INTERNATIONAL: EligibilityRule = EligibilityRule {
    permitted: &[ProviderId::PayPal],
    default: ProviderId::PayPal,
    manual_verification: false,
};

/// Normalize a country code; `None` when absent or blank
pub fn normalize_country(country: Option<&str>) -> Option<String> {
    country
        .map(|c| c.trim().to_uppercase())
        .filter(|c| !c.is_empty())
}

/// Rule that applies to a country
pub fn rule_for(country: Option<&str>) -> EligibilityRule {
    match normalize_country(country).as_deref() {
        Some("DO") => DOMINICAN_REPUBLIC,
        Some("US") | None => UNITED_STATES,
        Some(_) => INTERNATIONAL,
    }
}

/// Permitted providers, most preferred first.
///
/// The currency is part of the signature so rules can depend on it later;
/// none currently do.
pub fn permitted_providers(country: Option<&str>, _currency: Currency) -> Vec<ProviderId> {
    rule_for(country).permitted.to_vec()
}

/// Provider selected when the customer has no preference
pub fn default_provider(country: Option<&str>) -> ProviderId {
    rule_for(country).default
}

/// Whether payments from this country need human confirmation
pub fn requires_manual_verification(country: Option<&str>) -> bool {
    rule_for(country).manual_verification
}

/// Whether a provider may be used for this country
pub fn is_permitted(provider: ProviderId, country: Option<&str>) -> bool {
    rule_for(country).permitted.contains(&provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dominican_republic() {
        assert_eq!(
            permitted_providers(Some("DO"), Currency::DOP),
            vec![ProviderId::BankDeposit, ProviderId::PayPal]
        );
        assert_eq!(default_provider(Some("DO")), ProviderId::BankDeposit);
        assert!(requires_manual_verification(Some("DO")));
        assert!(!is_permitted(ProviderId::Square, Some("DO")));
    }

    #[test]
    fn test_united_states_and_unspecified() {
        for country in [Some("US"), None, Some(""), Some("   ")] {
            assert_eq!(
                permitted_providers(country, Currency::USD),
                vec![ProviderId::Square]
            );
            assert_eq!(default_provider(country), ProviderId::Square);
            assert!(!requires_manual_verification(country));
        }
    }

    #[test]
    fn test_international_gets_wallet_only() {
        for country in ["MX", "ES", "GB", "XX", "USA", "DOM"] {
            assert_eq!(
                permitted_providers(Some(country), Currency::USD),
                vec![ProviderId::PayPal],
                "country {}",
                country
            );
            assert_eq!(default_provider(Some(country)), ProviderId::PayPal);
            assert!(!requires_manual_verification(Some(country)));
        }
    }

    #[test]
    fn test_country_is_normalized() {
        assert_eq!(default_provider(Some(" do ")), ProviderId::BankDeposit);
        assert_eq!(default_provider(Some("us")), ProviderId::Square);
        assert_eq!(normalize_country(Some(" mx")), Some("MX".to_string()));
    }

    #[test]
    fn test_currency_does_not_change_rules() {
        for currency in [Currency::USD, Currency::DOP, Currency::EUR] {
            assert_eq!(
                permitted_providers(Some("DO"), currency),
                vec![ProviderId::BankDeposit, ProviderId::PayPal]
            );
        }
    }
}
