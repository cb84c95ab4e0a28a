//! Money and currency types

use crate::error::{PaymentError, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Currency codes (ISO 4217)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    USD,
    DOP,
    EUR,
    GBP,
    CAD,
    MXN,
    JPY,
}

impl Currency {
    /// Get currency code string
    pub fn code(&self) -> &'static str {
        match self {
            Self::USD => "USD",
            Self::DOP => "DOP",
            Self::EUR => "EUR",
            Self::GBP => "GBP",
            Self::CAD => "CAD",
            Self::MXN => "MXN",
            Self::JPY => "JPY",
        }
    }

    /// Get currency symbol
    ///
    /// Dollar currencies carry a country prefix so a Dominican customer never
    /// confuses pesos with US dollars on the same page.
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::USD => "US$",
            Self::DOP => "RD$",
            Self::CAD => "CA$",
            Self::MXN => "MX$",
            Self::EUR => "€",
            Self::GBP => "£",
            Self::JPY => "¥",
        }
    }

    /// Get decimal places (0 for zero-decimal currencies)
    pub fn decimals(&self) -> u32 {
        match self {
            Self::JPY => 0,
            _ => 2,
        }
    }

    /// Is a zero-decimal currency
    pub fn is_zero_decimal(&self) -> bool {
        self.decimals() == 0
    }

    /// Parse from string
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_uppercase().as_str() {
            "USD" => Some(Self::USD),
            "DOP" => Some(Self::DOP),
            "EUR" => Some(Self::EUR),
            "GBP" => Some(Self::GBP),
            "CAD" => Some(Self::CAD),
            "MXN" => Some(Self::MXN),
            "JPY" => Some(Self::JPY),
            _ => None,
        }
    }
}

impl Default for Currency {
    fn default() -> Self {
        Self::USD
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Money amount with currency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    /// Amount in smallest currency unit (cents, centavos, etc.)
    pub amount: i64,
    /// Currency
    pub currency: Currency,
}

impl Money {
    /// Create a new money amount from smallest unit
    pub fn new(amount: i64, currency: Currency) -> Self {
        Self { amount, currency }
    }

    /// Create from an amount in major units (e.g. `29.995` dollars).
    ///
    /// Rounds half-up (away from zero) to the currency's minor unit, so
    /// `29.995 USD` becomes `3000` cents and `29.994 USD` becomes `2999`.
    pub fn from_major(amount: Decimal, currency: Currency) -> Result<Self> {
        let rounded =
            amount.round_dp_with_strategy(currency.decimals(), RoundingStrategy::MidpointAwayFromZero);
        let amount = rounded
            .checked_mul(Decimal::from(10i64.pow(currency.decimals())))
            .and_then(|minor| minor.to_i64())
            .ok_or_else(|| PaymentError::InvalidAmount(format!("{} is out of range", amount)))?;
        Ok(Self { amount, currency })
    }

    /// Create USD amount from cents
    pub fn usd(cents: i64) -> Self {
        Self::new(cents, Currency::USD)
    }

    /// Create DOP amount from centavos
    pub fn dop(centavos: i64) -> Self {
        Self::new(centavos, Currency::DOP)
    }

    /// Get amount as decimal in major units
    pub fn to_decimal(&self) -> Decimal {
        Decimal::new(self.amount, self.currency.decimals())
    }

    /// Major-unit string without symbol, e.g. `"29.99"` (the shape wallet APIs expect)
    pub fn to_major_string(&self) -> String {
        format!(
            "{:.prec$}",
            self.to_decimal(),
            prec = self.currency.decimals() as usize
        )
    }

    /// Format for display, e.g. `US$29.99`
    pub fn format(&self) -> String {
        format!("{}{}", self.currency.symbol(), self.to_major_string())
    }

    /// Format with thousands separators, e.g. `RD$5,000.00`
    pub fn format_grouped(&self) -> String {
        let plain = self.abs().to_major_string();
        let (int_part, frac_part) = match plain.split_once('.') {
            Some((i, f)) => (i, Some(f)),
            None => (plain.as_str(), None),
        };

        let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
        for (i, ch) in int_part.chars().enumerate() {
            if i > 0 && (int_part.len() - i) % 3 == 0 {
                grouped.push(',');
            }
            grouped.push(ch);
        }

        let sign = if self.is_negative() { "-" } else { "" };
        match frac_part {
            Some(frac) => format!("{}{}{}.{}", sign, self.currency.symbol(), grouped, frac),
            None => format!("{}{}{}", sign, self.currency.symbol(), grouped),
        }
    }

    /// Check if zero
    pub fn is_zero(&self) -> bool {
        self.amount == 0
    }

    /// Check if negative
    pub fn is_negative(&self) -> bool {
        self.amount < 0
    }

    /// Absolute value
    pub fn abs(&self) -> Self {
        Self {
            amount: self.amount.abs(),
            currency: self.currency,
        }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_money_creation() {
        let money = Money::usd(2999);
        assert_eq!(money.amount, 2999);
        assert_eq!(money.currency, Currency::USD);
    }

    #[test]
    fn test_from_major_rounds_half_up() {
        assert_eq!(Money::from_major(dec("29.99"), Currency::USD).unwrap().amount, 2999);
        assert_eq!(Money::from_major(dec("29.995"), Currency::USD).unwrap().amount, 3000);
        assert_eq!(Money::from_major(dec("29.994"), Currency::USD).unwrap().amount, 2999);
        // Not bankers' rounding: 0.125 goes up, not to the even 0.12
        assert_eq!(Money::from_major(dec("0.125"), Currency::DOP).unwrap().amount, 13);
        assert_eq!(Money::from_major(dec("100"), Currency::USD).unwrap().amount, 10000);
    }

    #[test]
    fn test_from_major_zero_decimal_currency() {
        assert_eq!(Money::from_major(dec("1000.5"), Currency::JPY).unwrap().amount, 1001);
    }

    #[test]
    fn test_from_major_out_of_range() {
        let huge = Decimal::MAX;
        assert!(matches!(
            Money::from_major(huge, Currency::USD),
            Err(PaymentError::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_money_format() {
        assert_eq!(Money::usd(2999).format(), "US$29.99");
        assert_eq!(Money::usd(2999).to_major_string(), "29.99");
        assert_eq!(Money::new(1000, Currency::JPY).format(), "¥1000");
    }

    #[test]
    fn test_format_grouped() {
        assert_eq!(Money::dop(500_000).format_grouped(), "RD$5,000.00");
        assert_eq!(Money::usd(10_000).format_grouped(), "US$100.00");
        assert_eq!(Money::dop(123_456_789).format_grouped(), "RD$1,234,567.89");
        assert_eq!(Money::usd(-150_000).format_grouped(), "-US$1,500.00");
    }

    #[test]
    fn test_currency() {
        assert_eq!(Currency::DOP.symbol(), "RD$");
        assert_eq!(Currency::from_code(" dop "), Some(Currency::DOP));
        assert_eq!(Currency::from_code("XYZ"), None);
        assert!(Currency::JPY.is_zero_decimal());
    }
}
