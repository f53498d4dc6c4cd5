//! Fixed-point money type.
//!
//! Amounts are rust_decimal values paired with an ISO 4217 currency code and
//! serialize as a decimal string plus code, so no binary float ever crosses a
//! service boundary.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("currency mismatch: {left} vs {right}")]
pub struct CurrencyMismatch {
    pub left: String,
    pub right: String,
}

/// An amount of money in a single currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub amount: Decimal,
    pub currency: String,
}

impl Money {
    pub fn new(amount: Decimal, currency: impl Into<String>) -> Self {
        Self {
            amount,
            currency: currency.into(),
        }
    }

    pub fn zero(currency: impl Into<String>) -> Self {
        Self::new(Decimal::ZERO, currency)
    }

    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    /// Add another amount of the same currency.
    pub fn add(&self, other: &Money) -> Result<Money, CurrencyMismatch> {
        if self.currency != other.currency {
            return Err(CurrencyMismatch {
                left: self.currency.clone(),
                right: other.currency.clone(),
            });
        }
        Ok(Money::new(self.amount + other.amount, self.currency.clone()))
    }

    /// Scale by a dimensionless factor such as a proration fraction.
    pub fn scale(&self, factor: Decimal) -> Money {
        Money::new(self.amount * factor, self.currency.clone())
    }

    /// Round to the given number of decimal places, banker's rounding.
    pub fn rounded(&self, dp: u32) -> Money {
        Money::new(self.amount.round_dp(dp), self.currency.clone())
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
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
    fn add_same_currency() {
        let a = Money::new(dec("10.50"), "USD");
        let b = Money::new(dec("0.25"), "USD");
        assert_eq!(a.add(&b).unwrap(), Money::new(dec("10.75"), "USD"));
    }

    #[test]
    fn add_rejects_mixed_currencies() {
        let a = Money::new(dec("10"), "USD");
        let b = Money::new(dec("10"), "EUR");
        let err = a.add(&b).unwrap_err();
        assert_eq!(err.left, "USD");
        assert_eq!(err.right, "EUR");
    }

    #[test]
    fn scale_keeps_exact_decimals() {
        let price = Money::new(dec("30"), "USD");
        let half = price.scale(dec("0.5"));
        assert_eq!(half.amount, dec("15"));
    }

    #[test]
    fn rounded_uses_bankers_rounding() {
        let m = Money::new(dec("2.345"), "USD");
        assert_eq!(m.rounded(2).amount, dec("2.34"));
        let m = Money::new(dec("2.355"), "USD");
        assert_eq!(m.rounded(2).amount, dec("2.36"));
    }

    #[test]
    fn serializes_amount_as_string() {
        let m = Money::new(dec("12.30"), "USD");
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["amount"], "12.30");
        assert_eq!(json["currency"], "USD");
    }
}
