//! Amount type for handling monetary values.
//!
//! This module provides the `Amount` type which wraps `Decimal`. It parses values that may or may
//! not include a dollar sign and commas (as typed by a user), and it is stored in documents as a
//! plain decimal string so that no precision is lost in JSON.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::error::Error;
use std::fmt;
use std::fmt::{Debug, Display, Formatter};
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use std::str::FromStr;

/// The number of decimal places money is rounded to.
pub const CURRENCY_DP: u32 = 2;

/// Represents a monetary amount.
///
/// Equality and ordering are numeric, so `Amount::from_str("5")` equals
/// `Amount::from_str("$5.00")`.
///
/// # Examples
///
/// ```
/// # use monthly_ledger::model::Amount;
/// # use std::str::FromStr;
/// let amount = Amount::from_str("-$1,250.50").unwrap();
/// assert_eq!(amount, Amount::from_str("-1250.5").unwrap());
/// assert_eq!(amount.to_string(), "-1250.50");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount {
    value: Decimal,
}

impl Amount {
    pub const ZERO: Amount = Amount::new(Decimal::ZERO);

    /// Creates a new Amount from a Decimal value.
    pub const fn new(value: Decimal) -> Self {
        Self { value }
    }

    /// Creates an amount from a whole number of currency units.
    pub fn from_units(units: i64) -> Self {
        Self::new(Decimal::from(units))
    }

    /// Returns the underlying Decimal value.
    pub fn value(&self) -> Decimal {
        self.value
    }

    /// Returns true if the amount is zero.
    pub fn is_zero(&self) -> bool {
        self.value().is_zero()
    }

    /// Returns true if the amount is negative.
    pub fn is_negative(&self) -> bool {
        !self.is_zero() && self.value().is_sign_negative()
    }

    /// Rounds to currency precision, with midpoints rounded away from zero (half-up for positive
    /// amounts).
    pub fn round_currency(&self) -> Self {
        Self::new(
            self.value
                .round_dp_with_strategy(CURRENCY_DP, RoundingStrategy::MidpointAwayFromZero),
        )
    }

    /// Returns `percentage` percent of this amount, rounded to currency precision.
    pub fn percent(&self, percentage: Decimal) -> Option<Self> {
        let product = self.value.checked_mul(percentage)?;
        let value = product.checked_div(Decimal::ONE_HUNDRED)?;
        Some(Self::new(value).round_currency())
    }

    /// Addition that returns `None` on overflow.
    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.value.checked_add(other.value).map(Amount::new)
    }

    /// Subtraction that returns `None` on overflow.
    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.value.checked_sub(other.value).map(Amount::new)
    }

    /// Sums `amounts`, returning `None` on overflow.
    pub fn checked_sum<I>(amounts: I) -> Option<Amount>
    where
        I: IntoIterator<Item = Amount>,
    {
        amounts
            .into_iter()
            .try_fold(Amount::ZERO, |total, amount| total.checked_add(amount))
    }
}

/// An error that can occur when parsing strings into `Amount` values.
pub struct AmountError(rust_decimal::Error);

impl Debug for AmountError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl Display for AmountError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl std::error::Error for AmountError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.0)
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(Amount::default());
        }

        // "-$50.00", "$50.00", "-50.00" and "50.00" are all accepted
        let without_dollar = if let Some(after_minus) = trimmed.strip_prefix('-') {
            match after_minus.strip_prefix('$') {
                Some(after_dollar) => format!("-{after_dollar}"),
                None => trimmed.to_string(),
            }
        } else if let Some(after_dollar) = trimmed.strip_prefix('$') {
            after_dollar.to_string()
        } else {
            trimmed.to_string()
        };

        let without_commas = without_dollar.replace(',', "");
        let value = Decimal::from_str(&without_commas).map_err(AmountError)?;
        Ok(Amount::new(value))
    }
}

impl Display for Amount {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let value = self.round_currency().value();
        write!(f, "{value:.2}")
    }
}

impl Serialize for Amount {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.value.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Amount::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl From<Decimal> for Amount {
    fn from(value: Decimal) -> Self {
        Amount::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.value()
    }
}

impl Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Amount) -> Amount {
        Amount::new(self.value + rhs.value)
    }
}

impl Sub for Amount {
    type Output = Amount;

    fn sub(self, rhs: Amount) -> Amount {
        Amount::new(self.value - rhs.value)
    }
}

impl Neg for Amount {
    type Output = Amount;

    fn neg(self) -> Amount {
        Amount::new(-self.value)
    }
}

impl AddAssign for Amount {
    fn add_assign(&mut self, rhs: Amount) {
        self.value += rhs.value;
    }
}

impl SubAssign for Amount {
    fn sub_assign(&mut self, rhs: Amount) {
        self.value -= rhs.value;
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn amt(s: &str) -> Amount {
        Amount::from_str(s).unwrap()
    }

    #[test]
    fn test_parse_with_dollar_sign() {
        assert_eq!(amt("$50.00").value(), Decimal::from_str("50.00").unwrap());
    }

    #[test]
    fn test_parse_negative_with_dollar_sign() {
        assert_eq!(amt("-$50.00").value(), Decimal::from_str("-50.00").unwrap());
    }

    #[test]
    fn test_parse_empty_string() {
        assert_eq!(amt("   ").value(), Decimal::ZERO);
    }

    #[test]
    fn test_parse_with_commas() {
        assert_eq!(amt("$1,234,567.89").value(), Decimal::from_str("1234567.89").unwrap());
    }

    #[test]
    fn test_parse_garbage() {
        assert!(Amount::from_str("twelve").is_err());
    }

    #[test]
    fn test_display_pads_to_cents() {
        assert_eq!(amt("800").to_string(), "800.00");
        assert_eq!(amt("-0.5").to_string(), "-0.50");
    }

    #[test]
    fn test_serde_is_a_plain_decimal_string() {
        let json = serde_json::to_string(&amt("$1,000.10")).unwrap();
        assert_eq!(json, "\"1000.10\"");
        let back: Amount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, amt("1000.1"));
    }

    #[test]
    fn test_round_half_up() {
        assert_eq!(amt("2.345").round_currency(), amt("2.35"));
        assert_eq!(amt("2.344").round_currency(), amt("2.34"));
        assert_eq!(amt("-2.345").round_currency(), amt("-2.35"));
    }

    #[test]
    fn test_percent() {
        let income = amt("2000");
        assert_eq!(income.percent(Decimal::from(10)).unwrap(), amt("200.00"));
        let odd = amt("333.33");
        // 12.5% of 333.33 = 41.66625 -> 41.67
        assert_eq!(
            odd.percent(Decimal::from_str("12.5").unwrap()).unwrap(),
            amt("41.67")
        );
    }

    #[test]
    fn test_sum_and_ops() {
        let total = Amount::checked_sum([amt("1.10"), amt("2.20"), amt("-0.30")]).unwrap();
        assert_eq!(total, amt("3.00"));
        assert_eq!(amt("5") - amt("7"), amt("-2"));
        assert_eq!(-amt("5"), amt("-5"));
        assert!(amt("-1").is_negative());
        assert!(!amt("0").is_negative());
    }

    #[test]
    fn test_checked_overflow() {
        let max = Amount::new(Decimal::MAX);
        assert!(max.checked_add(amt("1")).is_none());
        assert!(amt("1").checked_add(amt("2")).is_some());
        assert!(Amount::checked_sum([max, max]).is_none());
        assert_eq!(Amount::checked_sum([]), Some(Amount::ZERO));
    }
}
