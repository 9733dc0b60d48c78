//! Paylock - Fixed-Point Money
//!
//! All monetary values are carried as signed 128-bit integers denominated
//! in micro-units (six implied fractional digits). Arithmetic on balances
//! never touches floating point.

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Number of fractional digits carried by every [`Amount`].
pub const AMOUNT_SCALE: u32 = 6;

/// Micro-units per whole unit.
const UNIT: i128 = 1_000_000;

/// Maximum number of integer digits accepted on parse.
const MAX_INTEGER_DIGITS: usize = 20;

/// Largest representable value: 20 integer digits, all fractional digits set.
const MAX_MICROS: i128 = 100_000_000_000_000_000_000 * UNIT - 1;

/// Error produced when a decimal string cannot be read as an [`Amount`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid amount {input:?}: {reason}")]
pub struct ParseAmountError {
    /// The rejected input, verbatim.
    pub input: String,
    /// Why it was rejected.
    pub reason: &'static str,
}

impl ParseAmountError {
    fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_string(),
            reason,
        }
    }
}

/// A monetary amount in micro-units.
///
/// Parsing accepts plain decimal strings ("15", "15.00", "0.000001") with
/// at most 20 integer digits and 6 fractional digits. Display always
/// renders all six fractional digits ("15.000000"), which is also the
/// wire format used by the HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(i128);

impl Amount {
    /// The zero amount.
    pub const ZERO: Amount = Amount(0);

    /// The largest amount accepted anywhere in the engine.
    pub const MAX: Amount = Amount(MAX_MICROS);

    /// Build an amount from raw micro-units.
    pub const fn from_micros(micros: i128) -> Self {
        Amount(micros)
    }

    /// Build an amount from a whole number of units.
    pub const fn from_units(units: i64) -> Self {
        Amount(units as i128 * UNIT)
    }

    /// Raw micro-unit value.
    pub const fn micros(self) -> i128 {
        self.0
    }

    /// True when the value is strictly positive.
    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// True when the value is exactly zero.
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Checked subtraction; `None` when the result would be negative.
    pub fn checked_sub_non_negative(self, rhs: Amount) -> Option<Amount> {
        if rhs.0 > self.0 {
            None
        } else {
            Some(Amount(self.0 - rhs.0))
        }
    }
}

impl Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0 + rhs.0)
    }
}

impl AddAssign for Amount {
    fn add_assign(&mut self, rhs: Amount) {
        self.0 += rhs.0;
    }
}

impl Sub for Amount {
    type Output = Amount;

    fn sub(self, rhs: Amount) -> Amount {
        Amount(self.0 - rhs.0)
    }
}

impl SubAssign for Amount {
    fn sub_assign(&mut self, rhs: Amount) {
        self.0 -= rhs.0;
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let whole = abs / UNIT as u128;
        let frac = abs % UNIT as u128;
        write!(f, "{sign}{whole}.{frac:06}")
    }
}

impl FromStr for Amount {
    type Err = ParseAmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ParseAmountError::new(s, "empty"));
        }

        let (whole, frac) = match trimmed.split_once('.') {
            Some((w, f)) => (w, f),
            None => (trimmed, ""),
        };

        if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseAmountError::new(s, "malformed integer part"));
        }
        if whole.len() > MAX_INTEGER_DIGITS {
            return Err(ParseAmountError::new(s, "more than 20 integer digits"));
        }
        if frac.len() > AMOUNT_SCALE as usize || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseAmountError::new(s, "more than 6 fractional digits"));
        }

        let whole: i128 = whole
            .parse()
            .map_err(|_| ParseAmountError::new(s, "malformed integer part"))?;

        let mut frac_micros: i128 = 0;
        if !frac.is_empty() {
            frac_micros = frac
                .parse()
                .map_err(|_| ParseAmountError::new(s, "malformed fractional part"))?;
            frac_micros *= 10i128.pow(AMOUNT_SCALE - frac.len() as u32);
        }

        let micros = whole * UNIT + frac_micros;
        if micros > MAX_MICROS {
            return Err(ParseAmountError::new(s, "exceeds maximum amount"));
        }
        Ok(Amount(micros))
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_fractional_forms() {
        assert_eq!("15".parse::<Amount>().unwrap(), Amount::from_units(15));
        assert_eq!("15.00".parse::<Amount>().unwrap(), Amount::from_units(15));
        assert_eq!(
            "0.000001".parse::<Amount>().unwrap(),
            Amount::from_micros(1)
        );
        assert_eq!(
            "3.5".parse::<Amount>().unwrap(),
            Amount::from_micros(3_500_000)
        );
    }

    #[test]
    fn rejects_malformed_input() {
        for bad in ["", " ", "-1", "1.2345678", "abc", "1.2.3", "1e5", ".5"] {
            assert!(bad.parse::<Amount>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn rejects_more_than_twenty_integer_digits() {
        let too_big = "1".repeat(21);
        assert!(too_big.parse::<Amount>().is_err());
        let at_limit = "9".repeat(20);
        assert!(at_limit.parse::<Amount>().is_ok());
    }

    #[test]
    fn displays_all_six_fractional_digits() {
        assert_eq!(Amount::from_micros(3_500_000).to_string(), "3.500000");
        assert_eq!(Amount::from_units(15).to_string(), "15.000000");
        assert_eq!(Amount::ZERO.to_string(), "0.000000");
    }

    #[test]
    fn checked_subtraction_refuses_negative_results() {
        let five = Amount::from_units(5);
        let three = Amount::from_units(3);
        assert_eq!(five.checked_sub_non_negative(three), Some(Amount::from_units(2)));
        assert_eq!(three.checked_sub_non_negative(five), None);
    }

    #[test]
    fn serde_round_trips_as_string() {
        let amount = Amount::from_micros(6_500_000);
        let json = serde_json::to_string(&amount).unwrap();
        assert_eq!(json, "\"6.500000\"");
        let back: Amount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, amount);
    }
}
