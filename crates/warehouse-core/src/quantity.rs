use std::fmt::{Display, Formatter};

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::WarehouseError;

const GRAMS_PER_KG: i64 = 1_000;

/// Mass in kilograms, held exactly as whole grams.
///
/// Serialized as a decimal string with three fractional digits (`"12.500"`).
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Quantity {
    grams: i64,
}

impl Quantity {
    pub const ZERO: Self = Self { grams: 0 };

    #[must_use]
    pub const fn from_grams(grams: i64) -> Self {
        Self { grams }
    }

    #[must_use]
    pub const fn from_kg(kg: i64) -> Self {
        Self {
            grams: kg * GRAMS_PER_KG,
        }
    }

    #[must_use]
    pub const fn grams(self) -> i64 {
        self.grams
    }

    #[must_use]
    pub const fn is_positive(self) -> bool {
        self.grams > 0
    }

    #[must_use]
    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.grams.checked_add(other.grams).map(Self::from_grams)
    }

    #[must_use]
    pub fn checked_sub(self, other: Self) -> Option<Self> {
        self.grams.checked_sub(other.grams).map(Self::from_grams)
    }

    /// Parses a non-negative kilogram amount with at most three decimals.
    ///
    /// # Errors
    /// Returns [`WarehouseError::Validation`] for signs, empty input, more
    /// than three fractional digits, or overflow.
    pub fn from_kg_str(raw: &str) -> Result<Self, WarehouseError> {
        let trimmed = raw.trim();
        let invalid = || WarehouseError::Validation(format!("invalid kilogram amount `{raw}`"));

        let (whole, fraction) = match trimmed.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (trimmed, ""),
        };
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid());
        }
        if fraction.len() > 3 {
            return Err(WarehouseError::Validation(format!(
                "kilogram amount `{raw}` has more than 3 decimals"
            )));
        }
        if !whole.chars().all(|c| c.is_ascii_digit())
            || !fraction.chars().all(|c| c.is_ascii_digit())
        {
            return Err(invalid());
        }

        let whole_kg: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        let mut fraction_grams: i64 = 0;
        for (position, digit) in fraction.chars().enumerate() {
            let value = i64::from(digit.to_digit(10).ok_or_else(invalid)?);
            let scale = match position {
                0 => 100,
                1 => 10,
                _ => 1,
            };
            fraction_grams += value * scale;
        }

        whole_kg
            .checked_mul(GRAMS_PER_KG)
            .and_then(|grams| grams.checked_add(fraction_grams))
            .map(Self::from_grams)
            .ok_or_else(invalid)
    }

    /// Converts a float kilogram amount, rounding to the nearest gram.
    ///
    /// # Errors
    /// Returns [`WarehouseError::Validation`] for non-finite or negative input.
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_kg_f64(kg: f64) -> Result<Self, WarehouseError> {
        if !kg.is_finite() || kg < 0.0 || kg > 9.0e12 {
            return Err(WarehouseError::Validation(format!(
                "invalid kilogram amount {kg}"
            )));
        }
        Ok(Self::from_grams((kg * 1_000.0).round() as i64))
    }
}

impl Display for Quantity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let sign = if self.grams < 0 { "-" } else { "" };
        let magnitude = self.grams.unsigned_abs();
        write!(f, "{sign}{}.{:03}", magnitude / 1_000, magnitude % 1_000)
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(QuantityVisitor)
    }
}

struct QuantityVisitor;

impl Visitor<'_> for QuantityVisitor {
    type Value = Quantity;

    fn expecting(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str("a kilogram amount as a decimal string or number")
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
        Quantity::from_kg_str(value).map_err(E::custom)
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
        i64::try_from(value)
            .ok()
            .and_then(|kg| kg.checked_mul(GRAMS_PER_KG))
            .map(Quantity::from_grams)
            .ok_or_else(|| E::custom(format!("kilogram amount {value} overflows")))
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
        if value < 0 {
            return Err(E::custom("kilogram amount MUST NOT be negative"));
        }
        value
            .checked_mul(GRAMS_PER_KG)
            .map(Quantity::from_grams)
            .ok_or_else(|| E::custom(format!("kilogram amount {value} overflows")))
    }

    fn visit_f64<E: de::Error>(self, value: f64) -> Result<Self::Value, E> {
        Quantity::from_kg_f64(value).map_err(E::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn parses_decimal_kilograms_exactly() {
        assert_eq!(must_ok(Quantity::from_kg_str("50")).grams(), 50_000);
        assert_eq!(must_ok(Quantity::from_kg_str("12.5")).grams(), 12_500);
        assert_eq!(must_ok(Quantity::from_kg_str("0.125")).grams(), 125);
        assert_eq!(must_ok(Quantity::from_kg_str(".5")).grams(), 500);
        assert!(Quantity::from_kg_str("1.2345").is_err());
        assert!(Quantity::from_kg_str("-3").is_err());
        assert!(Quantity::from_kg_str("").is_err());
        assert!(Quantity::from_kg_str("4kg").is_err());
    }

    #[test]
    fn displays_three_decimals() {
        assert_eq!(Quantity::from_grams(12_500).to_string(), "12.500");
        assert_eq!(Quantity::from_grams(7).to_string(), "0.007");
        assert_eq!(Quantity::from_kg(3).to_string(), "3.000");
    }

    #[test]
    fn serde_accepts_strings_and_numbers() {
        let from_str: Quantity = must_ok(serde_json::from_str("\"2.250\""));
        let from_int: Quantity = must_ok(serde_json::from_str("2"));
        let from_float: Quantity = must_ok(serde_json::from_str("2.25"));
        assert_eq!(from_str.grams(), 2_250);
        assert_eq!(from_int.grams(), 2_000);
        assert_eq!(from_float.grams(), 2_250);
        assert_eq!(must_ok(serde_json::to_string(&from_str)), "\"2.250\"");
    }
}
