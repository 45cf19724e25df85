//! Token amounts in atomic units.
//!
//! Payers think in human decimals (`"2.50"` USDC); contracts think in the
//! token's smallest unit (`2500000`). [`parse_units`] converts between the two
//! at a token's decimal precision, and [`TokenAmount`] carries the result as a
//! decimal string on the wire.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use alloy_primitives::U256;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

static DECIMAL_AMOUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\d+(?:\.\d*)?|\.\d+)$").expect("decimal amount pattern is valid")
});

/// Errors from converting a human decimal amount into atomic units.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountError {
    /// The input was empty or whitespace.
    #[error("amount is empty")]
    Empty,
    /// The input is not a plain non-negative decimal number.
    #[error("amount `{0}` is not a non-negative decimal number")]
    Malformed(String),
    /// The input has more fractional digits than the token supports.
    #[error("amount `{amount}` has more than {decimals} fractional digits")]
    TooPrecise {
        /// The rejected input.
        amount: String,
        /// The token's decimal count.
        decimals: u8,
    },
    /// The atomic value does not fit in 256 bits.
    #[error("amount `{0}` overflows uint256")]
    Overflow(String),
}

/// Converts a human decimal string into atomic units at `decimals` precision.
///
/// Trailing fractional zeros are ignored, so `"2.50"` is accepted for a token
/// with a single decimal.
///
/// # Errors
///
/// Returns [`AmountError`] if the string is not a non-negative decimal, has
/// more fractional digits than `decimals`, or overflows `uint256`.
pub fn parse_units(amount: &str, decimals: u8) -> Result<U256, AmountError> {
    let trimmed = amount.trim();
    if trimmed.is_empty() {
        return Err(AmountError::Empty);
    }
    if !DECIMAL_AMOUNT.is_match(trimmed) {
        return Err(AmountError::Malformed(trimmed.to_owned()));
    }
    let value = Decimal::from_str_exact(trimmed)
        .map_err(|_| AmountError::Malformed(trimmed.to_owned()))?
        .normalize();
    let scale = value.scale();
    if scale > u32::from(decimals) {
        return Err(AmountError::TooPrecise {
            amount: trimmed.to_owned(),
            decimals,
        });
    }
    let mantissa = u128::try_from(value.mantissa())
        .map_err(|_| AmountError::Malformed(trimmed.to_owned()))?;
    let exponent = U256::from(u32::from(decimals) - scale);
    U256::from(10u8)
        .checked_pow(exponent)
        .and_then(|factor| U256::from(mantissa).checked_mul(factor))
        .ok_or_else(|| AmountError::Overflow(trimmed.to_owned()))
}

/// An amount in a token's smallest unit.
///
/// Serialized as a decimal string; `uint256` values routinely exceed the
/// 53-bit integer range that JSON consumers can represent exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TokenAmount(pub U256);

impl TokenAmount {
    /// Returns the inner `U256`.
    #[must_use]
    pub const fn inner(&self) -> U256 {
        self.0
    }
}

impl From<U256> for TokenAmount {
    fn from(value: U256) -> Self {
        Self(value)
    }
}

impl From<TokenAmount> for U256 {
    fn from(value: TokenAmount) -> Self {
        value.0
    }
}

impl From<u128> for TokenAmount {
    fn from(value: u128) -> Self {
        Self(U256::from(value))
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TokenAmount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(AmountError::Empty);
        }
        if !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AmountError::Malformed(s.to_owned()));
        }
        U256::from_str_radix(s, 10)
            .map(Self)
            .map_err(|_| AmountError::Overflow(s.to_owned()))
    }
}

impl Serialize for TokenAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units_six_decimals() {
        assert_eq!(parse_units("2.50", 6).unwrap(), U256::from(2_500_000u64));
        assert_eq!(parse_units("1", 6).unwrap(), U256::from(1_000_000u64));
        assert_eq!(parse_units("0.000001", 6).unwrap(), U256::from(1u64));
        assert_eq!(parse_units(".5", 6).unwrap(), U256::from(500_000u64));
        assert_eq!(parse_units("0", 6).unwrap(), U256::ZERO);
    }

    #[test]
    fn test_parse_units_ignores_trailing_zeros() {
        assert_eq!(parse_units("2.50", 1).unwrap(), U256::from(25u64));
    }

    #[test]
    fn test_parse_units_rejects_excess_precision() {
        assert_eq!(
            parse_units("0.0000001", 6),
            Err(AmountError::TooPrecise {
                amount: "0.0000001".into(),
                decimals: 6
            })
        );
    }

    #[test]
    fn test_parse_units_rejects_garbage() {
        assert_eq!(parse_units("", 6), Err(AmountError::Empty));
        assert!(matches!(parse_units("-1", 6), Err(AmountError::Malformed(_))));
        assert!(matches!(parse_units("1e6", 6), Err(AmountError::Malformed(_))));
        assert!(matches!(parse_units("1,5", 6), Err(AmountError::Malformed(_))));
        assert!(matches!(parse_units("abc", 6), Err(AmountError::Malformed(_))));
    }

    #[test]
    fn test_parse_units_eighteen_decimals() {
        let wei = parse_units("1.5", 18).unwrap();
        assert_eq!(wei, U256::from(1_500_000_000_000_000_000u128));
    }

    #[test]
    fn test_token_amount_wire_is_decimal_string() {
        let big = TokenAmount(U256::MAX);
        let json = serde_json::to_string(&big).unwrap();
        assert_eq!(json, format!("\"{}\"", U256::MAX));
        let back: TokenAmount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, big);
    }

    #[test]
    fn test_token_amount_rejects_hex_and_numbers() {
        assert!(serde_json::from_str::<TokenAmount>("\"0x10\"").is_err());
        assert!(serde_json::from_str::<TokenAmount>("10").is_err());
    }
}
