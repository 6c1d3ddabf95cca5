//! Money codec: decimal text <-> integer minor units, currencies and rates.
//!
//! Amounts inside the engine are always `i64` minor units (cents). Text
//! amounts are parsed strictly: extra precision is rejected, never rounded.
//! Rounding happens in exactly one place, [`Rate::convert_minor`].

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of fractional digits carried by minor units.
pub const MINOR_DIGITS: usize = 2;

/// Number of fractional digits every [`Rate`] is normalized to.
pub const RATE_SCALE: u32 = 6;

/// Errors produced by the money codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("invalid amount")]
    InvalidAmount,

    #[error("amount has more than {MINOR_DIGITS} decimal places")]
    TooManyDecimals,

    #[error("amount out of range")]
    OutOfRange,

    #[error("invalid rate: {0}")]
    InvalidRate(String),
}

/// Parse a decimal amount such as `"-5.5"` or `"12.34"` into minor units.
///
/// Accepts an optional sign, a required integer part and an optional `.`
/// followed by at most two digits. Surrounding whitespace is ignored.
pub fn parse_minor(text: &str) -> Result<i64, AmountError> {
    let s = text.trim();
    let (negative, unsigned) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };

    let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AmountError::InvalidAmount);
    }
    if !frac_part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AmountError::InvalidAmount);
    }
    if frac_part.len() > MINOR_DIGITS {
        return Err(AmountError::TooManyDecimals);
    }

    let whole: i64 = int_part.parse().map_err(|_| AmountError::OutOfRange)?;
    let mut fraction: i64 = 0;
    for (i, digit) in frac_part.bytes().enumerate() {
        let weight = if i == 0 { 10 } else { 1 };
        fraction += i64::from(digit - b'0') * weight;
    }

    let magnitude = whole
        .checked_mul(100)
        .and_then(|v| v.checked_add(fraction))
        .ok_or(AmountError::OutOfRange)?;
    Ok(if negative { -magnitude } else { magnitude })
}

/// Render minor units with exactly two fractional digits, e.g. `-5.50`.
pub fn format_minor(minor: i64) -> String {
    let sign = if minor < 0 { "-" } else { "" };
    let abs = minor.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

/// ISO 4217 currency code, stored uppercase.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Currency(String);

impl Currency {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into().trim().to_uppercase())
    }

    pub fn code(&self) -> &str {
        &self.0
    }

    pub fn usd() -> Self {
        Self::new("USD")
    }

    pub fn eur() -> Self {
        Self::new("EUR")
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Currency {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A directed currency pair: one unit of `base` buys `rate` units of `quote`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CurrencyPair {
    pub base: Currency,
    pub quote: Currency,
}

impl CurrencyPair {
    pub fn new(base: Currency, quote: Currency) -> Self {
        Self { base, quote }
    }

    /// The same pair in the opposite direction.
    pub fn inverse(&self) -> Self {
        Self {
            base: self.quote.clone(),
            quote: self.base.clone(),
        }
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

/// A positive exchange rate normalized to six fractional digits.
///
/// Normalization uses round-half-to-even, so two independently computed
/// rates compare equal exactly when their six-digit text forms match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rate(Decimal);

impl Rate {
    pub fn new(value: Decimal) -> Result<Self, AmountError> {
        let mut normalized =
            value.round_dp_with_strategy(RATE_SCALE, RoundingStrategy::MidpointNearestEven);
        if normalized <= Decimal::ZERO {
            return Err(AmountError::InvalidRate(value.to_string()));
        }
        normalized.rescale(RATE_SCALE);
        Ok(Self(normalized))
    }

    pub fn parse(text: &str) -> Result<Self, AmountError> {
        let value = Decimal::from_str(text.trim())
            .map_err(|_| AmountError::InvalidRate(text.to_string()))?;
        Self::new(value)
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    /// Multiplicative inverse, normalized again to six digits.
    pub fn inverse(&self) -> Result<Self, AmountError> {
        let inverted = Decimal::ONE
            .checked_div(self.0)
            .ok_or_else(|| AmountError::InvalidRate(self.to_string()))?;
        Self::new(inverted)
    }

    /// Convert an amount in minor units, rounding half-to-even to a whole
    /// minor unit.
    pub fn convert_minor(&self, amount_minor: i64) -> Result<i64, AmountError> {
        Decimal::from(amount_minor)
            .checked_mul(self.0)
            .map(|v| v.round_dp_with_strategy(0, RoundingStrategy::MidpointNearestEven))
            .and_then(|v| v.to_i64())
            .ok_or(AmountError::OutOfRange)
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Rate {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Rate {
    type Error = AmountError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Rate> for String {
    fn from(rate: Rate) -> Self {
        rate.to_string()
    }
}
