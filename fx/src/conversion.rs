//! Priced conversions.

use ledgerline_common::{format_minor, Currency, CurrencyPair, Rate};
use serde::{Deserialize, Serialize};

/// The result of pricing `amount_minor` of one currency in another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversion {
    /// Direction of the conversion: `base` is paid, `quote` is received.
    pub pair: CurrencyPair,
    /// Directional rate applied.
    pub rate: Rate,
    /// Amount paid, in minor units of `pair.base`.
    pub amount_minor: i64,
    /// Amount received, in minor units of `pair.quote`.
    pub converted_minor: i64,
}

impl Conversion {
    pub fn from_currency(&self) -> &Currency {
        &self.pair.base
    }

    pub fn to_currency(&self) -> &Currency {
        &self.pair.quote
    }

    /// Human readable summary, e.g. `10.00 USD -> 9.20 EUR @ 0.920000`.
    pub fn describe(&self) -> String {
        format!(
            "{} {} -> {} {} @ {}",
            format_minor(self.amount_minor),
            self.pair.base,
            format_minor(self.converted_minor),
            self.pair.quote,
            self.rate
        )
    }
}
