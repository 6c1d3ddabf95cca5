//! Rate provider trait and implementations.

use std::collections::HashMap;

use async_trait::async_trait;
use ledgerline_common::{Currency, CurrencyPair, Rate};
use rust_decimal::Decimal;

use crate::error::{FxError, FxResult};

/// USD/EUR rate used when nothing else is configured.
pub const DEFAULT_USD_EUR_RATE: Decimal = Decimal::from_parts(92, 0, 0, false, 2);

/// A source of exchange rates.
///
/// Providers quote a pair in one direction only. [`crate::FxEngine`] derives
/// the opposite direction from the inverse.
#[async_trait]
pub trait RateProvider: Send + Sync {
    /// Get the provider name.
    fn name(&self) -> &str;

    /// Get the rate for a currency pair as quoted by this provider.
    async fn get_rate(&self, pair: &CurrencyPair) -> FxResult<Rate>;

    /// Check if this provider quotes the given pair directly.
    fn supports_pair(&self, pair: &CurrencyPair) -> bool;

    /// Get all directly quoted pairs.
    fn supported_pairs(&self) -> Vec<CurrencyPair>;
}

/// Static rate table.
#[derive(Debug, Clone, Default)]
pub struct FixedRateProvider {
    rates: HashMap<CurrencyPair, Rate>,
}

impl FixedRateProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider quoting only USD/EUR at `rate`.
    pub fn usd_eur(rate: Rate) -> Self {
        Self::new().with_rate(CurrencyPair::new(Currency::usd(), Currency::eur()), rate)
    }

    pub fn with_rate(mut self, pair: CurrencyPair, rate: Rate) -> Self {
        self.rates.insert(pair, rate);
        self
    }
}

#[async_trait]
impl RateProvider for FixedRateProvider {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn get_rate(&self, pair: &CurrencyPair) -> FxResult<Rate> {
        self.rates
            .get(pair)
            .copied()
            .ok_or_else(|| FxError::RateNotAvailable(pair.clone()))
    }

    fn supports_pair(&self, pair: &CurrencyPair) -> bool {
        self.rates.contains_key(pair)
    }

    fn supported_pairs(&self) -> Vec<CurrencyPair> {
        self.rates.keys().cloned().collect()
    }
}

/// Mock rate provider for testing.
///
/// The supported pairs are fixed at construction. Rates can be changed or
/// withdrawn at any time to simulate a moving market.
#[cfg(any(test, feature = "test-utils"))]
pub struct MockRateProvider {
    name: String,
    pairs: Vec<CurrencyPair>,
    rates: dashmap::DashMap<CurrencyPair, Rate>,
}

#[cfg(any(test, feature = "test-utils"))]
impl MockRateProvider {
    pub fn new(name: &str, pairs: Vec<CurrencyPair>) -> Self {
        Self {
            name: name.to_string(),
            pairs,
            rates: dashmap::DashMap::new(),
        }
    }

    /// Mock quoting USD/EUR at `rate`.
    pub fn usd_eur(rate: Rate) -> Self {
        let pair = CurrencyPair::new(Currency::usd(), Currency::eur());
        let mock = Self::new("mock", vec![pair.clone()]);
        mock.set_rate(pair, rate);
        mock
    }

    pub fn set_rate(&self, pair: CurrencyPair, rate: Rate) {
        self.rates.insert(pair, rate);
    }

    pub fn clear_rate(&self, pair: &CurrencyPair) {
        self.rates.remove(pair);
    }
}

#[cfg(any(test, feature = "test-utils"))]
#[async_trait]
impl RateProvider for MockRateProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_rate(&self, pair: &CurrencyPair) -> FxResult<Rate> {
        self.rates
            .get(pair)
            .map(|r| *r)
            .ok_or_else(|| FxError::RateNotAvailable(pair.clone()))
    }

    fn supports_pair(&self, pair: &CurrencyPair) -> bool {
        self.pairs.contains(pair)
    }

    fn supported_pairs(&self) -> Vec<CurrencyPair> {
        self.pairs.clone()
    }
}
