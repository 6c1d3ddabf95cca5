//! Directional rates and conversions on top of a [`RateProvider`].

use std::sync::Arc;

use ledgerline_common::{Currency, CurrencyPair, Rate};
use tracing::{debug, instrument};

use crate::conversion::Conversion;
use crate::error::{FxError, FxResult};
use crate::provider::{FixedRateProvider, RateProvider};

/// Prices conversions between the currencies a provider quotes.
///
/// A provider quotes each pair in a single direction. The opposite direction
/// uses the multiplicative inverse, normalized to six digits with
/// round-half-to-even, so both directions are always available once either is.
#[derive(Clone)]
pub struct FxEngine {
    provider: Arc<dyn RateProvider>,
}

impl FxEngine {
    pub fn new(provider: Arc<dyn RateProvider>) -> Self {
        Self { provider }
    }

    /// Engine backed by a fixed USD/EUR rate.
    pub fn fixed_usd_eur(rate: Rate) -> Self {
        Self::new(Arc::new(FixedRateProvider::usd_eur(rate)))
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Whether `from -> to` can be priced, in either quoted direction.
    pub fn is_supported_pair(&self, from: &Currency, to: &Currency) -> bool {
        if from == to {
            return false;
        }
        let pair = CurrencyPair::new(from.clone(), to.clone());
        self.provider.supports_pair(&pair) || self.provider.supports_pair(&pair.inverse())
    }

    /// Rate at which one unit of `from` buys units of `to`.
    #[instrument(skip(self), fields(provider = self.provider.name()))]
    pub async fn directional_rate(&self, from: &Currency, to: &Currency) -> FxResult<Rate> {
        if from == to {
            return Err(FxError::SameCurrency(from.clone()));
        }
        let pair = CurrencyPair::new(from.clone(), to.clone());
        if self.provider.supports_pair(&pair) {
            return self.provider.get_rate(&pair).await;
        }

        let quoted = pair.inverse();
        if self.provider.supports_pair(&quoted) {
            let rate = self.provider.get_rate(&quoted).await?;
            let inverse = rate.inverse()?;
            debug!(%quoted, %rate, %inverse, "Using inverse of quoted rate");
            return Ok(inverse);
        }

        Err(FxError::UnsupportedPair(pair))
    }

    /// Price `amount_minor` of `from` in `to` at the current rate.
    pub async fn convert(
        &self,
        amount_minor: i64,
        from: &Currency,
        to: &Currency,
    ) -> FxResult<Conversion> {
        let rate = self.directional_rate(from, to).await?;
        let converted_minor = rate.convert_minor(amount_minor)?;
        Ok(Conversion {
            pair: CurrencyPair::new(from.clone(), to.clone()),
            rate,
            amount_minor,
            converted_minor,
        })
    }

    /// Every direction this engine can price.
    pub fn supported_directions(&self) -> Vec<CurrencyPair> {
        let mut pairs: Vec<CurrencyPair> = self
            .provider
            .supported_pairs()
            .into_iter()
            .flat_map(|pair| {
                let inverse = pair.inverse();
                [pair, inverse]
            })
            .collect();
        pairs.sort_by(|a, b| (&a.base, &a.quote).cmp(&(&b.base, &b.quote)));
        pairs.dedup();
        pairs
    }
}

impl std::fmt::Debug for FxEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FxEngine")
            .field("provider", &self.provider.name())
            .finish()
    }
}
