//! FX error types.

use ledgerline_common::{AmountError, Currency, CurrencyPair, LedgerError};
use thiserror::Error;

/// Errors that can occur while pricing a conversion.
#[derive(Debug, Error)]
pub enum FxError {
    /// Neither the pair nor its inverse is quoted by the provider.
    #[error("unsupported currency pair {0}")]
    UnsupportedPair(CurrencyPair),

    /// Both sides of the conversion use the same currency.
    #[error("cannot exchange {0} into itself")]
    SameCurrency(Currency),

    /// The provider knows the pair but has no rate for it right now.
    #[error("rate not available for {0}")]
    RateNotAvailable(CurrencyPair),

    /// Rate normalization or amount conversion failed.
    #[error(transparent)]
    Amount(#[from] AmountError),
}

/// Result type for FX operations.
pub type FxResult<T> = Result<T, FxError>;

impl From<FxError> for LedgerError {
    fn from(err: FxError) -> Self {
        match err {
            FxError::UnsupportedPair(_) | FxError::SameCurrency(_) | FxError::RateNotAvailable(_) => {
                LedgerError::InvalidExchangeRequest(err.to_string())
            }
            FxError::Amount(amount) => amount.into(),
        }
    }
}
