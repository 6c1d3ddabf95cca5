//! Ledgerline FX
//!
//! Exchange rate sources and currency conversion for the ledger engine.
//!
//! # Example
//!
//! ```rust,ignore
//! use ledgerline_common::{Currency, Rate};
//! use ledgerline_fx::FxEngine;
//!
//! let engine = FxEngine::fixed_usd_eur(Rate::parse("0.92")?);
//! let conversion = engine.convert(1000, &Currency::usd(), &Currency::eur()).await?;
//! assert_eq!(conversion.converted_minor, 920);
//! ```

pub mod conversion;
pub mod engine;
pub mod error;
pub mod provider;

pub use conversion::Conversion;
pub use engine::FxEngine;
pub use error::{FxError, FxResult};
#[cfg(any(test, feature = "test-utils"))]
pub use provider::MockRateProvider;
pub use provider::{FixedRateProvider, RateProvider, DEFAULT_USD_EUR_RATE};
