//! Ledgerline Common Types
//!
//! Shared identifiers, the money codec (minor units, currencies, rates),
//! the error taxonomy and time utilities used by every other crate.

pub mod error;
pub mod identifiers;
pub mod money;
pub mod time;

pub use error::*;
pub use identifiers::*;
pub use money::*;
pub use time::*;
