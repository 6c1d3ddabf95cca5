//! Ledgerline Account Ledger
//!
//! Double-entry ledger storage with serializable, retrying transactions:
//! accounts, ledger entries, business transaction records, exchange quotes
//! and the audit trail, plus deterministic multi-account locking.

pub mod account;
pub mod audit;
pub mod balance;
pub mod executor;
pub mod journal;
pub mod locking;
pub mod memory;
pub mod postgres;
pub mod provision;
pub mod quote;
pub mod store;
pub mod transaction;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use account::Account;
pub use audit::{AuditRecord, AuditSink};
pub use balance::{AccountReconciliation, ReconciliationReport};
pub use executor::{JitterSource, NoJitter, RandomJitter, RetryPolicy, TxExecutor};
pub use journal::{JournalBatch, LedgerEntry};
pub use locking::{lock_accounts, LockedAccounts};
pub use memory::{MemoryLedgerStore, MemoryTx};
pub use postgres::{PgLedgerStore, PgTx, PoolSettings};
pub use quote::{ExchangeQuote, QuoteTerms};
pub use store::{LedgerStore, QuoteStore, TxBackend};
pub use transaction::{TransactionKind, TransactionRecord, TransactionStatus};
