//! Storage contracts for accounts, ledger rows and quotes.
//!
//! Methods that take a transaction handle run inside that database
//! transaction. The others are unlocked point reads.

use async_trait::async_trait;
use ledgerline_common::{AccountId, Currency, QuoteId, Result, TransactionId};

use crate::account::Account;
use crate::balance::AccountReconciliation;
use crate::journal::LedgerEntry;
use crate::quote::ExchangeQuote;
use crate::transaction::TransactionRecord;

/// Begins and ends database transactions.
///
/// `Tx` is a cheap, cloneable handle to one open transaction. Dropping every
/// clone of an uncommitted handle rolls the transaction back.
#[async_trait]
pub trait TxBackend: Send + Sync + 'static {
    type Tx: Clone + Send + Sync + 'static;

    /// Open a transaction at serializable isolation.
    async fn begin(&self) -> Result<Self::Tx>;

    async fn commit(&self, tx: Self::Tx) -> Result<()>;

    async fn rollback(&self, tx: Self::Tx) -> Result<()>;
}

#[async_trait]
pub trait LedgerStore: TxBackend {
    /// Read an account and hold its row lock until the transaction ends.
    async fn get_for_update(&self, tx: &Self::Tx, account_id: AccountId) -> Result<Account>;

    /// Unconditional set. The caller validates and computes the new value.
    async fn update_balance(&self, tx: &Self::Tx, account_id: AccountId, balance: i64) -> Result<()>;

    /// The house account for `currency`. A missing one is a bootstrap defect.
    async fn get_system_account(&self, tx: &Self::Tx, currency: &Currency) -> Result<AccountId>;

    async fn create_account(&self, tx: &Self::Tx, account: &Account) -> Result<()>;

    /// Fails with `DuplicateRequest` when the client request id is taken.
    async fn insert_transaction(&self, tx: &Self::Tx, record: &TransactionRecord) -> Result<()>;

    /// Append entries in order. No balancing check happens here.
    async fn insert_ledger_entries(&self, tx: &Self::Tx, entries: &[LedgerEntry]) -> Result<()>;

    async fn get_account(&self, account_id: AccountId) -> Result<Account>;

    async fn find_system_account(&self, currency: &Currency) -> Result<Option<Account>>;

    async fn transaction(&self, transaction_id: TransactionId) -> Result<TransactionRecord>;

    async fn transaction_by_client_request(
        &self,
        client_request_id: &str,
    ) -> Result<Option<TransactionRecord>>;

    async fn entries_for_transaction(&self, transaction_id: TransactionId) -> Result<Vec<LedgerEntry>>;

    async fn entries_for_account(&self, account_id: AccountId) -> Result<Vec<LedgerEntry>>;

    /// Cached balance against entry sum, for every account.
    async fn reconcile(&self) -> Result<Vec<AccountReconciliation>>;
}

#[async_trait]
pub trait QuoteStore: TxBackend {
    /// Persist a new, unconsumed quote. Runs outside any caller transaction.
    async fn create_quote(&self, quote: &ExchangeQuote) -> Result<()>;

    async fn get_quote(&self, quote_id: QuoteId) -> Result<ExchangeQuote>;

    /// Mark the quote consumed if it is neither consumed nor expired.
    /// Returns the number of rows changed; zero must fail the caller.
    async fn consume_quote(&self, tx: &Self::Tx, quote_id: QuoteId) -> Result<u64>;
}
