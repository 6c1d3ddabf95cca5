//! In-process store implementing the ledger and quote contracts.
//!
//! Rows are guarded by per-row async mutexes that a transaction holds until
//! it commits or rolls back, which gives the same blocking behaviour as
//! `SELECT ... FOR UPDATE`. Writes are staged on the transaction handle and
//! become visible atomically at commit. Serialization failures never occur
//! naturally; tests inject them with [`MemoryLedgerStore::inject_commit_conflicts`].

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ledgerline_common::{
    AccountId, Clock, ConflictKind, Currency, LedgerError, QuoteId, Result, SystemClock,
    Timestamp, TransactionId, SYSTEM_ACCOUNT_ENTITY,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use crate::account::Account;
use crate::audit::{AuditRecord, AuditSink};
use crate::balance::AccountReconciliation;
use crate::journal::LedgerEntry;
use crate::quote::ExchangeQuote;
use crate::store::{LedgerStore, QuoteStore, TxBackend};
use crate::transaction::TransactionRecord;

/// Lazily created row locks keyed by primary key.
struct RowLocks<K: Eq + Hash> {
    rows: DashMap<K, Arc<tokio::sync::Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> RowLocks<K> {
    fn new() -> Self {
        Self {
            rows: DashMap::new(),
        }
    }

    async fn acquire(&self, key: &K) -> OwnedMutexGuard<()> {
        let row = Arc::clone(&self.rows.entry(key.clone()).or_default());
        row.lock_owned().await
    }
}

/// Everything an open transaction has locked or staged.
struct TxState {
    id: u64,
    account_guards: HashMap<AccountId, OwnedMutexGuard<()>>,
    balances: HashMap<AccountId, i64>,
    new_accounts: Vec<Account>,
    transactions: Vec<TransactionRecord>,
    entries: Vec<LedgerEntry>,
    quote_guards: HashMap<QuoteId, OwnedMutexGuard<()>>,
    consumed_quotes: HashMap<QuoteId, Timestamp>,
    audit: Vec<AuditRecord>,
    /// Client request keys this transaction inserted. A concurrent insert of
    /// the same key waits on the guard, like a unique index does.
    request_guards: HashMap<String, OwnedMutexGuard<()>>,
}

impl TxState {
    fn new_account_mut(&mut self, id: AccountId) -> Option<&mut Account> {
        self.new_accounts.iter_mut().find(|a| a.id == id)
    }
}

/// Handle to an open in-memory transaction.
#[derive(Clone)]
pub struct MemoryTx {
    state: Arc<Mutex<Option<TxState>>>,
}

impl MemoryTx {
    fn with_state<R>(&self, f: impl FnOnce(&mut TxState) -> Result<R>) -> Result<R> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or(LedgerError::TransactionClosed)?;
        f(state)
    }

    fn take(&self) -> Option<TxState> {
        self.state.lock().take()
    }

    /// Sequence number of this transaction within its store.
    pub fn id(&self) -> Option<u64> {
        self.state.lock().as_ref().map(|s| s.id)
    }
}

impl std::fmt::Debug for MemoryTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTx").field("id", &self.id()).finish()
    }
}

pub struct MemoryLedgerStore {
    clock: Arc<dyn Clock>,
    accounts: DashMap<AccountId, Account>,
    account_locks: RowLocks<AccountId>,
    system_accounts: DashMap<Currency, AccountId>,
    transactions: DashMap<TransactionId, TransactionRecord>,
    client_requests: DashMap<String, TransactionId>,
    request_locks: RowLocks<String>,
    entries: RwLock<Vec<LedgerEntry>>,
    quotes: DashMap<QuoteId, ExchangeQuote>,
    quote_locks: RowLocks<QuoteId>,
    audit: Mutex<Vec<AuditRecord>>,
    next_tx: AtomicU64,
    pending_conflicts: AtomicU32,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    lock_trace: Mutex<Vec<AccountId>>,
}

impl Default for MemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Use `clock` as the database's `NOW()`, e.g. for quote expiry.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            accounts: DashMap::new(),
            account_locks: RowLocks::new(),
            system_accounts: DashMap::new(),
            transactions: DashMap::new(),
            client_requests: DashMap::new(),
            request_locks: RowLocks::new(),
            entries: RwLock::new(Vec::new()),
            quotes: DashMap::new(),
            quote_locks: RowLocks::new(),
            audit: Mutex::new(Vec::new()),
            next_tx: AtomicU64::new(1),
            pending_conflicts: AtomicU32::new(0),
            commits: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            lock_trace: Mutex::new(Vec::new()),
        }
    }

    /// Make the next `count` commits fail with a serialization conflict.
    pub fn inject_commit_conflicts(&self, count: u32) {
        self.pending_conflicts.fetch_add(count, Ordering::SeqCst);
    }

    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> u64 {
        self.rollbacks.load(Ordering::SeqCst)
    }

    /// Account row locks acquired since the last call, in acquisition order.
    pub fn take_lock_trace(&self) -> Vec<AccountId> {
        std::mem::take(&mut *self.lock_trace.lock())
    }

    pub fn audit_records(&self) -> Vec<AuditRecord> {
        self.audit.lock().clone()
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn accounts(&self) -> Vec<Account> {
        self.accounts.iter().map(|a| a.value().clone()).collect()
    }

    /// The account as this transaction sees it, if it already holds the
    /// row lock or created the row itself.
    fn staged_view(&self, state: &TxState, id: AccountId) -> Option<Account> {
        if state.account_guards.contains_key(&id) {
            let mut account = self.accounts.get(&id)?.value().clone();
            if let Some(balance) = state.balances.get(&id) {
                account.balance = *balance;
            }
            return Some(account);
        }
        state.new_accounts.iter().find(|a| a.id == id).cloned()
    }

    fn apply_commit(&self, mut state: TxState) -> Result<()> {
        let injected = self
            .pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            debug!(tx = state.id, "Injected serialization failure at commit");
            return Err(LedgerError::Conflict(ConflictKind::SerializationFailure));
        }

        let mut entries = self.entries.write();

        for account in &state.new_accounts {
            if self.accounts.contains_key(&account.id) {
                return Err(LedgerError::Database(format!(
                    "duplicate key: account {} already exists",
                    account.id
                )));
            }
            if account.is_system && self.system_accounts.contains_key(&account.currency) {
                return Err(LedgerError::Database(format!(
                    "duplicate key: system account for {} already exists",
                    account.currency
                )));
            }
        }
        for key in state.request_guards.keys() {
            if self.client_requests.contains_key(key) {
                return Err(LedgerError::DuplicateRequest(key.clone()));
            }
        }

        let now = Utc::now();
        for account in state.new_accounts.drain(..) {
            if account.is_system {
                self.system_accounts.insert(account.currency.clone(), account.id);
            }
            self.accounts.insert(account.id, account);
        }
        for (id, balance) in state.balances.drain() {
            if let Some(mut account) = self.accounts.get_mut(&id) {
                account.balance = balance;
                account.updated_at = now;
            }
        }
        for record in state.transactions.drain(..) {
            if let Some(key) = &record.client_request_id {
                self.client_requests.insert(key.clone(), record.id);
            }
            self.transactions.insert(record.id, record);
        }
        entries.append(&mut state.entries);
        for (id, consumed_at) in state.consumed_quotes.drain() {
            if let Some(mut quote) = self.quotes.get_mut(&id) {
                quote.consumed_at = Some(consumed_at);
            }
        }
        self.audit.lock().append(&mut state.audit);
        drop(entries);

        self.commits.fetch_add(1, Ordering::SeqCst);
        // row locks are released when `state` drops here
        Ok(())
    }
}

#[async_trait]
impl TxBackend for MemoryLedgerStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx> {
        let state = TxState {
            id: self.next_tx.fetch_add(1, Ordering::SeqCst),
            account_guards: HashMap::new(),
            balances: HashMap::new(),
            new_accounts: Vec::new(),
            transactions: Vec::new(),
            entries: Vec::new(),
            quote_guards: HashMap::new(),
            consumed_quotes: HashMap::new(),
            audit: Vec::new(),
            request_guards: HashMap::new(),
        };
        Ok(MemoryTx {
            state: Arc::new(Mutex::new(Some(state))),
        })
    }

    async fn commit(&self, tx: MemoryTx) -> Result<()> {
        let state = tx.take().ok_or(LedgerError::TransactionClosed)?;
        self.apply_commit(state)
    }

    async fn rollback(&self, tx: MemoryTx) -> Result<()> {
        if tx.take().is_some() {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn get_for_update(&self, tx: &MemoryTx, account_id: AccountId) -> Result<Account> {
        if let Some(account) = tx.with_state(|state| Ok(self.staged_view(state, account_id)))? {
            return Ok(account);
        }
        if !self.accounts.contains_key(&account_id) {
            return Err(LedgerError::not_found("account", account_id));
        }

        let guard = self.account_locks.acquire(&account_id).await;
        self.lock_trace.lock().push(account_id);
        tx.with_state(|state| {
            state.account_guards.insert(account_id, guard);
            Ok(())
        })?;
        self.accounts
            .get(&account_id)
            .map(|a| a.value().clone())
            .ok_or_else(|| LedgerError::not_found("account", account_id))
    }

    async fn update_balance(&self, tx: &MemoryTx, account_id: AccountId, balance: i64) -> Result<()> {
        tx.with_state(|state| {
            if let Some(account) = state.new_account_mut(account_id) {
                account.balance = balance;
                return Ok(());
            }
            if !state.account_guards.contains_key(&account_id) {
                return Err(LedgerError::InvariantViolation(format!(
                    "balance update on {account_id} without its row lock"
                )));
            }
            state.balances.insert(account_id, balance);
            Ok(())
        })
    }

    async fn get_system_account(&self, tx: &MemoryTx, currency: &Currency) -> Result<AccountId> {
        let staged = tx.with_state(|state| {
            Ok(state
                .new_accounts
                .iter()
                .find(|a| a.is_system && &a.currency == currency)
                .map(|a| a.id))
        })?;
        staged
            .or_else(|| self.system_accounts.get(currency).map(|id| *id.value()))
            .ok_or_else(|| LedgerError::not_found(SYSTEM_ACCOUNT_ENTITY, currency))
    }

    async fn create_account(&self, tx: &MemoryTx, account: &Account) -> Result<()> {
        tx.with_state(|state| {
            if account.is_system
                && state
                    .new_accounts
                    .iter()
                    .any(|a| a.is_system && a.currency == account.currency)
            {
                return Err(LedgerError::Database(format!(
                    "duplicate key: system account for {} already exists",
                    account.currency
                )));
            }
            state.new_accounts.push(account.clone());
            Ok(())
        })
    }

    async fn insert_transaction(&self, tx: &MemoryTx, record: &TransactionRecord) -> Result<()> {
        let Some(key) = &record.client_request_id else {
            return tx.with_state(|state| {
                state.transactions.push(record.clone());
                Ok(())
            });
        };

        let held = tx.with_state(|state| Ok(state.request_guards.contains_key(key)))?;
        if held {
            return Err(LedgerError::DuplicateRequest(key.clone()));
        }

        // Blocks while another open transaction holds the key; only a
        // committed row makes this insert a duplicate.
        let guard = self.request_locks.acquire(key).await;
        if self.client_requests.contains_key(key) {
            return Err(LedgerError::DuplicateRequest(key.clone()));
        }
        tx.with_state(|state| {
            state.request_guards.insert(key.clone(), guard);
            state.transactions.push(record.clone());
            Ok(())
        })
    }

    async fn insert_ledger_entries(&self, tx: &MemoryTx, entries: &[LedgerEntry]) -> Result<()> {
        tx.with_state(|state| {
            state.entries.extend_from_slice(entries);
            Ok(())
        })
    }

    async fn get_account(&self, account_id: AccountId) -> Result<Account> {
        self.accounts
            .get(&account_id)
            .map(|a| a.value().clone())
            .ok_or_else(|| LedgerError::not_found("account", account_id))
    }

    async fn find_system_account(&self, currency: &Currency) -> Result<Option<Account>> {
        let id = match self.system_accounts.get(currency) {
            Some(id) => *id.value(),
            None => return Ok(None),
        };
        Ok(self.accounts.get(&id).map(|a| a.value().clone()))
    }

    async fn transaction(&self, transaction_id: TransactionId) -> Result<TransactionRecord> {
        self.transactions
            .get(&transaction_id)
            .map(|t| t.value().clone())
            .ok_or_else(|| LedgerError::not_found("transaction", transaction_id))
    }

    async fn transaction_by_client_request(
        &self,
        client_request_id: &str,
    ) -> Result<Option<TransactionRecord>> {
        let id = match self.client_requests.get(client_request_id) {
            Some(id) => *id.value(),
            None => return Ok(None),
        };
        Ok(self.transactions.get(&id).map(|t| t.value().clone()))
    }

    async fn entries_for_transaction(&self, transaction_id: TransactionId) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .entries
            .read()
            .iter()
            .filter(|e| e.transaction_id == transaction_id)
            .cloned()
            .collect())
    }

    async fn entries_for_account(&self, account_id: AccountId) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .entries
            .read()
            .iter()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn reconcile(&self) -> Result<Vec<AccountReconciliation>> {
        let entries = self.entries.read();
        let mut sums: HashMap<AccountId, i64> = HashMap::new();
        for entry in entries.iter() {
            *sums.entry(entry.account_id).or_insert(0) += entry.amount;
        }
        let mut rows: Vec<AccountReconciliation> = self
            .accounts
            .iter()
            .map(|a| AccountReconciliation {
                account_id: a.id,
                currency: a.currency.clone(),
                is_system: a.is_system,
                stored_balance: a.balance,
                ledger_balance: sums.get(&a.id).copied().unwrap_or(0),
            })
            .collect();
        drop(entries);
        rows.sort_by_key(|r| r.account_id);
        Ok(rows)
    }
}

#[async_trait]
impl QuoteStore for MemoryLedgerStore {
    async fn create_quote(&self, quote: &ExchangeQuote) -> Result<()> {
        match self.quotes.entry(quote.id) {
            Entry::Occupied(_) => Err(LedgerError::Database(format!(
                "duplicate key: quote {} already exists",
                quote.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(ExchangeQuote {
                    consumed_at: None,
                    ..quote.clone()
                });
                Ok(())
            }
        }
    }

    async fn get_quote(&self, quote_id: QuoteId) -> Result<ExchangeQuote> {
        self.quotes
            .get(&quote_id)
            .map(|q| q.value().clone())
            .ok_or_else(|| LedgerError::not_found("quote", quote_id))
    }

    async fn consume_quote(&self, tx: &MemoryTx, quote_id: QuoteId) -> Result<u64> {
        if !self.quotes.contains_key(&quote_id) {
            return Ok(0);
        }
        let held = tx.with_state(|state| {
            if state.consumed_quotes.contains_key(&quote_id) {
                return Ok(None);
            }
            Ok(Some(state.quote_guards.contains_key(&quote_id)))
        })?;
        let already_locked = match held {
            // consumed earlier in this same transaction
            None => return Ok(0),
            Some(locked) => locked,
        };
        let guard = if already_locked {
            None
        } else {
            Some(self.quote_locks.acquire(&quote_id).await)
        };

        let now = self.clock.now();
        tx.with_state(|state| {
            if let Some(guard) = guard {
                state.quote_guards.insert(quote_id, guard);
            }
            let consumable = self
                .quotes
                .get(&quote_id)
                .map(|q| q.consumed_at.is_none() && q.expires_at > now)
                .unwrap_or(false);
            if !consumable {
                return Ok(0);
            }
            state.consumed_quotes.insert(quote_id, now);
            Ok(1)
        })
    }
}

#[async_trait]
impl AuditSink<MemoryTx> for MemoryLedgerStore {
    async fn log(&self, tx: &MemoryTx, record: AuditRecord) -> Result<()> {
        tx.with_state(|state| {
            state.audit.push(record);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quote::QuoteTerms;
    use crate::testing::{seed_system_account, seed_user_account};
    use crate::transaction::TransactionKind;
    use chrono::Duration;
    use ledgerline_common::{ManualClock, Rate, UserId};
    use std::time::Duration as StdDuration;

    fn transfer_record(key: Option<&str>) -> TransactionRecord {
        TransactionRecord::completed(TransactionKind::Transfer, Some(UserId::new()), 1, Currency::usd())
            .with_client_request_id(key.map(str::to_string))
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_invisible() {
        let store = MemoryLedgerStore::new();
        let a = seed_user_account(&store, UserId::new(), Currency::usd(), 1_000).await.unwrap();

        let tx = store.begin().await.unwrap();
        store.get_for_update(&tx, a).await.unwrap();
        store.update_balance(&tx, a, 1).await.unwrap();
        assert_eq!(store.get_account(a).await.unwrap().balance, 1_000);
        assert_eq!(store.get_for_update(&tx, a).await.unwrap().balance, 1);

        store.rollback(tx).await.unwrap();
        assert_eq!(store.get_account(a).await.unwrap().balance, 1_000);
    }

    #[tokio::test]
    async fn test_row_lock_blocks_second_transaction() {
        let store = Arc::new(MemoryLedgerStore::new());
        let a = seed_user_account(&*store, UserId::new(), Currency::usd(), 1_000)
            .await
            .unwrap();

        let first = store.begin().await.unwrap();
        store.get_for_update(&first, a).await.unwrap();

        let contender = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let second = store.begin().await.unwrap();
                let seen = store.get_for_update(&second, a).await.unwrap().balance;
                store.rollback(second).await.unwrap();
                seen
            })
        };

        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert!(!contender.is_finished());

        store.update_balance(&first, a, 400).await.unwrap();
        store.commit(first).await.unwrap();
        assert_eq!(contender.await.unwrap(), 400);
    }

    #[tokio::test]
    async fn test_dropped_handle_releases_row_and_request_locks() {
        let store = MemoryLedgerStore::new();
        let a = seed_user_account(&store, UserId::new(), Currency::usd(), 1_000).await.unwrap();

        let tx = store.begin().await.unwrap();
        store.get_for_update(&tx, a).await.unwrap();
        store.insert_transaction(&tx, &transfer_record(Some("req-7"))).await.unwrap();
        drop(tx);

        let retry = store.begin().await.unwrap();
        tokio::time::timeout(StdDuration::from_secs(1), store.get_for_update(&retry, a))
            .await
            .expect("row lock released")
            .unwrap();
        store.insert_transaction(&retry, &transfer_record(Some("req-7"))).await.unwrap();
        store.commit(retry).await.unwrap();
    }

    #[tokio::test]
    async fn test_client_request_id_is_unique() {
        let store = MemoryLedgerStore::new();
        let tx = store.begin().await.unwrap();
        store.insert_transaction(&tx, &transfer_record(Some("dup"))).await.unwrap();
        store.commit(tx).await.unwrap();

        let tx = store.begin().await.unwrap();
        let err = store
            .insert_transaction(&tx, &transfer_record(Some("dup")))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateRequest(ref k) if k == "dup"));
        store.insert_transaction(&tx, &transfer_record(None)).await.unwrap();
        store.commit(tx).await.unwrap();

        assert!(store.transaction_by_client_request("dup").await.unwrap().is_some());
        assert_eq!(store.transaction_count(), 2);
    }

    #[tokio::test]
    async fn test_request_key_waits_for_open_holder_to_roll_back() {
        let store = Arc::new(MemoryLedgerStore::new());
        let holder = store.begin().await.unwrap();
        store.insert_transaction(&holder, &transfer_record(Some("k"))).await.unwrap();

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let tx = store.begin().await.unwrap();
                store.insert_transaction(&tx, &transfer_record(Some("k"))).await?;
                store.commit(tx).await
            })
        };

        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        store.rollback(holder).await.unwrap();
        waiter.await.unwrap().unwrap();
        assert!(store.transaction_by_client_request("k").await.unwrap().is_some());
        assert_eq!(store.transaction_count(), 1);
    }

    #[tokio::test]
    async fn test_request_key_is_duplicate_once_holder_commits() {
        let store = Arc::new(MemoryLedgerStore::new());
        let holder = store.begin().await.unwrap();
        store.insert_transaction(&holder, &transfer_record(Some("k"))).await.unwrap();

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let tx = store.begin().await.unwrap();
                store.insert_transaction(&tx, &transfer_record(Some("k"))).await
            })
        };

        tokio::time::sleep(StdDuration::from_millis(20)).await;
        store.commit(holder).await.unwrap();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateRequest(ref k) if k == "k"));
    }

    #[tokio::test]
    async fn test_request_key_twice_in_one_transaction() {
        let store = MemoryLedgerStore::new();
        let tx = store.begin().await.unwrap();
        store.insert_transaction(&tx, &transfer_record(Some("k"))).await.unwrap();
        let err = store
            .insert_transaction(&tx, &transfer_record(Some("k")))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateRequest(_)));
    }

    #[tokio::test]
    async fn test_injected_conflict_discards_staged_writes() {
        let store = MemoryLedgerStore::new();
        store.inject_commit_conflicts(1);
        let tx = store.begin().await.unwrap();
        store.insert_transaction(&tx, &transfer_record(Some("k"))).await.unwrap();
        let err = store.commit(tx).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.transaction_count(), 0);
        assert!(store.transaction_by_client_request("k").await.unwrap().is_none());
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_single_system_account_per_currency() {
        let store = MemoryLedgerStore::new();
        seed_system_account(&store, Currency::eur(), 0).await.unwrap();
        let err = seed_system_account(&store, Currency::eur(), 0).await.unwrap_err();
        assert!(matches!(err, LedgerError::Database(_)));
        assert!(store.find_system_account(&Currency::eur()).await.unwrap().is_some());
        assert!(store.find_system_account(&Currency::usd()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_closed_handle_is_rejected() {
        let store = MemoryLedgerStore::new();
        let tx = store.begin().await.unwrap();
        store.commit(tx.clone()).await.unwrap();
        let err = store
            .insert_ledger_entries(&tx, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::TransactionClosed));
    }

    #[tokio::test]
    async fn test_quote_consumed_once_and_not_after_expiry() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = MemoryLedgerStore::with_clock(clock.clone());
        let issue = || {
            ExchangeQuote::issue(
                QuoteTerms {
                    user_id: UserId::new(),
                    from_account_id: AccountId::new(),
                    to_account_id: AccountId::new(),
                    amount_minor: 1000,
                },
                Rate::parse("0.92").unwrap(),
                920,
                Currency::usd(),
                Currency::eur(),
                clock.now(),
                Duration::minutes(2),
            )
        };

        let quote = issue();
        store.create_quote(&quote).await.unwrap();
        let tx = store.begin().await.unwrap();
        assert_eq!(store.consume_quote(&tx, quote.id).await.unwrap(), 1);
        assert_eq!(store.consume_quote(&tx, quote.id).await.unwrap(), 0);
        store.commit(tx).await.unwrap();
        assert!(store.get_quote(quote.id).await.unwrap().is_consumed());

        let tx = store.begin().await.unwrap();
        assert_eq!(store.consume_quote(&tx, quote.id).await.unwrap(), 0);
        assert_eq!(store.consume_quote(&tx, QuoteId::new()).await.unwrap(), 0);
        drop(tx);

        let stale = issue();
        store.create_quote(&stale).await.unwrap();
        clock.advance(Duration::minutes(2));
        let tx = store.begin().await.unwrap();
        assert_eq!(store.consume_quote(&tx, stale.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_matches_entries() {
        let store = MemoryLedgerStore::new();
        seed_user_account(&store, UserId::new(), Currency::usd(), 10_000).await.unwrap();
        seed_user_account(&store, UserId::new(), Currency::eur(), 5_000).await.unwrap();

        let rows = store.reconcile().await.unwrap();
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|r| r.is_consistent()));
    }
}
