//! Transaction service: transfers, exchange quotes and exchanges.
//!
//! Every mutating operation follows the same shape: cheap validation, then
//! inside one executor transaction lock the accounts in id order, re-check
//! the business rules against the locked rows, write balances, the
//! transaction record and its ledger entries, and audit. Balance updates are
//! pushed only after commit.

use std::sync::Arc;

use ledgerline_common::{
    Clock, Currency, LedgerError, QuoteId, Rate, Result, SystemClock, TransactionId, UserId,
};
use ledgerline_fx::FxEngine;
use ledgerline_ledger::{
    lock_accounts, Account, AuditRecord, AuditSink, ExchangeQuote, JournalBatch, LedgerStore,
    QuoteStore, TransactionKind, TransactionRecord, TxExecutor,
};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::config::EngineConfig;
use crate::hub::{BalanceNotifier, BalanceUpdate};
use crate::metrics::EngineMetrics;
use crate::requests::{ExchangeRequest, QuoteRequest, QuoteResponse, Receipt, TransferRequest};

/// The rate an exchange caller committed to before any lock was taken.
#[derive(Debug, Clone, Copy)]
struct RateCommitment {
    rate: Rate,
    /// Converted amount promised by a quote.
    expected_converted: Option<i64>,
    quote_id: Option<QuoteId>,
}

pub struct TransactionService<S: LedgerStore + QuoteStore> {
    store: Arc<S>,
    executor: Arc<TxExecutor<S>>,
    audit: Arc<dyn AuditSink<S::Tx>>,
    fx: FxEngine,
    notifier: Arc<dyn BalanceNotifier>,
    clock: Arc<dyn Clock>,
    metrics: Arc<EngineMetrics>,
    quote_ttl: chrono::Duration,
}

impl<S: LedgerStore + QuoteStore> TransactionService<S> {
    pub fn new(
        store: Arc<S>,
        audit: Arc<dyn AuditSink<S::Tx>>,
        fx: FxEngine,
        notifier: Arc<dyn BalanceNotifier>,
    ) -> Self {
        Self {
            executor: Arc::new(TxExecutor::new(store.clone())),
            store,
            audit,
            fx,
            notifier,
            clock: Arc::new(SystemClock),
            metrics: Arc::new(EngineMetrics::new()),
            quote_ttl: ledgerline_common::constants::quote_ttl(),
        }
    }

    /// Apply the executor and quote settings from `config`.
    pub fn configured(self, config: &EngineConfig) -> Self {
        let executor = TxExecutor::new(self.store.clone())
            .with_policy(config.executor.retry_policy())
            .with_deadline(config.executor.request_timeout);
        Self {
            executor: Arc::new(executor),
            quote_ttl: config.quotes.ttl(),
            ..self
        }
    }

    pub fn with_executor(mut self, executor: Arc<TxExecutor<S>>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_quote_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.quote_ttl = ttl;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn executor(&self) -> &Arc<TxExecutor<S>> {
        &self.executor
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    /// Move `amount_minor` between two accounts of the same currency.
    #[instrument(skip(self, request), fields(
        user_id = %request.user_id,
        from = %request.from_account_id,
        to = %request.to_account_id,
        amount = request.amount_minor
    ))]
    pub async fn transfer(&self, request: TransferRequest) -> Result<TransactionId> {
        let result = self.run_transfer(&request).await;
        match result {
            Ok(receipt) => {
                self.metrics.transfer_committed();
                info!(transaction_id = %receipt.transaction_id, "Transfer committed");
                self.notify(&receipt.accounts);
                Ok(receipt.transaction_id)
            }
            Err(err) => Err(self.rejected("transfer", err)),
        }
    }

    async fn run_transfer(&self, request: &TransferRequest) -> Result<Receipt> {
        if request.amount_minor <= 0 {
            return Err(LedgerError::InvalidAmount);
        }
        if request.from_account_id == request.to_account_id {
            return Err(LedgerError::SameAccountTransfer);
        }
        self.executor
            .with_transaction(|tx| self.transfer_in_tx(tx, request))
            .await
    }

    async fn transfer_in_tx(&self, tx: S::Tx, request: &TransferRequest) -> Result<Receipt> {
        let store = &*self.store;
        let amount = request.amount_minor;
        let mut locked = lock_accounts(
            store,
            &tx,
            &[request.from_account_id, request.to_account_id],
        )
        .await?;
        let from = locked.get(request.from_account_id)?;
        let to = locked.get(request.to_account_id)?;

        if !from.is_owned_by(&request.user_id) {
            return Err(LedgerError::UnauthorizedAccount(from.id));
        }
        if from.currency != to.currency {
            return Err(LedgerError::CurrencyMismatch {
                expected: from.currency.clone(),
                actual: to.currency.clone(),
            });
        }
        if from.balance < amount {
            return Err(LedgerError::InsufficientFunds {
                account_id: from.id,
                required: amount,
                available: from.balance,
            });
        }

        let currency = from.currency.clone();
        let record = TransactionRecord::completed(
            TransactionKind::Transfer,
            Some(request.user_id),
            amount,
            currency.clone(),
        )
        .between(from.id, to.id)
        .with_client_request_id(request.client_request_id.clone());

        let mut batch = JournalBatch::new(record.id, TransactionKind::Transfer);
        batch
            .push(from.id, -amount, &currency, "Transfer debit")
            .push(to.id, amount, &currency, "Transfer credit");
        let entries = batch.into_validated()?;

        locked.apply(&entries)?;
        locked.write_balances(store, &tx).await?;
        store.insert_transaction(&tx, &record).await?;
        store.insert_ledger_entries(&tx, &entries).await?;
        self.audit
            .log(
                &tx,
                AuditRecord::new(
                    Some(request.user_id),
                    "transfer",
                    "transaction",
                    record.id,
                    json!({
                        "from_account_id": request.from_account_id,
                        "to_account_id": request.to_account_id,
                        "amount": amount,
                        "currency": currency,
                    }),
                ),
            )
            .await?;

        Ok(Receipt {
            transaction_id: record.id,
            accounts: vec![
                locked.get(request.from_account_id)?.clone(),
                locked.get(request.to_account_id)?.clone(),
            ],
        })
    }

    /// Price a conversion at the current rate and hold it in a quote.
    ///
    /// Read-only apart from the quote row: no locks, no balance change.
    #[instrument(skip(self, request), fields(
        user_id = %request.user_id,
        from = %request.from_account_id,
        to = %request.to_account_id,
        amount = request.amount_minor
    ))]
    pub async fn quote_exchange(&self, request: QuoteRequest) -> Result<QuoteResponse> {
        match self.issue_quote(&request).await {
            Ok(quote) => {
                self.metrics.quote_issued();
                info!(quote_id = %quote.id, rate = %quote.rate, converted = quote.converted_minor, "Quote issued");
                Ok(QuoteResponse {
                    quote_id: quote.id,
                    rate: quote.rate,
                    converted_minor: quote.converted_minor,
                    expires_at: quote.expires_at,
                })
            }
            Err(err) => Err(self.rejected("quote_exchange", err)),
        }
    }

    async fn issue_quote(&self, request: &QuoteRequest) -> Result<ExchangeQuote> {
        if request.amount_minor <= 0 {
            return Err(LedgerError::InvalidExchangeRequest(
                "amount must be positive".to_string(),
            ));
        }
        if request.from_account_id == request.to_account_id {
            return Err(LedgerError::InvalidExchangeRequest(
                "source and destination accounts must differ".to_string(),
            ));
        }

        let from = self.store.get_account(request.from_account_id).await?;
        let to = self.store.get_account(request.to_account_id).await?;
        check_owner(&request.user_id, &from, &to)?;
        self.check_pair(&from, &to)?;

        let conversion = self.fx.convert(request.amount_minor, &from.currency, &to.currency).await?;
        if conversion.converted_minor <= 0 {
            return Err(LedgerError::InvalidExchangeRequest(format!(
                "{} converts to nothing",
                conversion.describe()
            )));
        }

        let quote = ExchangeQuote::issue(
            request.terms(),
            conversion.rate,
            conversion.converted_minor,
            from.currency,
            to.currency,
            self.clock.now(),
            self.quote_ttl,
        );
        self.store.create_quote(&quote).await?;
        Ok(quote)
    }

    /// Convert money between two of the caller's accounts through the
    /// currencies' house accounts.
    #[instrument(skip(self, request), fields(
        user_id = %request.user_id,
        from = %request.from_account_id,
        to = %request.to_account_id,
        amount = request.amount_minor
    ))]
    pub async fn exchange(&self, request: ExchangeRequest) -> Result<TransactionId> {
        match self.run_exchange(&request).await {
            Ok(receipt) => {
                self.metrics.exchange_committed();
                info!(transaction_id = %receipt.transaction_id, "Exchange committed");
                self.notify(&receipt.accounts);
                Ok(receipt.transaction_id)
            }
            Err(err) => Err(self.rejected("exchange", err)),
        }
    }

    async fn run_exchange(&self, request: &ExchangeRequest) -> Result<Receipt> {
        if request.amount_minor <= 0 {
            return Err(LedgerError::InvalidAmount);
        }
        if request.from_account_id == request.to_account_id {
            return Err(LedgerError::InvalidExchangeRequest(
                "source and destination accounts must differ".to_string(),
            ));
        }
        let commitment = self.rate_commitment(request).await?;
        self.executor
            .with_transaction(|tx| self.exchange_in_tx(tx, request, commitment))
            .await
    }

    /// Resolve the caller's committed rate from its quote or inline rate.
    async fn rate_commitment(&self, request: &ExchangeRequest) -> Result<RateCommitment> {
        if let Some(quote_id) = request.quote_id {
            let quote = match self.store.get_quote(quote_id).await {
                Ok(quote) => quote,
                Err(LedgerError::NotFound { .. }) => return Err(LedgerError::QuoteNotFound(quote_id)),
                Err(err) => return Err(err),
            };
            if quote.is_consumed() {
                return Err(LedgerError::QuoteConsumed(quote_id));
            }
            if quote.is_expired_at(self.clock.now()) {
                return Err(LedgerError::QuoteExpired(quote_id));
            }
            if !quote.matches(&request.terms()) {
                return Err(LedgerError::InvalidExchangeRequest(format!(
                    "quote {quote_id} was issued for a different request"
                )));
            }
            return Ok(RateCommitment {
                rate: quote.rate,
                expected_converted: Some(quote.converted_minor),
                quote_id: Some(quote_id),
            });
        }

        match &request.quoted_rate {
            Some(text) => Ok(RateCommitment {
                rate: Rate::parse(text)?,
                expected_converted: None,
                quote_id: None,
            }),
            None => Err(LedgerError::InvalidExchangeRequest(
                "either a quote id or a quoted rate is required".to_string(),
            )),
        }
    }

    async fn exchange_in_tx(
        &self,
        tx: S::Tx,
        request: &ExchangeRequest,
        commitment: RateCommitment,
    ) -> Result<Receipt> {
        let store = &*self.store;
        let amount = request.amount_minor;

        // currencies never change, so an unlocked read is enough to check the
        // pair and find the house accounts before taking every lock in one
        // ordered pass
        let from_currency = store.get_account(request.from_account_id).await?.currency;
        let to_currency = store.get_account(request.to_account_id).await?.currency;
        if !self.fx.is_supported_pair(&from_currency, &to_currency) {
            return Err(unsupported_pair(&from_currency, &to_currency));
        }
        let system_from_id = store.get_system_account(&tx, &from_currency).await?;
        let system_to_id = store.get_system_account(&tx, &to_currency).await?;

        let mut locked = lock_accounts(
            store,
            &tx,
            &[
                request.from_account_id,
                request.to_account_id,
                system_from_id,
                system_to_id,
            ],
        )
        .await?;
        let from = locked.get(request.from_account_id)?;
        let to = locked.get(request.to_account_id)?;

        check_owner(&request.user_id, from, to)?;
        self.check_pair(from, to)?;

        let current = self.fx.directional_rate(&from.currency, &to.currency).await?;
        if commitment.rate != current {
            return Err(LedgerError::RateMismatch {
                committed: commitment.rate.to_string(),
                current: current.to_string(),
            });
        }
        let converted = current.convert_minor(amount)?;
        if let Some(expected) = commitment.expected_converted {
            if expected != converted {
                return Err(LedgerError::RateMismatch {
                    committed: format!("{} converting to {expected}", commitment.rate),
                    current: format!("{current} converting to {converted}"),
                });
            }
        }
        if converted <= 0 {
            return Err(LedgerError::InvalidExchangeRequest(format!(
                "{amount} at {current} converts to nothing"
            )));
        }

        if from.balance < amount {
            return Err(LedgerError::InsufficientFunds {
                account_id: from.id,
                required: amount,
                available: from.balance,
            });
        }
        let system_to = locked.get(system_to_id)?;
        if system_to.balance < converted {
            return Err(LedgerError::InsufficientFunds {
                account_id: system_to.id,
                required: converted,
                available: system_to.balance,
            });
        }

        let (from_id, to_id) = (from.id, to.id);
        let record = TransactionRecord::completed(
            TransactionKind::Exchange,
            Some(request.user_id),
            amount,
            from_currency.clone(),
        )
        .between(from_id, to_id)
        .with_client_request_id(request.client_request_id.clone())
        .with_metadata(json!({
            "rate": current.to_string(),
            "quote_id": commitment.quote_id,
            "converted_amount": converted,
            "to_currency": to_currency,
        }));

        let mut batch = JournalBatch::new(record.id, TransactionKind::Exchange);
        batch
            .push(from_id, -amount, &from_currency, "Exchange debit")
            .push(system_from_id, amount, &from_currency, "Exchange system credit")
            .push(system_to_id, -converted, &to_currency, "Exchange system debit")
            .push(to_id, converted, &to_currency, "Exchange credit");
        let entries = batch.into_validated()?;

        locked.apply(&entries)?;
        locked.write_balances(store, &tx).await?;
        store.insert_transaction(&tx, &record).await?;
        store.insert_ledger_entries(&tx, &entries).await?;

        if let Some(quote_id) = commitment.quote_id {
            if store.consume_quote(&tx, quote_id).await? == 0 {
                return Err(LedgerError::QuoteConsumed(quote_id));
            }
        }

        self.audit
            .log(
                &tx,
                AuditRecord::new(
                    Some(request.user_id),
                    "exchange",
                    "transaction",
                    record.id,
                    json!({
                        "from_account_id": from_id,
                        "to_account_id": to_id,
                        "amount": amount,
                        "converted_amount": converted,
                        "rate": current.to_string(),
                        "quote_id": commitment.quote_id,
                    }),
                ),
            )
            .await?;

        Ok(Receipt {
            transaction_id: record.id,
            accounts: vec![locked.get(from_id)?.clone(), locked.get(to_id)?.clone()],
        })
    }

    /// Both accounts must hold different currencies the rate source can price.
    fn check_pair(&self, from: &Account, to: &Account) -> Result<()> {
        if !self.fx.is_supported_pair(&from.currency, &to.currency) {
            return Err(unsupported_pair(&from.currency, &to.currency));
        }
        Ok(())
    }

    /// Push post-commit balances to each owning user.
    fn notify(&self, accounts: &[Account]) {
        for account in accounts {
            if let Some(owner) = account.user_id {
                self.notifier
                    .broadcast_balance(owner, &BalanceUpdate::from(account));
            }
        }
    }

    fn rejected(&self, operation: &'static str, err: LedgerError) -> LedgerError {
        self.metrics.record_failure(&err);
        warn!(
            operation,
            error = %err,
            code = err.error_code(),
            class = ?err.class(),
            "Operation failed"
        );
        err
    }
}

/// Exchanges only move money between the caller's own accounts.
fn check_owner(user_id: &UserId, from: &Account, to: &Account) -> Result<()> {
    for account in [from, to] {
        if !account.is_owned_by(user_id) {
            return Err(LedgerError::UnauthorizedAccount(account.id));
        }
    }
    Ok(())
}

fn unsupported_pair(from: &Currency, to: &Currency) -> LedgerError {
    LedgerError::InvalidExchangeRequest(format!("cannot exchange {from} into {to}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::BalanceHub;
    use ledgerline_common::{AccountId, CurrencyPair, ManualClock};
    use ledgerline_fx::MockRateProvider;
    use ledgerline_ledger::audit::FailingAudit;
    use ledgerline_ledger::testing::{seed_system_account, seed_user_account};
    use ledgerline_ledger::{MemoryLedgerStore, NoJitter, TransactionKind, TxBackend};
    use rust_decimal_macros::dec;

    struct Harness {
        store: Arc<MemoryLedgerStore>,
        service: TransactionService<MemoryLedgerStore>,
        hub: Arc<BalanceHub>,
        clock: Arc<ManualClock>,
        rates: Arc<MockRateProvider>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryLedgerStore::with_clock(clock.clone()));
        let rates = Arc::new(MockRateProvider::usd_eur(Rate::new(dec!(0.92)).unwrap()));
        let hub = Arc::new(BalanceHub::new(10));
        let executor = Arc::new(TxExecutor::new(store.clone()).with_jitter(Arc::new(NoJitter)));
        let service = TransactionService::new(
            store.clone(),
            store.clone(),
            FxEngine::new(rates.clone()),
            hub.clone(),
        )
        .with_executor(executor)
        .with_clock(clock.clone());
        Harness {
            store,
            service,
            hub,
            clock,
            rates,
        }
    }

    async fn balance(store: &MemoryLedgerStore, id: AccountId) -> i64 {
        store.get_account(id).await.unwrap().balance
    }

    fn transfer(user: UserId, from: AccountId, to: AccountId, amount: i64) -> TransferRequest {
        TransferRequest {
            user_id: user,
            from_account_id: from,
            to_account_id: to,
            amount_minor: amount,
            client_request_id: None,
        }
    }

    fn exchange(user: UserId, from: AccountId, to: AccountId, amount: i64) -> ExchangeRequest {
        ExchangeRequest {
            user_id: user,
            from_account_id: from,
            to_account_id: to,
            amount_minor: amount,
            client_request_id: None,
            quote_id: None,
            quoted_rate: None,
        }
    }

    /// A user with a funded USD account and an empty EUR account, and a
    /// EUR house able to pay out `eur_liquidity`.
    async fn exchange_setup(h: &Harness, eur_liquidity: i64) -> (UserId, AccountId, AccountId) {
        let user = UserId::new();
        seed_system_account(&*h.store, Currency::eur(), eur_liquidity).await.unwrap();
        let usd = seed_user_account(&*h.store, user, Currency::usd(), 10_000).await.unwrap();
        let eur = seed_user_account(&*h.store, user, Currency::eur(), 0).await.unwrap();
        (user, usd, eur)
    }

    #[tokio::test]
    async fn test_transfer_moves_money_and_notifies_both_owners() {
        let h = harness();
        let alice = UserId::new();
        let bob = UserId::new();
        let a = seed_user_account(&*h.store, alice, Currency::usd(), 10_000).await.unwrap();
        let b = seed_user_account(&*h.store, bob, Currency::usd(), 5_000).await.unwrap();
        let mut alice_sub = h.hub.register(alice);
        let mut bob_sub = h.hub.register(bob);

        let id = h.service.transfer(transfer(alice, a, b, 1_000)).await.unwrap();

        assert_eq!(balance(&h.store, a).await, 9_000);
        assert_eq!(balance(&h.store, b).await, 6_000);

        let entries = h.store.entries_for_transaction(id).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!((entries[0].account_id, entries[0].amount), (a, -1_000));
        assert_eq!((entries[1].account_id, entries[1].amount), (b, 1_000));
        assert_eq!(entries[0].description, "Transfer debit");

        let record = h.store.transaction(id).await.unwrap();
        assert_eq!(record.kind, TransactionKind::Transfer);
        assert_eq!(record.amount, 1_000);
        assert_eq!(record.user_id, Some(alice));

        let audit = h.store.audit_records();
        assert!(audit.iter().any(|r| r.action == "transfer" && r.entity_id == id.to_string()));

        let to_alice: BalanceUpdate =
            serde_json::from_str(&alice_sub.receiver.recv().await.unwrap()).unwrap();
        assert_eq!(to_alice.account_id, a);
        assert_eq!(to_alice.balance, "90.00");
        let to_bob: BalanceUpdate = serde_json::from_str(&bob_sub.receiver.recv().await.unwrap()).unwrap();
        assert_eq!(to_bob.balance, "60.00");

        assert_eq!(h.service.metrics().snapshot().transfers, 1);
    }

    #[tokio::test]
    async fn test_transfer_rejections_leave_balances_untouched() {
        let h = harness();
        let alice = UserId::new();
        let bob = UserId::new();
        let a = seed_user_account(&*h.store, alice, Currency::usd(), 1_000).await.unwrap();
        let b = seed_user_account(&*h.store, bob, Currency::usd(), 1_000).await.unwrap();
        let e = seed_user_account(&*h.store, bob, Currency::eur(), 1_000).await.unwrap();
        let records_before = h.store.transaction_count();

        let err = h.service.transfer(transfer(alice, a, b, 0)).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount));

        let err = h.service.transfer(transfer(alice, a, a, 10)).await.unwrap_err();
        assert!(matches!(err, LedgerError::SameAccountTransfer));

        let err = h.service.transfer(transfer(alice, b, a, 10)).await.unwrap_err();
        assert!(matches!(err, LedgerError::UnauthorizedAccount(id) if id == b));

        let err = h.service.transfer(transfer(bob, b, e, 10)).await.unwrap_err();
        assert!(matches!(err, LedgerError::CurrencyMismatch { .. }));

        let err = h.service.transfer(transfer(alice, a, b, 1_001)).await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientFunds { required: 1_001, available: 1_000, .. }
        ));

        assert_eq!(balance(&h.store, a).await, 1_000);
        assert_eq!(balance(&h.store, b).await, 1_000);
        assert_eq!(h.store.transaction_count(), records_before);
        assert_eq!(h.service.metrics().snapshot().rejections, 5);
    }

    #[tokio::test]
    async fn test_duplicate_client_request_applies_once() {
        let h = harness();
        let user = UserId::new();
        let a = seed_user_account(&*h.store, user, Currency::usd(), 10_000).await.unwrap();
        let b = seed_user_account(&*h.store, user, Currency::usd(), 0).await.unwrap();

        let mut request = transfer(user, a, b, 500);
        request.client_request_id = Some("req-42".to_string());

        let first = h.service.transfer(request.clone()).await.unwrap();
        let err = h.service.transfer(request).await.unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateRequest(_)));
        assert_eq!(err.class(), ledgerline_common::ErrorClass::Duplicate);

        assert_eq!(balance(&h.store, a).await, 9_500);
        assert_eq!(balance(&h.store, b).await, 500);
        let stored = h.store.transaction_by_client_request("req-42").await.unwrap().unwrap();
        assert_eq!(stored.id, first);
        assert_eq!(h.service.metrics().snapshot().duplicates, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_transfers_lose_no_updates() {
        let h = harness();
        let user = UserId::new();
        let a = seed_user_account(&*h.store, user, Currency::usd(), 10_000).await.unwrap();
        let b = seed_user_account(&*h.store, user, Currency::usd(), 5_000).await.unwrap();
        let service = Arc::new(h.service);

        // alternate directions so both lock orders are requested
        let tasks: Vec<_> = (0..10)
            .map(|i| {
                let service = service.clone();
                let request = if i % 2 == 0 {
                    transfer(user, a, b, 100)
                } else {
                    transfer(user, b, a, 30)
                };
                tokio::spawn(async move { service.transfer(request).await })
            })
            .collect();
        for result in futures::future::join_all(tasks).await {
            result.unwrap().unwrap();
        }

        assert_eq!(balance(&h.store, a).await, 10_000 - 5 * 100 + 5 * 30);
        assert_eq!(balance(&h.store, b).await, 5_000 + 5 * 100 - 5 * 30);
        let report = h.store.reconcile().await.unwrap();
        assert!(report.iter().all(|row| row.is_consistent()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflict_is_retried_and_commits_once() {
        let h = harness();
        let user = UserId::new();
        let a = seed_user_account(&*h.store, user, Currency::usd(), 10_000).await.unwrap();
        let b = seed_user_account(&*h.store, user, Currency::usd(), 5_000).await.unwrap();
        let commits_before = h.store.commit_count();

        h.store.inject_commit_conflicts(1);
        let id = h.service.transfer(transfer(user, a, b, 1_000)).await.unwrap();

        assert_eq!(h.store.commit_count(), commits_before + 1);
        assert_eq!(h.service.executor().stats().retries, 1);
        assert_eq!(h.store.entries_for_transaction(id).await.unwrap().len(), 2);
        assert_eq!(balance(&h.store, a).await, 9_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_conflict_exhausts_retries() {
        let h = harness();
        let user = UserId::new();
        let a = seed_user_account(&*h.store, user, Currency::usd(), 10_000).await.unwrap();
        let b = seed_user_account(&*h.store, user, Currency::usd(), 0).await.unwrap();

        h.store.inject_commit_conflicts(5);
        let err = h.service.transfer(transfer(user, a, b, 1)).await.unwrap_err();

        assert!(matches!(err, LedgerError::RetryLimitExceeded { attempts: 5 }));
        assert_eq!(err.class(), ledgerline_common::ErrorClass::Transient);
        assert_eq!(balance(&h.store, a).await, 10_000);
        assert_eq!(h.service.metrics().snapshot().retry_exhausted, 1);
    }

    #[tokio::test]
    async fn test_audit_failure_rolls_back_transfer() {
        let h = harness();
        let user = UserId::new();
        let a = seed_user_account(&*h.store, user, Currency::usd(), 10_000).await.unwrap();
        let b = seed_user_account(&*h.store, user, Currency::usd(), 0).await.unwrap();
        let records_before = h.store.transaction_count();
        let mut sub = h.hub.register(user);

        let service = TransactionService::new(
            h.store.clone(),
            Arc::new(FailingAudit),
            FxEngine::new(h.rates.clone()),
            h.hub.clone(),
        );
        let err = service.transfer(transfer(user, a, b, 100)).await.unwrap_err();

        assert!(matches!(err, LedgerError::Database(_)));
        assert_eq!(balance(&h.store, a).await, 10_000);
        assert_eq!(h.store.transaction_count(), records_before);
        assert!(sub.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_quoted_exchange_posts_four_balanced_entries() {
        let h = harness();
        let (user, usd, eur) = exchange_setup(&h, 1_000_000).await;
        let usd_house = h.store.find_system_account(&Currency::usd()).await.unwrap().unwrap();
        let eur_house = h.store.find_system_account(&Currency::eur()).await.unwrap().unwrap();

        let quote = h
            .service
            .quote_exchange(QuoteRequest {
                user_id: user,
                from_account_id: usd,
                to_account_id: eur,
                amount_minor: 1_000,
            })
            .await
            .unwrap();
        assert_eq!(quote.rate.to_string(), "0.920000");
        assert_eq!(quote.converted_minor, 920);
        assert_eq!(quote.expires_at, h.clock.now() + chrono::Duration::minutes(2));

        let mut request = exchange(user, usd, eur, 1_000);
        request.quote_id = Some(quote.quote_id);
        let id = h.service.exchange(request).await.unwrap();

        assert_eq!(balance(&h.store, usd).await, 9_000);
        assert_eq!(balance(&h.store, eur).await, 920);
        assert_eq!(balance(&h.store, usd_house.id).await, usd_house.balance + 1_000);
        assert_eq!(balance(&h.store, eur_house.id).await, eur_house.balance - 920);

        let entries = h.store.entries_for_transaction(id).await.unwrap();
        let amounts: Vec<(AccountId, i64)> = entries.iter().map(|e| (e.account_id, e.amount)).collect();
        assert_eq!(
            amounts,
            vec![(usd, -1_000), (usd_house.id, 1_000), (eur_house.id, -920), (eur, 920)]
        );

        let record = h.store.transaction(id).await.unwrap();
        assert_eq!(record.kind, TransactionKind::Exchange);
        assert_eq!(record.metadata["rate"], "0.920000");
        assert_eq!(record.metadata["quote_id"], quote.quote_id.to_string());
        assert!(h.store.get_quote(quote.quote_id).await.unwrap().is_consumed());

        let report = h.store.reconcile().await.unwrap();
        assert!(report.iter().all(|row| row.is_consistent()));
    }

    #[tokio::test]
    async fn test_quote_is_single_use() {
        let h = harness();
        let (user, usd, eur) = exchange_setup(&h, 1_000_000).await;
        let quote = h
            .service
            .quote_exchange(QuoteRequest {
                user_id: user,
                from_account_id: usd,
                to_account_id: eur,
                amount_minor: 1_000,
            })
            .await
            .unwrap();

        let mut request = exchange(user, usd, eur, 1_000);
        request.quote_id = Some(quote.quote_id);
        h.service.exchange(request.clone()).await.unwrap();
        let err = h.service.exchange(request).await.unwrap_err();

        assert!(matches!(err, LedgerError::QuoteConsumed(id) if id == quote.quote_id));
        assert_eq!(balance(&h.store, usd).await, 9_000);
    }

    #[tokio::test]
    async fn test_concurrent_quote_reuse_succeeds_once() {
        let h = harness();
        let (user, usd, eur) = exchange_setup(&h, 1_000_000).await;
        let quote = h
            .service
            .quote_exchange(QuoteRequest {
                user_id: user,
                from_account_id: usd,
                to_account_id: eur,
                amount_minor: 1_000,
            })
            .await
            .unwrap();

        let mut request = exchange(user, usd, eur, 1_000);
        request.quote_id = Some(quote.quote_id);
        let (first, second) = tokio::join!(
            h.service.exchange(request.clone()),
            h.service.exchange(request)
        );

        let outcomes = [first, second];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes
            .iter()
            .any(|r| matches!(r, Err(LedgerError::QuoteConsumed(_)))));
        assert_eq!(balance(&h.store, eur).await, 920);
    }

    #[tokio::test]
    async fn test_expired_quote_is_rejected() {
        let h = harness();
        let (user, usd, eur) = exchange_setup(&h, 1_000_000).await;
        let quote = h
            .service
            .quote_exchange(QuoteRequest {
                user_id: user,
                from_account_id: usd,
                to_account_id: eur,
                amount_minor: 1_000,
            })
            .await
            .unwrap();

        h.clock.advance(chrono::Duration::minutes(2));
        let mut request = exchange(user, usd, eur, 1_000);
        request.quote_id = Some(quote.quote_id);
        let err = h.service.exchange(request).await.unwrap_err();

        assert!(matches!(err, LedgerError::QuoteExpired(_)));
        assert_eq!(balance(&h.store, usd).await, 10_000);
        assert!(!h.store.get_quote(quote.quote_id).await.unwrap().is_consumed());
    }

    #[tokio::test]
    async fn test_quote_must_match_request() {
        let h = harness();
        let (user, usd, eur) = exchange_setup(&h, 1_000_000).await;
        let quote = h
            .service
            .quote_exchange(QuoteRequest {
                user_id: user,
                from_account_id: usd,
                to_account_id: eur,
                amount_minor: 1_000,
            })
            .await
            .unwrap();

        let mut request = exchange(user, usd, eur, 2_000);
        request.quote_id = Some(quote.quote_id);
        let err = h.service.exchange(request).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidExchangeRequest(_)));

        let mut request = exchange(user, usd, eur, 1_000);
        request.quote_id = Some(QuoteId::new());
        let err = h.service.exchange(request).await.unwrap_err();
        assert!(matches!(err, LedgerError::QuoteNotFound(_)));
    }

    #[tokio::test]
    async fn test_rate_move_after_quote_is_a_mismatch() {
        let h = harness();
        let (user, usd, eur) = exchange_setup(&h, 1_000_000).await;
        let quote = h
            .service
            .quote_exchange(QuoteRequest {
                user_id: user,
                from_account_id: usd,
                to_account_id: eur,
                amount_minor: 1_000,
            })
            .await
            .unwrap();

        h.rates.set_rate(
            CurrencyPair::new(Currency::usd(), Currency::eur()),
            Rate::new(dec!(0.95)).unwrap(),
        );
        let mut request = exchange(user, usd, eur, 1_000);
        request.quote_id = Some(quote.quote_id);
        let err = h.service.exchange(request).await.unwrap_err();

        assert!(matches!(err, LedgerError::RateMismatch { ref committed, ref current }
            if committed == "0.920000" && current == "0.950000"));
        // the rollback leaves the quote usable once the rate returns
        assert!(!h.store.get_quote(quote.quote_id).await.unwrap().is_consumed());
        assert_eq!(balance(&h.store, usd).await, 10_000);
    }

    #[tokio::test]
    async fn test_inline_rate_exchange_in_both_directions() {
        let h = harness();
        let (user, usd, eur) = exchange_setup(&h, 1_000_000).await;

        let mut request = exchange(user, usd, eur, 1_000);
        request.quoted_rate = Some("0.93".to_string());
        let err = h.service.exchange(request.clone()).await.unwrap_err();
        assert!(matches!(err, LedgerError::RateMismatch { .. }));

        request.quoted_rate = Some("0.92".to_string());
        h.service.exchange(request).await.unwrap();
        assert_eq!(balance(&h.store, eur).await, 920);

        // 1/0.92 normalizes to 1.086957; 500 * 1.086957 = 543.4785
        let mut back = exchange(user, eur, usd, 500);
        back.quoted_rate = Some("1.086957".to_string());
        let id = h.service.exchange(back).await.unwrap();
        assert_eq!(balance(&h.store, eur).await, 420);
        assert_eq!(balance(&h.store, usd).await, 9_000 + 543);
        assert_eq!(h.store.transaction(id).await.unwrap().metadata["rate"], "1.086957");
    }

    #[tokio::test]
    async fn test_house_liquidity_limits_payout() {
        let h = harness();
        let (user, usd, eur) = exchange_setup(&h, 100).await;
        let eur_house = h.store.find_system_account(&Currency::eur()).await.unwrap().unwrap();

        let mut request = exchange(user, usd, eur, 1_000);
        request.quoted_rate = Some("0.92".to_string());
        let err = h.service.exchange(request).await.unwrap_err();

        assert!(matches!(
            err,
            LedgerError::InsufficientFunds { account_id, required: 920, available: 100 }
                if account_id == eur_house.id
        ));
    }

    #[tokio::test]
    async fn test_exchange_request_validation() {
        let h = harness();
        let (user, usd, eur) = exchange_setup(&h, 1_000_000).await;
        let other_usd = seed_user_account(&*h.store, user, Currency::usd(), 0).await.unwrap();

        let err = h.service.exchange(exchange(user, usd, eur, 1_000)).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidExchangeRequest(_)));

        let mut request = exchange(user, usd, eur, 0);
        request.quoted_rate = Some("0.92".to_string());
        assert!(matches!(
            h.service.exchange(request).await.unwrap_err(),
            LedgerError::InvalidAmount
        ));

        let mut request = exchange(user, usd, other_usd, 100);
        request.quoted_rate = Some("1".to_string());
        assert!(matches!(
            h.service.exchange(request).await.unwrap_err(),
            LedgerError::InvalidExchangeRequest(_)
        ));

        let mut request = exchange(user, usd, eur, 100);
        request.quoted_rate = Some("abc".to_string());
        assert!(matches!(
            h.service.exchange(request).await.unwrap_err(),
            LedgerError::InvalidRate(_)
        ));

        let err = h
            .service
            .quote_exchange(QuoteRequest {
                user_id: UserId::new(),
                from_account_id: usd,
                to_account_id: eur,
                amount_minor: 100,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::UnauthorizedAccount(_)));

        let err = h
            .service
            .quote_exchange(QuoteRequest {
                user_id: user,
                from_account_id: usd,
                to_account_id: eur,
                amount_minor: -5,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidExchangeRequest(_)));
    }

    #[tokio::test]
    async fn test_exchange_into_another_users_account_is_rejected() {
        let h = harness();
        let (alice, usd, _) = exchange_setup(&h, 1_000_000).await;
        let bob = UserId::new();
        let bob_eur = seed_user_account(&*h.store, bob, Currency::eur(), 0).await.unwrap();

        let err = h
            .service
            .quote_exchange(QuoteRequest {
                user_id: alice,
                from_account_id: usd,
                to_account_id: bob_eur,
                amount_minor: 1_000,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::UnauthorizedAccount(id) if id == bob_eur));

        let mut request = exchange(alice, usd, bob_eur, 1_000);
        request.quoted_rate = Some("0.92".to_string());
        let err = h.service.exchange(request).await.unwrap_err();
        assert!(matches!(err, LedgerError::UnauthorizedAccount(id) if id == bob_eur));

        assert_eq!(balance(&h.store, usd).await, 10_000);
        assert_eq!(balance(&h.store, bob_eur).await, 0);
    }

    #[tokio::test]
    async fn test_currency_without_house_account_is_an_invalid_pair() {
        let h = harness();
        let (user, _, eur) = exchange_setup(&h, 1_000_000).await;
        let gbp = Account::for_user(user, Currency::new("GBP"), 0);
        let tx = h.store.begin().await.unwrap();
        h.store.create_account(&tx, &gbp).await.unwrap();
        h.store.commit(tx).await.unwrap();

        let mut request = exchange(user, gbp.id, eur, 100);
        request.quoted_rate = Some("1".to_string());
        let err = h.service.exchange(request).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidExchangeRequest(_)));
        assert_eq!(err.class(), ledgerline_common::ErrorClass::Business);
    }

    #[tokio::test]
    async fn test_exchange_locks_all_accounts_in_id_order() {
        let h = harness();
        let (user, usd, eur) = exchange_setup(&h, 1_000_000).await;
        h.store.take_lock_trace();

        let mut request = exchange(user, usd, eur, 100);
        request.quoted_rate = Some("0.92".to_string());
        h.service.exchange(request).await.unwrap();

        let trace = h.store.take_lock_trace();
        assert_eq!(trace.len(), 4);
        let mut sorted = trace.clone();
        sorted.sort();
        assert_eq!(trace, sorted);
    }

    #[tokio::test]
    async fn test_dropped_call_leaves_no_trace() {
        let h = harness();
        let user = UserId::new();
        let a = seed_user_account(&*h.store, user, Currency::usd(), 1_000).await.unwrap();
        let b = seed_user_account(&*h.store, user, Currency::usd(), 0).await.unwrap();

        // hold a's row lock so the transfer parks inside its transaction
        let blocker = h.store.begin().await.unwrap();
        h.store.get_for_update(&blocker, a).await.unwrap();

        let mut request = transfer(user, a, b, 100);
        request.client_request_id = Some("cancel-me".to_string());
        let pending = h.service.transfer(request.clone());
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(20), pending).await;
        assert!(timed_out.is_err());
        h.store.rollback(blocker).await.unwrap();

        // the key lock went with the dropped call
        h.service.transfer(request).await.unwrap();
        assert_eq!(balance(&h.store, a).await, 900);
    }
}
