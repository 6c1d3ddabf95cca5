//! Simulation controller.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ledgerline_common::{Currency, ErrorClass, LedgerError, Result, UserId};
use ledgerline_engine::{
    AccountProvisioner, BalanceHub, EngineConfig, EngineMetrics, ExchangeRequest, QuoteRequest,
    TransactionService, TransferRequest,
};
use ledgerline_fx::FxEngine;
use ledgerline_ledger::{LedgerStore, MemoryLedgerStore, ReconciliationReport, TxExecutor};

use crate::metrics::SimulationMetrics;
use crate::population::{register_users, SimulatedUser};
use crate::scenario::{Operation, RateSource, ScenarioKind, HOT_PAIR_AMOUNT};

/// Result of one generated operation.
struct Outcome {
    result: std::result::Result<(), LedgerError>,
    latency: Duration,
    /// Result of replaying the consumed quote, when the plan asked for it.
    reuse: Option<std::result::Result<(), LedgerError>>,
}

/// Drives a scenario against an in-memory engine and checks its invariants.
pub struct SimulationController {
    config: EngineConfig,
    store: Arc<MemoryLedgerStore>,
    service: TransactionService<MemoryLedgerStore>,
    provisioner: AccountProvisioner<MemoryLedgerStore>,
    fx: FxEngine,
    hub: Arc<BalanceHub>,
    engine_metrics: Arc<EngineMetrics>,
    rng: StdRng,
    users: Vec<SimulatedUser>,
    subscribers: Vec<(UserId, u64)>,
    listeners: Vec<JoinHandle<()>>,
    delivered: Arc<AtomicU64>,
    metrics: SimulationMetrics,
    violations: Vec<String>,
}

impl SimulationController {
    pub fn new(config: EngineConfig, seed: Option<u64>) -> Result<Self> {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };

        let store = Arc::new(MemoryLedgerStore::new());
        let engine_metrics = Arc::new(EngineMetrics::new());
        let hub = Arc::new(BalanceHub::new(config.hub.subscriber_buffer).with_metrics(engine_metrics.clone()));
        let fx = FxEngine::fixed_usd_eur(config.fx.usd_eur()?);

        let service = TransactionService::new(store.clone(), store.clone(), fx.clone(), hub.clone())
            .configured(&config)
            .with_metrics(engine_metrics.clone());
        let provisioner = AccountProvisioner::new(
            store.clone(),
            Arc::new(TxExecutor::new(store.clone()).with_policy(config.executor.retry_policy())),
            store.clone(),
            config.bootstrap.clone(),
        );

        Ok(Self {
            config,
            store,
            service,
            provisioner,
            fx,
            hub,
            engine_metrics,
            rng,
            users: Vec::new(),
            subscribers: Vec::new(),
            listeners: Vec::new(),
            delivered: Arc::new(AtomicU64::new(0)),
            metrics: SimulationMetrics::new(),
            violations: Vec::new(),
        })
    }

    /// Bootstrap the house accounts and register `user_count` users, each
    /// with one live balance subscriber.
    pub async fn initialize(&mut self, user_count: usize) -> Result<()> {
        let houses = self.provisioner.bootstrap().await?;
        for house in &houses {
            info!(currency = %house.currency, capital = house.balance, "House account ready");
        }

        self.users = register_users(&self.provisioner, user_count).await?;
        for user in &self.users {
            let mut subscription = self.hub.register(user.user_id);
            self.subscribers.push((subscription.user_id, subscription.subscriber_id));
            let delivered = self.delivered.clone();
            self.listeners.push(tokio::spawn(async move {
                while subscription.receiver.recv().await.is_some() {
                    delivered.fetch_add(1, Ordering::Relaxed);
                }
            }));
        }
        Ok(())
    }

    /// Force the next `count` commits to fail with a serialization conflict.
    pub fn inject_conflicts(&self, count: u32) {
        if count > 0 {
            info!(count, "Injecting commit conflicts");
            self.store.inject_commit_conflicts(count);
        }
    }

    /// Run `operations` operations of `scenario`, `concurrency` at a time.
    pub async fn run_scenario(&mut self, scenario: ScenarioKind, operations: usize, concurrency: usize) {
        if self.users.len() < 2 {
            self.violations
                .push("at least two users are required to run a scenario".to_string());
            return;
        }

        let plan = scenario.plan(&mut self.rng, self.users.len(), operations);
        info!(?scenario, operations = plan.len(), concurrency, "Running scenario");

        let started = Instant::now();
        let outcomes: Vec<Outcome> = {
            let this = &*self;
            stream::iter(plan)
                .map(move |op| this.execute(op))
                .buffer_unordered(concurrency.max(1))
                .collect()
                .await
        };
        info!(elapsed_ms = started.elapsed().as_millis() as u64, "Scenario finished");

        for outcome in outcomes {
            self.metrics.record(&outcome.result, outcome.latency);
            match outcome.reuse {
                Some(Ok(())) => self
                    .violations
                    .push("a consumed quote was accepted a second time".to_string()),
                Some(Err(LedgerError::QuoteConsumed(_))) => self.metrics.reuse_rejected += 1,
                Some(Err(err)) => self
                    .violations
                    .push(format!("quote reuse failed with {} instead of quote_consumed", err.error_code())),
                None => {}
            }
            if let Err(err) = &outcome.result {
                if err.class() == ErrorClass::Internal {
                    self.violations.push(format!("internal error: {err}"));
                }
            }
        }

        if scenario == ScenarioKind::HotPair {
            self.verify_hot_pair().await;
        }
    }

    async fn execute(&self, op: Operation) -> Outcome {
        let started = Instant::now();
        let (result, reuse) = match op {
            Operation::Transfer {
                from_user,
                to_user,
                currency,
                amount_minor,
            } => {
                let from = self.users[from_user];
                let to = self.users[to_user];
                let request = TransferRequest {
                    user_id: from.user_id,
                    from_account_id: from.account(&currency),
                    to_account_id: to.account(&currency),
                    amount_minor,
                    client_request_id: None,
                };
                (self.service.transfer(request).await.map(|_| ()), None)
            }
            Operation::Exchange {
                user,
                from,
                to,
                amount_minor,
                rate,
            } => self.exchange(self.users[user], &from, &to, amount_minor, rate).await,
        };
        if let Err(err) = &result {
            debug!(code = err.error_code(), "Operation rejected");
        }
        Outcome {
            result,
            latency: started.elapsed(),
            reuse,
        }
    }

    async fn exchange(
        &self,
        user: SimulatedUser,
        from: &Currency,
        to: &Currency,
        amount_minor: i64,
        source: RateSource,
    ) -> (
        std::result::Result<(), LedgerError>,
        Option<std::result::Result<(), LedgerError>>,
    ) {
        let mut request = ExchangeRequest {
            user_id: user.user_id,
            from_account_id: user.account(from),
            to_account_id: user.account(to),
            amount_minor,
            client_request_id: None,
            quote_id: None,
            quoted_rate: None,
        };

        match source {
            RateSource::Inline => {
                let rate = match self.fx.directional_rate(from, to).await {
                    Ok(rate) => rate,
                    Err(err) => return (Err(err.into()), None),
                };
                request.quoted_rate = Some(rate.to_string());
                (self.service.exchange(request).await.map(|_| ()), None)
            }
            RateSource::Quote { reuse } => {
                let quote = match self
                    .service
                    .quote_exchange(QuoteRequest {
                        user_id: user.user_id,
                        from_account_id: request.from_account_id,
                        to_account_id: request.to_account_id,
                        amount_minor,
                    })
                    .await
                {
                    Ok(quote) => quote,
                    Err(err) => return (Err(err), None),
                };
                request.quote_id = Some(quote.quote_id);
                let result = self.service.exchange(request.clone()).await.map(|_| ());
                let replay = if reuse && result.is_ok() {
                    Some(self.service.exchange(request).await.map(|_| ()))
                } else {
                    None
                };
                (result, replay)
            }
        }
    }

    async fn verify_hot_pair(&mut self) {
        let (sender, receiver) = (self.users[0], self.users[1]);
        let moved = self.metrics.succeeded as i64 * HOT_PAIR_AMOUNT;
        let opening = self.config.bootstrap.opening_balance_usd;
        for (account_id, expected) in [(sender.usd, opening - moved), (receiver.usd, opening + moved)] {
            match self.store.get_account(account_id).await {
                Ok(account) if account.balance == expected => {}
                Ok(account) => self.violations.push(format!(
                    "hot pair account {account_id} holds {} instead of {expected}",
                    account.balance
                )),
                Err(err) => self.violations.push(format!("hot pair account {account_id}: {err}")),
            }
        }
    }

    /// Check reconciliation, per-currency capital conservation and that no
    /// account went negative.
    pub async fn verify(&mut self) -> Result<()> {
        let report = ReconciliationReport::from_rows(self.store.reconcile().await?);
        if !report.is_clean() {
            self.violations.extend(report.describe_drift());
        }
        info!(accounts = report.accounts_checked, drifted = report.drifted.len(), "Reconciliation finished");

        let mut totals: BTreeMap<Currency, i128> = BTreeMap::new();
        for account in self.store.accounts() {
            if account.balance < 0 {
                self.violations
                    .push(format!("account {} is negative: {}", account.id, account.balance));
            }
            *totals.entry(account.currency.clone()).or_default() += i128::from(account.balance);
        }

        let expected = [
            (Currency::usd(), self.config.bootstrap.system_capital_usd),
            (Currency::eur(), self.config.bootstrap.system_capital_eur),
        ];
        for (currency, capital) in expected {
            let total = totals.get(&currency).copied().unwrap_or_default();
            if total != i128::from(capital) {
                self.violations.push(format!(
                    "{currency} total is {total}, expected the bootstrapped capital {capital}"
                ));
            }
        }
        Ok(())
    }

    /// Stop the subscribers and wait for their queues to drain.
    pub async fn shutdown(&mut self) {
        for (user_id, subscriber_id) in self.subscribers.drain(..) {
            self.hub.unregister(user_id, subscriber_id);
        }
        for listener in self.listeners.drain(..) {
            if let Err(err) = listener.await {
                warn!(error = %err, "Balance listener ended abnormally");
            }
        }
    }

    pub fn metrics(&self) -> &SimulationMetrics {
        &self.metrics
    }

    pub fn engine_metrics(&self) -> &EngineMetrics {
        &self.engine_metrics
    }

    pub fn notifications_delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn violations(&self) -> &[String] {
        &self.violations
    }
}
