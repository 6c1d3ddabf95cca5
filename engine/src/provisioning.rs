//! House account bootstrap and user account opening.

use std::sync::Arc;

use ledgerline_common::{Currency, LedgerError, Result, UserId};
use ledgerline_ledger::provision::{create_system_account, open_funded_account, FundedAccount};
use ledgerline_ledger::{Account, AuditRecord, AuditSink, LedgerStore, TxExecutor};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::config::BootstrapConfig;

/// Opens accounts through the transactional executor.
pub struct AccountProvisioner<S: LedgerStore> {
    store: Arc<S>,
    executor: Arc<TxExecutor<S>>,
    audit: Arc<dyn AuditSink<S::Tx>>,
    defaults: BootstrapConfig,
}

impl<S: LedgerStore> AccountProvisioner<S> {
    pub fn new(
        store: Arc<S>,
        executor: Arc<TxExecutor<S>>,
        audit: Arc<dyn AuditSink<S::Tx>>,
        defaults: BootstrapConfig,
    ) -> Self {
        Self {
            store,
            executor,
            audit,
            defaults,
        }
    }

    /// Return the house account for `currency`, creating and capitalizing
    /// it first if it does not exist yet.
    ///
    /// An existing account is returned unchanged, whatever its capital.
    #[instrument(skip(self), fields(currency = %currency))]
    pub async fn ensure_system_account(&self, currency: &Currency, capital_minor: i64) -> Result<Account> {
        if let Some(existing) = self.store.find_system_account(currency).await? {
            return Ok(existing);
        }

        let created = self
            .executor
            .with_transaction(|tx| async move {
                let house = create_system_account(&*self.store, &tx, currency, capital_minor).await?;
                self.audit
                    .log(
                        &tx,
                        AuditRecord::new(
                            None,
                            "create_system_account",
                            "account",
                            house.id,
                            json!({ "currency": currency, "capital": capital_minor }),
                        ),
                    )
                    .await?;
                Ok(house)
            })
            .await;

        match created {
            Ok(house) => {
                info!(account_id = %house.id, capital = capital_minor, "System account created");
                Ok(house)
            }
            Err(err) => {
                // lost a race with a concurrent bootstrap
                if let Some(existing) = self.store.find_system_account(currency).await? {
                    warn!(error = %err, "System account created concurrently");
                    return Ok(existing);
                }
                Err(err)
            }
        }
    }

    /// Open one account per `(currency, opening balance)` pair for `user_id`,
    /// all in one transaction. Opening balances are paid by the house
    /// accounts.
    #[instrument(skip(self, openings), fields(user_id = %user_id))]
    pub async fn open_accounts(
        &self,
        user_id: UserId,
        openings: &[(Currency, i64)],
    ) -> Result<Vec<FundedAccount>> {
        if openings.is_empty() {
            return Err(LedgerError::InvalidAmount);
        }
        if openings.iter().any(|(_, minor)| *minor < 0) {
            return Err(LedgerError::InvalidAmount);
        }

        let opened = self
            .executor
            .with_transaction(|tx| async move {
                let mut opened = Vec::with_capacity(openings.len());
                for (currency, opening_minor) in openings {
                    let funded =
                        open_funded_account(&*self.store, &tx, user_id, currency, *opening_minor).await?;
                    self.audit
                        .log(
                            &tx,
                            AuditRecord::new(
                                Some(user_id),
                                "open_account",
                                "account",
                                funded.account.id,
                                json!({
                                    "currency": currency,
                                    "opening_balance": opening_minor,
                                    "funding_transaction": funded.funding_transaction,
                                }),
                            ),
                        )
                        .await?;
                    opened.push(funded);
                }
                Ok(opened)
            })
            .await?;

        info!(accounts = opened.len(), "User accounts opened");
        Ok(opened)
    }

    /// Open the default USD and EUR accounts for a new user.
    pub async fn register_user(&self, user_id: UserId) -> Result<Vec<FundedAccount>> {
        self.open_accounts(
            user_id,
            &[
                (Currency::usd(), self.defaults.opening_balance_usd),
                (Currency::eur(), self.defaults.opening_balance_eur),
            ],
        )
        .await
    }

    /// Ensure the USD and EUR house accounts with the configured capital.
    pub async fn bootstrap(&self) -> Result<Vec<Account>> {
        Ok(vec![
            self.ensure_system_account(&Currency::usd(), self.defaults.system_capital_usd)
                .await?,
            self.ensure_system_account(&Currency::eur(), self.defaults.system_capital_eur)
                .await?,
        ])
    }
}
