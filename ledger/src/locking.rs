//! Deterministic multi-account locking.
//!
//! Every transaction that locks more than one account acquires the row
//! locks in ascending [`AccountId`] order. Two transactions contending for
//! an overlapping set therefore always queue on the same first row and can
//! never wait on each other in a cycle.

use std::collections::{BTreeMap, BTreeSet};

use ledgerline_common::{AccountId, LedgerError, Result};
use tracing::trace;

use crate::account::Account;
use crate::journal::LedgerEntry;
use crate::store::LedgerStore;

/// Accounts locked by the current transaction, with balances updated in
/// memory until [`LockedAccounts::write_balances`] persists them.
#[derive(Debug, Clone)]
pub struct LockedAccounts {
    accounts: BTreeMap<AccountId, Account>,
    touched: BTreeSet<AccountId>,
}

/// Lock `ids` in ascending order, ignoring duplicates.
pub async fn lock_accounts<S>(store: &S, tx: &S::Tx, ids: &[AccountId]) -> Result<LockedAccounts>
where
    S: LedgerStore + ?Sized,
{
    let ordered: BTreeSet<AccountId> = ids.iter().copied().collect();
    let mut accounts = BTreeMap::new();
    for id in ordered {
        trace!(account_id = %id, "locking account");
        let account = store.get_for_update(tx, id).await?;
        accounts.insert(id, account);
    }
    Ok(LockedAccounts {
        accounts,
        touched: BTreeSet::new(),
    })
}

impl LockedAccounts {
    pub fn get(&self, id: AccountId) -> Result<&Account> {
        self.accounts.get(&id).ok_or_else(|| {
            LedgerError::InvariantViolation(format!("account {id} used without its row lock"))
        })
    }

    /// Ids in the order their locks were taken.
    pub fn lock_order(&self) -> Vec<AccountId> {
        self.accounts.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Apply entries to the in-memory balances.
    pub fn apply(&mut self, entries: &[LedgerEntry]) -> Result<()> {
        for entry in entries {
            let account = self.accounts.get_mut(&entry.account_id).ok_or_else(|| {
                LedgerError::InvariantViolation(format!(
                    "entry for account {} without its row lock",
                    entry.account_id
                ))
            })?;
            if account.currency != entry.currency {
                return Err(LedgerError::InvariantViolation(format!(
                    "{} entry posted to {} account {}",
                    entry.currency, account.currency, account.id
                )));
            }
            account.balance = account.balance.checked_add(entry.amount).ok_or_else(|| {
                LedgerError::InvariantViolation(format!("balance overflow on {}", account.id))
            })?;
            self.touched.insert(entry.account_id);
        }
        Ok(())
    }

    /// Persist every balance changed by [`apply`](Self::apply).
    pub async fn write_balances<S>(&self, store: &S, tx: &S::Tx) -> Result<()>
    where
        S: LedgerStore + ?Sized,
    {
        for id in &self.touched {
            let account = self.get(*id)?;
            store.update_balance(tx, *id, account.balance).await?;
        }
        Ok(())
    }
}
