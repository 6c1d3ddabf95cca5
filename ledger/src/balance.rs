//! Reconciliation of cached balances against the entry log.

use ledgerline_common::{format_minor, AccountId, Currency};
use serde::{Deserialize, Serialize};

/// Cached balance versus the sum of the account's ledger entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountReconciliation {
    pub account_id: AccountId,
    pub currency: Currency,
    pub is_system: bool,
    pub stored_balance: i64,
    pub ledger_balance: i64,
}

impl AccountReconciliation {
    pub fn is_consistent(&self) -> bool {
        self.stored_balance == self.ledger_balance
    }

    /// Stored minus ledger; zero when consistent.
    pub fn drift(&self) -> i128 {
        i128::from(self.stored_balance) - i128::from(self.ledger_balance)
    }
}

/// Summary over a full reconciliation run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub accounts_checked: usize,
    pub drifted: Vec<AccountReconciliation>,
}

impl ReconciliationReport {
    pub fn from_rows(rows: Vec<AccountReconciliation>) -> Self {
        let accounts_checked = rows.len();
        let drifted = rows.into_iter().filter(|r| !r.is_consistent()).collect();
        Self {
            accounts_checked,
            drifted,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.drifted.is_empty()
    }

    /// One line per drifted account, for operator output.
    pub fn describe_drift(&self) -> Vec<String> {
        self.drifted
            .iter()
            .map(|r| {
                format!(
                    "{} {}: stored {} ledger {}",
                    r.account_id,
                    r.currency,
                    format_minor(r.stored_balance),
                    format_minor(r.ledger_balance)
                )
            })
            .collect()
    }
}
