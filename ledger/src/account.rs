//! Account definitions for the ledger.

use chrono::Utc;
use ledgerline_common::{format_minor, AccountId, Currency, Timestamp, UserId};
use serde::{Deserialize, Serialize};

/// A ledger account holding a single currency.
///
/// `balance` is a cache of the sum of the account's ledger entries. It is
/// only written inside a transaction that holds the account's row lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    /// Owning user; `None` for the per-currency system (house) account.
    pub user_id: Option<UserId>,
    pub currency: Currency,
    /// Balance in minor units.
    pub balance: i64,
    pub is_system: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Account {
    /// A user-owned account.
    pub fn for_user(user_id: UserId, currency: Currency, balance: i64) -> Self {
        let now = Utc::now();
        Self {
            id: AccountId::new(),
            user_id: Some(user_id),
            currency,
            balance,
            is_system: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// The house account for `currency`.
    pub fn system(currency: Currency, balance: i64) -> Self {
        let now = Utc::now();
        Self {
            id: AccountId::new(),
            user_id: None,
            currency,
            balance,
            is_system: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_owned_by(&self, user_id: &UserId) -> bool {
        self.user_id.as_ref() == Some(user_id)
    }

    pub fn formatted_balance(&self) -> String {
        format_minor(self.balance)
    }
}
