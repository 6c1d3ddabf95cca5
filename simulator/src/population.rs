//! Simulated users and their accounts.

use ledgerline_common::{AccountId, Currency, Result, UserId};
use ledgerline_engine::AccountProvisioner;
use ledgerline_ledger::MemoryLedgerStore;
use tracing::info;

/// A registered user with one USD and one EUR account.
#[derive(Debug, Clone, Copy)]
pub struct SimulatedUser {
    pub user_id: UserId,
    pub usd: AccountId,
    pub eur: AccountId,
}

impl SimulatedUser {
    pub fn account(&self, currency: &Currency) -> AccountId {
        if *currency == Currency::eur() {
            self.eur
        } else {
            self.usd
        }
    }
}

/// Register `count` users with the default opening balances.
pub async fn register_users(
    provisioner: &AccountProvisioner<MemoryLedgerStore>,
    count: usize,
) -> Result<Vec<SimulatedUser>> {
    let mut users = Vec::with_capacity(count);
    for _ in 0..count {
        let user_id = UserId::new();
        let opened = provisioner.register_user(user_id).await?;
        let find = |currency: Currency| {
            opened
                .iter()
                .find(|f| f.account.currency == currency)
                .map(|f| f.account.id)
        };
        if let (Some(usd), Some(eur)) = (find(Currency::usd()), find(Currency::eur())) {
            users.push(SimulatedUser { user_id, usd, eur });
        }
    }
    info!(users = users.len(), "Registered simulated users");
    Ok(users)
}
