//! Fixtures for tests that need funded accounts.

use ledgerline_common::{AccountId, Currency, LedgerError, Result, UserId};

use crate::provision::{create_system_account, inject_capital, open_funded_account};
use crate::store::{LedgerStore, TxBackend};

/// Create a capitalized house account for `currency`.
pub async fn seed_system_account<S: LedgerStore>(
    store: &S,
    currency: Currency,
    capital_minor: i64,
) -> Result<AccountId> {
    let tx = store.begin().await?;
    let house = create_system_account(store, &tx, &currency, capital_minor).await?;
    store.commit(tx).await?;
    Ok(house.id)
}

/// Open a user account holding `balance_minor`.
///
/// The house account is created if missing and topped up with fresh capital
/// when it cannot cover the opening balance.
pub async fn seed_user_account<S: LedgerStore>(
    store: &S,
    user_id: UserId,
    currency: Currency,
    balance_minor: i64,
) -> Result<AccountId> {
    let tx = store.begin().await?;
    let house_id = match store.get_system_account(&tx, &currency).await {
        Ok(id) => id,
        Err(LedgerError::NotFound { .. }) => create_system_account(store, &tx, &currency, 0).await?.id,
        Err(err) => return Err(err),
    };
    let house = store.get_for_update(&tx, house_id).await?;
    if house.balance < balance_minor {
        inject_capital(store, &tx, house_id, balance_minor - house.balance).await?;
    }
    let funded = open_funded_account(store, &tx, user_id, &currency, balance_minor).await?;
    store.commit(tx).await?;
    Ok(funded.account.id)
}
