//! Account creation and funding inside an open transaction.
//!
//! Money only enters the ledger through capitalization of a house account.
//! User accounts are funded from their currency's house account with an
//! ordinary two-entry movement, so `balance == sum(entries)` holds for every
//! account from the moment it exists.

use ledgerline_common::{AccountId, Currency, LedgerError, Result, TransactionId, UserId};
use serde_json::json;
use tracing::info;

use crate::account::Account;
use crate::journal::JournalBatch;
use crate::locking::lock_accounts;
use crate::store::LedgerStore;
use crate::transaction::{TransactionKind, TransactionRecord};

/// A newly opened user account and the funding record that paid its
/// opening balance, if any.
#[derive(Debug, Clone)]
pub struct FundedAccount {
    pub account: Account,
    pub funding_transaction: Option<TransactionId>,
}

/// Credit `amount_minor` of outside equity to a house account.
pub async fn inject_capital<S>(
    store: &S,
    tx: &S::Tx,
    house_id: AccountId,
    amount_minor: i64,
) -> Result<TransactionId>
where
    S: LedgerStore + ?Sized,
{
    if amount_minor <= 0 {
        return Err(LedgerError::InvalidAmount);
    }
    let house = store.get_for_update(tx, house_id).await?;
    if !house.is_system {
        return Err(LedgerError::InvariantViolation(format!(
            "capital can only be injected into a system account, {} is a user account",
            house.id
        )));
    }

    let mut record = TransactionRecord::completed(
        TransactionKind::Capitalization,
        None,
        amount_minor,
        house.currency.clone(),
    )
    .with_metadata(json!({ "capitalization": true }));
    record.to_account_id = Some(house.id);

    let mut batch = JournalBatch::new(record.id, TransactionKind::Capitalization);
    batch.push(house.id, amount_minor, &house.currency, "Capital injection");
    let entries = batch.into_validated()?;

    let balance = house.balance.checked_add(amount_minor).ok_or_else(|| {
        LedgerError::InvariantViolation(format!("balance overflow on {}", house.id))
    })?;
    store.update_balance(tx, house.id, balance).await?;
    store.insert_transaction(tx, &record).await?;
    store.insert_ledger_entries(tx, &entries).await?;

    info!(
        account_id = %house.id,
        currency = %house.currency,
        amount = amount_minor,
        "Capital injected"
    );
    Ok(record.id)
}

/// Create the house account for `currency`, optionally capitalized.
pub async fn create_system_account<S>(
    store: &S,
    tx: &S::Tx,
    currency: &Currency,
    capital_minor: i64,
) -> Result<Account>
where
    S: LedgerStore + ?Sized,
{
    if capital_minor < 0 {
        return Err(LedgerError::InvalidAmount);
    }
    let mut house = Account::system(currency.clone(), 0);
    store.create_account(tx, &house).await?;
    if capital_minor > 0 {
        inject_capital(store, tx, house.id, capital_minor).await?;
        house.balance = capital_minor;
    }
    Ok(house)
}

/// Open a user account and pay its opening balance from the house account.
///
/// Fails with `InsufficientFunds` when the house cannot cover the amount.
pub async fn open_funded_account<S>(
    store: &S,
    tx: &S::Tx,
    user_id: UserId,
    currency: &Currency,
    opening_minor: i64,
) -> Result<FundedAccount>
where
    S: LedgerStore + ?Sized,
{
    if opening_minor < 0 {
        return Err(LedgerError::InvalidAmount);
    }
    let house_id = store.get_system_account(tx, currency).await?;
    let account = Account::for_user(user_id, currency.clone(), 0);
    store.create_account(tx, &account).await?;
    if opening_minor == 0 {
        return Ok(FundedAccount {
            account,
            funding_transaction: None,
        });
    }

    let mut locked = lock_accounts(store, tx, &[house_id, account.id]).await?;
    let house = locked.get(house_id)?;
    if house.balance < opening_minor {
        return Err(LedgerError::InsufficientFunds {
            account_id: house_id,
            required: opening_minor,
            available: house.balance,
        });
    }

    let record = TransactionRecord::completed(
        TransactionKind::Funding,
        Some(user_id),
        opening_minor,
        currency.clone(),
    )
    .between(house_id, account.id)
    .with_metadata(json!({ "opening_balance": true }));

    let mut batch = JournalBatch::new(record.id, TransactionKind::Funding);
    batch
        .push(house_id, -opening_minor, currency, "Opening balance debit")
        .push(account.id, opening_minor, currency, "Opening balance credit");
    let entries = batch.into_validated()?;

    locked.apply(&entries)?;
    locked.write_balances(store, tx).await?;
    store.insert_transaction(tx, &record).await?;
    store.insert_ledger_entries(tx, &entries).await?;

    Ok(FundedAccount {
        account: locked.get(account.id)?.clone(),
        funding_transaction: Some(record.id),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLedgerStore;
    use crate::store::TxBackend;

    #[tokio::test]
    async fn test_funding_moves_house_liquidity() {
        let store = MemoryLedgerStore::new();
        let tx = store.begin().await.unwrap();
        let house = create_system_account(&store, &tx, &Currency::usd(), 1_000_000)
            .await
            .unwrap();
        let funded = open_funded_account(&store, &tx, UserId::new(), &Currency::usd(), 100_000)
            .await
            .unwrap();
        store.commit(tx).await.unwrap();

        assert_eq!(funded.account.balance, 100_000);
        assert_eq!(store.get_account(house.id).await.unwrap().balance, 900_000);

        let funding = store
            .transaction(funded.funding_transaction.unwrap())
            .await
            .unwrap();
        assert_eq!(funding.kind, TransactionKind::Funding);
        assert_eq!(funding.metadata["opening_balance"], true);

        let report = store.reconcile().await.unwrap();
        assert!(report.iter().all(|r| r.is_consistent()));
    }

    #[tokio::test]
    async fn test_funding_requires_house_liquidity() {
        let store = MemoryLedgerStore::new();
        let tx = store.begin().await.unwrap();
        create_system_account(&store, &tx, &Currency::eur(), 100).await.unwrap();
        let err = open_funded_account(&store, &tx, UserId::new(), &Currency::eur(), 101)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { required: 101, available: 100, .. }));
    }

    #[tokio::test]
    async fn test_missing_house_is_reported() {
        let store = MemoryLedgerStore::new();
        let tx = store.begin().await.unwrap();
        let err = open_funded_account(&store, &tx, UserId::new(), &Currency::eur(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_capital_only_for_house_accounts() {
        let store = MemoryLedgerStore::new();
        let tx = store.begin().await.unwrap();
        create_system_account(&store, &tx, &Currency::usd(), 500).await.unwrap();
        let funded = open_funded_account(&store, &tx, UserId::new(), &Currency::usd(), 0)
            .await
            .unwrap();
        assert!(funded.funding_transaction.is_none());
        let err = inject_capital(&store, &tx, funded.account.id, 10).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvariantViolation(_)));
    }
}
