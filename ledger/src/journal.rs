//! Ledger entries and the balancing checks applied before they are written.

use std::collections::BTreeMap;

use chrono::Utc;
use ledgerline_common::{AccountId, Currency, EntryId, LedgerError, Result, Timestamp, TransactionId};
use serde::{Deserialize, Serialize};

use crate::transaction::TransactionKind;

/// An immutable, signed movement on one account. Negative amounts debit
/// the account, positive amounts credit it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub transaction_id: TransactionId,
    pub account_id: AccountId,
    pub amount: i64,
    pub currency: Currency,
    pub description: String,
    pub created_at: Timestamp,
}

impl LedgerEntry {
    pub fn new(
        transaction_id: TransactionId,
        account_id: AccountId,
        amount: i64,
        currency: Currency,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: EntryId::new(),
            transaction_id,
            account_id,
            amount,
            currency,
            description: description.into(),
            created_at: Utc::now(),
        }
    }
}

/// The entries of one transaction, validated as a unit before insert.
#[derive(Debug, Clone)]
pub struct JournalBatch {
    pub transaction_id: TransactionId,
    pub kind: TransactionKind,
    entries: Vec<LedgerEntry>,
}

impl JournalBatch {
    pub fn new(transaction_id: TransactionId, kind: TransactionKind) -> Self {
        Self {
            transaction_id,
            kind,
            entries: Vec::new(),
        }
    }

    /// Append an entry. Order is preserved on insert.
    pub fn push(
        &mut self,
        account_id: AccountId,
        amount: i64,
        currency: &Currency,
        description: &str,
    ) -> &mut Self {
        self.entries.push(LedgerEntry::new(
            self.transaction_id,
            account_id,
            amount,
            currency.clone(),
            description,
        ));
        self
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    /// Per-currency sums, widened so that the check itself cannot overflow.
    pub fn sums_by_currency(&self) -> BTreeMap<Currency, i128> {
        let mut sums = BTreeMap::new();
        for entry in &self.entries {
            *sums.entry(entry.currency.clone()).or_insert(0i128) += i128::from(entry.amount);
        }
        sums
    }

    /// Check the double-entry shape required for this batch's kind.
    ///
    /// Transfers and fundings are two entries in one currency. Exchanges are
    /// four entries over exactly two currencies, zero per currency.
    /// Capitalization is a single positive entry.
    pub fn validate(&self) -> Result<()> {
        if let Some(entry) = self
            .entries
            .iter()
            .find(|e| e.transaction_id != self.transaction_id)
        {
            return Err(violation(format!(
                "entry {} belongs to transaction {}, batch is {}",
                entry.id, entry.transaction_id, self.transaction_id
            )));
        }
        if self.entries.iter().any(|e| e.amount == 0) {
            return Err(violation("zero-amount ledger entry".to_string()));
        }

        let sums = self.sums_by_currency();
        let (expected_entries, expected_currencies) = match self.kind {
            TransactionKind::Transfer | TransactionKind::Funding => (2, 1),
            TransactionKind::Exchange => (4, 2),
            TransactionKind::Capitalization => (1, 1),
        };
        if self.entries.len() != expected_entries || sums.len() != expected_currencies {
            return Err(violation(format!(
                "{} expects {} entries in {} currencies, got {} in {}",
                self.kind,
                expected_entries,
                expected_currencies,
                self.entries.len(),
                sums.len()
            )));
        }

        if self.kind == TransactionKind::Capitalization {
            if self.entries[0].amount < 0 {
                return Err(violation("capitalization must credit the house".to_string()));
            }
            return Ok(());
        }

        if let Some((currency, sum)) = sums.iter().find(|(_, sum)| **sum != 0) {
            return Err(violation(format!(
                "{} entries for {} sum to {} in {}",
                self.kind, self.transaction_id, sum, currency
            )));
        }
        Ok(())
    }

    /// Validate and hand out the entries for insertion.
    pub fn into_validated(self) -> Result<Vec<LedgerEntry>> {
        self.validate()?;
        Ok(self.entries)
    }
}

fn violation(message: String) -> LedgerError {
    LedgerError::InvariantViolation(message)
}
