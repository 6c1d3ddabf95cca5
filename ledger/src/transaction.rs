//! Business transaction records.

use chrono::Utc;
use ledgerline_common::{AccountId, Currency, Timestamp, TransactionId, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What kind of economic event a transaction records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Same-currency move between two accounts.
    Transfer,
    /// Cross-currency move routed through both currencies' house accounts.
    Exchange,
    /// Opening balance paid from the house account to a new user account.
    Funding,
    /// Equity injected into a house account from outside the ledger.
    /// The only kind recorded with a single entry.
    Capitalization,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Transfer => "transfer",
            TransactionKind::Exchange => "exchange",
            TransactionKind::Funding => "funding",
            TransactionKind::Capitalization => "capitalization",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transfer" => Ok(TransactionKind::Transfer),
            "exchange" => Ok(TransactionKind::Exchange),
            "funding" => Ok(TransactionKind::Funding),
            "capitalization" => Ok(TransactionKind::Capitalization),
            other => Err(format!("unknown transaction kind: {other}")),
        }
    }
}

/// Lifecycle status of a transaction record. Records are only written on
/// success, so every persisted record is completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Completed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Completed => "completed",
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(TransactionStatus::Completed),
            other => Err(format!("unknown transaction status: {other}")),
        }
    }
}

/// The business record of one operation, written in the same database
/// transaction as its ledger entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: TransactionId,
    /// Acting user; `None` for system-initiated records such as capitalization.
    pub user_id: Option<UserId>,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    /// Principal in minor units of `currency`.
    pub amount: i64,
    pub currency: Currency,
    pub from_account_id: Option<AccountId>,
    pub to_account_id: Option<AccountId>,
    pub metadata: serde_json::Value,
    /// Caller-supplied idempotency key, unique across all records.
    pub client_request_id: Option<String>,
    pub created_at: Timestamp,
}

impl TransactionRecord {
    pub fn completed(
        kind: TransactionKind,
        user_id: Option<UserId>,
        amount: i64,
        currency: Currency,
    ) -> Self {
        Self {
            id: TransactionId::new(),
            user_id,
            kind,
            status: TransactionStatus::Completed,
            amount,
            currency,
            from_account_id: None,
            to_account_id: None,
            metadata: serde_json::Value::Object(Default::default()),
            client_request_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn between(mut self, from: AccountId, to: AccountId) -> Self {
        self.from_account_id = Some(from);
        self.to_account_id = Some(to);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Attach an idempotency key. Blank keys are treated as absent.
    pub fn with_client_request_id(mut self, key: Option<String>) -> Self {
        self.client_request_id = key.filter(|k| !k.trim().is_empty());
        self
    }
}
