//! Requests accepted and results returned by the transaction service.

use ledgerline_common::{AccountId, QuoteId, Rate, Timestamp, TransactionId, UserId};
use ledgerline_ledger::{Account, QuoteTerms};
use serde::{Deserialize, Serialize};

/// Move money between two accounts of the same currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Authenticated caller; must own the source account.
    pub user_id: UserId,
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount_minor: i64,
    /// Idempotency key. A repeat is reported as a duplicate.
    pub client_request_id: Option<String>,
}

/// Preview a conversion and reserve its rate for a short time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteRequest {
    pub user_id: UserId,
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount_minor: i64,
}

impl QuoteRequest {
    pub fn terms(&self) -> QuoteTerms {
        QuoteTerms {
            user_id: self.user_id,
            from_account_id: self.from_account_id,
            to_account_id: self.to_account_id,
            amount_minor: self.amount_minor,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteResponse {
    pub quote_id: QuoteId,
    pub rate: Rate,
    pub converted_minor: i64,
    pub expires_at: Timestamp,
}

/// Convert money between two of the caller's accounts.
///
/// The caller commits to a rate up front, either through a quote or an
/// inline rate. `quote_id` wins when both are given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRequest {
    pub user_id: UserId,
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount_minor: i64,
    pub client_request_id: Option<String>,
    pub quote_id: Option<QuoteId>,
    /// Decimal rate text such as `"0.92"`.
    pub quoted_rate: Option<String>,
}

impl ExchangeRequest {
    pub fn terms(&self) -> QuoteTerms {
        QuoteTerms {
            user_id: self.user_id,
            from_account_id: self.from_account_id,
            to_account_id: self.to_account_id,
            amount_minor: self.amount_minor,
        }
    }
}

/// A committed operation and the accounts it changed, as of commit.
#[derive(Debug, Clone, PartialEq)]
pub struct Receipt {
    pub transaction_id: TransactionId,
    /// The caller-visible accounts, source first.
    pub accounts: Vec<Account>,
}
