//! Exchange quotes: short-lived, single-use rate commitments.

use chrono::{Duration, Utc};
use ledgerline_common::{AccountId, Currency, QuoteId, Rate, Timestamp, UserId};
use serde::{Deserialize, Serialize};

/// A quoted conversion of `amount_minor` at `rate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeQuote {
    pub id: QuoteId,
    pub user_id: UserId,
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount_minor: i64,
    pub converted_minor: i64,
    pub rate: Rate,
    pub base_currency: Currency,
    pub quote_currency: Currency,
    pub expires_at: Timestamp,
    pub consumed_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

/// The request fields a quote is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuoteTerms {
    pub user_id: UserId,
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount_minor: i64,
}

impl ExchangeQuote {
    pub fn issue(
        terms: QuoteTerms,
        rate: Rate,
        converted_minor: i64,
        base_currency: Currency,
        quote_currency: Currency,
        issued_at: Timestamp,
        ttl: Duration,
    ) -> Self {
        Self {
            id: QuoteId::new(),
            user_id: terms.user_id,
            from_account_id: terms.from_account_id,
            to_account_id: terms.to_account_id,
            amount_minor: terms.amount_minor,
            converted_minor,
            rate,
            base_currency,
            quote_currency,
            expires_at: issued_at + ttl,
            consumed_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed_at.is_some()
    }

    /// A quote is unusable from `expires_at` onwards.
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    /// Whether the quote was issued for exactly these request fields.
    pub fn matches(&self, terms: &QuoteTerms) -> bool {
        self.user_id == terms.user_id
            && self.from_account_id == terms.from_account_id
            && self.to_account_id == terms.to_account_id
            && self.amount_minor == terms.amount_minor
    }
}
