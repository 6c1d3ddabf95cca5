//! Error taxonomy for ledger operations.

use crate::{AccountId, AmountError, Currency, QuoteId};
use serde::Serialize;
use thiserror::Error;

/// Entity name used when a currency has no system account.
pub const SYSTEM_ACCOUNT_ENTITY: &str = "system account";

/// Broad class of a [`LedgerError`], used by callers to decide how to report it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Malformed request, rejected before any lock is taken.
    Input,
    /// Terminal business rejection detected under lock.
    Business,
    /// The client request id was already used.
    Duplicate,
    /// Infrastructure failure a caller may retry later.
    Transient,
    /// Programming defect or unexpected storage failure.
    Internal,
}

/// Kind of storage conflict that makes a whole transaction attempt retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictKind {
    SerializationFailure,
    Deadlock,
}

/// Main error type for ledger operations.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Invalid amount")]
    InvalidAmount,

    #[error("Amount has too many decimal places")]
    TooManyDecimals,

    #[error("Invalid rate: {0}")]
    InvalidRate(String),

    #[error("Cannot transfer to the same account")]
    SameAccountTransfer,

    #[error("Insufficient funds in {account_id}: required {required}, available {available}")]
    InsufficientFunds {
        account_id: AccountId,
        required: i64,
        available: i64,
    },

    #[error("Currency mismatch: expected {expected}, got {actual}")]
    CurrencyMismatch { expected: Currency, actual: Currency },

    #[error("Account {0} is not owned by the caller")]
    UnauthorizedAccount(AccountId),

    #[error("Invalid exchange request: {0}")]
    InvalidExchangeRequest(String),

    #[error("Rate mismatch: committed {committed}, current {current}")]
    RateMismatch { committed: String, current: String },

    #[error("Quote not found: {0}")]
    QuoteNotFound(QuoteId),

    #[error("Quote expired: {0}")]
    QuoteExpired(QuoteId),

    #[error("Quote already consumed: {0}")]
    QuoteConsumed(QuoteId),

    #[error("Duplicate request with client request id: {0}")]
    DuplicateRequest(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Serialization failure or detected deadlock. Retried by the executor.
    #[error("Transaction conflict: {0:?}")]
    Conflict(ConflictKind),

    #[error("Transaction retry limit exceeded after {attempts} attempts")]
    RetryLimitExceeded { attempts: u32 },

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Transaction handle already closed")]
    TransactionClosed,

    #[error("Database error: {0}")]
    Database(String),

    /// A ledger invariant failed. Always aborts the enclosing transaction.
    #[error("Ledger invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl LedgerError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        LedgerError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether the whole transaction attempt may be re-run.
    ///
    /// Only storage conflicts qualify. Business rejections are terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Conflict(_))
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            // a missing house account is a bootstrap defect, not a caller mistake
            LedgerError::NotFound {
                entity: SYSTEM_ACCOUNT_ENTITY,
                ..
            } => ErrorClass::Internal,
            LedgerError::InvalidAmount
            | LedgerError::TooManyDecimals
            | LedgerError::InvalidRate(_) => ErrorClass::Input,
            LedgerError::SameAccountTransfer
            | LedgerError::InsufficientFunds { .. }
            | LedgerError::CurrencyMismatch { .. }
            | LedgerError::UnauthorizedAccount(_)
            | LedgerError::InvalidExchangeRequest(_)
            | LedgerError::RateMismatch { .. }
            | LedgerError::QuoteNotFound(_)
            | LedgerError::QuoteExpired(_)
            | LedgerError::QuoteConsumed(_)
            | LedgerError::NotFound { .. } => ErrorClass::Business,
            LedgerError::DuplicateRequest(_) => ErrorClass::Duplicate,
            LedgerError::Conflict(_)
            | LedgerError::RetryLimitExceeded { .. }
            | LedgerError::Timeout(_) => ErrorClass::Transient,
            LedgerError::TransactionClosed
            | LedgerError::Database(_)
            | LedgerError::InvariantViolation(_)
            | LedgerError::Configuration(_) => ErrorClass::Internal,
        }
    }

    /// Stable machine-readable code.
    pub fn error_code(&self) -> &'static str {
        match self {
            LedgerError::InvalidAmount => "invalid_amount",
            LedgerError::TooManyDecimals => "too_many_decimals",
            LedgerError::InvalidRate(_) => "invalid_rate",
            LedgerError::SameAccountTransfer => "same_account_transfer",
            LedgerError::InsufficientFunds { .. } => "insufficient_funds",
            LedgerError::CurrencyMismatch { .. } => "currency_mismatch",
            LedgerError::UnauthorizedAccount(_) => "unauthorized_account",
            LedgerError::InvalidExchangeRequest(_) => "invalid_exchange_request",
            LedgerError::RateMismatch { .. } => "rate_mismatch",
            LedgerError::QuoteNotFound(_) => "quote_not_found",
            LedgerError::QuoteExpired(_) => "quote_expired",
            LedgerError::QuoteConsumed(_) => "quote_consumed",
            LedgerError::DuplicateRequest(_) => "duplicate_request",
            LedgerError::NotFound { .. } => "not_found",
            LedgerError::Conflict(_) => "conflict",
            LedgerError::RetryLimitExceeded { .. } => "retry_limit_exceeded",
            LedgerError::Timeout(_) => "timeout",
            LedgerError::TransactionClosed => "transaction_closed",
            LedgerError::Database(_) => "database_error",
            LedgerError::InvariantViolation(_) => "invariant_violation",
            LedgerError::Configuration(_) => "configuration_error",
        }
    }
}

impl From<AmountError> for LedgerError {
    fn from(err: AmountError) -> Self {
        match err {
            AmountError::InvalidAmount | AmountError::OutOfRange => LedgerError::InvalidAmount,
            AmountError::TooManyDecimals => LedgerError::TooManyDecimals,
            AmountError::InvalidRate(rate) => LedgerError::InvalidRate(rate),
        }
    }
}

/// Result type alias for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;
