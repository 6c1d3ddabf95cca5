//! PostgreSQL implementation of the ledger and quote stores.
//!
//! Every transaction runs at `SERIALIZABLE`. Locked reads use
//! `SELECT ... FOR UPDATE`. Vendor error codes are translated into
//! [`LedgerError`] here and nowhere else.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledgerline_common::{
    AccountId, ConflictKind, Currency, LedgerError, QuoteId, Rate, Result, TransactionId,
    UserId, SYSTEM_ACCOUNT_ENTITY,
};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use tokio::sync::Mutex;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::account::Account;
use crate::audit::{AuditRecord, AuditSink};
use crate::balance::AccountReconciliation;
use crate::journal::LedgerEntry;
use crate::quote::ExchangeQuote;
use crate::store::{LedgerStore, QuoteStore, TxBackend};
use crate::transaction::TransactionRecord;

/// Unique constraint guarding idempotent submissions.
pub const CLIENT_REQUEST_CONSTRAINT: &str = "transactions_client_request_id_key";

const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const UNIQUE_VIOLATION: &str = "23505";
const QUERY_CANCELED: &str = "57014";

/// Pool settings for [`connect`].
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

/// Open a connection pool.
pub async fn connect(settings: &PoolSettings) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout)
        .connect(&settings.url)
        .await
        .map_err(|e| map_sqlx_error("connect", e))
}

/// Shared handle to one open database transaction.
#[derive(Clone)]
pub struct PgTx {
    inner: Arc<Mutex<Option<Transaction<'static, Postgres>>>>,
}

impl PgTx {
    fn new(tx: Transaction<'static, Postgres>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(tx))),
        }
    }

    async fn take(&self) -> Result<Transaction<'static, Postgres>> {
        self.inner
            .lock()
            .await
            .take()
            .ok_or(LedgerError::TransactionClosed)
    }
}

impl std::fmt::Debug for PgTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgTx").finish_non_exhaustive()
    }
}

/// Runs `$body` with `$conn` bound to the open transaction's connection.
macro_rules! with_conn {
    ($tx:expr, |$conn:ident| $body:expr) => {{
        let mut guard = $tx.inner.lock().await;
        let $conn: &mut sqlx::PgConnection = &mut **guard.as_mut().ok_or(LedgerError::TransactionClosed)?;
        $body
    }};
}

pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| LedgerError::Database(format!("migrate: {e}")))
    }
}

#[derive(FromRow)]
struct AccountRow {
    id: Uuid,
    user_id: Option<Uuid>,
    currency: String,
    balance: i64,
    is_system: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Account {
            id: AccountId::from_uuid(row.id),
            user_id: row.user_id.map(UserId::from_uuid),
            currency: Currency::new(row.currency),
            balance: row.balance,
            is_system: row.is_system,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct TransactionRow {
    id: Uuid,
    user_id: Option<Uuid>,
    kind: String,
    status: String,
    amount: i64,
    currency: String,
    from_account_id: Option<Uuid>,
    to_account_id: Option<Uuid>,
    metadata: serde_json::Value,
    client_request_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for TransactionRecord {
    type Error = LedgerError;

    fn try_from(row: TransactionRow) -> Result<Self> {
        Ok(TransactionRecord {
            id: TransactionId::from_uuid(row.id),
            user_id: row.user_id.map(UserId::from_uuid),
            kind: row.kind.parse().map_err(LedgerError::Database)?,
            status: row.status.parse().map_err(LedgerError::Database)?,
            amount: row.amount,
            currency: Currency::new(row.currency),
            from_account_id: row.from_account_id.map(AccountId::from_uuid),
            to_account_id: row.to_account_id.map(AccountId::from_uuid),
            metadata: row.metadata,
            client_request_id: row.client_request_id,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct EntryRow {
    id: Uuid,
    transaction_id: Uuid,
    account_id: Uuid,
    amount: i64,
    currency: String,
    description: String,
    created_at: DateTime<Utc>,
}

impl From<EntryRow> for LedgerEntry {
    fn from(row: EntryRow) -> Self {
        LedgerEntry {
            id: row.id.into(),
            transaction_id: row.transaction_id.into(),
            account_id: row.account_id.into(),
            amount: row.amount,
            currency: Currency::new(row.currency),
            description: row.description,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct QuoteRow {
    id: Uuid,
    user_id: Uuid,
    from_account_id: Uuid,
    to_account_id: Uuid,
    amount_minor: i64,
    converted_minor: i64,
    rate: Decimal,
    base_currency: String,
    quote_currency: String,
    expires_at: DateTime<Utc>,
    consumed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<QuoteRow> for ExchangeQuote {
    type Error = LedgerError;

    fn try_from(row: QuoteRow) -> Result<Self> {
        Ok(ExchangeQuote {
            id: row.id.into(),
            user_id: row.user_id.into(),
            from_account_id: row.from_account_id.into(),
            to_account_id: row.to_account_id.into(),
            amount_minor: row.amount_minor,
            converted_minor: row.converted_minor,
            rate: Rate::new(row.rate)?,
            base_currency: Currency::new(row.base_currency),
            quote_currency: Currency::new(row.quote_currency),
            expires_at: row.expires_at,
            consumed_at: row.consumed_at,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct ReconciliationRow {
    id: Uuid,
    currency: String,
    is_system: bool,
    stored_balance: i64,
    ledger_balance: i64,
}

const ACCOUNT_COLUMNS: &str = "id, user_id, currency, balance, is_system, created_at, updated_at";
const TRANSACTION_COLUMNS: &str = "id, user_id, kind, status, amount, currency, from_account_id, \
     to_account_id, metadata, client_request_id, created_at";
const ENTRY_COLUMNS: &str = "id, transaction_id, account_id, amount, currency, description, created_at";

#[async_trait]
impl TxBackend for PgLedgerStore {
    type Tx = PgTx;

    async fn begin(&self) -> Result<PgTx> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_isolation", e))?;
        Ok(PgTx::new(tx))
    }

    async fn commit(&self, tx: PgTx) -> Result<()> {
        tx.take()
            .await?
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    async fn rollback(&self, tx: PgTx) -> Result<()> {
        match tx.take().await {
            Ok(open) => open
                .rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e)),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    #[instrument(skip(self, tx), err)]
    async fn get_for_update(&self, tx: &PgTx, account_id: AccountId) -> Result<Account> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 FOR UPDATE");
        let row = with_conn!(tx, |conn| {
            sqlx::query_as::<_, AccountRow>(&sql)
                .bind(account_id.into_uuid())
                .fetch_optional(conn)
                .await
                .map_err(|e| map_sqlx_error("get_for_update", e))?
        });
        row.map(Account::from)
            .ok_or_else(|| LedgerError::not_found("account", account_id))
    }

    async fn update_balance(&self, tx: &PgTx, account_id: AccountId, balance: i64) -> Result<()> {
        let result = with_conn!(tx, |conn| {
            sqlx::query("UPDATE accounts SET balance = $1, updated_at = NOW() WHERE id = $2")
                .bind(balance)
                .bind(account_id.into_uuid())
                .execute(conn)
                .await
                .map_err(|e| map_sqlx_error("update_balance", e))?
        });
        if result.rows_affected() == 0 {
            return Err(LedgerError::not_found("account", account_id));
        }
        Ok(())
    }

    async fn get_system_account(&self, tx: &PgTx, currency: &Currency) -> Result<AccountId> {
        let id: Option<Uuid> = with_conn!(tx, |conn| {
            sqlx::query_scalar::<_, Uuid>("SELECT id FROM accounts WHERE is_system AND currency = $1")
                .bind(currency.code())
                .fetch_optional(conn)
                .await
                .map_err(|e| map_sqlx_error("get_system_account", e))?
        });
        id.map(AccountId::from_uuid)
            .ok_or_else(|| LedgerError::not_found(SYSTEM_ACCOUNT_ENTITY, currency))
    }

    async fn create_account(&self, tx: &PgTx, account: &Account) -> Result<()> {
        with_conn!(tx, |conn| {
            sqlx::query(
                "INSERT INTO accounts (id, user_id, currency, balance, is_system, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(account.id.into_uuid())
            .bind(account.user_id.map(UserId::into_uuid))
            .bind(account.currency.code())
            .bind(account.balance)
            .bind(account.is_system)
            .bind(account.created_at)
            .bind(account.updated_at)
            .execute(conn)
            .await
            .map_err(|e| map_sqlx_error("create_account", e))?;
        });
        Ok(())
    }

    #[instrument(skip(self, tx, record), fields(transaction_id = %record.id, kind = %record.kind), err)]
    async fn insert_transaction(&self, tx: &PgTx, record: &TransactionRecord) -> Result<()> {
        let inserted = with_conn!(tx, |conn| {
            sqlx::query(
                "INSERT INTO transactions (id, user_id, kind, status, amount, currency, \
                 from_account_id, to_account_id, metadata, client_request_id, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            )
            .bind(record.id.into_uuid())
            .bind(record.user_id.map(UserId::into_uuid))
            .bind(record.kind.as_str())
            .bind(record.status.as_str())
            .bind(record.amount)
            .bind(record.currency.code())
            .bind(record.from_account_id.map(AccountId::into_uuid))
            .bind(record.to_account_id.map(AccountId::into_uuid))
            .bind(&record.metadata)
            .bind(record.client_request_id.as_deref())
            .bind(record.created_at)
            .execute(conn)
            .await
        });
        match inserted {
            Ok(_) => Ok(()),
            Err(err) if is_client_request_violation(&err) => Err(LedgerError::DuplicateRequest(
                record.client_request_id.clone().unwrap_or_default(),
            )),
            Err(err) => Err(map_sqlx_error("insert_transaction", err)),
        }
    }

    async fn insert_ledger_entries(&self, tx: &PgTx, entries: &[LedgerEntry]) -> Result<()> {
        with_conn!(tx, |conn| {
            for entry in entries {
                sqlx::query(
                    "INSERT INTO ledger_entries (id, transaction_id, account_id, amount, currency, \
                     description, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7)",
                )
                .bind(entry.id.into_uuid())
                .bind(entry.transaction_id.into_uuid())
                .bind(entry.account_id.into_uuid())
                .bind(entry.amount)
                .bind(entry.currency.code())
                .bind(&entry.description)
                .bind(entry.created_at)
                .execute(&mut *conn)
                .await
                .map_err(|e| map_sqlx_error("insert_ledger_entries", e))?;
            }
        });
        debug!(count = entries.len(), "Ledger entries inserted");
        Ok(())
    }

    async fn get_account(&self, account_id: AccountId) -> Result<Account> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1");
        sqlx::query_as::<_, AccountRow>(&sql)
            .bind(account_id.into_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_account", e))?
            .map(Account::from)
            .ok_or_else(|| LedgerError::not_found("account", account_id))
    }

    async fn find_system_account(&self, currency: &Currency) -> Result<Option<Account>> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE is_system AND currency = $1");
        Ok(sqlx::query_as::<_, AccountRow>(&sql)
            .bind(currency.code())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_system_account", e))?
            .map(Account::from))
    }

    async fn transaction(&self, transaction_id: TransactionId) -> Result<TransactionRecord> {
        let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = $1");
        sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(transaction_id.into_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("transaction", e))?
            .ok_or_else(|| LedgerError::not_found("transaction", transaction_id))?
            .try_into()
    }

    async fn transaction_by_client_request(
        &self,
        client_request_id: &str,
    ) -> Result<Option<TransactionRecord>> {
        let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE client_request_id = $1");
        sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(client_request_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("transaction_by_client_request", e))?
            .map(TransactionRecord::try_from)
            .transpose()
    }

    async fn entries_for_transaction(&self, transaction_id: TransactionId) -> Result<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE transaction_id = $1 ORDER BY created_at, id"
        );
        let rows = sqlx::query_as::<_, EntryRow>(&sql)
            .bind(transaction_id.into_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("entries_for_transaction", e))?;
        Ok(rows.into_iter().map(LedgerEntry::from).collect())
    }

    async fn entries_for_account(&self, account_id: AccountId) -> Result<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE account_id = $1 ORDER BY created_at, id"
        );
        let rows = sqlx::query_as::<_, EntryRow>(&sql)
            .bind(account_id.into_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("entries_for_account", e))?;
        Ok(rows.into_iter().map(LedgerEntry::from).collect())
    }

    #[instrument(skip(self), err)]
    async fn reconcile(&self) -> Result<Vec<AccountReconciliation>> {
        let rows = sqlx::query_as::<_, ReconciliationRow>(
            "SELECT a.id, a.currency, a.is_system, a.balance AS stored_balance, \
                    COALESCE(SUM(l.amount), 0)::BIGINT AS ledger_balance \
             FROM accounts a \
             LEFT JOIN ledger_entries l ON l.account_id = a.id \
             GROUP BY a.id, a.currency, a.is_system, a.balance \
             ORDER BY a.id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("reconcile", e))?;

        Ok(rows
            .into_iter()
            .map(|row| AccountReconciliation {
                account_id: row.id.into(),
                currency: Currency::new(row.currency),
                is_system: row.is_system,
                stored_balance: row.stored_balance,
                ledger_balance: row.ledger_balance,
            })
            .collect())
    }
}

#[async_trait]
impl QuoteStore for PgLedgerStore {
    #[instrument(skip(self, quote), fields(quote_id = %quote.id), err)]
    async fn create_quote(&self, quote: &ExchangeQuote) -> Result<()> {
        sqlx::query(
            "INSERT INTO exchange_quotes (id, user_id, from_account_id, to_account_id, amount_minor, \
             converted_minor, rate, base_currency, quote_currency, expires_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(quote.id.into_uuid())
        .bind(quote.user_id.into_uuid())
        .bind(quote.from_account_id.into_uuid())
        .bind(quote.to_account_id.into_uuid())
        .bind(quote.amount_minor)
        .bind(quote.converted_minor)
        .bind(quote.rate.value())
        .bind(quote.base_currency.code())
        .bind(quote.quote_currency.code())
        .bind(quote.expires_at)
        .bind(quote.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_quote", e))?;
        Ok(())
    }

    async fn get_quote(&self, quote_id: QuoteId) -> Result<ExchangeQuote> {
        sqlx::query_as::<_, QuoteRow>(
            "SELECT id, user_id, from_account_id, to_account_id, amount_minor, converted_minor, \
             rate, base_currency, quote_currency, expires_at, consumed_at, created_at \
             FROM exchange_quotes WHERE id = $1",
        )
        .bind(quote_id.into_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_quote", e))?
        .ok_or_else(|| LedgerError::not_found("quote", quote_id))?
        .try_into()
    }

    async fn consume_quote(&self, tx: &PgTx, quote_id: QuoteId) -> Result<u64> {
        let result = with_conn!(tx, |conn| {
            sqlx::query(
                "UPDATE exchange_quotes SET consumed_at = NOW() \
                 WHERE id = $1 AND consumed_at IS NULL AND expires_at > NOW()",
            )
            .bind(quote_id.into_uuid())
            .execute(conn)
            .await
            .map_err(|e| map_sqlx_error("consume_quote", e))?
        });
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl AuditSink<PgTx> for PgLedgerStore {
    async fn log(&self, tx: &PgTx, record: AuditRecord) -> Result<()> {
        with_conn!(tx, |conn| {
            sqlx::query(
                "INSERT INTO audit_logs (actor_user_id, action, entity_type, entity_id, data, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(record.actor_id.map(UserId::into_uuid))
            .bind(&record.action)
            .bind(&record.entity_type)
            .bind(&record.entity_id)
            .bind(&record.data)
            .bind(record.created_at)
            .execute(conn)
            .await
            .map_err(|e| map_sqlx_error("audit_log", e))?;
        });
        Ok(())
    }
}

/// Conflict kind for a SQLSTATE code, if the code makes the attempt retryable.
pub fn conflict_kind(code: &str) -> Option<ConflictKind> {
    match code {
        SERIALIZATION_FAILURE => Some(ConflictKind::SerializationFailure),
        DEADLOCK_DETECTED => Some(ConflictKind::Deadlock),
        _ => None,
    }
}

fn is_client_request_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.code().as_deref() == Some(UNIQUE_VIOLATION)
                && db_err.constraint() == Some(CLIENT_REQUEST_CONSTRAINT)
        }
        _ => false,
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            if let Some(kind) = conflict_kind(&code) {
                debug!(operation, code = %code, "Retryable database conflict");
                return LedgerError::Conflict(kind);
            }
            if code == QUERY_CANCELED {
                return LedgerError::Timeout(format!("{operation}: statement canceled"));
            }
            LedgerError::Database(format!("{operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolTimedOut => {
            LedgerError::Timeout(format!("{operation}: connection pool acquire timed out"))
        }
        sqlx::Error::RowNotFound => LedgerError::NotFound {
            entity: "row",
            id: operation.to_string(),
        },
        other => LedgerError::Database(format!("{operation}: {other}")),
    }
}
