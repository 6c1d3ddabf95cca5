//! Audit trail written inside the business transaction.

use async_trait::async_trait;
use chrono::Utc;
use ledgerline_common::{Result, Timestamp, UserId};
use serde::{Deserialize, Serialize};

/// One audit log row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Acting user; `None` for system actions such as bootstrap.
    pub actor_id: Option<UserId>,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub created_at: Timestamp,
}

impl AuditRecord {
    pub fn new(
        actor_id: Option<UserId>,
        action: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl ToString,
        data: serde_json::Value,
    ) -> Self {
        Self {
            actor_id,
            action: action.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.to_string(),
            data,
            created_at: Utc::now(),
        }
    }
}

/// Writes audit records through the caller's open transaction.
///
/// A failure fails the business operation: audit is not best-effort.
#[async_trait]
pub trait AuditSink<Tx: Send + Sync>: Send + Sync {
    async fn log(&self, tx: &Tx, record: AuditRecord) -> Result<()>;
}

#[cfg(any(test, feature = "test-utils"))]
pub use doubles::{FailingAudit, RecordingAudit};

#[cfg(any(test, feature = "test-utils"))]
mod doubles {
    use super::*;
    use ledgerline_common::LedgerError;
    use parking_lot::Mutex;

    /// Keeps every record it is given, regardless of commit outcome.
    #[derive(Debug, Default)]
    pub struct RecordingAudit {
        records: Mutex<Vec<AuditRecord>>,
    }

    impl RecordingAudit {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn records(&self) -> Vec<AuditRecord> {
            self.records.lock().clone()
        }
    }

    #[async_trait]
    impl<Tx: Send + Sync> AuditSink<Tx> for RecordingAudit {
        async fn log(&self, _tx: &Tx, record: AuditRecord) -> Result<()> {
            self.records.lock().push(record);
            Ok(())
        }
    }

    /// Rejects every record.
    #[derive(Debug, Default)]
    pub struct FailingAudit;

    #[async_trait]
    impl<Tx: Send + Sync> AuditSink<Tx> for FailingAudit {
        async fn log(&self, _tx: &Tx, record: AuditRecord) -> Result<()> {
            Err(LedgerError::Database(format!(
                "audit sink unavailable for {} {}",
                record.action, record.entity_id
            )))
        }
    }
}
