use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::report::FilterValues;

/// Durable audit row for one report execution.
///
/// Created once the SQL is known to be well-formed, finalized exactly once,
/// never deleted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub report_id: String,
    pub user_id: String,
    pub filter_values: Option<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed_ms: Option<i64>,
    pub success: bool,
    pub error: Option<String>,
    pub row_count: Option<i64>,
    pub exported: bool,
    pub exported_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    pub fn new(
        id: Uuid,
        report_id: &str,
        user_id: &str,
        values: Option<&FilterValues>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            report_id: report_id.to_string(),
            user_id: user_id.to_string(),
            filter_values: values.and_then(|v| serde_json::to_value(v).ok()),
            started_at,
            finished_at: None,
            elapsed_ms: None,
            success: false,
            error: None,
            row_count: None,
            exported: false,
            exported_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Mark the execution as succeeded with the total (pre-truncation) row count.
    pub fn succeed(&mut self, row_count: usize, elapsed_ms: i64) {
        self.finish(elapsed_ms);
        self.success = true;
        self.row_count = Some(row_count as i64);
    }

    /// Mark the execution as failed. Row count stays null.
    pub fn fail(&mut self, error: &str, elapsed_ms: i64) {
        self.finish(elapsed_ms);
        self.success = false;
        self.error = Some(error.to_string());
        self.row_count = None;
    }

    pub fn mark_exported(&mut self) {
        self.exported = true;
        self.exported_at = self.finished_at.or_else(|| Some(Utc::now()));
    }

    fn finish(&mut self, elapsed_ms: i64) {
        // Wall clocks can step backwards; the record must not.
        let now = Utc::now();
        self.finished_at = Some(if now < self.started_at { self.started_at } else { now });
        self.elapsed_ms = Some(elapsed_ms.max(0));
    }
}

/// Errors raised by audit stores.
#[derive(Debug)]
pub enum AuditError {
    AlreadyExists(Uuid),
    NotFound(Uuid),
    AlreadyFinalized(Uuid),
    NotFinished(Uuid),
    Backend(String),
}

impl std::fmt::Display for AuditError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditError::AlreadyExists(id) => write!(f, "Execution record {} already exists", id),
            AuditError::NotFound(id) => write!(f, "Execution record {} not found", id),
            AuditError::AlreadyFinalized(id) => {
                write!(f, "Execution record {} was already finalized", id)
            }
            AuditError::NotFinished(id) => {
                write!(f, "Execution record {} has no completion data", id)
            }
            AuditError::Backend(msg) => write!(f, "Audit store error: {}", msg),
        }
    }
}

impl std::error::Error for AuditError {}

/// Append/update-only persistence for execution records.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Insert a new, unfinished record.
    async fn create(&self, record: &ExecutionRecord) -> Result<(), AuditError>;

    /// Write the completion fields of a record. Allowed once per record.
    async fn finalize(&self, record: &ExecutionRecord) -> Result<(), AuditError>;

    async fn get(&self, id: Uuid) -> Result<Option<ExecutionRecord>, AuditError>;

    /// Records for one report, newest first.
    async fn list_for_report(&self, report_id: &str) -> Result<Vec<ExecutionRecord>, AuditError>;
}

/// In-memory audit store for tests and embedding.
#[derive(Default)]
pub struct InMemoryAuditStore {
    records: Mutex<HashMap<Uuid, ExecutionRecord>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn create(&self, record: &ExecutionRecord) -> Result<(), AuditError> {
        let mut records = self
            .records
            .lock()
            .map_err(|e| AuditError::Backend(e.to_string()))?;
        if records.contains_key(&record.id) {
            return Err(AuditError::AlreadyExists(record.id));
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn finalize(&self, record: &ExecutionRecord) -> Result<(), AuditError> {
        if !record.is_finished() {
            return Err(AuditError::NotFinished(record.id));
        }
        let mut records = self
            .records
            .lock()
            .map_err(|e| AuditError::Backend(e.to_string()))?;
        let stored = records
            .get_mut(&record.id)
            .ok_or(AuditError::NotFound(record.id))?;
        if stored.is_finished() {
            return Err(AuditError::AlreadyFinalized(record.id));
        }
        *stored = record.clone();
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ExecutionRecord>, AuditError> {
        let records = self
            .records
            .lock()
            .map_err(|e| AuditError::Backend(e.to_string()))?;
        Ok(records.get(&id).cloned())
    }

    async fn list_for_report(&self, report_id: &str) -> Result<Vec<ExecutionRecord>, AuditError> {
        let records = self
            .records
            .lock()
            .map_err(|e| AuditError::Backend(e.to_string()))?;
        let mut found: Vec<ExecutionRecord> = records
            .values()
            .filter(|r| r.report_id == report_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(found)
    }
}
