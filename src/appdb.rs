use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::security::audit::{AuditError, AuditStore, ExecutionRecord};

const SCHEMA_SQL: &str = include_str!("../appdb/schema.sql");

const SELECT_COLUMNS: &str = "SELECT id, report_id, user_id, filter_values, started_at, \
     finished_at, elapsed_ms, success, error, row_count, exported, exported_at \
     FROM executions";

/// Embedded SQLite audit store.
///
/// Writes run on `spawn_blocking`, so a write that has started completes even
/// if the awaiting caller is dropped.
pub struct SqliteAuditStore {
    conn: Arc<Mutex<Connection>>,
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_opt_ts(raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

fn read_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    let id: String = row.get(0)?;
    let filter_values: Option<String> = row.get(3)?;
    let started_at: String = row.get(4)?;
    let success: i32 = row.get(7)?;
    let exported: i32 = row.get(10)?;

    Ok(ExecutionRecord {
        id: Uuid::parse_str(&id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        report_id: row.get(1)?,
        user_id: row.get(2)?,
        filter_values: filter_values.and_then(|raw| serde_json::from_str(&raw).ok()),
        started_at: parse_ts(&started_at)?,
        finished_at: parse_opt_ts(row.get(5)?)?,
        elapsed_ms: row.get(6)?,
        success: success != 0,
        error: row.get(8)?,
        row_count: row.get(9)?,
        exported: exported != 0,
        exported_at: parse_opt_ts(row.get(11)?)?,
    })
}

fn backend_error(e: anyhow::Error) -> AuditError {
    AuditError::Backend(format!("{:#}", e))
}

impl SqliteAuditStore {
    /// Open (or create) the audit database file and apply the schema.
    pub fn init(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).context("Failed to create audit database directory")?;
        }

        let conn = Connection::open(db_path).context("Failed to open audit database")?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to set WAL mode")?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to apply schema")?;

        log::info!("Audit database initialized at {:?}", db_path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    async fn create(&self, record: &ExecutionRecord) -> Result<(), AuditError> {
        let conn = self.conn.clone();
        let record = record.clone();
        let id = record.id;
        let inserted = tokio::task::spawn_blocking(move || -> anyhow::Result<usize> {
            let c = conn.lock().map_err(|e| anyhow!("Lock error: {}", e))?;
            let filter_values = record
                .filter_values
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .context("Failed to serialize filter values")?;
            c.execute(
                "INSERT OR IGNORE INTO executions \
                 (id, report_id, user_id, filter_values, started_at, success, exported) \
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, 0)",
                rusqlite::params![
                    record.id.to_string(),
                    record.report_id,
                    record.user_id,
                    filter_values,
                    format_ts(&record.started_at),
                ],
            )
            .context("Failed to insert execution record")
        })
        .await
        .context("spawn_blocking join error")
        .and_then(|r| r)
        .map_err(backend_error)?;

        if inserted == 0 {
            return Err(AuditError::AlreadyExists(id));
        }
        Ok(())
    }

    async fn finalize(&self, record: &ExecutionRecord) -> Result<(), AuditError> {
        let Some(finished_at) = record.finished_at else {
            return Err(AuditError::NotFinished(record.id));
        };

        let conn = self.conn.clone();
        let record = record.clone();
        let id = record.id;
        let (updated, exists) = tokio::task::spawn_blocking(move || -> anyhow::Result<(usize, bool)> {
            let c = conn.lock().map_err(|e| anyhow!("Lock error: {}", e))?;
            let updated = c
                .execute(
                    "UPDATE executions SET finished_at = ?2, elapsed_ms = ?3, success = ?4, \
                     error = ?5, row_count = ?6, exported = ?7, exported_at = ?8 \
                     WHERE id = ?1 AND finished_at IS NULL",
                    rusqlite::params![
                        record.id.to_string(),
                        format_ts(&finished_at),
                        record.elapsed_ms,
                        record.success as i32,
                        record.error,
                        record.row_count,
                        record.exported as i32,
                        record.exported_at.as_ref().map(format_ts),
                    ],
                )
                .context("Failed to finalize execution record")?;
            if updated > 0 {
                return Ok((updated, true));
            }
            let exists = c
                .query_row(
                    "SELECT 1 FROM executions WHERE id = ?1",
                    rusqlite::params![record.id.to_string()],
                    |_| Ok(()),
                )
                .optional()
                .context("Failed to look up execution record")?
                .is_some();
            Ok((updated, exists))
        })
        .await
        .context("spawn_blocking join error")
        .and_then(|r| r)
        .map_err(backend_error)?;

        match (updated, exists) {
            (0, false) => Err(AuditError::NotFound(id)),
            (0, true) => Err(AuditError::AlreadyFinalized(id)),
            _ => Ok(()),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<ExecutionRecord>, AuditError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<Option<ExecutionRecord>> {
            let c = conn.lock().map_err(|e| anyhow!("Lock error: {}", e))?;
            c.query_row(
                &format!("{} WHERE id = ?1", SELECT_COLUMNS),
                rusqlite::params![id.to_string()],
                read_record,
            )
            .optional()
            .context("Failed to load execution record")
        })
        .await
        .context("spawn_blocking join error")
        .and_then(|r| r)
        .map_err(backend_error)
    }

    async fn list_for_report(&self, report_id: &str) -> Result<Vec<ExecutionRecord>, AuditError> {
        let conn = self.conn.clone();
        let report_id = report_id.to_string();
        tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<ExecutionRecord>> {
            let c = conn.lock().map_err(|e| anyhow!("Lock error: {}", e))?;
            let mut stmt = c
                .prepare(&format!(
                    "{} WHERE report_id = ?1 ORDER BY started_at DESC",
                    SELECT_COLUMNS
                ))
                .context("Failed to prepare executions query")?;

            let rows = stmt
                .query_map(rusqlite::params![report_id], read_record)
                .context("Failed to query executions")?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to read execution record")?;

            Ok(rows)
        })
        .await
        .context("spawn_blocking join error")
        .and_then(|r| r)
        .map_err(backend_error)
    }
}
