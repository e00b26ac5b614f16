use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::params::{substitute, substitute_defaults};
use super::{Connection, FilterValues, ReportContext};
use crate::appdb::SqliteAuditStore;
use crate::config::EngineConfig;
use crate::db::connectors::{
    open_backend, run_query, BackendConnector, BackendKind, ConnectionConfig, NativeConnector,
};
use crate::db::export::{export_file_name, write_xlsx, ExportOptions};
use crate::db::normalizer::{normalize, NormalizedResult};
use crate::db::value::RawResultSet;
use crate::error::{EngineError, Result};
use crate::security::audit::{AuditStore, ExecutionRecord, InMemoryAuditStore};
use crate::security::credentials::{build_connection_config, AesGcmCipher, SecretCipher};
use crate::security::validation::{redact_secret, sanitize_for_display, validate_query};

pub const CONNECTION_OK_MESSAGE: &str = "Connection established successfully";

/// Result of a preview or test run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    #[serde(flatten)]
    pub result: NormalizedResult,
    pub elapsed_ms: i64,
    pub execution_id: Uuid,
}

/// Spreadsheet produced by an export run.
#[derive(Debug, Clone)]
pub struct ExportOutcome {
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub row_count: usize,
    pub elapsed_ms: i64,
    pub execution_id: Uuid,
}

/// Outcome of a connection check. Never an error: failures are reported in `message`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionTestResult {
    pub ok: bool,
    pub message: String,
}

impl ConnectionTestResult {
    fn success() -> Self {
        Self {
            ok: true,
            message: CONNECTION_OK_MESSAGE.to_string(),
        }
    }

    fn failure(message: String) -> Self {
        Self { ok: false, message }
    }
}

/// Unsaved connection settings with a plaintext secret, for "test before save".
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionParams {
    pub kind: String,
    pub host: String,
    pub port: Option<u16>,
    pub database: String,
    pub username: String,
    pub secret: String,
}

impl std::fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("secret", &"******")
            .finish()
    }
}

/// Post-processing applied to the raw result inside the audited task.
type Finish<T> = Box<dyn FnOnce(RawResultSet) -> Result<T> + Send>;

/// Everything the audited task needs, owned so it can outlive the caller.
struct AuditedRun {
    record: ExecutionRecord,
    connection: Connection,
    query: String,
    timer: Instant,
    mark_exported: bool,
}

/// Runs reports: substitution, connection, execution, normalization and audit.
///
/// Cheap to clone; every call is independent and owns its own backend handle.
#[derive(Clone)]
pub struct ReportEngine {
    connector: Arc<dyn BackendConnector>,
    cipher: Arc<dyn SecretCipher>,
    audit: Arc<dyn AuditStore>,
    config: EngineConfig,
}

impl ReportEngine {
    pub fn new(
        connector: Arc<dyn BackendConnector>,
        cipher: Arc<dyn SecretCipher>,
        audit: Arc<dyn AuditStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            connector,
            cipher,
            audit,
            config,
        }
    }

    /// Engine wired to the real drivers, an environment-keyed cipher and the
    /// configured audit store (SQLite when a path is set, in-memory otherwise).
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let cipher = AesGcmCipher::from_env(&config.encryption_key_env)
            .map_err(|e| EngineError::Configuration(e.to_string()))?;
        let audit: Arc<dyn AuditStore> = match &config.audit_db_path {
            Some(path) => Arc::new(
                SqliteAuditStore::init(path)
                    .map_err(|e| EngineError::Storage(format!("{:#}", e)))?,
            ),
            None => Arc::new(InMemoryAuditStore::new()),
        };
        Ok(Self::new(Arc::new(NativeConnector), Arc::new(cipher), audit, config))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn audit_store(&self) -> Arc<dyn AuditStore> {
        self.audit.clone()
    }

    /// Run a report with caller values, truncated to the report's preview limit.
    pub async fn execute(
        &self,
        ctx: &ReportContext,
        user_id: &str,
        values: &FilterValues,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let started_at = Utc::now();
        let timer = Instant::now();
        log::debug!("Report {}: started", ctx.report.id);

        self.precheck(ctx)?;
        let query = substitute(&ctx.report.query_sql, &ctx.filters, values).map_err(|e| {
            log::warn!("Report {}: substitution failed: {}", ctx.report.id, e);
            EngineError::Validation(e)
        })?;

        let limit = match ctx.report.preview_row_limit {
            0 => self.config.default_preview_rows,
            n => n,
        };
        let (result, _, elapsed_ms, execution_id) = self
            .run_audited(
                ctx,
                user_id,
                Some(values),
                query,
                started_at,
                timer,
                false,
                cancel,
                Box::new(move |raw: RawResultSet| Ok(normalize(raw, Some(limit)))),
            )
            .await?;

        Ok(ExecutionOutcome {
            result,
            elapsed_ms,
            execution_id,
        })
    }

    /// Sanity-check a template: defaults only, no caller values, small fixed limit.
    pub async fn test(
        &self,
        ctx: &ReportContext,
        user_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let started_at = Utc::now();
        let timer = Instant::now();
        log::debug!("Report {}: test run started", ctx.report.id);

        self.precheck(ctx)?;
        let query = substitute_defaults(&ctx.report.query_sql, &ctx.filters)
            .map_err(EngineError::Validation)?;

        let limit = self.config.test_preview_rows;
        let (result, _, elapsed_ms, execution_id) = self
            .run_audited(
                ctx,
                user_id,
                None,
                query,
                started_at,
                timer,
                false,
                cancel,
                Box::new(move |raw: RawResultSet| Ok(normalize(raw, Some(limit)))),
            )
            .await?;

        Ok(ExecutionOutcome {
            result,
            elapsed_ms,
            execution_id,
        })
    }

    /// Run a report without a display cap and render it as a spreadsheet.
    ///
    /// Whether the user may export is decided by the caller.
    pub async fn export(
        &self,
        ctx: &ReportContext,
        user_id: &str,
        values: &FilterValues,
        cancel: &CancellationToken,
    ) -> Result<ExportOutcome> {
        let started_at = Utc::now();
        let timer = Instant::now();
        log::debug!("Report {}: export started", ctx.report.id);

        self.precheck(ctx)?;
        let query = substitute(&ctx.report.query_sql, &ctx.filters, values)
            .map_err(EngineError::Validation)?;

        let options = ExportOptions {
            sheet_name: self.config.export_sheet_name.clone(),
            max_column_width: self.config.max_column_width,
        };
        let (bytes, row_count, elapsed_ms, execution_id) = self
            .run_audited(
                ctx,
                user_id,
                Some(values),
                query,
                started_at,
                timer,
                true,
                cancel,
                Box::new(move |raw: RawResultSet| write_xlsx(raw, &options)),
            )
            .await?;

        Ok(ExportOutcome {
            bytes,
            file_name: export_file_name(&ctx.report.name, chrono::Local::now().naive_local()),
            row_count,
            elapsed_ms,
            execution_id,
        })
    }

    /// Open and immediately close a handle for a stored connection.
    pub async fn test_connection(&self, connection: &Connection) -> ConnectionTestResult {
        if !connection.active {
            return ConnectionTestResult::failure(format!(
                "Connection {} is inactive",
                connection.id
            ));
        }
        match build_connection_config(
            connection,
            self.cipher.as_ref(),
            self.config.connect_timeout_secs,
        ) {
            Ok(config) => self.try_connect(config).await,
            Err(e) => ConnectionTestResult::failure(
                EngineError::Configuration(e.to_string()).to_string(),
            ),
        }
    }

    /// Same as `test_connection`, for settings that have not been saved yet.
    pub async fn test_connection_params(&self, params: &ConnectionParams) -> ConnectionTestResult {
        let kind: BackendKind = match params.kind.parse() {
            Ok(kind) => kind,
            Err(e) => return ConnectionTestResult::failure(EngineError::Configuration(e).to_string()),
        };
        let config = ConnectionConfig {
            kind,
            host: params.host.clone(),
            port: params.port.unwrap_or_else(|| kind.default_port()),
            database: params.database.clone(),
            username: params.username.clone(),
            password: params.secret.clone(),
            connection_timeout_secs: self.config.test_connect_timeout_secs,
        };
        self.try_connect(config).await
    }

    async fn try_connect(&self, config: ConnectionConfig) -> ConnectionTestResult {
        let cancel = CancellationToken::new();
        match open_backend(self.connector.as_ref(), &config, &cancel).await {
            Ok(backend) => {
                if let Err(e) = backend.close().await {
                    log::warn!(
                        "Closing test connection to {} failed: {}",
                        config.address(),
                        redact_secret(&format!("{:#}", e), &config.password)
                    );
                }
                log::info!("Connection test to {} {} succeeded", config.kind, config.address());
                ConnectionTestResult::success()
            }
            Err(e) => {
                let err = EngineError::connection(&e, Some(&config.password));
                log::warn!("Connection test to {} failed: {}", config.address(), err);
                ConnectionTestResult::failure(err.to_string())
            }
        }
    }

    /// Checks that need no database and must not leave an audit record.
    fn precheck(&self, ctx: &ReportContext) -> Result<()> {
        if self.config.revalidate_on_execute {
            validate_query(&ctx.report.query_sql)
                .map_err(|e| EngineError::Validation(e.to_string()))?;
        }
        if !ctx.connection.active {
            return Err(EngineError::Configuration(format!(
                "Connection {} is inactive",
                ctx.connection.id
            )));
        }
        Ok(())
    }

    /// Create the audit record, connect, execute, post-process and finalize, all
    /// in one spawned task, so a record that exists is always finalized even if
    /// the caller goes away at any point.
    ///
    /// Returns the post-processed value, total row count, elapsed ms and record id.
    #[allow(clippy::too_many_arguments)]
    async fn run_audited<T: Send + 'static>(
        &self,
        ctx: &ReportContext,
        user_id: &str,
        values: Option<&FilterValues>,
        query: String,
        started_at: DateTime<Utc>,
        timer: Instant,
        mark_exported: bool,
        cancel: &CancellationToken,
        finish: Finish<T>,
    ) -> Result<(T, usize, i64, Uuid)> {
        let record = ExecutionRecord::new(
            Uuid::new_v4(),
            &ctx.report.id,
            user_id,
            values,
            started_at,
        );
        let run = AuditedRun {
            record,
            connection: ctx.connection.clone(),
            query,
            timer,
            mark_exported,
        };
        let engine = self.clone();
        let cancel = cancel.clone();

        tokio::spawn(async move { engine.finish_run(run, cancel, finish).await })
            .await
            .map_err(|e| EngineError::QueryExecution(format!("Execution task failed: {}", e)))?
    }

    async fn finish_run<T: Send + 'static>(
        self,
        run: AuditedRun,
        cancel: CancellationToken,
        finish: Finish<T>,
    ) -> Result<(T, usize, i64, Uuid)> {
        let AuditedRun {
            mut record,
            connection,
            query,
            timer,
            mark_exported,
        } = run;
        let execution_id = record.id;
        let report_id = record.report_id.clone();

        self.audit
            .create(&record)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        log::debug!("Report {}: execution {} recorded", report_id, execution_id);

        // A panic inside a driver must still end in a finalized record.
        let pipeline = {
            let engine = self.clone();
            tokio::spawn(async move { engine.pipeline(connection, query, cancel, finish).await })
        };
        let outcome = match pipeline.await {
            Ok(outcome) => outcome,
            Err(e) => Err(EngineError::QueryExecution(format!("Execution task failed: {}", e))),
        };

        let elapsed_ms = timer.elapsed().as_millis() as i64;
        match &outcome {
            Ok((_, row_count)) => {
                record.succeed(*row_count, elapsed_ms);
                if mark_exported {
                    record.mark_exported();
                }
            }
            Err(e) => record.fail(&e.to_string(), elapsed_ms),
        }

        if let Err(e) = self.audit.finalize(&record).await {
            log::error!(
                "Report {}: could not finalize execution {}: {}",
                report_id,
                execution_id,
                e
            );
            return Err(EngineError::Storage(e.to_string()));
        }

        match outcome {
            Ok((value, row_count)) => {
                log::info!(
                    "Report {}: execution {} succeeded with {} rows in {} ms",
                    report_id,
                    execution_id,
                    row_count,
                    elapsed_ms
                );
                Ok((value, row_count, elapsed_ms, execution_id))
            }
            Err(e) => {
                log::warn!(
                    "Report {}: execution {} failed after {} ms: {}",
                    report_id,
                    execution_id,
                    elapsed_ms,
                    e
                );
                Err(e)
            }
        }
    }

    /// Connect, execute and post-process. The handle is closed on every path.
    async fn pipeline<T: Send + 'static>(
        self,
        connection: Connection,
        query: String,
        cancel: CancellationToken,
        finish: Finish<T>,
    ) -> Result<(T, usize)> {
        let config = build_connection_config(
            &connection,
            self.cipher.as_ref(),
            self.config.connect_timeout_secs,
        )
        .map_err(|e| EngineError::Configuration(e.to_string()))?;
        let secret = config.password.clone();

        log::debug!("Connecting to {} at {}", config.kind, config.address());
        let mut backend = open_backend(self.connector.as_ref(), &config, &cancel)
            .await
            .map_err(|e| EngineError::connection(&e, Some(&secret)))?;
        drop(config);

        log::debug!("Executing query on {}", backend.kind());
        let result = run_query(backend.as_mut(), &query, &cancel).await;
        if let Err(e) = backend.close().await {
            log::warn!(
                "Failed to close backend handle: {}",
                sanitize_for_display(&redact_secret(&format!("{:#}", e), &secret))
            );
        }

        let raw = result.map_err(|e| EngineError::query(&e, Some(&secret)))?;
        let row_count = raw.row_count();
        log::debug!("Query returned {} rows", row_count);

        let value = finish(raw)?;
        Ok((value, row_count))
    }
}
