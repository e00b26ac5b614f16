//! Orchestrator tests against an in-process fake backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use reportforge_lib::db::connectors::{
    BackendConnector, BackendKind, ConnectionConfig, NativeConnector, ReportBackend,
};
use reportforge_lib::db::value::{CellValue, RawResultSet};
use reportforge_lib::security::{
    AesGcmCipher, AuditError, AuditStore, ExecutionRecord, InMemoryAuditStore, SecretCipher,
};
use reportforge_lib::{
    Connection, ConnectionParams, EngineConfig, EngineError, Filter, FilterType, FilterValue,
    FilterValues, Report, ReportContext, ReportEngine,
};

const SECRET: &str = "s3cr3t-pw";

// ─── fake backend ──────────────────────────────────────────────────────────

#[derive(Clone)]
enum Behavior {
    Rows(RawResultSet),
    RefuseConnect,
    FailQuery,
    HangQuery,
}

#[derive(Default)]
struct Calls {
    connects: AtomicUsize,
    closes: AtomicUsize,
    queries: Mutex<Vec<String>>,
}

struct FakeConnector {
    behavior: Behavior,
    calls: Arc<Calls>,
}

struct FakeBackend {
    behavior: Behavior,
    calls: Arc<Calls>,
}

#[async_trait]
impl BackendConnector for FakeConnector {
    async fn connect(&self, config: &ConnectionConfig) -> anyhow::Result<Box<dyn ReportBackend>> {
        self.calls.connects.fetch_add(1, Ordering::SeqCst);
        assert_eq!(config.password, SECRET);
        if let Behavior::RefuseConnect = self.behavior {
            return Err(anyhow!(
                "login failed for user '{}' using password '{}'",
                config.username,
                config.password
            ));
        }
        Ok(Box::new(FakeBackend {
            behavior: self.behavior.clone(),
            calls: self.calls.clone(),
        }))
    }
}

#[async_trait]
impl ReportBackend for FakeBackend {
    async fn execute_query(&mut self, query: &str) -> anyhow::Result<RawResultSet> {
        self.calls.queries.lock().unwrap().push(query.to_string());
        match &self.behavior {
            Behavior::Rows(rows) => Ok(rows.clone()),
            Behavior::FailQuery => Err(anyhow!("relation \"vendas\" does not exist")),
            Behavior::HangQuery => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(RawResultSet::default())
            }
            Behavior::RefuseConnect => unreachable!(),
        }
    }

    async fn close(self: Box<Self>) -> anyhow::Result<()> {
        self.calls.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::PostgreSql
    }
}

// ─── helpers ───────────────────────────────────────────────────────────────

fn rows(count: usize) -> RawResultSet {
    let mut raw = RawResultSet::new(vec!["id".to_string(), "total".to_string()]);
    for i in 0..count {
        raw.rows
            .push(vec![CellValue::Int(i as i64), CellValue::Float(i as f64 * 1.5)]);
    }
    raw
}

struct Harness {
    engine: ReportEngine,
    audit: Arc<InMemoryAuditStore>,
    calls: Arc<Calls>,
    cipher: Arc<AesGcmCipher>,
}

fn harness(behavior: Behavior) -> Harness {
    let calls = Arc::new(Calls::default());
    let audit = Arc::new(InMemoryAuditStore::new());
    let cipher = Arc::new(AesGcmCipher::new("test-key"));
    let engine = ReportEngine::new(
        Arc::new(FakeConnector {
            behavior,
            calls: calls.clone(),
        }),
        cipher.clone(),
        audit.clone(),
        EngineConfig::default(),
    );
    Harness {
        engine,
        audit,
        calls,
        cipher,
    }
}

fn context(cipher: &dyn SecretCipher, sql: &str, filters: Vec<Filter>) -> ReportContext {
    ReportContext::new(
        Report {
            id: "rep-1".to_string(),
            name: "Vendas".to_string(),
            connection_id: "conn-1".to_string(),
            query_sql: sql.to_string(),
            preview_row_limit: 1000,
            export_allowed: true,
        },
        Connection {
            id: "conn-1".to_string(),
            kind: "POSTGRESQL".to_string(),
            host: "db.internal".to_string(),
            port: None,
            database: "erp".to_string(),
            username: "reader".to_string(),
            encrypted_secret: cipher.encrypt(SECRET).unwrap(),
            active: true,
        },
        filters,
    )
}

fn date_values(date: &str) -> FilterValues {
    let mut values = FilterValues::new();
    values.insert("@data".to_string(), FilterValue::Text(date.to_string()));
    values
}

fn vendas(cipher: &dyn SecretCipher) -> ReportContext {
    context(
        cipher,
        "SELECT * FROM vendas WHERE data = @data",
        vec![Filter::new("@data", "Data", FilterType::Date).required()],
    )
}

// ─── execute ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn execute_success_records_audit() {
    let h = harness(Behavior::Rows(rows(3)));
    let ctx = vendas(h.cipher.as_ref());

    let outcome = h
        .engine
        .execute(&ctx, "user-1", &date_values("2024-01-01"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.result.total_row_count, 3);
    assert_eq!(outcome.result.displayed_row_count, 3);
    assert_eq!(outcome.result.columns, vec!["id", "total"]);
    assert_eq!(
        h.calls.queries.lock().unwrap().as_slice(),
        &["SELECT * FROM vendas WHERE data = '2024-01-01'".to_string()]
    );
    assert_eq!(h.calls.closes.load(Ordering::SeqCst), 1);

    let record = h.audit.get(outcome.execution_id).await.unwrap().unwrap();
    assert!(record.success);
    assert_eq!(record.row_count, Some(3));
    assert_eq!(record.user_id, "user-1");
    assert_eq!(record.filter_values, Some(serde_json::json!({"@data": "2024-01-01"})));
    assert!(record.finished_at.unwrap() >= record.started_at);
    assert!(!record.exported);
}

#[tokio::test]
async fn execute_truncates_to_preview_limit() {
    let h = harness(Behavior::Rows(rows(25)));
    let mut ctx = vendas(h.cipher.as_ref());
    ctx.report.preview_row_limit = 10;

    let outcome = h
        .engine
        .execute(&ctx, "user-1", &date_values("2024-01-01"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.result.total_row_count, 25);
    assert_eq!(outcome.result.displayed_row_count, 10);
    let record = h.audit.get(outcome.execution_id).await.unwrap().unwrap();
    assert_eq!(record.row_count, Some(25));
}

#[tokio::test]
async fn missing_required_filter_leaves_no_audit() {
    let h = harness(Behavior::Rows(rows(1)));
    let ctx = vendas(h.cipher.as_ref());

    let err = h
        .engine
        .execute(&ctx, "user-1", &FilterValues::new(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(
        err,
        EngineError::Validation("Filter \"Data\" is required".to_string())
    );
    assert!(h.audit.is_empty());
    assert_eq!(h.calls.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unsafe_template_is_rejected_before_connecting() {
    let h = harness(Behavior::Rows(rows(1)));
    let ctx = context(h.cipher.as_ref(), "DELETE FROM vendas", Vec::new());

    let err = h
        .engine
        .execute(&ctx, "user-1", &FilterValues::new(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.category(), "validation");
    assert!(h.audit.is_empty());
    assert_eq!(h.calls.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn inactive_connection_is_rejected_without_audit() {
    let h = harness(Behavior::Rows(rows(1)));
    let mut ctx = vendas(h.cipher.as_ref());
    ctx.connection.active = false;

    let err = h
        .engine
        .execute(&ctx, "user-1", &date_values("2024-01-01"), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.category(), "configuration");
    assert!(h.audit.is_empty());
}

#[tokio::test]
async fn connection_failure_is_audited_and_redacted() {
    let h = harness(Behavior::RefuseConnect);
    let ctx = vendas(h.cipher.as_ref());

    let err = h
        .engine
        .execute(&ctx, "user-1", &date_values("2024-01-01"), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Connection(_)));
    assert!(!err.to_string().contains(SECRET));

    let records = h.audit.list_for_report("rep-1").await.unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert!(!record.success);
    assert!(record.row_count.is_none());
    let error = record.error.as_deref().unwrap();
    assert!(!error.is_empty());
    assert!(!error.contains(SECRET));
}

#[tokio::test]
async fn query_failure_is_audited_and_handle_closed() {
    let h = harness(Behavior::FailQuery);
    let ctx = vendas(h.cipher.as_ref());

    let err = h
        .engine
        .execute(&ctx, "user-1", &date_values("2024-01-01"), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::QueryExecution(_)));
    assert!(err.to_string().contains("does not exist"));
    assert_eq!(h.calls.closes.load(Ordering::SeqCst), 1);

    let records = h.audit.list_for_report("rep-1").await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(!records[0].success);
    assert!(records[0].row_count.is_none());
}

#[tokio::test]
async fn undecryptable_secret_is_configuration_error() {
    let h = harness(Behavior::Rows(rows(1)));
    let mut ctx = vendas(h.cipher.as_ref());
    ctx.connection.encrypted_secret = AesGcmCipher::new("other-key").encrypt(SECRET).unwrap();

    let err = h
        .engine
        .execute(&ctx, "user-1", &date_values("2024-01-01"), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.category(), "configuration");
    assert_eq!(h.calls.connects.load(Ordering::SeqCst), 0);
    assert_eq!(h.audit.len(), 1);
}

#[tokio::test]
async fn cancellation_stops_hanging_query() {
    let h = harness(Behavior::HangQuery);
    let ctx = vendas(h.cipher.as_ref());
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = h
        .engine
        .execute(&ctx, "user-1", &date_values("2024-01-01"), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::QueryExecution(_)));
    assert!(err.to_string().contains("cancelled"));
    assert_eq!(h.calls.closes.load(Ordering::SeqCst), 1);
    let records = h.audit.list_for_report("rep-1").await.unwrap();
    assert!(!records[0].success);
}

#[tokio::test]
async fn non_finite_values_serialize_as_null() {
    let mut raw = RawResultSet::new(vec!["ratio".to_string()]);
    raw.rows.push(vec![CellValue::Float(f64::NAN)]);
    raw.rows.push(vec![CellValue::Float(f64::INFINITY)]);
    let h = harness(Behavior::Rows(raw));
    let ctx = vendas(h.cipher.as_ref());

    let outcome = h
        .engine
        .execute(&ctx, "user-1", &date_values("2024-01-01"), &CancellationToken::new())
        .await
        .unwrap();

    let json = serde_json::to_value(&outcome).unwrap();
    assert_eq!(json["rows"], serde_json::json!([[null], [null]]));
    assert_eq!(json["totalRowCount"], serde_json::json!(2));
    assert!(json["executionId"].is_string());
}

/// Audit store whose `create` lands immediately but returns late, like a
/// blocking-pool write the caller stops waiting for.
struct SlowCreateStore {
    inner: InMemoryAuditStore,
}

#[async_trait]
impl AuditStore for SlowCreateStore {
    async fn create(&self, record: &ExecutionRecord) -> Result<(), AuditError> {
        self.inner.create(record).await?;
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(())
    }

    async fn finalize(&self, record: &ExecutionRecord) -> Result<(), AuditError> {
        self.inner.finalize(record).await
    }

    async fn get(&self, id: uuid::Uuid) -> Result<Option<ExecutionRecord>, AuditError> {
        self.inner.get(id).await
    }

    async fn list_for_report(&self, report_id: &str) -> Result<Vec<ExecutionRecord>, AuditError> {
        self.inner.list_for_report(report_id).await
    }
}

#[tokio::test]
async fn dropped_caller_during_audit_create_still_finalizes() {
    let calls = Arc::new(Calls::default());
    let audit = Arc::new(SlowCreateStore {
        inner: InMemoryAuditStore::new(),
    });
    let cipher = Arc::new(AesGcmCipher::new("test-key"));
    let engine = ReportEngine::new(
        Arc::new(FakeConnector {
            behavior: Behavior::Rows(rows(2)),
            calls: calls.clone(),
        }),
        cipher.clone(),
        audit.clone(),
        EngineConfig::default(),
    );
    let ctx = vendas(cipher.as_ref());
    let values = date_values("2024-01-01");

    let cancel = CancellationToken::new();
    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        engine.execute(&ctx, "user-1", &values, &cancel),
    )
    .await;
    assert!(abandoned.is_err(), "caller should give up before create returns");

    let mut records = Vec::new();
    for _ in 0..60 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        records = audit.list_for_report("rep-1").await.unwrap();
        if records.iter().all(|r| r.finished_at.is_some()) && !records.is_empty() {
            break;
        }
    }

    assert_eq!(records.len(), 1);
    assert!(records[0].finished_at.is_some());
    assert!(records[0].success);
    assert_eq!(records[0].row_count, Some(2));
    assert_eq!(calls.closes.load(Ordering::SeqCst), 1);
}

// ─── test mode ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_mode_forces_ten_rows_and_ignores_required() {
    let h = harness(Behavior::Rows(rows(50)));
    let ctx = vendas(h.cipher.as_ref());

    let outcome = h
        .engine
        .test(&ctx, "author-1", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.result.displayed_row_count, 10);
    assert_eq!(outcome.result.total_row_count, 50);
    assert_eq!(
        h.calls.queries.lock().unwrap().as_slice(),
        &["SELECT * FROM vendas WHERE data = NULL".to_string()]
    );
    let record = h.audit.get(outcome.execution_id).await.unwrap().unwrap();
    assert!(record.filter_values.is_none());
}

// ─── export ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn export_writes_workbook_and_marks_record() {
    let h = harness(Behavior::Rows(rows(1200)));
    let ctx = vendas(h.cipher.as_ref());

    let outcome = h
        .engine
        .export(&ctx, "user-1", &date_values("2024-01-01"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(&outcome.bytes[..2], b"PK");
    assert_eq!(outcome.row_count, 1200);
    assert!(outcome.file_name.starts_with("Vendas_"));
    assert!(outcome.file_name.ends_with(".xlsx"));

    let record = h.audit.get(outcome.execution_id).await.unwrap().unwrap();
    assert!(record.success);
    assert!(record.exported);
    assert!(record.exported_at.is_some());
    assert_eq!(record.row_count, Some(1200));
}

// ─── connection tests ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_connection_success_and_failure() {
    let ok = harness(Behavior::Rows(rows(0)));
    let ctx = vendas(ok.cipher.as_ref());
    let result = ok.engine.test_connection(&ctx.connection).await;
    assert!(result.ok);
    assert_eq!(result.message, "Connection established successfully");
    assert_eq!(ok.calls.closes.load(Ordering::SeqCst), 1);
    assert!(ok.calls.queries.lock().unwrap().is_empty());

    let refused = harness(Behavior::RefuseConnect);
    let ctx = vendas(refused.cipher.as_ref());
    let result = refused.engine.test_connection(&ctx.connection).await;
    assert!(!result.ok);
    assert!(!result.message.contains(SECRET));
}

#[tokio::test]
async fn test_connection_inactive_does_not_dial() {
    let h = harness(Behavior::Rows(rows(0)));
    let mut ctx = vendas(h.cipher.as_ref());
    ctx.connection.active = false;

    let result = h.engine.test_connection(&ctx.connection).await;
    assert!(!result.ok);
    assert_eq!(h.calls.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_connection_params_unknown_kind() {
    let h = harness(Behavior::Rows(rows(0)));
    let params = ConnectionParams {
        kind: "ORACLE".to_string(),
        host: "db".to_string(),
        port: None,
        database: "x".to_string(),
        username: "u".to_string(),
        secret: SECRET.to_string(),
    };
    let result = h.engine.test_connection_params(&params).await;
    assert!(!result.ok);
    assert!(result.message.contains("Unsupported database type"));
    assert!(!format!("{:?}", params).contains(SECRET));
}

#[tokio::test]
async fn unreachable_postgres_host_fails_quickly() {
    let audit = Arc::new(InMemoryAuditStore::new());
    let cipher = Arc::new(AesGcmCipher::new("test-key"));
    let config = EngineConfig {
        connect_timeout_secs: 2,
        test_connect_timeout_secs: 2,
        ..EngineConfig::default()
    };
    let engine = ReportEngine::new(Arc::new(NativeConnector), cipher.clone(), audit.clone(), config);

    let mut ctx = vendas(cipher.as_ref());
    ctx.connection.host = "127.0.0.1".to_string();
    ctx.connection.port = Some(1);

    let err = engine
        .execute(&ctx, "user-1", &date_values("2024-01-01"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Connection(_)));
    assert!(!err.to_string().contains(SECRET));

    let records = audit.list_for_report("rep-1").await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(!records[0].success);
    assert!(records[0].error.as_deref().is_some_and(|e| !e.is_empty()));
    assert!(records[0].row_count.is_none());
}

#[tokio::test]
async fn engine_from_config_uses_sqlite_store() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        audit_db_path: Some(dir.path().join("audit.db")),
        encryption_key_env: "REPORTFORGE_ENGINE_TEST_KEY".to_string(),
        ..EngineConfig::default()
    };
    std::env::set_var("REPORTFORGE_ENGINE_TEST_KEY", "from-env");

    let engine = ReportEngine::from_config(config).unwrap();
    assert!(dir.path().join("audit.db").exists());
    assert!(engine
        .audit_store()
        .list_for_report("rep-1")
        .await
        .unwrap()
        .is_empty());
}
