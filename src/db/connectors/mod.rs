pub mod mysql;
pub mod postgres;
pub mod sqlserver;

use crate::db::value::RawResultSet;
use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Supported report backends
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BackendKind {
    SqlServer,
    PostgreSql,
    MySql,
}

impl BackendKind {
    pub fn default_port(&self) -> u16 {
        match self {
            BackendKind::SqlServer => 1433,
            BackendKind::PostgreSql => 5432,
            BackendKind::MySql => 3306,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::SqlServer => write!(f, "SQL Server"),
            BackendKind::PostgreSql => write!(f, "PostgreSQL"),
            BackendKind::MySql => write!(f, "MySQL"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sqlserver" | "sql server" | "mssql" => Ok(BackendKind::SqlServer),
            "postgresql" | "postgres" => Ok(BackendKind::PostgreSql),
            "mysql" => Ok(BackendKind::MySql),
            _ => Err(format!("Unsupported database type: {}", s)),
        }
    }
}

/// Connection settings for one backend, with the secret already decrypted.
///
/// Lives only for the duration of one connection attempt.
#[derive(Clone)]
pub struct ConnectionConfig {
    pub kind: BackendKind,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub connection_timeout_secs: u64,
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"******")
            .field("connection_timeout_secs", &self.connection_timeout_secs)
            .finish()
    }
}

/// A live, exclusively owned handle to one backend.
#[async_trait]
pub trait ReportBackend: Send {
    /// Run one statement and return every row it produced.
    async fn execute_query(&mut self, query: &str) -> anyhow::Result<RawResultSet>;

    /// Close the handle. Called on every exit path.
    async fn close(self: Box<Self>) -> anyhow::Result<()>;

    fn kind(&self) -> BackendKind;
}

/// Opens backend handles. One fresh handle per call, no pooling.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(&self, config: &ConnectionConfig) -> anyhow::Result<Box<dyn ReportBackend>>;
}

/// Connector that dials the real drivers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeConnector;

#[async_trait]
impl BackendConnector for NativeConnector {
    async fn connect(&self, config: &ConnectionConfig) -> anyhow::Result<Box<dyn ReportBackend>> {
        let backend: Box<dyn ReportBackend> = match config.kind {
            BackendKind::SqlServer => Box::new(sqlserver::SqlServerBackend::connect(config).await?),
            BackendKind::PostgreSql => Box::new(postgres::PostgresBackend::connect(config).await?),
            BackendKind::MySql => Box::new(mysql::MySqlBackend::connect(config).await?),
        };
        Ok(backend)
    }
}

/// Open a handle, bounded by the config's timeout and the cancellation token.
pub async fn open_backend(
    connector: &dyn BackendConnector,
    config: &ConnectionConfig,
    cancel: &CancellationToken,
) -> anyhow::Result<Box<dyn ReportBackend>> {
    let timeout = config.connect_timeout();
    tokio::select! {
        _ = cancel.cancelled() => Err(anyhow!("Connection attempt cancelled")),
        result = tokio::time::timeout(timeout, connector.connect(config)) => match result {
            Ok(backend) => backend,
            Err(_) => Err(anyhow!(
                "Timed out after {}s connecting to {} at {}",
                timeout.as_secs(),
                config.kind,
                config.address()
            )),
        },
    }
}

/// Run a statement, giving up if the token fires first.
///
/// On cancellation the in-flight future is dropped; the server may keep
/// running the statement until it notices the closed socket.
pub async fn run_query(
    backend: &mut dyn ReportBackend,
    query: &str,
    cancel: &CancellationToken,
) -> anyhow::Result<RawResultSet> {
    tokio::select! {
        _ = cancel.cancelled() => Err(anyhow!("Query cancelled")),
        result = backend.execute_query(query) => result,
    }
}
