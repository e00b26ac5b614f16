use super::{BackendKind, ConnectionConfig, ReportBackend};
use crate::db::value::{CellValue, RawResultSet};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};

/// PostgreSQL backend using tokio-postgres
pub struct PostgresBackend {
    client: Client,
    connection_task: JoinHandle<()>,
}

impl PostgresBackend {
    pub async fn connect(config: &ConnectionConfig) -> anyhow::Result<Self> {
        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(&config.host)
            .port(config.port)
            .dbname(&config.database)
            .user(&config.username)
            .password(&config.password)
            .connect_timeout(config.connect_timeout());

        let (client, connection) = pg_config
            .connect(NoTls)
            .await
            .context(format!("Failed to connect to PostgreSQL at {}", config.address()))?;

        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                log::warn!("PostgreSQL connection closed with error: {}", e);
            }
        });

        log::debug!("Connected to PostgreSQL at {}", config.address());
        Ok(Self {
            client,
            connection_task,
        })
    }
}

/// Parse one text-protocol value using the column's declared type name.
fn parse_text_value(type_name: &str, raw: Option<&str>) -> CellValue {
    let Some(text) = raw else {
        return CellValue::Null;
    };

    let parsed = match type_name {
        "bool" => Some(CellValue::Bool(text == "t")),
        "int2" | "int4" | "int8" | "oid" => text.parse::<i64>().ok().map(CellValue::Int),
        "float4" | "float8" | "numeric" => text.parse::<f64>().ok().map(CellValue::Float),
        "date" => NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .ok()
            .map(CellValue::Date),
        "timestamp" => NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
            .ok()
            .map(CellValue::DateTime),
        "timestamptz" => DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
            .ok()
            .map(CellValue::DateTimeTz),
        _ => None,
    };

    // Values outside chrono's range (e.g. `infinity`) stay as text.
    parsed.unwrap_or_else(|| CellValue::Text(text.to_string()))
}

#[async_trait]
impl ReportBackend for PostgresBackend {
    async fn execute_query(&mut self, query: &str) -> anyhow::Result<RawResultSet> {
        let statement = self
            .client
            .prepare(query)
            .await
            .context("Failed to prepare query")?;

        let columns: Vec<String> = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        let type_names: Vec<String> = statement
            .columns()
            .iter()
            .map(|c| c.type_().name().to_string())
            .collect();

        let messages = self
            .client
            .simple_query(query)
            .await
            .context("Failed to execute query")?;

        let mut result = RawResultSet::new(columns);
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                let values = (0..row.len())
                    .map(|idx| {
                        let type_name = type_names.get(idx).map(String::as_str).unwrap_or("text");
                        parse_text_value(type_name, row.get(idx))
                    })
                    .collect();
                result.rows.push(values);
            }
        }
        Ok(result)
    }

    async fn close(self: Box<Self>) -> anyhow::Result<()> {
        let PostgresBackend {
            client,
            connection_task,
        } = *self;
        drop(client);
        connection_task
            .await
            .context("PostgreSQL connection task failed")
    }

    fn kind(&self) -> BackendKind {
        BackendKind::PostgreSql
    }
}
