use super::{BackendKind, ConnectionConfig, ReportBackend};
use crate::db::value::{CellValue, RawResultSet};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use tiberius::numeric::Numeric;
use tiberius::{AuthMethod, Client, ColumnType, Config, EncryptionLevel};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

/// SQL Server backend using tiberius
pub struct SqlServerBackend {
    client: Client<Compat<TcpStream>>,
}

impl SqlServerBackend {
    pub async fn connect(config: &ConnectionConfig) -> anyhow::Result<Self> {
        let tib_config = Self::build_tiberius_config(config);
        let addr = config.address();

        let tcp = TcpStream::connect(&addr)
            .await
            .context(format!("Failed to connect to SQL Server at {}", addr))?;
        tcp.set_nodelay(true)?;

        let client = Client::connect(tib_config, tcp.compat_write())
            .await
            .context("TDS connection/authentication failed")?;

        log::debug!("Connected to SQL Server at {}", addr);
        Ok(Self { client })
    }

    fn build_tiberius_config(config: &ConnectionConfig) -> Config {
        let mut tib_config = Config::new();
        tib_config.host(&config.host);
        tib_config.port(config.port);
        tib_config.database(&config.database);
        tib_config.authentication(AuthMethod::sql_server(&config.username, &config.password));

        // Report servers commonly run with self-signed certificates
        tib_config.trust_cert();
        tib_config.encryption(EncryptionLevel::Required);
        tib_config
    }

    fn convert_row(row: &tiberius::Row) -> Vec<CellValue> {
        row.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| Self::column_value(row, idx, col.column_type()))
            .collect()
    }

    fn column_value(row: &tiberius::Row, idx: usize, column_type: ColumnType) -> CellValue {
        match column_type {
            ColumnType::Null => CellValue::Null,
            ColumnType::Bit | ColumnType::Bitn => match row.try_get::<bool, _>(idx) {
                Ok(Some(v)) => CellValue::Bool(v),
                _ => CellValue::Null,
            },
            ColumnType::Int1 | ColumnType::Int2 | ColumnType::Int4 | ColumnType::Int8
            | ColumnType::Intn => {
                if let Ok(Some(v)) = row.try_get::<i64, _>(idx) {
                    CellValue::Int(v)
                } else if let Ok(Some(v)) = row.try_get::<i32, _>(idx) {
                    CellValue::Int(v as i64)
                } else if let Ok(Some(v)) = row.try_get::<i16, _>(idx) {
                    CellValue::Int(v as i64)
                } else if let Ok(Some(v)) = row.try_get::<u8, _>(idx) {
                    CellValue::Int(v as i64)
                } else {
                    CellValue::Null
                }
            }
            ColumnType::Float4
            | ColumnType::Float8
            | ColumnType::Floatn
            | ColumnType::Money
            | ColumnType::Money4 => {
                if let Ok(Some(v)) = row.try_get::<f64, _>(idx) {
                    CellValue::Float(v)
                } else if let Ok(Some(v)) = row.try_get::<f32, _>(idx) {
                    CellValue::Float(v as f64)
                } else {
                    CellValue::Null
                }
            }
            ColumnType::Numericn | ColumnType::Decimaln => match row.try_get::<Numeric, _>(idx) {
                Ok(Some(v)) => CellValue::Float(numeric_to_f64(v)),
                _ => CellValue::Null,
            },
            ColumnType::Datetime
            | ColumnType::Datetime4
            | ColumnType::Datetimen
            | ColumnType::Datetime2 => match row.try_get::<NaiveDateTime, _>(idx) {
                Ok(Some(v)) => CellValue::DateTime(v),
                _ => CellValue::Null,
            },
            ColumnType::Daten => match row.try_get::<NaiveDate, _>(idx) {
                Ok(Some(v)) => CellValue::Date(v),
                _ => CellValue::Null,
            },
            ColumnType::DatetimeOffsetn => {
                match row.try_get::<DateTime<FixedOffset>, _>(idx) {
                    Ok(Some(v)) => CellValue::DateTimeTz(v),
                    _ => CellValue::Null,
                }
            }
            ColumnType::Timen => match row.try_get::<NaiveTime, _>(idx) {
                Ok(Some(v)) => CellValue::Text(v.format("%H:%M:%S%.f").to_string()),
                _ => CellValue::Null,
            },
            ColumnType::Guid => match row.try_get::<tiberius::Uuid, _>(idx) {
                Ok(Some(v)) => CellValue::Text(v.to_string()),
                _ => CellValue::Null,
            },
            ColumnType::BigVarBin | ColumnType::BigBinary | ColumnType::Image => {
                match row.try_get::<&[u8], _>(idx) {
                    Ok(Some(v)) => CellValue::Text(hex::encode(v)),
                    _ => CellValue::Null,
                }
            }
            _ => match row.try_get::<&str, _>(idx) {
                Ok(Some(v)) => CellValue::Text(v.to_string()),
                _ => CellValue::Null,
            },
        }
    }
}

fn numeric_to_f64(value: Numeric) -> f64 {
    value.value() as f64 / 10f64.powi(value.scale() as i32)
}

#[async_trait]
impl ReportBackend for SqlServerBackend {
    async fn execute_query(&mut self, query: &str) -> anyhow::Result<RawResultSet> {
        let mut stream = self
            .client
            .simple_query(query)
            .await
            .context("Failed to execute query")?;

        let columns: Vec<String> = stream
            .columns()
            .await
            .context("Failed to read result columns")?
            .map(|cols| cols.iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();

        let rows = stream
            .into_first_result()
            .await
            .context("Failed to read query results")?;

        let mut result = RawResultSet::new(columns);
        result.rows = rows.iter().map(Self::convert_row).collect();
        Ok(result)
    }

    async fn close(self: Box<Self>) -> anyhow::Result<()> {
        self.client
            .close()
            .await
            .context("Failed to close SQL Server connection")
    }

    fn kind(&self) -> BackendKind {
        BackendKind::SqlServer
    }
}
