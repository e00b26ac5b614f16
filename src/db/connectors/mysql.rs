use super::{BackendKind, ConnectionConfig, ReportBackend};
use crate::db::value::{CellValue, RawResultSet};
use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use mysql_async::consts::ColumnType;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, OptsBuilder, Row, Value};

/// MySQL backend using mysql_async
pub struct MySqlBackend {
    conn: Conn,
}

impl MySqlBackend {
    pub async fn connect(config: &ConnectionConfig) -> anyhow::Result<Self> {
        let opts = OptsBuilder::default()
            .ip_or_hostname(config.host.clone())
            .tcp_port(config.port)
            .user(Some(config.username.clone()))
            .pass(Some(config.password.clone()))
            .db_name(Some(config.database.clone()));

        let conn = Conn::new(opts)
            .await
            .context(format!("Failed to connect to MySQL at {}", config.address()))?;

        log::debug!("Connected to MySQL at {}", config.address());
        Ok(Self { conn })
    }
}

/// Convert one binary-protocol value using the column's wire type.
fn convert_value(value: &Value, column_type: ColumnType) -> CellValue {
    match value {
        Value::NULL => CellValue::Null,
        Value::Int(i) => CellValue::Int(*i),
        Value::UInt(u) => i64::try_from(*u)
            .map(CellValue::Int)
            .unwrap_or(CellValue::Float(*u as f64)),
        Value::Float(f) => CellValue::Float(*f as f64),
        Value::Double(d) => CellValue::Float(*d),
        Value::Date(year, month, day, hour, minute, second, micros) => {
            let Some(date) = NaiveDate::from_ymd_opt(*year as i32, *month as u32, *day as u32)
            else {
                // Zero dates such as 0000-00-00 have no calendar value.
                return CellValue::Null;
            };
            if matches!(
                column_type,
                ColumnType::MYSQL_TYPE_DATE | ColumnType::MYSQL_TYPE_NEWDATE
            ) {
                return CellValue::Date(date);
            }
            date.and_hms_micro_opt(*hour as u32, *minute as u32, *second as u32, *micros)
                .map(CellValue::DateTime)
                .unwrap_or(CellValue::Null)
        }
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let total_hours = *days * 24 + *hours as u32;
            let sign = if *negative { "-" } else { "" };
            let mut text = format!("{}{:02}:{:02}:{:02}", sign, total_hours, minutes, seconds);
            if *micros > 0 {
                text.push_str(&format!(".{:06}", micros));
            }
            CellValue::Text(text)
        }
        Value::Bytes(bytes) => {
            if matches!(
                column_type,
                ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL
            ) {
                if let Some(number) = std::str::from_utf8(bytes)
                    .ok()
                    .and_then(|s| s.parse::<f64>().ok())
                {
                    return CellValue::Float(number);
                }
            }
            CellValue::Text(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

fn convert_row(row: &Row, column_types: &[ColumnType]) -> Vec<CellValue> {
    (0..row.len())
        .map(|idx| {
            let column_type = column_types
                .get(idx)
                .copied()
                .unwrap_or(ColumnType::MYSQL_TYPE_VAR_STRING);
            row.as_ref(idx)
                .map(|value| convert_value(value, column_type))
                .unwrap_or(CellValue::Null)
        })
        .collect()
}

#[async_trait]
impl ReportBackend for MySqlBackend {
    async fn execute_query(&mut self, query: &str) -> anyhow::Result<RawResultSet> {
        let mut result = self
            .conn
            .exec_iter(query, ())
            .await
            .context("Failed to execute query")?;

        let column_defs = result.columns();
        let columns: Vec<String> = column_defs
            .as_ref()
            .map(|cols| cols.iter().map(|c| c.name_str().into_owned()).collect())
            .unwrap_or_default();
        let column_types: Vec<ColumnType> = column_defs
            .as_ref()
            .map(|cols| cols.iter().map(|c| c.column_type()).collect())
            .unwrap_or_default();

        let rows: Vec<Row> = result
            .collect::<Row>()
            .await
            .context("Failed to read query results")?;
        result
            .drop_result()
            .await
            .context("Failed to drain remaining result sets")?;

        let mut raw = RawResultSet::new(columns);
        raw.rows = rows.iter().map(|row| convert_row(row, &column_types)).collect();
        Ok(raw)
    }

    async fn close(self: Box<Self>) -> anyhow::Result<()> {
        self.conn
            .disconnect()
            .await
            .context("Failed to close MySQL connection")
    }

    fn kind(&self) -> BackendKind {
        BackendKind::MySql
    }
}
