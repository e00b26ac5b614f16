pub mod executor;
pub mod params;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use executor::{ExecutionOutcome, ExportOutcome, ReportEngine};
pub use params::{extract_placeholders, substitute, substitute_defaults, unbound_placeholders};

/// Stored, parameterized read-only SQL definition plus display/export policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub id: String,
    pub name: String,
    pub connection_id: String,
    pub query_sql: String,
    #[serde(default = "default_preview_rows")]
    pub preview_row_limit: usize,
    #[serde(default = "default_true")]
    pub export_allowed: bool,
}

fn default_preview_rows() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

/// Declared type of a filter placeholder.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum FilterType {
    #[serde(alias = "DATA")]
    Date,
    #[serde(alias = "TEXTO")]
    Text,
    #[serde(alias = "NUMERO")]
    Number,
    #[serde(alias = "LISTA")]
    List,
    /// Anything else; formatted like TEXT.
    #[serde(other)]
    Unknown,
}

/// A named, typed placeholder declaration attached to a report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    /// Placeholder token, e.g. `@data_inicio`.
    pub parameter: String,
    pub label: String,
    pub filter_type: FilterType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default_value: Option<String>,
    #[serde(default)]
    pub options: Option<Vec<String>>,
    /// strftime-style output pattern for DATE filters. Defaults to `%Y-%m-%d`.
    #[serde(default)]
    pub date_format: Option<String>,
    #[serde(default)]
    pub order: i32,
}

impl Filter {
    pub fn new(parameter: &str, label: &str, filter_type: FilterType) -> Self {
        Self {
            parameter: parameter.to_string(),
            label: label.to_string(),
            filter_type,
            required: false,
            default_value: None,
            options: None,
            date_format: None,
            order: 0,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: &str) -> Self {
        self.default_value = Some(value.to_string());
        self
    }

    pub fn with_date_format(mut self, pattern: &str) -> Self {
        self.date_format = Some(pattern.to_string());
        self
    }

    /// Check the declaration itself, independent of any runtime value.
    pub fn validate(&self) -> Result<(), String> {
        let name = self
            .parameter
            .strip_prefix('@')
            .ok_or_else(|| format!("Parameter \"{}\" must start with @", self.parameter))?;
        if name.is_empty() {
            return Err(format!(
                "Parameter \"{}\" needs a name after @",
                self.parameter
            ));
        }
        if self.filter_type == FilterType::List {
            if let Some(options) = &self.options {
                if options.is_empty() {
                    return Err(format!("List filter \"{}\" has no options", self.label));
                }
            }
        }
        Ok(())
    }
}

/// A raw, caller-supplied filter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
}

impl FilterValue {
    /// Missing-equivalent: null or the empty string.
    pub fn is_blank(&self) -> bool {
        match self {
            FilterValue::Null => true,
            FilterValue::Text(s) => s.is_empty(),
            _ => false,
        }
    }
}

impl std::fmt::Display for FilterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterValue::Null => write!(f, ""),
            FilterValue::Bool(b) => write!(f, "{}", b),
            FilterValue::Number(n) => write!(f, "{}", n),
            FilterValue::Text(s) => write!(f, "{}", s),
            FilterValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            FilterValue::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S")),
        }
    }
}

impl From<&str> for FilterValue {
    fn from(s: &str) -> Self {
        FilterValue::Text(s.to_string())
    }
}

/// Caller-supplied values keyed by placeholder token.
pub type FilterValues = BTreeMap<String, FilterValue>;

/// Credentials and dialect needed to reach one external database.
/// `encrypted_secret` is ciphertext; plaintext never lives on this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: String,
    /// Backend kind as stored: `SQLSERVER`, `POSTGRESQL` or `MYSQL`.
    pub kind: String,
    pub host: String,
    pub port: Option<u16>,
    pub database: String,
    pub username: String,
    pub encrypted_secret: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

/// Everything the engine needs to run one report; supplied by the CRUD layer.
#[derive(Debug, Clone)]
pub struct ReportContext {
    pub report: Report,
    pub connection: Connection,
    pub filters: Vec<Filter>,
}

impl ReportContext {
    pub fn new(report: Report, connection: Connection, mut filters: Vec<Filter>) -> Self {
        filters.sort_by_key(|f| f.order);
        Self {
            report,
            connection,
            filters,
        }
    }
}
