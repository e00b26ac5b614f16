//! Engine configuration.
//!
//! Loaded from TOML; every key is optional and falls back to the defaults below.
//! The encryption passphrase never lives here, only the name of the environment
//! variable that holds it.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Dial timeout for execute/export paths.
    pub connect_timeout_secs: u64,

    /// Dial timeout for ad-hoc "test before save" calls.
    pub test_connect_timeout_secs: u64,

    /// Preview limit used when a report has none configured.
    pub default_preview_rows: usize,

    /// Fixed preview limit for template test runs.
    pub test_preview_rows: usize,

    /// Upper bound for auto-sized spreadsheet columns.
    pub max_column_width: usize,

    /// Re-run the SQL safety validator on every execution, not just on save.
    pub revalidate_on_execute: bool,

    /// SQLite file for the audit store. `None` keeps audit records in memory.
    pub audit_db_path: Option<PathBuf>,

    /// Environment variable holding the connection-secret passphrase.
    pub encryption_key_env: String,

    pub export_sheet_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            test_connect_timeout_secs: 10,
            default_preview_rows: 1000,
            test_preview_rows: 10,
            max_column_width: 50,
            revalidate_on_execute: true,
            audit_db_path: None,
            encryption_key_env: "REPORTFORGE_ENCRYPTION_KEY".to_string(),
            export_sheet_name: "Data".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(contents)
            .map_err(|e| EngineError::Configuration(format!("Invalid engine config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout_secs == 0 || self.test_connect_timeout_secs == 0 {
            return Err(EngineError::Configuration(
                "connect timeouts must be at least one second".to_string(),
            ));
        }
        if self.default_preview_rows == 0 || self.test_preview_rows == 0 {
            return Err(EngineError::Configuration(
                "preview row limits must be at least 1".to_string(),
            ));
        }
        if self.export_sheet_name.trim().is_empty() || self.export_sheet_name.len() > 31 {
            return Err(EngineError::Configuration(
                "export_sheet_name must be 1 to 31 characters".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn test_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.test_connect_timeout_secs)
    }
}
