pub mod appdb;
pub mod config;
pub mod db;
pub mod error;
pub mod report;
pub mod security;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use report::executor::{ConnectionParams, ConnectionTestResult};
pub use report::{
    Connection, ExecutionOutcome, ExportOutcome, Filter, FilterType, FilterValue, FilterValues,
    Report, ReportContext, ReportEngine,
};

/// Install env_logger at `Info` unless `RUST_LOG` says otherwise.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log::LevelFilter::Info.as_str()),
    )
    .try_init();
}
