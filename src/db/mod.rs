pub mod connectors;
pub mod export;
pub mod normalizer;
pub mod value;

pub use connectors::{BackendConnector, BackendKind, ConnectionConfig, NativeConnector, ReportBackend};
pub use normalizer::{normalize, NormalizedResult};
pub use value::{CellValue, RawResultSet};
