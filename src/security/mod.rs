pub mod audit;
pub mod credentials;
pub mod validation;

// Re-export key types and functions for convenient access
pub use audit::{AuditError, AuditStore, ExecutionRecord, InMemoryAuditStore};
pub use credentials::{build_connection_config, AesGcmCipher, CredentialError, SecretCipher};
pub use validation::{
    redact_secret, sanitize_for_display, strip_comments, validate_query, ValidationError,
};
