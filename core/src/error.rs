//! The closed error taxonomy for monico's core.
//!
//! Domain validation and storage failures that call sites need to pattern
//! match on are represented here. Anything that merely needs to propagate
//! with context (driver errors, I/O) travels as [`anyhow::Error`] instead;
//! [`Result`] is the alias used throughout the rest of the crate.

/// Crate-wide result alias, matching the donor's `Result<T> = anyhow::Result<T>` convention.
pub type Result<T> = anyhow::Result<T>;

/// The error taxonomy described in the monico design: domain validation,
/// storage lifecycle, and configuration failures.
#[derive(Debug, thiserror::Error)]
pub enum MonicoError {
    #[error("invalid monitor attribute: {0}")]
    MonitorAttributeError(String),

    #[error("monitor with id \"{0}\" already exists")]
    MonitorAlreadyExists(String),

    #[error("monitor with id \"{0}\" not found")]
    MonitorNotFound(String),

    #[error("could not connect to storage backend: {0}")]
    StorageConnectionError(String),

    #[error("storage setup failed: {0}")]
    StorageSetupError(String),

    #[error("configuration error: {0}")]
    ConfigurationError(String),
}
