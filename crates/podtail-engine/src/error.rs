//! Error types for the engine crate.

use thiserror::Error;

/// Errors surfaced while building or running a tail session.
///
/// Everything here is a construction-time failure: once a session is
/// running, per-stream trouble is logged and scoped to the stream that hit
/// it instead of being propagated through this type.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A user-supplied pattern did not compile.
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// Unknown color mode name.
    #[error("color mode must be one of 'always', 'never', or 'auto', got {0:?}")]
    InvalidColorMode(String),

    /// Unknown predefined output name.
    #[error("output must be one of 'default', 'raw', or 'json', got {0:?}")]
    InvalidOutput(String),

    /// A custom format template failed to compile.
    #[error("invalid format template: {0}")]
    InvalidTemplate(String),

    /// Configuration value out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Log event serialization failed (json output).
    #[error("failed to serialize log event: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A specialized Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
