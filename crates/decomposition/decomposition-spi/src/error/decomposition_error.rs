//! Decomposition error types

use thiserror::Error;

/// Errors that can occur while restoring or configuring a decomposition
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecompositionError {
    /// Persisted state carries a version marker this build cannot read
    #[error("Unsupported state version '{found}', supported version is '{supported}'")]
    UnsupportedVersion { found: String, supported: String },

    /// A required persisted field is missing
    #[error("Missing value for '{0}'")]
    MissingValue(String),

    /// A persisted field could not be parsed
    #[error("Failed to parse '{tag}' from '{value}'")]
    Parse { tag: String, value: String },

    /// Invalid parameter value
    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    /// Encoding or decoding the state document failed
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DecompositionError {
    /// Shorthand for a parse failure of `value` under `tag`.
    pub fn parse(tag: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Parse {
            tag: tag.into(),
            value: value.into(),
        }
    }

    /// Shorthand for an unsupported version marker.
    pub fn unsupported_version(found: impl Into<String>, supported: impl Into<String>) -> Self {
        Self::UnsupportedVersion {
            found: found.into(),
            supported: supported.into(),
        }
    }
}
