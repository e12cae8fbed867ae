//! Error types for stub construction and administration.

use std::path::PathBuf;

/// Hard errors raised while building stubs or editing the stub table.
///
/// Failures on the request-resolution path never surface here: an unmatched
/// request or a failed recording degrades to a fallback result instead.
#[derive(Debug, thiserror::Error)]
pub enum StubError {
    /// An index-based write addressed a position outside the table.
    #[error("stub index {index} out of range (table holds {len} stubs)")]
    OutOfRange { index: usize, len: usize },

    /// A stub was declared without any response.
    #[error("malformed response set: {0}")]
    MalformedResponseSet(String),

    /// A request pattern failed to compile as a regular expression.
    #[error("invalid {field} pattern {pattern:?}: {reason}")]
    InvalidPattern {
        field: String,
        pattern: String,
        reason: String,
    },

    #[error("invalid HTTP method {0:?}")]
    InvalidMethod(String),

    #[error("invalid status code: {0}")]
    InvalidStatus(u16),

    /// A file-backed response could not be read.
    #[error("failed to read response file {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The stub definition text could not be parsed.
    #[error("invalid stub definition: {0}")]
    Config(#[from] serde_yaml::Error),
}

impl StubError {
    pub(crate) fn invalid_pattern(field: &str, pattern: &str, err: regex::Error) -> Self {
        StubError::InvalidPattern {
            field: field.to_string(),
            pattern: pattern.to_string(),
            reason: err.to_string(),
        }
    }
}
