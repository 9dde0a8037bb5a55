//! Error types for the mock server core.

use std::time::Duration;
use thiserror::Error;

/// Failure while compiling a transform rule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("unknown source '{0}'")]
    UnknownSource(String),

    #[error("unknown target '{0}'")]
    UnknownTarget(String),

    #[error("invalid {what} '{value}': {reason}")]
    InvalidData {
        what: &'static str,
        value: String,
        reason: String,
    },
}

impl RuleError {
    pub(crate) fn data(what: &'static str, value: &str, reason: impl Into<String>) -> Self {
        Self::InvalidData {
            what,
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    /// Unknown source/target syntax is a schema violation; bad parameters are data errors.
    pub fn is_schema(&self) -> bool {
        matches!(self, Self::UnknownSource(_) | Self::UnknownTarget(_))
    }
}

/// Rejection of an admin payload (matching, provision or global variables).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    /// Document shape does not fit the expected schema.
    #[error("invalid schema: {0}")]
    Schema(String),

    /// Schema is fine but the content is inconsistent.
    #[error("invalid data: {0}")]
    Data(String),
}

impl PayloadError {
    pub fn is_schema(&self) -> bool {
        matches!(self, Self::Schema(_))
    }
}

impl From<RuleError> for PayloadError {
    fn from(err: RuleError) -> Self {
        if err.is_schema() {
            Self::Schema(err.to_string())
        } else {
            Self::Data(err.to_string())
        }
    }
}

impl From<serde_json::Error> for PayloadError {
    fn from(err: serde_json::Error) -> Self {
        Self::Schema(err.to_string())
    }
}

/// Failure of an external command execution.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command execution is disabled")]
    Disabled,

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to spawn command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("command worker pool is closed")]
    PoolClosed,
}

/// Invalid event store selection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct QueryError(pub &'static str);
