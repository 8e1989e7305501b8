//! Error taxonomy shared by producers and backends.
//!
//! Transient and malformed-record conditions are recovered where they occur.
//! Configuration and identifier-resolution errors travel to the process
//! boundary and end the owning component.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    /// Missing required setting or unparseable value; fatal at startup
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Experiment or activity name with no registry entry, or id out of range
    #[error("unable to resolve {kind} identifier '{value}'")]
    IdentifierResolution { kind: &'static str, value: String },

    /// Snapshot or kernel-diagnostics acquisition failed; retried next poll
    #[error("connection query failed: {0}")]
    TransientQuery(String),

    /// Externally supplied flow descriptor that cannot be used
    #[error("malformed flow record: {0}")]
    MalformedInput(String),

    /// Best-effort send failure
    #[error("delivery failed: {0}")]
    Delivery(String),
}

impl FlowError {
    pub fn experiment(value: impl ToString) -> Self {
        FlowError::IdentifierResolution {
            kind: "experiment",
            value: value.to_string(),
        }
    }

    pub fn activity(value: impl ToString) -> Self {
        FlowError::IdentifierResolution {
            kind: "activity",
            value: value.to_string(),
        }
    }

    /// Whether the error must end the component that hit it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FlowError::Configuration(_) | FlowError::IdentifierResolution { .. }
        )
    }
}

pub type FlowResult<T> = std::result::Result<T, FlowError>;
