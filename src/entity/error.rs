use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by entity handlers and the hosting runtime
///
/// Cloneable so a single terminal failure can be handed to every caller
/// waiting on an entity's result.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum EntityError {
    /// Operation attempted after the entity started shutting down
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Not enough free nodes to satisfy an allocation
    #[error("Cannot allocate {requested} nodes; have only {available} available")]
    InsufficientCapacity { requested: usize, available: usize },

    /// Malformed request arguments
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// An external action exhausted its retry policy
    #[error("Action '{action}' failed after {attempts} attempt(s): {message}")]
    ActionFailed {
        action: String,
        attempts: u32,
        message: String,
    },

    /// A handler panicked; the entity stays consistent but the request failed
    #[error("Handler panicked: {0}")]
    HandlerPanicked(String),

    /// An entity with this id is already running
    #[error("Entity '{0}' is already running")]
    AlreadyRunning(String),

    /// The entity no longer accepts messages
    #[error("Entity '{0}' is closed")]
    Closed(String),

    /// The entity was terminated before producing a result
    #[error("Entity '{0}' was terminated")]
    Terminated(String),

    /// Gave up waiting on the runtime
    #[error("Timeout {0}")]
    Timeout(String),

    /// Seed state could not cross the checkpoint boundary
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A handler answered with a reply of the wrong kind
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),
}

impl EntityError {
    /// Rejection with a message
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected(message.into())
    }

    /// True for definitive business outcomes that callers must not retry
    pub fn is_business_failure(&self) -> bool {
        matches!(
            self,
            Self::Rejected(_) | Self::InsufficientCapacity { .. } | Self::InvalidArgument(_)
        )
    }
}

impl From<serde_json::Error> for EntityError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Failure reported by a single attempt of an external action
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ActionError {
    pub message: String,
    /// Stop retrying regardless of the remaining attempt budget
    pub non_retryable: bool,
}

impl ActionError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            non_retryable: false,
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            non_retryable: true,
        }
    }

    pub(crate) fn timed_out(timeout: std::time::Duration) -> Self {
        Self::retryable(format!("start-to-close timeout of {:?} exceeded", timeout))
    }
}
