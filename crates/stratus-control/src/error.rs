//! Error types for stratus-control.

use std::fmt;

use crate::types::{ClusterId, StepIndex};

/// Result type alias using [`ControlError`].
pub type ControlResult<T> = Result<T, ControlError>;

/// Errors raised by the cluster lifecycle, step scheduling and polling layers.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Invalid cluster or step specification, detected before any remote call.
    #[error("configuration error: {0}")]
    Config(String),

    /// The control plane already has a live cluster with this name.
    #[error("a cluster named '{name}' already exists")]
    NameCollision {
        /// Requested cluster name.
        name: String,
    },

    /// A name lookup did not resolve to exactly one cluster.
    #[error("expected exactly one cluster named '{name}', found {}: {matches:?}", .matches.len())]
    AmbiguousName {
        /// Cluster name that was looked up.
        name: String,
        /// Identifiers of every match.
        matches: Vec<String>,
    },

    /// The control plane rejected a call because of rate limiting.
    ///
    /// Raised by service implementations; [`crate::ThrottleGuard`] retries it.
    #[error("request '{operation}' was throttled")]
    Throttled {
        /// Name of the throttled operation.
        operation: String,
    },

    /// A throttled call was still rejected after the retry budget was spent.
    #[error("request '{operation}' still throttled after {attempts} attempts")]
    ThrottlingExhausted {
        /// Name of the throttled operation.
        operation: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// Resources did not converge on the target state before the deadline.
    #[error("timed out waiting for {target}; not converged: {}", PendingList(.pending))]
    TransitionTimeout {
        /// Target state that was awaited.
        target: String,
        /// Resource identifiers with their last observed state.
        pending: Vec<(String, String)>,
    },

    /// A resource entered a state outside the allowed transitional set.
    #[error("resource {resource} entered unexpected state '{state}' while waiting for '{target}'")]
    UnexpectedState {
        /// Resource identifier.
        resource: String,
        /// Observed state.
        state: String,
        /// Target state that was awaited.
        target: String,
    },

    /// A submitted step finished in the failed state.
    #[error("step {index} ('{name}') failed on cluster {cluster}")]
    StepFailed {
        /// Owning cluster.
        cluster: ClusterId,
        /// Step ordinal assigned by the control plane.
        index: StepIndex,
        /// Step name.
        name: String,
    },

    /// Operation invoked in a lifecycle state that does not permit it.
    #[error("invalid state transition: cannot {operation} while {from}")]
    InvalidStateTransition {
        /// Current state.
        from: &'static str,
        /// Attempted operation.
        operation: &'static str,
    },

    /// The referenced cluster does not exist.
    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    /// The cluster exists but is not in a state that allows connecting to it.
    #[error("cluster {id} is not connectable (state '{state}')")]
    NotConnectable {
        /// Cluster identifier.
        id: ClusterId,
        /// Observed state.
        state: String,
    },

    /// Non-throttling rejection from the control plane.
    #[error("control service error: {0}")]
    Service(String),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Create a configuration error.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a throttling error for the named operation.
    #[must_use]
    pub fn throttled(operation: impl Into<String>) -> Self {
        Self::Throttled {
            operation: operation.into(),
        }
    }

    /// Create a control service error.
    #[must_use]
    pub fn service(msg: impl Into<String>) -> Self {
        Self::Service(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error is a throttling rejection eligible for retry.
    #[must_use]
    pub const fn is_throttling(&self) -> bool {
        matches!(self, Self::Throttled { .. })
    }
}

struct PendingList<'a>(&'a [(String, String)]);

impl fmt::Display for PendingList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (id, state)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{id}={state}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_lists_pending_resources() {
        let err = ControlError::TransitionTimeout {
            target: "ready".to_owned(),
            pending: vec![
                ("c-1".to_owned(), "creating".to_owned()),
                ("c-2".to_owned(), "ready (no address)".to_owned()),
            ],
        };
        assert_eq!(
            err.to_string(),
            "timed out waiting for ready; not converged: c-1=creating, c-2=ready (no address)"
        );
    }

    #[test]
    fn ambiguous_name_reports_match_count() {
        let err = ControlError::AmbiguousName {
            name: "etl".to_owned(),
            matches: vec![],
        };
        assert!(err.to_string().contains("found 0"));
    }

    #[test]
    fn only_raw_throttling_is_retryable() {
        assert!(ControlError::throttled("describe").is_throttling());
        assert!(!ControlError::ThrottlingExhausted {
            operation: "describe".to_owned(),
            attempts: 5
        }
        .is_throttling());
        assert!(!ControlError::service("boom").is_throttling());
    }
}
