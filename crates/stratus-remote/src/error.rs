//! Error types for remote dispatch.

use std::io;

use thiserror::Error;

/// Errors raised while running operations on remote hosts.
#[derive(Error, Debug)]
pub enum RemoteError {
    /// The remote command ran and exited with a non-zero status.
    #[error("command on {host} exited with status {exit_code}")]
    Execution {
        /// Host address.
        host: String,
        /// Exit status reported by the remote shell.
        exit_code: i32,
    },

    /// The shell transport could not reach or talk to the host.
    #[error("transport failure on {host}: {message}")]
    Transport {
        /// Host address.
        host: String,
        /// What went wrong.
        message: String,
    },

    /// Local I/O failed while serving a host.
    #[error("I/O error on {host}: {source}")]
    Io {
        /// Host address.
        host: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Some hosts of a batch failed while others succeeded.
    #[error("{failed} host(s) failed, {succeeded} succeeded; first failure: {first}")]
    PartialBatchFailure {
        /// Number of failed hosts.
        failed: usize,
        /// Number of hosts that succeeded.
        succeeded: usize,
        /// First failure in host order.
        #[source]
        first: Box<RemoteError>,
    },

    /// The dispatch was cancelled before the operation finished.
    #[error("remote operation cancelled")]
    Cancelled,

    /// A host selection referred to a host that does not exist.
    #[error("host index {index} out of range for {len} host(s)")]
    HostIndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Number of hosts available.
        len: usize,
    },
}

/// Result type alias using [`RemoteError`].
pub type RemoteResult<T> = Result<T, RemoteError>;

impl RemoteError {
    /// Create a transport error.
    #[must_use]
    pub fn transport(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Wrap an I/O error that occurred while serving `host`.
    #[must_use]
    pub fn io(host: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            host: host.into(),
            source,
        }
    }

    /// Address of the host the error belongs to, if any.
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        match self {
            Self::Execution { host, .. } | Self::Transport { host, .. } | Self::Io { host, .. } => {
                Some(host)
            }
            Self::PartialBatchFailure { first, .. } => first.host(),
            Self::Cancelled | Self::HostIndexOutOfRange { .. } => None,
        }
    }

    /// Whether retrying the operation may succeed.
    ///
    /// Only I/O errors of a transient kind qualify; everything else is fatal.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
            Self::PartialBatchFailure { first, .. } => first.is_recoverable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_failure_reports_first_host() {
        let err = RemoteError::PartialBatchFailure {
            failed: 1,
            succeeded: 2,
            first: Box::new(RemoteError::Execution {
                host: "10.0.0.2".to_owned(),
                exit_code: 3,
            }),
        };
        assert_eq!(err.host(), Some("10.0.0.2"));
        assert_eq!(
            err.to_string(),
            "1 host(s) failed, 2 succeeded; first failure: command on 10.0.0.2 exited with status 3"
        );
    }

    #[test]
    fn only_transient_io_is_recoverable() {
        let transient = RemoteError::io("h", io::Error::from(io::ErrorKind::TimedOut));
        let permanent = RemoteError::io("h", io::Error::from(io::ErrorKind::NotFound));
        assert!(transient.is_recoverable());
        assert!(!permanent.is_recoverable());
        assert!(!RemoteError::transport("h", "connection refused").is_recoverable());
        assert!(!RemoteError::Cancelled.is_recoverable());
    }
}
