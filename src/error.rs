/// Error handling module for GSM Runner.
///
/// This module defines the error types used throughout the library.
/// Every failed lifecycle, backup or restore operation surfaces one of these
/// variants to the caller, and the same text is recorded as the instance's
/// `last_error`.
///
/// # Example
///
/// ```
/// use gsm_runner::error::{Error, Result};
///
/// fn handle_error(result: Result<()>) {
///     match result {
///         Ok(_) => println!("Operation succeeded"),
///         Err(Error::ServerNotFound(id)) => println!("Server '{}' is not configured", id),
///         Err(e) if e.is_retryable() => println!("Busy, try again later: {}", e),
///         Err(e) => println!("Other error: {}", e),
///     }
/// }
/// ```
use crate::server::ServerStatus;
use std::fmt;
use thiserror::Error;

/// Why a process could not be spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnFailure {
    /// The executable does not exist.
    BinaryMissing,
    /// The executable exists but may not be executed.
    PermissionDenied,
    /// The working directory is missing or not a directory.
    WorkingDirInvalid,
    /// Any other OS-level spawn failure.
    Other,
}

impl fmt::Display for SpawnFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SpawnFailure::BinaryMissing => "binary missing",
            SpawnFailure::PermissionDenied => "permission denied",
            SpawnFailure::WorkingDirInvalid => "working directory invalid",
            SpawnFailure::Other => "spawn failed",
        };
        f.write_str(text)
    }
}

/// Errors that can occur in the gsm-runner library.
///
/// This enum represents all possible error types that can be returned from
/// operations in the GSM Runner library. Each variant includes context
/// information to help diagnose and handle the error appropriately.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to parse configuration from a file or string.
    ///
    /// This error occurs when:
    /// - The configuration JSON is malformed
    /// - Field types are incorrect
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Configuration is valid JSON but contains invalid values.
    ///
    /// This error occurs when:
    /// - A required field (`app_id`, `executable`) is empty
    /// - A `stop_time` is not `HH:MM`
    /// - Two servers resolve to the same instance id
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Requested server was not found in the registry.
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// The operation is not legal from the instance's current status.
    ///
    /// The call is rejected and no state change happens.
    #[error("Cannot {operation} '{instance_id}' while it is {status}")]
    InvalidState {
        /// Instance the operation targeted
        instance_id: String,
        /// Operation name
        operation: String,
        /// Status observed under the lock
        status: ServerStatus,
    },

    /// Another operation held the instance lock for longer than the wait bound.
    #[error("'{instance_id}' is busy with {holder}, try again later")]
    Busy {
        /// Instance the operation targeted
        instance_id: String,
        /// Operation currently holding the lock
        holder: String,
    },

    /// Operation timed out.
    ///
    /// This error occurs when:
    /// - A server takes too long to start
    /// - A process does not exit even after a forced kill
    /// - An update or backup exceeds its configured bound
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The OS refused to spawn a process.
    #[error("Failed to spawn process ({failure}): {detail}")]
    Spawn {
        /// Classified cause
        failure: SpawnFailure,
        /// OS error text
        detail: String,
    },

    /// Error when signalling, waiting on or reading from a running process.
    #[error("Server process error: {0}")]
    Process(String),

    /// File-system failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// The package-fetch command exited with a non-zero code.
    #[error("Update failed (exit code {}): {tail}", exit_label(.exit_code))]
    UpdateFailed {
        /// Exit code, `None` when killed by a signal
        exit_code: Option<i32>,
        /// Bounded tail of the command output
        tail: String,
    },

    /// The requested backup archive does not exist.
    #[error("Backup archive not found: {0}")]
    ArchiveNotFound(String),

    /// The restore target is not empty and overwrite was not requested.
    #[error("Restore target is not empty, overwrite required: {0}")]
    OverwriteRequired(String),

    /// Startup recovery could not determine the true process state.
    #[error("Process state unknown after restart: {0}")]
    ReconciliationUnknown(String),

    /// The operation was cancelled before it completed.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Credentials could not be encrypted or decrypted.
    #[error("Credential error: {0}")]
    Credentials(String),

    /// Error in serializing or deserializing persisted state.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Any other error not covered by the above categories.
    #[error("Other error: {0}")]
    Other(String),
}

impl Error {
    /// Whether the caller should simply retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Busy { .. } | Error::Timeout(_))
    }

    /// Whether this error is a precondition rejection that changed nothing.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::InvalidState { .. }
                | Error::Busy { .. }
                | Error::ServerNotFound(_)
                | Error::ArchiveNotFound(_)
                | Error::OverwriteRequired(_)
        )
    }
}

fn exit_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "none".to_string(), |c| c.to_string())
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

/// Result type for gsm-runner operations.
///
/// This is a convenience type alias for `std::result::Result` with the `Error` type
/// from this module.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_and_timeout_are_retryable() {
        let busy = Error::Busy {
            instance_id: "palworld-main".to_string(),
            holder: "update".to_string(),
        };
        assert!(busy.is_retryable());
        assert!(Error::Timeout("start".to_string()).is_retryable());
        assert!(!Error::Io("disk".to_string()).is_retryable());
    }

    #[test]
    fn update_failed_message_includes_code() {
        let err = Error::UpdateFailed {
            exit_code: Some(8),
            tail: "Disk write failure".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Update failed (exit code 8): Disk write failure"
        );
    }
}
