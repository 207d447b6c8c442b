//! Request and response shapes exchanged with a front-end.
//!
//! The front-end decides whether the principal may run the operation; the
//! runner trusts that decision and records the principal and role as the
//! event actor.

use crate::error::Error;
use crate::server::{Actor, InstanceId, ServerStatus};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Operation a front-end can ask for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestedOperation {
    /// Start a stopped server
    Start,
    /// Stop a running server
    Stop,
    /// Stop and start under one lock
    Restart,
    /// Run the package fetch on a stopped server
    Update,
    /// Clear an error
    Reset,
    /// Archive the data directory
    Backup,
    /// Restore the data directory from an archive
    Restore {
        /// Archive file name inside the backup directory
        archive: String,
        /// Replace a non-empty data directory
        #[serde(default)]
        overwrite: bool,
    },
    /// Cancel the operation in flight
    Cancel,
    /// Report the current status
    Status,
}

impl RequestedOperation {
    /// Lowercase name for messages
    pub fn name(&self) -> &'static str {
        match self {
            RequestedOperation::Start => "start",
            RequestedOperation::Stop => "stop",
            RequestedOperation::Restart => "restart",
            RequestedOperation::Update => "update",
            RequestedOperation::Reset => "reset",
            RequestedOperation::Backup => "backup",
            RequestedOperation::Restore { .. } => "restore",
            RequestedOperation::Cancel => "cancel",
            RequestedOperation::Status => "status",
        }
    }
}

impl fmt::Display for RequestedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One request from a front-end
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRequest {
    /// Target instance
    pub instance_id: InstanceId,
    /// What to do
    pub operation: RequestedOperation,
    /// Who asked
    pub principal: String,
    /// The principal's role, already checked by the front-end
    pub role: String,
}

impl OperationRequest {
    /// Creates a request.
    pub fn new(
        instance_id: impl Into<InstanceId>,
        operation: RequestedOperation,
        principal: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            operation,
            principal: principal.into(),
            role: role.into(),
        }
    }

    /// Actor recorded on the resulting events
    pub fn actor(&self) -> Actor {
        Actor::User {
            principal: self.principal.clone(),
            role: self.role.clone(),
        }
    }
}

/// What a front-end renders for a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResponse {
    /// Target instance
    pub instance_id: InstanceId,
    /// Operation name
    pub operation: String,
    /// Status after the request, when the instance exists
    pub status_after: Option<ServerStatus>,
    /// One-line summary for the user
    pub human_message: String,
    /// Error text, when the request failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    /// Whether retrying later may succeed
    pub retryable: bool,
}

impl OperationResponse {
    /// Response for a request that succeeded.
    pub fn success(
        request: &OperationRequest,
        status_after: Option<ServerStatus>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: request.instance_id.clone(),
            operation: request.operation.name().to_string(),
            status_after,
            human_message: message.into(),
            error_detail: None,
            retryable: false,
        }
    }

    /// Response for a request that failed with `error`.
    pub fn failure(
        request: &OperationRequest,
        status_after: Option<ServerStatus>,
        error: &Error,
    ) -> Self {
        let human_message = match error {
            Error::InvalidState { status, .. } => format!(
                "Cannot {} '{}' while it is {}",
                request.operation, request.instance_id, status
            ),
            Error::Busy { holder, .. } => format!(
                "'{}' is busy with {}, try again later",
                request.instance_id, holder
            ),
            Error::ServerNotFound(_) => format!("Unknown server '{}'", request.instance_id),
            Error::Timeout(_) => format!(
                "{} of '{}' timed out, try again later",
                request.operation, request.instance_id
            ),
            _ => format!("{} of '{}' failed", request.operation, request.instance_id),
        };

        Self {
            instance_id: request.instance_id.clone(),
            operation: request.operation.name().to_string(),
            status_after,
            human_message,
            error_detail: Some(error.to_string()),
            retryable: error.is_retryable(),
        }
    }

    /// Whether the request succeeded
    pub fn is_success(&self) -> bool {
        self.error_detail.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restore_request_deserializes_with_default_overwrite() {
        let request: OperationRequest = serde_json::from_str(
            r#"{
                "instance_id": "valheim",
                "operation": { "kind": "restore", "archive": "valheim-20250101-000000.zip" },
                "principal": "alice",
                "role": "admin"
            }"#,
        )
        .unwrap();

        assert_eq!(
            request.operation,
            RequestedOperation::Restore {
                archive: "valheim-20250101-000000.zip".to_string(),
                overwrite: false,
            }
        );
        assert_eq!(
            request.actor(),
            Actor::User {
                principal: "alice".to_string(),
                role: "admin".to_string()
            }
        );
    }

    #[test]
    fn busy_failure_is_retryable() {
        let request = OperationRequest::new("ark", RequestedOperation::Start, "bob", "mod");
        let error = Error::Busy {
            instance_id: "ark".to_string(),
            holder: "update".to_string(),
        };
        let response = OperationResponse::failure(&request, Some(ServerStatus::Updating), &error);

        assert!(response.retryable);
        assert!(!response.is_success());
        assert_eq!(response.human_message, "'ark' is busy with update, try again later");
    }
}
