//! Error taxonomy for provisioning, readiness and remote execution.

use thiserror::Error;

use crate::node::NodeState;

/// Errors that can occur while provisioning or operating on nodes.
#[derive(Error, Debug)]
pub enum FleetError {
    /// Missing or invalid configuration (negative count, empty project, ...).
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// The backend rejected or failed a creation request. Terminal for the node.
    #[error("Failed to create {node}: {reason}")]
    Create { node: String, reason: String },

    /// Status or endpoint polling exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Some, but not all, of the requested nodes were created.
    #[error("{failed}/{total} nodes were not created")]
    PartialProvisioning { failed: usize, total: usize },

    /// None of the requested nodes were created.
    #[error("Failed to create any of the {total} requested nodes")]
    TotalFailure { total: usize },

    /// Remote-shell credentials were rejected.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// The remote process exited with a nonzero status.
    #[error("Remote command `{command}` exited with status {status}")]
    RemoteCommand { command: String, status: i32 },

    /// More than one candidate matched where exactly one was required.
    #[error("Ambiguous target: {0}")]
    AmbiguousTarget(String),

    /// The backend refuses the operation (e.g. deleting a shared namespace).
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Connection-level remote-shell failure (refused, unreachable, reset).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The caller's cancellation signal fired.
    #[error("Operation cancelled")]
    Cancelled,

    /// A node attempted an illegal lifecycle transition.
    #[error("Invalid node state transition: {from} -> {to}")]
    InvalidState { from: NodeState, to: NodeState },

    /// Cloud API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Kubernetes API error.
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Certificate generation or TLS configuration failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Local I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization error.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A fan-out task panicked or was aborted.
    #[error("Task failed: {0}")]
    Task(String),
}

impl FleetError {
    /// Build a [`FleetError::Create`] for the given node.
    pub fn create(node: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Create {
            node: node.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether retrying the same operation could succeed.
    ///
    /// Authentication failures and nonzero remote exits are terminal;
    /// transport and local I/O failures are transient.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Io(_))
    }
}

impl From<rcgen::Error> for FleetError {
    fn from(err: rcgen::Error) -> Self {
        Self::Tls(err.to_string())
    }
}

impl From<rustls::Error> for FleetError {
    fn from(err: rustls::Error) -> Self {
        Self::Tls(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = FleetError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_message_carries_counts() {
        let err = FleetError::PartialProvisioning {
            failed: 1,
            total: 3,
        };
        assert_eq!(err.to_string(), "1/3 nodes were not created");
    }

    #[test]
    fn test_transient_classification() {
        assert!(FleetError::Transport("connection refused".into()).is_transient());
        assert!(!FleetError::Authentication("denied".into()).is_transient());
        assert!(!FleetError::RemoteCommand {
            command: "cat x".into(),
            status: 1
        }
        .is_transient());
        assert!(!FleetError::Cancelled.is_transient());
    }
}
