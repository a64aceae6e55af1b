//! Backend adapters.
//!
//! A [`Backend`] creates, deletes and lists nodes on one provider. The
//! provider is chosen by configuration value (see [`crate::driver::system`]),
//! never by inspecting the adapter at runtime.

pub mod gce;
pub mod k8s;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::authority::{Authority, AuthorityDistribution};
use crate::error::{FleetError, Result};
use crate::node::{BackendKind, Node};
use crate::remote::RemoteStream;

/// Per-provider node driver.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Backend: Send + Sync {
    /// Which provider this adapter drives.
    fn kind(&self) -> BackendKind;

    /// Ownership label applied to every node this adapter creates.
    fn owner(&self) -> &str;

    /// How the authority bundle reaches nodes.
    fn authority_distribution(&self) -> AuthorityDistribution;

    /// One-time setup before `count` nodes are created.
    async fn prepare(&self, _count: usize, _authority: &Authority) -> Result<()> {
        Ok(())
    }

    /// Create the node `name` and drive it to an assigned endpoint.
    ///
    /// Duplicate names are rejected by the provider with
    /// [`FleetError::Create`].
    async fn create(&self, name: &str, cancel: &CancellationToken) -> Result<Node>;

    /// Delete the node `name`.
    async fn delete(&self, name: &str) -> Result<()>;

    /// List nodes carrying the ownership label `owner`.
    async fn list(&self, owner: &str) -> Result<Vec<Node>>;

    /// Delete every resource in the backing group at once.
    async fn delete_group(&self) -> Result<()> {
        Err(FleetError::UnsupportedOperation(format!(
            "{} backend has no resource group",
            self.kind()
        )))
    }

    /// Follow the node's workload logs through the provider API.
    ///
    /// Adapters without native log access return
    /// [`FleetError::UnsupportedOperation`]; callers then fall back to the
    /// remote shell.
    async fn native_logs(&self, node: &Node, _cancel: &CancellationToken) -> Result<RemoteStream> {
        Err(FleetError::UnsupportedOperation(format!(
            "{} backend cannot stream logs for {}",
            self.kind(),
            node.name()
        )))
    }
}

/// Name of the node at `index`.
#[must_use]
pub fn node_name(prefix: &str, index: usize) -> String {
    format!("{prefix}-{index:02}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_name_is_zero_padded() {
        assert_eq!(node_name("fleet", 0), "fleet-00");
        assert_eq!(node_name("fleet", 7), "fleet-07");
        assert_eq!(node_name("fleet", 123), "fleet-123");
    }
}
