//! Backend selection and the `Fleet` facade used by the binary.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::authority::Authority;
use crate::backend::gce::GceBackend;
use crate::backend::k8s::K8sBackend;
use crate::backend::Backend;
use crate::config::{FleetConfig, SystemKind};
use crate::error::{FleetError, Result};
use crate::node::Node;
use crate::provision::{ProvisioningRequest, ProvisioningResult, Provisioner};
use crate::remote::{RemoteExecutor, RemoteStream, Ssh2Shell};
use crate::tail::LogTailer;
use crate::teardown::{teardown, TeardownReport};

/// Connection keepalive parameters for the host framework's node links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    pub period: Duration,
    pub timeout: Duration,
    pub rpc_timeout: Duration,
}

pub const KEEPALIVE: Keepalive = Keepalive {
    period: Duration::from_secs(60),
    timeout: Duration::from_secs(10 * 60),
    rpc_timeout: Duration::from_secs(2 * 60),
};

/// Build the backend named by `config.system`.
///
/// # Errors
/// Returns an error if the backend's required settings are missing or its
/// API client cannot be created.
pub async fn system(config: &FleetConfig) -> Result<Arc<dyn Backend>> {
    let backend: Arc<dyn Backend> = match config.system {
        SystemKind::Gce => Arc::new(GceBackend::from_config(config)?),
        SystemKind::K8s => Arc::new(K8sBackend::from_config(config).await?),
    };
    info!(system = %backend.kind(), owner = %backend.owner(), "Backend selected");
    Ok(backend)
}

/// A configured backend together with the authority and remote executor.
pub struct Fleet {
    config: FleetConfig,
    backend: Arc<dyn Backend>,
    authority: Arc<Authority>,
    executor: Option<RemoteExecutor>,
    provisioner: Provisioner,
}

impl Fleet {
    /// Validate `config`, connect its backend and load (or create) the
    /// authority.
    ///
    /// The remote shell is only set up for the compute backend; cluster
    /// nodes are reached through the cluster API.
    ///
    /// # Errors
    /// Returns [`FleetError::Configuration`] for incomplete settings, or the
    /// backend/authority initialization error.
    pub async fn connect(config: FleetConfig) -> Result<Self> {
        config.validate()?;
        let backend = system(&config).await?;
        let authority = Arc::new(Authority::load_or_create(&config.authority_path())?);
        let executor = match config.system {
            SystemKind::Gce => Some(RemoteExecutor::new(
                Arc::new(Ssh2Shell::from_config(&config.ssh)?),
                config.retry.policy(),
            )),
            SystemKind::K8s => None,
        };
        Ok(Self::with_parts(config, backend, authority, executor))
    }

    /// Assemble a fleet from already-built parts.
    #[must_use]
    pub fn with_parts(
        config: FleetConfig,
        backend: Arc<dyn Backend>,
        authority: Arc<Authority>,
        executor: Option<RemoteExecutor>,
    ) -> Self {
        let provisioner = Provisioner::new(
            backend.clone(),
            authority.clone(),
            executor.clone(),
            config.authority_dir.to_string_lossy(),
        );
        Self {
            config,
            backend,
            authority,
            executor,
            provisioner,
        }
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    #[must_use]
    pub fn authority(&self) -> &Arc<Authority> {
        &self.authority
    }

    /// Start `count` nodes named after the configured prefix.
    ///
    /// # Errors
    /// See [`Provisioner::start`].
    pub async fn start(&self, count: i64, cancel: &CancellationToken) -> Result<ProvisioningResult> {
        let request = ProvisioningRequest::new(count, &self.config.name_prefix);
        self.provisioner.start(&request, cancel).await
    }

    /// Nodes owned by the configured owner.
    ///
    /// # Errors
    /// Returns the backend's listing error.
    pub async fn list(&self) -> Result<Vec<Node>> {
        self.backend.list(&self.config.owner).await
    }

    /// Look up one owned node by name.
    ///
    /// # Errors
    /// Returns [`FleetError::Configuration`] if no such node exists.
    pub async fn find(&self, name: &str) -> Result<Node> {
        self.list()
            .await?
            .into_iter()
            .find(|n| n.name() == name)
            .ok_or_else(|| FleetError::Configuration(format!("no node named {name}")))
    }

    fn executor(&self, operation: &str) -> Result<&RemoteExecutor> {
        self.executor.as_ref().ok_or_else(|| {
            FleetError::UnsupportedOperation(format!(
                "{operation} is not available on the {} backend",
                self.backend.kind()
            ))
        })
    }

    /// Read `path` on `node` through the remote shell.
    ///
    /// # Errors
    /// Returns [`FleetError::UnsupportedOperation`] without a remote shell,
    /// or the remote executor's error.
    pub async fn read(&self, node: &Node, path: &str, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let executor = self.executor("read")?;
        let host = &node.require_endpoint()?.host;
        debug!(node = %node.name(), path, "Reading remote file");
        executor.read(host, path, cancel).await
    }

    /// Follow the node container's logs.
    ///
    /// The backend's own log API is preferred; otherwise the container is
    /// located and followed over the remote shell.
    ///
    /// # Errors
    /// Returns [`FleetError::AmbiguousTarget`] if the node's workload is not
    /// unique, or the underlying backend/executor error.
    pub async fn tail(&self, node: &Node, cancel: &CancellationToken) -> Result<RemoteStream> {
        match self.backend.native_logs(node, cancel).await {
            Err(FleetError::UnsupportedOperation(reason)) => {
                debug!(node = %node.name(), "{reason}, tailing over the remote shell");
                let tailer = LogTailer::new(self.executor("tail")?.clone(), &self.config.tail);
                tailer.tail(&node.require_endpoint()?.host, cancel).await
            }
            other => other,
        }
    }

    /// Delete every owned node. Per-node failures are logged.
    ///
    /// # Errors
    /// Returns the backend's listing error.
    pub async fn shutdown(&self) -> Result<TeardownReport> {
        let report = teardown(&self.backend, &self.config.owner).await?;
        if !report.failed.is_empty() {
            warn!(failed = ?report.failed, "Some nodes were not deleted");
        }
        Ok(report)
    }

    /// Delete the backend's whole resource group.
    ///
    /// # Errors
    /// Returns [`FleetError::UnsupportedOperation`] for backends without a
    /// group or for protected namespaces.
    pub async fn delete_group(&self) -> Result<()> {
        self.backend.delete_group().await
    }
}

impl std::fmt::Debug for Fleet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fleet")
            .field("system", &self.config.system)
            .field("owner", &self.config.owner)
            .field("authority", &self.authority.path())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use mockall::predicate::eq;

    use super::*;
    use crate::backend::MockBackend;
    use crate::node::{BackendKind, Endpoint};
    use crate::remote::retry::RetryPolicy;
    use crate::remote::ssh::MockRemoteShell;

    fn authority() -> (tempfile::TempDir, Arc<Authority>) {
        let dir = tempfile::tempdir().unwrap();
        let authority = Authority::load_or_create(&dir.path().join("fleet.pem")).unwrap();
        (dir, Arc::new(authority))
    }

    fn compute_node() -> Node {
        Node::observed(
            "fleet-00",
            BackendKind::ComputeInstance,
            "fleet",
            Some(Endpoint::new("203.0.113.7", 443)),
        )
    }

    #[test]
    fn test_keepalive_values() {
        assert_eq!(KEEPALIVE.period, Duration::from_secs(60));
        assert_eq!(KEEPALIVE.timeout, Duration::from_secs(600));
        assert_eq!(KEEPALIVE.rpc_timeout, Duration::from_secs(120));
    }

    #[tokio::test]
    async fn test_read_without_shell_is_unsupported() {
        let (_dir, authority) = authority();
        let mut backend = MockBackend::new();
        backend.expect_kind().return_const(BackendKind::Cluster);

        let fleet = Fleet::with_parts(FleetConfig::default(), Arc::new(backend), authority, None);
        let err = fleet
            .read(&compute_node(), "/var/log/boot.log", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::UnsupportedOperation(_)));
    }

    #[tokio::test]
    async fn test_read_cats_file_on_endpoint_host() {
        let (_dir, authority) = authority();
        let mut shell = MockRemoteShell::new();
        shell
            .expect_exec()
            .with(eq("203.0.113.7"), eq("cat /etc/hostname"), mockall::predicate::always())
            .returning(|_, _, sink| {
                sink.try_send(Ok(b"fleet-00\n".to_vec())).unwrap();
                Ok(())
            });
        let executor = RemoteExecutor::new(Arc::new(shell), RetryPolicy::default());

        let fleet = Fleet::with_parts(
            FleetConfig::default(),
            Arc::new(MockBackend::new()),
            authority,
            Some(executor),
        );
        let content = fleet
            .read(&compute_node(), "/etc/hostname", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(content, b"fleet-00\n");
    }

    #[tokio::test]
    async fn test_tail_prefers_native_logs() {
        let (_dir, authority) = authority();
        let mut backend = MockBackend::new();
        backend.expect_native_logs().times(1).returning(|_, _| {
            let (tx, stream) = RemoteStream::channel();
            tx.try_send(Ok(b"booted\n".to_vec())).unwrap();
            Ok(stream)
        });

        let fleet = Fleet::with_parts(FleetConfig::default(), Arc::new(backend), authority, None);
        let output = fleet
            .tail(&compute_node(), &CancellationToken::new())
            .await
            .unwrap()
            .read_to_string()
            .await
            .unwrap();
        assert_eq!(output, "booted\n");
    }

    #[tokio::test]
    async fn test_find_unknown_node() {
        let (_dir, authority) = authority();
        let mut backend = MockBackend::new();
        backend
            .expect_list()
            .with(eq("fleet"))
            .returning(|_| Ok(vec![compute_node()]));

        let fleet = Fleet::with_parts(FleetConfig::default(), Arc::new(backend), authority, None);
        assert_eq!(fleet.find("fleet-00").await.unwrap().name(), "fleet-00");
        assert!(matches!(
            fleet.find("fleet-09").await,
            Err(FleetError::Configuration(_))
        ));
    }
}
