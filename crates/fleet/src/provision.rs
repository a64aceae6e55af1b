//! Provisioning orchestrator.
//!
//! `start` creates N nodes concurrently, waits for all of them, and
//! classifies the outcome. Failed slots are neither retried nor rolled back:
//! nodes that were created stay up until the caller tears them down.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::authority::{Authority, AuthorityDistribution};
use crate::backend::{node_name, Backend};
use crate::error::{FleetError, Result};
use crate::fanout::join_all;
use crate::node::Node;
use crate::remote::RemoteExecutor;

/// A request for `count` nodes.
#[derive(Debug, Clone)]
pub struct ProvisioningRequest {
    /// Desired node count. Negative values are rejected.
    pub count: i64,
    /// Node name prefix.
    pub name_prefix: String,
}

impl ProvisioningRequest {
    #[must_use]
    pub fn new(count: i64, name_prefix: impl Into<String>) -> Self {
        Self {
            count,
            name_prefix: name_prefix.into(),
        }
    }
}

/// Aggregate outcome of a start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningStatus {
    FullSuccess,
    PartialSuccess { succeeded: usize, requested: usize },
    TotalFailure,
}

/// Nodes created by a start, in request order, plus the failure count.
#[derive(Debug)]
pub struct ProvisioningResult {
    pub nodes: Vec<Node>,
    pub failures: usize,
    pub requested: usize,
    pub status: ProvisioningStatus,
}

impl ProvisioningResult {
    fn empty() -> Self {
        Self {
            nodes: Vec::new(),
            failures: 0,
            requested: 0,
            status: ProvisioningStatus::FullSuccess,
        }
    }

    /// Classify per-node outcomes.
    #[must_use]
    pub fn aggregate(outcomes: Vec<Result<Node>>) -> Self {
        let requested = outcomes.len();
        let nodes: Vec<Node> = outcomes.into_iter().filter_map(Result::ok).collect();
        let failures = requested - nodes.len();
        let status = if failures == 0 {
            ProvisioningStatus::FullSuccess
        } else if failures == requested {
            ProvisioningStatus::TotalFailure
        } else {
            ProvisioningStatus::PartialSuccess {
                succeeded: nodes.len(),
                requested,
            }
        };
        Self {
            nodes,
            failures,
            requested,
            status,
        }
    }

    /// The summary error of a partial success.
    #[must_use]
    pub fn partial_error(&self) -> Option<FleetError> {
        matches!(self.status, ProvisioningStatus::PartialSuccess { .. }).then_some(
            FleetError::PartialProvisioning {
                failed: self.failures,
                total: self.requested,
            },
        )
    }
}

/// Drives a backend through node creation and authority distribution.
#[derive(Clone)]
pub struct Provisioner {
    backend: Arc<dyn Backend>,
    authority: Arc<Authority>,
    executor: Option<RemoteExecutor>,
    authority_dir: String,
}

impl Provisioner {
    /// `executor` is required for backends that distribute the authority by
    /// copy.
    #[must_use]
    pub fn new(
        backend: Arc<dyn Backend>,
        authority: Arc<Authority>,
        executor: Option<RemoteExecutor>,
        authority_dir: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            authority,
            executor,
            authority_dir: authority_dir.into(),
        }
    }

    /// Create `request.count` nodes concurrently.
    ///
    /// On partial success the created nodes are returned and
    /// [`ProvisioningResult::partial_error`] carries the `failed/total`
    /// summary.
    ///
    /// # Errors
    /// Returns [`FleetError::Configuration`] for a negative count (no backend
    /// call is made), the backend's preparation error, or
    /// [`FleetError::TotalFailure`] when no node was created.
    pub async fn start(
        &self,
        request: &ProvisioningRequest,
        cancel: &CancellationToken,
    ) -> Result<ProvisioningResult> {
        let count = usize::try_from(request.count).map_err(|_| {
            FleetError::Configuration(format!("negative node count {}", request.count))
        })?;
        if count == 0 {
            return Ok(ProvisioningResult::empty());
        }

        self.backend.prepare(count, &self.authority).await?;

        info!(count, backend = %self.backend.kind(), "Starting nodes");
        let names: Vec<String> = (0..count)
            .map(|i| node_name(&request.name_prefix, i))
            .collect();
        let outcomes = join_all("create", names.clone(), |name| {
            let backend = self.backend.clone();
            let cancel = cancel.clone();
            async move { backend.create(&name, &cancel).await }
        })
        .await;

        for (name, outcome) in names.iter().zip(&outcomes) {
            if let Err(e) = outcome {
                warn!(node = %name, "Node creation failed: {e}");
            }
        }

        let result = ProvisioningResult::aggregate(outcomes);
        if result.status == ProvisioningStatus::TotalFailure {
            error!(count, "No node could be created");
            return Err(FleetError::TotalFailure { total: count });
        }

        if self.backend.authority_distribution() == AuthorityDistribution::Copy {
            match &self.executor {
                Some(executor) => self.distribute(executor, &result.nodes, cancel).await,
                None => warn!("No remote executor, authority not distributed"),
            }
        }

        match result.partial_error() {
            Some(e) => warn!("{e}"),
            None => info!(count, "All nodes started"),
        }
        Ok(result)
    }

    /// Copy the authority bundle to every node with an endpoint.
    ///
    /// Failures are logged only: a node may still finish bootstrapping on
    /// its own.
    async fn distribute(&self, executor: &RemoteExecutor, nodes: &[Node], cancel: &CancellationToken) {
        let targets: Vec<(String, String)> = nodes
            .iter()
            .filter_map(|n| n.endpoint().map(|ep| (n.name().to_string(), ep.host.clone())))
            .collect();
        let bundle = Arc::new(self.authority.bundle());
        let file = self.authority.file_name();

        let outcomes = join_all("distribute", targets.clone(), |(name, host)| {
            let executor = executor.clone();
            let bundle = bundle.clone();
            let dir = self.authority_dir.clone();
            let file = file.clone();
            let cancel = cancel.clone();
            async move {
                executor.copy(&host, &dir, &file, &bundle, &cancel).await?;
                info!(node = %name, "Authority copied");
                Ok(())
            }
        })
        .await;

        for ((name, _), outcome) in targets.iter().zip(outcomes) {
            if let Err(e) = outcome {
                error!(node = %name, "Failed to copy authority: {e}");
            }
        }
    }
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("backend", &self.backend.kind())
            .field("authority", &self.authority.path())
            .finish_non_exhaustive()
    }
}
