//! Container-cluster adapter: one deployment and one service per node.
//!
//! With `NodePort` exposure the endpoint is known as soon as the service is
//! created. With `LoadBalancer` exposure the service's ingress is polled with
//! exponential backoff, then a fixed stabilization delay is applied before
//! the endpoint is handed out.

pub mod client;
pub mod resources;

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::client::{ClusterApi, KubeClusterApi};
use self::resources::{authority_secret, node_selector, owner_selector, NodeResources, NODE_LABEL};
use super::Backend;
use crate::authority::{Authority, AuthorityDistribution};
use crate::config::{Exposure, FleetConfig, NODE_CONTAINER_NAME};
use crate::error::{FleetError, Result};
use crate::node::{BackendKind, Endpoint, Node, NodeState};
use crate::readiness::{poll_backoff, sleep_or_cancel, ReadinessConfig};
use crate::remote::RemoteStream;

/// Namespaces that are never deleted wholesale.
pub const PROTECTED_NAMESPACES: &[&str] = &["default", "kube-system", "kube-public", "kube-node-lease"];

const LOAD_BALANCER_TIMEOUT: &str = "unable to provision load-balancer before timeout";

/// Kubernetes backend.
pub struct K8sBackend {
    api: Arc<dyn ClusterApi>,
    namespace: String,
    owner: String,
    image: String,
    port: u16,
    authority_dir: String,
    exposure: Exposure,
    node_host: String,
    max_nodes: usize,
    readiness: ReadinessConfig,
}

impl K8sBackend {
    /// Build the adapter on an explicit API client.
    ///
    /// # Errors
    /// Returns [`FleetError::Configuration`] if the image or namespace is
    /// missing.
    pub fn new(config: &FleetConfig, api: Arc<dyn ClusterApi>) -> Result<Self> {
        if config.image.is_empty() {
            return Err(FleetError::Configuration("image is required".into()));
        }
        if config.k8s.namespace.is_empty() {
            return Err(FleetError::Configuration("k8s.namespace is required".into()));
        }
        Ok(Self {
            api,
            namespace: config.k8s.namespace.clone(),
            owner: config.owner.clone(),
            image: config.image.clone(),
            port: config.port,
            authority_dir: config.authority_dir.to_string_lossy().into_owned(),
            exposure: config.k8s.exposure,
            node_host: config.k8s.node_host.clone(),
            max_nodes: config.k8s.max_nodes,
            readiness: config.readiness.clone(),
        })
    }

    /// Build the adapter with a kube client.
    ///
    /// # Errors
    /// Returns an error if the configuration is incomplete or the cluster
    /// client cannot be created.
    pub async fn from_config(config: &FleetConfig) -> Result<Self> {
        let api = KubeClusterApi::connect(config.k8s.kubeconfig.as_deref(), &config.k8s.namespace).await?;
        Self::new(config, Arc::new(api))
    }

    fn resources<'a>(&'a self, name: &'a str) -> NodeResources<'a> {
        NodeResources {
            name,
            owner: &self.owner,
            image: &self.image,
            port: self.port,
            authority_dir: &self.authority_dir,
        }
    }

    /// Endpoint of a `NodePort` service; available synchronously.
    fn node_port_endpoint(&self, name: &str, service: &Service) -> Result<Endpoint> {
        let node_port = service
            .spec
            .as_ref()
            .and_then(|s| s.ports.as_ref())
            .and_then(|ports| ports.first())
            .and_then(|p| p.node_port)
            .ok_or_else(|| FleetError::create(name, "service has no allocated node port"))?;
        let port = u16::try_from(node_port)
            .map_err(|_| FleetError::create(name, format!("invalid node port {node_port}")))?;
        Ok(Endpoint::new(self.node_host.clone(), port))
    }

    /// Poll the service until its load balancer reports an ingress.
    async fn load_balancer_endpoint(&self, name: &str, cancel: &CancellationToken) -> Result<Endpoint> {
        let host = poll_backoff(
            LOAD_BALANCER_TIMEOUT,
            self.readiness.lb_initial_backoff,
            self.readiness.lb_max_backoff,
            self.readiness.lb_timeout,
            cancel,
            move || async move {
                let service = self.api.get_service(name).await?;
                ingress_host(name, &service)
            },
        )
        .await?;

        info!(
            node = %name,
            host = %host,
            delay_secs = self.readiness.lb_stabilization.as_secs(),
            "Load balancer provisioned, waiting for it to stabilize"
        );
        sleep_or_cancel(self.readiness.lb_stabilization, cancel).await?;
        Ok(Endpoint::new(host, self.port))
    }

    fn observed(&self, owner: &str, service: &Service) -> Option<Node> {
        let name = service
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(NODE_LABEL))
            .or(service.metadata.name.as_ref())?;
        let endpoint = match self.exposure {
            Exposure::NodePort => self.node_port_endpoint(name, service).ok(),
            Exposure::LoadBalancer => ingress_host(name, service)
                .ok()
                .flatten()
                .map(|host| Endpoint::new(host, self.port)),
        };
        Some(Node::observed(name, BackendKind::Cluster, owner, endpoint))
    }
}

/// Host of the service's first load-balancer ingress, if any.
fn ingress_host(name: &str, service: &Service) -> Result<Option<String>> {
    let ingress = service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .filter(|i| !i.is_empty());
    let Some(ingress) = ingress else {
        return Ok(None);
    };
    if ingress.len() > 1 {
        warn!(node = %name, count = ingress.len(), "Multiple load-balancer ingresses, using the first");
    }
    let first = &ingress[0];
    first
        .ip
        .clone()
        .filter(|ip| !ip.is_empty())
        .or_else(|| first.hostname.clone().filter(|h| !h.is_empty()))
        .map(Some)
        .ok_or_else(|| FleetError::create(name, "load-balancer ingress has neither ip nor hostname"))
}

fn note_timeout(node: &mut Node, err: FleetError) -> FleetError {
    if matches!(err, FleetError::Timeout(_)) {
        if let Err(e) = node.transition(NodeState::TimedOut) {
            debug!(node = %node.name(), "Cannot mark node timed out: {e}");
        }
        warn!(node = %node.name(), "Load balancer never reported an ingress");
    }
    err
}

#[async_trait]
impl Backend for K8sBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cluster
    }

    fn owner(&self) -> &str {
        &self.owner
    }

    fn authority_distribution(&self) -> AuthorityDistribution {
        AuthorityDistribution::ClusterSecret
    }

    async fn prepare(&self, count: usize, authority: &Authority) -> Result<()> {
        if count > self.max_nodes {
            return Err(FleetError::Configuration(format!(
                "{count} nodes requested, at most {} are supported",
                self.max_nodes
            )));
        }
        self.api.ensure_namespace(&self.owner).await?;
        let secret = authority_secret(&self.owner, &authority.file_name(), authority.bundle());
        self.api.apply_secret(&secret).await?;
        info!(namespace = %self.namespace, "Authority secret applied");
        Ok(())
    }

    async fn create(&self, name: &str, cancel: &CancellationToken) -> Result<Node> {
        let mut node = Node::requested(name, BackendKind::Cluster, &self.owner);
        let resources = self.resources(name);

        info!(node = %name, namespace = %self.namespace, "Creating deployment");
        self.api
            .create_deployment(&resources.deployment())
            .await
            .map_err(|e| FleetError::create(name, e))?;
        let service = self
            .api
            .create_service(&resources.service(self.exposure))
            .await
            .map_err(|e| FleetError::create(name, e))?;
        node.transition(NodeState::BackendAccepted)?;

        let endpoint = match self.exposure {
            Exposure::NodePort => self.node_port_endpoint(name, &service)?,
            Exposure::LoadBalancer => self
                .load_balancer_endpoint(name, cancel)
                .await
                .map_err(|e| note_timeout(&mut node, e))?,
        };
        node.transition(NodeState::Ready)?;
        node.assign_endpoint(endpoint)?;

        info!(node = %name, endpoint = ?node.endpoint(), "Node ready");
        Ok(node)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        info!(node = %name, "Deleting service and deployment");
        self.api.delete_service(name).await?;
        self.api.delete_deployment(name).await
    }

    async fn list(&self, owner: &str) -> Result<Vec<Node>> {
        let services = self.api.list_services(&owner_selector(owner)).await?;
        Ok(services
            .iter()
            .filter_map(|s| self.observed(owner, s))
            .collect())
    }

    async fn delete_group(&self) -> Result<()> {
        if PROTECTED_NAMESPACES.contains(&self.namespace.as_str()) {
            return Err(FleetError::UnsupportedOperation(format!(
                "refusing to delete namespace {}",
                self.namespace
            )));
        }
        info!(namespace = %self.namespace, "Deleting namespace");
        self.api.delete_namespace().await
    }

    async fn native_logs(&self, node: &Node, _cancel: &CancellationToken) -> Result<RemoteStream> {
        let pods = self.api.list_pods(&node_selector(node.name())).await?;
        match pods.as_slice() {
            [] => Err(FleetError::Configuration(format!(
                "no pod found for node {}",
                node.name()
            ))),
            [pod] => {
                debug!(node = %node.name(), pod = %pod, "Following pod logs");
                self.api.follow_logs(pod, NODE_CONTAINER_NAME).await
            }
            many => Err(FleetError::AmbiguousTarget(format!(
                "{} pods match node {}",
                many.len(),
                node.name()
            ))),
        }
    }
}

impl std::fmt::Debug for K8sBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("K8sBackend")
            .field("namespace", &self.namespace)
            .field("owner", &self.owner)
            .field("exposure", &self.exposure)
            .finish_non_exhaustive()
    }
}
