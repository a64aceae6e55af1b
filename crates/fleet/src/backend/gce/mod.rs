//! Compute Engine instance adapter.
//!
//! Each node is one instance booted from a container-optimized image whose
//! metadata declares the node container. Readiness is two fixed-interval
//! polls: the insert operation until it is running, then the instance until
//! it reports an external address.

pub mod client;
pub mod manifest;
pub mod models;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::client::{ComputeApi, GceClient};
use self::manifest::{EnvVar, NodeManifest, CONTAINER_DECLARATION_KEY};
use self::models::{
    AccessConfigDefinition, AttachedDiskDefinition, InitializeParams, InsertInstanceRequest,
    Metadata, MetadataItem, NetworkInterfaceDefinition, ServiceAccount, Tags, OWNER_LABEL,
};
use super::Backend;
use crate::authority::AuthorityDistribution;
use crate::config::FleetConfig;
use crate::error::{FleetError, Result};
use crate::node::{BackendKind, Endpoint, Node, NodeState};
use crate::readiness::{poll_fixed, ReadinessConfig};

const SERVICE_ACCOUNT_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/devstorage.read_only",
    "https://www.googleapis.com/auth/logging.write",
    "https://www.googleapis.com/auth/monitoring.write",
    "https://www.googleapis.com/auth/servicecontrol",
    "https://www.googleapis.com/auth/service.management.readonly",
    "https://www.googleapis.com/auth/trace.append",
];

/// Compute Engine backend.
pub struct GceBackend {
    api: Arc<dyn ComputeApi>,
    project: String,
    zone: String,
    owner: String,
    image: String,
    machine_type: String,
    source_image: String,
    port: u16,
    authority_dir: String,
    readiness: ReadinessConfig,
    project_number: OnceCell<String>,
}

impl GceBackend {
    /// Build the adapter on an explicit API client.
    ///
    /// # Errors
    /// Returns [`FleetError::Configuration`] if the project, zone, image or
    /// authority directory is missing.
    pub fn new(config: &FleetConfig, api: Arc<dyn ComputeApi>) -> Result<Self> {
        let required = [
            ("gce.project", config.gce.project.as_str()),
            ("gce.zone", config.gce.zone.as_str()),
            ("image", config.image.as_str()),
        ];
        if let Some((field, _)) = required.iter().find(|(_, v)| v.is_empty()) {
            return Err(FleetError::Configuration(format!("{field} is required")));
        }
        let authority_dir = config.authority_dir.to_string_lossy().into_owned();
        if authority_dir.is_empty() {
            return Err(FleetError::Configuration("authority_dir is required".into()));
        }

        Ok(Self {
            api,
            project: config.gce.project.clone(),
            zone: config.gce.zone.clone(),
            owner: config.owner.clone(),
            image: config.image.clone(),
            machine_type: config.gce.machine_type.clone(),
            source_image: format!(
                "projects/{}/global/images/family/{}",
                config.gce.image_project, config.gce.image_family
            ),
            port: config.port,
            authority_dir,
            readiness: config.readiness.clone(),
            project_number: OnceCell::new(),
        })
    }

    /// Build the adapter with a REST client using the configured token.
    ///
    /// # Errors
    /// Returns an error if the configuration is incomplete or the HTTP client
    /// cannot be built.
    pub fn from_config(config: &FleetConfig) -> Result<Self> {
        let api = GceClient::new(config.gce.access_token.clone())?;
        Self::new(config, Arc::new(api))
    }

    async fn project_number(&self) -> Result<&str> {
        self.project_number
            .get_or_try_init(|| self.api.project_number(&self.project))
            .await
            .map(String::as_str)
    }

    async fn insert_request(&self, name: &str) -> Result<InsertInstanceRequest> {
        let declaration = NodeManifest {
            image: &self.image,
            kind: BackendKind::ComputeInstance,
            port: self.port,
            authority_dir: &self.authority_dir,
            extra_env: vec![
                EnvVar::new("PROJECT", &self.project),
                EnvVar::new("ZONE", &self.zone),
            ],
        }
        .build()
        .to_yaml()?;

        let project_number = self.project_number().await?;

        Ok(InsertInstanceRequest {
            name: name.to_string(),
            machine_type: format!("zones/{}/machineTypes/{}", self.zone, self.machine_type),
            disks: vec![AttachedDiskDefinition {
                boot: true,
                auto_delete: true,
                initialize_params: InitializeParams {
                    source_image: self.source_image.clone(),
                },
            }],
            network_interfaces: vec![NetworkInterfaceDefinition {
                network: "global/networks/default".to_string(),
                access_configs: vec![AccessConfigDefinition {
                    access_type: "ONE_TO_ONE_NAT".to_string(),
                    name: "External NAT".to_string(),
                }],
            }],
            metadata: Metadata {
                items: vec![
                    MetadataItem {
                        key: CONTAINER_DECLARATION_KEY.to_string(),
                        value: declaration,
                    },
                    MetadataItem {
                        key: "google-logging-enabled".to_string(),
                        value: "true".to_string(),
                    },
                ],
            },
            tags: Tags {
                items: vec![
                    self.owner.clone(),
                    "http-server".to_string(),
                    "https-server".to_string(),
                ],
            },
            labels: HashMap::from([(OWNER_LABEL.to_string(), self.owner.clone())]),
            service_accounts: vec![ServiceAccount {
                email: format!("{project_number}-compute@developer.gserviceaccount.com"),
                scopes: SERVICE_ACCOUNT_SCOPES.iter().map(ToString::to_string).collect(),
            }],
        })
    }

    /// Poll `operation` until it is running or done.
    async fn wait_operation(&self, name: &str, operation: &str, cancel: &CancellationToken) -> Result<()> {
        poll_fixed(
            &format!("operation {operation} for {name}"),
            self.readiness.poll_interval,
            self.readiness.operation_timeout,
            cancel,
            move || async move {
                let op = self.api.get_operation(&self.project, &self.zone, operation).await?;
                if let Some(message) = op.error_message() {
                    return Err(FleetError::create(name, message));
                }
                debug!(node = %name, status = %op.status, "Operation status");
                Ok(matches!(op.status.as_str(), "RUNNING" | "DONE").then_some(()))
            },
        )
        .await
    }

    /// Poll the instance until its first interface has an external address.
    async fn wait_address(&self, name: &str, cancel: &CancellationToken) -> Result<String> {
        poll_fixed(
            &format!("external address for {name}"),
            self.readiness.poll_interval,
            self.readiness.address_timeout,
            cancel,
            move || async move {
                let instance = self.api.get_instance(&self.project, &self.zone, name).await?;
                match instance.network_interfaces.len() {
                    0 => return Err(FleetError::create(name, "instance has no network interfaces")),
                    1 => {}
                    n => warn!(node = %name, interfaces = n, "Multiple network interfaces, using the first"),
                }
                Ok(instance.external_ip().map(ToString::to_string))
            },
        )
        .await
    }
}

/// Record a readiness timeout on the node before handing the error back.
fn note_timeout(node: &mut Node, err: FleetError) -> FleetError {
    if matches!(err, FleetError::Timeout(_)) {
        if let Err(e) = node.transition(NodeState::TimedOut) {
            debug!(node = %node.name(), "Cannot mark node timed out: {e}");
        }
        warn!(node = %node.name(), state = %node.state(), "Readiness deadline elapsed");
    }
    err
}

#[async_trait]
impl Backend for GceBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::ComputeInstance
    }

    fn owner(&self) -> &str {
        &self.owner
    }

    fn authority_distribution(&self) -> AuthorityDistribution {
        AuthorityDistribution::Copy
    }

    async fn create(&self, name: &str, cancel: &CancellationToken) -> Result<Node> {
        let mut node = Node::requested(name, BackendKind::ComputeInstance, &self.owner);
        let request = self.insert_request(name).await?;

        info!(node = %name, zone = %self.zone, machine_type = %self.machine_type, "Creating instance");
        let op = self
            .api
            .insert_instance(&self.project, &self.zone, &request)
            .await
            .map_err(|e| FleetError::create(name, e))?;
        if let Some(message) = op.error_message() {
            return Err(FleetError::create(name, message));
        }
        node.transition(NodeState::BackendAccepted)?;

        self.wait_operation(name, &op.name, cancel)
            .await
            .map_err(|e| note_timeout(&mut node, e))?;
        node.transition(NodeState::Ready)?;

        let ip = self
            .wait_address(name, cancel)
            .await
            .map_err(|e| note_timeout(&mut node, e))?;
        node.assign_endpoint(Endpoint::new(ip, self.port))?;

        info!(node = %name, endpoint = ?node.endpoint(), "Instance ready");
        Ok(node)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        info!(node = %name, "Deleting instance");
        let op = match self.api.delete_instance(&self.project, &self.zone, name).await {
            Ok(op) => op,
            Err(FleetError::Api { status: 404, .. }) => {
                debug!(node = %name, "Instance already gone");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if let Some(message) = op.error_message() {
            return Err(FleetError::Api {
                status: 500,
                message,
            });
        }
        self.wait_operation(name, &op.name, &CancellationToken::new()).await
    }

    async fn list(&self, owner: &str) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();
        let mut page_token = None;
        loop {
            let page = self
                .api
                .list_instances(&self.project, &self.zone, page_token.take())
                .await?;
            nodes.extend(page.items.iter().filter(|i| i.is_owned_by(owner)).map(|i| {
                Node::observed(
                    &i.name,
                    BackendKind::ComputeInstance,
                    owner,
                    i.external_ip().map(|ip| Endpoint::new(ip, self.port)),
                )
            }));
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        debug!(owner, count = nodes.len(), "Listed instances");
        Ok(nodes)
    }
}

impl std::fmt::Debug for GceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GceBackend")
            .field("project", &self.project)
            .field("zone", &self.zone)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mockall::predicate::eq;

    use super::client::MockComputeApi;
    use super::models::{
        AccessConfig, GceInstance, InstanceListResponse, NetworkInterface, Operation,
    };
    use super::*;

    fn config() -> FleetConfig {
        let mut config = FleetConfig {
            image: "gcr.io/p/fleet:v1".to_string(),
            ..FleetConfig::default()
        };
        config.gce.project = "p".to_string();
        config.gce.zone = "us-central1-a".to_string();
        config
    }

    fn operation(status: &str) -> Operation {
        Operation {
            name: "op-1".to_string(),
            status: status.to_string(),
            error: None,
        }
    }

    fn instance(name: &str, ip: Option<&str>) -> GceInstance {
        GceInstance {
            name: name.to_string(),
            status: "RUNNING".to_string(),
            network_interfaces: vec![NetworkInterface {
                network_ip: Some("10.128.0.2".to_string()),
                access_configs: vec![AccessConfig {
                    access_type: Some("ONE_TO_ONE_NAT".to_string()),
                    nat_ip: ip.map(ToString::to_string),
                }],
            }],
            tags: Some(Tags {
                items: vec!["fleet".to_string()],
            }),
            ..GceInstance::default()
        }
    }

    fn api_with_project() -> MockComputeApi {
        let mut api = MockComputeApi::new();
        api.expect_project_number()
            .with(eq("p"))
            .returning(|_| Ok("1234".to_string()));
        api
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_reaches_endpoint() {
        let mut api = api_with_project();
        api.expect_insert_instance()
            .withf(|_, _, req| {
                req.name == "fleet-00"
                    && req.tags.items.contains(&"https-server".to_string())
                    && req.service_accounts[0].email == "1234-compute@developer.gserviceaccount.com"
                    && req.metadata.items[0].key == CONTAINER_DECLARATION_KEY
            })
            .returning(|_, _, _| Ok(operation("PENDING")));
        let mut polls = 0;
        api.expect_get_operation().returning(move |_, _, _| {
            polls += 1;
            Ok(operation(if polls < 3 { "PENDING" } else { "RUNNING" }))
        });
        let mut lookups = 0;
        api.expect_get_instance().returning(move |_, _, name| {
            lookups += 1;
            Ok(instance(name, (lookups > 1).then_some("34.1.2.3")))
        });

        let backend = GceBackend::new(&config(), Arc::new(api)).unwrap();
        let node = backend
            .create("fleet-00", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(node.state(), NodeState::EndpointAssigned);
        assert_eq!(node.endpoint(), Some(&Endpoint::new("34.1.2.3", 443)));
        assert_eq!(node.owner(), "fleet");
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_interfaces_is_permanent() {
        let mut api = api_with_project();
        api.expect_insert_instance()
            .returning(|_, _, _| Ok(operation("RUNNING")));
        api.expect_get_operation()
            .returning(|_, _, _| Ok(operation("RUNNING")));
        api.expect_get_instance().times(1).returning(|_, _, name| {
            Ok(GceInstance {
                name: name.to_string(),
                ..GceInstance::default()
            })
        });

        let backend = GceBackend::new(&config(), Arc::new(api)).unwrap();
        let err = backend
            .create("fleet-00", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Create { .. }), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_never_running_times_out() {
        let mut api = api_with_project();
        api.expect_insert_instance()
            .returning(|_, _, _| Ok(operation("PENDING")));
        api.expect_get_operation()
            .returning(|_, _, _| Ok(operation("PENDING")));

        let backend = GceBackend::new(&config(), Arc::new(api)).unwrap();
        let start = tokio::time::Instant::now();
        let err = backend
            .create("fleet-00", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, FleetError::Timeout(_)), "{err}");
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_duplicate_name_is_create_error() {
        let mut api = api_with_project();
        api.expect_insert_instance().returning(|_, _, _| {
            Err(FleetError::Api {
                status: 409,
                message: "already exists".to_string(),
            })
        });

        let backend = GceBackend::new(&config(), Arc::new(api)).unwrap();
        let err = backend
            .create("fleet-00", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Create { ref node, .. } if node == "fleet-00"));
    }

    #[tokio::test]
    async fn test_list_pages_and_filters_owner() {
        let mut api = MockComputeApi::new();
        api.expect_list_instances()
            .with(eq("p"), eq("us-central1-a"), eq(None::<String>))
            .returning(|_, _, _| {
                Ok(InstanceListResponse {
                    items: vec![instance("fleet-00", Some("34.1.2.3")), GceInstance {
                        name: "unrelated".to_string(),
                        ..GceInstance::default()
                    }],
                    next_page_token: Some("next".to_string()),
                })
            });
        api.expect_list_instances()
            .with(eq("p"), eq("us-central1-a"), eq(Some("next".to_string())))
            .returning(|_, _, _| {
                Ok(InstanceListResponse {
                    items: vec![instance("fleet-01", None)],
                    next_page_token: None,
                })
            });

        let backend = GceBackend::new(&config(), Arc::new(api)).unwrap();
        let nodes = backend.list("fleet").await.unwrap();

        let names: Vec<&str> = nodes.iter().map(Node::name).collect();
        assert_eq!(names, vec!["fleet-00", "fleet-01"]);
        assert_eq!(nodes[0].endpoint().unwrap().host, "34.1.2.3");
        assert!(nodes[1].endpoint().is_none());
    }

    #[tokio::test]
    async fn test_delete_missing_instance_is_ok() {
        let mut api = MockComputeApi::new();
        api.expect_delete_instance().returning(|_, _, _| {
            Err(FleetError::Api {
                status: 404,
                message: "not found".to_string(),
            })
        });

        let backend = GceBackend::new(&config(), Arc::new(api)).unwrap();
        backend.delete("fleet-00").await.unwrap();
    }

    #[test]
    fn test_missing_project_rejected() {
        let mut config = config();
        config.gce.project.clear();
        let err = GceBackend::new(&config, Arc::new(MockComputeApi::new())).unwrap_err();
        assert!(matches!(err, FleetError::Configuration(_)));
    }
}
