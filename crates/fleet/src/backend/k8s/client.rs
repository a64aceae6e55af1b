//! Kubernetes API access for the cluster adapter.

use std::path::Path;

use async_trait::async_trait;
use futures::{AsyncBufReadExt, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Pod, Secret, Service};
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{debug, info, warn};

use super::resources;
use crate::error::{FleetError, Result};
use crate::remote::RemoteStream;

/// Cluster operations used by the adapter, scoped to one namespace.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create the namespace, labelled with `owner`, if it does not exist.
    async fn ensure_namespace(&self, owner: &str) -> Result<()>;

    /// Create or replace a secret.
    async fn apply_secret(&self, secret: &Secret) -> Result<()>;

    async fn create_deployment(&self, deployment: &Deployment) -> Result<()>;

    /// Create a service and return it as stored (allocated ports included).
    async fn create_service(&self, service: &Service) -> Result<Service>;

    async fn get_service(&self, name: &str) -> Result<Service>;

    async fn list_services(&self, selector: &str) -> Result<Vec<Service>>;

    async fn delete_deployment(&self, name: &str) -> Result<()>;

    async fn delete_service(&self, name: &str) -> Result<()>;

    async fn delete_namespace(&self) -> Result<()>;

    /// Names of the pods matching `selector`.
    async fn list_pods(&self, selector: &str) -> Result<Vec<String>>;

    /// Follow a container's logs.
    async fn follow_logs(&self, pod: &str, container: &str) -> Result<RemoteStream>;
}

/// [`ClusterApi`] backed by a kube client.
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
    namespace: String,
}

impl KubeClusterApi {
    #[must_use]
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Connect using `kubeconfig`, or the default client configuration
    /// (in-cluster or `~/.kube/config`) when unset.
    ///
    /// # Errors
    /// Returns an error if the configuration cannot be loaded.
    pub async fn connect(kubeconfig: Option<&Path>, namespace: &str) -> Result<Self> {
        let client = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    FleetError::Configuration(format!("kubeconfig {}: {e}", path.display()))
                })?;
                let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| FleetError::Configuration(format!("kubeconfig: {e}")))?;
                Client::try_from(config)?
            }
            None => Client::try_default().await?,
        };
        Ok(Self::new(client, namespace))
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn ensure_namespace(&self, owner: &str) -> Result<()> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        match namespaces.get(&self.namespace).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                info!(namespace = %self.namespace, "Creating namespace");
                match namespaces
                    .create(&PostParams::default(), &resources::namespace(&self.namespace, owner))
                    .await
                {
                    Ok(_) => Ok(()),
                    Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<()> {
        let secrets: Api<Secret> = self.api();
        match secrets.create(&PostParams::default(), secret).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                let name = secret.metadata.name.clone().unwrap_or_default();
                debug!(secret = %name, "Secret exists, replacing");
                let mut replacement = secret.clone();
                replacement.metadata.resource_version =
                    secrets.get(&name).await?.metadata.resource_version;
                secrets
                    .replace(&name, &PostParams::default(), &replacement)
                    .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<()> {
        let deployments: Api<Deployment> = self.api();
        deployments.create(&PostParams::default(), deployment).await?;
        Ok(())
    }

    async fn create_service(&self, service: &Service) -> Result<Service> {
        let services: Api<Service> = self.api();
        Ok(services.create(&PostParams::default(), service).await?)
    }

    async fn get_service(&self, name: &str) -> Result<Service> {
        let services: Api<Service> = self.api();
        Ok(services.get(name).await?)
    }

    async fn list_services(&self, selector: &str) -> Result<Vec<Service>> {
        let services: Api<Service> = self.api();
        let list = services.list(&ListParams::default().labels(selector)).await?;
        Ok(list.items)
    }

    async fn delete_deployment(&self, name: &str) -> Result<()> {
        let deployments: Api<Deployment> = self.api();
        ignore_missing(deployments.delete(name, &DeleteParams::default()).await.map(|_| ()))
    }

    async fn delete_service(&self, name: &str) -> Result<()> {
        let services: Api<Service> = self.api();
        ignore_missing(services.delete(name, &DeleteParams::default()).await.map(|_| ()))
    }

    async fn delete_namespace(&self) -> Result<()> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        ignore_missing(
            namespaces
                .delete(&self.namespace, &DeleteParams::default())
                .await
                .map(|_| ()),
        )
    }

    async fn list_pods(&self, selector: &str) -> Result<Vec<String>> {
        let pods: Api<Pod> = self.api();
        let list = pods.list(&ListParams::default().labels(selector)).await?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|p| p.metadata.name)
            .collect())
    }

    async fn follow_logs(&self, pod: &str, container: &str) -> Result<RemoteStream> {
        let pods: Api<Pod> = self.api();
        let params = LogParams {
            follow: true,
            container: Some(container.to_string()),
            ..LogParams::default()
        };
        let reader = pods.log_stream(pod, &params).await?;

        let (tx, stream) = RemoteStream::channel();
        let pod = pod.to_string();
        tokio::spawn(async move {
            let mut lines = Box::pin(reader.lines());
            while let Some(line) = lines.next().await {
                let chunk = line.map(|mut l| {
                    l.push('\n');
                    l.into_bytes()
                });
                let failed = chunk.is_err();
                if tx.send(chunk.map_err(FleetError::from)).await.is_err() || failed {
                    break;
                }
            }
            debug!(pod = %pod, "Log stream ended");
        });
        Ok(stream)
    }
}

fn ignore_missing(result: std::result::Result<(), kube::Error>) -> Result<()> {
    match result {
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            warn!("Resource already deleted: {}", ae.message);
            Ok(())
        }
        other => Ok(other?),
    }
}

impl std::fmt::Debug for KubeClusterApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterApi")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}
