//! Typed Kubernetes objects for one node.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, Namespace, PodSpec, PodTemplateSpec,
    Secret, SecretVolumeSource, SecurityContext, Service, ServicePort, ServiceSpec, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;

use crate::config::{Exposure, NODE_CONTAINER_NAME};

/// Plain-HTTP diagnostics port exposed next to the TLS port.
pub const HTTP_PORT: u16 = 3333;

/// Label holding the ownership value.
pub const APP_LABEL: &str = "app";
/// Label holding the node name.
pub const NODE_LABEL: &str = "node";

const TMP_VOLUME: &str = "tmp";
const AUTHORITY_VOLUME: &str = "authority";

/// Labels identifying one node's resources.
#[must_use]
pub fn node_labels(owner: &str, name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_LABEL.to_string(), owner.to_string()),
        (NODE_LABEL.to_string(), name.to_string()),
    ])
}

/// Selector matching every node of `owner`.
#[must_use]
pub fn owner_selector(owner: &str) -> String {
    format!("{APP_LABEL}={owner}")
}

/// Selector matching the pods of one node.
#[must_use]
pub fn node_selector(name: &str) -> String {
    format!("{NODE_LABEL}={name}")
}

/// Name of the secret holding the authority bundle.
#[must_use]
pub fn authority_secret_name(owner: &str) -> String {
    format!("{owner}-authority")
}

/// Namespace labelled with its owner.
#[must_use]
pub fn namespace(name: &str, owner: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([(APP_LABEL.to_string(), owner.to_string())])),
            ..ObjectMeta::default()
        },
        ..Namespace::default()
    }
}

/// Secret holding the authority bundle under `file_name`.
#[must_use]
pub fn authority_secret(owner: &str, file_name: &str, bundle: Vec<u8>) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(authority_secret_name(owner)),
            labels: Some(BTreeMap::from([(APP_LABEL.to_string(), owner.to_string())])),
            ..ObjectMeta::default()
        },
        data: Some(BTreeMap::from([(file_name.to_string(), ByteString(bundle))])),
        ..Secret::default()
    }
}

/// Inputs for one node's deployment and service.
#[derive(Debug, Clone)]
pub struct NodeResources<'a> {
    pub name: &'a str,
    pub owner: &'a str,
    pub image: &'a str,
    pub port: u16,
    pub authority_dir: &'a str,
}

impl NodeResources<'_> {
    /// Single-replica deployment running the node container.
    #[must_use]
    pub fn deployment(&self) -> Deployment {
        let labels = node_labels(self.owner, self.name);

        let container = Container {
            name: NODE_CONTAINER_NAME.to_string(),
            image: Some(self.image.to_string()),
            args: Some(vec!["-log=debug".to_string()]),
            env: Some(vec![
                env("FLEET_MODE", "machine"),
                env("FLEET_SYSTEM", "k8s"),
                env("FLEET_ADDR", &format!("0.0.0.0:{}", self.port)),
            ]),
            ports: Some(vec![
                ContainerPort {
                    name: Some("https".to_string()),
                    container_port: i32::from(self.port),
                    ..ContainerPort::default()
                },
                ContainerPort {
                    name: Some("http".to_string()),
                    container_port: i32::from(HTTP_PORT),
                    ..ContainerPort::default()
                },
            ]),
            security_context: (self.port < 1024).then(|| SecurityContext {
                privileged: Some(true),
                ..SecurityContext::default()
            }),
            volume_mounts: Some(vec![
                VolumeMount {
                    name: TMP_VOLUME.to_string(),
                    mount_path: "/tmp".to_string(),
                    ..VolumeMount::default()
                },
                VolumeMount {
                    name: AUTHORITY_VOLUME.to_string(),
                    mount_path: format!("/{}", self.authority_dir),
                    read_only: Some(true),
                    ..VolumeMount::default()
                },
            ]),
            ..Container::default()
        };

        Deployment {
            metadata: ObjectMeta {
                name: Some(self.name.to_string()),
                labels: Some(labels.clone()),
                ..ObjectMeta::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..LabelSelector::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..ObjectMeta::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        volumes: Some(vec![
                            Volume {
                                name: TMP_VOLUME.to_string(),
                                empty_dir: Some(EmptyDirVolumeSource::default()),
                                ..Volume::default()
                            },
                            Volume {
                                name: AUTHORITY_VOLUME.to_string(),
                                secret: Some(SecretVolumeSource {
                                    secret_name: Some(authority_secret_name(self.owner)),
                                    ..SecretVolumeSource::default()
                                }),
                                ..Volume::default()
                            },
                        ]),
                        ..PodSpec::default()
                    }),
                },
                ..DeploymentSpec::default()
            }),
            ..Deployment::default()
        }
    }

    /// Service exposing the node's ports in the given mode.
    #[must_use]
    pub fn service(&self, exposure: Exposure) -> Service {
        let labels = node_labels(self.owner, self.name);
        let type_ = match exposure {
            Exposure::NodePort => "NodePort",
            Exposure::LoadBalancer => "LoadBalancer",
        };

        Service {
            metadata: ObjectMeta {
                name: Some(self.name.to_string()),
                labels: Some(labels.clone()),
                ..ObjectMeta::default()
            },
            spec: Some(ServiceSpec {
                type_: Some(type_.to_string()),
                selector: Some(labels),
                ports: Some(vec![
                    service_port("https", self.port),
                    service_port("http", HTTP_PORT),
                ]),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        }
    }
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..EnvVar::default()
    }
}

fn service_port(name: &str, port: u16) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port: i32::from(port),
        target_port: Some(IntOrString::Int(i32::from(port))),
        ..ServicePort::default()
    }
}
