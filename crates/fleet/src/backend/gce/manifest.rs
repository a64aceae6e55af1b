//! Container declaration embedded in instance metadata.
//!
//! Container-optimized images start exactly one container from this
//! declaration at boot.

use serde::{Deserialize, Serialize};

use crate::config::NODE_CONTAINER_NAME;
use crate::error::{FleetError, Result};
use crate::node::BackendKind;

/// Instance metadata key holding the declaration.
pub const CONTAINER_DECLARATION_KEY: &str = "gce-container-declaration";

const SCRATCH_VOLUME: &str = "tmpfs";
const AUTHORITY_VOLUME: &str = "authority";

/// Top-level declaration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub spec: ManifestSpec,
}

/// Pod-like specification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSpec {
    pub containers: Vec<Container>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
}

/// One container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stdin: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub tty: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<SecurityContext>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityContext {
    pub privileged: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_dir: Option<EmptyDir>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<HostPath>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyDir {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub medium: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPath {
    pub path: String,
}

impl Manifest {
    /// Check that the declaration holds exactly one container.
    ///
    /// # Errors
    /// Returns [`FleetError::Configuration`] otherwise.
    pub fn validate(&self) -> Result<()> {
        match self.spec.containers.len() {
            1 => Ok(()),
            n => Err(FleetError::Configuration(format!(
                "container declaration must have exactly one container, found {n}"
            ))),
        }
    }

    /// Validate and serialize to YAML.
    ///
    /// # Errors
    /// Returns a validation or serialization error.
    pub fn to_yaml(&self) -> Result<String> {
        self.validate()?;
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Settings that vary between nodes or backends.
#[derive(Debug, Clone)]
pub struct NodeManifest<'a> {
    pub image: &'a str,
    pub kind: BackendKind,
    pub port: u16,
    pub authority_dir: &'a str,
    /// Backend-specific identifiers such as project and zone.
    pub extra_env: Vec<EnvVar>,
}

impl NodeManifest<'_> {
    /// Build the node's container declaration.
    #[must_use]
    pub fn build(&self) -> Manifest {
        let mut env = vec![
            EnvVar::new("FLEET_MODE", "machine"),
            EnvVar::new("FLEET_SYSTEM", self.kind.system_name()),
            EnvVar::new("FLEET_ADDR", format!("0.0.0.0:{}", self.port)),
        ];
        env.extend(self.extra_env.iter().cloned());

        let container = Container {
            name: NODE_CONTAINER_NAME.to_string(),
            image: self.image.to_string(),
            // Binding a port below 1024 without root.
            security_context: (self.port < 1024).then_some(SecurityContext { privileged: true }),
            args: vec!["-log=debug".to_string()],
            env,
            volume_mounts: vec![
                VolumeMount {
                    name: SCRATCH_VOLUME.to_string(),
                    mount_path: "/tmp".to_string(),
                    read_only: false,
                },
                VolumeMount {
                    name: AUTHORITY_VOLUME.to_string(),
                    mount_path: format!("/{}", self.authority_dir),
                    read_only: true,
                },
            ],
            ..Container::default()
        };

        Manifest {
            spec: ManifestSpec {
                containers: vec![container],
                restart_policy: Some("Never".to_string()),
                volumes: vec![
                    Volume {
                        name: SCRATCH_VOLUME.to_string(),
                        empty_dir: Some(EmptyDir {
                            medium: "Memory".to_string(),
                        }),
                        host_path: None,
                    },
                    Volume {
                        name: AUTHORITY_VOLUME.to_string(),
                        empty_dir: None,
                        host_path: Some(HostPath {
                            path: format!("/tmp/{}", self.authority_dir),
                        }),
                    },
                ],
            },
        }
    }
}
