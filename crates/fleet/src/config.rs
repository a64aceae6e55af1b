//! Fleet configuration.
//!
//! Configuration can come from a TOML file ([`FleetConfig::from_file`]),
//! from environment variables ([`FleetConfig::from_env`]), or be assembled
//! by the CLI. Every field has a default so partial files are accepted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{FleetError, Result};
use crate::readiness::ReadinessConfig;
use crate::remote::retry::RetryPolicy;

/// Default ownership label/tag applied to every node.
pub const DEFAULT_OWNER: &str = "fleet";

/// Default node name prefix; nodes are named `{prefix}-{index:02}`.
pub const DEFAULT_NAME_PREFIX: &str = "fleet";

/// Directory (relative to the working directory on the controller, absolute
/// on nodes) holding the authority bundle.
pub const DEFAULT_AUTHORITY_DIR: &str = "secrets";

/// Authority bundle file name.
pub const DEFAULT_AUTHORITY_FILE: &str = "fleet.pem";

/// Mutual-TLS port served by nodes.
pub const DEFAULT_NODE_PORT: u16 = 443;

/// Name of the node's runtime container.
pub const NODE_CONTAINER_NAME: &str = "fleetboot";

/// Which backend provisions nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemKind {
    /// Compute Engine instances running a container-optimized image.
    #[default]
    Gce,
    /// Kubernetes deployments and services.
    K8s,
}

impl std::str::FromStr for SystemKind {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gce" => Ok(Self::Gce),
            "k8s" => Ok(Self::K8s),
            other => Err(FleetError::Configuration(format!(
                "unrecognized system {other}"
            ))),
        }
    }
}

/// Service exposure mode for the cluster backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Exposure {
    /// Port allocated synchronously on every cluster node.
    #[default]
    NodePort,
    /// External load balancer provisioned asynchronously.
    LoadBalancer,
}

/// Compute Engine settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GceConfig {
    pub project: String,
    pub zone: String,
    /// `OAuth2` access token used for the Compute and Resource Manager APIs.
    pub access_token: String,
    pub machine_type: String,
    pub image_project: String,
    pub image_family: String,
}

impl Default for GceConfig {
    fn default() -> Self {
        Self {
            project: String::new(),
            zone: String::new(),
            access_token: String::new(),
            machine_type: "f1-micro".to_string(),
            image_project: "cos-cloud".to_string(),
            image_family: "cos-stable".to_string(),
        }
    }
}

/// Kubernetes settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct K8sConfig {
    /// Path to a kubeconfig; the default client configuration is used if unset.
    pub kubeconfig: Option<PathBuf>,
    pub namespace: String,
    pub exposure: Exposure,
    /// Host reported for `NodePort` endpoints.
    pub node_host: String,
    /// Upper bound on nodes per start.
    pub max_nodes: usize,
}

impl Default for K8sConfig {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            namespace: "default".to_string(),
            exposure: Exposure::NodePort,
            node_host: "localhost".to_string(),
            max_nodes: 256,
        }
    }
}

/// Remote-shell settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Login user; defaults to the invoking user.
    pub user: Option<String>,
    /// Private key; defaults to `~/.ssh/google_compute_engine`.
    pub private_key: Option<PathBuf>,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: None,
            private_key: None,
            connect_timeout: Duration::from_secs(15),
        }
    }
}

impl SshConfig {
    /// Resolve the login user.
    ///
    /// # Errors
    /// Returns a configuration error if no user is set and none can be found
    /// in the environment.
    pub fn resolved_user(&self) -> Result<String> {
        if let Some(user) = &self.user {
            return Ok(user.clone());
        }
        std::env::var("USER")
            .or_else(|_| std::env::var("LOGNAME"))
            .map_err(|_| {
                FleetError::Configuration("unable to determine current user's username".into())
            })
    }

    /// Resolve the private key path.
    ///
    /// # Errors
    /// Returns a configuration error if no key is set and the home directory
    /// is unknown.
    pub fn resolved_private_key(&self) -> Result<PathBuf> {
        if let Some(key) = &self.private_key {
            return Ok(key.clone());
        }
        dirs::home_dir()
            .map(|home| home.join(".ssh").join("google_compute_engine"))
            .ok_or_else(|| {
                FleetError::Configuration("unable to determine current user's home directory".into())
            })
    }
}

/// Retry settings for remote-shell operations.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    #[serde(with = "millis")]
    pub base_delay: Duration,
    pub multiplier: f64,
    #[serde(with = "millis")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 1.5,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// Build a policy using the default transient/terminal classifier.
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.base_delay, self.multiplier, self.max_delay)
    }
}

/// Log-tailing settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TailConfig {
    /// Container name prefix used to find the workload container.
    pub name_filter: String,
    #[serde(with = "millis")]
    pub poll_interval: Duration,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            name_filter: NODE_CONTAINER_NAME.to_string(),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub system: SystemKind,
    pub owner: String,
    pub name_prefix: String,
    /// Bootstrap container image reference.
    pub image: String,
    pub authority_dir: PathBuf,
    pub authority_file: String,
    pub port: u16,
    pub gce: GceConfig,
    pub k8s: K8sConfig,
    pub ssh: SshConfig,
    pub readiness: ReadinessConfig,
    pub retry: RetryConfig,
    pub tail: TailConfig,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            system: SystemKind::default(),
            owner: DEFAULT_OWNER.to_string(),
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            image: String::new(),
            authority_dir: PathBuf::from(DEFAULT_AUTHORITY_DIR),
            authority_file: DEFAULT_AUTHORITY_FILE.to_string(),
            port: DEFAULT_NODE_PORT,
            gce: GceConfig::default(),
            k8s: K8sConfig::default(),
            ssh: SshConfig::default(),
            readiness: ReadinessConfig::default(),
            retry: RetryConfig::default(),
            tail: TailConfig::default(),
        }
    }
}

impl FleetConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| {
            FleetError::Configuration(format!("failed to parse {}: {e}", path.display()))
        })
    }

    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    /// - `FLEET_SYSTEM`: `gce` (default) or `k8s`
    /// - `FLEET_OWNER`: ownership label (default: `fleet`)
    /// - `IMG` and `TAG`: bootstrap image, combined as `IMG:TAG`
    /// - `PROJECT`, `ZONE`: Compute Engine project and zone
    /// - `GOOGLE_OAUTH_ACCESS_TOKEN`: Compute Engine access token
    /// - `KUBECONFIG`, `FLEET_NAMESPACE`: Kubernetes client and namespace
    /// - `FLEET_LOAD_BALANCER`: expose nodes through load balancers when `true`
    ///
    /// # Errors
    /// Returns an error if `FLEET_SYSTEM` is not recognised.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(system) = std::env::var("FLEET_SYSTEM") {
            config.system = system.parse()?;
        }
        if let Ok(owner) = std::env::var("FLEET_OWNER") {
            config.owner = owner;
        }
        if let (Ok(img), Ok(tag)) = (std::env::var("IMG"), std::env::var("TAG")) {
            config.image = format!("{img}:{tag}");
        }

        config.gce.project = std::env::var("PROJECT").unwrap_or_default();
        config.gce.zone = std::env::var("ZONE").unwrap_or_default();
        config.gce.access_token = std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN").unwrap_or_default();

        config.k8s.kubeconfig = std::env::var("KUBECONFIG").ok().map(PathBuf::from);
        if let Ok(namespace) = std::env::var("FLEET_NAMESPACE") {
            config.k8s.namespace = namespace;
        }
        if std::env::var("FLEET_LOAD_BALANCER").is_ok_and(|v| v == "true") {
            config.k8s.exposure = Exposure::LoadBalancer;
        }

        Ok(config)
    }

    /// Path of the authority bundle on the controller.
    #[must_use]
    pub fn authority_path(&self) -> PathBuf {
        self.authority_dir.join(&self.authority_file)
    }

    /// Check that the identifiers required by the selected backend are present.
    ///
    /// # Errors
    /// Returns [`FleetError::Configuration`] naming the first missing field.
    pub fn validate(&self) -> Result<()> {
        let missing = |field: &str| FleetError::Configuration(format!("{field} is required"));

        if self.image.is_empty() {
            return Err(missing("image"));
        }
        if self.owner.is_empty() {
            return Err(missing("owner"));
        }
        if self.authority_file.is_empty() {
            return Err(missing("authority_file"));
        }
        if self.system == SystemKind::Gce {
            if self.gce.project.is_empty() {
                return Err(missing("gce.project"));
            }
            if self.gce.zone.is_empty() {
                return Err(missing("gce.zone"));
            }
        }
        Ok(())
    }
}

/// Deserialize a [`Duration`] from integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
