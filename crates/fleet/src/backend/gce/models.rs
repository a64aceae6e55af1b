//! Compute Engine and Resource Manager API types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ============================================================================
// Instance types
// ============================================================================

/// Compute Engine instance.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GceInstance {
    /// Instance name.
    pub name: String,
    /// Status (`PROVISIONING`, `STAGING`, `RUNNING`, ...).
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub tags: Option<Tags>,
}

impl GceInstance {
    /// Whether the instance carries `owner` as a network tag or label.
    #[must_use]
    pub fn is_owned_by(&self, owner: &str) -> bool {
        self.tags
            .as_ref()
            .is_some_and(|t| t.items.iter().any(|i| i == owner))
            || self.labels.get(OWNER_LABEL).is_some_and(|v| v == owner)
    }

    /// External address of the first interface, if any.
    #[must_use]
    pub fn external_ip(&self) -> Option<&str> {
        self.network_interfaces
            .first()
            .and_then(|ni| ni.access_configs.first())
            .and_then(|ac| ac.nat_ip.as_deref())
            .filter(|ip| !ip.is_empty())
    }
}

/// Label key carrying the ownership value.
pub const OWNER_LABEL: &str = "fleet-owner";

/// Network interface.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    #[serde(rename = "networkIP")]
    pub network_ip: Option<String>,
    #[serde(default)]
    pub access_configs: Vec<AccessConfig>,
}

/// Access configuration (external IP).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessConfig {
    #[serde(rename = "type")]
    pub access_type: Option<String>,
    /// External NAT IP.
    #[serde(rename = "natIP")]
    pub nat_ip: Option<String>,
}

/// Network tags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tags {
    #[serde(default)]
    pub items: Vec<String>,
}

/// Instance list page.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceListResponse {
    #[serde(default)]
    pub items: Vec<GceInstance>,
    pub next_page_token: Option<String>,
}

// ============================================================================
// Instance insert request
// ============================================================================

/// Instance insert request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertInstanceRequest {
    pub name: String,
    /// Machine type (partial URL).
    pub machine_type: String,
    pub disks: Vec<AttachedDiskDefinition>,
    pub network_interfaces: Vec<NetworkInterfaceDefinition>,
    pub metadata: Metadata,
    pub tags: Tags,
    pub labels: HashMap<String, String>,
    pub service_accounts: Vec<ServiceAccount>,
}

/// Attached disk definition.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedDiskDefinition {
    pub boot: bool,
    pub auto_delete: bool,
    pub initialize_params: InitializeParams,
}

/// Disk initialization parameters.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Source image (URL).
    pub source_image: String,
}

/// Network interface definition.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterfaceDefinition {
    pub network: String,
    pub access_configs: Vec<AccessConfigDefinition>,
}

/// Access config definition.
#[derive(Debug, Serialize)]
pub struct AccessConfigDefinition {
    #[serde(rename = "type")]
    pub access_type: String,
    pub name: String,
}

/// Instance metadata.
#[derive(Debug, Serialize)]
pub struct Metadata {
    pub items: Vec<MetadataItem>,
}

/// Metadata item.
#[derive(Debug, Serialize)]
pub struct MetadataItem {
    pub key: String,
    pub value: String,
}

/// Service account attached to the instance.
#[derive(Debug, Serialize)]
pub struct ServiceAccount {
    pub email: String,
    pub scopes: Vec<String>,
}

// ============================================================================
// Operation types
// ============================================================================

/// Zonal operation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub name: String,
    /// `PENDING`, `RUNNING` or `DONE`.
    #[serde(default)]
    pub status: String,
    pub error: Option<OperationError>,
}

impl Operation {
    /// Messages of the operation's errors, joined.
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        let errors = &self.error.as_ref()?.errors;
        if errors.is_empty() {
            return None;
        }
        Some(
            errors
                .iter()
                .map(|e| {
                    e.message
                        .clone()
                        .or_else(|| e.code.clone())
                        .unwrap_or_default()
                })
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// Operation error.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OperationError {
    #[serde(default)]
    pub errors: Vec<OperationErrorDetail>,
}

/// Operation error detail.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OperationErrorDetail {
    pub code: Option<String>,
    pub message: Option<String>,
}

// ============================================================================
// Resource Manager
// ============================================================================

/// Project as returned by Resource Manager v1.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub project_number: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_external_ip_and_owner() {
        let instance: GceInstance = serde_json::from_str(
            r#"{
                "name": "fleet-00",
                "status": "RUNNING",
                "tags": {"items": ["fleet", "http-server"]},
                "networkInterfaces": [
                    {"networkIP": "10.128.0.2", "accessConfigs": [{"type": "ONE_TO_ONE_NAT", "natIP": "34.1.2.3"}]}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(instance.external_ip(), Some("34.1.2.3"));
        assert!(instance.is_owned_by("fleet"));
        assert!(!instance.is_owned_by("other"));
    }

    #[test]
    fn test_owner_label_also_counts() {
        let mut instance = GceInstance::default();
        instance
            .labels
            .insert(OWNER_LABEL.to_string(), "fleet".to_string());
        assert!(instance.is_owned_by("fleet"));
        assert_eq!(instance.external_ip(), None);
    }

    #[test]
    fn test_operation_error_message() {
        let op: Operation = serde_json::from_str(
            r#"{"name": "op-1", "status": "DONE",
                "error": {"errors": [{"code": "ALREADY_EXISTS", "message": "fleet-00 already exists"}]}}"#,
        )
        .unwrap();
        assert_eq!(op.error_message().as_deref(), Some("fleet-00 already exists"));

        let ok: Operation = serde_json::from_str(r#"{"name": "op-2", "status": "RUNNING"}"#).unwrap();
        assert!(ok.error_message().is_none());
    }
}
