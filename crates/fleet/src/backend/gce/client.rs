//! Compute Engine REST client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use super::models::{GceInstance, InsertInstanceRequest, InstanceListResponse, Operation, Project};
use crate::error::{FleetError, Result};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

const COMPUTE_API: &str = "https://compute.googleapis.com/compute/v1";
const RESOURCE_MANAGER_API: &str = "https://cloudresourcemanager.googleapis.com/v1";

/// Compute Engine operations used by the instance adapter.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ComputeApi: Send + Sync {
    /// Numeric project number of `project`.
    async fn project_number(&self, project: &str) -> Result<String>;

    /// Submit an instance insert; returns the zonal operation.
    async fn insert_instance(
        &self,
        project: &str,
        zone: &str,
        request: &InsertInstanceRequest,
    ) -> Result<Operation>;

    /// Fetch a zonal operation.
    async fn get_operation(&self, project: &str, zone: &str, operation: &str) -> Result<Operation>;

    /// Fetch an instance.
    async fn get_instance(&self, project: &str, zone: &str, name: &str) -> Result<GceInstance>;

    /// Submit an instance delete; returns the zonal operation.
    async fn delete_instance(&self, project: &str, zone: &str, name: &str) -> Result<Operation>;

    /// Fetch one page of instances.
    async fn list_instances(
        &self,
        project: &str,
        zone: &str,
        page_token: Option<String>,
    ) -> Result<InstanceListResponse>;
}

/// Bearer-token REST client.
#[derive(Clone)]
pub struct GceClient {
    client: Client,
    access_token: String,
}

impl GceClient {
    /// Create a new client.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(access_token: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            access_token: access_token.into(),
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        debug!(url = %url, "GET request");

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    async fn post<T, B>(&self, url: &str, body: &B) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
        B: serde::Serialize + Sync,
    {
        debug!(url = %url, "POST request");

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .json(body)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    async fn delete<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        debug!(url = %url, "DELETE request");

        let response = self
            .client
            .delete(url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, body = %text, "Failed to parse response");
                FleetError::Json(e)
            })
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            Err(FleetError::Configuration(format!(
                "compute credentials rejected ({status}): {text}"
            )))
        } else {
            Err(FleetError::Api {
                status: status.as_u16(),
                message: text,
            })
        }
    }

    fn zone_url(project: &str, zone: &str) -> String {
        format!("{COMPUTE_API}/projects/{project}/zones/{zone}")
    }
}

#[async_trait]
impl ComputeApi for GceClient {
    async fn project_number(&self, project: &str) -> Result<String> {
        let url = format!("{RESOURCE_MANAGER_API}/projects/{project}");
        let project: Project = self.get(&url).await?;
        Ok(project.project_number)
    }

    async fn insert_instance(
        &self,
        project: &str,
        zone: &str,
        request: &InsertInstanceRequest,
    ) -> Result<Operation> {
        let url = format!("{}/instances", Self::zone_url(project, zone));
        self.post(&url, request).await
    }

    async fn get_operation(&self, project: &str, zone: &str, operation: &str) -> Result<Operation> {
        let url = format!("{}/operations/{operation}", Self::zone_url(project, zone));
        self.get(&url).await
    }

    async fn get_instance(&self, project: &str, zone: &str, name: &str) -> Result<GceInstance> {
        let url = format!("{}/instances/{name}", Self::zone_url(project, zone));
        self.get(&url).await
    }

    async fn delete_instance(&self, project: &str, zone: &str, name: &str) -> Result<Operation> {
        let url = format!("{}/instances/{name}", Self::zone_url(project, zone));
        self.delete(&url).await
    }

    async fn list_instances(
        &self,
        project: &str,
        zone: &str,
        page_token: Option<String>,
    ) -> Result<InstanceListResponse> {
        let mut url = format!("{}/instances", Self::zone_url(project, zone));
        if let Some(token) = page_token {
            url = format!("{url}?pageToken={token}");
        }
        self.get(&url).await
    }
}

impl std::fmt::Debug for GceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GceClient").finish_non_exhaustive()
    }
}
