//! Log tailing for the node container.
//!
//! The runtime names the container itself, so the tailer lists containers by
//! name prefix until exactly one shows up and then follows its logs.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::TailConfig;
use crate::error::{FleetError, Result};
use crate::readiness::sleep_or_cancel;
use crate::remote::{RemoteExecutor, RemoteStream};

/// Finds and follows the node container over the remote executor.
#[derive(Debug, Clone)]
pub struct LogTailer {
    executor: RemoteExecutor,
    filter: String,
    interval: Duration,
}

impl LogTailer {
    #[must_use]
    pub fn new(executor: RemoteExecutor, config: &TailConfig) -> Self {
        Self {
            executor,
            filter: config.name_filter.clone(),
            interval: config.poll_interval,
        }
    }

    /// Command listing the IDs of matching containers, one per line.
    #[must_use]
    pub fn list_command(&self) -> String {
        format!(
            "docker container ls --filter=name={} --format=\"{{{{.ID}}}}\"",
            self.filter
        )
    }

    /// Command following a container's logs.
    #[must_use]
    pub fn follow_command(id: &str) -> String {
        format!("docker container logs --follow {id}")
    }

    /// Container IDs in the list output.
    #[must_use]
    pub fn parse_ids(output: &str) -> Vec<String> {
        output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToString::to_string)
            .collect()
    }

    /// Poll until exactly one container matches the filter.
    ///
    /// Zero matches keeps polling until `cancel` fires.
    ///
    /// # Errors
    /// Returns [`FleetError::AmbiguousTarget`] if several containers match,
    /// the listing command's terminal error, or [`FleetError::Cancelled`].
    pub async fn container_id(&self, host: &str, cancel: &CancellationToken) -> Result<String> {
        let command = self.list_command();
        loop {
            let output = self
                .executor
                .run(host, &command, cancel)
                .read_to_string()
                .await?;
            let mut ids = Self::parse_ids(&output);
            match ids.len() {
                0 => {
                    debug!(host, filter = %self.filter, "No matching container yet");
                    sleep_or_cancel(self.interval, cancel).await?;
                }
                1 => return Ok(ids.remove(0)),
                n => {
                    return Err(FleetError::AmbiguousTarget(format!(
                        "{n} containers match {} on {host}: {}",
                        self.filter,
                        ids.join(", ")
                    )))
                }
            }
        }
    }

    /// Follow the logs of the node container on `host`.
    ///
    /// # Errors
    /// See [`LogTailer::container_id`].
    pub async fn tail(&self, host: &str, cancel: &CancellationToken) -> Result<RemoteStream> {
        let id = self.container_id(host, cancel).await?;
        debug!(host, container = %id, "Following container logs");
        Ok(self.executor.run(host, &Self::follow_command(&id), cancel))
    }
}
