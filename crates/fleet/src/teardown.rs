//! Teardown of every node owned by a label.

use std::sync::Arc;

use tracing::{error, info};

use crate::backend::Backend;
use crate::error::Result;
use crate::fanout::join_all;

/// Outcome of a teardown. Failures are logged, never escalated.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
}

/// Delete every node `backend` lists for `owner`, concurrently.
///
/// # Errors
/// Only listing can fail; per-node delete failures are recorded in the
/// report and logged.
pub async fn teardown(backend: &Arc<dyn Backend>, owner: &str) -> Result<TeardownReport> {
    let names: Vec<String> = backend
        .list(owner)
        .await?
        .iter()
        .map(|n| n.name().to_string())
        .collect();
    info!(owner, count = names.len(), "Tearing down nodes");

    let outcomes = join_all("teardown", names.clone(), |name| {
        let backend = backend.clone();
        async move { backend.delete(&name).await }
    })
    .await;

    let mut report = TeardownReport::default();
    for (name, outcome) in names.into_iter().zip(outcomes) {
        match outcome {
            Ok(()) => report.deleted.push(name),
            Err(e) => {
                error!(node = %name, "Failed to delete node: {e}");
                report.failed.push(name);
            }
        }
    }
    info!(
        deleted = report.deleted.len(),
        failed = report.failed.len(),
        "Teardown finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use mockall::predicate::eq;

    use super::*;
    use crate::backend::MockBackend;
    use crate::error::FleetError;
    use crate::node::{BackendKind, Node};

    #[tokio::test]
    async fn test_delete_failure_does_not_stop_others() {
        let mut backend = MockBackend::new();
        backend.expect_list().with(eq("fleet")).returning(|owner| {
            Ok(["fleet-00", "fleet-01", "fleet-02"]
                .iter()
                .map(|n| Node::observed(*n, BackendKind::ComputeInstance, owner, None))
                .collect())
        });
        backend.expect_delete().times(3).returning(|name| {
            if name == "fleet-01" {
                Err(FleetError::Api {
                    status: 500,
                    message: "backend error".to_string(),
                })
            } else {
                Ok(())
            }
        });

        let backend: Arc<dyn Backend> = Arc::new(backend);
        let report = teardown(&backend, "fleet").await.unwrap();

        assert_eq!(report.deleted, vec!["fleet-00", "fleet-02"]);
        assert_eq!(report.failed, vec!["fleet-01"]);
    }

    #[tokio::test]
    async fn test_nothing_to_delete() {
        let mut backend = MockBackend::new();
        backend.expect_list().returning(|_| Ok(Vec::new()));
        backend.expect_delete().never();

        let backend: Arc<dyn Backend> = Arc::new(backend);
        let report = teardown(&backend, "fleet").await.unwrap();
        assert_eq!(report, TeardownReport::default());
    }
}
