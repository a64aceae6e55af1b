//! Launch N independent tasks, join all, keep every outcome.
//!
//! Used for node creation, authority distribution and teardown. One task's
//! failure or panic never affects its siblings.

use std::collections::HashMap;
use std::future::Future;

use tokio::task::JoinSet;
use tracing::{error, info};

use crate::error::{FleetError, Result};

/// Run `f` for every input concurrently and wait for all of them.
///
/// Outcomes are returned in input order. A panicking task yields
/// [`FleetError::Task`] in its slot.
pub async fn join_all<I, T, F, Fut>(phase: &str, inputs: Vec<I>, f: F) -> Vec<Result<T>>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let total = inputs.len();
    let mut set = JoinSet::new();
    let mut slots = HashMap::with_capacity(total);

    for (index, input) in inputs.into_iter().enumerate() {
        let handle = set.spawn(f(input));
        slots.insert(handle.id(), index);
    }

    let mut results: Vec<Option<Result<T>>> = (0..total).map(|_| None).collect();
    while let Some(joined) = set.join_next_with_id().await {
        let (id, outcome) = match joined {
            Ok((id, outcome)) => (id, outcome),
            Err(e) => {
                error!(phase, "Task panicked: {e}");
                (e.id(), Err(FleetError::Task(e.to_string())))
            }
        };
        if let Some(&index) = slots.get(&id) {
            results[index] = Some(outcome);
        }
    }

    let failed = results
        .iter()
        .filter(|r| !matches!(r, Some(Ok(_))))
        .count();
    info!(phase, total, failed, "Joined all tasks");

    results
        .into_iter()
        .map(|r| r.unwrap_or_else(|| Err(FleetError::Task("task result lost".into()))))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_results_keep_input_order() {
        let results = join_all("test", vec![3u64, 1, 2], |n| async move {
            tokio::time::sleep(Duration::from_secs(n)).await;
            Ok(n * 10)
        })
        .await;

        let values: Vec<u64> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, vec![30, 10, 20]);
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let results = join_all("test", vec![0, 1, 2], |n| async move {
            if n == 1 {
                Err(FleetError::create(format!("fleet-{n:02}"), "quota exceeded"))
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(FleetError::Create { .. })));
        assert!(results[2].is_ok());
    }

    #[tokio::test]
    async fn test_panic_becomes_task_error() {
        let results = join_all("test", vec![0, 1], |n| async move {
            assert!(n != 1, "boom");
            Ok(n)
        })
        .await;

        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(FleetError::Task(_))));
    }

    #[tokio::test]
    async fn test_empty_input() {
        let results = join_all::<u32, u32, _, _>("test", Vec::new(), |n| async move { Ok(n) }).await;
        assert!(results.is_empty());
    }
}
