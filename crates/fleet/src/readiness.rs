//! Readiness polling.
//!
//! Backends drive a node from `BackendAccepted` to `EndpointAssigned` by
//! repeatedly probing the backend. Two loops are provided: a fixed-interval
//! poll for short, fast-converging checks (cloud operation status, external
//! address), and an exponential-backoff poll for slow provisioning such as
//! cloud load balancers. Both stop at the deadline with
//! [`FleetError::Timeout`] and at the next check point after cancellation
//! with [`FleetError::Cancelled`].

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{FleetError, Result};

/// Timing knobs for the readiness state machine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    /// Interval between cloud operation/address probes.
    #[serde(with = "crate::config::millis")]
    pub poll_interval: Duration,
    /// Deadline for the creation operation to reach a running state.
    #[serde(with = "crate::config::millis")]
    pub operation_timeout: Duration,
    /// Deadline for a public address to appear.
    #[serde(with = "crate::config::millis")]
    pub address_timeout: Duration,
    /// First load-balancer backoff delay.
    #[serde(with = "crate::config::millis")]
    pub lb_initial_backoff: Duration,
    /// Upper bound on a single load-balancer backoff delay.
    #[serde(with = "crate::config::millis")]
    pub lb_max_backoff: Duration,
    /// Overall load-balancer deadline.
    #[serde(with = "crate::config::millis")]
    pub lb_timeout: Duration,
    /// Extra wait after the load balancer reports an address.
    #[serde(with = "crate::config::millis")]
    pub lb_stabilization: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            operation_timeout: Duration::from_secs(5),
            address_timeout: Duration::from_secs(5),
            lb_initial_backoff: Duration::from_secs(1),
            lb_max_backoff: Duration::from_secs(64),
            lb_timeout: Duration::from_secs(512),
            lb_stabilization: Duration::from_secs(90),
        }
    }
}

/// Sleep unless cancelled first.
///
/// # Errors
/// Returns [`FleetError::Cancelled`] if `cancel` fires before `delay` elapses.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        () = cancel.cancelled() => Err(FleetError::Cancelled),
        () = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Probe at a fixed interval until `probe` yields a value.
///
/// `probe` returns `Ok(None)` to keep polling and `Err` to abort
/// immediately (permanent failure). The timeout message is `what`.
///
/// # Errors
/// Returns the probe's error, [`FleetError::Timeout`], or
/// [`FleetError::Cancelled`].
pub async fn poll_fixed<T, F, Fut>(
    what: &str,
    interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
    probe: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    poll(what, timeout, cancel, probe, |_| interval).await
}

/// Probe with exponential backoff (doubling from `initial`, capped at `max`).
///
/// # Errors
/// Returns the probe's error, [`FleetError::Timeout`], or
/// [`FleetError::Cancelled`].
pub async fn poll_backoff<T, F, Fut>(
    what: &str,
    initial: Duration,
    max: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
    probe: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    poll(what, timeout, cancel, probe, |attempt| {
        let factor = 2u32.saturating_pow(attempt.min(31));
        initial.saturating_mul(factor).min(max)
    })
    .await
}

async fn poll<T, F, Fut, D>(
    what: &str,
    timeout: Duration,
    cancel: &CancellationToken,
    mut probe: F,
    delay_for: D,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
    D: Fn(u32) -> Duration,
{
    let start = Instant::now();
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(FleetError::Cancelled);
        }

        if let Some(value) = probe().await? {
            return Ok(value);
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(FleetError::Timeout(what.to_string()));
        }

        let delay = delay_for(attempt).min(timeout - elapsed);
        debug!(
            what,
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Not ready yet, sleeping"
        );
        sleep_or_cancel(delay, cancel).await?;
        attempt = attempt.saturating_add(1);
    }
}
