//! Bounded polling for provider-side state transitions.
//!
//! Starting an instance or snapshotting one leaves the provider in a pending
//! state for a while. Backends wait for it by re-checking at a fixed interval
//! up to a maximum wait instead of blocking indefinitely.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};

/// Maximum time to wait for a started instance to leave its pending state.
pub const INSTANCE_STARTUP_TIMEOUT: Duration = Duration::from_secs(120);

/// Interval between two checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The probe never reported readiness within the allowed time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("condition not reached after {attempts} checks ({waited:?})")]
pub struct PollTimeout {
    /// Number of probe calls made.
    pub attempts: u32,
    /// Time spent waiting.
    pub waited: Duration,
}

/// Calls `probe` until it yields `Some`, sleeping `interval` between calls.
///
/// The probe is always called at least once. After `timeout` has elapsed
/// without a value, returns [`PollTimeout`].
pub async fn poll_until<T, F, Fut>(
    timeout: Duration,
    interval: Duration,
    mut probe: F,
) -> Result<T, PollTimeout>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let start = Instant::now();
    let mut attempts = 0;

    loop {
        attempts += 1;
        if let Some(value) = probe().await {
            return Ok(value);
        }

        let waited = start.elapsed();
        if waited >= timeout {
            return Err(PollTimeout { attempts, waited });
        }

        sleep(interval.min(timeout - waited)).await;
    }
}
