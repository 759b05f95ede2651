//! Periodic background jobs: session expiry, validation recovery, outbox cleanup.

use std::{future::Future, time::Duration};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const FALLBACK_PERIOD: Duration = Duration::from_secs(60);

/// Run `job` every `period` until `cancel` fires. A failing run is logged and
/// the next tick proceeds normally; overlapping runs never happen.
pub fn spawn_periodic<F, Fut, T, E>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send,
    T: std::fmt::Debug,
    E: std::fmt::Display,
{
    // tokio::time::interval panics on a zero period
    let period = if period.is_zero() {
        warn!(job = name, "zero period configured, using {:?}", FALLBACK_PERIOD);
        FALLBACK_PERIOD
    } else {
        period
    };

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(job = name, ?period, "periodic job started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match job().await {
                Ok(outcome) => debug!(job = name, ?outcome, "periodic job ran"),
                Err(err) => warn!(job = name, error = %err, "periodic job failed"),
            }
        }
        info!(job = name, "periodic job stopped");
    })
}
