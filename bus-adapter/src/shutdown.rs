use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, sleep, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ShutdownConfig;
use crate::jobs::JobTracker;

const ENTITY: &str = "bus.shutdown";

pub const DRAIN_TIMEOUTS: &str = "bus_adapter_drain_abandoned_jobs_total";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Clean,
    /// The deadline passed with these jobs still registered.
    TimedOut { abandoned: Vec<String> },
}

#[derive(Debug, Clone, Copy)]
pub struct DrainSettings {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub settle: Duration,
}

impl From<&ShutdownConfig> for DrainSettings {
    fn from(config: &ShutdownConfig) -> Self {
        Self {
            timeout: config.timeout.0,
            poll_interval: config.poll_interval.0,
            settle: config.settle.0,
        }
    }
}

/// Best-effort drain: stop receiving, then wait for the job registry to empty,
/// never past the deadline. Work still running at the deadline is abandoned.
pub struct ShutdownCoordinator {
    jobs: Arc<JobTracker>,
    stop_receiving: CancellationToken,
    settings: DrainSettings,
    correlation_id: String,
}

impl ShutdownCoordinator {
    pub fn new(
        jobs: Arc<JobTracker>,
        stop_receiving: CancellationToken,
        settings: DrainSettings,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            jobs,
            stop_receiving,
            settings,
            correlation_id: correlation_id.into(),
        }
    }

    pub async fn drain(&self) -> DrainOutcome {
        let deadline = Instant::now() + self.settings.timeout;

        let in_flight = self.jobs.size();
        if in_flight > 0 {
            info!(
                entity = ENTITY,
                correlation_id = %self.correlation_id,
                "still has {} jobs in progress when got stop signal",
                in_flight
            );
        }

        self.stop_receiving.cancel();
        // Lets records already pulled off the transport reach the registry.
        sleep(self.settings.settle).await;

        let mut ticker = interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = sleep_until(deadline) => break,
                _ = ticker.tick() => {
                    if self.jobs.is_empty() {
                        info!(
                            entity = ENTITY,
                            correlation_id = %self.correlation_id,
                            "all jobs finished, graceful shutdown is clean"
                        );
                        return DrainOutcome::Clean;
                    }
                }
            }
        }

        let abandoned = self.jobs.snapshot();
        for id in &abandoned {
            warn!(
                entity = ENTITY,
                correlation_id = %id,
                "job failed due to timeout"
            );
        }
        metrics::counter!(DRAIN_TIMEOUTS).increment(abandoned.len() as u64);
        warn!(
            entity = ENTITY,
            correlation_id = %self.correlation_id,
            "graceful shutdown timed out after {:?}, abandoning {} jobs",
            self.settings.timeout,
            abandoned.len()
        );
        DrainOutcome::TimedOut { abandoned }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> DrainSettings {
        DrainSettings {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            settle: Duration::from_millis(100),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_cancels_receiving_first() {
        let stop = CancellationToken::new();
        let coordinator =
            ShutdownCoordinator::new(JobTracker::new(), stop.clone(), settings(), "test");

        assert_eq!(coordinator.drain().await, DrainOutcome::Clean);
        assert!(stop.is_cancelled());
    }
}
