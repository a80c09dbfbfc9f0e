//! The polling loop driving validation and autoscaling.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use crate::autoscaler::GridEngineAutoscaler;
use crate::validator::GridEngineWorkerValidator;

/// Runs a validation pass and an autoscaler cycle every polling interval.
pub struct Daemon {
    autoscaler: GridEngineAutoscaler,
    validator: GridEngineWorkerValidator,
    polling_timeout: Duration,
}

impl Daemon {
    pub fn new(
        autoscaler: GridEngineAutoscaler,
        validator: GridEngineWorkerValidator,
        polling_timeout: Duration,
    ) -> Self {
        Self {
            autoscaler,
            validator,
            polling_timeout,
        }
    }

    /// One validation pass followed by one autoscaler cycle. Cycle errors
    /// are logged and the daemon keeps going.
    pub async fn tick(&mut self) {
        self.validator.validate_hosts().await;
        if let Err(e) = self.autoscaler.scale().await {
            error!(error = %e, "autoscaler cycle failed");
        }
    }

    /// Loop until `shutdown` changes. A cycle in progress is finished first.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            polling_timeout_secs = self.polling_timeout.as_secs(),
            "autoscaling daemon started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.polling_timeout) => self.tick().await,
                _ = shutdown.changed() => {
                    info!("autoscaling daemon shutting down");
                    break;
                }
            }
        }
    }
}
