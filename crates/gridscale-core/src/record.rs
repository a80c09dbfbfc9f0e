//! Launch history of additional workers.

use async_trait::async_trait;
use chrono::NaiveDateTime;

/// Outcome of a single worker launch.
///
/// Records only drive the availability circuit breaker; the host
/// registry stays the authoritative view of live workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRecord {
    pub run_id: String,
    pub host_name: String,
    pub instance_type: String,
    pub started_at: Option<NaiveDateTime>,
    pub stopped_at: Option<NaiveDateTime>,
    pub had_capacity_failure: bool,
}

/// Keeps a bounded history of completed launches.
#[async_trait]
pub trait WorkerRecorder: Send + Sync {
    /// Record the launch behind `run_id`. Failures are logged, not raised.
    async fn record(&self, run_id: &str);

    /// Recorded launches, oldest first.
    fn records(&self) -> Vec<WorkerRecord>;
}
