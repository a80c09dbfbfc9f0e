//! The queue contract the autoscaler depends on.

use async_trait::async_trait;

use gridscale_core::{Demand, Job, Result};

use crate::parse::AllocationRule;

/// Observes and administers the Grid Engine queue.
#[async_trait]
pub trait GridEngine: Send + Sync {
    /// Jobs of the configured queue. Empty when the status query fails.
    async fn get_jobs(&self) -> Vec<Job>;

    /// Whether any available topology could ever satisfy `job`.
    async fn is_job_valid(&self, job: &Job) -> bool;

    /// Demands the additional workers have to cover for `pending` jobs.
    async fn get_resource_demands(&self, pending: &[Job]) -> Result<Vec<Demand>>;

    async fn get_pe_allocation_rule(&self, pe: &str) -> Result<AllocationRule>;

    /// Allow the queue to schedule jobs on `host`.
    async fn enable_host(&self, host: &str) -> Result<()>;

    /// Stop admitting new jobs on `host`. Running jobs are untouched.
    async fn disable_host(&self, host: &str) -> Result<()>;

    /// Remove `host` from the queue configuration.
    ///
    /// With `skip_on_failure` every step is attempted; otherwise the first
    /// failing step aborts the removal.
    async fn delete_host(&self, host: &str, skip_on_failure: bool) -> Result<()>;

    /// The candidate with the fewest CPUs.
    async fn get_host_to_scale_down(&self, hosts: &[String]) -> Option<String>;

    /// False when `host` is not an execution host or its queue state is unusable.
    async fn is_valid(&self, host: &str) -> bool;

    async fn kill_jobs(&self, jobs: &[Job], force: bool) -> Result<()>;
}
