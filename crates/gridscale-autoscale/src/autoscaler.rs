//! The autoscaler decision cycle.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::TimeDelta;
use tracing::{debug, info, warn};

use gridscale_core::{Clock, Demand, Job, Result};
use gridscale_queue::GridEngine;
use gridscale_registry::ThreadSafeHostStorage;

/// Launches workers for pending demand.
#[async_trait]
pub trait ScaleUpOrchestrator: Send + Sync {
    /// Launch at most `max_batch_size` workers covering `demands`.
    async fn scale_up(&self, demands: Vec<Demand>, max_batch_size: usize) -> Result<()>;
}

/// Retires a single worker.
#[async_trait]
pub trait ScaleDownHandler: Send + Sync {
    /// True once `host` is out of the queue and its run is stopped.
    async fn scale_down(&self, host: &str) -> bool;
}

/// Limits and timeouts of the decision cycle.
#[derive(Debug, Clone)]
pub struct AutoscalerConfig {
    pub max_additional_hosts: usize,
    /// How long a pending job may wait before workers are launched for it.
    pub scale_up_timeout: TimeDelta,
    /// How long after the latest job start the cluster may shrink.
    pub scale_down_timeout: TimeDelta,
    /// How long a worker must be inactive to be retired.
    pub idle_timeout: TimeDelta,
}

/// Decides each cycle whether to add workers, retire one, or wait.
pub struct GridEngineAutoscaler {
    grid_engine: Arc<dyn GridEngine>,
    scale_up: Arc<dyn ScaleUpOrchestrator>,
    scale_down: Arc<dyn ScaleDownHandler>,
    registry: ThreadSafeHostStorage,
    clock: Arc<dyn Clock>,
    config: AutoscalerConfig,
    latest_running_job: Option<Job>,
}

impl GridEngineAutoscaler {
    pub fn new(
        grid_engine: Arc<dyn GridEngine>,
        scale_up: Arc<dyn ScaleUpOrchestrator>,
        scale_down: Arc<dyn ScaleDownHandler>,
        registry: ThreadSafeHostStorage,
        clock: Arc<dyn Clock>,
        config: AutoscalerConfig,
    ) -> Self {
        Self {
            grid_engine,
            scale_up,
            scale_down,
            registry,
            clock,
            config,
            latest_running_job: None,
        }
    }

    /// The most recently started job seen so far.
    pub fn latest_running_job(&self) -> Option<&Job> {
        self.latest_running_job.as_ref()
    }

    /// Run one decision cycle.
    pub async fn scale(&mut self) -> Result<()> {
        let now = self.clock.now();
        let additional_hosts = self.registry.load_hosts();
        let jobs = self.grid_engine.get_jobs().await;
        let (running, pending): (Vec<Job>, Vec<Job>) = jobs
            .iter()
            .filter(|job| job.is_running() || job.is_pending())
            .cloned()
            .partition(|job| job.is_running());
        debug!(
            additional_hosts = additional_hosts.len(),
            running = running.len(),
            pending = pending.len(),
            "autoscaler cycle"
        );

        self.registry.update_running_jobs_host_activity(&running, now)?;
        self.remember_latest(&running);

        let pending = self.drop_invalid(pending).await;

        if !pending.is_empty() {
            let expired: Vec<Job> = pending
                .into_iter()
                .filter(|job| now - job.datetime >= self.config.scale_up_timeout)
                .collect();
            if expired.is_empty() {
                debug!("pending jobs are within the scale-up timeout");
                return Ok(());
            }
            if additional_hosts.len() < self.config.max_additional_hosts {
                let demands = self.grid_engine.get_resource_demands(&expired).await?;
                let slots = self.config.max_additional_hosts - additional_hosts.len();
                info!(
                    expired = expired.len(),
                    demands = demands.len(),
                    slots,
                    "pending jobs waited past the scale-up timeout"
                );
                self.scale_up.scale_up(demands, slots).await?;
            } else {
                info!(
                    additional_hosts = additional_hosts.len(),
                    "additional host limit reached with jobs still pending, retiring an idle host"
                );
                self.scale_down_idle(&additional_hosts, &running).await?;
            }
            return Ok(());
        }

        let quiet = self
            .latest_running_job
            .as_ref()
            .is_none_or(|job| now - job.datetime >= self.config.scale_down_timeout);
        if quiet {
            self.scale_down_idle(&additional_hosts, &running).await?;
        } else {
            debug!("a job started within the scale-down timeout");
        }
        Ok(())
    }

    fn remember_latest(&mut self, running: &[Job]) {
        let Some(latest) = running.iter().max_by_key(|job| job.datetime) else {
            return;
        };
        if self
            .latest_running_job
            .as_ref()
            .is_none_or(|known| latest.datetime > known.datetime)
        {
            debug!(job = %latest.id, started = %latest.datetime, "latest running job");
            self.latest_running_job = Some(latest.clone());
        }
    }

    /// Kill pending jobs no topology can run and return the rest.
    async fn drop_invalid(&self, pending: Vec<Job>) -> Vec<Job> {
        let mut valid = Vec::with_capacity(pending.len());
        let mut invalid = Vec::new();
        for job in pending {
            if self.grid_engine.is_job_valid(&job).await {
                valid.push(job);
            } else {
                invalid.push(job);
            }
        }
        if !invalid.is_empty() {
            let ids: Vec<&str> = invalid.iter().map(|job| job.id.as_str()).collect();
            warn!(jobs = ?ids, "killing jobs that no worker could ever run");
            if let Err(e) = self.grid_engine.kill_jobs(&invalid, false).await {
                warn!(error = %e, "killing invalid jobs failed");
            }
        }
        valid
    }

    /// Retire one additional host that runs nothing and has been inactive
    /// for the idle timeout.
    async fn scale_down_idle(&self, additional_hosts: &[String], running: &[Job]) -> Result<()> {
        let busy: HashSet<&str> = running
            .iter()
            .flat_map(|job| job.hosts.iter().map(String::as_str))
            .collect();
        let free: Vec<String> = additional_hosts
            .iter()
            .filter(|host| !busy.contains(host.as_str()))
            .cloned()
            .collect();
        if free.is_empty() {
            debug!("no additional host is free of jobs");
            return Ok(());
        }

        let now = self.clock.now();
        let activity = self.registry.get_hosts_activity(&free)?;
        let idle: Vec<String> = free
            .into_iter()
            .filter(|host| {
                activity
                    .get(host)
                    .is_some_and(|last| *last + self.config.idle_timeout <= now)
            })
            .collect();
        if idle.is_empty() {
            debug!("no additional host has been idle long enough");
            return Ok(());
        }

        let Some(host) = self.grid_engine.get_host_to_scale_down(&idle).await else {
            return Ok(());
        };
        if self.scale_down.scale_down(&host).await {
            self.registry.remove_host(&host)?;
            info!(%host, "additional host retired");
        } else {
            warn!(%host, "additional host kept");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;
    use gridscale_core::testing::{ts, FakeClock};
    use gridscale_core::JobState;
    use gridscale_queue::testing::{job, running_job, FakeGridEngine};
    use gridscale_registry::MemoryHostStorage;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScaleUpCalls(Mutex<Vec<(Vec<Demand>, usize)>>);

    #[async_trait]
    impl ScaleUpOrchestrator for ScaleUpCalls {
        async fn scale_up(&self, demands: Vec<Demand>, max_batch_size: usize) -> Result<()> {
            self.0.lock().unwrap().push((demands, max_batch_size));
            Ok(())
        }
    }

    struct ScaleDownCalls {
        calls: Mutex<Vec<String>>,
        succeed: bool,
    }

    #[async_trait]
    impl ScaleDownHandler for ScaleDownCalls {
        async fn scale_down(&self, host: &str) -> bool {
            self.calls.lock().unwrap().push(host.to_string());
            self.succeed
        }
    }

    const TIMEOUT: i64 = 30;

    fn noon() -> NaiveDateTime {
        ts(2024, 1, 18, 12, 0, 0)
    }

    fn ago(seconds: i64) -> NaiveDateTime {
        noon() - TimeDelta::seconds(seconds)
    }

    struct Harness {
        grid_engine: Arc<FakeGridEngine>,
        scale_up: Arc<ScaleUpCalls>,
        scale_down: Arc<ScaleDownCalls>,
        registry: ThreadSafeHostStorage,
        clock: Arc<FakeClock>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                grid_engine: Arc::new(FakeGridEngine::new()),
                scale_up: Arc::new(ScaleUpCalls::default()),
                scale_down: Arc::new(ScaleDownCalls {
                    calls: Mutex::new(Vec::new()),
                    succeed: true,
                }),
                registry: ThreadSafeHostStorage::new(MemoryHostStorage::new(Arc::new(
                    FakeClock::noon(),
                ))),
                clock: Arc::new(FakeClock::noon()),
            }
        }

        /// Register `host` with its last activity `seconds` before noon.
        fn register(&self, host: &str, seconds: i64) {
            self.registry.add_host(host).unwrap();
            self.registry
                .update_hosts_activity(&[host.to_string()], ago(seconds))
                .unwrap();
        }

        fn autoscaler(&self) -> GridEngineAutoscaler {
            GridEngineAutoscaler::new(
                self.grid_engine.clone(),
                self.scale_up.clone(),
                self.scale_down.clone(),
                self.registry.clone(),
                self.clock.clone(),
                AutoscalerConfig {
                    max_additional_hosts: 3,
                    scale_up_timeout: TimeDelta::seconds(TIMEOUT),
                    scale_down_timeout: TimeDelta::seconds(TIMEOUT),
                    idle_timeout: TimeDelta::seconds(TIMEOUT),
                },
            )
        }

        fn scale_ups(&self) -> Vec<(Vec<Demand>, usize)> {
            self.scale_up.0.lock().unwrap().clone()
        }

        fn scale_downs(&self) -> Vec<String> {
            self.scale_down.calls.lock().unwrap().clone()
        }
    }

    fn pending(id: &str, waited: i64, slots: u32) -> Job {
        job(id, JobState::Pending, ago(waited), slots)
    }

    #[tokio::test]
    async fn scales_up_for_expired_pending_jobs() {
        let h = Harness::new();
        h.grid_engine.push_jobs(
            (1..=5)
                .map(|i| pending(&i.to_string(), TIMEOUT + 1, 2))
                .collect(),
        );

        h.autoscaler().scale().await.unwrap();

        let calls = h.scale_ups();
        assert_eq!(calls.len(), 1);
        let (demands, slots) = &calls[0];
        assert_eq!(*slots, 3);
        assert_eq!(demands.iter().map(Demand::cpu).sum::<u32>(), 10);
        assert!(h.scale_downs().is_empty());
    }

    #[tokio::test]
    async fn waits_while_pending_jobs_are_fresh() {
        let h = Harness::new();
        h.grid_engine.push_jobs(vec![pending("1", TIMEOUT - 1, 2)]);
        h.register("pipeline-1", 3600);

        h.autoscaler().scale().await.unwrap();

        assert!(h.scale_ups().is_empty());
        assert!(h.scale_downs().is_empty());
    }

    #[tokio::test]
    async fn demands_cover_only_expired_jobs() {
        let h = Harness::new();
        h.grid_engine
            .push_jobs(vec![pending("1", TIMEOUT + 5, 2), pending("2", 5, 4)]);
        h.register("pipeline-1", 0);

        h.autoscaler().scale().await.unwrap();

        assert_eq!(h.grid_engine.demand_requests(), [vec!["1".to_string()]]);
        assert_eq!(h.scale_ups()[0].1, 2);
    }

    #[tokio::test]
    async fn kills_invalid_pending_jobs() {
        let h = Harness::new();
        h.grid_engine
            .push_jobs(vec![pending("1", TIMEOUT + 1, 64)])
            .invalidate_job("1");

        h.autoscaler().scale().await.unwrap();

        assert!(h.grid_engine.called("kill 1"));
        assert!(h.scale_ups().is_empty());
    }

    #[tokio::test]
    async fn retires_idle_host_when_queue_is_quiet() {
        let h = Harness::new();
        h.grid_engine
            .push_jobs(vec![running_job("1", ago(TIMEOUT + 60), &["master"])]);
        h.register("pipeline-1", TIMEOUT + 1);

        h.autoscaler().scale().await.unwrap();

        assert_eq!(h.scale_downs(), ["pipeline-1"]);
        assert!(h.scale_ups().is_empty());
        assert!(h.registry.load_hosts().is_empty());
    }

    #[tokio::test]
    async fn keeps_hosts_while_jobs_start_recently() {
        let h = Harness::new();
        h.grid_engine
            .push_jobs(vec![running_job("1", ago(5), &["master"])]);
        h.register("pipeline-1", TIMEOUT + 1);

        h.autoscaler().scale().await.unwrap();

        assert!(h.scale_downs().is_empty());
    }

    #[tokio::test]
    async fn never_retires_busy_or_recently_active_hosts() {
        let h = Harness::new();
        h.grid_engine
            .push_jobs(vec![running_job("1", ago(3600), &["pipeline-1"])]);
        h.register("pipeline-1", 3600);
        h.register("pipeline-2", 5);

        h.autoscaler().scale().await.unwrap();

        assert!(h.scale_downs().is_empty());
        // The busy host's activity was refreshed to now.
        let activity = h
            .registry
            .get_hosts_activity(&["pipeline-1".to_string()])
            .unwrap();
        assert_eq!(activity["pipeline-1"], noon());
    }

    #[tokio::test]
    async fn full_fleet_with_backlog_retires_instead_of_launching() {
        let h = Harness::new();
        h.grid_engine.push_jobs(vec![pending("1", TIMEOUT + 1, 2)]);
        h.register("pipeline-1", TIMEOUT + 1);
        h.register("pipeline-2", TIMEOUT + 1);
        h.register("pipeline-3", TIMEOUT + 1);

        h.autoscaler().scale().await.unwrap();

        assert!(h.scale_ups().is_empty());
        assert_eq!(h.scale_downs(), ["pipeline-1"]);
    }

    #[tokio::test]
    async fn failed_scale_down_keeps_host_registered() {
        let mut h = Harness::new();
        h.scale_down = Arc::new(ScaleDownCalls {
            calls: Mutex::new(Vec::new()),
            succeed: false,
        });
        h.register("pipeline-1", TIMEOUT + 1);

        h.autoscaler().scale().await.unwrap();

        assert_eq!(h.scale_downs(), ["pipeline-1"]);
        assert_eq!(h.registry.load_hosts(), ["pipeline-1"]);
    }

    #[tokio::test]
    async fn remembers_latest_running_job_across_cycles() {
        let h = Harness::new();
        h.grid_engine
            .push_jobs(vec![running_job("2", ago(10), &["master"])])
            .push_jobs(Vec::new());
        h.register("pipeline-1", 3600);
        let mut autoscaler = h.autoscaler();

        autoscaler.scale().await.unwrap();
        autoscaler.scale().await.unwrap();
        assert_eq!(autoscaler.latest_running_job().map(|j| j.id.as_str()), Some("2"));
        assert!(h.scale_downs().is_empty());

        h.clock.advance(TimeDelta::seconds(TIMEOUT));
        autoscaler.scale().await.unwrap();
        assert_eq!(h.scale_downs(), ["pipeline-1"]);
    }
}
