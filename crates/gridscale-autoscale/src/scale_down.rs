//! Retiring additional workers.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use gridscale_core::{Clock, Result};
use gridscale_pipeline::{ComputeLauncher, HostsFile};
use gridscale_queue::GridEngine;
use gridscale_registry::ThreadSafeHostStorage;

use crate::autoscaler::ScaleDownHandler;
use crate::worker::run_id_of;

/// Takes a worker out of the queue and stops its run.
///
/// The host is disabled first and the job list re-read. A job that landed
/// on the host in the meantime aborts the scale-down and the host is
/// enabled again with a fresh activity timestamp; jobs are never killed
/// to make a worker go away.
pub struct GridEngineScaleDownHandler {
    grid_engine: Arc<dyn GridEngine>,
    launcher: Arc<dyn ComputeLauncher>,
    hosts_file: Arc<HostsFile>,
    registry: ThreadSafeHostStorage,
    clock: Arc<dyn Clock>,
}

impl GridEngineScaleDownHandler {
    pub fn new(
        grid_engine: Arc<dyn GridEngine>,
        launcher: Arc<dyn ComputeLauncher>,
        hosts_file: Arc<HostsFile>,
        registry: ThreadSafeHostStorage,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            grid_engine,
            launcher,
            hosts_file,
            registry,
            clock,
        }
    }

    async fn retire(&self, host: &str) -> Result<bool> {
        let run_id = run_id_of(host)?;
        info!(%host, "scaling down");
        self.grid_engine.disable_host(host).await?;

        let jobs = self.grid_engine.get_jobs().await;
        if let Some(job) = jobs.iter().find(|job| job.hosts.iter().any(|h| h == host)) {
            warn!(%host, job = %job.id, "job landed on host during scale-down, keeping it");
            self.grid_engine.enable_host(host).await?;
            self.registry
                .update_hosts_activity(&[host.to_string()], self.clock.now())?;
            return Ok(false);
        }

        self.grid_engine.delete_host(host, false).await?;
        self.launcher.stop(run_id).await?;
        self.hosts_file.remove_host(host)?;
        Ok(true)
    }
}

#[async_trait]
impl ScaleDownHandler for GridEngineScaleDownHandler {
    async fn scale_down(&self, host: &str) -> bool {
        match self.retire(host).await {
            Ok(retired) => retired,
            Err(e) => {
                warn!(%host, error = %e, "scale-down failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridscale_core::testing::{ts, FakeClock};
    use gridscale_pipeline::testing::FakeLauncher;
    use gridscale_queue::testing::{running_job, FakeGridEngine};
    use gridscale_registry::MemoryHostStorage;

    struct Harness {
        grid_engine: Arc<FakeGridEngine>,
        launcher: Arc<FakeLauncher>,
        registry: ThreadSafeHostStorage,
        clock: Arc<FakeClock>,
        hosts_path: std::path::PathBuf,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        /// Both workers registered an hour before the clock's noon.
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let hosts_path = dir.path().join("hosts");
            std::fs::write(&hosts_path, "10.0.0.1\tpipeline-1\n10.0.0.2\tpipeline-2\n").unwrap();
            let clock = Arc::new(FakeClock::new(ts(2024, 1, 18, 11, 0, 0)));
            let registry = ThreadSafeHostStorage::new(MemoryHostStorage::new(clock.clone()));
            registry.add_host("pipeline-1").unwrap();
            registry.add_host("pipeline-2").unwrap();
            clock.set(ts(2024, 1, 18, 12, 0, 0));
            Self {
                grid_engine: Arc::new(FakeGridEngine::new()),
                launcher: Arc::new(FakeLauncher::new()),
                registry,
                clock,
                hosts_path,
                _dir: dir,
            }
        }

        fn handler(&self) -> GridEngineScaleDownHandler {
            GridEngineScaleDownHandler::new(
                self.grid_engine.clone(),
                self.launcher.clone(),
                Arc::new(HostsFile::new(&self.hosts_path)),
                self.registry.clone(),
                self.clock.clone(),
            )
        }

        fn activity(&self, host: &str) -> chrono::NaiveDateTime {
            self.registry.get_hosts_activity(&[host.to_string()]).unwrap()[host]
        }
    }

    #[tokio::test]
    async fn retires_free_host() {
        let h = Harness::new();
        assert!(h.handler().scale_down("pipeline-1").await);

        assert_eq!(h.grid_engine.calls(), ["disable pipeline-1", "delete pipeline-1"]);
        assert_eq!(h.launcher.stops(), ["1"]);
        assert_eq!(h.activity("pipeline-1"), ts(2024, 1, 18, 11, 0, 0));
        assert_eq!(
            std::fs::read_to_string(&h.hosts_path).unwrap(),
            "10.0.0.2\tpipeline-2\n"
        );
    }

    #[tokio::test]
    async fn aborts_when_a_job_lands_on_host() {
        let h = Harness::new();
        h.grid_engine
            .push_jobs(vec![running_job("7", ts(2024, 1, 18, 12, 0, 0), &["pipeline-1"])]);

        assert!(!h.handler().scale_down("pipeline-1").await);

        assert_eq!(h.grid_engine.calls(), ["disable pipeline-1", "enable pipeline-1"]);
        assert!(h.launcher.stops().is_empty());
        assert!(std::fs::read_to_string(&h.hosts_path).unwrap().contains("pipeline-1"));
        assert_eq!(h.activity("pipeline-1"), ts(2024, 1, 18, 12, 0, 0));
        assert_eq!(h.activity("pipeline-2"), ts(2024, 1, 18, 11, 0, 0));
    }

    #[tokio::test]
    async fn refuses_hosts_it_did_not_launch() {
        let h = Harness::new();
        assert!(!h.handler().scale_down("master").await);
        assert!(h.grid_engine.calls().is_empty());
        assert!(h.launcher.stops().is_empty());
    }
}
