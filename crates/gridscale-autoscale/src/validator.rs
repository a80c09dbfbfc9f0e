//! Eviction of additional workers that stopped working.
//!
//! A registered worker is invalid when the queue no longer lists it as a
//! usable execution host, or when its run is explicitly not running. An
//! unavailable control API counts as "still running".
//!
//! Cleanup of an invalid worker is best-effort at every step: stop the run,
//! disable the host, force-kill what is still attributed to it, delete it
//! from the queue, drop it from the hosts file and finally from the registry.

use std::sync::Arc;

use tracing::{debug, info, warn};

use gridscale_core::Job;
use gridscale_pipeline::{ComputeLauncher, HostsFile, PipelineApi, RunStatus};
use gridscale_queue::GridEngine;
use gridscale_registry::ThreadSafeHostStorage;

use crate::worker::run_id_of;

pub struct GridEngineWorkerValidator {
    grid_engine: Arc<dyn GridEngine>,
    api: Arc<dyn PipelineApi>,
    launcher: Arc<dyn ComputeLauncher>,
    registry: ThreadSafeHostStorage,
    hosts_file: Arc<HostsFile>,
}

impl GridEngineWorkerValidator {
    pub fn new(
        grid_engine: Arc<dyn GridEngine>,
        api: Arc<dyn PipelineApi>,
        launcher: Arc<dyn ComputeLauncher>,
        registry: ThreadSafeHostStorage,
        hosts_file: Arc<HostsFile>,
    ) -> Self {
        Self {
            grid_engine,
            api,
            launcher,
            registry,
            hosts_file,
        }
    }

    /// Check every registered worker and evict the invalid ones.
    pub async fn validate_hosts(&self) {
        for host in self.registry.load_hosts() {
            if self.is_valid(&host).await {
                debug!(%host, "additional worker is valid");
            } else {
                self.evict(&host).await;
            }
        }
    }

    async fn is_valid(&self, host: &str) -> bool {
        if !self.grid_engine.is_valid(host).await {
            warn!(%host, "additional worker is not a usable queue host");
            return false;
        }
        let Ok(run_id) = run_id_of(host) else {
            return true;
        };
        match self.api.load_run(run_id).await {
            Ok(run) if run.status != RunStatus::Running => {
                warn!(%host, status = ?run.status, "additional worker run is not running");
                false
            }
            Ok(_) => true,
            Err(e) => {
                debug!(%host, error = %e, "run status unavailable, assuming running");
                true
            }
        }
    }

    async fn evict(&self, host: &str) {
        info!(%host, "evicting invalid additional worker");
        match run_id_of(host) {
            Ok(run_id) => {
                if let Err(e) = self.launcher.stop(run_id).await {
                    warn!(%host, error = %e, "stopping run failed");
                }
            }
            Err(e) => warn!(%host, error = %e, "no run to stop"),
        }
        if let Err(e) = self.grid_engine.disable_host(host).await {
            warn!(%host, error = %e, "disabling host failed");
        }
        let stranded: Vec<Job> = self
            .grid_engine
            .get_jobs()
            .await
            .into_iter()
            .filter(|job| job.hosts.iter().any(|h| h == host))
            .collect();
        if !stranded.is_empty()
            && let Err(e) = self.grid_engine.kill_jobs(&stranded, true).await
        {
            warn!(%host, error = %e, "killing stranded jobs failed");
        }
        if let Err(e) = self.grid_engine.delete_host(host, true).await {
            warn!(%host, error = %e, "deleting host failed");
        }
        if let Err(e) = self.hosts_file.remove_host(host) {
            warn!(%host, error = %e, "hosts file cleanup failed");
        }
        if let Err(e) = self.registry.remove_host(host) {
            warn!(%host, error = %e, "unregistering host failed");
        }
    }
}
