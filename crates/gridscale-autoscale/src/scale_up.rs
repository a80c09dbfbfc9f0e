//! Launching additional workers.
//!
//! `GridEngineScaleUpHandler` brings one worker from launch to an enabled
//! queue host:
//!
//! 1. launch the run and report its id
//! 2. register the host
//! 3. wait for a pod IP
//! 4. add the host to the hosts file
//! 5. wait for initialization and the node setup task
//! 6. enable the host in the queue
//!
//! `GridEngineScaleUpOrchestrator` runs one handler per selected instance
//! concurrently and joins them all before the cycle moves on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use gridscale_core::{
    Clock, Demand, GridScaleError, InstanceDemand, PriceType, Result, WorkerRecorder,
};
use gridscale_instance::InstanceSelector;
use gridscale_pipeline::{ComputeLauncher, HostsFile, LaunchRequest, PipelineApi, RunStatus, TaskStatus};
use gridscale_queue::GridEngine;
use gridscale_registry::ThreadSafeHostStorage;

use crate::autoscaler::ScaleUpOrchestrator;
use crate::worker::host_name;

/// How workers are launched and how long they may take to come up.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub parent_run_id: String,
    pub disk_size: u32,
    pub image: String,
    pub cmd_template: String,
    pub price_type: PriceType,
    pub region_id: u64,
    /// Extra launch parameters passed to every worker.
    pub launch_params: Vec<(String, String)>,
    /// Launch parameter carrying the user the worker is launched for.
    pub owner_param_name: String,
    /// Task whose success marks the worker as set up.
    pub node_setup_task: Option<String>,
    pub polling_delay: Duration,
    /// Budget for the run to get a pod IP.
    pub run_ready_timeout: Duration,
    /// Budget for the run to finish initialization.
    pub run_init_timeout: Duration,
    pub enable_attempts: u32,
}

impl WorkerSettings {
    fn attempts(&self, timeout: Duration) -> u32 {
        if self.polling_delay.is_zero() {
            return 1;
        }
        let attempts = timeout.as_millis() / self.polling_delay.as_millis().max(1);
        u32::try_from(attempts).unwrap_or(u32::MAX).max(1)
    }
}

/// Launches a single worker and waits until the queue can use it.
pub struct GridEngineScaleUpHandler {
    launcher: Arc<dyn ComputeLauncher>,
    api: Arc<dyn PipelineApi>,
    grid_engine: Arc<dyn GridEngine>,
    registry: ThreadSafeHostStorage,
    hosts_file: Arc<HostsFile>,
    clock: Arc<dyn Clock>,
    settings: WorkerSettings,
}

impl GridEngineScaleUpHandler {
    pub fn new(
        launcher: Arc<dyn ComputeLauncher>,
        api: Arc<dyn PipelineApi>,
        grid_engine: Arc<dyn GridEngine>,
        registry: ThreadSafeHostStorage,
        hosts_file: Arc<HostsFile>,
        clock: Arc<dyn Clock>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            launcher,
            api,
            grid_engine,
            registry,
            hosts_file,
            clock,
            settings,
        }
    }

    /// Launch a worker for `demand`. The run id goes to `run_ids` as soon
    /// as it is known. Failures are logged, never returned.
    pub async fn scale_up(&self, demand: InstanceDemand, run_ids: mpsc::UnboundedSender<String>) {
        let instance_type = demand.instance.name.clone();
        if let Err(e) = self.launch_worker(demand, &run_ids).await {
            warn!(%instance_type, error = %e, "additional worker launch failed");
        }
    }

    async fn launch_worker(
        &self,
        demand: InstanceDemand,
        run_ids: &mpsc::UnboundedSender<String>,
    ) -> Result<()> {
        info!(
            instance_type = %demand.instance.name,
            owner = demand.owner.as_deref().unwrap_or("-"),
            "launching additional worker"
        );
        let run_id = self.launcher.launch(&self.launch_request(&demand)).await?;
        if run_ids.send(run_id.clone()).is_err() {
            debug!(%run_id, "run id receiver already closed");
        }

        let host = host_name(&run_id);
        self.registry.add_host(&host)?;

        let ip = self.await_pod_ip(&run_id).await?;
        self.hosts_file.add_host(&host, &ip)?;

        self.await_initialization(&run_id).await?;
        self.enable(&host).await?;
        self.registry
            .update_hosts_activity(std::slice::from_ref(&host), self.clock.now())?;
        info!(%host, %run_id, %ip, "additional worker enabled");
        Ok(())
    }

    fn launch_request(&self, demand: &InstanceDemand) -> LaunchRequest {
        let settings = &self.settings;
        let mut params = settings.launch_params.clone();
        params.push(("cluster_role".to_string(), "worker".to_string()));
        params.push(("cluster_role_type".to_string(), "additional".to_string()));
        if let Some(owner) = &demand.owner {
            params.push((settings.owner_param_name.clone(), owner.clone()));
        }
        LaunchRequest {
            instance_type: demand.instance.name.clone(),
            disk_size: settings.disk_size,
            image: settings.image.clone(),
            cmd_template: settings.cmd_template.clone(),
            parent_run_id: settings.parent_run_id.clone(),
            price_type: settings.price_type,
            region_id: settings.region_id,
            params,
        }
    }

    async fn await_pod_ip(&self, run_id: &str) -> Result<String> {
        let attempts = self.settings.attempts(self.settings.run_ready_timeout);
        for attempt in 1..=attempts {
            match self.api.load_run(run_id).await {
                Ok(run) => {
                    ensure_running(run_id, run.status)?;
                    if let Some(ip) = run.pod_ip.filter(|ip| !ip.is_empty()) {
                        return Ok(ip);
                    }
                    debug!(%run_id, attempt, attempts, "waiting for pod ip");
                }
                Err(e) => warn!(%run_id, attempt, error = %e, "run status unavailable"),
            }
            tokio::time::sleep(self.settings.polling_delay).await;
        }
        Err(GridScaleError::Scaling(format!(
            "run {run_id} got no pod ip after {attempts} attempts"
        )))
    }

    async fn await_initialization(&self, run_id: &str) -> Result<()> {
        let attempts = self.settings.attempts(self.settings.run_init_timeout);
        for attempt in 1..=attempts {
            match self.api.load_run(run_id).await {
                Ok(run) => {
                    ensure_running(run_id, run.status)?;
                    if run.initialized && self.node_setup_succeeded(run_id).await? {
                        return Ok(());
                    }
                    debug!(%run_id, attempt, attempts, "waiting for worker initialization");
                }
                Err(e) => warn!(%run_id, attempt, error = %e, "run status unavailable"),
            }
            tokio::time::sleep(self.settings.polling_delay).await;
        }
        Err(GridScaleError::Scaling(format!(
            "run {run_id} not initialized after {attempts} attempts"
        )))
    }

    /// Whether the latest node setup log entry is a success. A failed setup
    /// is an error.
    async fn node_setup_succeeded(&self, run_id: &str) -> Result<bool> {
        let Some(task) = &self.settings.node_setup_task else {
            return Ok(true);
        };
        let logs = match self.api.load_task(run_id, task).await {
            Ok(logs) => logs,
            Err(e) => {
                warn!(%run_id, %task, error = %e, "task status unavailable");
                return Ok(false);
            }
        };
        match logs.last().map(|log| log.status) {
            Some(TaskStatus::Success) => Ok(true),
            Some(status @ (TaskStatus::Failure | TaskStatus::Stopped)) => Err(
                GridScaleError::Scaling(format!("run {run_id} task {task} ended as {status:?}")),
            ),
            _ => Ok(false),
        }
    }

    async fn enable(&self, host: &str) -> Result<()> {
        let attempts = self.settings.enable_attempts.max(1);
        for attempt in 1..=attempts {
            match self.grid_engine.enable_host(host).await {
                Ok(()) => return Ok(()),
                Err(e) => warn!(%host, attempt, attempts, error = %e, "host enable failed"),
            }
            if attempt < attempts {
                tokio::time::sleep(self.settings.polling_delay).await;
            }
        }
        Err(GridScaleError::Scaling(format!(
            "host {host} not enabled after {attempts} attempts"
        )))
    }
}

fn ensure_running(run_id: &str, status: RunStatus) -> Result<()> {
    if status == RunStatus::Running {
        Ok(())
    } else {
        Err(GridScaleError::Scaling(format!(
            "run {run_id} is {status:?} instead of running"
        )))
    }
}

/// Launches batches of workers for the pending demand.
pub struct GridEngineScaleUpOrchestrator {
    handler: Arc<GridEngineScaleUpHandler>,
    selector: InstanceSelector,
    grid_engine: Arc<dyn GridEngine>,
    registry: ThreadSafeHostStorage,
    recorder: Arc<dyn WorkerRecorder>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    polling_delay: Duration,
}

impl GridEngineScaleUpOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        handler: Arc<GridEngineScaleUpHandler>,
        selector: InstanceSelector,
        grid_engine: Arc<dyn GridEngine>,
        registry: ThreadSafeHostStorage,
        recorder: Arc<dyn WorkerRecorder>,
        clock: Arc<dyn Clock>,
        batch_size: usize,
        polling_delay: Duration,
    ) -> Self {
        Self {
            handler,
            selector,
            grid_engine,
            registry,
            recorder,
            clock,
            batch_size,
            polling_delay,
        }
    }

    /// Instances for up to `batch` workers. A selection failure keeps what
    /// was selected before it.
    async fn select(&self, demands: Vec<Demand>, batch: usize) -> Result<Vec<InstanceDemand>> {
        let mut selected = Vec::with_capacity(batch);
        for demand in self.selector.select(demands).await?.take(batch) {
            match demand {
                Ok(demand) => selected.push(demand),
                Err(e) if selected.is_empty() => return Err(e),
                Err(e) => {
                    warn!(selected = selected.len(), error = %e, "instance selection stopped early");
                    break;
                }
            }
        }
        Ok(selected)
    }

    async fn refresh_running_hosts(&self) {
        let running: Vec<_> = self
            .grid_engine
            .get_jobs()
            .await
            .into_iter()
            .filter(|job| job.is_running())
            .collect();
        if let Err(e) = self
            .registry
            .update_running_jobs_host_activity(&running, self.clock.now())
        {
            warn!(error = %e, "host activity refresh failed");
        }
    }
}

#[async_trait]
impl ScaleUpOrchestrator for GridEngineScaleUpOrchestrator {
    async fn scale_up(&self, demands: Vec<Demand>, max_batch_size: usize) -> Result<()> {
        let batch = self.batch_size.min(max_batch_size);
        if batch == 0 || demands.is_empty() {
            return Ok(());
        }
        let selected = self.select(demands, batch).await?;
        info!(workers = selected.len(), batch, "scaling up");

        let (run_ids_tx, mut run_ids) = mpsc::unbounded_channel();
        let mut launches = JoinSet::new();
        for demand in selected {
            let handler = Arc::clone(&self.handler);
            let run_ids_tx = run_ids_tx.clone();
            launches.spawn(async move { handler.scale_up(demand, run_ids_tx).await });
        }
        drop(run_ids_tx);

        let mut ticker = tokio::time::interval(self.polling_delay.max(Duration::from_millis(1)));
        ticker.tick().await;
        loop {
            tokio::select! {
                joined = launches.join_next() => match joined {
                    Some(Ok(())) => {}
                    Some(Err(e)) => warn!(error = %e, "worker launch task aborted"),
                    None => break,
                },
                _ = ticker.tick() => {
                    debug!(in_flight = launches.len(), "scale-up in progress");
                    self.refresh_running_hosts().await;
                }
            }
        }

        while let Some(run_id) = run_ids.recv().await {
            self.recorder.record(&run_id).await;
        }
        info!("scale-up batch finished");
        Ok(())
    }
}
