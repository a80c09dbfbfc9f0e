//! Object graph of the daemon.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use gridscale_autoscale::{
    AutoscalerConfig, CloudPipelineWorkerRecorder, Daemon, GridEngineAutoscaler,
    GridEngineScaleDownHandler, GridEngineScaleUpHandler, GridEngineScaleUpOrchestrator,
    GridEngineWorkerValidator, WorkerSettings,
};
use gridscale_core::{
    family_of, Clock, CommandExecutor, PriceType, ShellExecutor, SystemClock, WorkerRecorder,
};
use gridscale_instance::{Availability, InstanceProvider, InstanceSelector, SelectionStrategy};
use gridscale_pipeline::{ApiConfig, ComputeLauncher, HostsFile, HttpPipelineApi, PipeCli, PipelineApi};
use gridscale_queue::{GridEngine, GridEngineClient, QueueConfig};
use gridscale_registry::{FileHostStorage, MemoryHostStorage, ThreadSafeHostStorage};

use crate::config::{DaemonConfig, parse_duration, parse_time_delta};

/// Build the registry the config asks for.
pub fn host_registry(config: &DaemonConfig, clock: Arc<dyn Clock>) -> anyhow::Result<ThreadSafeHostStorage> {
    Ok(match &config.paths.host_storage {
        Some(path) => ThreadSafeHostStorage::new(
            FileHostStorage::open(path, clock)
                .with_context(|| format!("opening host registry {}", path.display()))?,
        ),
        None => ThreadSafeHostStorage::new(MemoryHostStorage::new(clock)),
    })
}

/// Candidate instance types for `config`.
///
/// A hybrid pool keeps the default family when asked to and honours the
/// core cap. Otherwise the pool is the default type and smaller types of
/// its family, largest first.
pub fn instance_provider(
    config: &DaemonConfig,
    api: Arc<dyn PipelineApi>,
    recorder: Arc<dyn WorkerRecorder>,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<InstanceProvider> {
    let instance = &config.instance;
    let family = family_of(&instance.instance_type).map(str::to_string);
    let mut provider = InstanceProvider::catalog(api, instance.region_id, config.price_type()?);
    if instance.hybrid {
        if instance.hybrid_family
            && let Some(family) = family
        {
            provider = provider.with_family(family);
        }
        if instance.max_core_number > 0 {
            provider = provider.with_size_limit(instance.max_core_number);
        }
    } else {
        if let Some(family) = family {
            provider = provider.with_family(family);
        }
        provider = provider.with_size_limit_of(instance.instance_type.clone());
    }
    provider = provider.with_availability(Availability {
        recorder,
        clock,
        delay: parse_time_delta(&instance.unavailability_delay)?,
        threshold: instance.unavailability_count_insufficient,
    });
    if !instance.hybrid {
        provider = provider.descending();
    }
    Ok(provider)
}

fn worker_settings(config: &DaemonConfig, price_type: PriceType) -> anyhow::Result<WorkerSettings> {
    let worker = &config.worker;
    Ok(WorkerSettings {
        parent_run_id: worker.parent_run_id.clone(),
        disk_size: worker.disk_size,
        image: worker.image.clone(),
        cmd_template: worker.cmd_template.clone(),
        price_type,
        region_id: config.instance.region_id,
        launch_params: worker
            .launch_params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        owner_param_name: worker.owner_param_name.clone(),
        node_setup_task: Some(worker.node_setup_task.clone()).filter(|t| !t.is_empty()),
        polling_delay: parse_duration(&config.scaling.polling_delay)?,
        run_ready_timeout: parse_duration(&worker.run_ready_timeout)?,
        run_init_timeout: parse_duration(&worker.run_init_timeout)?,
        enable_attempts: worker.enable_attempts,
    })
}

/// Wire every component and return the daemon ready to run.
pub async fn daemon(config: &DaemonConfig) -> anyhow::Result<Daemon> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let executor: Arc<dyn CommandExecutor> = Arc::new(ShellExecutor);
    let price_type = config.price_type()?;

    let api: Arc<dyn PipelineApi> = Arc::new(HttpPipelineApi::new(ApiConfig {
        url: config.api_url(),
        token: config.api.token.clone(),
        retry_attempts: config.api.retry_attempts,
        retry_delay: parse_duration(&config.api.retry_delay)?,
    })?);
    let launcher: Arc<dyn ComputeLauncher> =
        Arc::new(PipeCli::new(executor.clone()).with_binary(config.worker.pipe.clone()));
    let recorder: Arc<dyn WorkerRecorder> = Arc::new(CloudPipelineWorkerRecorder::new(api.clone()));

    let registry = host_registry(config, clock.clone())?;
    let inherited = registry.load_hosts();
    if !inherited.is_empty() {
        info!(hosts = ?inherited, "additional hosts inherited from the registry");
    }
    let hosts_file = Arc::new(HostsFile::new(&config.paths.hosts_file));

    let candidates = instance_provider(config, api.clone(), recorder.clone(), clock.clone())?
        .provide()
        .await
        .context("loading the instance catalog")?;
    let max_instance_cores = candidates
        .iter()
        .map(|i| i.cpu.saturating_sub(config.instance.reserved_cores))
        .max()
        .unwrap_or(0);
    let max_additional_hosts = config.scaling.max_additional_hosts;
    let max_cluster_cores =
        cluster_cores(config.queue.static_cores, max_instance_cores, max_additional_hosts)?;
    info!(
        candidates = candidates.len(),
        max_instance_cores, max_cluster_cores, "instance pool loaded"
    );

    let grid_engine: Arc<dyn GridEngine> = Arc::new(GridEngineClient::new(
        executor,
        QueueConfig {
            queue: config.queue.name.clone(),
            is_default: config.queue.default,
            hostlist: config.queue.hostlist.clone(),
            max_instance_cores,
            max_cluster_cores,
        },
    ));

    let handler = Arc::new(GridEngineScaleUpHandler::new(
        launcher.clone(),
        api.clone(),
        grid_engine.clone(),
        registry.clone(),
        hosts_file.clone(),
        clock.clone(),
        worker_settings(config, price_type)?,
    ));
    let batch_size = config.scaling.batch_size;
    let selector = InstanceSelector::new(
        instance_provider(config, api.clone(), recorder.clone(), clock.clone())?,
        SelectionStrategy::BackwardCompatible { batch_size },
    )
    .with_reserved_cores(config.instance.reserved_cores);
    let orchestrator = Arc::new(GridEngineScaleUpOrchestrator::new(
        handler,
        selector,
        grid_engine.clone(),
        registry.clone(),
        recorder,
        clock.clone(),
        batch_size,
        parse_duration(&config.scaling.polling_delay)?,
    ));
    let scale_down = Arc::new(GridEngineScaleDownHandler::new(
        grid_engine.clone(),
        launcher.clone(),
        hosts_file.clone(),
        registry.clone(),
        clock.clone(),
    ));

    let autoscaler = GridEngineAutoscaler::new(
        grid_engine.clone(),
        orchestrator,
        scale_down,
        registry.clone(),
        clock,
        AutoscalerConfig {
            max_additional_hosts,
            scale_up_timeout: parse_time_delta(&config.scaling.scale_up_timeout)?,
            scale_down_timeout: parse_time_delta(&config.scaling.scale_down_timeout)?,
            idle_timeout: parse_time_delta(&config.scaling.idle_timeout)?,
        },
    );
    let validator = GridEngineWorkerValidator::new(grid_engine, api, launcher, registry, hosts_file);

    Ok(Daemon::new(
        autoscaler,
        validator,
        parse_duration(&config.scaling.polling_timeout)?,
    ))
}

/// Static cores plus every additional host at the largest instance size.
fn cluster_cores(
    static_cores: u32,
    max_instance_cores: u32,
    max_additional_hosts: usize,
) -> anyhow::Result<u32> {
    u32::try_from(max_additional_hosts)
        .ok()
        .and_then(|hosts| max_instance_cores.checked_mul(hosts))
        .and_then(|cores| cores.checked_add(static_cores))
        .with_context(|| {
            format!(
                "{max_additional_hosts} hosts of {max_instance_cores} cores \
                 plus {static_cores} static cores overflow"
            )
        })
}
