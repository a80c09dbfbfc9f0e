//! `GridEngine` implementation over the Grid Engine command line tools.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use gridscale_core::{CommandExecutor, ComputeResource, Demand, Job, Result};

use crate::engine::GridEngine;
use crate::parse::{self, AllocationRule};

/// Queue instance state letters that make a host unusable:
/// unknown, error, disabled, orphaned, calendar-disabled.
const BAD_HOST_STATES: &[char] = &['u', 'E', 'd', 'o', 'D'];

/// Queue-side settings of the autoscaler.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Queue whose backlog this autoscaler serves.
    pub queue: String,
    /// Jobs without an explicit queue requirement land in this queue.
    pub is_default: bool,
    /// Host group additional workers belong to.
    pub hostlist: String,
    /// Largest slot count a single instance can offer.
    pub max_instance_cores: u32,
    /// Slots the whole cluster can offer at full scale.
    pub max_cluster_cores: u32,
}

/// Talks to the queue master through `qstat`, `qhost`, `qconf`, `qmod` and `qdel`.
pub struct GridEngineClient {
    executor: Arc<dyn CommandExecutor>,
    config: QueueConfig,
}

impl GridEngineClient {
    pub fn new(executor: Arc<dyn CommandExecutor>, config: QueueConfig) -> Self {
        Self { executor, config }
    }

    fn queue_instance(&self, host: &str) -> String {
        format!("{}@{}", self.config.queue, host)
    }

    fn belongs_to_queue(&self, job: &Job) -> bool {
        if job.queues.is_empty() {
            self.config.is_default
        } else {
            job.queues.iter().any(|q| *q == self.config.queue)
        }
    }

    async fn qconf(&self, args: &[&str]) -> Result<String> {
        self.executor.execute("qconf", args).await
    }

    /// Idle slots the live cluster offers in the configured queue.
    async fn get_available_slots(&self) -> Result<u32> {
        let output = self.executor.execute("qstat", &["-g", "c"]).await?;
        parse::parse_available_slots(&output, &self.config.queue)
    }

    async fn allocation_rule_of(
        &self,
        job: &Job,
        cache: &mut HashMap<String, AllocationRule>,
    ) -> Result<AllocationRule> {
        let Some(pe) = job.pe.as_deref() else {
            return Ok(AllocationRule::PeSlots);
        };
        if let Some(rule) = cache.get(pe) {
            return Ok(*rule);
        }
        let rule = self.get_pe_allocation_rule(pe).await?;
        cache.insert(pe.to_string(), rule);
        Ok(rule)
    }
}

#[async_trait]
impl GridEngine for GridEngineClient {
    async fn get_jobs(&self) -> Vec<Job> {
        let output = match self.executor.execute("qstat", &["-u", "*", "-r", "-f"]).await {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "queue status query failed");
                return Vec::new();
            }
        };
        parse::parse_jobs(&output)
            .into_iter()
            .filter(|job| self.belongs_to_queue(job))
            .collect()
    }

    async fn is_job_valid(&self, job: &Job) -> bool {
        let rule = match self.allocation_rule_of(job, &mut HashMap::new()).await {
            Ok(rule) => rule,
            Err(e) => {
                warn!(job = %job.id, error = %e, "allocation rule lookup failed, keeping job");
                return true;
            }
        };
        let limit = if rule.is_spreadable() {
            self.config.max_cluster_cores
        } else {
            self.config.max_instance_cores
        };
        let valid = job.slots <= limit;
        if !valid {
            warn!(
                job = %job.id,
                slots = job.slots,
                limit,
                ?rule,
                "job requests more slots than any topology offers"
            );
        }
        valid
    }

    async fn get_resource_demands(&self, pending: &[Job]) -> Result<Vec<Demand>> {
        let mut available = match self.get_available_slots().await {
            Ok(slots) => slots,
            Err(e) => {
                warn!(error = %e, "idle slot query failed, assuming none");
                0
            }
        };
        let mut jobs: Vec<&Job> = pending.iter().collect();
        jobs.sort_by(|a, b| a.root_id_key().cmp(&b.root_id_key()));

        let mut rules = HashMap::new();
        let mut demands = Vec::new();
        for job in jobs {
            let rule = self.allocation_rule_of(job, &mut rules).await?;
            if !rule.is_spreadable() {
                demands.push(Demand::Integral(
                    ComputeResource::cpu(job.slots).with_owner(&job.user),
                ));
                continue;
            }
            if job.slots <= available {
                available -= job.slots;
                continue;
            }
            let unmet = job.slots - available;
            available = 0;
            demands.push(Demand::Fractional(
                ComputeResource::cpu(unmet).with_owner(&job.user),
            ));
        }
        debug!(jobs = pending.len(), demands = demands.len(), "resource demands computed");
        Ok(demands)
    }

    async fn get_pe_allocation_rule(&self, pe: &str) -> Result<AllocationRule> {
        let output = self.qconf(&["-sp", pe]).await?;
        parse::parse_allocation_rule(&output)
    }

    async fn enable_host(&self, host: &str) -> Result<()> {
        let instance = self.queue_instance(host);
        self.executor.execute("qmod", &["-e", &instance]).await?;
        Ok(())
    }

    async fn disable_host(&self, host: &str) -> Result<()> {
        let instance = self.queue_instance(host);
        self.executor.execute("qmod", &["-d", &instance]).await?;
        Ok(())
    }

    async fn delete_host(&self, host: &str, skip_on_failure: bool) -> Result<()> {
        let instance = self.queue_instance(host);
        let steps: [(&str, Vec<&str>); 5] = [
            ("shutdown execution daemon", vec!["-ke", host]),
            ("remove from queue slots", vec!["-purge", "queue", "slots", instance.as_str()]),
            (
                "remove from host group",
                vec!["-dattr", "hostgroup", "hostlist", host, self.config.hostlist.as_str()],
            ),
            ("remove administrative host", vec!["-dh", host]),
            ("remove execution host", vec!["-de", host]),
        ];
        for (step, args) in steps {
            match self.qconf(&args).await {
                Ok(_) => debug!(%host, step, "host removal step done"),
                Err(e) if skip_on_failure => {
                    warn!(%host, step, error = %e, "host removal step failed, continuing");
                }
                Err(e) => return Err(e),
            }
        }
        info!(%host, "host removed from queue configuration");
        Ok(())
    }

    async fn get_host_to_scale_down(&self, hosts: &[String]) -> Option<String> {
        let first = hosts.first()?.clone();
        let output = match self.executor.execute("qhost", &[]).await {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "host listing failed, picking first candidate");
                return Some(first);
            }
        };
        let cpus = match parse::parse_host_cpus(&output) {
            Ok(cpus) => cpus,
            Err(e) => {
                warn!(error = %e, "host listing unparsable, picking first candidate");
                return Some(first);
            }
        };
        hosts
            .iter()
            .min_by_key(|host| cpus.get(host.as_str()).copied().unwrap_or(u32::MAX))
            .cloned()
    }

    async fn is_valid(&self, host: &str) -> bool {
        match self.qconf(&["-sel"]).await {
            Ok(output) => {
                if !parse::parse_execution_hosts(&output).iter().any(|h| h == host) {
                    warn!(%host, "host is not an execution host");
                    return false;
                }
            }
            Err(e) => {
                warn!(%host, error = %e, "execution host listing failed, assuming valid");
                return true;
            }
        }
        let instance = self.queue_instance(host);
        let output = match self.executor.execute("qstat", &["-f", "-q", &instance]).await {
            Ok(output) => output,
            Err(e) => {
                warn!(%host, error = %e, "queue instance query failed, assuming valid");
                return true;
            }
        };
        match parse::parse_queue_instance_states(&output, &instance) {
            Some(states) if states.contains(BAD_HOST_STATES) => {
                warn!(%host, %states, "host is in an unusable queue state");
                false
            }
            Some(_) => true,
            None => {
                warn!(%host, "host has no instance of the queue");
                false
            }
        }
    }

    async fn kill_jobs(&self, jobs: &[Job], force: bool) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        let mut args: Vec<&str> = Vec::with_capacity(jobs.len() + 1);
        if force {
            args.push("-f");
        }
        args.extend(jobs.iter().map(|job| job.id.as_str()));
        self.executor.execute("qdel", &args).await?;
        info!(count = jobs.len(), force, "jobs killed");
        Ok(())
    }
}
