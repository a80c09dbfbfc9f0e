//! Scripted queue for autoscaler tests.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDateTime;

use gridscale_core::{ComputeResource, Demand, GridScaleError, Job, JobState, Result};

use crate::engine::GridEngine;
use crate::parse::AllocationRule;

/// A job of `slots` slots submitted (or started) at `datetime`.
pub fn job(id: &str, state: JobState, datetime: NaiveDateTime, slots: u32) -> Job {
    Job {
        id: id.to_string(),
        root_id: id.split('.').next().unwrap_or(id).to_string(),
        name: format!("job-{id}"),
        user: "user".to_string(),
        state,
        datetime,
        hosts: Vec::new(),
        slots,
        pe: Some("local".to_string()),
        queues: vec!["main.q".to_string()],
    }
}

/// A running job placed on `hosts`.
pub fn running_job(id: &str, datetime: NaiveDateTime, hosts: &[&str]) -> Job {
    Job {
        hosts: hosts.iter().map(|h| h.to_string()).collect(),
        ..job(id, JobState::Running, datetime, 1)
    }
}

/// Queue whose job listings are served in order, the last one repeating.
///
/// Every pending job becomes an integral demand of its slot count, owned
/// by its user. Administrative calls are recorded as `"<verb> <target>"`.
#[derive(Default)]
pub struct FakeGridEngine {
    listings: Mutex<VecDeque<Vec<Job>>>,
    invalid_jobs: Mutex<HashSet<String>>,
    invalid_hosts: Mutex<HashSet<String>>,
    enable_failures: Mutex<u32>,
    calls: Mutex<Vec<String>>,
    demand_requests: Mutex<Vec<Vec<String>>>,
}

impl FakeGridEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_jobs(&self, jobs: Vec<Job>) -> &Self {
        self.listings.lock().unwrap().push_back(jobs);
        self
    }

    pub fn invalidate_job(&self, id: &str) -> &Self {
        self.invalid_jobs.lock().unwrap().insert(id.to_string());
        self
    }

    pub fn invalidate_host(&self, host: &str) -> &Self {
        self.invalid_hosts.lock().unwrap().insert(host.to_string());
        self
    }

    /// Fail the next `count` enable calls.
    pub fn fail_enables(&self, count: u32) -> &Self {
        *self.enable_failures.lock().unwrap() = count;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called(&self, call: &str) -> bool {
        self.calls.lock().unwrap().iter().any(|c| c == call)
    }

    /// Job ids of every `get_resource_demands` call.
    pub fn demand_requests(&self) -> Vec<Vec<String>> {
        self.demand_requests.lock().unwrap().clone()
    }

    fn log(&self, verb: &str, target: &str) {
        self.calls.lock().unwrap().push(format!("{verb} {target}"));
    }
}

#[async_trait]
impl GridEngine for FakeGridEngine {
    async fn get_jobs(&self) -> Vec<Job> {
        let mut listings = self.listings.lock().unwrap();
        match listings.len() {
            0 => Vec::new(),
            1 => listings.front().cloned().unwrap_or_default(),
            _ => listings.pop_front().unwrap_or_default(),
        }
    }

    async fn is_job_valid(&self, job: &Job) -> bool {
        !self.invalid_jobs.lock().unwrap().contains(&job.id)
    }

    async fn get_resource_demands(&self, pending: &[Job]) -> Result<Vec<Demand>> {
        self.demand_requests
            .lock()
            .unwrap()
            .push(pending.iter().map(|j| j.id.clone()).collect());
        Ok(pending
            .iter()
            .map(|j| Demand::Integral(ComputeResource::cpu(j.slots).with_owner(j.user.clone())))
            .collect())
    }

    async fn get_pe_allocation_rule(&self, _pe: &str) -> Result<AllocationRule> {
        Ok(AllocationRule::PeSlots)
    }

    async fn enable_host(&self, host: &str) -> Result<()> {
        {
            let mut failures = self.enable_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                self.log("enable-failed", host);
                return Err(GridScaleError::Execution {
                    command: format!("qmod -e main.q@{host}"),
                    code: Some(1),
                    stderr: "scripted failure".to_string(),
                });
            }
        }
        self.log("enable", host);
        Ok(())
    }

    async fn disable_host(&self, host: &str) -> Result<()> {
        self.log("disable", host);
        Ok(())
    }

    async fn delete_host(&self, host: &str, _skip_on_failure: bool) -> Result<()> {
        self.log("delete", host);
        Ok(())
    }

    async fn get_host_to_scale_down(&self, hosts: &[String]) -> Option<String> {
        hosts.first().cloned()
    }

    async fn is_valid(&self, host: &str) -> bool {
        !self.invalid_hosts.lock().unwrap().contains(host)
    }

    async fn kill_jobs(&self, jobs: &[Job], force: bool) -> Result<()> {
        let verb = if force { "force-kill" } else { "kill" };
        for job in jobs {
            self.log(verb, &job.id);
        }
        Ok(())
    }
}
