//! The host registry contract.

use std::collections::{BTreeSet, HashMap};

use chrono::NaiveDateTime;

use gridscale_core::Job;

use crate::error::RegistryResult;

/// Additional hosts keyed by name, each with its last activity time.
///
/// Adding a registered host, or touching a host that is not registered,
/// is an error.
pub trait HostStorage: Send {
    /// Register `host` with the current time as its last activity.
    fn add_host(&mut self, host: &str) -> RegistryResult<()>;

    fn remove_host(&mut self, host: &str) -> RegistryResult<()>;

    fn update_hosts_activity(
        &mut self,
        hosts: &[String],
        timestamp: NaiveDateTime,
    ) -> RegistryResult<()>;

    /// Hosts to their last activity. Fails if any of `hosts` is unknown.
    fn get_hosts_activity(
        &self,
        hosts: &[String],
    ) -> RegistryResult<HashMap<String, NaiveDateTime>>;

    /// Registered host names in name order.
    fn load_hosts(&self) -> Vec<String>;

    fn clear(&mut self) -> RegistryResult<()>;

    /// Refresh the hosts `jobs` run on. Hosts that are not registered
    /// (static cluster members) are skipped.
    fn update_running_jobs_host_activity(
        &mut self,
        jobs: &[Job],
        timestamp: NaiveDateTime,
    ) -> RegistryResult<()> {
        let registered: BTreeSet<String> = self.load_hosts().into_iter().collect();
        let active: BTreeSet<&String> = jobs
            .iter()
            .flat_map(|job| job.hosts.iter())
            .filter(|host| registered.contains(*host))
            .collect();
        if active.is_empty() {
            return Ok(());
        }
        let active: Vec<String> = active.into_iter().cloned().collect();
        self.update_hosts_activity(&active, timestamp)
    }
}
