//! Registry handle shared between the daemon loop and concurrent launches.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::NaiveDateTime;

use gridscale_core::Job;

use crate::error::{RegistryError, RegistryResult};
use crate::storage::HostStorage;

/// Cloneable handle holding one lock around every registry call.
///
/// The lock is never held across an `.await`: each call locks, runs the
/// wrapped storage synchronously and releases.
#[derive(Clone)]
pub struct ThreadSafeHostStorage {
    inner: Arc<Mutex<Box<dyn HostStorage>>>,
}

impl ThreadSafeHostStorage {
    pub fn new(storage: impl HostStorage + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(storage))),
        }
    }

    fn lock(&self) -> RegistryResult<MutexGuard<'_, Box<dyn HostStorage>>> {
        self.inner.lock().map_err(|_| RegistryError::Poisoned)
    }

    pub fn add_host(&self, host: &str) -> RegistryResult<()> {
        self.lock()?.add_host(host)
    }

    pub fn remove_host(&self, host: &str) -> RegistryResult<()> {
        self.lock()?.remove_host(host)
    }

    pub fn update_hosts_activity(
        &self,
        hosts: &[String],
        timestamp: NaiveDateTime,
    ) -> RegistryResult<()> {
        self.lock()?.update_hosts_activity(hosts, timestamp)
    }

    pub fn update_running_jobs_host_activity(
        &self,
        jobs: &[Job],
        timestamp: NaiveDateTime,
    ) -> RegistryResult<()> {
        self.lock()?.update_running_jobs_host_activity(jobs, timestamp)
    }

    pub fn get_hosts_activity(
        &self,
        hosts: &[String],
    ) -> RegistryResult<HashMap<String, NaiveDateTime>> {
        self.lock()?.get_hosts_activity(hosts)
    }

    /// Registered hosts; empty if the lock is poisoned.
    pub fn load_hosts(&self) -> Vec<String> {
        self.lock().map(|s| s.load_hosts()).unwrap_or_default()
    }

    pub fn clear(&self) -> RegistryResult<()> {
        self.lock()?.clear()
    }
}
