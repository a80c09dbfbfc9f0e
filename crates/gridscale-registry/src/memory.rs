//! In-memory host registry.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::NaiveDateTime;
use tracing::debug;

use gridscale_core::Clock;

use crate::error::{RegistryError, RegistryResult};
use crate::storage::HostStorage;

/// Registry held in a map. Also the working copy of [`FileHostStorage`].
///
/// [`FileHostStorage`]: crate::FileHostStorage
#[derive(Clone)]
pub struct MemoryHostStorage {
    hosts: BTreeMap<String, NaiveDateTime>,
    clock: Arc<dyn Clock>,
}

impl MemoryHostStorage {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            hosts: BTreeMap::new(),
            clock,
        }
    }

    pub(crate) fn with_hosts(clock: Arc<dyn Clock>, hosts: BTreeMap<String, NaiveDateTime>) -> Self {
        Self { hosts, clock }
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (&String, &NaiveDateTime)> {
        self.hosts.iter()
    }

    fn ensure_registered(&self, host: &str) -> RegistryResult<()> {
        if self.hosts.contains_key(host) {
            Ok(())
        } else {
            Err(RegistryError::NotFound(host.to_string()))
        }
    }
}

impl HostStorage for MemoryHostStorage {
    fn add_host(&mut self, host: &str) -> RegistryResult<()> {
        if self.hosts.contains_key(host) {
            return Err(RegistryError::AlreadyExists(host.to_string()));
        }
        self.hosts.insert(host.to_string(), self.clock.now());
        debug!(%host, "host registered");
        Ok(())
    }

    fn remove_host(&mut self, host: &str) -> RegistryResult<()> {
        self.hosts
            .remove(host)
            .ok_or_else(|| RegistryError::NotFound(host.to_string()))?;
        debug!(%host, "host unregistered");
        Ok(())
    }

    fn update_hosts_activity(
        &mut self,
        hosts: &[String],
        timestamp: NaiveDateTime,
    ) -> RegistryResult<()> {
        for host in hosts {
            self.ensure_registered(host)?;
        }
        for host in hosts {
            self.hosts.insert(host.clone(), timestamp);
        }
        Ok(())
    }

    fn get_hosts_activity(
        &self,
        hosts: &[String],
    ) -> RegistryResult<HashMap<String, NaiveDateTime>> {
        hosts
            .iter()
            .map(|host| {
                self.hosts
                    .get(host)
                    .map(|ts| (host.clone(), *ts))
                    .ok_or_else(|| RegistryError::NotFound(host.clone()))
            })
            .collect()
    }

    fn load_hosts(&self) -> Vec<String> {
        self.hosts.keys().cloned().collect()
    }

    fn clear(&mut self) -> RegistryResult<()> {
        self.hosts.clear();
        Ok(())
    }
}
