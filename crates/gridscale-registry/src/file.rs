//! File-backed host registry.
//!
//! One `host|YYYY-MM-DD HH:MM:SS` line per host. The file is read once at
//! construction and rewritten through a temporary sibling after every
//! mutation, so worker age survives a daemon restart. A mutation only
//! becomes visible once its rewrite succeeded.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDateTime;
use tracing::{debug, warn};

use gridscale_core::Clock;

use crate::error::RegistryResult;
use crate::memory::MemoryHostStorage;
use crate::storage::HostStorage;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct FileHostStorage {
    path: PathBuf,
    hosts: MemoryHostStorage,
}

impl FileHostStorage {
    /// Open the registry at `path`. A missing file is an empty registry.
    pub fn open(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> RegistryResult<Self> {
        let path = path.into();
        let hosts = read_hosts(&path)?;
        debug!(path = %path.display(), hosts = hosts.len(), "host registry loaded");
        Ok(Self {
            path,
            hosts: MemoryHostStorage::with_hosts(clock, hosts),
        })
    }

    /// Apply `change` to a copy, write the copy out, then adopt it.
    fn commit(
        &mut self,
        change: impl FnOnce(&mut MemoryHostStorage) -> RegistryResult<()>,
    ) -> RegistryResult<()> {
        let mut staged = self.hosts.clone();
        change(&mut staged)?;
        write_hosts(&self.path, &staged)?;
        self.hosts = staged;
        Ok(())
    }
}

fn write_hosts(path: &Path, hosts: &MemoryHostStorage) -> RegistryResult<()> {
    let dir = path
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    for (host, timestamp) in hosts.entries() {
        writeln!(file, "{host}|{}", timestamp.format(TIMESTAMP_FORMAT))?;
    }
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn read_hosts(path: &Path) -> RegistryResult<BTreeMap<String, NaiveDateTime>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.into()),
    };
    let mut hosts = BTreeMap::new();
    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match parse_line(line) {
            Some((host, timestamp)) => {
                hosts.insert(host.to_string(), timestamp);
            }
            None => warn!(path = %path.display(), %line, "skipping malformed registry line"),
        }
    }
    Ok(hosts)
}

fn parse_line(line: &str) -> Option<(&str, NaiveDateTime)> {
    let (host, timestamp) = line.split_once('|')?;
    let host = host.trim();
    if host.is_empty() {
        return None;
    }
    let timestamp = NaiveDateTime::parse_from_str(timestamp.trim(), TIMESTAMP_FORMAT).ok()?;
    Some((host, timestamp))
}

impl HostStorage for FileHostStorage {
    fn add_host(&mut self, host: &str) -> RegistryResult<()> {
        self.commit(|hosts| hosts.add_host(host))
    }

    fn remove_host(&mut self, host: &str) -> RegistryResult<()> {
        self.commit(|hosts| hosts.remove_host(host))
    }

    fn update_hosts_activity(
        &mut self,
        hosts: &[String],
        timestamp: NaiveDateTime,
    ) -> RegistryResult<()> {
        self.commit(|registry| registry.update_hosts_activity(hosts, timestamp))
    }

    fn get_hosts_activity(
        &self,
        hosts: &[String],
    ) -> RegistryResult<HashMap<String, NaiveDateTime>> {
        self.hosts.get_hosts_activity(hosts)
    }

    fn load_hosts(&self) -> Vec<String> {
        self.hosts.load_hosts()
    }

    fn clear(&mut self) -> RegistryResult<()> {
        self.commit(|hosts| hosts.clear())
    }
}
