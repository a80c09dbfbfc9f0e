//! Local hosts file editing.
//!
//! The queue master resolves workers by name, so every launched worker
//! gets an `ip<TAB>name` line. Each mutation rewrites the whole file
//! through a temporary file in the same directory.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use gridscale_core::{GridScaleError, Result};

/// A hosts file shared by concurrent worker launches.
pub struct HostsFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl HostsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Map `name` to `ip`, replacing any previous entry for `name`.
    pub fn add_host(&self, name: &str, ip: &str) -> Result<()> {
        self.rewrite(|lines| {
            lines.retain(|line| !mentions(line, name));
            lines.push(format!("{ip}\t{name}"));
        })?;
        debug!(%name, %ip, "hosts file entry added");
        Ok(())
    }

    /// Drop every entry that resolves `name`.
    pub fn remove_host(&self, name: &str) -> Result<()> {
        self.rewrite(|lines| lines.retain(|line| !mentions(line, name)))?;
        debug!(%name, "hosts file entry removed");
        Ok(())
    }

    fn rewrite(&self, edit: impl FnOnce(&mut Vec<String>)) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| GridScaleError::Scaling("hosts file lock poisoned".to_string()))?;
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
        edit(&mut lines);
        write_atomically(&self.path, &lines)
    }
}

/// Whether a hosts line maps some address to `name`.
fn mentions(line: &str, name: &str) -> bool {
    let line = line.split('#').next().unwrap_or_default();
    line.split_whitespace().skip(1).any(|alias| alias == name)
}

/// Write `lines` to a temporary sibling of `path`, then rename it over `path`.
pub(crate) fn write_atomically(path: &Path, lines: &[String]) -> Result<()> {
    let dir = path.parent().filter(|d| !d.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    for line in lines {
        writeln!(file, "{line}")?;
    }
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adds_and_removes_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "127.0.0.1\tlocalhost\n# comment pipeline-101\n").unwrap();
        let hosts = HostsFile::new(&path);

        hosts.add_host("pipeline-101", "10.0.0.1").unwrap();
        hosts.add_host("pipeline-102", "10.0.0.2").unwrap();
        hosts.add_host("pipeline-101", "10.0.0.9").unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "127.0.0.1\tlocalhost\n# comment pipeline-101\n10.0.0.2\tpipeline-102\n10.0.0.9\tpipeline-101\n"
        );

        hosts.remove_host("pipeline-102").unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("pipeline-102"));
        assert!(content.contains("localhost"));
    }

    #[test]
    fn creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        HostsFile::new(&path).add_host("pipeline-101", "10.0.0.1").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "10.0.0.1\tpipeline-101\n");
    }

    #[test]
    fn ignores_prefix_matches() {
        assert!(mentions("10.0.0.1 pipeline-1 alias", "pipeline-1"));
        assert!(!mentions("10.0.0.1 pipeline-10", "pipeline-1"));
        assert!(!mentions("pipeline-1 10.0.0.1", "pipeline-1"));
    }
}
