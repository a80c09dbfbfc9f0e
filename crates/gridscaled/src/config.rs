//! gridscaled configuration file.
//!
//! ```toml
//! [queue]
//! name = "main.q"
//!
//! [instance]
//! instance_type = "m5.large"
//! region_id = 1
//!
//! [worker]
//! parent_run_id = "1"
//! image = "library/centos:7"
//!
//! [api]
//! url = "https://pipeline.example.com/pipeline/restapi/"
//! token = "..."
//! ```
//!
//! Every other key has a default. Durations are written as `"30s"`,
//! `"5m"`, `"1h"` or plain seconds.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use gridscale_core::PriceType;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub queue: QueueSection,
    #[serde(default)]
    pub scaling: ScalingSection,
    pub instance: InstanceSection,
    pub worker: WorkerSection,
    pub api: ApiSection,
    #[serde(default)]
    pub paths: PathsSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSection {
    pub name: String,
    /// Jobs without a queue requirement belong to this queue.
    #[serde(default)]
    pub default: bool,
    #[serde(default = "default_hostlist")]
    pub hostlist: String,
    /// Cores of the statically provisioned cluster members.
    #[serde(default)]
    pub static_cores: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingSection {
    pub max_additional_hosts: usize,
    pub scale_up_timeout: String,
    pub scale_down_timeout: String,
    pub idle_timeout: String,
    /// Sleep between daemon cycles.
    pub polling_timeout: String,
    pub batch_size: usize,
    /// Polling interval while a scale-up batch is in flight.
    pub polling_delay: String,
}

impl Default for ScalingSection {
    fn default() -> Self {
        Self {
            max_additional_hosts: 3,
            scale_up_timeout: "30s".to_string(),
            scale_down_timeout: "30s".to_string(),
            idle_timeout: "30s".to_string(),
            polling_timeout: "10s".to_string(),
            batch_size: 1,
            polling_delay: "10s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSection {
    /// Default instance type. Its family and size bound the candidates.
    pub instance_type: String,
    #[serde(default = "default_price_type")]
    pub price_type: String,
    pub region_id: u64,
    /// Mix instance types; otherwise probe downward from the default type.
    #[serde(default)]
    pub hybrid: bool,
    /// Restrict a hybrid pool to the default type's family.
    #[serde(default)]
    pub hybrid_family: bool,
    /// Largest instance of a hybrid pool; 0 means no cap.
    #[serde(default)]
    pub max_core_number: u32,
    #[serde(default = "default_reserved_cores")]
    pub reserved_cores: u32,
    #[serde(default = "default_unavailability_delay")]
    pub unavailability_delay: String,
    #[serde(default = "default_unavailability_count")]
    pub unavailability_count_insufficient: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSection {
    pub parent_run_id: String,
    #[serde(default = "default_disk_size")]
    pub disk_size: u32,
    pub image: String,
    #[serde(default = "default_cmd_template")]
    pub cmd_template: String,
    #[serde(default)]
    pub launch_params: BTreeMap<String, String>,
    #[serde(default = "default_owner_param_name")]
    pub owner_param_name: String,
    #[serde(default = "default_run_ready_timeout")]
    pub run_ready_timeout: String,
    #[serde(default = "default_run_init_timeout")]
    pub run_init_timeout: String,
    #[serde(default = "default_enable_attempts")]
    pub enable_attempts: u32,
    /// Set to an empty string to skip the setup task check.
    #[serde(default = "default_node_setup_task")]
    pub node_setup_task: String,
    /// `pipe` binary used to launch and stop runs.
    #[serde(default = "default_pipe")]
    pub pipe: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSection {
    pub url: String,
    pub token: String,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub hosts_file: PathBuf,
    /// Persistent host registry; in-memory when absent.
    pub host_storage: Option<PathBuf>,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            hosts_file: PathBuf::from("/etc/hosts"),
            host_storage: None,
        }
    }
}

fn default_hostlist() -> String {
    "@allhosts".to_string()
}
fn default_price_type() -> String {
    "spot".to_string()
}
fn default_reserved_cores() -> u32 {
    1
}
fn default_unavailability_delay() -> String {
    "30m".to_string()
}
fn default_unavailability_count() -> usize {
    1
}
fn default_disk_size() -> u32 {
    50
}
fn default_cmd_template() -> String {
    "sleep infinity".to_string()
}
fn default_owner_param_name() -> String {
    "CP_CAP_AUTOSCALE_OWNER".to_string()
}
fn default_run_ready_timeout() -> String {
    "15m".to_string()
}
fn default_run_init_timeout() -> String {
    "30m".to_string()
}
fn default_enable_attempts() -> u32 {
    12
}
fn default_node_setup_task() -> String {
    "SGEWorkerSetup".to_string()
}
fn default_pipe() -> String {
    "pipe".to_string()
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_delay() -> String {
    "5s".to_string()
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: DaemonConfig =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the daemon cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.queue.name.is_empty() {
            bail!("queue.name must not be empty");
        }
        if self.instance.instance_type.is_empty() {
            bail!("instance.instance_type must not be empty");
        }
        if self.api.url.is_empty() {
            bail!("api.url must not be empty");
        }
        if self.scaling.batch_size == 0 {
            bail!("scaling.batch_size must be at least 1");
        }
        if u32::try_from(self.scaling.max_additional_hosts).is_err() {
            bail!("scaling.max_additional_hosts is out of range");
        }
        self.price_type()?;
        for (key, value) in [
            ("scaling.scale_up_timeout", &self.scaling.scale_up_timeout),
            ("scaling.scale_down_timeout", &self.scaling.scale_down_timeout),
            ("scaling.idle_timeout", &self.scaling.idle_timeout),
            ("scaling.polling_timeout", &self.scaling.polling_timeout),
            ("scaling.polling_delay", &self.scaling.polling_delay),
            ("instance.unavailability_delay", &self.instance.unavailability_delay),
            ("worker.run_ready_timeout", &self.worker.run_ready_timeout),
            ("worker.run_init_timeout", &self.worker.run_init_timeout),
            ("api.retry_delay", &self.api.retry_delay),
        ] {
            parse_time_delta(value).with_context(|| format!("invalid {key}"))?;
        }
        Ok(())
    }

    pub fn price_type(&self) -> anyhow::Result<PriceType> {
        Ok(self.instance.price_type.parse()?)
    }

    /// The API base URL with a trailing slash.
    pub fn api_url(&self) -> String {
        if self.api.url.ends_with('/') {
            self.api.url.clone()
        } else {
            format!("{}/", self.api.url)
        }
    }
}

/// Parse `"30s"`, `"5m"`, `"1h"` or plain seconds.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    let (number, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(at) => s.split_at(at),
        None => (s, "s"),
    };
    let value: u64 = number
        .parse()
        .with_context(|| format!("duration {s:?} has no number"))?;
    let scale = match unit.trim() {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        other => bail!("duration {s:?} has unknown unit {other:?}"),
    };
    let secs = value
        .checked_mul(scale)
        .with_context(|| format!("duration {s:?} is too large"))?;
    Ok(Duration::from_secs(secs))
}

/// [`parse_duration`] as a signed time span for clock arithmetic.
pub fn parse_time_delta(s: &str) -> anyhow::Result<chrono::TimeDelta> {
    let duration = parse_duration(s)?;
    chrono::TimeDelta::from_std(duration).with_context(|| format!("duration {s:?} is too large"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[queue]
name = "main.q"

[instance]
instance_type = "m5.large"
region_id = 1

[worker]
parent_run_id = "1"
image = "library/centos:7"

[api]
url = "https://pipeline.example.com/pipeline/restapi"
token = "secret"
"#;

    #[test]
    fn test_parse_minimal() {
        let config: DaemonConfig = toml::from_str(MINIMAL).unwrap();
        config.validate().unwrap();
        assert_eq!(config.queue.hostlist, "@allhosts");
        assert_eq!(config.scaling.max_additional_hosts, 3);
        assert_eq!(config.instance.reserved_cores, 1);
        assert_eq!(config.worker.node_setup_task, "SGEWorkerSetup");
        assert_eq!(config.paths.hosts_file, PathBuf::from("/etc/hosts"));
        assert!(config.paths.host_storage.is_none());
        assert_eq!(config.price_type().unwrap(), PriceType::Spot);
        assert_eq!(config.api_url(), "https://pipeline.example.com/pipeline/restapi/");
    }

    #[test]
    fn test_parse_full_sections() {
        let toml_str = format!(
            "{MINIMAL}\n{}",
            r#"
[scaling]
max_additional_hosts = 5
batch_size = 2
idle_timeout = "5m"

[paths]
host_storage = "/var/lib/gridscale/hosts"
"#
        );
        let config: DaemonConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.scaling.max_additional_hosts, 5);
        assert_eq!(config.scaling.scale_up_timeout, "30s");
        assert_eq!(parse_duration(&config.scaling.idle_timeout).unwrap().as_secs(), 300);
        assert_eq!(
            config.paths.host_storage.as_deref(),
            Some(Path::new("/var/lib/gridscale/hosts"))
        );
    }

    #[test]
    fn test_bad_values_are_rejected() {
        let mut config: DaemonConfig = toml::from_str(MINIMAL).unwrap();
        config.scaling.idle_timeout = "soon".to_string();
        assert!(config.validate().is_err());

        let mut config: DaemonConfig = toml::from_str(MINIMAL).unwrap();
        config.instance.price_type = "reserved".to_string();
        assert!(config.validate().is_err());

        let mut config: DaemonConfig = toml::from_str(MINIMAL).unwrap();
        config.scaling.scale_up_timeout = format!("{}h", u64::MAX / 60);
        assert!(config.validate().is_err());

        let mut config: DaemonConfig = toml::from_str(MINIMAL).unwrap();
        config.scaling.polling_timeout = format!("{}s", u64::MAX);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gridscale.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        assert_eq!(DaemonConfig::from_file(&path).unwrap().queue.name, "main.q");
        assert!(DaemonConfig::from_file(&dir.path().join("absent.toml")).is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("m").is_err());
        assert!(parse_duration(&format!("{}m", u64::MAX)).is_err());
    }
}
