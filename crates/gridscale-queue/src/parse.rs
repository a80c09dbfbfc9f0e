//! Parsers for Grid Engine command output.
//!
//! All parsers take the raw stdout of one command. Formats:
//!
//! ```text
//! qstat -u * -r -f
//! queuename                      qtype resv/used/tot. load_avg arch          states
//! ---------------------------------------------------------------------------------
//! main.q@pipeline-101            BIP   0/2/4          0.50     lx-amd64
//!       7 0.55500 sleep.sh   alice        r     01/18/2024 10:12:45     2
//!        Full jobname:     sleep.sh
//!        Granted PE:       local 2
//!
//! ############################################################################
//!  - PENDING JOBS - PENDING JOBS - PENDING JOBS - PENDING JOBS - PENDING JOBS
//! ############################################################################
//!       8 0.00000 array.sh   bob          qw    01/18/2024 10:13:00     1 1-3:1
//!        Requested PE:     local 1
//!        Hard requested queues: main.q
//! ```

use std::collections::HashMap;

use chrono::NaiveDateTime;
use tracing::warn;

use gridscale_core::{GridScaleError, Job, JobState, Result};

const DATETIME_FORMAT: &str = "%m/%d/%Y %H:%M:%S";

/// One job line of `qstat -f` output plus the detail lines below it.
#[derive(Debug, Clone)]
struct RawJob {
    root_id: String,
    name: String,
    user: String,
    state: JobState,
    datetime: NaiveDateTime,
    slots: u32,
    tasks: Vec<String>,
    host: Option<String>,
    queue: Option<String>,
    pe: Option<String>,
    pe_slots: Option<u32>,
    requested_queues: Vec<String>,
}

impl RawJob {
    fn into_jobs(self) -> Vec<Job> {
        let slots = self.pe_slots.unwrap_or(self.slots).max(1);
        let queues = match &self.queue {
            Some(queue) => vec![queue.clone()],
            None => self.requested_queues.clone(),
        };
        let ids = if self.tasks.is_empty() {
            vec![self.root_id.clone()]
        } else {
            self.tasks
                .iter()
                .map(|task| format!("{}.{}", self.root_id, task))
                .collect()
        };
        ids.into_iter()
            .map(|id| Job {
                id,
                root_id: self.root_id.clone(),
                name: self.name.clone(),
                user: self.user.clone(),
                state: self.state,
                datetime: self.datetime,
                hosts: self.host.iter().cloned().collect(),
                slots,
                pe: self.pe.clone(),
                queues: queues.clone(),
            })
            .collect()
    }
}

/// Parse `qstat -u * -r -f` into jobs.
///
/// Array job task ranges are expanded into one job per task. Entries of a
/// job spanning several hosts are merged into a single job with all hosts.
pub fn parse_jobs(output: &str) -> Vec<Job> {
    let mut raw: Vec<RawJob> = Vec::new();
    let mut current_queue: Option<(String, String)> = None;

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty()
            || trimmed.starts_with("queuename")
            || trimmed.chars().all(|c| c == '-' || c == '#')
        {
            continue;
        }
        if trimmed.contains("PENDING JOBS") {
            current_queue = None;
            continue;
        }
        if !line.starts_with(char::is_whitespace) {
            let instance = trimmed.split_whitespace().next().unwrap_or_default();
            current_queue = instance
                .split_once('@')
                .map(|(queue, host)| (queue.to_string(), host.to_string()));
            continue;
        }
        let first = trimmed.split_whitespace().next().unwrap_or_default();
        if !first.chars().all(|c| c.is_ascii_digit()) {
            if let Some((key, value)) = trimmed.split_once(':')
                && let Some(last) = raw.last_mut()
            {
                apply_detail(last, key.trim(), value.trim());
            }
            continue;
        }
        match parse_job_line(trimmed, current_queue.as_ref()) {
            Ok(job) => raw.push(job),
            Err(e) => warn!(line = %trimmed, error = %e, "skipping unparsable job line"),
        }
    }

    merge_jobs(raw.into_iter().flat_map(RawJob::into_jobs))
}

fn parse_job_line(line: &str, queue: Option<&(String, String)>) -> Result<RawJob> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 8 {
        return Err(GridScaleError::Parsing(format!(
            "expected at least 8 columns, got {}",
            tokens.len()
        )));
    }
    let state = JobState::from_code(tokens[4])
        .ok_or_else(|| GridScaleError::Parsing(format!("unknown job state: {}", tokens[4])))?;
    let datetime = NaiveDateTime::parse_from_str(&format!("{} {}", tokens[5], tokens[6]), DATETIME_FORMAT)
        .map_err(|e| GridScaleError::Parsing(format!("bad job date: {e}")))?;
    let slots = tokens[7]
        .parse()
        .map_err(|_| GridScaleError::Parsing(format!("bad slot count: {}", tokens[7])))?;
    let tasks = match tokens.get(8) {
        Some(tasks) => expand_tasks(tasks)?,
        None => Vec::new(),
    };
    Ok(RawJob {
        root_id: tokens[0].to_string(),
        name: tokens[2].to_string(),
        user: tokens[3].to_string(),
        state,
        datetime,
        slots,
        tasks,
        host: queue.map(|(_, host)| host.clone()),
        queue: queue.map(|(queue, _)| queue.clone()),
        pe: None,
        pe_slots: None,
        requested_queues: Vec::new(),
    })
}

fn apply_detail(job: &mut RawJob, key: &str, value: &str) {
    match key {
        "Full jobname" => job.name = value.to_string(),
        "Requested PE" | "Granted PE" => {
            let mut parts = value.split_whitespace();
            job.pe = parts.next().map(str::to_string);
            let granted = parts
                .next()
                .and_then(|slots| slots.split('-').next())
                .and_then(|slots| slots.parse().ok());
            // The granted count wins over the requested range.
            if key == "Granted PE" || job.pe_slots.is_none() {
                job.pe_slots = granted;
            }
        }
        "Hard requested queues" => {
            job.requested_queues = value
                .split(',')
                .map(|q| q.trim().split('@').next().unwrap_or_default().to_string())
                .filter(|q| !q.is_empty())
                .collect();
        }
        _ => {}
    }
}

/// Expand an array task range list: `3`, `1-5:2`, `4,6,9`, or combinations.
pub fn expand_tasks(ranges: &str) -> Result<Vec<String>> {
    let bad = || GridScaleError::Parsing(format!("bad task range: {ranges}"));
    let mut tasks = Vec::new();
    for part in ranges.split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, rest)) => {
                let (end, step) = rest.split_once(':').unwrap_or((rest, "1"));
                let start: u32 = start.parse().map_err(|_| bad())?;
                let end: u32 = end.parse().map_err(|_| bad())?;
                let step: usize = step.parse().map_err(|_| bad())?;
                if step == 0 || end < start {
                    return Err(bad());
                }
                tasks.extend((start..=end).step_by(step).map(|t| t.to_string()));
            }
            None => {
                let task: u32 = part.parse().map_err(|_| bad())?;
                tasks.push(task.to_string());
            }
        }
    }
    Ok(tasks)
}

fn merge_jobs(jobs: impl Iterator<Item = Job>) -> Vec<Job> {
    let mut merged: Vec<Job> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for job in jobs {
        match index.get(&job.id) {
            Some(&i) => {
                let existing = &mut merged[i];
                for host in job.hosts {
                    if !existing.hosts.contains(&host) {
                        existing.hosts.push(host);
                    }
                }
                existing.slots = existing.slots.max(job.slots);
            }
            None => {
                index.insert(job.id.clone(), merged.len());
                merged.push(job);
            }
        }
    }
    merged
}

/// Parse `qstat -g c` and return the idle slots of `queue`.
///
/// ```text
/// CLUSTER QUEUE                   CQLOAD   USED    RES  AVAIL  TOTAL aoACDS  cdsuE
/// --------------------------------------------------------------------------------
/// main.q                            0.00      2      0      6      8      0      0
/// ```
pub fn parse_available_slots(output: &str, queue: &str) -> Result<u32> {
    let mut lines = output.lines().filter(|l| !l.trim().is_empty());
    let header = lines
        .next()
        .ok_or_else(|| GridScaleError::Parsing("empty cluster queue summary".to_string()))?;
    let header = header.replacen("CLUSTER QUEUE", "CLUSTER_QUEUE", 1);
    let avail = header
        .split_whitespace()
        .position(|h| h == "AVAIL")
        .ok_or_else(|| GridScaleError::Parsing("no AVAIL column".to_string()))?;
    for line in lines {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.first() == Some(&queue) {
            return tokens
                .get(avail)
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| GridScaleError::Parsing(format!("bad AVAIL value for {queue}")));
        }
    }
    Err(GridScaleError::Parsing(format!("queue {queue} not in cluster queue summary")))
}

/// Parse `qhost` into a hostname → CPU count map.
///
/// ```text
/// HOSTNAME                ARCH         NCPU NSOC NCOR NTHR  LOAD  MEMTOT  MEMUSE  SWAPTO  SWAPUS
/// ----------------------------------------------------------------------------------------------
/// global                  -               -    -    -    -     -       -       -       -       -
/// pipeline-101            lx-amd64        4    1    2    4  0.01    7.6G  453.1M     0.0     0.0
/// ```
pub fn parse_host_cpus(output: &str) -> Result<HashMap<String, u32>> {
    let mut lines = output.lines().filter(|l| !l.trim().is_empty());
    let header = lines
        .next()
        .ok_or_else(|| GridScaleError::Parsing("empty host listing".to_string()))?;
    let ncpu = header
        .split_whitespace()
        .position(|h| h == "NCPU")
        .ok_or_else(|| GridScaleError::Parsing("no NCPU column".to_string()))?;
    let mut cpus = HashMap::new();
    for line in lines {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() <= ncpu || tokens[0] == "global" || tokens[0].starts_with('-') {
            continue;
        }
        if let Ok(n) = tokens[ncpu].parse() {
            cpus.insert(tokens[0].to_string(), n);
        }
    }
    Ok(cpus)
}

/// Allocation rule of a parallel environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationRule {
    /// `$pe_slots`: all slots on one host.
    PeSlots,
    /// `$fill_up`: fill hosts one after another.
    FillUp,
    /// `$round_robin`: spread slots across hosts.
    RoundRobin,
    /// Fixed number of slots per host.
    Fixed(u32),
}

impl AllocationRule {
    /// Whether slots may be spread over several hosts.
    pub fn is_spreadable(self) -> bool {
        !matches!(self, Self::PeSlots)
    }
}

/// Parse the `allocation_rule` line of `qconf -sp <pe>`.
pub fn parse_allocation_rule(output: &str) -> Result<AllocationRule> {
    let value = output
        .lines()
        .find_map(|l| l.trim().strip_prefix("allocation_rule"))
        .map(str::trim)
        .ok_or_else(|| GridScaleError::Parsing("no allocation_rule in pe config".to_string()))?;
    match value {
        "$pe_slots" => Ok(AllocationRule::PeSlots),
        "$fill_up" => Ok(AllocationRule::FillUp),
        "$round_robin" => Ok(AllocationRule::RoundRobin),
        n => n
            .parse()
            .map(AllocationRule::Fixed)
            .map_err(|_| GridScaleError::Parsing(format!("unknown allocation rule: {n}"))),
    }
}

/// Parse `qconf -sel`, one execution host per line.
pub fn parse_execution_hosts(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// States column of the `queue@host` line in `qstat -f -q queue@host`.
///
/// `None` when the queue instance is absent from the output.
pub fn parse_queue_instance_states(output: &str, instance: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        (tokens.first() == Some(&instance))
            .then(|| tokens.get(5).map(|s| s.to_string()).unwrap_or_default())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const QSTAT: &str = "\
queuename                      qtype resv/used/tot. load_avg arch          states
---------------------------------------------------------------------------------
main.q@pipeline-101            BIP   0/2/4          0.50     lx-amd64
      7 0.55500 sleep.sh   alice        r     01/18/2024 10:12:45     2
       Full jobname:     sleep.sh
       Master Queue:     main.q@pipeline-101
       Granted PE:       local 2
---------------------------------------------------------------------------------
main.q@pipeline-102            BIP   0/4/4          1.00     lx-amd64
      9 0.55500 mpi.sh     carol        r     01/18/2024 10:14:00     4
       Full jobname:     mpi_long_name.sh
       Granted PE:       mpi 8
---------------------------------------------------------------------------------
main.q@pipeline-103            BIP   0/4/4          1.00     lx-amd64      d
      9 0.55500 mpi.sh     carol        r     01/18/2024 10:14:00     4
       Full jobname:     mpi_long_name.sh
       Granted PE:       mpi 8

############################################################################
 - PENDING JOBS - PENDING JOBS - PENDING JOBS - PENDING JOBS - PENDING JOBS
############################################################################
      8 0.00000 array.sh   bob          qw    01/18/2024 10:13:00     1 1-5:2
       Full jobname:     array.sh
       Requested PE:     local 1
       Hard requested queues: main.q
     10 0.00000 other.sh   dave         qw    01/18/2024 10:15:00     1
       Full jobname:     other.sh
       Hard requested queues: gpu.q@somehost
";

    #[test]
    fn parses_running_and_pending_jobs() {
        let jobs = parse_jobs(QSTAT);
        let ids: Vec<&str> = jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, ["7", "9", "8.1", "8.3", "8.5", "10"]);

        let first = &jobs[0];
        assert_eq!(first.state, JobState::Running);
        assert_eq!(first.user, "alice");
        assert_eq!(first.hosts, ["pipeline-101"]);
        assert_eq!(first.queues, ["main.q"]);
        assert_eq!(first.slots, 2);
        assert_eq!(first.pe.as_deref(), Some("local"));
    }

    #[test]
    fn merges_multi_host_jobs() {
        let jobs = parse_jobs(QSTAT);
        let mpi = jobs.iter().find(|j| j.id == "9").unwrap();
        assert_eq!(mpi.hosts, ["pipeline-102", "pipeline-103"]);
        assert_eq!(mpi.slots, 8);
        assert_eq!(mpi.name, "mpi_long_name.sh");
    }

    #[test]
    fn expands_array_tasks_with_shared_root() {
        let jobs = parse_jobs(QSTAT);
        let tasks: Vec<&Job> = jobs.iter().filter(|j| j.root_id == "8").collect();
        assert_eq!(tasks.len(), 3);
        assert!(tasks.iter().all(|j| j.is_pending() && j.hosts.is_empty()));
        assert!(tasks.iter().all(|j| j.queues == ["main.q"]));
    }

    #[test]
    fn strips_host_from_requested_queues() {
        let jobs = parse_jobs(QSTAT);
        let other = jobs.iter().find(|j| j.id == "10").unwrap();
        assert_eq!(other.queues, ["gpu.q"]);
        assert_eq!(other.pe, None);
        assert_eq!(other.slots, 1);
    }

    #[test]
    fn skips_unknown_state_lines() {
        let output = "\
main.q@pipeline-101            BIP   0/2/4          0.50     lx-amd64
      7 0.55500 sleep.sh   alice        zz    01/18/2024 10:12:45     2
      8 0.55500 sleep.sh   alice        r     01/18/2024 10:12:45     2
";
        let jobs = parse_jobs(output);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, "8");
    }

    #[test]
    fn expands_task_ranges() {
        assert_eq!(expand_tasks("3").unwrap(), ["3"]);
        assert_eq!(expand_tasks("1-5:2").unwrap(), ["1", "3", "5"]);
        assert_eq!(expand_tasks("1-3").unwrap(), ["1", "2", "3"]);
        assert_eq!(expand_tasks("4,6").unwrap(), ["4", "6"]);
        assert!(expand_tasks("5-1").is_err());
        assert!(expand_tasks("x").is_err());
    }

    #[test]
    fn parses_available_slots() {
        let output = "\
CLUSTER QUEUE                   CQLOAD   USED    RES  AVAIL  TOTAL aoACDS  cdsuE
--------------------------------------------------------------------------------
all.q                             0.00      0      0      2      2      0      0
main.q                            0.25      2      0      6      8      0      0
";
        assert_eq!(parse_available_slots(output, "main.q").unwrap(), 6);
        assert_eq!(parse_available_slots(output, "all.q").unwrap(), 2);
        assert!(parse_available_slots(output, "gpu.q").is_err());
    }

    #[test]
    fn parses_host_cpus() {
        let output = "\
HOSTNAME                ARCH         NCPU NSOC NCOR NTHR  LOAD  MEMTOT  MEMUSE  SWAPTO  SWAPUS
----------------------------------------------------------------------------------------------
global                  -               -    -    -    -     -       -       -       -       -
pipeline-101            lx-amd64        4    1    2    4  0.01    7.6G  453.1M     0.0     0.0
pipeline-102            lx-amd64       16    1    8   16  0.50   62.0G    1.2G     0.0     0.0
";
        let cpus = parse_host_cpus(output).unwrap();
        assert_eq!(cpus.len(), 2);
        assert_eq!(cpus["pipeline-101"], 4);
        assert_eq!(cpus["pipeline-102"], 16);
    }

    #[test]
    fn parses_allocation_rules() {
        let pe = "pe_name            local\nslots              999\nallocation_rule    $pe_slots\n";
        assert_eq!(parse_allocation_rule(pe).unwrap(), AllocationRule::PeSlots);
        assert_eq!(
            parse_allocation_rule("allocation_rule $round_robin").unwrap(),
            AllocationRule::RoundRobin
        );
        assert_eq!(
            parse_allocation_rule("allocation_rule $fill_up").unwrap(),
            AllocationRule::FillUp
        );
        assert_eq!(parse_allocation_rule("allocation_rule 2").unwrap(), AllocationRule::Fixed(2));
        assert!(parse_allocation_rule("slots 999").is_err());
        assert!(AllocationRule::FillUp.is_spreadable());
        assert!(!AllocationRule::PeSlots.is_spreadable());
    }

    #[test]
    fn parses_queue_instance_states() {
        let output = "\
queuename                      qtype resv/used/tot. load_avg arch          states
---------------------------------------------------------------------------------
main.q@pipeline-101            BIP   0/0/4          -NA-     lx-amd64      au
";
        assert_eq!(
            parse_queue_instance_states(output, "main.q@pipeline-101").as_deref(),
            Some("au")
        );
        assert_eq!(parse_queue_instance_states(output, "main.q@pipeline-102"), None);

        let healthy = "main.q@pipeline-101            BIP   0/0/4          0.01     lx-amd64\n";
        assert_eq!(
            parse_queue_instance_states(healthy, "main.q@pipeline-101").as_deref(),
            Some("")
        );
    }
}
