//! Queue jobs as observed in a single cycle.

use chrono::NaiveDateTime;

/// Lifecycle state of a queue job, derived from the queue's letter codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Running,
    Pending,
    Suspended,
    Error,
    Deleted,
}

impl JobState {
    /// Map a queue state code (`r`, `qw`, `Eqw`, ...) to a state.
    pub fn from_code(code: &str) -> Option<Self> {
        let state = match code {
            "r" | "t" | "Rr" | "Rt" => Self::Running,
            "qw" | "hqw" | "hRwq" => Self::Pending,
            "s" | "ts" | "S" | "tS" | "T" | "tT" | "Rs" | "Rts" | "RS" | "RtS" | "RT"
            | "RtT" => Self::Suspended,
            "Eqw" | "Ehqw" | "EhRqw" => Self::Error,
            "dr" | "dt" | "dRr" | "dRt" | "ds" | "dS" | "dT" | "dRs" | "dRS" | "dRT" => {
                Self::Deleted
            }
            _ => return None,
        };
        Some(state)
    }
}

/// A job snapshot parsed from the queue status output.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Job id, with the array task suffix (`12.3`) when applicable.
    pub id: String,
    /// Parent job id shared by all tasks of an array job.
    pub root_id: String,
    pub name: String,
    pub user: String,
    pub state: JobState,
    /// Submission time for pending jobs, start time for running ones.
    pub datetime: NaiveDateTime,
    /// Hosts the job runs on; empty while pending.
    pub hosts: Vec<String>,
    pub slots: u32,
    /// Requested parallel environment, if any.
    pub pe: Option<String>,
    /// Queue the job runs in, or the queues it explicitly requested.
    pub queues: Vec<String>,
}

impl Job {
    pub fn is_running(&self) -> bool {
        self.state == JobState::Running
    }

    pub fn is_pending(&self) -> bool {
        self.state == JobState::Pending
    }

    /// Numeric root id when it parses, used for stable ordering.
    pub fn root_id_key(&self) -> (u64, &str) {
        (self.root_id.parse().unwrap_or(u64::MAX), self.root_id.as_str())
    }
}
