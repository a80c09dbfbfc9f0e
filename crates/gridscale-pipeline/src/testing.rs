//! Test doubles for the control API and the launcher.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use gridscale_core::{GridScaleError, Result};

use crate::api::{InstanceTypeInfo, PipelineApi, RunInfo, RunStatus, TaskInfo, TaskStatus};
use crate::launcher::{ComputeLauncher, LaunchRequest};

/// A running, initialized run with a pod IP.
pub fn ready_run(ip: &str) -> RunInfo {
    RunInfo {
        status: RunStatus::Running,
        pod_ip: Some(ip.to_string()),
        initialized: true,
        ..RunInfo::default()
    }
}

pub fn run_with_status(status: RunStatus) -> RunInfo {
    RunInfo {
        status,
        ..RunInfo::default()
    }
}

pub fn task(status: TaskStatus) -> TaskInfo {
    TaskInfo {
        status,
        log_text: None,
    }
}

pub fn instance_type(name: &str, vcpu: u32) -> InstanceTypeInfo {
    InstanceTypeInfo {
        name: name.to_string(),
        vcpu,
        gpu: 0,
        memory: f64::from(vcpu) * 4.0,
        term_type: None,
    }
}

/// Scripted control API. Run states registered for the same id are served
/// in order; the last one repeats.
#[derive(Default)]
pub struct FakePipelineApi {
    runs: Mutex<HashMap<String, VecDeque<Option<RunInfo>>>>,
    tasks: Mutex<HashMap<(String, String), Vec<TaskInfo>>>,
    instance_types: Mutex<Vec<InstanceTypeInfo>>,
    preferences: Mutex<HashMap<String, String>>,
}

impl FakePipelineApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_run(&self, run_id: &str, run: RunInfo) -> &Self {
        self.push(run_id, Some(run))
    }

    /// Make the next `load_run` of `run_id` fail with an API error.
    pub fn push_run_failure(&self, run_id: &str) -> &Self {
        self.push(run_id, None)
    }

    fn push(&self, run_id: &str, run: Option<RunInfo>) -> &Self {
        self.runs
            .lock()
            .unwrap()
            .entry(run_id.to_string())
            .or_default()
            .push_back(run);
        self
    }

    pub fn set_task(&self, run_id: &str, task: &str, logs: Vec<TaskInfo>) -> &Self {
        self.tasks
            .lock()
            .unwrap()
            .insert((run_id.to_string(), task.to_string()), logs);
        self
    }

    pub fn set_instance_types(&self, types: Vec<InstanceTypeInfo>) -> &Self {
        *self.instance_types.lock().unwrap() = types;
        self
    }

    pub fn set_preference(&self, name: &str, value: &str) -> &Self {
        self.preferences
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_string());
        self
    }
}

#[async_trait]
impl PipelineApi for FakePipelineApi {
    async fn load_run(&self, run_id: &str) -> Result<RunInfo> {
        let run = {
            let mut runs = self.runs.lock().unwrap();
            match runs.get_mut(run_id) {
                Some(queue) if queue.len() > 1 => queue.pop_front().flatten(),
                Some(queue) => queue.front().cloned().flatten(),
                None => None,
            }
        };
        run.ok_or_else(|| GridScaleError::Api(format!("run {run_id} unavailable")))
    }

    async fn load_task(&self, run_id: &str, task: &str) -> Result<Vec<TaskInfo>> {
        Ok(self
            .tasks
            .lock()
            .unwrap()
            .get(&(run_id.to_string(), task.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn get_allowed_instance_types(
        &self,
        _region_id: u64,
        _spot: bool,
    ) -> Result<Vec<InstanceTypeInfo>> {
        Ok(self.instance_types.lock().unwrap().clone())
    }

    async fn get_preference(&self, name: &str) -> Result<Option<String>> {
        Ok(self.preferences.lock().unwrap().get(name).cloned())
    }
}

/// Launcher handing out sequential run ids starting at 100.
pub struct FakeLauncher {
    next_id: AtomicU64,
    fail_launches: AtomicBool,
    launches: Mutex<Vec<LaunchRequest>>,
    stops: Mutex<Vec<String>>,
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(100),
            fail_launches: AtomicBool::new(false),
            launches: Mutex::new(Vec::new()),
            stops: Mutex::new(Vec::new()),
        }
    }
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_launches(&self, fail: bool) {
        self.fail_launches.store(fail, Ordering::SeqCst);
    }

    pub fn launches(&self) -> Vec<LaunchRequest> {
        self.launches.lock().unwrap().clone()
    }

    pub fn stops(&self) -> Vec<String> {
        self.stops.lock().unwrap().clone()
    }
}

#[async_trait]
impl ComputeLauncher for FakeLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<String> {
        if self.fail_launches.load(Ordering::SeqCst) {
            return Err(GridScaleError::Execution {
                command: "pipe run".to_string(),
                code: Some(1),
                stderr: "scripted failure".to_string(),
            });
        }
        self.launches.lock().unwrap().push(request.clone());
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst).to_string())
    }

    async fn stop(&self, run_id: &str) -> Result<()> {
        self.stops.lock().unwrap().push(run_id.to_string());
        Ok(())
    }
}
