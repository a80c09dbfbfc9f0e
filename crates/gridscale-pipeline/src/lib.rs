//! gridscale-pipeline — the compute control plane as seen by the autoscaler.
//!
//! # Components
//!
//! - **`api`** — run, task, instance catalog and preference lookups over HTTP
//! - **`launcher`** — launching and stopping worker runs with the `pipe` CLI
//! - **`hosts`** — name resolution entries for launched workers

pub mod api;
pub mod hosts;
pub mod launcher;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use api::{
    ApiConfig, HttpPipelineApi, InstanceTypeInfo, PipelineApi, RunInfo, RunInstance, RunStatus,
    TaskInfo, TaskStatus,
};
pub use hosts::HostsFile;
pub use launcher::{ComputeLauncher, LaunchRequest, PipeCli};
