//! gridscale-autoscale — grows and shrinks a Grid Engine cluster with its backlog.
//!
//! Each cycle the daemon first validates the additional workers it owns,
//! then lets the autoscaler decide between launching a batch of workers
//! and retiring one idle worker.
//!
//! # Decision cycle
//!
//! ```text
//! jobs = queue.get_jobs()
//! kill pending jobs no topology can run
//!
//! if pending jobs waited >= scale_up_timeout:
//!     if additional < max_additional_hosts:
//!         scale_up(demands(expired pending), max_additional_hosts - additional)
//!     else:
//!         scale_down(idle host)        // deadlock at full fleet
//! elif no pending jobs and latest running job started >= scale_down_timeout ago:
//!     scale_down(idle host)
//! ```
//!
//! # Components
//!
//! - **`recorder`** — bounded launch history for the availability filter
//! - **`scale_up`** — per-worker launch protocol and the batch orchestrator
//! - **`scale_down`** — retiring a worker without killing jobs
//! - **`validator`** — evicting workers that died behind the autoscaler's back
//! - **`autoscaler`** — the decision cycle
//! - **`daemon`** — the polling loop

pub mod autoscaler;
pub mod daemon;
pub mod recorder;
pub mod scale_down;
pub mod scale_up;
pub mod validator;
pub mod worker;

pub use autoscaler::{AutoscalerConfig, GridEngineAutoscaler, ScaleDownHandler, ScaleUpOrchestrator};
pub use daemon::Daemon;
pub use recorder::CloudPipelineWorkerRecorder;
pub use scale_down::GridEngineScaleDownHandler;
pub use scale_up::{GridEngineScaleUpHandler, GridEngineScaleUpOrchestrator, WorkerSettings};
pub use validator::GridEngineWorkerValidator;
pub use worker::{host_name, run_id_of};
