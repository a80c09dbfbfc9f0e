//! gridscale-core — shared model for the Grid Engine autoscaler.
//!
//! Holds the snapshot types every other crate exchanges:
//!
//! - **`job`** — queue jobs and their states, re-read from the queue every cycle
//! - **`resource`** — compute resources in their three roles (integral demand,
//!   fractional demand, supply)
//! - **`instance`** — instance types offered by the compute provider
//! - **`record`** — launch history that drives the availability circuit breaker
//! - **`clock`** / **`exec`** — the time and external-command seams
//!
//! Nothing in here is persisted; the host registry owns durable state.

pub mod clock;
pub mod error;
pub mod exec;
pub mod instance;
pub mod job;
pub mod record;
pub mod resource;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use clock::{Clock, SystemClock};
pub use error::{GridScaleError, Result};
pub use exec::{CommandExecutor, ShellExecutor};
pub use instance::{family_of, Instance, InstanceDemand, PriceType};
pub use job::{Job, JobState};
pub use record::{WorkerRecord, WorkerRecorder};
pub use resource::{ComputeResource, Demand, ResourceSupply};
