//! gridscale-registry — which additional workers exist and when they last worked.
//!
//! Every worker this autoscaler launches is registered here the moment its
//! run id is known, and its timestamp is refreshed whenever a job is seen
//! on it. Idle detection compares these timestamps against the idle timeout.
//!
//! # Components
//!
//! - **`storage`** — the `HostStorage` contract
//! - **`memory`** — plain map, lost on restart
//! - **`file`** — `host|timestamp` lines, rewritten atomically on every mutation
//! - **`shared`** — a cloneable handle serialising access from concurrent launches

pub mod error;
pub mod file;
pub mod memory;
pub mod shared;
pub mod storage;

pub use error::{RegistryError, RegistryResult};
pub use file::FileHostStorage;
pub use memory::MemoryHostStorage;
pub use shared::ThreadSafeHostStorage;
pub use storage::HostStorage;
