//! gridscale-queue — the Grid Engine side of the autoscaler.
//!
//! Reads the queue backlog, classifies jobs, turns pending jobs into
//! resource demands, and administers queue hosts.
//!
//! # Components
//!
//! - **`engine`** — the `GridEngine` contract the autoscaler consumes
//! - **`client`** — `GridEngineClient`, which drives `qstat`/`qconf`/`qmod`/`qdel`
//! - **`parse`** — parsers for the text output of those commands

pub mod client;
pub mod engine;
pub mod parse;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::{GridEngineClient, QueueConfig};
pub use engine::GridEngine;
pub use parse::AllocationRule;
