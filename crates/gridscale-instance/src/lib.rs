//! gridscale-instance — which instance types to launch for the backlog.
//!
//! The provider chain narrows the provider's catalog to the candidates a
//! worker may use; the selector then covers the pending demands with as
//! few instances as it can, one `InstanceDemand` at a time.
//!
//! # Components
//!
//! - **`convert`** — catalog entries to `Instance`
//! - **`provider`** — the catalog source and its filter chain
//! - **`selector`** — CPU-capacity selection over the filtered catalog

pub mod convert;
pub mod provider;
pub mod selector;

pub use convert::instance_from_catalog;
pub use provider::{Availability, InstanceFilter, InstanceProvider};
pub use selector::{InstanceDemands, InstanceSelector, SelectionStrategy};
