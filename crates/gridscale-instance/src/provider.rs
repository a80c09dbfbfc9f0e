//! Candidate instance types.
//!
//! A provider is a catalog source followed by an explicit, ordered chain of
//! filters, built with the `with_*` methods:
//!
//! ```text
//! catalog → family → size limit → availability → descending
//! ```

use std::fmt;
use std::sync::Arc;

use chrono::TimeDelta;
use tracing::{debug, warn};

use gridscale_core::{Clock, Instance, PriceType, Result, WorkerRecorder};
use gridscale_pipeline::PipelineApi;

use crate::convert::instance_from_catalog;

/// Where the unfiltered candidates come from.
enum Source {
    /// Instance types the control API allows in a region.
    Catalog {
        api: Arc<dyn PipelineApi>,
        region_id: u64,
        price_type: PriceType,
    },
    Fixed(Vec<Instance>),
}

/// Recent capacity failures that take an instance type out of rotation.
#[derive(Clone)]
pub struct Availability {
    pub recorder: Arc<dyn WorkerRecorder>,
    pub clock: Arc<dyn Clock>,
    /// How long a capacity failure keeps counting.
    pub delay: TimeDelta,
    /// Failures within `delay` needed to exclude a type.
    pub threshold: usize,
}

impl Availability {
    fn unavailable(&self, instance: &Instance) -> bool {
        let since = self.clock.now() - self.delay;
        let failures = self
            .recorder
            .records()
            .iter()
            .filter(|r| r.had_capacity_failure && r.instance_type == instance.name)
            .filter(|r| r.stopped_at.or(r.started_at).is_some_and(|at| at >= since))
            .count();
        failures >= self.threshold.max(1)
    }
}

/// One link of the filter chain.
#[derive(Clone)]
pub enum InstanceFilter {
    /// Keep the given family only.
    Family(String),
    /// Keep instances with at most this many CPUs.
    SizeLimit(u32),
    /// Keep instances no larger than the named one. Without the named
    /// type in the list nothing is dropped.
    SizeLimitOf(String),
    /// Drop recently unavailable types, unless that would drop them all.
    Available(Availability),
    /// Largest first.
    Descending,
}

impl fmt::Debug for InstanceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Family(family) => f.debug_tuple("Family").field(family).finish(),
            Self::SizeLimit(cpu) => f.debug_tuple("SizeLimit").field(cpu).finish(),
            Self::SizeLimitOf(name) => f.debug_tuple("SizeLimitOf").field(name).finish(),
            Self::Available(a) => f
                .debug_struct("Available")
                .field("delay", &a.delay)
                .field("threshold", &a.threshold)
                .finish(),
            Self::Descending => f.write_str("Descending"),
        }
    }
}

impl InstanceFilter {
    fn apply(&self, mut instances: Vec<Instance>) -> Vec<Instance> {
        match self {
            Self::Family(family) => {
                instances.retain(|i| i.family() == Some(family.as_str()));
                instances
            }
            Self::SizeLimit(max_cpu) => {
                instances.retain(|i| i.cpu <= *max_cpu);
                instances
            }
            Self::SizeLimitOf(name) => {
                if let Some(max_cpu) = instances.iter().find(|i| &i.name == name).map(|i| i.cpu) {
                    instances.retain(|i| i.cpu <= max_cpu);
                }
                instances
            }
            Self::Available(availability) => {
                let available: Vec<Instance> = instances
                    .iter()
                    .filter(|i| !availability.unavailable(i))
                    .cloned()
                    .collect();
                if available.is_empty() && !instances.is_empty() {
                    warn!("every candidate instance type is recently unavailable, keeping all");
                    return instances;
                }
                if available.len() < instances.len() {
                    debug!(
                        excluded = instances.len() - available.len(),
                        "unavailable instance types excluded"
                    );
                }
                available
            }
            Self::Descending => {
                instances.sort_by(|a, b| b.cpu.cmp(&a.cpu));
                instances
            }
        }
    }
}

/// A catalog source and the filters applied to it, in order.
pub struct InstanceProvider {
    source: Source,
    filters: Vec<InstanceFilter>,
}

impl InstanceProvider {
    /// Instance types the control API allows for `region_id` at `price_type`.
    pub fn catalog(api: Arc<dyn PipelineApi>, region_id: u64, price_type: PriceType) -> Self {
        Self {
            source: Source::Catalog {
                api,
                region_id,
                price_type,
            },
            filters: Vec::new(),
        }
    }

    /// A fixed list of instance types.
    pub fn fixed(instances: Vec<Instance>) -> Self {
        Self {
            source: Source::Fixed(instances),
            filters: Vec::new(),
        }
    }

    pub fn with_filter(mut self, filter: InstanceFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_family(self, family: impl Into<String>) -> Self {
        self.with_filter(InstanceFilter::Family(family.into()))
    }

    pub fn with_size_limit(self, max_cpu: u32) -> Self {
        self.with_filter(InstanceFilter::SizeLimit(max_cpu))
    }

    pub fn with_size_limit_of(self, name: impl Into<String>) -> Self {
        self.with_filter(InstanceFilter::SizeLimitOf(name.into()))
    }

    pub fn with_availability(self, availability: Availability) -> Self {
        self.with_filter(InstanceFilter::Available(availability))
    }

    pub fn descending(self) -> Self {
        self.with_filter(InstanceFilter::Descending)
    }

    pub fn filters(&self) -> &[InstanceFilter] {
        &self.filters
    }

    /// Current candidates, after every filter.
    pub async fn provide(&self) -> Result<Vec<Instance>> {
        let mut instances = match &self.source {
            Source::Catalog {
                api,
                region_id,
                price_type,
            } => api
                .get_allowed_instance_types(*region_id, price_type.is_spot())
                .await?
                .iter()
                .map(|info| instance_from_catalog(info, *price_type))
                .collect(),
            Source::Fixed(instances) => instances.clone(),
        };
        for filter in &self.filters {
            instances = filter.apply(instances);
        }
        debug!(
            candidates = instances.len(),
            names = ?instances.iter().map(|i| i.name.as_str()).collect::<Vec<_>>(),
            "instance candidates"
        );
        Ok(instances)
    }
}
