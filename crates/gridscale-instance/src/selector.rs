//! CPU-capacity instance selection.
//!
//! Each step simulates one instance of every candidate type against the
//! remaining demands and keeps the type that satisfies the most CPU. Ties
//! go to the type listed first. The step's fulfilled demands are dropped
//! and the remainder carries on to the next step, until nothing is left.
//! A step that satisfies nothing ends the sequence with an error.

use tracing::debug;

use gridscale_core::{Demand, GridScaleError, Instance, InstanceDemand, ResourceSupply, Result};

use crate::provider::InstanceProvider;

/// How demands are fed to the capacity simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    /// Integral demands are satisfied whole or not at all.
    CpuCapacity,
    /// Every demand is treated as fractional first.
    NaiveCpuCapacity,
    /// Naive with a batch size of one, full capacity selection otherwise.
    BackwardCompatible { batch_size: usize },
}

impl SelectionStrategy {
    fn coerces_to_fractional(self) -> bool {
        match self {
            Self::CpuCapacity => false,
            Self::NaiveCpuCapacity => true,
            Self::BackwardCompatible { batch_size } => batch_size <= 1,
        }
    }
}

/// Chooses instance types for a list of demands.
pub struct InstanceSelector {
    provider: InstanceProvider,
    reserved_cores: u32,
    strategy: SelectionStrategy,
}

impl InstanceSelector {
    pub fn new(provider: InstanceProvider, strategy: SelectionStrategy) -> Self {
        Self {
            provider,
            reserved_cores: 0,
            strategy,
        }
    }

    /// Cores of every instance withheld from queue jobs.
    pub fn with_reserved_cores(mut self, reserved_cores: u32) -> Self {
        self.reserved_cores = reserved_cores;
        self
    }

    /// Fetch the current candidates and start a selection over `demands`.
    ///
    /// The returned sequence is lazy and single-use.
    pub async fn select(&self, demands: Vec<Demand>) -> Result<InstanceDemands> {
        let instances = self.provider.provide().await?;
        let demands = if self.strategy.coerces_to_fractional() {
            demands.iter().map(Demand::to_fractional).collect()
        } else {
            demands
        };
        Ok(InstanceDemands {
            instances,
            reserved_cores: self.reserved_cores,
            remaining: demands,
            failed: false,
        })
    }
}

/// Lazy sequence of instances covering a demand list.
#[derive(Debug)]
pub struct InstanceDemands {
    instances: Vec<Instance>,
    reserved_cores: u32,
    remaining: Vec<Demand>,
    failed: bool,
}

/// What one instance would do to the remaining demands.
struct Simulation {
    fulfilled_cpu: u32,
    remaining: Vec<Demand>,
    owner: Option<String>,
}

impl InstanceDemands {
    fn simulate(&self, instance: &Instance) -> Simulation {
        let mut supply = ResourceSupply::of(instance, self.reserved_cores);
        let mut remaining = Vec::with_capacity(self.remaining.len());
        let mut fulfilled_cpu = 0;
        // Owner order is kept so equal contributions go to the first seen.
        let mut owners: Vec<(Option<String>, u32)> = Vec::new();
        for demand in &self.remaining {
            let (unmet, left) = demand.subtract(&supply);
            supply = left;
            let fulfilled = demand.cpu() - unmet.as_ref().map_or(0, Demand::cpu);
            if fulfilled > 0 {
                fulfilled_cpu += fulfilled;
                let owner = demand.owner().map(str::to_string);
                match owners.iter_mut().find(|(o, _)| *o == owner) {
                    Some((_, cpu)) => *cpu += fulfilled,
                    None => owners.push((owner, fulfilled)),
                }
            }
            remaining.extend(unmet);
        }
        let owner = owners
            .into_iter()
            .fold(None::<(Option<String>, u32)>, |best, (owner, cpu)| match best {
                Some((_, best_cpu)) if best_cpu >= cpu => best,
                _ => Some((owner, cpu)),
            })
            .and_then(|(owner, _)| owner);
        Simulation {
            fulfilled_cpu,
            remaining,
            owner,
        }
    }
}

impl Iterator for InstanceDemands {
    type Item = Result<InstanceDemand>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.remaining.is_empty() {
            return None;
        }
        let mut best: Option<(&Instance, Simulation)> = None;
        for instance in &self.instances {
            let simulation = self.simulate(instance);
            if best
                .as_ref()
                .is_none_or(|(_, b)| simulation.fulfilled_cpu > b.fulfilled_cpu)
            {
                best = Some((instance, simulation));
            }
        }
        match best {
            Some((instance, simulation)) if simulation.fulfilled_cpu > 0 => {
                let instance = instance.clone();
                debug!(
                    instance_type = %instance.name,
                    fulfilled_cpu = simulation.fulfilled_cpu,
                    remaining = simulation.remaining.len(),
                    "instance selected"
                );
                self.remaining = simulation.remaining;
                Some(Ok(InstanceDemand {
                    instance,
                    owner: simulation.owner,
                }))
            }
            _ => {
                self.failed = true;
                let cpu: u32 = self.remaining.iter().map(Demand::cpu).sum();
                Some(Err(GridScaleError::Selection(format!(
                    "no instance type among {} candidates can satisfy the remaining {cpu} cpu",
                    self.instances.len()
                ))))
            }
        }
    }
}
