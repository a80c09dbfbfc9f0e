//! Compute resources in their three roles.
//!
//! A `ComputeResource` is the common shape. It is wrapped as:
//!
//! - `Demand::Integral`: must be satisfied in full by a single instance
//!   (a job confined to one node).
//! - `Demand::Fractional`: may be summed across instances (a job spread
//!   over nodes, or leftover demand after the static cluster took its share).
//! - `ResourceSupply`: what one instance offers after reserving system cores.
//!
//! Subtraction clamps at zero on both sides.

use crate::instance::Instance;

/// CPU, GPU, memory (GiB) and disk (GiB), optionally attributed to a user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComputeResource {
    pub cpu: u32,
    pub gpu: u32,
    pub memory: u32,
    pub disk: u32,
    pub owner: Option<String>,
}

impl ComputeResource {
    /// A CPU-only resource.
    pub fn cpu(cpu: u32) -> Self {
        Self {
            cpu,
            ..Self::default()
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.cpu == 0 && self.gpu == 0 && self.memory == 0 && self.disk == 0
    }

    /// Whether every component of `self` is at least that of `other`.
    pub fn covers(&self, other: &ComputeResource) -> bool {
        self.cpu >= other.cpu
            && self.gpu >= other.gpu
            && self.memory >= other.memory
            && self.disk >= other.disk
    }

    /// Returns `(self - other, other - self)`, each component clamped at zero.
    ///
    /// Each side keeps its own owner.
    pub fn subtract(&self, other: &ComputeResource) -> (ComputeResource, ComputeResource) {
        let left = ComputeResource {
            cpu: self.cpu.saturating_sub(other.cpu),
            gpu: self.gpu.saturating_sub(other.gpu),
            memory: self.memory.saturating_sub(other.memory),
            disk: self.disk.saturating_sub(other.disk),
            owner: self.owner.clone(),
        };
        let right = ComputeResource {
            cpu: other.cpu.saturating_sub(self.cpu),
            gpu: other.gpu.saturating_sub(self.gpu),
            memory: other.memory.saturating_sub(self.memory),
            disk: other.disk.saturating_sub(self.disk),
            owner: other.owner.clone(),
        };
        (left, right)
    }
}

/// A resource requirement of a pending job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Demand {
    /// Satisfied only by a single instance, whole or not at all.
    Integral(ComputeResource),
    /// May be satisfied piecewise across several instances.
    Fractional(ComputeResource),
}

impl Demand {
    pub fn resource(&self) -> &ComputeResource {
        match self {
            Self::Integral(r) | Self::Fractional(r) => r,
        }
    }

    pub fn cpu(&self) -> u32 {
        self.resource().cpu
    }

    pub fn owner(&self) -> Option<&str> {
        self.resource().owner.as_deref()
    }

    pub fn is_integral(&self) -> bool {
        matches!(self, Self::Integral(_))
    }

    /// The same requirement, allowed to spread across instances.
    pub fn to_fractional(&self) -> Demand {
        Self::Fractional(self.resource().clone())
    }

    /// Apply `supply` to this demand.
    ///
    /// Returns the unmet part (`None` once fully satisfied) and the supply
    /// left over. An integral demand consumes nothing unless it fits whole.
    pub fn subtract(&self, supply: &ResourceSupply) -> (Option<Demand>, ResourceSupply) {
        match self {
            Self::Integral(demand) => {
                if supply.resource.covers(demand) {
                    let (left, _) = supply.resource.subtract(demand);
                    (None, ResourceSupply { resource: left })
                } else {
                    (Some(self.clone()), supply.clone())
                }
            }
            Self::Fractional(demand) => {
                let (unmet, left) = demand.subtract(&supply.resource);
                let unmet = (!unmet.is_empty()).then_some(Self::Fractional(unmet));
                (unmet, ResourceSupply { resource: left })
            }
        }
    }
}

/// Capacity one instance offers to queue jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSupply {
    resource: ComputeResource,
}

impl ResourceSupply {
    pub fn new(resource: ComputeResource) -> Self {
        Self { resource }
    }

    /// Supply of `instance` with `reserved_cores` withheld for the system.
    pub fn of(instance: &Instance, reserved_cores: u32) -> Self {
        Self::new(ComputeResource {
            cpu: instance.cpu.saturating_sub(reserved_cores),
            gpu: instance.gpu,
            memory: instance.memory,
            disk: 0,
            owner: None,
        })
    }

    pub fn resource(&self) -> &ComputeResource {
        &self.resource
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::PriceType;

    fn res(cpu: u32, gpu: u32, memory: u32) -> ComputeResource {
        ComputeResource {
            cpu,
            gpu,
            memory,
            disk: 0,
            owner: None,
        }
    }

    #[test]
    fn subtract_clamps_both_sides() {
        let pairs = [
            (res(4, 0, 16), res(2, 1, 32)),
            (res(0, 0, 0), res(8, 2, 64)),
            (res(8, 2, 64), res(0, 0, 0)),
            (res(3, 3, 3), res(3, 3, 3)),
        ];
        for (a, b) in pairs {
            let (left, right) = a.subtract(&b);
            assert_eq!(left.cpu, a.cpu.saturating_sub(b.cpu));
            assert_eq!(right.cpu, b.cpu.saturating_sub(a.cpu));
            assert_eq!(left.gpu, a.gpu.saturating_sub(b.gpu));
            assert_eq!(right.memory, b.memory.saturating_sub(a.memory));
            // Components are never both positive after a subtraction.
            assert!(left.cpu == 0 || right.cpu == 0);
        }
    }

    #[test]
    fn integral_demand_is_all_or_nothing() {
        let demand = Demand::Integral(ComputeResource::cpu(4).with_owner("alice"));

        let small = ResourceSupply::new(ComputeResource::cpu(3));
        let (unmet, left) = demand.subtract(&small);
        assert_eq!(unmet, Some(demand.clone()));
        assert_eq!(left, small);

        let big = ResourceSupply::new(ComputeResource::cpu(6));
        let (unmet, left) = demand.subtract(&big);
        assert_eq!(unmet, None);
        assert_eq!(left.resource().cpu, 2);
    }

    #[test]
    fn fractional_demand_is_partially_fulfilled() {
        let demand = Demand::Fractional(ComputeResource::cpu(10).with_owner("bob"));
        let supply = ResourceSupply::new(ComputeResource::cpu(4));

        let (unmet, left) = demand.subtract(&supply);
        let unmet = unmet.unwrap();
        assert_eq!(unmet.cpu(), 6);
        assert_eq!(unmet.owner(), Some("bob"));
        assert!(!unmet.is_integral());
        assert_eq!(left.resource().cpu, 0);
    }

    #[test]
    fn supply_reserves_system_cores() {
        let instance = Instance {
            name: "m5.xlarge".to_string(),
            price_type: PriceType::Spot,
            cpu: 4,
            gpu: 0,
            memory: 16,
        };
        assert_eq!(ResourceSupply::of(&instance, 1).resource().cpu, 3);
        assert_eq!(ResourceSupply::of(&instance, 8).resource().cpu, 0);
    }
}
