//! Conversions from control API catalog entries.

use gridscale_core::{Instance, PriceType};
use gridscale_pipeline::InstanceTypeInfo;

/// Convert a catalog entry offered at `price_type`. Memory is rounded to
/// whole GiB.
pub fn instance_from_catalog(info: &InstanceTypeInfo, price_type: PriceType) -> Instance {
    Instance {
        name: info.name.clone(),
        price_type,
        cpu: info.vcpu,
        gpu: info.gpu,
        memory: info.memory.max(0.0).round() as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridscale_pipeline::testing::instance_type;

    #[test]
    fn keeps_shape_and_rounds_memory() {
        let mut info = instance_type("r5.large", 2);
        info.memory = 15.6;
        let instance = instance_from_catalog(&info, PriceType::Spot);
        assert_eq!(instance.name, "r5.large");
        assert_eq!(instance.cpu, 2);
        assert_eq!(instance.memory, 16);
        assert_eq!(instance.price_type, PriceType::Spot);
    }
}
