//! Instance types offered by the compute provider.

use std::fmt;
use std::str::FromStr;

use crate::error::GridScaleError;

/// How an instance is billed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PriceType {
    Spot,
    OnDemand,
}

impl PriceType {
    pub fn is_spot(self) -> bool {
        self == Self::Spot
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Spot => "spot",
            Self::OnDemand => "on_demand",
        }
    }
}

impl fmt::Display for PriceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PriceType {
    type Err = GridScaleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "spot" | "preemptible" => Ok(Self::Spot),
            "ondemand" => Ok(Self::OnDemand),
            other => Err(GridScaleError::Parsing(format!("unknown price type: {other}"))),
        }
    }
}

/// A catalog entry for one instance type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub name: String,
    pub price_type: PriceType,
    pub cpu: u32,
    pub gpu: u32,
    /// Memory in GiB.
    pub memory: u32,
}

impl Instance {
    /// Instance family, e.g. `m5` for `m5.large`, `n1-standard` for
    /// `n1-standard-4`, `Standard_D` for `Standard_D4s_v3`.
    pub fn family(&self) -> Option<&str> {
        family_of(&self.name)
    }
}

/// Extract the family part of an instance type name.
pub fn family_of(name: &str) -> Option<&str> {
    if let Some((family, _)) = name.split_once('.') {
        return Some(family).filter(|f| !f.is_empty());
    }
    if let Some(rest) = name.strip_prefix("Standard_") {
        let letters = rest.find(|c: char| c.is_ascii_digit())?;
        return Some(&name[.."Standard_".len() + letters]);
    }
    if let Some((family, size)) = name.rsplit_once('-')
        && size.chars().all(|c| c.is_ascii_digit())
    {
        return Some(family);
    }
    None
}

/// Launch one instance of this type on behalf of `owner`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDemand {
    pub instance: Instance,
    pub owner: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_of_provider_names() {
        assert_eq!(family_of("m5.large"), Some("m5"));
        assert_eq!(family_of("c5n.18xlarge"), Some("c5n"));
        assert_eq!(family_of("n1-standard-4"), Some("n1-standard"));
        assert_eq!(family_of("Standard_D4s_v3"), Some("Standard_D"));
        assert_eq!(family_of("custom"), None);
    }

    #[test]
    fn parses_price_types() {
        assert_eq!("spot".parse::<PriceType>().unwrap(), PriceType::Spot);
        assert_eq!("OnDemand".parse::<PriceType>().unwrap(), PriceType::OnDemand);
        assert_eq!("on_demand".parse::<PriceType>().unwrap(), PriceType::OnDemand);
        assert!("reserved".parse::<PriceType>().is_err());
    }
}
