//! Worker naming. A worker's host name is derived from its run id.

use gridscale_core::{GridScaleError, Result};

const HOST_PREFIX: &str = "pipeline-";

/// Host name of the worker launched as `run_id`.
pub fn host_name(run_id: &str) -> String {
    format!("{HOST_PREFIX}{run_id}")
}

/// Run id behind a worker host name.
pub fn run_id_of(host: &str) -> Result<&str> {
    host.strip_prefix(HOST_PREFIX)
        .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
        .ok_or_else(|| GridScaleError::Scaling(format!("{host} is not an additional worker")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        assert_eq!(host_name("42"), "pipeline-42");
        assert_eq!(run_id_of("pipeline-42").unwrap(), "42");
        assert!(run_id_of("master").is_err());
        assert!(run_id_of("pipeline-").is_err());
        assert!(run_id_of("pipeline-4a").is_err());
    }
}
