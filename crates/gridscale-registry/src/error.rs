//! Error types for the host registry.

use thiserror::Error;

use gridscale_core::GridScaleError;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("host already registered: {0}")]
    AlreadyExists(String),

    #[error("host not registered: {0}")]
    NotFound(String),

    #[error("registry file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry lock poisoned")]
    Poisoned,
}

impl From<RegistryError> for GridScaleError {
    fn from(e: RegistryError) -> Self {
        GridScaleError::Registry(e.to_string())
    }
}
