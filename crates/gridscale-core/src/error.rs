//! Error taxonomy shared by the autoscaler crates.

use thiserror::Error;

/// Result type alias for autoscaler operations.
pub type Result<T> = std::result::Result<T, GridScaleError>;

/// Errors raised while observing or acting on the cluster.
#[derive(Debug, Error)]
pub enum GridScaleError {
    /// An external command exited with a non-zero status.
    #[error("command `{command}` exited with code {code:?}: {stderr}")]
    Execution {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    /// External output did not have the expected shape.
    #[error("parsing error: {0}")]
    Parsing(String),

    /// A scale-up or scale-down protocol step failed.
    #[error("scaling error: {0}")]
    Scaling(String),

    /// The control API answered with a non-OK envelope.
    #[error("api error: {0}")]
    Api(String),

    /// The control API answered with a 5xx status.
    #[error("server error: {0}")]
    Server(String),

    /// The request never produced a response.
    #[error("http error: {0}")]
    Http(String),

    /// Host registry invariant violated.
    #[error("registry error: {0}")]
    Registry(String),

    /// No instance type can satisfy the remaining demand.
    #[error("selection error: {0}")]
    Selection(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

