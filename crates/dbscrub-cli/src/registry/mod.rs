mod logging;
mod run;

pub use logging::{LogFormat, init_logging};
pub use run::{RunContext, RunPaths, start_run, write_report};

use thiserror::Error;

/// Errors while writing run artifacts or installing the logger.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("logging error: {0}")]
    Logging(String),
}

pub type RegistryResult<T> = std::result::Result<T, RegistryError>;
