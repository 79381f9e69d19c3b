use thiserror::Error;

/// Core error type shared across dbscrub crates.
#[derive(Debug, Error)]
pub enum Error {
    /// Database error or adapter failure.
    #[error("database error: {0}")]
    Db(String),
    /// Settings could not be parsed or violate invariants.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// `--model` was not given as `<app_label>.<model_name>`.
    #[error("--model should be defined as <app_label>.<model_name>, got '{0}'")]
    InvalidModelLabel(String),
    /// The requested model is not present in the registry.
    #[error("unknown model '{0}'")]
    UnknownModel(String),
    /// Catch-all error for unexpected failures.
    #[error("other error: {0}")]
    Other(String),
}

/// Convenience alias for results returned by dbscrub crates.
pub type Result<T> = std::result::Result<T, Error>;
