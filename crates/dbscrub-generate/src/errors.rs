use thiserror::Error;

/// Errors emitted while filling the fake-data pool.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("unsupported faker provider '{0}'")]
    UnknownProvider(String),
    #[error("unsupported faker locale '{0}'")]
    UnknownLocale(String),
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Core(#[from] dbscrub_core::Error),
}
