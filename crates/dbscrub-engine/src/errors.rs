use thiserror::Error;

use dbscrub_generate::GenerationError;

/// Errors that abort a scrub run.
#[derive(Debug, Error)]
pub enum ScrubError {
    #[error("integrity error while scrubbing {model}: {source}. {hint}")]
    Integrity {
        model: String,
        #[source]
        source: sqlx::Error,
        hint: String,
    },
    #[error("data error while scrubbing {model}: {source}")]
    Data {
        model: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Core(#[from] dbscrub_core::Error),
    #[error(transparent)]
    Generation(#[from] GenerationError),
}

/// SQLSTATE of a database error, if the error came from the server.
pub(crate) fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.code().map(|code| code.into_owned()),
        _ => None,
    }
}

/// Classify a failed update statement.
pub(crate) fn classify_update_error(model: &str, err: sqlx::Error, pool_size: u32) -> ScrubError {
    let code = sqlstate(&err);
    match code.as_deref() {
        Some(code) if code.starts_with("23") => ScrubError::Integrity {
            model: model.to_string(),
            source: err,
            hint: format!(
                "Consider increasing entries_per_provider (currently {pool_size}) so pooled values stay unique"
            ),
        },
        Some(code) if code.starts_with("22") => ScrubError::Data {
            model: model.to_string(),
            source: err,
        },
        _ => ScrubError::Db(err),
    }
}
