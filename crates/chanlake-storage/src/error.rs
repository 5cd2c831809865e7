use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive i/o error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("record has no usable `id` field")]
    MissingIdentifier,

    #[error("invalid archive path component {0:?}")]
    InvalidComponent(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ArchiveError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| ArchiveError::Io { path, source }
    }
}

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("run lock `{name}` is held by {holder} since {acquired_at}")]
    LockHeld {
        name: String,
        holder: String,
        acquired_at: DateTime<Utc>,
    },

    #[error("unknown relation `{0}`")]
    UnknownRelation(String),

    #[error("relation `{0}` has not been built yet")]
    MissingRelation(String),

    #[error("cannot decode {relation}.{column}: {value:?}")]
    Decode {
        relation: String,
        column: String,
        value: String,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = WarehouseError> = std::result::Result<T, E>;
