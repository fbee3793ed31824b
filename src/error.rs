use thiserror::Error;

use crate::model::ArchiveKey;

/// Error taxonomy for the ingestion pipeline.
///
/// `NotFound`, `DecodeError` and `StoreWriteError` are recoverable at the
/// pipeline level: a single bad file or chunk never stops the run. `Fatal`
/// terminates the worker that observed it after the error sink is flushed.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("archive not found: {key}")]
    NotFound { key: ArchiveKey },

    #[error("transient network error fetching {key}: {source}")]
    TransientNetwork {
        key: ArchiveKey,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to decode archive {key}: {source}")]
    DecodeError {
        key: ArchiveKey,
        #[source]
        source: anyhow::Error,
    },

    #[error("bulk upsert failed: {source}")]
    StoreWriteError {
        #[source]
        source: anyhow::Error,
    },

    #[error("fatal ingestion error: {0}")]
    Fatal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, IngestError>;
