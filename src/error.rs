//! Error taxonomy for collection ingestion, indexing and querying.
//!
//! Ingestion-time errors reach the caller synchronously. Build-time errors
//! never do: the job runner records them as `ERROR` status and they are
//! only observable by re-reading the collection.

use chatdocs_core::models::UnsupportedBackend;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A payload declared as an archive could not be opened.
    #[error("invalid archive '{name}': {reason}")]
    InvalidArchive { name: String, reason: String },

    /// No payload resolved to a document.
    #[error("upload contained no documents")]
    EmptyUpload,

    #[error(transparent)]
    UnsupportedBackend(#[from] UnsupportedBackend),

    /// The backend could not be reached or is not configured.
    #[error("backend '{backend}' unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    /// The collection has no index artifact (never built, still building,
    /// or failed).
    #[error("no model exists for collection {0}")]
    NoModelForCollection(i64),

    #[error("collection {0} not found")]
    NotFound(i64),

    /// Any failure while building or refreshing an index.
    #[error("index build failed for collection {collection_id}: {source}")]
    BuildFailed {
        collection_id: i64,
        #[source]
        source: anyhow::Error,
    },

    #[error("repository error: {0}")]
    Repository(#[source] anyhow::Error),

    /// The job runner refused the job (shut down).
    #[error("job queue unavailable: {0}")]
    Queue(#[source] anyhow::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn backend_unavailable(backend: impl ToString, reason: impl ToString) -> Self {
        Error::BackendUnavailable {
            backend: backend.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn build_failed(collection_id: i64, source: impl Into<anyhow::Error>) -> Self {
        Error::BuildFailed {
            collection_id,
            source: source.into(),
        }
    }

    /// Whether this error is a caller mistake rather than a server fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidArchive { .. } | Error::EmptyUpload | Error::UnsupportedBackend(_)
        )
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Repository(e.into())
    }
}
