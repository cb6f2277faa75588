//! Error types for the layertree library.
//!
//! All fallible operations return a [`Result<T>`] which is an alias for
//! `Result<T, IngestError>`.
//!
//! # Error Categories
//!
//! - **Lookup**: [`ImageNotFound`] is raised before any ingestion starts
//! - **Streams**: [`StreamRead`], [`InvalidArchive`], [`Provider`]
//! - **Storage**: [`Database`], [`SizeOverflow`], [`CatalogNotEmpty`], [`CatalogPoisoned`]
//! - **System**: [`TaskJoin`]
//!
//! Every variant is fatal to the ingestion that produced it. Problems found
//! while aligning layer metadata are reported separately as
//! [`ReconcileError`](crate::reconcile::ReconcileError) and never abort a run.
//!
//! [`ImageNotFound`]: IngestError::ImageNotFound
//! [`StreamRead`]: IngestError::StreamRead
//! [`InvalidArchive`]: IngestError::InvalidArchive
//! [`Provider`]: IngestError::Provider
//! [`Database`]: IngestError::Database
//! [`SizeOverflow`]: IngestError::SizeOverflow
//! [`CatalogNotEmpty`]: IngestError::CatalogNotEmpty
//! [`CatalogPoisoned`]: IngestError::CatalogPoisoned
//! [`TaskJoin`]: IngestError::TaskJoin
//!
//! # Conversion Traits
//!
//! `std::io::Error` converts to `StreamRead`, since every I/O in the
//! ingestion path is a read of an image stream. `rusqlite::Error` and
//! `tokio::task::JoinError` convert to their own variants so `?` works
//! throughout.

/// Result type alias for operations that may return an IngestError.
pub type Result<T> = std::result::Result<T, IngestError>;

/// Error types for image ingestion.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// No image matches the given reference.
    #[error("could not find image named {0}")]
    ImageNotFound(String),

    /// Reading a tar stream failed before its clean end.
    #[error("stream read failed: {0}")]
    StreamRead(#[from] std::io::Error),

    /// The stream was readable but its content is not what the image-save format requires.
    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    /// The container engine command failed.
    #[error("container engine error: {0}")]
    Provider(String),

    /// A catalog read or write failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A size does not fit the catalog's signed 64-bit integer column.
    #[error("size {0} exceeds the catalog's integer range")]
    SizeOverflow(u64),

    /// Ingestion requires a catalog without any filesystems.
    #[error("catalog already contains ingested filesystems")]
    CatalogNotEmpty,

    /// A writer panicked while holding the catalog connection.
    #[error("catalog connection poisoned by a panicked writer")]
    CatalogPoisoned,

    /// An ingestion task panicked or was cancelled.
    #[error("ingestion task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}
