//! Size-annotated filesystem trees of container images.
//!
//! This library ingests a container image into a relational catalog: one
//! tree for the merged filesystem of the whole image, plus one tree per
//! layer. Every directory carries the total size of all files below it, so
//! the catalog answers "where did the bytes go, and which build step put
//! them there" with plain lookups.
//!
//! # Overview
//!
//! An image is read as two uncompressed tar streams, obtained from an
//! [`ImageSource`]:
//!
//! - the filesystem export, ingested as the filesystem named `image`
//! - the image-save archive, whose nested per-layer tars are ingested one
//!   filesystem each, and whose `manifest.json` and config supply the build
//!   command of every layer
//!
//! Both streams are ingested concurrently. Once both are done, the
//! reconciler assigns each layer its command and its order in the image.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use layertree::{ingest_image, Catalog, EngineSource};
//!
//! # async fn example() -> layertree::Result<()> {
//! let catalog = Catalog::open("alpine.sqlite")?;
//! let source = Arc::new(EngineSource::new("docker"));
//! let report = ingest_image(source, &catalog, "alpine:latest").await?;
//! println!("ingested {}", report.image_id);
//!
//! for fs in catalog.list_filesystems()? {
//!     println!("{} {} {:?}", fs.name, fs.size, fs.command);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! The tree builder is layered bottom-up:
//! - [`classify`] maps each tar header to a file, a directory or nothing
//! - [`index`] creates each directory at most once per filesystem
//! - [`rollup`] adds each file's size to every ancestor exactly once
//! - [`builder`] drives one tar stream through the three
//!
//! All writes go through a [`Catalog`], a single SQLite connection shared
//! behind a mutex.
//!
//! # Command-Line Tool
//!
//! The `layertree` binary ingests images and browses the resulting catalog:
//! ```bash
//! # Ingest an image into a database file
//! layertree --database alpine.sqlite ingest alpine:latest
//!
//! # Browse it
//! layertree --database alpine.sqlite filesystems
//! layertree --database alpine.sqlite tree 1 --depth 2
//! ```

pub mod builder;
pub mod catalog;
pub mod classify;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod index;
pub mod provider;
pub mod reconcile;
pub mod rollup;
pub mod save;

// Re-export commonly used types
pub use builder::{ingest_stream, IngestStats};
pub use catalog::{
    Catalog, DirectoryListing, FileEntry, FileId, Filesystem, FilesystemId, FilesystemSummary,
};
pub use config::Config;
pub use coordinator::{ingest_image, size_efficiency, IngestReport, WHOLE_IMAGE_NAME};
pub use error::{IngestError, Result};
pub use provider::{ArchiveSource, EngineSource, ImageSource};
pub use reconcile::{ReconcileError, ReconcileReport};
