//! Ingesting one image from both of its streams.
//!
//! [`ingest_image`] runs two independent ingestion tasks:
//!
//! - the whole-image export, ingested as the filesystem [`WHOLE_IMAGE_NAME`]
//! - the image-save stream, whose nested layer tars each become a filesystem
//!
//! The tasks share nothing but the catalog handle, whose connection mutex
//! serializes their writes. Each runs on tokio's blocking pool, since tar
//! reading and SQLite are both synchronous. Reconciliation starts only after
//! both tasks have finished, because it needs every layer filesystem to
//! exist.
//!
//! If either task fails, the run fails. Both tasks are awaited first, and
//! then everything written during the run is deleted again, so a failed
//! run never leaves partial data behind.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::builder::{ingest_stream, IngestStats};
use crate::catalog::{Catalog, FilesystemSummary};
use crate::error::{IngestError, Result};
use crate::provider::ImageSource;
use crate::reconcile::{self, Outcome};
use crate::save::{scan_save_stream, SaveMetadata};

/// Reserved filesystem name of the whole-image export.
pub const WHOLE_IMAGE_NAME: &str = "image";

/// Outcome of a completed ingestion run.
#[derive(Debug)]
pub struct IngestReport {
    /// Resolved image id.
    pub image_id: String,
    /// The whole-image filesystem.
    pub image: IngestStats,
    /// Layers and metadata from the save stream.
    pub save: SaveMetadata,
    /// Reconciliation outcome; an error here did not fail the run.
    pub reconcile: Outcome,
}

/// Ingest the image `reference` from `source` into an empty `catalog`.
///
/// # Errors
///
/// - [`IngestError::CatalogNotEmpty`] if `catalog` already holds filesystems
/// - [`IngestError::ImageNotFound`] if `reference` does not resolve
/// - any error of either ingestion task
pub async fn ingest_image(
    source: Arc<dyn ImageSource>,
    catalog: &Catalog,
    reference: &str,
) -> Result<IngestReport> {
    if !catalog.is_empty()? {
        return Err(IngestError::CatalogNotEmpty);
    }

    let image_id = {
        let source = Arc::clone(&source);
        let reference = reference.to_owned();
        flatten(tokio::task::spawn_blocking(move || source.resolve(&reference))).await?
    };
    tracing::info!(reference, image = %image_id, "ingesting image");

    let export = {
        let source = Arc::clone(&source);
        let catalog = catalog.clone();
        let image_id = image_id.clone();
        tokio::task::spawn_blocking(move || {
            let stream = source.export_filesystem(&image_id)?;
            ingest_stream(&catalog, stream, WHOLE_IMAGE_NAME)
        })
    };
    let save = {
        let source = Arc::clone(&source);
        let catalog = catalog.clone();
        let image_id = image_id.clone();
        tokio::task::spawn_blocking(move || {
            let stream = source.save_image(&image_id)?;
            scan_save_stream(&catalog, stream)
        })
    };

    let (image, save) = match tokio::join!(flatten(export), flatten(save)) {
        (Ok(image), Ok(save)) => (image, save),
        (Err(err), _) | (_, Err(err)) => {
            tracing::error!("ingestion failed, discarding partial data: {}", err);
            if let Err(cleanup) = catalog.clear() {
                tracing::warn!("failed to discard partial data: {}", cleanup);
            }
            return Err(err);
        }
    };

    let (save, reconcile) = {
        let catalog = catalog.clone();
        flatten(tokio::task::spawn_blocking(move || -> Result<(SaveMetadata, Outcome)> {
            let outcome = reconcile::reconcile(&catalog, &save)?;
            Ok((save, outcome))
        }))
        .await?
    };
    match &reconcile {
        Ok(report) => tracing::info!(
            assigned = report.assigned.len(),
            unmatched = report.unmatched.len(),
            "reconciled layer metadata"
        ),
        Err(e) => tracing::warn!("layer metadata not assigned: {}", e),
    }

    Ok(IngestReport {
        image_id,
        image,
        save,
        reconcile,
    })
}

async fn flatten<T>(handle: JoinHandle<Result<T>>) -> Result<T> {
    handle.await?
}

/// Percentage of layer bytes that survive into the whole image.
///
/// Bytes written by one layer and overwritten or deleted by a later one are
/// counted in the layers but not in the image, which lowers the score.
/// Returns `None` without a whole-image filesystem or without layer bytes.
pub fn size_efficiency(filesystems: &[FilesystemSummary]) -> Option<f64> {
    let image = filesystems.iter().find(|fs| fs.name == WHOLE_IMAGE_NAME)?;
    let layers: u64 = filesystems
        .iter()
        .filter(|fs| fs.name != WHOLE_IMAGE_NAME)
        .map(|fs| fs.size)
        .sum();
    if layers == 0 {
        return None;
    }
    Some(image.size as f64 * 100.0 / layers as f64)
}
