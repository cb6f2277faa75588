//! Assigning build commands and order to layer filesystems.
//!
//! The image-save format lists layer archives in `manifest.json` and build
//! steps in the config's history. History also has steps that changed only
//! metadata (`empty_layer`). Once those are filtered out, entry `i` of the
//! history describes layer `i` of the manifest. Nothing in the content
//! confirms this pairing, so the lengths are checked before anything is
//! written: on a mismatch no layer is assigned at all.
//!
//! Matched layers get `command = history[i].created_by` and `order = i`.
//! Filesystems that match no manifest layer, such as the whole-image tree,
//! keep a null command and order.
//!
//! Reconciliation problems are reported as [`ReconcileError`] and never
//! abort an ingestion run.

use std::collections::HashMap;

use serde::Serialize;

use crate::catalog::{Catalog, Filesystem, FilesystemId};
use crate::coordinator::WHOLE_IMAGE_NAME;
use crate::error::Result;
use crate::save::{layer_identifier, HistoryEntry, SaveMetadata};

/// Why layer metadata could not be assigned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    #[error("save stream has no {}", crate::save::MANIFEST_NAME)]
    MissingManifest,

    #[error("save stream has no image config with a build history")]
    MissingConfig,

    #[error("manifest lists {layers} layers but the history has {history} non-empty steps")]
    LayerCountMismatch { layers: usize, history: usize },
}

/// Command and order assigned to one layer filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerAssignment {
    pub filesystem: FilesystemId,
    pub identifier: String,
    pub command: String,
    pub order: i64,
}

/// Outcome of a successful reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub assigned: Vec<LayerAssignment>,
    /// Manifest layers with no filesystem of that name.
    pub unmatched: Vec<String>,
}

/// Result of reconciling; the error side is never fatal.
pub type Outcome = std::result::Result<ReconcileReport, ReconcileError>;

/// Pair manifest layers with filtered history steps, without writing anything.
///
/// `filesystems` maps filesystem names to candidates for matching.
pub fn plan(
    manifest_layers: &[String],
    history: &[HistoryEntry],
    filesystems: &HashMap<String, Filesystem>,
) -> Outcome {
    let steps: Vec<&HistoryEntry> = history.iter().filter(|h| !h.empty_layer).collect();
    if steps.len() != manifest_layers.len() {
        return Err(ReconcileError::LayerCountMismatch {
            layers: manifest_layers.len(),
            history: steps.len(),
        });
    }

    let mut report = ReconcileReport::default();
    for (i, (layer, step)) in manifest_layers.iter().zip(steps).enumerate() {
        let identifier = layer_identifier(layer);
        match filesystems.get(identifier) {
            Some(fs) => report.assigned.push(LayerAssignment {
                filesystem: fs.id,
                identifier: identifier.to_owned(),
                command: step.created_by.clone().unwrap_or_default(),
                order: i as i64,
            }),
            None => report.unmatched.push(identifier.to_owned()),
        }
    }
    Ok(report)
}

/// Reconcile the layer filesystems in `catalog` with a scanned save stream.
///
/// The outer `Result` carries catalog failures, which are fatal. The inner
/// [`Outcome`] carries alignment problems, which are not.
pub fn reconcile(catalog: &Catalog, metadata: &SaveMetadata) -> Result<Outcome> {
    let Some(manifest) = metadata.image_manifest() else {
        return Ok(Err(ReconcileError::MissingManifest));
    };
    let Some(config) = metadata.image_config() else {
        return Ok(Err(ReconcileError::MissingConfig));
    };

    let mut candidates = catalog.filesystems_by_name()?;
    candidates.remove(WHOLE_IMAGE_NAME);

    let report = match plan(&manifest.layers, &config.history, &candidates) {
        Ok(report) => report,
        Err(e) => return Ok(Err(e)),
    };

    for assignment in &report.assigned {
        catalog.set_layer_metadata(assignment.filesystem, &assignment.command, assignment.order)?;
        tracing::debug!(
            layer = %assignment.identifier,
            order = assignment.order,
            command = %assignment.command,
            "assigned layer metadata"
        );
    }
    for identifier in &report.unmatched {
        tracing::warn!(layer = %identifier, "manifest layer has no ingested filesystem");
    }

    Ok(Ok(report))
}
