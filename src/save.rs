//! Scanning of an image-save stream.
//!
//! A save stream is a tar whose entries are, in any order:
//!
//! - one nested `<layerId>/layer.tar` per layer with filesystem content
//! - `manifest.json`, listing those layer paths in build order
//! - one or more `*.json` image configs carrying the build history
//!
//! A layer whose content duplicates an earlier one is saved as a link to
//! that layer's tar. It is recorded as an empty filesystem so that it still
//! lines up with its manifest position.
//!
//! [`scan_save_stream`] walks the outer stream once. Every nested layer tar
//! is handed to the tree builder as it is found, under the first segment of
//! its path, so layer content is never buffered. The JSON entries are
//! small and are parsed into a [`SaveMetadata`] for the reconciler.

use std::io::{self, Read};

use serde::{Deserialize, Serialize};
use tar::Archive;

use crate::builder::{ingest_archive, IngestStats};
use crate::catalog::Catalog;
use crate::error::{IngestError, Result};

/// Entry name of the save manifest.
pub const MANIFEST_NAME: &str = "manifest.json";

const LAYER_SUFFIX: &str = ".tar";
const JSON_SUFFIX: &str = ".json";

/// One image described by `manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ManifestEntry {
    /// Entry name of this image's config.
    #[serde(rename = "Config", default)]
    pub config: Option<String>,
    #[serde(rename = "RepoTags", default)]
    pub repo_tags: Option<Vec<String>>,
    /// Layer archive paths, base layer first.
    #[serde(rename = "Layers", default)]
    pub layers: Vec<String>,
}

/// One step of an image's build history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct HistoryEntry {
    #[serde(default, alias = "Created")]
    pub created: Option<String>,
    #[serde(
        default,
        alias = "createdBy",
        alias = "CreatedBy",
        alias = "Created_by"
    )]
    pub created_by: Option<String>,
    /// Set for steps that changed only metadata and produced no layer.
    #[serde(
        default,
        alias = "emptyLayer",
        alias = "EmptyLayer",
        alias = "Empty_layer"
    )]
    pub empty_layer: bool,
}

/// The parts of an image config the reconciler reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ImageConfig {
    #[serde(default, alias = "History")]
    pub history: Vec<HistoryEntry>,
}

impl ImageConfig {
    /// History steps that produced a layer, in build order.
    pub fn layer_history(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.history.iter().filter(|h| !h.empty_layer)
    }
}

/// A nested layer archive found in the save stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SavedLayer {
    /// First path segment, which is also the filesystem name.
    pub identifier: String,
    /// Entry path inside the save stream.
    pub path: String,
    pub stats: IngestStats,
}

/// Everything learned from one save stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SaveMetadata {
    /// Parsed `manifest.json`, empty if the stream had none.
    pub manifest: Vec<ManifestEntry>,
    /// Configs with a non-empty history, keyed by entry name.
    pub configs: Vec<(String, ImageConfig)>,
    /// Layers in stream order.
    pub layers: Vec<SavedLayer>,
}

impl SaveMetadata {
    /// The manifest entry of the saved image.
    ///
    /// A save of a single image has exactly one.
    pub fn image_manifest(&self) -> Option<&ManifestEntry> {
        self.manifest.first()
    }

    /// The config belonging to the saved image.
    ///
    /// This is the config the manifest names. Without such a reference, a
    /// config is only chosen when it is the only one with a history.
    pub fn image_config(&self) -> Option<&ImageConfig> {
        let named = self
            .image_manifest()
            .and_then(|m| m.config.as_deref())
            .map(normalize_entry_path);
        if let Some(name) = named {
            if let Some((_, config)) = self.configs.iter().find(|(n, _)| n == name) {
                return Some(config);
            }
        }
        match self.configs.as_slice() {
            [(_, config)] => Some(config),
            _ => None,
        }
    }
}

/// The identifier of a layer archive path: its first path segment.
///
/// ```
/// use layertree::save::layer_identifier;
///
/// assert_eq!(layer_identifier("3f1c/layer.tar"), "3f1c");
/// assert_eq!(layer_identifier("./3f1c/layer.tar"), "3f1c");
/// ```
pub fn layer_identifier(path: &str) -> &str {
    let path = normalize_entry_path(path);
    path.split('/').next().unwrap_or(path)
}

fn normalize_entry_path(path: &str) -> &str {
    let mut path = path;
    loop {
        if let Some(rest) = path.strip_prefix("./") {
            path = rest;
        } else if let Some(rest) = path.strip_prefix('/') {
            path = rest;
        } else {
            return path;
        }
    }
}

/// Scan a save stream, ingesting every nested layer tar into `catalog`.
///
/// # Errors
///
/// Fails on a stream read error, on a failed layer ingestion and on a
/// `manifest.json` that is not valid. Configs that cannot be parsed are
/// skipped.
pub fn scan_save_stream<R: Read>(catalog: &Catalog, reader: R) -> Result<SaveMetadata> {
    let mut archive = Archive::new(reader);
    let mut metadata = SaveMetadata::default();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_type = entry.header().entry_type();
        let raw_path = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let path = normalize_entry_path(&raw_path).to_owned();

        if entry_type.is_symlink() || entry_type.is_hard_link() {
            if path.ends_with(LAYER_SUFFIX) {
                let target = entry
                    .link_name_bytes()
                    .map(|t| String::from_utf8_lossy(&t).into_owned())
                    .unwrap_or_default();
                tracing::debug!(
                    entry = %path,
                    target = %target,
                    "layer archive links to another layer; recording an empty filesystem"
                );
                let identifier = layer_identifier(&path).to_owned();
                let stats = ingest_archive(catalog, &mut Archive::new(io::empty()), &identifier)?;
                metadata.layers.push(SavedLayer {
                    identifier,
                    path,
                    stats,
                });
            }
            continue;
        }
        if !entry_type.is_file() {
            continue;
        }

        if path.ends_with(LAYER_SUFFIX) {
            let identifier = layer_identifier(&path).to_owned();
            let stats = ingest_archive(catalog, &mut Archive::new(&mut entry), &identifier)?;
            metadata.layers.push(SavedLayer {
                identifier,
                path,
                stats,
            });
        } else if path == MANIFEST_NAME {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            metadata.manifest = serde_json::from_slice(&buf).map_err(|e| {
                IngestError::InvalidArchive(format!("malformed {}: {}", MANIFEST_NAME, e))
            })?;
        } else if path.ends_with(JSON_SUFFIX) {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            match serde_json::from_slice::<ImageConfig>(&buf) {
                Ok(config) if !config.history.is_empty() => metadata.configs.push((path, config)),
                Ok(_) => tracing::debug!(entry = %path, "skipping JSON entry without history"),
                Err(e) => tracing::debug!(entry = %path, "skipping unparsable JSON entry: {}", e),
            }
        }
    }

    io::copy(&mut archive.into_inner(), &mut io::sink())?;

    tracing::info!(
        layers = metadata.layers.len(),
        configs = metadata.configs.len(),
        "scanned save stream"
    );
    Ok(metadata)
}
