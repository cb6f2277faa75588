//! Building one size-annotated tree from one tar stream.
//!
//! [`ingest_stream`] turns an uncompressed tar stream into a persisted
//! [`Filesystem`](crate::catalog::Filesystem):
//!
//! 1. create the filesystem row and its `/` root entry
//! 2. for each header, [`classify`] it; for files and directories resolve
//!    every ancestor through the [`DirectoryIndex`], pushing each id onto a
//!    [`RollupStack`]
//! 3. for a regular file, persist the file row, then drain the stack so
//!    every ancestor gains the file's size
//!
//! Entries are applied strictly in stream order. File content is never read;
//! the tar reader skips over it.
//!
//! A read failure other than a clean end of stream stops the ingestion. The
//! rows written so far are deleted again before the error is returned, so a
//! failed stream leaves no partial filesystem behind.
//!
//! # Example
//!
//! ```
//! use layertree::{Catalog, ingest_stream};
//!
//! let mut builder = tar::Builder::new(Vec::new());
//! let mut header = tar::Header::new_gnu();
//! header.set_size(4);
//! header.set_mode(0o644);
//! builder.append_data(&mut header, "etc/hostname", &b"box\n"[..])?;
//! let bytes = builder.into_inner()?;
//!
//! let catalog = Catalog::open_in_memory()?;
//! let stats = ingest_stream(&catalog, &bytes[..], "image")?;
//! assert_eq!(stats.files, 1);
//! assert_eq!(stats.bytes, 4);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::io::{self, Read};

use serde::Serialize;
use tar::Archive;

use crate::catalog::{Catalog, FileId, FilesystemId, FilesystemWriter, TreeWriter};
use crate::classify::{classify, EntryClass};
use crate::error::Result;
use crate::index::DirectoryIndex;
use crate::rollup::RollupStack;

/// Counters for one completed ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub filesystem: FilesystemId,
    pub name: String,
    pub root: FileId,
    /// Regular files persisted.
    pub files: u64,
    /// Distinct directories persisted, excluding the root.
    pub directories: u64,
    /// Headers that produced no row.
    pub ignored: u64,
    /// Sum of all regular file sizes; equals the root's total size.
    pub bytes: u64,
}

/// Ingest an uncompressed tar stream as a new filesystem named `name`.
///
/// The stream is read to its very end, past the tar end-of-archive marker,
/// so that a failure reported by the producer of the stream is not missed.
pub fn ingest_stream<R: Read>(catalog: &Catalog, reader: R, name: &str) -> Result<IngestStats> {
    let mut archive = Archive::new(reader);
    let stats = ingest_archive(catalog, &mut archive, name)?;
    if let Err(err) = io::copy(&mut archive.into_inner(), &mut io::sink()) {
        catalog.discard_filesystem(stats.filesystem)?;
        return Err(err.into());
    }
    Ok(stats)
}

/// Ingest an already opened archive as a new filesystem named `name`.
///
/// This is the entry point for archives nested inside another stream.
pub fn ingest_archive<R: Read>(
    catalog: &Catalog,
    archive: &mut Archive<R>,
    name: &str,
) -> Result<IngestStats> {
    let filesystem = catalog.create_filesystem(name)?;
    tracing::debug!(filesystem = name, id = filesystem, "ingesting filesystem");

    match build_tree(catalog, filesystem, archive, name) {
        Ok(stats) => {
            tracing::info!(
                filesystem = name,
                id = filesystem,
                files = stats.files,
                directories = stats.directories,
                ignored = stats.ignored,
                bytes = stats.bytes,
                "ingested filesystem"
            );
            Ok(stats)
        }
        Err(err) => {
            if let Err(cleanup) = catalog.discard_filesystem(filesystem) {
                tracing::warn!(
                    filesystem = name,
                    id = filesystem,
                    "failed to discard partial filesystem: {}",
                    cleanup
                );
            }
            Err(err)
        }
    }
}

fn build_tree<R: Read>(
    catalog: &Catalog,
    filesystem: FilesystemId,
    archive: &mut Archive<R>,
    name: &str,
) -> Result<IngestStats> {
    let root = catalog.create_root(filesystem)?;
    let mut writer = FilesystemWriter::new(catalog, filesystem);
    let mut index = DirectoryIndex::new();

    let mut stats = IngestStats {
        filesystem,
        name: name.to_owned(),
        root,
        files: 0,
        directories: 0,
        ignored: 0,
        bytes: 0,
    };

    for entry in archive.entries()? {
        let entry = entry?;
        let entry_type = entry.header().entry_type();
        let path_bytes = entry.path_bytes();
        let path = String::from_utf8_lossy(&path_bytes);

        let class = classify(entry_type, &path, entry.size());
        if class == EntryClass::Ignore {
            tracing::debug!(path = %path, ?entry_type, "ignoring entry");
            stats.ignored += 1;
            continue;
        }

        let mut stack = RollupStack::with_root(root);
        let mut parent = root;
        for dir in class.directories() {
            parent = index.resolve(&mut writer, parent, dir)?;
            stack.push(parent);
        }

        if let EntryClass::RegularFile { name, size, .. } = class {
            writer.insert_entry(parent, name, size, false)?;
            stack.drain(&mut writer, size)?;
            stats.files += 1;
            stats.bytes += size;
        }
    }

    stats.directories = index.len() as u64;
    Ok(stats)
}
