//! Per-filesystem directory deduplication.
//!
//! A directory can be named by an explicit directory header and again,
//! implicitly, as an ancestor of any file below it. [`DirectoryIndex`] makes
//! sure both resolve to the same catalog row: the first lookup of a
//! `(parent, name)` key creates a zero-size directory entry, later lookups
//! return the cached id.
//!
//! An index lives for exactly one filesystem's ingestion and is dropped with
//! it. It is owned by the ingesting task, so it needs no locking.

use std::collections::HashMap;

use crate::catalog::{FileId, TreeWriter};
use crate::error::Result;

/// Composite key of a directory: its parent's id and its own name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DirKey {
    parent: FileId,
    name: String,
}

/// Cache of directories already persisted for the current filesystem.
#[derive(Debug, Default)]
pub struct DirectoryIndex {
    dirs: HashMap<DirKey, FileId>,
}

impl DirectoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the directory `name` under `parent`, creating it on first use.
    pub fn resolve<W: TreeWriter>(
        &mut self,
        writer: &mut W,
        parent: FileId,
        name: &str,
    ) -> Result<FileId> {
        let key = DirKey {
            parent,
            name: name.to_owned(),
        };
        if let Some(&id) = self.dirs.get(&key) {
            return Ok(id);
        }
        let id = writer.insert_entry(parent, name, 0, true)?;
        self.dirs.insert(key, id);
        Ok(id)
    }

    /// Number of distinct directories resolved so far.
    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }
}
