//! Relational catalog of ingested filesystems.
//!
//! This module provides the [`Catalog`] struct, the single storage handle that
//! every ingestion task writes through and that the read surface queries.
//!
//! # Schema
//!
//! ```text
//! filesystems(id, name, command, layerOrder)
//! files(id, fileSystemId, parentFileId, fileName, totalSize, isDirectory)
//!     UNIQUE (fileSystemId, parentFileId, fileName)
//!     parentFileId -> files(id), fileSystemId -> filesystems(id)
//! ```
//!
//! The root entry of each filesystem is named `/` and has a `NULL`
//! parent. A partial unique index keeps it unique per filesystem, since SQL
//! treats `NULL` parents as distinct in the composite key.
//!
//! # Concurrency
//!
//! A `Catalog` wraps one SQLite connection in `Arc<Mutex<_>>`. Clones share
//! the connection, so concurrent ingestion tasks serialize every statement
//! through the mutex. Size rollups are single `UPDATE ... + ?` statements,
//! which makes each increment atomic with respect to the other task.
//!
//! Every statement commits on its own. File databases are opened in WAL
//! mode with `synchronous = NORMAL`, so a commit appends to the log without
//! syncing it and per-entry writes stay cheap.
//!
//! # Example
//!
//! ```
//! use layertree::Catalog;
//!
//! let catalog = Catalog::open_in_memory()?;
//! let fs = catalog.create_filesystem("image")?;
//! let root = catalog.create_root(fs)?;
//! let etc = catalog.insert_entry(fs, Some(root), "etc", 0, true)?;
//! catalog.add_to_size(etc, 42)?;
//! assert_eq!(catalog.entry(etc)?.unwrap().total_size, 42);
//! # Ok::<(), layertree::IngestError>(())
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::error::{IngestError, Result};

/// Row id of a filesystem.
pub type FilesystemId = i64;

/// Row id of a file or directory entry.
pub type FileId = i64;

/// Name of the root entry of every filesystem.
pub const ROOT_NAME: &str = "/";

const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS filesystems (
    "id" INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    "name" TEXT NOT NULL,
    "command" TEXT,
    "layerOrder" INTEGER
);

CREATE TABLE IF NOT EXISTS files (
    "id" INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    "fileSystemId" INTEGER NOT NULL,
    "parentFileId" INTEGER,
    "fileName" TEXT NOT NULL,
    "totalSize" INTEGER NOT NULL,
    "isDirectory" INTEGER NOT NULL,
    UNIQUE (fileSystemId, parentFileId, fileName),
    FOREIGN KEY (parentFileId) REFERENCES files(id),
    FOREIGN KEY (fileSystemId) REFERENCES filesystems(id)
);

CREATE UNIQUE INDEX IF NOT EXISTS files_one_root
    ON files(fileSystemId) WHERE parentFileId IS NULL;

CREATE INDEX IF NOT EXISTS files_by_parent ON files(parentFileId);
"#;

const FILE_COLUMNS: &str = "id, fileSystemId, parentFileId, fileName, totalSize, isDirectory";

/// One persisted filesystem: the whole-image export or a single layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Filesystem {
    pub id: FilesystemId,
    pub name: String,
    /// Build command that created the layer, set by reconciliation.
    pub command: Option<String>,
    /// Position in the image manifest, set by reconciliation.
    pub order: Option<i64>,
}

/// One persisted node of a filesystem tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub id: FileId,
    pub filesystem_id: FilesystemId,
    /// `None` only for the root entry.
    pub parent_id: Option<FileId>,
    pub name: String,
    /// Byte length for files; sum of all descendant files for directories.
    pub total_size: u64,
    pub is_directory: bool,
}

/// A filesystem joined with its root entry, as listed by the read surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilesystemSummary {
    pub id: FilesystemId,
    pub root_directory_id: FileId,
    /// Aggregate size of the whole tree.
    pub size: u64,
    pub name: String,
    pub command: Option<String>,
    pub order: Option<i64>,
}

/// A directory entry together with its direct children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryListing {
    pub directory: FileEntry,
    pub children: Vec<FileEntry>,
}

/// Write operations the tree builder needs, scoped to one filesystem.
///
/// The directory index and the rollup stack only see this trait, which
/// keeps them independent of SQLite.
pub trait TreeWriter {
    /// Persist a new entry under `parent` and return its id.
    fn insert_entry(
        &mut self,
        parent: FileId,
        name: &str,
        size: u64,
        is_directory: bool,
    ) -> Result<FileId>;

    /// Add `delta` bytes to the total size of entry `id`.
    fn add_to_size(&mut self, id: FileId, delta: u64) -> Result<()>;
}

/// Shared handle to the SQLite catalog.
#[derive(Debug, Clone)]
pub struct Catalog {
    conn: Arc<Mutex<Connection>>,
}

impl Catalog {
    /// Open (or create) a catalog database file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Open a private in-memory catalog.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        // In-memory databases report "memory" and keep it.
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        tracing::debug!(journal_mode = %mode, "opened catalog");
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| IngestError::CatalogPoisoned)
    }

    /// Returns true if no filesystem has been ingested yet.
    pub fn is_empty(&self) -> Result<bool> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM filesystems", [], |row| {
            row.get(0)
        })?;
        Ok(count == 0)
    }

    /// Create a filesystem row with null command and order.
    pub fn create_filesystem(&self, name: &str) -> Result<FilesystemId> {
        let conn = self.lock()?;
        conn.execute("INSERT INTO filesystems(name) VALUES (?1)", params![name])?;
        Ok(conn.last_insert_rowid())
    }

    /// Create the `/` root entry of a filesystem.
    pub fn create_root(&self, filesystem: FilesystemId) -> Result<FileId> {
        self.insert_entry(filesystem, None, ROOT_NAME, 0, true)
    }

    /// Persist one entry and return its id.
    pub fn insert_entry(
        &self,
        filesystem: FilesystemId,
        parent: Option<FileId>,
        name: &str,
        size: u64,
        is_directory: bool,
    ) -> Result<FileId> {
        let size = sql_size(size)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO files(fileSystemId, parentFileId, fileName, totalSize, isDirectory) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![filesystem, parent, name, size, is_directory],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Atomically add `delta` bytes to an entry's total size.
    pub fn add_to_size(&self, id: FileId, delta: u64) -> Result<()> {
        let delta = sql_size(delta)?;
        let conn = self.lock()?;
        conn.execute(
            "UPDATE files SET totalSize = totalSize + ?1 WHERE id = ?2",
            params![delta, id],
        )?;
        Ok(())
    }

    /// Record the creating command and manifest position of a layer.
    pub fn set_layer_metadata(
        &self,
        filesystem: FilesystemId,
        command: &str,
        order: i64,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE filesystems SET command = ?1, layerOrder = ?2 WHERE id = ?3",
            params![command, order, filesystem],
        )?;
        Ok(())
    }

    /// Delete a filesystem and every entry it owns.
    ///
    /// Used to undo a partially ingested stream.
    pub fn discard_filesystem(&self, filesystem: FilesystemId) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM files WHERE fileSystemId = ?1",
            params![filesystem],
        )?;
        tx.execute("DELETE FROM filesystems WHERE id = ?1", params![filesystem])?;
        tx.commit()?;
        Ok(())
    }

    /// Delete every filesystem and entry.
    pub fn clear(&self) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM files", [])?;
        tx.execute("DELETE FROM filesystems", [])?;
        tx.commit()?;
        Ok(())
    }

    /// All filesystems in creation order.
    pub fn filesystems(&self) -> Result<Vec<Filesystem>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT id, name, command, layerOrder FROM filesystems ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(Filesystem {
                id: row.get(0)?,
                name: row.get(1)?,
                command: row.get(2)?,
                order: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// All filesystems keyed by name.
    ///
    /// If two filesystems share a name, the one created last wins.
    pub fn filesystems_by_name(&self) -> Result<HashMap<String, Filesystem>> {
        Ok(self
            .filesystems()?
            .into_iter()
            .map(|fs| (fs.name.clone(), fs))
            .collect())
    }

    /// Filesystems with their root entry, highest layer order first.
    ///
    /// Filesystems without an order (the whole-image tree, unmatched layers)
    /// sort last.
    pub fn list_filesystems(&self) -> Result<Vec<FilesystemSummary>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT filesystems.id, files.id, files.totalSize, filesystems.name, \
                    filesystems.command, filesystems.layerOrder \
             FROM filesystems \
             INNER JOIN files ON files.fileSystemId = filesystems.id \
             WHERE files.parentFileId IS NULL \
             ORDER BY filesystems.layerOrder DESC, filesystems.id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(FilesystemSummary {
                id: row.get(0)?,
                root_directory_id: row.get(1)?,
                size: size_column(row, 2)?,
                name: row.get(3)?,
                command: row.get(4)?,
                order: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Look up a single entry.
    pub fn entry(&self, id: FileId) -> Result<Option<FileEntry>> {
        let conn = self.lock()?;
        let entry = conn
            .query_row(
                &format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?1"),
                params![id],
                file_entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// The root entry of a filesystem.
    pub fn root_of(&self, filesystem: FilesystemId) -> Result<Option<FileEntry>> {
        let conn = self.lock()?;
        let entry = conn
            .query_row(
                &format!(
                    "SELECT {FILE_COLUMNS} FROM files \
                     WHERE fileSystemId = ?1 AND parentFileId IS NULL"
                ),
                params![filesystem],
                file_entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// Direct children of an entry, largest first.
    pub fn children(&self, id: FileId) -> Result<Vec<FileEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE parentFileId = ?1 \
             ORDER BY totalSize DESC, fileName ASC"
        ))?;
        let rows = stmt.query_map(params![id], file_entry_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Every entry owned by a filesystem, in creation order.
    pub fn entries_of(&self, filesystem: FilesystemId) -> Result<Vec<FileEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE fileSystemId = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![filesystem], file_entry_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// A directory entry and its direct children.
    ///
    /// Returns `None` if `id` does not exist.
    pub fn load_directory(&self, id: FileId) -> Result<Option<DirectoryListing>> {
        let Some(directory) = self.entry(id)? else {
            return Ok(None);
        };
        let children = self.children(id)?;
        Ok(Some(DirectoryListing {
            directory,
            children,
        }))
    }
}

/// A [`TreeWriter`] bound to one filesystem of a catalog.
#[derive(Debug)]
pub struct FilesystemWriter<'c> {
    catalog: &'c Catalog,
    filesystem: FilesystemId,
}

impl<'c> FilesystemWriter<'c> {
    pub fn new(catalog: &'c Catalog, filesystem: FilesystemId) -> Self {
        Self {
            catalog,
            filesystem,
        }
    }

    pub fn filesystem(&self) -> FilesystemId {
        self.filesystem
    }
}

impl TreeWriter for FilesystemWriter<'_> {
    fn insert_entry(
        &mut self,
        parent: FileId,
        name: &str,
        size: u64,
        is_directory: bool,
    ) -> Result<FileId> {
        self.catalog
            .insert_entry(self.filesystem, Some(parent), name, size, is_directory)
    }

    fn add_to_size(&mut self, id: FileId, delta: u64) -> Result<()> {
        self.catalog.add_to_size(id, delta)
    }
}

fn sql_size(size: u64) -> Result<i64> {
    i64::try_from(size).map_err(|_| IngestError::SizeOverflow(size))
}

fn size_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(idx)?;
    u64::try_from(value).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, value))
}

fn file_entry_from_row(row: &Row<'_>) -> rusqlite::Result<FileEntry> {
    Ok(FileEntry {
        id: row.get(0)?,
        filesystem_id: row.get(1)?,
        parent_id: row.get(2)?,
        name: row.get(3)?,
        total_size: size_column(row, 4)?,
        is_directory: row.get(5)?,
    })
}
