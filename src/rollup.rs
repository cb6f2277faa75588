//! Bottom-up size rollup for a single file.
//!
//! While a file's ancestors are resolved root to leaf, each directory id is
//! pushed onto a [`RollupStack`]. Once the file row exists, [`RollupStack::drain`]
//! pops every id and adds the file's size to it, so each ancestor gains the
//! bytes exactly once whether it was just created or already existed.
//!
//! A stack serves one header and is never shared across files or tasks.

use crate::catalog::{FileId, TreeWriter};
use crate::error::Result;

/// Ordered ancestor ids of the entry being applied, root first.
#[derive(Debug, Default)]
pub struct RollupStack {
    ids: Vec<FileId>,
}

impl RollupStack {
    /// Start a stack with the filesystem root at the bottom.
    pub fn with_root(root: FileId) -> Self {
        Self { ids: vec![root] }
    }

    pub fn push(&mut self, id: FileId) {
        self.ids.push(id);
    }

    pub fn pop(&mut self) -> Option<FileId> {
        self.ids.pop()
    }

    /// The deepest ancestor pushed so far.
    pub fn top(&self) -> Option<FileId> {
        self.ids.last().copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Pop every ancestor, deepest first, adding `size` to each.
    pub fn drain<W: TreeWriter>(&mut self, writer: &mut W, size: u64) -> Result<()> {
        while let Some(id) = self.pop() {
            writer.add_to_size(id, size)?;
        }
        Ok(())
    }
}
