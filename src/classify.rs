//! Classification of raw tar headers.
//!
//! Every header of an image stream maps to exactly one [`EntryClass`]. Only
//! regular files and directories become catalog rows; symlinks, hardlinks,
//! devices, FIFOs and extension headers classify as [`EntryClass::Ignore`]
//! and contribute neither a row nor any bytes.
//!
//! Paths are split on `/`. Empty segments (leading `/`, trailing `/` on
//! directories, doubled separators) and `.` segments are dropped, so
//! `./etc/`, `/etc/` and `etc` all name the same directory. A path that
//! contains a `..` segment is ignored, since it could alias another entry.
//!
//! Old-style archives mark directories only by a trailing `/` on a
//! regular-file header, so such headers classify as directories.

use tar::EntryType;

/// Result of classifying one tar header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryClass<'a> {
    /// A regular file.
    RegularFile {
        /// Final path segment.
        name: &'a str,
        /// Raw byte length from the header.
        size: u64,
        /// Ancestor directory segments, root first, excluding `name`.
        dirs: Vec<&'a str>,
        /// Full path as it appeared in the header.
        path: &'a str,
    },
    /// A directory.
    Directory {
        /// Every segment of the directory path, root first.
        dirs: Vec<&'a str>,
        /// Full path as it appeared in the header.
        path: &'a str,
    },
    /// Anything else; contributes nothing.
    Ignore,
}

impl EntryClass<'_> {
    /// Ancestor directory segments that must exist before this entry is applied.
    pub fn directories(&self) -> &[&str] {
        match self {
            EntryClass::RegularFile { dirs, .. } | EntryClass::Directory { dirs, .. } => dirs,
            EntryClass::Ignore => &[],
        }
    }
}

/// Classify a header by its type flag, full path and size.
pub fn classify(entry_type: EntryType, path: &str, size: u64) -> EntryClass<'_> {
    if !entry_type.is_file() && !entry_type.is_dir() {
        return EntryClass::Ignore;
    }

    let Some(mut segments) = split_segments(path) else {
        return EntryClass::Ignore;
    };

    if entry_type.is_dir() || path.ends_with('/') {
        return EntryClass::Directory {
            dirs: segments,
            path,
        };
    }

    match segments.pop() {
        Some(name) => EntryClass::RegularFile {
            name,
            size,
            dirs: segments,
            path,
        },
        // A regular file needs a name.
        None => EntryClass::Ignore,
    }
}

/// Split a header path into its meaningful segments.
///
/// Returns `None` when the path contains a `..` component.
fn split_segments(path: &str) -> Option<Vec<&str>> {
    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return None,
            s => segments.push(s),
        }
    }
    Some(segments)
}
