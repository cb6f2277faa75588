//! Integration tests for image ingestion
//!
//! Most tests synthesize tar streams in memory with `tar::Builder` and run
//! them through the public API, checking the invariants of the resulting
//! trees. The engine test at the end needs a running docker daemon and is
//! ignored by default.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::{self, Read};
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use anyhow::{Context, Result};
use layertree::{
    ingest_image, ingest_stream, ArchiveSource, Catalog, EngineSource, FileEntry, FilesystemId,
    IngestError, WHOLE_IMAGE_NAME,
};
use tar::{Builder, EntryType, Header};
use tempfile::TempDir;

/// One entry of a synthesized tar stream.
#[derive(Clone, Copy)]
enum Entry<'a> {
    File(&'a str, u64),
    Dir(&'a str),
    Symlink(&'a str, &'a str),
    Hardlink(&'a str, &'a str),
}

fn build_tar(entries: &[Entry<'_>]) -> Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());
    for entry in entries {
        let mut header = Header::new_gnu();
        header.set_mode(0o755);
        header.set_size(0);
        match *entry {
            Entry::File(path, size) => {
                header.set_entry_type(EntryType::Regular);
                header.set_size(size);
                builder.append_data(&mut header, path, io::repeat(0).take(size))?;
            }
            Entry::Dir(path) => {
                header.set_entry_type(EntryType::Directory);
                builder.append_data(&mut header, path, io::empty())?;
            }
            Entry::Symlink(path, target) => {
                header.set_entry_type(EntryType::Symlink);
                builder.append_link(&mut header, path, target)?;
            }
            Entry::Hardlink(path, target) => {
                header.set_entry_type(EntryType::Link);
                builder.append_link(&mut header, path, target)?;
            }
        }
    }
    Ok(builder.into_inner()?)
}

fn build_tar_of_blobs(blobs: &[(&str, &[u8])]) -> Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());
    for (path, data) in blobs {
        let mut header = Header::new_gnu();
        header.set_mode(0o644);
        header.set_size(data.len() as u64);
        builder.append_data(&mut header, path, *data)?;
    }
    Ok(builder.into_inner()?)
}

/// Full path of every entry of a filesystem, mapped to (size, is_directory).
fn tree_of(catalog: &Catalog, fs: FilesystemId) -> Result<BTreeMap<String, (u64, bool)>> {
    let entries = catalog.entries_of(fs)?;
    let mut paths = BTreeMap::new();
    for entry in &entries {
        paths.insert(path_of(&entries, entry), (entry.total_size, entry.is_directory));
    }
    Ok(paths)
}

fn path_of(entries: &[FileEntry], entry: &FileEntry) -> String {
    match entry.parent_id {
        None => String::new(),
        Some(parent) => {
            let parent = entries.iter().find(|e| e.id == parent).unwrap();
            format!("{}/{}", path_of(entries, parent), entry.name)
        }
    }
}

/// Check every directory's size against its direct children, recursively.
fn assert_sizes_consistent(catalog: &Catalog, entry: &FileEntry) -> Result<()> {
    let children = catalog.children(entry.id)?;
    if entry.is_directory {
        let sum: u64 = children.iter().map(|c| c.total_size).sum();
        assert_eq!(entry.total_size, sum, "directory {} ({})", entry.name, entry.id);
    } else {
        assert!(children.is_empty(), "file {} has children", entry.name);
    }
    for child in &children {
        assert_sizes_consistent(catalog, child)?;
    }
    Ok(())
}

/// Walk a filesystem from its root, returning every reached entry id.
fn walk(catalog: &Catalog, fs: FilesystemId) -> Result<Vec<i64>> {
    let root = catalog.root_of(fs)?.context("filesystem has no root")?;
    let mut reached = vec![root.id];
    let mut pending = vec![root.id];
    while let Some(id) = pending.pop() {
        for child in catalog.children(id)? {
            reached.push(child.id);
            pending.push(child.id);
        }
    }
    Ok(reached)
}

const EXPORT: &[Entry<'static>] = &[
    Entry::Dir("bin/"),
    Entry::File("bin/busybox", 900),
    Entry::Symlink("bin/sh", "busybox"),
    Entry::Hardlink("bin/ls", "bin/busybox"),
    Entry::File("etc/passwd", 40),
    Entry::Dir("etc/"),
    Entry::File("etc/ssl/certs/ca.pem", 200),
    Entry::Dir("var/empty/"),
    Entry::File(".dockerenv", 0),
];

#[test]
fn test_scenario_rollup() -> Result<()> {
    let mut builder = Builder::new(Vec::new());
    for (path, size) in [("/a/b/file1", 100u64), ("/a/c/file2", 50)] {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(size);
        // set_path refuses absolute names, so write the name field directly.
        header.as_old_mut().name[..path.len()].copy_from_slice(path.as_bytes());
        header.set_cksum();
        builder.append(&header, io::repeat(0).take(size))?;
    }
    let bytes = builder.into_inner()?;

    let catalog = Catalog::open_in_memory()?;
    let stats = ingest_stream(&catalog, &bytes[..], "image")?;

    let tree = tree_of(&catalog, stats.filesystem)?;
    let expected: BTreeMap<String, (u64, bool)> = [
        ("", (150, true)),
        ("/a", (150, true)),
        ("/a/b", (100, true)),
        ("/a/c", (50, true)),
        ("/a/b/file1", (100, false)),
        ("/a/c/file2", (50, false)),
    ]
    .into_iter()
    .map(|(p, v)| (p.to_string(), v))
    .collect();
    assert_eq!(tree, expected);
    Ok(())
}

#[test]
fn test_directory_sizes_equal_sum_of_children() -> Result<()> {
    let catalog = Catalog::open_in_memory()?;
    let stats = ingest_stream(&catalog, &build_tar(EXPORT)?[..], "image")?;

    let root = catalog.root_of(stats.filesystem)?.context("no root")?;
    assert_eq!(root.total_size, 1140);
    assert_eq!(root.total_size, stats.bytes);
    assert_sizes_consistent(&catalog, &root)?;
    Ok(())
}

#[test]
fn test_links_create_no_rows() -> Result<()> {
    let catalog = Catalog::open_in_memory()?;
    let stats = ingest_stream(&catalog, &build_tar(EXPORT)?[..], "image")?;

    let tree = tree_of(&catalog, stats.filesystem)?;
    assert!(!tree.contains_key("/bin/sh"));
    assert!(!tree.contains_key("/bin/ls"));
    assert_eq!(tree["/bin"], (900, true));
    assert_eq!(stats.ignored, 2);
    Ok(())
}

#[test]
fn test_explicit_and_implicit_directories_resolve_once() -> Result<()> {
    let catalog = Catalog::open_in_memory()?;
    let stats = ingest_stream(&catalog, &build_tar(EXPORT)?[..], "image")?;

    let entries = catalog.entries_of(stats.filesystem)?;
    let mut keys = HashSet::new();
    for entry in &entries {
        assert!(
            keys.insert((entry.parent_id, entry.name.clone())),
            "duplicate entry {} under {:?}",
            entry.name,
            entry.parent_id
        );
    }
    assert_eq!(entries.iter().filter(|e| e.name == "etc").count(), 1);
    Ok(())
}

#[test]
fn test_entry_order_does_not_matter() -> Result<()> {
    let mut reversed = EXPORT.to_vec();
    reversed.reverse();

    let catalog = Catalog::open_in_memory()?;
    let forward = ingest_stream(&catalog, &build_tar(EXPORT)?[..], "forward")?;
    let backward = ingest_stream(&catalog, &build_tar(&reversed)?[..], "backward")?;

    assert_eq!(
        tree_of(&catalog, forward.filesystem)?,
        tree_of(&catalog, backward.filesystem)?
    );
    Ok(())
}

#[test]
fn test_filesystems_do_not_share_rows() -> Result<()> {
    let catalog = Catalog::open_in_memory()?;
    let first = ingest_stream(&catalog, &build_tar(EXPORT)?[..], "first")?;
    let second = ingest_stream(
        &catalog,
        &build_tar(&[Entry::File("etc/passwd", 7)])?[..],
        "second",
    )?;

    let first_tree = tree_of(&catalog, first.filesystem)?;
    let second_tree = tree_of(&catalog, second.filesystem)?;
    assert_eq!(first_tree["/etc/passwd"], (40, false));
    assert_eq!(second_tree["/etc/passwd"], (7, false));
    assert_eq!(second_tree[""], (7, true));
    assert_eq!(second_tree.len(), 3);
    Ok(())
}

#[test]
fn test_walk_from_root_returns_exactly_the_ingested_rows() -> Result<()> {
    let catalog = Catalog::open_in_memory()?;
    ingest_stream(&catalog, &build_tar(&[Entry::File("x", 1)])?[..], "other")?;
    let stats = ingest_stream(&catalog, &build_tar(EXPORT)?[..], "image")?;

    let mut reached = walk(&catalog, stats.filesystem)?;
    reached.sort_unstable();
    let mut ingested: Vec<_> = catalog
        .entries_of(stats.filesystem)?
        .into_iter()
        .map(|e| e.id)
        .collect();
    ingested.sort_unstable();

    assert_eq!(reached, ingested);
    assert_eq!(ingested.len() as u64, 1 + stats.files + stats.directories);
    Ok(())
}

/// Write export.tar and save.tar for a two-layer image into `dir`.
fn write_archives(dir: &Path, history: &str) -> Result<()> {
    let layer1 = build_tar(&[
        Entry::File("bin/busybox", 900),
        Entry::Symlink("bin/sh", "busybox"),
        Entry::File("etc/passwd", 40),
    ])?;
    let layer2 = build_tar(&[Entry::File("etc/ssl/certs/ca.pem", 200)])?;
    let manifest = r#"[{"Config":"0123abcd.json","RepoTags":["app:1"],"Layers":["aaaa/layer.tar","bbbb/layer.tar"]}]"#;

    let save = build_tar_of_blobs(&[
        ("aaaa/VERSION", b"1.0"),
        ("aaaa/json", b"{}"),
        ("aaaa/layer.tar", &layer1),
        ("bbbb/VERSION", b"1.0"),
        ("bbbb/layer.tar", &layer2),
        ("0123abcd.json", history.as_bytes()),
        ("manifest.json", manifest.as_bytes()),
        ("repositories", br#"{"app":{"1":"bbbb"}}"#),
    ])?;
    let export = build_tar(&[
        Entry::File("bin/busybox", 900),
        Entry::Symlink("bin/sh", "busybox"),
        Entry::File("etc/passwd", 40),
        Entry::File("etc/ssl/certs/ca.pem", 200),
        Entry::File(".dockerenv", 0),
    ])?;

    fs::write(dir.join("save.tar"), save)?;
    fs::write(dir.join("export.tar"), export)?;
    Ok(())
}

const HISTORY: &str = r#"{
    "architecture": "amd64",
    "history": [
        {"created": "2024-05-01T10:00:00Z", "created_by": "/bin/sh -c #(nop) ADD file:abc in / "},
        {"created": "2024-05-01T10:00:01Z", "created_by": "/bin/sh -c #(nop)  CMD [\"sh\"]", "empty_layer": true},
        {"created": "2024-05-01T10:00:02Z", "created_by": "COPY certs /etc/ssl/certs"}
    ]
}"#;

#[tokio::test]
async fn test_ingest_from_archives() -> Result<()> {
    let temp_dir = TempDir::new().context("Failed to create temp dir")?;
    write_archives(temp_dir.path(), HISTORY)?;

    let catalog = Catalog::open(temp_dir.path().join("catalog.sqlite"))?;
    let source = Arc::new(ArchiveSource::open(temp_dir.path())?);
    let report = ingest_image(source, &catalog, "app:1").await?;

    assert_eq!(report.image.bytes, 1140);
    assert!(report.reconcile.is_ok());

    let listing = catalog.list_filesystems()?;
    let summary: Vec<_> = listing
        .iter()
        .map(|f| (f.name.as_str(), f.size, f.command.as_deref(), f.order))
        .collect();
    assert_eq!(
        summary,
        [
            ("bbbb", 200, Some("COPY certs /etc/ssl/certs"), Some(1)),
            ("aaaa", 940, Some("/bin/sh -c #(nop) ADD file:abc in / "), Some(0)),
            (WHOLE_IMAGE_NAME, 1140, None, None),
        ]
    );

    for fs in &listing {
        let root = catalog.entry(fs.root_directory_id)?.context("missing root")?;
        assert_sizes_consistent(&catalog, &root)?;
    }
    Ok(())
}

#[tokio::test]
async fn test_second_ingest_into_same_catalog_is_refused() -> Result<()> {
    let temp_dir = TempDir::new()?;
    write_archives(temp_dir.path(), HISTORY)?;
    let catalog = Catalog::open_in_memory()?;
    let source = Arc::new(ArchiveSource::open(temp_dir.path())?);

    ingest_image(source.clone(), &catalog, "app:1").await?;
    let again = ingest_image(source, &catalog, "app:1").await;

    assert!(matches!(again, Err(IngestError::CatalogNotEmpty)));
    assert_eq!(catalog.list_filesystems()?.len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_short_history_leaves_layers_unassigned() -> Result<()> {
    let temp_dir = TempDir::new()?;
    write_archives(
        temp_dir.path(),
        r#"{"history":[{"created_by":"only one"},{"created_by":"noop","empty_layer":true}]}"#,
    )?;
    let catalog = Catalog::open_in_memory()?;
    let source = Arc::new(ArchiveSource::open(temp_dir.path())?);

    let report = ingest_image(source, &catalog, "app:1").await?;

    assert!(report.reconcile.is_err());
    assert!(catalog
        .filesystems()?
        .iter()
        .all(|fs| fs.command.is_none() && fs.order.is_none()));
    Ok(())
}

#[tokio::test]
async fn test_corrupt_layer_aborts_run() -> Result<()> {
    let temp_dir = TempDir::new()?;
    write_archives(temp_dir.path(), HISTORY)?;
    let mut layer = build_tar(&[Entry::File("big", 4096)])?;
    layer.truncate(1000);
    let save = build_tar_of_blobs(&[("cccc/layer.tar", &layer)])?;
    fs::write(temp_dir.path().join("save.tar"), save)?;

    let catalog = Catalog::open_in_memory()?;
    let source = Arc::new(ArchiveSource::open(temp_dir.path())?);
    let result = ingest_image(source, &catalog, "app:1").await;

    assert!(matches!(result, Err(IngestError::StreamRead(_))));
    assert!(catalog.is_empty()?);
    Ok(())
}

#[tokio::test]
async fn test_missing_archives_is_image_not_found() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let catalog = Catalog::open_in_memory()?;
    let source = Arc::new(ArchiveSource::open(temp_dir.path())?);

    let result = ingest_image(source, &catalog, "app:1").await;
    assert!(matches!(result, Err(IngestError::ImageNotFound(_))));
    Ok(())
}

/// Check if a command exists in PATH
fn command_exists(cmd: &str) -> bool {
    Command::new("which")
        .arg(cmd)
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

#[tokio::test]
#[ignore] // Requires docker and network access to pull busybox
async fn test_ingest_from_docker() -> Result<()> {
    if !command_exists("docker") {
        eprintln!("Skipping: docker not found");
        return Ok(());
    }
    let status = Command::new("docker")
        .args(["pull", "busybox"])
        .status()
        .context("Failed to pull busybox")?;
    anyhow::ensure!(status.success(), "Failed to pull busybox");

    let catalog = Catalog::open_in_memory()?;
    let report = ingest_image(Arc::new(EngineSource::new("docker")), &catalog, "busybox").await?;

    assert!(report.image.bytes > 0);
    let listing = catalog.list_filesystems()?;
    assert!(listing.len() >= 2);
    for fs in &listing {
        let root = catalog.entry(fs.root_directory_id)?.context("missing root")?;
        assert_sizes_consistent(&catalog, &root)?;
    }
    Ok(())
}
