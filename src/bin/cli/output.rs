//! Output formatting utilities for the CLI.
//!
//! Every command prints either a human-readable table or JSON, selected by
//! the global `--format` flag. JSON output is one document on stdout, so it
//! can be piped into other tools; logs go to stderr.

use std::fmt::Write as _;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, CellAlignment, ContentArrangement, Table};
use layertree::{size_efficiency, DirectoryListing, FileEntry, FilesystemSummary};
use serde::Serialize;

/// Output format for CLI commands.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table format.
    #[default]
    Table,
    /// Machine-parseable JSON format.
    Json,
}

/// A directory entry with its descendants, down to a chosen depth.
#[derive(Debug, Serialize)]
pub struct TreeNode {
    #[serde(flatten)]
    pub entry: FileEntry,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNode>,
}

/// Format a byte count as human-readable size.
///
/// Uses binary multiples (1 KB = 1024 B) with one decimal place.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Create a styled table with consistent formatting.
pub fn create_styled_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn size_cell(bytes: u64) -> Cell {
    Cell::new(format_size(bytes)).set_alignment(CellAlignment::Right)
}

fn display_name(entry: &FileEntry) -> String {
    if entry.is_directory && entry.parent_id.is_some() {
        format!("{}/", entry.name)
    } else {
        entry.name.clone()
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), serde_json::Error> {
    let json = serde_json::to_string(value)?;
    println!("{}", json);
    Ok(())
}

/// Print the filesystem listing, highest layer order first.
///
/// The table is followed by the image's size efficiency when it is known.
pub fn output_filesystems(
    filesystems: &[FilesystemSummary],
    format: OutputFormat,
) -> Result<(), serde_json::Error> {
    match format {
        OutputFormat::Json => print_json(filesystems),
        OutputFormat::Table => {
            let mut table = create_styled_table();
            table.set_header(vec!["ID", "NAME", "ROOT", "SIZE", "ORDER", "COMMAND"]);
            for fs in filesystems {
                table.add_row(vec![
                    Cell::new(fs.id),
                    Cell::new(&fs.name),
                    Cell::new(fs.root_directory_id),
                    size_cell(fs.size),
                    Cell::new(fs.order.map_or_else(|| "-".to_string(), |o| o.to_string())),
                    Cell::new(fs.command.as_deref().unwrap_or("-")),
                ]);
            }
            println!("{table}");
            if let Some(score) = size_efficiency(filesystems) {
                println!("{}", efficiency_line(score));
            }
            Ok(())
        }
    }
}

/// Print a directory and its direct children, largest first.
pub fn output_listing(
    listing: &DirectoryListing,
    format: OutputFormat,
) -> Result<(), serde_json::Error> {
    match format {
        OutputFormat::Json => print_json(listing),
        OutputFormat::Table => {
            let dir = &listing.directory;
            println!(
                "{} ({}, id {})",
                display_name(dir),
                format_size(dir.total_size),
                dir.id
            );

            let mut table = create_styled_table();
            table.set_header(vec!["ID", "NAME", "SIZE"]);
            for child in &listing.children {
                table.add_row(vec![
                    Cell::new(child.id),
                    Cell::new(display_name(child)),
                    size_cell(child.total_size),
                ]);
            }
            println!("{table}");
            Ok(())
        }
    }
}

/// Print a tree as indented lines, sizes first.
pub fn output_tree(tree: &TreeNode, format: OutputFormat) -> Result<(), serde_json::Error> {
    match format {
        OutputFormat::Json => print_json(tree),
        OutputFormat::Table => {
            print!("{}", render_tree(tree));
            Ok(())
        }
    }
}

fn efficiency_line(score: f64) -> String {
    format!("Size efficiency: {:.1}% of layer bytes remain in the image", score)
}

fn render_tree(tree: &TreeNode) -> String {
    let mut out = String::new();
    render_node(tree, 0, &mut out);
    out
}

fn render_node(node: &TreeNode, depth: usize, out: &mut String) {
    let _ = writeln!(
        out,
        "{:>10}  {}{}",
        format_size(node.entry.total_size),
        "  ".repeat(depth),
        display_name(&node.entry)
    );
    for child in &node.children {
        render_node(child, depth + 1, out);
    }
}
