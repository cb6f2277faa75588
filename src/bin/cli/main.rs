//! layertree: Command-line tool for size-annotated container image trees
//!
//! `layertree ingest` reads an image from a docker-compatible engine (or
//! from pre-exported archives) into a SQLite catalog holding one tree for
//! the whole image and one per layer. The other commands browse a catalog
//! written earlier:
//!
//! - `filesystems` lists every tree with its size and build command
//! - `ls` shows one directory and its children
//! - `tree` shows a directory's subtree down to a given depth
//!
//! Logging goes to stderr and is controlled by `RUST_LOG`, or by `-v`
//! (info) and `-vv` (debug) when `RUST_LOG` is unset.

mod output;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use layertree::{
    ingest_image, ArchiveSource, Catalog, Config, EngineSource, FileEntry, FileId, ImageSource,
};
use output::{output_filesystems, output_listing, output_tree, OutputFormat, TreeNode};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "layertree")]
#[command(about = "Size-annotated filesystem trees of container images", long_about = None)]
struct Cli {
    /// Configuration file (default: search standard locations)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Catalog database file (default: from config, else in-memory)
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Output format (table or json)
    #[arg(long, value_enum, default_value = "table", global = true)]
    format: OutputFormat,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest an image into an empty catalog
    Ingest {
        /// Image name or ID
        image: String,
        /// Container engine executable (default: from config, else docker)
        #[arg(long, conflicts_with = "from_archives")]
        engine: Option<String>,
        /// Read export.tar and save.tar from this directory instead of an engine
        #[arg(long, value_name = "DIR")]
        from_archives: Option<PathBuf>,
    },

    /// List ingested filesystems, highest layer first
    #[command(visible_alias = "layers")]
    Filesystems,

    /// Show a directory and its direct children
    Ls {
        /// Directory entry ID
        directory: FileId,
    },

    /// Show a directory's subtree
    Tree {
        /// Directory entry ID
        directory: FileId,
        /// Levels below the directory to show
        #[arg(long, default_value_t = 2)]
        depth: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let rt = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    rt.block_on(run(cli))
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let database = cli.database.or_else(|| config.database.clone());

    match cli.command {
        Commands::Ingest {
            image,
            engine,
            from_archives,
        } => {
            let source: Arc<dyn ImageSource> = match from_archives {
                Some(dir) => Arc::new(
                    ArchiveSource::open(&dir)
                        .with_context(|| format!("Failed to open {}", dir.display()))?,
                ),
                None => Arc::new(EngineSource::new(
                    engine.unwrap_or_else(|| config.engine.command.clone()),
                )),
            };
            let catalog = match &database {
                Some(path) => open_catalog(path)?,
                None => Catalog::open_in_memory().context("Failed to create catalog")?,
            };
            ingest(source, &catalog, &image, cli.format).await
        }
        Commands::Filesystems => {
            let catalog = open_existing(database.as_deref())?;
            let filesystems = catalog
                .list_filesystems()
                .context("Failed to list filesystems")?;
            output_filesystems(&filesystems, cli.format).context("Failed to output filesystems")
        }
        Commands::Ls { directory } => {
            let catalog = open_existing(database.as_deref())?;
            let listing = catalog
                .load_directory(directory)
                .context("Failed to load directory")?
                .ok_or_else(|| anyhow!("No entry with ID {}", directory))?;
            output_listing(&listing, cli.format).context("Failed to output directory")
        }
        Commands::Tree { directory, depth } => {
            let catalog = open_existing(database.as_deref())?;
            let entry = catalog
                .entry(directory)
                .context("Failed to load directory")?
                .ok_or_else(|| anyhow!("No entry with ID {}", directory))?;
            let tree = build_tree(&catalog, entry, depth)?;
            output_tree(&tree, cli.format).context("Failed to output tree")
        }
    }
}

/// Load the explicit config file, or the first one found, or the defaults.
fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match Config::find() {
            Some(path) => path,
            None => return Ok(Config::default()),
        },
    };
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let config = Config::from_toml(&content)
        .with_context(|| format!("Failed to parse config {}", path.display()))?;
    tracing::debug!(path = %path.display(), "loaded config");
    Ok(config)
}

fn open_catalog(path: &Path) -> Result<Catalog> {
    Catalog::open(path).with_context(|| format!("Failed to open catalog {}", path.display()))
}

/// Open a catalog that must already exist on disk.
fn open_existing(database: Option<&Path>) -> Result<Catalog> {
    let path = database.ok_or_else(|| anyhow!("No database given; use --database or config"))?;
    if !path.exists() {
        return Err(anyhow!("Database {} does not exist", path.display()));
    }
    open_catalog(path)
}

async fn ingest(
    source: Arc<dyn ImageSource>,
    catalog: &Catalog,
    image: &str,
    format: OutputFormat,
) -> Result<()> {
    let report = ingest_image(source, catalog, image)
        .await
        .with_context(|| format!("Failed to ingest {}", image))?;
    tracing::info!(
        image = %report.image_id,
        layers = report.save.layers.len(),
        bytes = report.image.bytes,
        "ingestion complete"
    );

    let filesystems = catalog
        .list_filesystems()
        .context("Failed to list filesystems")?;
    output_filesystems(&filesystems, format).context("Failed to output filesystems")
}

fn build_tree(catalog: &Catalog, entry: FileEntry, depth: usize) -> Result<TreeNode> {
    let children = if entry.is_directory && depth > 0 {
        catalog
            .children(entry.id)
            .with_context(|| format!("Failed to list children of {}", entry.id))?
            .into_iter()
            .map(|child| build_tree(catalog, child, depth - 1))
            .collect::<Result<Vec<_>>>()?
    } else {
        Vec::new()
    };
    Ok(TreeNode { entry, children })
}
