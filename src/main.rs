use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use preview_wrangler::cache::{self, CacheStore};
use preview_wrangler::config::Config;
use preview_wrangler::downloader::Downloader;
use preview_wrangler::inventory::InventoryFeed;
use preview_wrangler::inventory_scanner::InventoryScanner;
use preview_wrangler::marker_scanner::MarkerScanner;
use preview_wrangler::object_store::{ObjectStore, S3Store};
use preview_wrangler::qualification::QualificationSource;
use preview_wrangler::rotation::RotationCorrector;
use preview_wrangler::sorter::CaptureTimeSorter;

/// Preview Wrangler - qualify, download, and post-process preview image sets.
#[derive(Parser, Debug)]
#[command(name = "preview-wrangler", version, about)]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Source {
    /// Bulk inventory CSV listings
    Inventory,
    /// Hourly marker partitions
    Markers,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Qualify projects and download their preview sets
    Download {
        /// Output directory for downloaded files
        #[arg(short, long, default_value = "output")]
        output_dir: PathBuf,
        /// Which qualification source to scan
        #[arg(long, value_enum, default_value = "inventory")]
        source: Source,
        /// Concurrent projects in flight
        #[arg(long)]
        max_projects: Option<usize>,
        /// Image cap per project (0 = unbounded)
        #[arg(long)]
        max_images: Option<usize>,
        /// Marker lookback window in hours
        #[arg(long)]
        hours_back: Option<u32>,
        /// Clear all cached state before starting
        #[arg(long)]
        clear_cache: bool,
    },
    /// Rotate downloaded images per their upload metadata
    CorrectRotations {
        /// Directory containing project directories
        #[arg(short, long, default_value = "output")]
        input_dir: PathBuf,
        /// Re-apply rotations already recorded as done
        #[arg(long)]
        overwrite: bool,
    },
    /// Rename downloaded images into capture-time-sortable names
    CaptureTimeSort {
        /// Directory containing project directories
        #[arg(short, long, default_value = "output")]
        input_dir: PathBuf,
        /// Copy renamed files here instead of renaming in place
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
        /// Replace existing files at target names
        #[arg(long)]
        overwrite: bool,
    },
    /// Show cache location and usage
    CacheInfo,
    /// Drop all cached state
    ClearCache,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.debug);

    let mut config = Config::load().context("Failed to load configuration")?;

    match cli.command {
        Commands::Download {
            output_dir,
            source,
            max_projects,
            max_images,
            hours_back,
            clear_cache,
        } => {
            if let Some(n) = max_projects {
                config.download.max_projects = n;
            }
            if let Some(n) = max_images {
                config.download.max_images = n;
            }
            if let Some(n) = hours_back {
                config.markers.hours_back = n;
            }
            config.validate()?;

            if clear_cache {
                cache::clear_cache_root(&config.cache_root())?;
            }

            download(&config, source, output_dir).await
        }
        Commands::CorrectRotations {
            input_dir,
            overwrite,
        } => {
            config.validate()?;
            let cache = Arc::new(CacheStore::open(&config.cache_root(), "rotation")?);
            let stats = RotationCorrector::new(cache, overwrite).run(&input_dir)?;
            println!("Rotation correction summary:");
            println!("  Projects processed: {}", stats.projects);
            println!("  Projects skipped:   {}", stats.projects_skipped);
            println!("  Images corrected:   {}", stats.corrected);
            println!("  Images skipped:     {}", stats.skipped);
            println!("  Errors:             {}", stats.errors);
            Ok(())
        }
        Commands::CaptureTimeSort {
            input_dir,
            output_dir,
            overwrite,
        } => {
            config.validate()?;
            let cache = Arc::new(CacheStore::open(&config.cache_root(), "sort")?);
            let stats = CaptureTimeSorter::new(cache, output_dir, overwrite).run(&input_dir)?;
            println!("Capture-time sort summary:");
            println!("  Projects processed: {}", stats.projects);
            println!("  Projects skipped:   {}", stats.projects_skipped);
            println!("  Images renamed:     {}", stats.renamed);
            println!("  Images skipped:     {}", stats.skipped);
            println!("  Errors:             {}", stats.errors);
            Ok(())
        }
        Commands::CacheInfo => {
            let root = config.cache_root();
            let usage = cache::cache_usage(&root);
            println!("Cache directory: {}", root.display());
            println!("Files cached: {}", usage.file_count);
            println!(
                "Total size: {:.2} GB",
                usage.total_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
            );
            Ok(())
        }
        Commands::ClearCache => {
            cache::clear_cache_root(&config.cache_root())?;
            println!("Cache cleared.");
            Ok(())
        }
    }
}

async fn download(config: &Config, source: Source, output_dir: PathBuf) -> Result<()> {
    let cache_root = config.cache_root();
    let store: Arc<dyn ObjectStore> = Arc::new(S3Store::new(&config.store).await);

    let source: Box<dyn QualificationSource> = match source {
        Source::Inventory => {
            let csv_cache = Arc::new(CacheStore::open(&cache_root, "csv")?);
            let feed = InventoryFeed::new(
                store.clone(),
                config.inventory.clone(),
                csv_cache,
                cache_root.join("csv"),
            );
            Box::new(InventoryScanner::new(feed))
        }
        Source::Markers => Box::new(MarkerScanner::new(
            store.clone(),
            config.store.bucket.clone(),
            config.markers.clone(),
        )),
    };

    println!("Scanning for qualifying projects...");
    let projects = source.scan().await?;

    if projects.is_empty() {
        println!("No qualifying projects found.");
        return Ok(());
    }
    println!("Found {} qualifying projects", projects.len());

    let download_cache = Arc::new(CacheStore::open(&cache_root, "downloads")?);
    let downloader = Downloader::new(
        store,
        config.store.bucket.clone(),
        download_cache,
        config.download.clone(),
        output_dir,
    );

    let summary = downloader.run(projects).await;

    println!("Download summary:");
    println!("  Projects complete: {}", summary.complete);
    println!("  Projects partial:  {}", summary.partial);
    println!("  Projects failed:   {}", summary.failed);
    println!("  Files downloaded:  {}", summary.files_downloaded);
    println!("  Files cached:      {}", summary.files_cached);
    println!("  Files failed:      {}", summary.files_failed);

    Ok(())
}

/// Initialize tracing. `--debug` lowers the default filter to debug.
fn init_tracing(debug: bool) {
    let default = if debug {
        "preview_wrangler=debug,info"
    } else {
        "info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();
}
