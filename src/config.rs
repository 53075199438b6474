use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Main configuration for the wrangler
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Object store configuration
    #[serde(default)]
    pub store: StoreConfig,
    /// Inventory manifest configuration
    #[serde(default)]
    pub inventory: InventoryConfig,
    /// Marker scan configuration
    #[serde(default)]
    pub markers: MarkerConfig,
    /// Download orchestration configuration
    #[serde(default)]
    pub download: DownloadConfig,
    /// Local cache configuration
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Object store (S3) configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Bucket holding preview and metadata artifacts
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

/// Inventory manifest configuration
#[derive(Debug, Clone, Deserialize)]
pub struct InventoryConfig {
    /// Bucket holding the inventory listings
    #[serde(default = "default_inventory_bucket")]
    pub bucket: String,
    /// Prefix under which dated inventory generations live
    #[serde(default = "default_inventory_prefix")]
    pub prefix: String,
    /// Concurrent CSV downloads
    #[serde(default = "default_csv_concurrency")]
    pub csv_concurrency: usize,
}

/// Marker scan configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MarkerConfig {
    /// Marker prefix written alongside preview uploads
    #[serde(default = "default_preview_marker_prefix")]
    pub preview_prefix: String,
    /// Marker prefix written alongside metadata uploads
    #[serde(default = "default_metadata_marker_prefix")]
    pub metadata_prefix: String,
    /// Lookback window in hours
    #[serde(default = "default_hours_back")]
    pub hours_back: u32,
    /// Concurrent hourly-partition listings
    #[serde(default = "default_scan_concurrency")]
    pub scan_concurrency: usize,
}

/// Download orchestration configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadConfig {
    /// Concurrent projects in flight
    #[serde(default = "default_max_projects")]
    pub max_projects: usize,
    /// Image cap per project (0 = unbounded)
    #[serde(default = "default_max_images")]
    pub max_images: usize,
    /// Concurrent file downloads within one project
    #[serde(default = "default_file_concurrency")]
    pub file_concurrency: usize,
}

/// Local cache configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
    /// Cache root directory (default: ~/.preview-wrangler/cache)
    pub root: Option<PathBuf>,
}

// Default value functions
fn default_bucket() -> String {
    "prod.ml-meta-upload.getnarrativeapp.com".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_inventory_bucket() -> String {
    "prod.ml-meta-upload.getnarrativeapp.com-inventory".to_string()
}

fn default_inventory_prefix() -> String {
    "prod.ml-meta-upload.getnarrativeapp.com/Inventory/".to_string()
}

fn default_csv_concurrency() -> usize {
    10
}

fn default_preview_marker_prefix() -> String {
    "preview.v1".to_string()
}

fn default_metadata_marker_prefix() -> String {
    "v3".to_string()
}

fn default_hours_back() -> u32 {
    24
}

fn default_scan_concurrency() -> usize {
    20
}

fn default_max_projects() -> usize {
    4
}

fn default_max_images() -> usize {
    20
}

fn default_file_concurrency() -> usize {
    20
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            bucket: default_inventory_bucket(),
            prefix: default_inventory_prefix(),
            csv_concurrency: default_csv_concurrency(),
        }
    }
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            preview_prefix: default_preview_marker_prefix(),
            metadata_prefix: default_metadata_marker_prefix(),
            hours_back: default_hours_back(),
            scan_concurrency: default_scan_concurrency(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_projects: default_max_projects(),
            max_images: default_max_images(),
            file_concurrency: default_file_concurrency(),
        }
    }
}

impl Config {
    /// Load configuration from config files and environment.
    ///
    /// Environment variables use the `WRANGLER` prefix with `__` separators,
    /// e.g. `WRANGLER__STORE__BUCKET` -> `store.bucket`.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/wrangler").required(false))
            .add_source(config::File::with_name("/etc/preview-wrangler/wrangler").required(false))
            .add_source(
                config::Environment::with_prefix("WRANGLER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Reject invalid combinations before any work starts.
    pub fn validate(&self) -> Result<()> {
        if self.store.bucket.is_empty() {
            return Err(Error::Configuration("store.bucket must not be empty".into()));
        }
        if self.download.max_projects == 0 {
            return Err(Error::Configuration(
                "download.max_projects must be at least 1".into(),
            ));
        }
        if self.download.file_concurrency == 0 {
            return Err(Error::Configuration(
                "download.file_concurrency must be at least 1".into(),
            ));
        }
        if self.inventory.csv_concurrency == 0 {
            return Err(Error::Configuration(
                "inventory.csv_concurrency must be at least 1".into(),
            ));
        }
        if self.markers.scan_concurrency == 0 {
            return Err(Error::Configuration(
                "markers.scan_concurrency must be at least 1".into(),
            ));
        }
        if self.markers.hours_back == 0 {
            return Err(Error::Configuration(
                "markers.hours_back must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the cache root, defaulting under the home directory.
    pub fn cache_root(&self) -> PathBuf {
        match &self.cache.root {
            Some(root) => root.clone(),
            None => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".preview-wrangler")
                .join("cache"),
        }
    }
}
