use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::config::InventoryConfig;
use crate::error::{Error, Result};
use crate::object_store::ObjectStore;

/// One CSV file listed by an inventory manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct InventoryFile {
    pub key: String,
    pub size: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    source_bucket: String,
    file_format: String,
    #[serde(default)]
    creation_timestamp: Option<serde_json::Value>,
    files: Vec<InventoryFile>,
}

/// Parsed inventory manifest.
#[derive(Debug, Clone)]
pub struct InventoryManifest {
    pub source_bucket: String,
    pub file_format: String,
    pub created_at: Option<DateTime<Utc>>,
    pub files: Vec<InventoryFile>,
}

/// Discovers the latest inventory generation and fetches its CSV files into
/// the local CSV cache.
pub struct InventoryFeed {
    store: Arc<dyn ObjectStore>,
    config: InventoryConfig,
    cache: Arc<CacheStore>,
    csv_dir: PathBuf,
}

impl InventoryFeed {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        config: InventoryConfig,
        cache: Arc<CacheStore>,
        csv_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            config,
            cache,
            csv_dir,
        }
    }

    /// Find the latest inventory generation prefix.
    ///
    /// Generations are dated directories of the form `YYYY-MM-DDTHH-MMZ/`;
    /// the lexicographic maximum is the newest.
    pub async fn find_latest_generation(&self) -> Result<String> {
        let prefixes = self
            .store
            .list_prefixes(&self.config.bucket, &self.config.prefix, "/")
            .await?;

        let latest = prefixes
            .into_iter()
            .filter(|p| is_generation_prefix(p))
            .max()
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "no dated inventory generations under s3://{}/{}",
                    self.config.bucket, self.config.prefix
                ))
            })?;

        info!(generation = %latest, "Found latest inventory generation");
        Ok(latest)
    }

    /// Fetch and parse `manifest.json` for a generation.
    pub async fn fetch_manifest(&self, generation: &str) -> Result<InventoryManifest> {
        let manifest_key = format!("{generation}manifest.json");
        let bytes = self.store.get(&self.config.bucket, &manifest_key).await?;

        let raw: RawManifest = serde_json::from_slice(&bytes)
            .map_err(|e| Error::corrupt(&manifest_key, format!("bad manifest: {e}")))?;

        let created_at = raw.creation_timestamp.as_ref().and_then(parse_millis);

        info!(
            files = raw.files.len(),
            created = ?created_at,
            "Loaded inventory manifest"
        );

        Ok(InventoryManifest {
            source_bucket: raw.source_bucket,
            file_format: raw.file_format,
            created_at,
            files: raw.files,
        })
    }

    /// Download every CSV file the manifest lists, up to `csv_concurrency`
    /// at a time, skipping files already in the CSV cache.
    ///
    /// Returns local paths of the files that are present after the pass.
    /// A failed file is logged and left out; the scan proceeds with the rest.
    pub async fn fetch_csv_files(&self, manifest: &InventoryManifest) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(&self.csv_dir).map_err(|e| Error::io(&self.csv_dir, e))?;

        info!(
            total = manifest.files.len(),
            concurrency = self.config.csv_concurrency,
            "Fetching inventory CSV files"
        );

        let results: Vec<Option<PathBuf>> = stream::iter(manifest.files.clone())
            .map(|file| {
                let store = self.store.clone();
                let cache = self.cache.clone();
                let bucket = self.config.bucket.clone();
                let csv_dir = self.csv_dir.clone();
                async move {
                    match fetch_one_csv(store, cache, &bucket, &file, &csv_dir).await {
                        Ok(path) => Some(path),
                        Err(e) => {
                            warn!(key = %file.key, error = %e, "Failed to fetch inventory CSV");
                            None
                        }
                    }
                }
            })
            .buffer_unordered(self.config.csv_concurrency)
            .collect()
            .await;

        let paths: Vec<PathBuf> = results.into_iter().flatten().collect();
        info!(fetched = paths.len(), "Inventory CSV files ready");
        Ok(paths)
    }
}

async fn fetch_one_csv(
    store: Arc<dyn ObjectStore>,
    cache: Arc<CacheStore>,
    bucket: &str,
    file: &InventoryFile,
    csv_dir: &Path,
) -> Result<PathBuf> {
    let filename = file
        .key
        .rsplit('/')
        .next()
        .unwrap_or(file.key.as_str())
        .to_string();
    let local_path = csv_dir.join(&filename);

    if cache.has(&file.key) {
        if let Some(cached) = cache.local_path(&file.key) {
            if cached.exists() {
                debug!(key = %file.key, "Using cached inventory CSV");
                return Ok(cached);
            }
        }
        // Index entry survives but the file is gone; fall through and
        // re-fetch. Manifest keys are unique, so no sibling task shares
        // this key.
    } else if !cache.try_claim(&file.key) {
        return Ok(local_path);
    }

    let bytes = match store.get(bucket, &file.key).await {
        Ok(bytes) => bytes,
        Err(e) => {
            cache.release(&file.key);
            return Err(e.into());
        }
    };

    // The manifest records the object size; a short read means a truncated
    // body and the file must not enter the cache.
    if bytes.len() as u64 != file.size {
        cache.release(&file.key);
        return Err(Error::corrupt(
            &local_path,
            format!("size mismatch: expected {}, got {}", file.size, bytes.len()),
        ));
    }

    if let Err(e) = std::fs::write(&local_path, &bytes) {
        cache.release(&file.key);
        return Err(Error::io(&local_path, e));
    }

    cache.mark_complete(&file.key, &local_path)?;
    debug!(key = %file.key, bytes = bytes.len(), "Fetched inventory CSV");
    Ok(local_path)
}

/// `YYYY-MM-DDTHH-MMZ/` shaped trailing segment.
fn is_generation_prefix(prefix: &str) -> bool {
    let Some(segment) = prefix.trim_end_matches('/').rsplit('/').next() else {
        return false;
    };
    let bytes = segment.as_bytes();
    if bytes.len() != 17 {
        return false;
    }
    segment
        .char_indices()
        .all(|(i, c)| match i {
            4 | 7 => c == '-',
            10 => c == 'T',
            13 => c == '-',
            16 => c == 'Z',
            _ => c.is_ascii_digit(),
        })
}

/// The manifest's `creationTimestamp` is epoch milliseconds, serialized as
/// either a number or a numeric string depending on the producer.
fn parse_millis(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    let millis = match value {
        serde_json::Value::Number(n) => n.as_i64()?,
        serde_json::Value::String(s) => s.parse().ok()?,
        _ => return None,
    };
    DateTime::from_timestamp_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_prefix_shapes() {
        assert!(is_generation_prefix("bucket/Inventory/2025-07-12T01-00Z/"));
        assert!(is_generation_prefix("2025-07-12T01-00Z/"));
        assert!(!is_generation_prefix("bucket/Inventory/hive/"));
        assert!(!is_generation_prefix("bucket/Inventory/2025-07-12/"));
        assert!(!is_generation_prefix(""));
    }

    #[test]
    fn test_manifest_parses_timestamp_forms() {
        let as_number = serde_json::json!(1752285600000i64);
        let as_string = serde_json::json!("1752285600000");
        assert_eq!(parse_millis(&as_number), parse_millis(&as_string));
        assert!(parse_millis(&as_number).is_some());
        assert!(parse_millis(&serde_json::json!(null)).is_none());
    }

    #[test]
    fn test_manifest_deserializes() {
        let raw = serde_json::json!({
            "sourceBucket": "data-bucket",
            "destinationBucket": "arn:aws:s3:::inventory-bucket",
            "version": "2016-11-30",
            "creationTimestamp": "1752285600000",
            "fileFormat": "CSV",
            "fileSchema": "Bucket, Key, Size, LastModifiedDate",
            "files": [
                { "key": "data/a.csv.gz", "size": 1234, "MD5checksum": "abc" }
            ]
        });

        let manifest: RawManifest = serde_json::from_value(raw).unwrap();
        assert_eq!(manifest.source_bucket, "data-bucket");
        assert_eq!(manifest.file_format, "CSV");
        assert_eq!(manifest.files.len(), 1);
        assert_eq!(manifest.files[0].size, 1234);
    }
}
