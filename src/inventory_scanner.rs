use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::read::MultiGzDecoder;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::inventory::InventoryFeed;
use crate::qualification::{uuid_shaped, ProjectKey, QualificationSource, QualifyingProject};

/// One row of a bulk inventory listing. Consumed during the scan and
/// discarded.
#[derive(Debug, Clone)]
pub struct InventoryRecord {
    pub bucket: String,
    pub key: String,
    pub size: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Qualification Source A: streams bulk inventory CSVs and qualifies
/// projects whose preview prefix and metadata artifact both appear.
pub struct InventoryScanner {
    feed: InventoryFeed,
}

impl InventoryScanner {
    pub fn new(feed: InventoryFeed) -> Self {
        Self { feed }
    }
}

#[async_trait]
impl QualificationSource for InventoryScanner {
    async fn scan(&self) -> Result<Vec<QualifyingProject>> {
        let generation = self.feed.find_latest_generation().await?;
        let manifest = self.feed.fetch_manifest(&generation).await?;
        let csv_paths = self.feed.fetch_csv_files(&manifest).await?;

        tokio::task::spawn_blocking(move || scan_csv_files(&csv_paths))
            .await
            .map_err(|e| Error::Configuration(format!("scan task panicked: {e}")))?
    }
}

/// Scan gzipped inventory CSVs for qualifying projects.
///
/// Preview sightings keep first-seen insertion order, so output order is
/// deterministic for a fixed input ordering (and only for that ordering —
/// reordering the CSV inputs may reorder the output). Duplicate rows are
/// idempotent.
pub fn scan_csv_files(csv_paths: &[PathBuf]) -> Result<Vec<QualifyingProject>> {
    let mut preview_order: Vec<ProjectKey> = Vec::new();
    let mut preview_seen: HashSet<ProjectKey> = HashSet::new();
    let mut metadata_seen: HashSet<ProjectKey> = HashSet::new();

    info!(files = csv_paths.len(), "Scanning inventory CSV files");

    for path in csv_paths {
        if let Err(e) = scan_one_file(path, &mut preview_order, &mut preview_seen, &mut metadata_seen)
        {
            warn!(path = %path.display(), error = %e, "Skipping unreadable inventory CSV");
        }
    }

    info!(
        previews = preview_seen.len(),
        metadata = metadata_seen.len(),
        "Inventory scan complete"
    );

    let qualifying: Vec<QualifyingProject> = preview_order
        .into_iter()
        .filter(|key| metadata_seen.contains(key))
        .map(QualifyingProject::new)
        .collect();

    info!(qualifying = qualifying.len(), "Projects with both artifacts");
    Ok(qualifying)
}

fn scan_one_file(
    path: &Path,
    preview_order: &mut Vec<ProjectKey>,
    preview_seen: &mut HashSet<ProjectKey>,
    metadata_seen: &mut HashSet<ProjectKey>,
) -> Result<()> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(MultiGzDecoder::new(file));

    let mut rows = 0u64;
    for row in reader.records() {
        let row = row.map_err(|e| Error::corrupt(path, format!("bad CSV row: {e}")))?;
        rows += 1;

        let Some(record) = parse_record(&row) else {
            continue;
        };

        if let Some(key) = parse_preview_key(&record.key) {
            if preview_seen.insert(key.clone()) {
                preview_order.push(key);
            }
        } else if let Some(key) = parse_metadata_key(&record.key) {
            metadata_seen.insert(key);
        }
    }

    debug!(path = %path.display(), rows, "Scanned inventory CSV");
    Ok(())
}

/// Rows need at least bucket and key; size and timestamp parse leniently.
fn parse_record(row: &csv::StringRecord) -> Option<InventoryRecord> {
    let bucket = row.get(0)?;
    let key = row.get(1)?;
    Some(InventoryRecord {
        bucket: bucket.to_string(),
        key: key.to_string(),
        size: row.get(2).and_then(|s| s.trim().parse().ok()),
        last_modified: row
            .get(3)
            .and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok())
            .map(|t| t.with_timezone(&Utc)),
    })
}

/// `{user}/{project}/preview.v1/...` with UUID-shaped ids.
fn parse_preview_key(key: &str) -> Option<ProjectKey> {
    let mut parts = key.splitn(4, '/');
    let user = parts.next()?;
    let project = parts.next()?;
    let marker = parts.next()?;
    if marker == "preview.v1" && parts.next().is_some() && uuid_shaped(user) && uuid_shaped(project)
    {
        Some(ProjectKey::new(user, project))
    } else {
        None
    }
}

/// Exactly `{user}/{project}/{project}.v3.gz`.
fn parse_metadata_key(key: &str) -> Option<ProjectKey> {
    if !key.ends_with(".v3.gz") {
        return None;
    }
    let parts: Vec<&str> = key.split('/').collect();
    let [user, project, filename] = parts[..] else {
        return None;
    };
    if filename == format!("{project}.v3.gz") {
        Some(ProjectKey::new(user, project))
    } else {
        None
    }
}
