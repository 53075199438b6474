use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::config::MarkerConfig;
use crate::error::Result;
use crate::object_store::ObjectStore;
use crate::qualification::{ProjectKey, QualificationSource, QualifyingProject};

/// Which artifact a marker announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    Preview,
    Metadata,
}

/// One marker object, decoded from its key path. The object body is empty;
/// the path carries all the facts.
#[derive(Debug, Clone)]
pub struct MarkerEntry {
    pub kind: MarkerKind,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub project_id: String,
}

/// Qualification Source B: scans hourly marker partitions over a lookback
/// window.
///
/// A project qualifies iff at least one preview marker and at least one
/// metadata marker fall anywhere inside the window. The two markers need not
/// share an hour, and a marker outside the window never counts, even when
/// its sibling is inside.
pub struct MarkerScanner {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    config: MarkerConfig,
    now: Option<DateTime<Utc>>,
}

impl MarkerScanner {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: String, config: MarkerConfig) -> Self {
        Self {
            store,
            bucket,
            config,
            now: None,
        }
    }

    /// Pin the reference time instead of using the wall clock.
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    async fn scan_kind(&self, kind: MarkerKind) -> Result<BTreeSet<ProjectKey>> {
        let prefix = match kind {
            MarkerKind::Preview => &self.config.preview_prefix,
            MarkerKind::Metadata => &self.config.metadata_prefix,
        };

        let reference = self.now.unwrap_or_else(Utc::now);
        let end = reference
            .duration_trunc(Duration::hours(1))
            .unwrap_or(reference);
        let start = end - Duration::hours(i64::from(self.config.hours_back));

        let mut partitions = Vec::new();
        let mut hour = start;
        while hour <= end {
            partitions.push(format!("{}/{}/", prefix, hour.format("%Y/%m/%d/%H")));
            hour += Duration::hours(1);
        }

        info!(
            prefix = %prefix,
            partitions = partitions.len(),
            from = %start,
            to = %end,
            "Scanning marker partitions"
        );

        let sets: Vec<BTreeSet<ProjectKey>> = stream::iter(partitions)
            .map(|partition| {
                let store = self.store.clone();
                let bucket = self.bucket.clone();
                async move {
                    match store.list(&bucket, &partition).await {
                        Ok(objects) => {
                            let keys: BTreeSet<ProjectKey> = objects
                                .iter()
                                .filter_map(|obj| parse_marker_key(&obj.key).map(|m| {
                                    ProjectKey::new(m.user_id, m.project_id)
                                }))
                                .collect();
                            debug!(partition = %partition, projects = keys.len(), "Scanned partition");
                            keys
                        }
                        Err(e) => {
                            warn!(partition = %partition, error = %e, "Failed to list marker partition");
                            BTreeSet::new()
                        }
                    }
                }
            })
            .buffer_unordered(self.config.scan_concurrency)
            .collect()
            .await;

        let mut projects = BTreeSet::new();
        for set in sets {
            projects.extend(set);
        }
        Ok(projects)
    }
}

#[async_trait]
impl QualificationSource for MarkerScanner {
    async fn scan(&self) -> Result<Vec<QualifyingProject>> {
        let previews = self.scan_kind(MarkerKind::Preview).await?;
        info!(projects = previews.len(), "Projects with preview markers");

        let metadata = self.scan_kind(MarkerKind::Metadata).await?;
        info!(projects = metadata.len(), "Projects with metadata markers");

        // BTreeSet intersection keeps the output sorted by project key.
        let qualifying: Vec<QualifyingProject> = previews
            .intersection(&metadata)
            .cloned()
            .map(QualifyingProject::new)
            .collect();

        info!(qualifying = qualifying.len(), "Projects with both markers");
        Ok(qualifying)
    }
}

/// Parse `{kind_prefix}/{YYYY}/{MM}/{DD}/{HH}/{user_id}/{project_id}`.
/// Shorter paths are not markers.
pub fn parse_marker_key(key: &str) -> Option<MarkerEntry> {
    let parts: Vec<&str> = key.split('/').collect();
    if parts.len() < 7 {
        return None;
    }

    let kind = match parts[0] {
        "preview.v1" => MarkerKind::Preview,
        "v3" => MarkerKind::Metadata,
        _ => return None,
    };

    let timestamp = format!(
        "{}-{}-{}T{}:00:00Z",
        parts[1], parts[2], parts[3], parts[4]
    );
    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .ok()?
        .with_timezone(&Utc);

    Some(MarkerEntry {
        kind,
        timestamp,
        user_id: parts[5].to_string(),
        project_id: parts[6].to_string(),
    })
}
