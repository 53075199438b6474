use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::config::DownloadConfig;
use crate::object_store::ObjectStore;
use crate::qualification::QualifyingProject;

/// Per-project download tally.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProjectTally {
    pub downloaded: usize,
    pub cached: usize,
    pub failed: usize,
    /// Listing the preview prefix failed; no files were attempted.
    pub listing_failed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectStatus {
    Complete,
    Partial,
    Failed,
}

impl ProjectTally {
    pub fn status(&self) -> ProjectStatus {
        if self.listing_failed {
            ProjectStatus::Failed
        } else if self.failed == 0 {
            ProjectStatus::Complete
        } else if self.downloaded + self.cached > 0 {
            ProjectStatus::Partial
        } else {
            ProjectStatus::Failed
        }
    }
}

/// Totals across the whole run.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunSummary {
    pub complete: usize,
    pub partial: usize,
    pub failed: usize,
    pub files_downloaded: usize,
    pub files_cached: usize,
    pub files_failed: usize,
}

impl RunSummary {
    fn absorb(&mut self, tally: &ProjectTally) {
        match tally.status() {
            ProjectStatus::Complete => self.complete += 1,
            ProjectStatus::Partial => self.partial += 1,
            ProjectStatus::Failed => self.failed += 1,
        }
        self.files_downloaded += tally.downloaded;
        self.files_cached += tally.cached;
        self.files_failed += tally.failed;
    }
}

enum FileOutcome {
    Downloaded,
    Cached,
    Failed,
}

/// Materializes qualifying projects on local disk.
///
/// Projects proceed up to `max_projects` at a time; within a project, the
/// metadata artifact and up to `max_images` preview JPEGs download with
/// `file_concurrency` in flight. Every file consults the download cache
/// first, and a failure on one file never aborts its siblings or other
/// projects.
pub struct Downloader {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    cache: Arc<CacheStore>,
    config: DownloadConfig,
    output_root: PathBuf,
}

impl Downloader {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bucket: String,
        cache: Arc<CacheStore>,
        config: DownloadConfig,
        output_root: PathBuf,
    ) -> Self {
        Self {
            store,
            bucket,
            cache,
            config,
            output_root,
        }
    }

    /// Download every qualifying project and report run totals.
    pub async fn run(&self, projects: Vec<QualifyingProject>) -> RunSummary {
        info!(
            projects = projects.len(),
            max_projects = self.config.max_projects,
            max_images = self.config.max_images,
            "Starting downloads"
        );

        let tallies: Vec<ProjectTally> = stream::iter(projects)
            .map(|project| async move {
                let tally = self.download_project(&project).await;
                match tally.status() {
                    ProjectStatus::Complete => debug!(
                        project = %project.key,
                        downloaded = tally.downloaded,
                        cached = tally.cached,
                        "Project complete"
                    ),
                    ProjectStatus::Partial => warn!(
                        project = %project.key,
                        downloaded = tally.downloaded,
                        failed = tally.failed,
                        "Project partially downloaded"
                    ),
                    ProjectStatus::Failed => warn!(project = %project.key, "Project failed"),
                }
                tally
            })
            .buffer_unordered(self.config.max_projects)
            .collect()
            .await;

        let mut summary = RunSummary::default();
        for tally in &tallies {
            summary.absorb(tally);
        }

        info!(
            complete = summary.complete,
            partial = summary.partial,
            failed = summary.failed,
            downloaded = summary.files_downloaded,
            cached = summary.files_cached,
            file_failures = summary.files_failed,
            "Download run finished"
        );

        summary
    }

    async fn download_project(&self, project: &QualifyingProject) -> ProjectTally {
        let project_dir = self.output_root.join(&project.key.project_id);
        if let Err(e) = tokio::fs::create_dir_all(&project_dir).await {
            warn!(project = %project.key, error = %e, "Cannot create project directory");
            return ProjectTally {
                listing_failed: true,
                ..ProjectTally::default()
            };
        }

        let mut tally = ProjectTally::default();

        // The metadata artifact drives both post-processing passes, so it is
        // fetched alongside the images.
        let metadata_name = filename_of(&project.metadata_key);
        match self
            .download_file(&project.metadata_key, &project_dir.join(metadata_name))
            .await
        {
            FileOutcome::Downloaded => tally.downloaded += 1,
            FileOutcome::Cached => tally.cached += 1,
            FileOutcome::Failed => tally.failed += 1,
        }

        let listed = match self.store.list(&self.bucket, &project.preview_prefix).await {
            Ok(objects) => objects,
            Err(e) => {
                warn!(project = %project.key, error = %e, "Cannot list preview prefix");
                tally.listing_failed = true;
                return tally;
            }
        };

        let keys: Vec<String> = listed.into_iter().map(|obj| obj.key).collect();
        let selected = select_images(keys, self.config.max_images);
        debug!(project = %project.key, images = selected.len(), "Selected preview images");

        let outcomes: Vec<FileOutcome> = stream::iter(selected)
            .map(|key| {
                let local_path = project_dir.join(filename_of(&key));
                async move { self.download_file(&key, &local_path).await }
            })
            .buffer_unordered(self.config.file_concurrency)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                FileOutcome::Downloaded => tally.downloaded += 1,
                FileOutcome::Cached => tally.cached += 1,
                FileOutcome::Failed => tally.failed += 1,
            }
        }

        tally
    }

    async fn download_file(&self, key: &str, local_path: &Path) -> FileOutcome {
        if !self.cache.try_claim(key) {
            debug!(key, "Already downloaded, skipping");
            return FileOutcome::Cached;
        }

        let bytes = match self.store.get(&self.bucket, key).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key, error = %e, "Download failed");
                self.cache.release(key);
                return FileOutcome::Failed;
            }
        };

        if let Err(e) = tokio::fs::write(local_path, &bytes).await {
            warn!(key, path = %local_path.display(), error = %e, "Write failed");
            self.cache.release(key);
            return FileOutcome::Failed;
        }

        // Marking strictly follows the successful write.
        if let Err(e) = self.cache.mark_complete(key, local_path) {
            warn!(key, error = %e, "Cache update failed");
            return FileOutcome::Failed;
        }

        debug!(key, bytes = bytes.len(), "Downloaded");
        FileOutcome::Downloaded
    }
}

/// Deterministic image selection: JPEG keys only, lexicographic order,
/// truncated to `max_images` (0 means unbounded).
///
/// A pure function of the listed keys, so a resumed run selects the same
/// subset regardless of listing arrival order.
pub fn select_images(keys: Vec<String>, max_images: usize) -> Vec<String> {
    let mut jpegs: Vec<String> = keys
        .into_iter()
        .filter(|key| {
            let lower = key.to_ascii_lowercase();
            lower.ends_with(".jpg") || lower.ends_with(".jpeg")
        })
        .collect();
    jpegs.sort();
    if max_images > 0 {
        jpegs.truncate(max_images);
    }
    jpegs
}

fn filename_of(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ObjectStoreError;
    use crate::object_store::ObjectInfo;
    use crate::qualification::ProjectKey;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct FakeStore {
        objects: HashMap<String, Vec<u8>>,
        fetches: AtomicUsize,
        fail_keys: Vec<String>,
    }

    impl FakeStore {
        fn new(objects: Vec<(&str, &[u8])>) -> Self {
            Self {
                objects: objects
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_vec()))
                    .collect(),
                fetches: AtomicUsize::new(0),
                fail_keys: Vec::new(),
            }
        }

        fn failing(mut self, key: &str) -> Self {
            self.fail_keys.push(key.to_string());
            self
        }

        fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ObjectStore for FakeStore {
        async fn list(
            &self,
            _bucket: &str,
            prefix: &str,
        ) -> std::result::Result<Vec<ObjectInfo>, ObjectStoreError> {
            Ok(self
                .objects
                .keys()
                .filter(|k| k.starts_with(prefix))
                .map(|k| ObjectInfo {
                    key: k.clone(),
                    size: 0,
                    last_modified: None,
                })
                .collect())
        }

        async fn list_prefixes(
            &self,
            _bucket: &str,
            _prefix: &str,
            _delimiter: &str,
        ) -> std::result::Result<Vec<String>, ObjectStoreError> {
            Ok(Vec::new())
        }

        async fn get(
            &self,
            _bucket: &str,
            key: &str,
        ) -> std::result::Result<Vec<u8>, ObjectStoreError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail_keys.iter().any(|k| k == key) {
                return Err(ObjectStoreError::Transient {
                    key: key.to_string(),
                    message: "injected failure".to_string(),
                });
            }
            self.objects
                .get(key)
                .cloned()
                .ok_or_else(|| ObjectStoreError::NotFound {
                    key: key.to_string(),
                })
        }
    }

    fn project(user: &str, id: &str) -> QualifyingProject {
        QualifyingProject::new(ProjectKey::new(user, id))
    }

    fn downloader(
        store: Arc<FakeStore>,
        cache_dir: &Path,
        output_root: &Path,
    ) -> Downloader {
        Downloader::new(
            store,
            "bucket".to_string(),
            Arc::new(CacheStore::open(cache_dir, "downloads").unwrap()),
            DownloadConfig::default(),
            output_root.to_path_buf(),
        )
    }

    #[test]
    fn test_select_images_deterministic() {
        let keys = vec![
            "p/preview.v1/c.jpg".to_string(),
            "p/preview.v1/a.JPG".to_string(),
            "p/preview.v1/d.jpeg".to_string(),
            "p/preview.v1/notes.txt".to_string(),
            "p/preview.v1/b.jpg".to_string(),
        ];

        let selected = select_images(keys.clone(), 3);
        assert_eq!(
            selected,
            vec![
                "p/preview.v1/a.JPG".to_string(),
                "p/preview.v1/b.jpg".to_string(),
                "p/preview.v1/c.jpg".to_string(),
            ]
        );

        // Zero cap keeps every JPEG.
        assert_eq!(select_images(keys, 0).len(), 4);
    }

    #[tokio::test]
    async fn test_downloads_land_in_project_layout() {
        let p = project("user-1", "proj-1");
        let store = Arc::new(FakeStore::new(vec![
            ("user-1/proj-1/proj-1.v3.gz", b"meta".as_slice()),
            ("user-1/proj-1/preview.v1/img1.jpg", b"one".as_slice()),
            ("user-1/proj-1/preview.v1/img2.jpg", b"two".as_slice()),
        ]));
        let cache_dir = tempdir().unwrap();
        let out = tempdir().unwrap();

        let summary = downloader(store.clone(), cache_dir.path(), out.path())
            .run(vec![p])
            .await;

        assert_eq!(summary.complete, 1);
        assert_eq!(summary.files_downloaded, 3);
        assert!(out.path().join("proj-1/proj-1.v3.gz").exists());
        assert!(out.path().join("proj-1/img1.jpg").exists());
        assert!(out.path().join("proj-1/img2.jpg").exists());
    }

    #[tokio::test]
    async fn test_second_run_fetches_nothing() {
        let p = project("user-1", "proj-1");
        let store = Arc::new(FakeStore::new(vec![
            ("user-1/proj-1/proj-1.v3.gz", b"meta".as_slice()),
            ("user-1/proj-1/preview.v1/img1.jpg", b"one".as_slice()),
        ]));
        let cache_dir = tempdir().unwrap();
        let out = tempdir().unwrap();

        downloader(store.clone(), cache_dir.path(), out.path())
            .run(vec![p.clone()])
            .await;
        let first_run = store.fetch_count();
        assert_eq!(first_run, 2);

        // Fresh downloader over the same persisted cache.
        let summary = downloader(store.clone(), cache_dir.path(), out.path())
            .run(vec![p])
            .await;

        assert_eq!(store.fetch_count(), first_run);
        assert_eq!(summary.files_cached, 2);
        assert_eq!(summary.files_downloaded, 0);
    }

    #[tokio::test]
    async fn test_failed_file_does_not_abort_siblings() {
        let p = project("user-1", "proj-1");
        let store = Arc::new(
            FakeStore::new(vec![
                ("user-1/proj-1/proj-1.v3.gz", b"meta".as_slice()),
                ("user-1/proj-1/preview.v1/img1.jpg", b"one".as_slice()),
                ("user-1/proj-1/preview.v1/img2.jpg", b"two".as_slice()),
            ])
            .failing("user-1/proj-1/preview.v1/img1.jpg"),
        );
        let cache_dir = tempdir().unwrap();
        let out = tempdir().unwrap();

        let summary = downloader(store.clone(), cache_dir.path(), out.path())
            .run(vec![p.clone()])
            .await;

        assert_eq!(summary.partial, 1);
        assert_eq!(summary.files_failed, 1);
        assert!(out.path().join("proj-1/img2.jpg").exists());

        // A failed file holds no cache entry, so a re-run retries only it.
        let store2 = Arc::new(FakeStore::new(vec![
            ("user-1/proj-1/proj-1.v3.gz", b"meta".as_slice()),
            ("user-1/proj-1/preview.v1/img1.jpg", b"one".as_slice()),
            ("user-1/proj-1/preview.v1/img2.jpg", b"two".as_slice()),
        ]));
        let summary = downloader(store2.clone(), cache_dir.path(), out.path())
            .run(vec![p])
            .await;
        assert_eq!(store2.fetch_count(), 1);
        assert_eq!(summary.files_downloaded, 1);
        assert_eq!(summary.complete, 1);
    }

    #[tokio::test]
    async fn test_max_images_cap_applies() {
        let p = project("user-1", "proj-1");
        let mut objects = vec![("user-1/proj-1/proj-1.v3.gz".to_string(), b"meta".to_vec())];
        for i in 0..30 {
            objects.push((
                format!("user-1/proj-1/preview.v1/img{i:02}.jpg"),
                b"x".to_vec(),
            ));
        }
        let store = Arc::new(FakeStore::new(
            objects
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_slice()))
                .collect(),
        ));
        let cache_dir = tempdir().unwrap();
        let out = tempdir().unwrap();

        let summary = downloader(store, cache_dir.path(), out.path()).run(vec![p]).await;

        // Metadata plus the 20 lexicographically-first images.
        assert_eq!(summary.files_downloaded, 21);
        assert!(out.path().join("proj-1/img00.jpg").exists());
        assert!(out.path().join("proj-1/img19.jpg").exists());
        assert!(!out.path().join("proj-1/img20.jpg").exists());
    }

    #[tokio::test]
    async fn test_failed_project_does_not_abort_others() {
        let good = project("user-1", "proj-good");
        let bad = project("user-1", "proj-bad");
        let store = Arc::new(
            FakeStore::new(vec![
                ("user-1/proj-good/proj-good.v3.gz", b"meta".as_slice()),
                ("user-1/proj-good/preview.v1/img1.jpg", b"one".as_slice()),
            ])
            .failing("user-1/proj-bad/proj-bad.v3.gz"),
        );
        let cache_dir = tempdir().unwrap();
        let out = tempdir().unwrap();

        let summary = downloader(store, cache_dir.path(), out.path())
            .run(vec![bad, good])
            .await;

        assert_eq!(summary.complete, 1);
        assert!(out.path().join("proj-good/img1.jpg").exists());
    }
}
