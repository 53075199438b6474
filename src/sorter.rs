use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::error::{Error, Result};
use crate::metadata::{ImageMetadata, ProjectMetadata};
use crate::rotation::{find_image, find_project_dirs, metadata_artifact};

/// Capture-time sort totals.
#[derive(Debug, Default, Clone, Copy)]
pub struct SortStats {
    pub projects: usize,
    pub projects_skipped: usize,
    pub images: usize,
    pub renamed: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Renames downloaded JPEGs into a capture-time-sortable scheme.
///
/// A matched image becomes `{model}_{serial}_{YYYYMMDD_HHMMSS}_{image_id}.jpg`;
/// the trailing image id keeps names unique even when two frames share
/// camera and timestamp. JPEGs with no usable metadata take the
/// `zz_unsorted_{stem}.jpg` fallback, which sorts after every matched name.
/// With an output directory set, files are copied there instead of renamed
/// in place, keeping the per-project directory level.
pub struct CaptureTimeSorter {
    cache: Arc<CacheStore>,
    output_dir: Option<PathBuf>,
    overwrite: bool,
}

impl CaptureTimeSorter {
    pub fn new(cache: Arc<CacheStore>, output_dir: Option<PathBuf>, overwrite: bool) -> Self {
        Self {
            cache,
            output_dir,
            overwrite,
        }
    }

    /// Sort every project directory under the input root.
    pub fn run(&self, input_root: &Path) -> Result<SortStats> {
        let mut stats = SortStats::default();

        let project_dirs = find_project_dirs(input_root)?;
        info!(projects = project_dirs.len(), "Sorting by capture time");

        for project_dir in project_dirs {
            match self.sort_project(&project_dir, &mut stats) {
                Ok(()) => stats.projects += 1,
                Err(e) => {
                    warn!(project = %project_dir.display(), error = %e, "Skipping project");
                    stats.projects_skipped += 1;
                }
            }
        }

        info!(
            projects = stats.projects,
            images = stats.images,
            renamed = stats.renamed,
            skipped = stats.skipped,
            errors = stats.errors,
            "Capture-time sort finished"
        );

        Ok(stats)
    }

    fn sort_project(&self, project_dir: &Path, stats: &mut SortStats) -> Result<()> {
        let metadata_path = metadata_artifact(project_dir)?;
        let metadata = ProjectMetadata::read_from(&metadata_path)?;

        // Snapshot before any rename so files this pass produces are never
        // re-candidates within it.
        let snapshot = list_jpegs(project_dir)?;
        let expected: std::collections::HashSet<String> =
            metadata.images.iter().filter_map(sorted_name).collect();
        let mut handled: std::collections::HashSet<PathBuf> = std::collections::HashSet::new();

        // Metadata-driven pass.
        for entry in &metadata.images {
            let Some(jpeg_path) = find_image(project_dir, &entry.image_id) else {
                debug!(image = %entry.image_id, "No local file for metadata entry");
                continue;
            };

            stats.images += 1;
            let target_name =
                sorted_name(entry).unwrap_or_else(|| fallback_name(&jpeg_path));
            match self.place(project_dir, &jpeg_path, &target_name) {
                Ok(true) => stats.renamed += 1,
                Ok(false) => stats.skipped += 1,
                Err(e) => {
                    warn!(path = %jpeg_path.display(), error = %e, "Sort failed");
                    stats.errors += 1;
                }
            }
            handled.insert(jpeg_path);
        }

        // Fallback pass over JPEGs the metadata never mentioned. Files that
        // already carry a sorted or fallback name are left where they are.
        for jpeg_path in snapshot {
            if handled.contains(&jpeg_path) || !jpeg_path.exists() {
                continue;
            }
            let filename = jpeg_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            stats.images += 1;
            if expected.contains(&filename) || filename.starts_with("zz_unsorted_") {
                stats.skipped += 1;
                continue;
            }

            match self.place(project_dir, &jpeg_path, &fallback_name(&jpeg_path)) {
                Ok(true) => stats.renamed += 1,
                Ok(false) => stats.skipped += 1,
                Err(e) => {
                    warn!(path = %jpeg_path.display(), error = %e, "Sort failed");
                    stats.errors += 1;
                }
            }
        }

        Ok(())
    }

    /// Place one file under its target name. Returns whether it was renamed
    /// or copied.
    fn place(&self, project_dir: &Path, jpeg_path: &Path, target_name: &str) -> Result<bool> {
        let filename = jpeg_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        // A file the sorter placed in an earlier run carries a cache entry
        // under its current name.
        if !self.overwrite && self.cache.has(&sort_cache_key(project_dir, &filename)) {
            debug!(file = %filename, "Already sorted, skipping");
            return Ok(false);
        }

        let target_path = match &self.output_dir {
            Some(out_root) => {
                let project = project_dir.file_name().unwrap_or_default();
                out_root.join(project).join(target_name)
            }
            None => project_dir.join(target_name),
        };

        if target_path == jpeg_path {
            debug!(file = %filename, "Name already correct");
            self.mark_sorted(project_dir, target_name, &target_path)?;
            return Ok(false);
        }

        if target_path.exists() && !self.overwrite {
            debug!(target = %target_path.display(), "Target exists, skipping");
            return Ok(false);
        }

        if let Some(parent) = target_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }

        if self.output_dir.is_some() {
            std::fs::copy(jpeg_path, &target_path).map_err(|e| Error::io(&target_path, e))?;
            // Source stays put in copy mode, so future runs skip on it.
            self.mark_sorted(project_dir, &filename, jpeg_path)?;
        } else {
            std::fs::rename(jpeg_path, &target_path).map_err(|e| Error::io(&target_path, e))?;
            self.mark_sorted(project_dir, target_name, &target_path)?;
        }

        debug!(from = %filename, to = %target_name, "Sorted");
        Ok(true)
    }

    fn mark_sorted(&self, project_dir: &Path, filename: &str, path: &Path) -> Result<()> {
        self.cache
            .mark_complete(&sort_cache_key(project_dir, filename), path)
    }
}

fn fallback_name(jpeg_path: &Path) -> String {
    let stem = jpeg_path
        .file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("zz_unsorted_{stem}.jpg")
}

/// Target filename for an entry carrying capture time, model, and serial;
/// `None` when any of the three is missing.
fn sorted_name(entry: &ImageMetadata) -> Option<String> {
    let capture_time = entry.capture_time?;
    let model = sanitize_component(entry.camera_model.as_deref()?);
    let serial = sanitize_component(entry.camera_serial.as_deref()?);
    Some(format!(
        "{model}_{serial}_{}_{}.jpg",
        capture_time.format("%Y%m%d_%H%M%S"),
        entry.image_id
    ))
}

/// Keep letters, digits, `.`, `_`, `-`; everything else becomes `_`, runs
/// collapse, and edges are trimmed.
pub fn sanitize_component(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    let mut last_was_underscore = false;
    for c in component.chars() {
        let c = match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' => c,
            _ => '_',
        };
        if c == '_' {
            if last_was_underscore {
                continue;
            }
            last_was_underscore = true;
        } else {
            last_was_underscore = false;
        }
        out.push(c);
    }
    out.trim_matches('_').to_string()
}

/// JPEGs in a project directory, sorted by name for a deterministic pass.
fn list_jpegs(project_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut jpegs = Vec::new();
    let entries = std::fs::read_dir(project_dir).map_err(|e| Error::io(project_dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(project_dir, e))?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy().to_ascii_lowercase();
        if path.is_file() && (name.ends_with(".jpg") || name.ends_with(".jpeg")) {
            jpegs.push(path);
        }
    }
    jpegs.sort();
    Ok(jpegs)
}

fn sort_cache_key(project_dir: &Path, filename: &str) -> String {
    let project = project_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{project}/{filename}")
}
