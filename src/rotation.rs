use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::error::{Error, Result};
use crate::metadata::{ProjectMetadata, Rotation};

/// Rotation correction totals.
#[derive(Debug, Default, Clone, Copy)]
pub struct RotationStats {
    pub projects: usize,
    pub projects_skipped: usize,
    pub images: usize,
    pub corrected: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Applies the upload-recorded rotation to each downloaded JPEG, in place.
///
/// The rotation cache keeps the pass idempotent: without `overwrite`, a file
/// corrected in an earlier run (or recorded as needing no rotation) is never
/// touched again.
pub struct RotationCorrector {
    cache: Arc<CacheStore>,
    overwrite: bool,
}

impl RotationCorrector {
    pub fn new(cache: Arc<CacheStore>, overwrite: bool) -> Self {
        Self { cache, overwrite }
    }

    /// Correct every project directory under the input root.
    pub fn run(&self, input_root: &Path) -> Result<RotationStats> {
        let mut stats = RotationStats::default();

        let project_dirs = find_project_dirs(input_root)?;
        info!(projects = project_dirs.len(), "Correcting rotations");

        for project_dir in project_dirs {
            match self.correct_project(&project_dir, &mut stats) {
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
            corrected = stats.corrected,
            skipped = stats.skipped,
            errors = stats.errors,
            "Rotation correction finished"
        );

        Ok(stats)
    }

    fn correct_project(&self, project_dir: &Path, stats: &mut RotationStats) -> Result<()> {
        let metadata_path = metadata_artifact(project_dir)?;
        let metadata = ProjectMetadata::read_from(&metadata_path)?;

        for entry in &metadata.images {
            let Some(jpeg_path) = find_image(project_dir, &entry.image_id) else {
                debug!(image = %entry.image_id, "No local file for metadata entry");
                continue;
            };

            stats.images += 1;
            let cache_key = rotation_cache_key(project_dir, &entry.image_id);

            if !self.overwrite && self.cache.has(&cache_key) {
                debug!(image = %entry.image_id, "Already corrected, skipping");
                stats.skipped += 1;
                continue;
            }

            match self.correct_image(&jpeg_path, entry.rotation) {
                Ok(rotated) => {
                    if let Err(e) = self.cache.mark_complete(&cache_key, &jpeg_path) {
                        warn!(image = %entry.image_id, error = %e, "Cache update failed");
                    }
                    if rotated {
                        stats.corrected += 1;
                    } else {
                        stats.skipped += 1;
                    }
                }
                Err(e) => {
                    warn!(image = %entry.image_id, error = %e, "Rotation failed");
                    stats.errors += 1;
                }
            }
        }

        Ok(())
    }

    /// Rotate one file in place. Returns whether pixels changed.
    fn correct_image(&self, jpeg_path: &Path, rotation: Rotation) -> Result<bool> {
        if rotation == Rotation::None {
            return Ok(false);
        }

        let img = image::open(jpeg_path)
            .map_err(|e| Error::corrupt(jpeg_path, format!("cannot decode image: {e}")))?;

        let rotated = match rotation {
            Rotation::None => unreachable!(),
            Rotation::Cw90 => img.rotate90(),
            Rotation::Cw180 => img.rotate180(),
            Rotation::Cw270 => img.rotate270(),
        };

        let file = File::create(jpeg_path).map_err(|e| Error::io(jpeg_path, e))?;
        let mut writer = BufWriter::new(file);
        rotated
            .write_with_encoder(JpegEncoder::new_with_quality(&mut writer, 95))
            .map_err(|e| Error::corrupt(jpeg_path, format!("cannot encode image: {e}")))?;

        debug!(
            path = %jpeg_path.display(),
            degrees = rotation.degrees(),
            "Rotated image"
        );
        Ok(true)
    }
}

/// Project directories are those holding a metadata artifact.
pub fn find_project_dirs(input_root: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    let entries = std::fs::read_dir(input_root).map_err(|e| Error::io(input_root, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(input_root, e))?;
        let path = entry.path();
        if path.is_dir() && metadata_artifact(&path).is_ok() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// The project's `*.v3.gz`, ignoring macOS `._` companion files.
pub fn metadata_artifact(project_dir: &Path) -> Result<PathBuf> {
    let entries = std::fs::read_dir(project_dir).map_err(|e| Error::io(project_dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(project_dir, e))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(".v3.gz") && !name.starts_with("._") {
            return Ok(entry.path());
        }
    }
    Err(Error::corrupt(project_dir, "no metadata artifact"))
}

/// Locate the JPEG for an image id, probing the usual extensions.
pub fn find_image(project_dir: &Path, image_id: &str) -> Option<PathBuf> {
    for ext in [".jpg", ".jpeg", ".JPG", ".JPEG"] {
        let candidate = project_dir.join(format!("{image_id}{ext}"));
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

fn rotation_cache_key(project_dir: &Path, image_id: &str) -> String {
    let project = project_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{project}/{image_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use image::{DynamicImage, ImageFormat, RgbImage};
    use std::io::Write;
    use tempfile::{tempdir, TempDir};

    fn write_artifact(project_dir: &Path, project_id: &str, images: serde_json::Value) {
        let payload = serde_json::json!({ "images": images });
        let mut encoder = GzEncoder::new(
            File::create(project_dir.join(format!("{project_id}.v3.gz"))).unwrap(),
            Compression::default(),
        );
        encoder.write_all(payload.to_string().as_bytes()).unwrap();
        encoder.finish().unwrap();
    }

    /// A 4x2 solid-color JPEG; rotation by 90 degrees flips its dimensions.
    fn write_jpeg(path: &Path) {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 2, image::Rgb([200, 30, 30])));
        img.save_with_format(path, ImageFormat::Jpeg).unwrap();
    }

    fn dimensions(path: &Path) -> (u32, u32) {
        let img = image::open(path).unwrap();
        (img.width(), img.height())
    }

    fn setup_project(images: &[(&str, &str)]) -> (TempDir, PathBuf) {
        let root = tempdir().unwrap();
        let project_dir = root.path().join("proj-1");
        std::fs::create_dir(&project_dir).unwrap();

        let entries: Vec<serde_json::Value> = images
            .iter()
            .map(|(id, rotation)| {
                serde_json::json!({ "id": id, "meta": { "rotation": rotation } })
            })
            .collect();
        write_artifact(&project_dir, "proj-1", serde_json::json!(entries));

        for (id, _) in images {
            write_jpeg(&project_dir.join(format!("{id}.jpg")));
        }

        (root, project_dir)
    }

    #[test]
    fn test_rotation_applied_once() {
        let (root, project_dir) = setup_project(&[("img-1", "CW90")]);
        let cache_dir = tempdir().unwrap();
        let cache = Arc::new(CacheStore::open(cache_dir.path(), "rotation").unwrap());

        let corrector = RotationCorrector::new(cache.clone(), false);
        let stats = corrector.run(root.path()).unwrap();
        assert_eq!(stats.corrected, 1);
        assert_eq!(dimensions(&project_dir.join("img-1.jpg")), (2, 4));

        // Second pass is a no-op via the cache; the file stays 2x4.
        let stats = corrector.run(root.path()).unwrap();
        assert_eq!(stats.corrected, 0);
        assert_eq!(stats.skipped, 1);
        assert_eq!(dimensions(&project_dir.join("img-1.jpg")), (2, 4));
    }

    #[test]
    fn test_overwrite_reapplies() {
        let (root, project_dir) = setup_project(&[("img-1", "CW90")]);
        let cache_dir = tempdir().unwrap();
        let cache = Arc::new(CacheStore::open(cache_dir.path(), "rotation").unwrap());

        RotationCorrector::new(cache.clone(), false)
            .run(root.path())
            .unwrap();
        assert_eq!(dimensions(&project_dir.join("img-1.jpg")), (2, 4));

        let stats = RotationCorrector::new(cache, true).run(root.path()).unwrap();
        assert_eq!(stats.corrected, 1);
        // Rotated again: back to 4x2.
        assert_eq!(dimensions(&project_dir.join("img-1.jpg")), (4, 2));
    }

    #[test]
    fn test_none_rotation_leaves_bytes_untouched() {
        let (root, project_dir) = setup_project(&[("img-1", "None")]);
        let before = std::fs::read(project_dir.join("img-1.jpg")).unwrap();
        let cache_dir = tempdir().unwrap();
        let cache = Arc::new(CacheStore::open(cache_dir.path(), "rotation").unwrap());

        let stats = RotationCorrector::new(cache, false).run(root.path()).unwrap();
        assert_eq!(stats.corrected, 0);
        assert_eq!(stats.skipped, 1);

        let after = std::fs::read(project_dir.join("img-1.jpg")).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_corrupt_metadata_skips_project() {
        let root = tempdir().unwrap();
        let project_dir = root.path().join("proj-bad");
        std::fs::create_dir(&project_dir).unwrap();
        std::fs::write(project_dir.join("proj-bad.v3.gz"), b"not gzip").unwrap();
        write_jpeg(&project_dir.join("img-1.jpg"));

        let cache_dir = tempdir().unwrap();
        let cache = Arc::new(CacheStore::open(cache_dir.path(), "rotation").unwrap());

        let stats = RotationCorrector::new(cache, false).run(root.path()).unwrap();
        assert_eq!(stats.projects_skipped, 1);
        assert_eq!(stats.projects, 0);
    }

    #[test]
    fn test_macos_companion_artifact_ignored() {
        let root = tempdir().unwrap();
        let project_dir = root.path().join("proj-1");
        std::fs::create_dir(&project_dir).unwrap();
        std::fs::write(project_dir.join("._proj-1.v3.gz"), b"junk").unwrap();

        // Only the companion file exists, so this is not a project directory.
        assert!(find_project_dirs(root.path()).unwrap().is_empty());
    }
}
