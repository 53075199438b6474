use std::fs;
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};
use flate2::read::GzDecoder;
use serde::Deserialize;
use tracing::warn;

use crate::error::{Error, Result};

/// Per-image rotation recorded at upload time, clockwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    None,
    Cw90,
    Cw180,
    Cw270,
}

impl Rotation {
    /// Parse an upload-side rotation label.
    ///
    /// Clockwise labels map 1:1; the uploader's counter-clockwise labels are
    /// normalized to their clockwise equivalents. Anything unrecognized is
    /// treated as no rotation, with a warning.
    pub fn from_label(label: Option<&str>) -> Self {
        match label {
            None | Some("None") => Rotation::None,
            Some("CW90") => Rotation::Cw90,
            Some("CW180") => Rotation::Cw180,
            Some("CW270") => Rotation::Cw270,
            Some("CCW90") => Rotation::Cw270,
            Some("CCW180") => Rotation::Cw180,
            Some("CCW270") => Rotation::Cw90,
            Some(other) => {
                warn!(rotation = %other, "Unknown rotation label, treating as none");
                Rotation::None
            }
        }
    }

    /// Clockwise degrees to apply.
    pub fn degrees(self) -> u32 {
        match self {
            Rotation::None => 0,
            Rotation::Cw90 => 90,
            Rotation::Cw180 => 180,
            Rotation::Cw270 => 270,
        }
    }
}

/// Decoded metadata for one image in a project upload.
#[derive(Debug, Clone)]
pub struct ImageMetadata {
    pub image_id: String,
    pub rotation: Rotation,
    pub capture_time: Option<DateTime<Utc>>,
    pub camera_model: Option<String>,
    pub camera_serial: Option<String>,
}

/// Decoded contents of a project's metadata artifact.
///
/// Reconstructed fresh on every access; never mutated.
#[derive(Debug, Clone)]
pub struct ProjectMetadata {
    pub images: Vec<ImageMetadata>,
}

// Raw wire shapes. The artifact is gzipped JSON of the form
// {"images":[{"id":..., "meta":{"rotation":..., "capture_time":...,
// "model":..., "camera_serial":...}}]}.
#[derive(Deserialize)]
struct RawUpload {
    #[serde(default)]
    images: Vec<RawImage>,
}

#[derive(Deserialize)]
struct RawImage {
    id: String,
    #[serde(default)]
    meta: Option<RawMeta>,
}

#[derive(Deserialize, Default)]
struct RawMeta {
    rotation: Option<String>,
    capture_time: Option<String>,
    model: Option<String>,
    camera_serial: Option<String>,
}

impl ProjectMetadata {
    /// Decode a raw artifact. `origin` is only used for error reporting.
    pub fn decode(bytes: &[u8], origin: &Path) -> Result<Self> {
        let mut decoder = GzDecoder::new(bytes);
        let mut json = Vec::new();
        decoder
            .read_to_end(&mut json)
            .map_err(|e| Error::corrupt(origin, format!("not valid gzip: {e}")))?;

        let raw: RawUpload = serde_json::from_slice(&json)
            .map_err(|e| Error::corrupt(origin, format!("unexpected schema: {e}")))?;

        let images = raw
            .images
            .into_iter()
            .map(|img| {
                let meta = img.meta.unwrap_or_default();
                ImageMetadata {
                    image_id: img.id,
                    rotation: Rotation::from_label(meta.rotation.as_deref()),
                    capture_time: meta.capture_time.as_deref().and_then(parse_capture_time),
                    camera_model: meta.model,
                    camera_serial: meta.camera_serial,
                }
            })
            .collect();

        Ok(Self { images })
    }

    /// Read and decode an artifact from disk.
    pub fn read_from(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| Error::io(path, e))?;
        Self::decode(&bytes, path)
    }

    /// Look up the entry for an image id.
    pub fn get(&self, image_id: &str) -> Option<&ImageMetadata> {
        self.images.iter().find(|img| img.image_id == image_id)
    }
}

/// Parse an upload capture time: RFC 3339, or naive ISO assumed UTC.
fn parse_capture_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    warn!(capture_time = %raw, "Unparseable capture time");
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip_json(value: &serde_json::Value) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(value.to_string().as_bytes())
            .unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_rotation_labels() {
        assert_eq!(Rotation::from_label(None), Rotation::None);
        assert_eq!(Rotation::from_label(Some("None")), Rotation::None);
        assert_eq!(Rotation::from_label(Some("CW90")), Rotation::Cw90);
        assert_eq!(Rotation::from_label(Some("CW180")), Rotation::Cw180);
        assert_eq!(Rotation::from_label(Some("CW270")), Rotation::Cw270);
        assert_eq!(Rotation::from_label(Some("CCW90")), Rotation::Cw270);
        assert_eq!(Rotation::from_label(Some("CCW270")), Rotation::Cw90);
        assert_eq!(Rotation::from_label(Some("sideways")), Rotation::None);
    }

    #[test]
    fn test_decode_artifact() {
        let payload = serde_json::json!({
            "images": [
                {
                    "id": "img-1",
                    "meta": {
                        "rotation": "CW90",
                        "capture_time": "2025-07-12T02:32:56",
                        "model": "Canon EOS R5",
                        "camera_serial": "12345"
                    }
                },
                {
                    "id": "img-2",
                    "meta": { "rotation": "None" }
                },
                { "id": "img-3" }
            ]
        });

        let meta =
            ProjectMetadata::decode(&gzip_json(&payload), Path::new("test.v3.gz")).unwrap();

        assert_eq!(meta.images.len(), 3);

        let first = meta.get("img-1").unwrap();
        assert_eq!(first.rotation, Rotation::Cw90);
        assert_eq!(first.camera_model.as_deref(), Some("Canon EOS R5"));
        assert_eq!(
            first.capture_time.unwrap().format("%Y%m%d_%H%M%S").to_string(),
            "20250712_023256"
        );

        let second = meta.get("img-2").unwrap();
        assert_eq!(second.rotation, Rotation::None);
        assert!(second.capture_time.is_none());

        // An entry with no meta block still decodes.
        assert_eq!(meta.get("img-3").unwrap().rotation, Rotation::None);
    }

    #[test]
    fn test_decode_rfc3339_capture_time() {
        let payload = serde_json::json!({
            "images": [{
                "id": "a",
                "meta": { "capture_time": "2025-07-12T02:32:56Z" }
            }]
        });
        let meta =
            ProjectMetadata::decode(&gzip_json(&payload), Path::new("t.v3.gz")).unwrap();
        assert!(meta.get("a").unwrap().capture_time.is_some());
    }

    #[test]
    fn test_not_gzip_is_corrupt() {
        let err = ProjectMetadata::decode(b"plainly not gzip", Path::new("bad.v3.gz"))
            .unwrap_err();
        assert!(matches!(err, Error::MetadataCorrupt { .. }));
    }

    #[test]
    fn test_bad_schema_is_corrupt() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"[1, 2, 3]").unwrap();
        let bytes = encoder.finish().unwrap();

        let err = ProjectMetadata::decode(&bytes, Path::new("bad.v3.gz")).unwrap_err();
        assert!(matches!(err, Error::MetadataCorrupt { .. }));
    }
}
