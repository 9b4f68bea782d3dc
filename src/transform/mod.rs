//! In-memory transformations applied to content on its way out.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use image::codecs::jpeg::JpegEncoder;

use crate::exif;
use crate::models::TimezoneContext;

/// Rewrites capture metadata inside an encoded image. Implementations must
/// be pure: identical inputs always yield identical bytes, since the output
/// is hashed at processing time and regenerated at upload time.
pub trait Transformer: Send + Sync {
    fn apply(
        &self,
        bytes: &[u8],
        corrected: NaiveDateTime,
        timezone: TimezoneContext,
    ) -> Result<Vec<u8>>;
}

pub struct ExifTransformer;

impl Transformer for ExifTransformer {
    fn apply(
        &self,
        bytes: &[u8],
        corrected: NaiveDateTime,
        timezone: TimezoneContext,
    ) -> Result<Vec<u8>> {
        let out = exif::rewrite_capture_time(bytes, corrected, timezone.offset_hours())?;
        Ok(out)
    }
}

/// Produces the thumbnail variant for a source image.
pub trait Thumbnailer: Send + Sync {
    fn thumbnail(&self, bytes: &[u8]) -> Result<Vec<u8>>;
}

/// Uses the preview JPEG cameras embed in IFD1.
pub struct EmbeddedThumbnailer;

impl Thumbnailer for EmbeddedThumbnailer {
    fn thumbnail(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        exif::embedded_thumbnail(bytes).context("no embedded preview")
    }
}

/// Decodes the full image and shrinks it to fit a square box.
pub struct ResizingThumbnailer {
    pub max_dimension: u32,
    pub quality: u8,
}

impl Default for ResizingThumbnailer {
    fn default() -> Self {
        Self {
            max_dimension: 400,
            quality: 85,
        }
    }
}

impl Thumbnailer for ResizingThumbnailer {
    fn thumbnail(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let decoded = image::load_from_memory(bytes).context("failed to decode image")?;
        let small = decoded
            .thumbnail(self.max_dimension, self.max_dimension)
            .to_rgb8();
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, self.quality)
            .encode_image(&small)
            .context("failed to encode thumbnail")?;
        Ok(out)
    }
}

/// Embedded preview first, a resized copy when the camera wrote none.
#[derive(Default)]
pub struct PreviewThumbnailer {
    resize: ResizingThumbnailer,
}

impl Thumbnailer for PreviewThumbnailer {
    fn thumbnail(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        if let Ok(preview) = EmbeddedThumbnailer.thumbnail(bytes) {
            return Ok(preview);
        }
        self.resize.thumbnail(bytes)
    }
}
