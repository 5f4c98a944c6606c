//! Single-image transcoding to lossy WebP.
//!
//! Transcoding is synchronous and CPU bound; callers run it on a blocking thread.

use std::path::Path;

use image::{DynamicImage, GenericImageView, RgbaImage};

use crate::error::{Error, Result};

/// Outcome of one successful transcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranscodeStats {
    pub width: u32,
    pub height: u32,
    pub encoded_bytes: u64,
}

/// Converts one raster image to the target codec.
pub trait ImageTranscoder: Send + Sync {
    /// Decodes `source` and writes the re-encoded image to `dest`.
    ///
    /// `source` is left in place; the caller decides when to delete it.
    fn transcode(&self, source: &Path, dest: &Path, quality: u8) -> Result<TranscodeStats>;

    /// Produces a preview that fits inside `max_width` x `max_height`,
    /// keeping the aspect ratio.
    fn thumbnail(&self, source: &Path, max_width: u32, max_height: u32) -> Result<RgbaImage>;
}

/// Rejects qualities outside `1..=100`.
pub fn validate_quality(quality: u8) -> Result<u8> {
    if (1..=100).contains(&quality) {
        Ok(quality)
    } else {
        Err(Error::InvalidQuality(quality))
    }
}

/// Lossy WebP encoder backed by libwebp.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebpTranscoder;

impl WebpTranscoder {
    fn open(source: &Path) -> Result<DynamicImage> {
        image::open(source).map_err(|e| Error::transcode(source, e))
    }
}

impl ImageTranscoder for WebpTranscoder {
    fn transcode(&self, source: &Path, dest: &Path, quality: u8) -> Result<TranscodeStats> {
        let quality = validate_quality(quality)?;
        let decoded = Self::open(source)?;
        let (width, height) = decoded.dimensions();

        // libwebp only takes 8-bit RGB or RGBA buffers
        let prepared = if decoded.color().has_alpha() {
            DynamicImage::ImageRgba8(decoded.to_rgba8())
        } else {
            DynamicImage::ImageRgb8(decoded.to_rgb8())
        };

        let encoded = webp::Encoder::from_image(&prepared)
            .map_err(|e| Error::transcode(source, e))?
            .encode(quality as f32);

        std::fs::write(dest, &*encoded).map_err(|e| Error::transcode(dest, e))?;

        Ok(TranscodeStats {
            width,
            height,
            encoded_bytes: encoded.len() as u64,
        })
    }

    fn thumbnail(&self, source: &Path, max_width: u32, max_height: u32) -> Result<RgbaImage> {
        let decoded = Self::open(source)?;
        Ok(decoded.thumbnail(max_width, max_height).to_rgba8())
    }
}
