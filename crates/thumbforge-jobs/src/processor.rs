//! Thumbnail generation on the `image` crate.
//!
//! Decoding, resizing and encoding are CPU-bound, so they run on the blocking
//! thread pool instead of the async runtime.

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::GenericImageView;
use tracing::debug;

use thumbforge_core::defaults;
use thumbforge_core::{Error, ImageProcessor, Result};

/// [`ImageProcessor`] producing JPEG thumbnails of an exact size.
#[derive(Debug, Clone)]
pub struct ImageCrateProcessor {
    quality: u8,
}

impl Default for ImageCrateProcessor {
    fn default() -> Self {
        Self {
            quality: defaults::THUMBNAIL_QUALITY,
        }
    }
}

impl ImageCrateProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the JPEG quality (clamped to 1-100).
    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality.clamp(1, 100);
        self
    }

    /// Blocking implementation of [`ImageProcessor::thumbnail`].
    pub fn generate(&self, source: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidInput(format!(
                "thumbnail size must be non-zero, got {width}x{height}"
            )));
        }

        let img = image::load_from_memory(source)
            .map_err(|e| Error::Processing(format!("failed to decode image: {e}")))?;

        let (orig_w, orig_h) = img.dimensions();
        debug!(
            subsystem = "jobs",
            component = "processor",
            original_width = orig_w,
            original_height = orig_h,
            width,
            height,
            "Resizing image"
        );

        // Exact box, aspect ratio not preserved; JPEG has no alpha channel.
        let resized = img
            .resize_exact(width, height, FilterType::Triangle)
            .to_rgb8();

        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, self.quality)
            .encode_image(&resized)
            .map_err(|e| Error::Processing(format!("failed to encode thumbnail: {e}")))?;
        Ok(out)
    }
}

#[async_trait]
impl ImageProcessor for ImageCrateProcessor {
    async fn thumbnail(&self, source: Vec<u8>, width: u32, height: u32) -> Result<Vec<u8>> {
        let processor = self.clone();
        tokio::task::spawn_blocking(move || processor.generate(&source, width, height))
            .await
            .map_err(|e| Error::Internal(format!("thumbnail task panicked: {e}")))?
    }
}
