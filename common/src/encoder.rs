use image::codecs::jpeg::JpegEncoder;
use tracing::debug;

use crate::frame::{EncodedImage, FrameBuffer};

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("JPEG quality must be in (0, 1], got {0}")]
    InvalidQuality(f32),
    #[error("frame has no pixels ({width}x{height})")]
    EmptyFrame { width: u32, height: u32 },
    #[error("JPEG encoder failed: {0}")]
    Codec(String),
    #[error("JPEG encoder produced no data")]
    NoData,
}

/// Rasterizes frames into JPEG upload payloads at a fixed quality.
#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    quality: u8,
}

impl FrameEncoder {
    /// `quality` is a fraction in (0, 1], mapped onto the JPEG 1..=100 scale.
    pub fn new(quality: f32) -> Result<Self, EncodeError> {
        if !(quality > 0.0 && quality <= 1.0) {
            return Err(EncodeError::InvalidQuality(quality));
        }
        let quality = (quality * 100.0).round().clamp(1.0, 100.0) as u8;
        Ok(Self { quality })
    }

    pub fn jpeg_quality(&self) -> u8 {
        self.quality
    }

    /// Encode a frame. The output keeps the frame's dimensions.
    pub fn encode(&self, frame: &FrameBuffer, filename: &str) -> Result<EncodedImage, EncodeError> {
        let (width, height) = (frame.width(), frame.height());
        if width == 0 || height == 0 {
            return Err(EncodeError::EmptyFrame { width, height });
        }

        let mut buf = Vec::with_capacity((width * height / 4) as usize);
        JpegEncoder::new_with_quality(&mut buf, self.quality)
            .encode_image(frame.pixels())
            .map_err(|e| EncodeError::Codec(e.to_string()))?;

        if buf.is_empty() {
            return Err(EncodeError::NoData);
        }

        debug!(
            seq = frame.seq,
            width,
            height,
            quality = self.quality,
            bytes = buf.len(),
            "encoded frame"
        );
        Ok(EncodedImage::jpeg(buf, filename, width, height))
    }

    /// Encode on the blocking pool so the async context keeps ticking.
    pub async fn encode_async(
        &self,
        frame: FrameBuffer,
        filename: String,
    ) -> Result<EncodedImage, EncodeError> {
        let encoder = *self;
        tokio::task::spawn_blocking(move || encoder.encode(&frame, &filename))
            .await
            .map_err(|e| EncodeError::Codec(e.to_string()))?
    }
}
