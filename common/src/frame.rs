use bytes::Bytes;
use image::RgbImage;
use std::sync::Arc;

pub const JPEG_MIME: &str = "image/jpeg";

/// An immutable snapshot of the live view at one point in time.
///
/// Cloning is cheap: the pixels are shared, never copied, and never mutated
/// after the snapshot is taken.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    pixels: Arc<RgbImage>,
    pub captured_at_ms: i64,
    pub seq: u64,
}

impl FrameBuffer {
    pub fn new(pixels: RgbImage, captured_at_ms: i64, seq: u64) -> Self {
        Self {
            pixels: Arc::new(pixels),
            captured_at_ms,
            seq,
        }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }
}

/// A compressed still ready for upload.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedImage {
    data: Bytes,
    mime_type: &'static str,
    filename: String,
    width: u32,
    height: u32,
}

impl EncodedImage {
    pub fn jpeg(data: impl Into<Bytes>, filename: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            data: data.into(),
            mime_type: JPEG_MIME,
            filename: filename.into(),
            width,
            height,
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn mime_type(&self) -> &'static str {
        self.mime_type
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Same payload under a different upload filename.
    pub fn with_filename(&self, filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            ..self.clone()
        }
    }
}
