use crate::error::ProcessingError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;

/// Pixel layout of a raw frame handed over by a capture source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Uncompressed RGB, 3 bytes per pixel
    Rgb8,
    /// Already JPEG-compressed (e.g., MJPEG capture devices)
    Mjpeg,
}

/// One raw frame as produced by a capture source, before encoding.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl RawFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            data,
            width,
            height,
            format,
        }
    }
}

/// One encoded camera frame produced during a session. Transient; dropped
/// after transmission.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonically increasing within a session, starting at 0
    pub sequence: u64,
    /// `data:image/jpeg;base64,`-prefixed payload
    pub image: String,
    pub captured_at: DateTime<Utc>,
}

/// Encodes raw frames into the backend's frame payload format: JPEG at a
/// fixed quality factor, wrapped as a base64 data URL.
pub struct FrameEncoder {
    quality: u8,
}

impl FrameEncoder {
    pub fn new(quality: u8) -> Self {
        Self { quality }
    }

    /// Encode a raw frame into the wire payload string.
    pub fn encode(&self, raw: &RawFrame) -> Result<String, ProcessingError> {
        let jpeg = match raw.format {
            // Already JPEG encoded
            PixelFormat::Mjpeg => raw.data.clone(),
            PixelFormat::Rgb8 => {
                let mut buf = Vec::new();
                let mut encoder = JpegEncoder::new_with_quality(&mut buf, self.quality);
                encoder
                    .encode(&raw.data, raw.width, raw.height, image::ColorType::Rgb8)
                    .map_err(|e| ProcessingError::JpegEncoding {
                        details: e.to_string(),
                    })?;
                buf
            }
        };

        Ok(format!("data:image/jpeg;base64,{}", STANDARD.encode(&jpeg)))
    }
}
