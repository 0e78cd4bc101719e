//! JPEG compression and transport text encoding of annotated frames.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
use image::{RgbImage, codecs::jpeg::JpegEncoder};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("JPEG encode failed: {0}")]
    Jpeg(#[from] image::ImageError),
}

#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    quality: u8,
}

impl FrameEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    pub fn encode_jpeg(&self, image: &RgbImage) -> Result<Vec<u8>, EncodeError> {
        let mut buffer = Vec::with_capacity(image.as_raw().len() / 8);
        JpegEncoder::new_with_quality(&mut buffer, self.quality).encode_image(image)?;
        Ok(buffer)
    }

    /// Base64 text suitable for embedding in a JSON message.
    pub fn transport_text(jpeg: &[u8]) -> String {
        BASE64_STANDARD.encode(jpeg)
    }
}
