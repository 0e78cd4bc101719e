//! Decoding of producer frame buffers.
//!
//! A producer pushes one encoded image per transport message. The decoder turns
//! each buffer into an RGB [`Frame`] or reports why it could not; a failed
//! decode is never fatal to the session that received it.

use std::io::Cursor;

use chrono::Utc;
use image::{ImageError, ImageReader, Limits, RgbImage};
use thiserror::Error;

/// Largest width or height accepted by default.
pub const DEFAULT_MAX_DIMENSION: u32 = 4096;

/// Decoded RGB frame received from a producer.
pub struct Frame {
    pub image: RgbImage,
    pub width: u32,
    pub height: u32,
    pub timestamp_ms: i64,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty frame buffer")]
    Empty,
    #[error("frame exceeds {limit}px in width or height")]
    TooLarge { limit: u32 },
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Stateless image decoder; format is sniffed from the buffer contents.
#[derive(Debug, Clone, Copy)]
pub struct FrameDecoder {
    max_dimension: u32,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DIMENSION)
    }
}

impl FrameDecoder {
    pub fn new(max_dimension: u32) -> Self {
        Self {
            max_dimension: max_dimension.max(1),
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Frame, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }

        let mut reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|err| DecodeError::Malformed(err.to_string()))?;
        if reader.format().is_none() {
            return Err(DecodeError::Malformed("unrecognised image format".into()));
        }

        let mut limits = Limits::default();
        limits.max_image_width = Some(self.max_dimension);
        limits.max_image_height = Some(self.max_dimension);
        reader.limits(limits);

        let image = reader.decode().map_err(|err| match err {
            ImageError::Limits(_) => DecodeError::TooLarge {
                limit: self.max_dimension,
            },
            other => DecodeError::Malformed(other.to_string()),
        })?;

        let image = image.to_rgb8();
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(DecodeError::Malformed("zero-sized image".into()));
        }

        Ok(Frame {
            image,
            width,
            height,
            timestamp_ms: Utc::now().timestamp_millis(),
        })
    }
}
