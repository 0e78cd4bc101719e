//! Detection engine boundary shared by the relay.
//!
//! The relay never looks inside a model: it hands a decoded RGB frame to a
//! [`DetectionEngine`] and gets back labelled, scored boxes. Backends live
//! behind feature flags so the default build carries no native ML runtime.

use std::fmt;

use image::RgbImage;
use serde::Serialize;
use thiserror::Error;

pub mod labels;
pub mod postprocess;

#[cfg(feature = "with-tch")]
pub mod detector;

pub use labels::LabelMap;

#[cfg(feature = "with-tch")]
pub use tch;

/// Axis-aligned box in source-frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        (self.right - self.left).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.bottom - self.top).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Intersection over union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let left = self.left.max(other.left);
        let top = self.top.max(other.top);
        let right = self.right.min(other.right);
        let bottom = self.bottom.min(other.bottom);
        let intersection = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }
}

/// Single labelled detection produced by an engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    /// Box geometry; only meaningful on the cycle that produced it.
    pub bbox: Option<BoundingBox>,
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence: confidence.clamp(0.0, 1.0),
            bbox: None,
        }
    }

    pub fn with_bbox(mut self, bbox: BoundingBox) -> Self {
        self.bbox = Some(bbox);
        self
    }
}

/// Knobs handed to the engine on every inference call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParams {
    /// Minimum score for a detection to be reported.
    pub confidence_threshold: f32,
    /// Square inference resolution in pixels.
    pub input_size: u32,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            input_size: 320,
        }
    }
}

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("unsupported input: {0}")]
    UnsupportedInput(String),
}

/// An object detector. Implementations must be shareable across threads; the
/// relay calls `detect` from its ingest thread only, but the engine outlives
/// individual producer sessions.
pub trait DetectionEngine: Send + Sync {
    fn name(&self) -> &str;

    fn detect(
        &self,
        image: &RgbImage,
        params: &DetectionParams,
    ) -> Result<Vec<Detection>, DetectionError>;
}

impl fmt::Debug for dyn DetectionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetectionEngine")
            .field("name", &self.name())
            .finish()
    }
}

/// Engine used when no model is configured. Frames still flow, undecorated.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEngine;

impl DetectionEngine for NullEngine {
    fn name(&self) -> &str {
        "null"
    }

    fn detect(
        &self,
        _image: &RgbImage,
        _params: &DetectionParams,
    ) -> Result<Vec<Detection>, DetectionError> {
        Ok(Vec::new())
    }
}
