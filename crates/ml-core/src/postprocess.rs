//! Turning raw model output rows into [`Detection`]s.
//!
//! Rows follow the anchor-free YOLO layout: `[cx, cy, w, h, score_0, .., score_n]`
//! in inference-resolution pixels.

use std::cmp::Ordering;

use crate::{BoundingBox, Detection, LabelMap};

/// Hard cap on detections kept per frame.
pub const MAX_DETECTIONS: usize = 512;

/// Default IoU above which overlapping same-label boxes are suppressed.
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.45;

/// Frame geometry used to map inference coordinates back onto the source.
#[derive(Debug, Clone, Copy)]
pub struct Rescale {
    pub scale_x: f32,
    pub scale_y: f32,
    pub max_x: f32,
    pub max_y: f32,
}

impl Rescale {
    pub fn new(input_size: u32, source_width: u32, source_height: u32) -> Self {
        let input = input_size.max(1) as f32;
        Self {
            scale_x: source_width as f32 / input,
            scale_y: source_height as f32 / input,
            max_x: source_width.saturating_sub(1) as f32,
            max_y: source_height.saturating_sub(1) as f32,
        }
    }

    fn apply(&self, cx: f32, cy: f32, w: f32, h: f32) -> BoundingBox {
        let half_w = w / 2.0;
        let half_h = h / 2.0;
        BoundingBox {
            left: ((cx - half_w) * self.scale_x).clamp(0.0, self.max_x),
            top: ((cy - half_h) * self.scale_y).clamp(0.0, self.max_y),
            right: ((cx + half_w) * self.scale_x).clamp(0.0, self.max_x),
            bottom: ((cy + half_h) * self.scale_y).clamp(0.0, self.max_y),
        }
    }
}

/// Pick the best class per row, drop rows under `threshold`, and rescale boxes.
pub fn decode_rows(
    rows: &[Vec<f32>],
    labels: &LabelMap,
    threshold: f32,
    rescale: Rescale,
) -> Vec<Detection> {
    let mut detections = Vec::new();
    for row in rows {
        if row.len() < 5 {
            continue;
        }
        let Some((class_id, score)) = row[4..]
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
        else {
            continue;
        };
        if !score.is_finite() || score < threshold {
            continue;
        }
        let bbox = rescale.apply(row[0], row[1], row[2], row[3]);
        detections.push(Detection::new(labels.name(class_id), score).with_bbox(bbox));
    }
    detections
}

/// Greedy per-label non-maximum suppression, highest confidence first.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });

    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len().min(MAX_DETECTIONS));
    for candidate in detections {
        let overlaps = kept.iter().any(|existing| {
            existing.label == candidate.label
                && match (existing.bbox, candidate.bbox) {
                    (Some(a), Some(b)) => a.iou(&b) > iou_threshold,
                    _ => false,
                }
        });
        if !overlaps {
            kept.push(candidate);
            if kept.len() >= MAX_DETECTIONS {
                break;
            }
        }
    }
    kept
}
