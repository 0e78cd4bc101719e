use std::{convert::TryFrom, path::Path, sync::Mutex};

use image::{RgbImage, imageops::FilterType};
use tch::{self, Device, Kind, Tensor};
use tracing::debug;

use crate::{
    Detection, DetectionEngine, DetectionError, DetectionParams, LabelMap,
    postprocess::{DEFAULT_IOU_THRESHOLD, Rescale, decode_rows, non_max_suppression},
};

/// TorchScript-backed detector for YOLO-style exports.
pub struct TorchDetector {
    module: Mutex<tch::CModule>,
    device: Device,
    labels: LabelMap,
}

impl TorchDetector {
    /// Load a TorchScript module onto `device`.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        device: Device,
        labels: LabelMap,
    ) -> Result<Self, DetectionError> {
        let module = tch::CModule::load_on_device(model_path.as_ref(), device).map_err(|err| {
            DetectionError::Inference(format!(
                "failed to load {}: {err}",
                model_path.as_ref().display()
            ))
        })?;
        Ok(Self {
            module: Mutex::new(module),
            device,
            labels,
        })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Resize to the square inference resolution and build a normalised NCHW tensor.
    fn to_input(&self, image: &RgbImage, input_size: u32) -> Tensor {
        let resized = image::imageops::resize(image, input_size, input_size, FilterType::Triangle);
        let side = input_size as i64;
        Tensor::from_slice(resized.as_raw())
            .to_device(self.device)
            .to_kind(Kind::Float)
            .view([1, side, side, 3])
            .permute([0, 3, 1, 2])
            / 255.0
    }
}

impl DetectionEngine for TorchDetector {
    fn name(&self) -> &str {
        "torchscript"
    }

    fn detect(
        &self,
        image: &RgbImage,
        params: &DetectionParams,
    ) -> Result<Vec<Detection>, DetectionError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(DetectionError::UnsupportedInput("empty frame".into()));
        }
        let input = self.to_input(image, params.input_size);

        let output = {
            let module = self
                .module
                .lock()
                .map_err(|_| DetectionError::Inference("detector module poisoned".into()))?;
            module
                .forward_ts(&[input])
                .map_err(|err| DetectionError::Inference(err.to_string()))?
        };

        let shape = output.size();
        if shape.len() != 3 || shape[0] != 1 {
            return Err(DetectionError::Inference(format!(
                "unexpected detector output shape: {shape:?}"
            )));
        }
        if shape[1] < 5 {
            return Err(DetectionError::Inference(format!(
                "detector output requires at least 5 channels, got {}",
                shape[1]
            )));
        }

        let preds = output
            .to_device(Device::Cpu)
            .to_kind(Kind::Float)
            .squeeze_dim(0)
            .permute([1, 0])
            .contiguous();
        let rows = Vec::<Vec<f32>>::try_from(&preds)
            .map_err(|err| DetectionError::Inference(err.to_string()))?;

        let rescale = Rescale::new(params.input_size, image.width(), image.height());
        let candidates = decode_rows(&rows, &self.labels, params.confidence_threshold, rescale);
        let detections = non_max_suppression(candidates, DEFAULT_IOU_THRESHOLD);
        debug!(
            candidates = rows.len(),
            kept = detections.len(),
            "torchscript inference complete"
        );
        Ok(detections)
    }
}
