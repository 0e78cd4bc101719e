//! Detection engine selection.

use std::sync::Arc;

use anyhow::{Context, Result};
use ml_core::{DetectionEngine, LabelMap, NullEngine};
use tracing::warn;
use vision::RelayConfig;

fn load_labels(config: &RelayConfig) -> Result<LabelMap> {
    match config.labels_path.as_ref() {
        Some(path) => LabelMap::from_file(path)
            .with_context(|| format!("failed to read labels from {}", path.display())),
        None => Ok(LabelMap::default()),
    }
}

#[cfg(feature = "with-tch")]
pub(crate) fn build(config: &RelayConfig) -> Result<Arc<dyn DetectionEngine>> {
    use ml_core::{detector::TorchDetector, tch::Device};

    let labels = load_labels(config)?;
    let Some(model_path) = config.model_path.as_ref() else {
        warn!("no --model given; frames will be relayed without detections");
        return Ok(Arc::new(NullEngine));
    };
    let device = if config.use_cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available()
    };
    let detector = TorchDetector::new(model_path, device, labels)
        .with_context(|| format!("failed to load detector from {}", model_path.display()))?;
    tracing::info!(
        model = %model_path.display(),
        device = ?detector.device(),
        "TorchScript detector loaded"
    );
    Ok(Arc::new(detector))
}

#[cfg(not(feature = "with-tch"))]
pub(crate) fn build(config: &RelayConfig) -> Result<Arc<dyn DetectionEngine>> {
    load_labels(config)?;
    if let Some(model_path) = config.model_path.as_ref() {
        warn!(
            model = %model_path.display(),
            "built without `with-tch`; ignoring model and relaying frames without detections"
        );
    }
    Ok(Arc::new(NullEngine))
}
