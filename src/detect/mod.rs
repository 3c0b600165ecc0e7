mod backend;
mod backends;
mod overlay;
mod result;

use anyhow::{Context, Result};

use crate::config::DetectorSettings;

pub use backend::{ComputeDevice, DetectParams, DetectorBackend};
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use overlay::annotate;
pub use result::{non_max_suppression, BoundingBox, Detection};

/// Model name that selects the synthetic detector.
pub const STUB_MODEL: &str = "stub";

/// Initialise the detector named by `settings` on its configured device.
///
/// Failure here is fatal to the pipeline.
pub fn open_backend(settings: &DetectorSettings) -> Result<Box<dyn DetectorBackend>> {
    let device: ComputeDevice = settings
        .device
        .parse()
        .with_context(|| format!("invalid compute device '{}'", settings.device))?;

    if settings.model.eq_ignore_ascii_case(STUB_MODEL) {
        return Ok(Box::new(StubBackend::new().on_device(device)));
    }
    open_model(settings, &device)
}

#[cfg(feature = "backend-tract")]
fn open_model(
    settings: &DetectorSettings,
    device: &ComputeDevice,
) -> Result<Box<dyn DetectorBackend>> {
    let backend = TractBackend::new(
        &settings.model,
        settings.input_width,
        settings.input_height,
        device,
    )
    .with_context(|| format!("failed to initialise detector from {}", settings.model))?;
    Ok(Box::new(backend))
}

#[cfg(not(feature = "backend-tract"))]
fn open_model(
    settings: &DetectorSettings,
    _device: &ComputeDevice,
) -> Result<Box<dyn DetectorBackend>> {
    anyhow::bail!(
        "cannot load model '{}': built without the backend-tract feature (use model '{}')",
        settings.model,
        STUB_MODEL
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_model_opens_on_any_device() {
        let settings = DetectorSettings {
            model: "stub".to_string(),
            device: "cuda:0".to_string(),
            ..DetectorSettings::default()
        };
        let backend = open_backend(&settings).unwrap();
        assert_eq!(backend.name(), "stub");
        assert_eq!(backend.device(), ComputeDevice::Cuda(0));
    }

    #[test]
    fn unknown_device_is_fatal() {
        let settings = DetectorSettings {
            model: "stub".to_string(),
            device: "tpu".to_string(),
            ..DetectorSettings::default()
        };
        assert!(open_backend(&settings).is_err());
    }

    #[test]
    fn missing_model_is_fatal() {
        let settings = DetectorSettings {
            model: "/nonexistent/weights.onnx".to_string(),
            device: "cpu".to_string(),
            ..DetectorSettings::default()
        };
        assert!(open_backend(&settings).is_err());
    }
}
