use anyhow::{anyhow, Result};

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Per-call detection thresholds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DetectParams {
    /// Minimum confidence for a detection to be reported.
    pub confidence_threshold: f32,
    /// Overlap above which same-class boxes are suppressed.
    pub iou_threshold: f32,
}

impl Default for DetectParams {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            iou_threshold: 0.85,
        }
    }
}

/// Compute device a backend runs on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ComputeDevice {
    /// Pick the best device the backend supports.
    Auto,
    Cpu,
    Cuda(u32),
    Mps,
}

impl std::str::FromStr for ComputeDevice {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let value = s.trim().to_lowercase();
        match value.as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "mps" => Ok(Self::Mps),
            "cuda" => Ok(Self::Cuda(0)),
            _ => {
                let index = value
                    .strip_prefix("cuda:")
                    .ok_or_else(|| anyhow!("unknown compute device '{}'", s))?;
                let index = index
                    .parse()
                    .map_err(|_| anyhow!("invalid cuda device index in '{}'", s))?;
                Ok(Self::Cuda(index))
            }
        }
    }
}

impl std::fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(index) => write!(f, "cuda:{}", index),
            Self::Mps => write!(f, "mps"),
        }
    }
}

/// Object detector backend.
///
/// `detect` runs synchronously on the inference thread and may be slow. A
/// backend owns whatever accelerator state it needs; the pipeline never calls
/// it from more than one thread.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Device the backend was initialised on.
    fn device(&self) -> ComputeDevice;

    /// Run detection on one frame.
    fn detect(&mut self, frame: &Frame, params: &DetectParams) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, called once on the inference thread.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_identifiers() {
        assert_eq!("cpu".parse::<ComputeDevice>().unwrap(), ComputeDevice::Cpu);
        assert_eq!("AUTO".parse::<ComputeDevice>().unwrap(), ComputeDevice::Auto);
        assert_eq!("cuda:1".parse::<ComputeDevice>().unwrap(), ComputeDevice::Cuda(1));
        assert_eq!("cuda".parse::<ComputeDevice>().unwrap(), ComputeDevice::Cuda(0));
        assert!("cuda:x".parse::<ComputeDevice>().is_err());
        assert!("tpu".parse::<ComputeDevice>().is_err());
        assert_eq!(ComputeDevice::Cuda(0).to_string(), "cuda:0");
    }
}
