use anyhow::{anyhow, Result};

use crate::detect::backend::{ComputeDevice, DetectParams, DetectorBackend};
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::Frame;

/// Synthetic detector for `stub://` runs and tests.
///
/// Reports one box that sweeps across the frame with the capture sequence,
/// plus a second, smaller box on every tenth frame. Confidence cycles through
/// `[0.50, 0.99]`, so the confidence threshold filters some frames.
pub struct StubBackend {
    device: ComputeDevice,
    fail_every: Option<u64>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            device: ComputeDevice::Cpu,
            fail_every: None,
        }
    }

    pub fn on_device(mut self, device: ComputeDevice) -> Self {
        self.device = device;
        self
    }

    /// Fail detection on every `n`th frame (by capture sequence).
    pub fn with_failure_every(mut self, n: u64) -> Self {
        self.fail_every = Some(n.max(1));
        self
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn device(&self) -> ComputeDevice {
        self.device.clone()
    }

    fn detect(&mut self, frame: &Frame, params: &DetectParams) -> Result<Vec<Detection>> {
        let seq = frame.seq();
        if let Some(n) = self.fail_every {
            if (seq + 1) % n == 0 {
                return Err(anyhow!("stub detector failure on frame {}", seq));
            }
        }

        let (width, height) = (frame.width() as f32, frame.height() as f32);
        let box_w = (width / 5.0).max(1.0);
        let box_h = (height / 5.0).max(1.0);
        let travel = (width - box_w).max(0.0);
        let x1 = if travel > 0.0 {
            (seq as f32 * 8.0) % travel
        } else {
            0.0
        };
        let y1 = (height - box_h) / 2.0;

        let mut detections = vec![Detection::new(
            BoundingBox::new(x1, y1, x1 + box_w, y1 + box_h)?,
            0.5 + (seq % 50) as f32 / 100.0,
            0,
        )?];

        if seq % 10 == 0 {
            detections.push(Detection::new(
                BoundingBox::new(0.0, 0.0, box_w / 2.0, box_h / 2.0)?,
                0.95,
                2,
            )?);
        }

        detections.retain(|d| d.confidence() >= params.confidence_threshold);
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seq: u64) -> Frame {
        Frame::new(seq, 100, 50, vec![0u8; 100 * 50 * 3]).unwrap()
    }

    #[test]
    fn emits_boxes_inside_frame() {
        let mut backend = StubBackend::new();
        let params = DetectParams {
            confidence_threshold: 0.0,
            iou_threshold: 0.5,
        };
        for seq in 0..40 {
            for det in backend.detect(&frame(seq), &params).unwrap() {
                assert!(det.bbox().x2() <= 100.0);
                assert!(det.bbox().y2() <= 50.0);
            }
        }
        assert_eq!(backend.detect(&frame(10), &params).unwrap().len(), 2);
        assert_eq!(backend.detect(&frame(11), &params).unwrap().len(), 1);
    }

    #[test]
    fn honours_confidence_threshold() {
        let mut backend = StubBackend::new();
        let params = DetectParams {
            confidence_threshold: 0.96,
            iou_threshold: 0.5,
        };
        // seq 1 -> 0.51 (filtered), no secondary box
        assert!(backend.detect(&frame(1), &params).unwrap().is_empty());
        // seq 49 -> 0.99
        assert_eq!(backend.detect(&frame(49), &params).unwrap().len(), 1);
    }

    #[test]
    fn injected_failures_follow_sequence() {
        let mut backend = StubBackend::new().with_failure_every(3);
        let params = DetectParams::default();
        assert!(backend.detect(&frame(0), &params).is_ok());
        assert!(backend.detect(&frame(1), &params).is_ok());
        assert!(backend.detect(&frame(2), &params).is_err());
    }
}
