#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::{ComputeDevice, DetectParams, DetectorBackend};
use crate::detect::result::{non_max_suppression, BoundingBox, Detection};
use crate::frame::Frame;

/// Tract-based YOLOv8 backend for ONNX inference.
///
/// Expects a detection head with output shape `[1, 4 + classes, anchors]`
/// where the first four rows are `cx, cy, w, h` in model-input pixels.
/// Runs on the CPU only.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_width: u32,
    input_height: u32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for `input_width x input_height` input.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        input_width: u32,
        input_height: u32,
        device: &ComputeDevice,
    ) -> Result<Self> {
        if !matches!(device, ComputeDevice::Cpu | ComputeDevice::Auto) {
            bail!("tract backend cannot run on device '{}' (cpu only)", device);
        }
        if input_width == 0 || input_height == 0 {
            bail!("model input size must be non-zero");
        }

        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, input_height as usize, input_width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_width,
            input_height,
        })
    }

    /// Planar RGB tensor scaled to `[0, 1]` from a BGR24 frame of model size.
    fn build_input(&self, frame: &Frame) -> Tensor {
        let pixels = frame.pixels();
        let width = frame.width() as usize;
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, frame.height() as usize, width),
            |(_, channel, y, x)| {
                // BGR -> RGB
                let idx = (y * width + x) * 3 + (2 - channel);
                pixels[idx] as f32 / 255.0
            },
        );
        input.into_tensor()
    }

    fn decode(
        &self,
        outputs: TVec<TValue>,
        frame: &Frame,
        params: &DetectParams,
    ) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("model output is not [1, 4 + classes, anchors]")?;

        let rows = view.shape()[1];
        let anchors = view.shape()[2];
        if rows <= 4 {
            bail!("model output has {} rows, expected at least 5", rows);
        }

        let sx = frame.width() as f32 / self.input_width as f32;
        let sy = frame.height() as f32 / self.input_height as f32;

        let mut candidates = Vec::new();
        for a in 0..anchors {
            let mut best_class = 0usize;
            let mut best_score = f32::NEG_INFINITY;
            for c in 4..rows {
                let score = view[[0, c, a]];
                if score > best_score {
                    best_score = score;
                    best_class = c - 4;
                }
            }
            if !best_score.is_finite() || best_score < params.confidence_threshold {
                continue;
            }

            let (cx, cy) = (view[[0, 0, a]] * sx, view[[0, 1, a]] * sy);
            let (w, h) = (view[[0, 2, a]] * sx, view[[0, 3, a]] * sy);
            let bbox = match BoundingBox::from_center(cx, cy, w.max(0.0), h.max(0.0)) {
                Ok(bbox) => bbox.clamp_to(frame.width(), frame.height()),
                Err(_) => continue,
            };
            candidates.push(Detection::new(bbox, best_score.min(1.0), best_class as u32)?);
        }

        Ok(non_max_suppression(candidates, params.iou_threshold))
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn device(&self) -> ComputeDevice {
        ComputeDevice::Cpu
    }

    fn detect(&mut self, frame: &Frame, params: &DetectParams) -> Result<Vec<Detection>> {
        let input = if frame.dimensions() == (self.input_width, self.input_height) {
            self.build_input(frame)
        } else {
            let scaled = frame.resized(self.input_width, self.input_height)?;
            self.build_input(&scaled)
        };
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, frame, params)
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = Frame::new(
            0,
            self.input_width,
            self.input_height,
            vec![0u8; crate::frame::expected_len(self.input_width, self.input_height, 3)?],
        )?;
        self.model
            .run(tvec!(self.build_input(&blank).into()))
            .context("ONNX warm-up inference failed")?;
        Ok(())
    }
}
