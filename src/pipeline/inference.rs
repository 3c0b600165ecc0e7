use anyhow::{Context, Result};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::StageExit;
use crate::cancel::StopToken;
use crate::detect::{annotate, DetectParams, Detection, DetectorBackend};
use crate::frame::Frame;
use crate::queue::{Pop, Push, QueueReceiver, QueueSender};

/// One processed frame. Produced once by the inference stage and consumed
/// once by the coordinator.
#[derive(Debug)]
pub struct InferenceResult {
    pub original: Frame,
    pub annotated: Frame,
    pub detections: Vec<Detection>,
    pub inference_time: Duration,
}

impl InferenceResult {
    /// Capture sequence of the source frame.
    pub fn seq(&self) -> u64 {
        self.original.seq()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InferenceReport {
    pub frames_processed: u64,
    pub detector_failures: u64,
    pub results_dropped: u64,
    pub exit: StageExit,
}

pub struct InferenceStage {
    detector: Box<dyn DetectorBackend>,
    params: DetectParams,
    poll_timeout: Duration,
}

impl InferenceStage {
    pub fn new(
        detector: Box<dyn DetectorBackend>,
        params: DetectParams,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            detector,
            params,
            poll_timeout,
        }
    }

    fn process(&mut self, frame: Frame) -> Result<InferenceResult> {
        let started = Instant::now();
        let detections = self.detector.detect(&frame, &self.params)?;
        let inference_time = started.elapsed();
        let annotated = annotate(&frame, &detections).context("failed to draw detections")?;
        Ok(InferenceResult {
            original: frame,
            annotated,
            detections,
            inference_time,
        })
    }

    /// Pull frames until stop, or until the frame queue is closed and drained.
    pub fn run(
        mut self,
        frames: QueueReceiver<Frame>,
        results: QueueSender<InferenceResult>,
        stop: StopToken,
    ) -> InferenceReport {
        let _guard = stop.cancel_on_panic();
        let mut report = InferenceReport {
            frames_processed: 0,
            detector_failures: 0,
            results_dropped: 0,
            exit: StageExit::Stopped,
        };

        if let Err(e) = self.detector.warm_up() {
            log::error!("inference: {} warm-up failed: {:#}", self.detector.name(), e);
            stop.cancel();
            report.exit = StageExit::Failed(format!("{:#}", e));
            return report;
        }
        log::info!(
            "inference: {} ready on {}",
            self.detector.name(),
            self.detector.device()
        );

        loop {
            if stop.is_cancelled() {
                break;
            }
            let frame = match frames.pop(self.poll_timeout) {
                Pop::Item(frame) => frame,
                Pop::Timeout => continue,
                Pop::Closed => {
                    report.exit = StageExit::EndOfStream;
                    break;
                }
            };

            let seq = frame.seq();
            let result = match self.process(frame) {
                Ok(result) => result,
                Err(e) => {
                    report.detector_failures += 1;
                    log::warn!("inference: frame {} skipped: {:#}", seq, e);
                    continue;
                }
            };
            report.frames_processed += 1;
            log::debug!(
                "inference: frame {} -> {} detections in {:?}",
                seq,
                result.detections.len(),
                result.inference_time
            );

            match results.push(result, &stop) {
                Push::Queued => {}
                Push::Dropped => {
                    report.results_dropped += 1;
                    log::debug!("inference: result queue full, dropped frame {}", seq);
                }
                Push::Cancelled => break,
                Push::Closed => {
                    report.exit = StageExit::DownstreamClosed;
                    break;
                }
            }
        }

        report
    }
}

pub fn spawn_inference(
    stage: InferenceStage,
    frames: QueueReceiver<Frame>,
    results: QueueSender<InferenceResult>,
    stop: StopToken,
) -> Result<JoinHandle<InferenceReport>> {
    thread::Builder::new()
        .name("inference".to_string())
        .spawn(move || stage.run(frames, results, stop))
        .context("failed to spawn inference thread")
}
