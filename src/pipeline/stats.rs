use std::time::{Duration, Instant};

use super::capture::CaptureReport;
use super::inference::{InferenceReport, InferenceResult};

/// Running counters kept by the coordinator thread.
#[derive(Debug)]
pub struct PipelineStats {
    started: Instant,
    frames_processed: u64,
    detections_total: u64,
    publish_failures: u64,
    inference_time_total: Duration,
    last_seq: Option<u64>,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            frames_processed: 0,
            detections_total: 0,
            publish_failures: 0,
            inference_time_total: Duration::ZERO,
            last_seq: None,
        }
    }

    pub fn record(&mut self, result: &InferenceResult) {
        self.frames_processed += 1;
        self.detections_total += result.detections.len() as u64;
        self.inference_time_total += result.inference_time;
        self.last_seq = Some(result.seq());
    }

    pub fn record_publish_failure(&mut self) {
        self.publish_failures += 1;
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    pub fn detections_total(&self) -> u64 {
        self.detections_total
    }

    pub fn publish_failures(&self) -> u64 {
        self.publish_failures
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Processed frames per second of wall time since start.
    pub fn fps(&self) -> f64 {
        rate(self.frames_processed, self.elapsed())
    }

    pub fn mean_inference_time(&self) -> Duration {
        if self.frames_processed == 0 {
            Duration::ZERO
        } else {
            self.inference_time_total / self.frames_processed as u32
        }
    }
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

fn rate(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

/// Final account of one pipeline run.
#[derive(Clone, Debug)]
pub struct PipelineSummary {
    pub frames_processed: u64,
    pub detections_total: u64,
    pub publish_failures: u64,
    pub elapsed: Duration,
    pub fps: f64,
    pub mean_inference_time: Duration,
    pub metadata_records_written: u64,
    /// Records still live in the store at shutdown.
    pub metadata_records_live: u64,
    pub stream_frames_written: u64,
    pub stream_restarts: u64,
    /// `None` when the stage did not join in time or panicked.
    pub capture: Option<CaptureReport>,
    pub inference: Option<InferenceReport>,
}

impl PipelineSummary {
    pub fn from_stats(stats: &PipelineStats) -> Self {
        let elapsed = stats.elapsed();
        Self {
            frames_processed: stats.frames_processed,
            detections_total: stats.detections_total,
            publish_failures: stats.publish_failures,
            elapsed,
            fps: rate(stats.frames_processed, elapsed),
            mean_inference_time: stats.mean_inference_time(),
            metadata_records_written: 0,
            metadata_records_live: 0,
            stream_frames_written: 0,
            stream_restarts: 0,
            capture: None,
            inference: None,
        }
    }

    pub fn frames_dropped(&self) -> u64 {
        let capture = self.capture.as_ref().map_or(0, |r| r.frames_dropped);
        let inference = self.inference.as_ref().map_or(0, |r| r.results_dropped);
        capture + inference
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    fn result(seq: u64, detections: usize) -> InferenceResult {
        let frame = || Frame::new(seq, 1, 1, vec![0, 0, 0]).unwrap();
        let det = crate::detect::Detection::from_xyxy(0.0, 0.0, 1.0, 1.0, 0.5, 0).unwrap();
        InferenceResult {
            original: frame(),
            annotated: frame(),
            detections: vec![det; detections],
            inference_time: Duration::from_millis(10),
        }
    }

    #[test]
    fn accumulates_counters() {
        let mut stats = PipelineStats::new();
        stats.record(&result(0, 2));
        stats.record(&result(1, 0));
        stats.record(&result(2, 3));
        stats.record_publish_failure();

        assert_eq!(stats.frames_processed(), 3);
        assert_eq!(stats.detections_total(), 5);
        assert_eq!(stats.publish_failures(), 1);
        assert_eq!(stats.last_seq(), Some(2));
        assert_eq!(stats.mean_inference_time(), Duration::from_millis(10));
        assert!(stats.fps() > 0.0);
    }

    #[test]
    fn empty_run_has_zero_rates() {
        let stats = PipelineStats::new();
        assert_eq!(stats.mean_inference_time(), Duration::ZERO);
        assert_eq!(rate(0, Duration::ZERO), 0.0);
        assert_eq!(PipelineSummary::from_stats(&stats).frames_dropped(), 0);
    }
}
