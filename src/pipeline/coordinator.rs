use anyhow::Result;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::capture::spawn_capture;
use super::inference::{spawn_inference, InferenceResult, InferenceStage};
use super::stats::{PipelineStats, PipelineSummary};
use crate::cancel::StopToken;
use crate::config::PipelineSettings;
use crate::detect::{DetectParams, DetectorBackend};
use crate::ingest::FrameSource;
use crate::queue::{bounded, Pop};
use crate::sink::{MetadataPublisher, StreamSink};

type ResultObserver = Box<dyn FnMut(&InferenceResult) + Send>;

/// Wires capture, inference and the sinks together and owns shutdown.
pub struct Coordinator {
    settings: PipelineSettings,
    params: DetectParams,
    stop: StopToken,
    metadata: Option<MetadataPublisher>,
    stream: Option<StreamSink>,
    observer: Option<ResultObserver>,
}

impl Coordinator {
    pub fn new(settings: PipelineSettings, params: DetectParams, stop: StopToken) -> Self {
        Self {
            settings,
            params,
            stop,
            metadata: None,
            stream: None,
            observer: None,
        }
    }

    pub fn with_metadata(mut self, metadata: MetadataPublisher) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_stream(mut self, stream: StreamSink) -> Self {
        self.stream = Some(stream);
        self
    }

    /// Called with every drained result, after the sinks.
    pub fn with_observer(
        mut self,
        observer: impl FnMut(&InferenceResult) + Send + 'static,
    ) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    /// Run until stop is requested or the source is exhausted and drained.
    pub fn run(
        mut self,
        source: Box<dyn FrameSource>,
        detector: Box<dyn DetectorBackend>,
    ) -> Result<PipelineSummary> {
        let (frame_tx, frame_rx) = bounded(
            self.settings.frame_queue_capacity,
            self.settings.overflow,
            self.settings.enqueue_timeout,
        )?;
        let (result_tx, result_rx) = bounded(
            self.settings.result_queue_capacity,
            self.settings.overflow,
            self.settings.enqueue_timeout,
        )?;
        let frame_probe = frame_rx.probe();

        if let Some(stream) = self.stream.as_mut() {
            stream.start();
        }

        let mut stats = PipelineStats::new();
        log::info!(
            "pipeline starting: source {}, queues {}/{} ({:?} on overflow)",
            source.describe(),
            self.settings.frame_queue_capacity,
            self.settings.result_queue_capacity,
            self.settings.overflow
        );

        let capture = spawn_capture(source, frame_tx, self.stop.clone())?;
        let stage = InferenceStage::new(detector, self.params, self.settings.poll_timeout);
        let inference = match spawn_inference(stage, frame_rx, result_tx, self.stop.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                self.stop.cancel();
                join_within("capture", capture, Instant::now() + self.settings.join_timeout);
                return Err(e);
            }
        };

        loop {
            if self.stop.is_cancelled() {
                log::info!("pipeline: stop requested");
                break;
            }
            match result_rx.pop(self.settings.poll_timeout) {
                Pop::Item(result) => self.handle_result(result, &mut stats),
                Pop::Timeout => {
                    if capture.is_finished()
                        && inference.is_finished()
                        && frame_probe.is_empty()
                        && result_rx.is_empty()
                    {
                        log::info!("pipeline: stages finished and queues drained");
                        break;
                    }
                }
                Pop::Closed => {
                    log::info!("pipeline: result queue closed");
                    break;
                }
            }
        }

        self.stop.cancel();
        // unblock an inference stage waiting on a full result queue
        drop(result_rx);
        let deadline = Instant::now() + self.settings.join_timeout;
        let capture_report = join_within("capture", capture, deadline);
        let inference_report = join_within("inference", inference, deadline);

        let mut summary = PipelineSummary::from_stats(&stats);
        summary.capture = capture_report;
        summary.inference = inference_report;
        if let Some(metadata) = self.metadata.as_mut() {
            summary.metadata_records_written = metadata.records_written();
            summary.metadata_records_live = metadata.count();
        }
        if let Some(stream) = self.stream.as_mut() {
            stream.close();
            summary.stream_frames_written = stream.frames_written();
            summary.stream_restarts = stream.health().restarts();
        }

        log::info!(
            "pipeline finished: {} frames, {} detections, {} dropped in {:.1}s (avg {:.2} fps)",
            summary.frames_processed,
            summary.detections_total,
            summary.frames_dropped(),
            summary.elapsed.as_secs_f64(),
            summary.fps
        );
        log::info!(
            "metadata: {} records written, {} live, {} publish failures",
            summary.metadata_records_written,
            summary.metadata_records_live,
            summary.publish_failures
        );
        Ok(summary)
    }

    fn handle_result(&mut self, result: InferenceResult, stats: &mut PipelineStats) {
        stats.record(&result);

        if !result.detections.is_empty() {
            if let Some(metadata) = self.metadata.as_mut() {
                if !metadata.publish(&result.detections) {
                    stats.record_publish_failure();
                    log::warn!(
                        "pipeline: metadata for frame {} not published ({} detections)",
                        result.seq(),
                        result.detections.len()
                    );
                }
            }
        }

        if let Some(stream) = self.stream.as_mut() {
            stream.write(&result.annotated);
        }

        if let Some(observer) = self.observer.as_mut() {
            observer(&result);
        }

        let interval = self.settings.stats_interval;
        if interval > 0 && stats.frames_processed() % interval == 0 {
            let records = self.metadata.as_mut().map_or(0, |m| m.count());
            log::info!(
                "{} frames (last #{}, age {:?}), {} detections, {:.2} fps, {} records live",
                stats.frames_processed(),
                stats.last_seq().unwrap_or_default(),
                result.original.age(),
                stats.detections_total(),
                stats.fps(),
                records
            );
        }
    }
}

/// Join a stage thread, giving up at `deadline`. An abandoned thread keeps
/// running detached and does not block process exit.
fn join_within<T>(name: &str, handle: JoinHandle<T>, deadline: Instant) -> Option<T> {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            log::warn!("{} stage did not stop in time, abandoning it", name);
            return None;
        }
        thread::sleep(Duration::from_millis(5));
    }
    match handle.join() {
        Ok(report) => Some(report),
        Err(_) => {
            log::error!("{} stage panicked", name);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_within_abandons_stuck_thread() {
        let handle = thread::spawn(|| thread::sleep(Duration::from_secs(5)));
        let started = Instant::now();
        let deadline = Instant::now() + Duration::from_millis(30);
        assert!(join_within("stuck", handle, deadline).is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn join_within_reports_panics_as_none() {
        let handle = thread::spawn(|| -> u32 { panic!("boom") });
        let deadline = Instant::now() + Duration::from_secs(1);
        assert!(join_within("panicky", handle, deadline).is_none());
    }

    #[test]
    fn join_within_returns_report() {
        let handle = thread::spawn(|| 7u32);
        let deadline = Instant::now() + Duration::from_secs(1);
        assert_eq!(join_within("ok", handle, deadline), Some(7));
    }
}
