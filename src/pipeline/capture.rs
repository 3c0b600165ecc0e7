use anyhow::{Context, Result};
use std::thread::{self, JoinHandle};

use super::StageExit;
use crate::cancel::StopToken;
use crate::frame::Frame;
use crate::ingest::FrameSource;
use crate::queue::{Push, QueueSender};

/// Counters returned by the capture thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureReport {
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub exit: StageExit,
}

/// Read frames until stop, end of stream or a read error.
///
/// End of stream closes the frame queue by dropping `frames`. A read error
/// cancels `stop`.
pub fn run_capture(
    mut source: Box<dyn FrameSource>,
    frames: QueueSender<Frame>,
    stop: StopToken,
) -> CaptureReport {
    let _guard = stop.cancel_on_panic();
    let mut report = CaptureReport {
        frames_captured: 0,
        frames_dropped: 0,
        exit: StageExit::Stopped,
    };

    loop {
        if stop.is_cancelled() {
            break;
        }
        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                log::info!(
                    "capture: end of stream after {} frames",
                    report.frames_captured
                );
                report.exit = StageExit::EndOfStream;
                break;
            }
            Err(e) => {
                log::error!("capture: read from {} failed: {:#}", source.describe(), e);
                stop.cancel();
                report.exit = StageExit::Failed(format!("{:#}", e));
                break;
            }
        };
        report.frames_captured += 1;

        let seq = frame.seq();
        match frames.push(frame, &stop) {
            Push::Queued => {}
            Push::Dropped => {
                report.frames_dropped += 1;
                log::debug!("capture: frame queue full, dropped frame {}", seq);
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

pub fn spawn_capture(
    source: Box<dyn FrameSource>,
    frames: QueueSender<Frame>,
    stop: StopToken,
) -> Result<JoinHandle<CaptureReport>> {
    thread::Builder::new()
        .name("capture".to_string())
        .spawn(move || run_capture(source, frames, stop))
        .context("failed to spawn capture thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceSettings;
    use crate::ingest::{SourceStats, SyntheticSource};
    use crate::queue::{bounded, OverflowPolicy, Pop};
    use std::time::Duration;

    fn stub(frames: u64) -> Box<dyn FrameSource> {
        let settings = SourceSettings {
            uri: String::new(),
            width: 4,
            height: 4,
            fps: 25,
        };
        let uri = format!("stub://t?frames={}", frames);
        Box::new(SyntheticSource::from_uri(&uri, &settings).unwrap())
    }

    struct BrokenSource;

    impl FrameSource for BrokenSource {
        fn describe(&self) -> String {
            "broken".to_string()
        }

        fn next_frame(&mut self) -> Result<Option<Frame>> {
            Err(anyhow::anyhow!("device unplugged"))
        }

        fn stats(&self) -> SourceStats {
            SourceStats::default()
        }
    }

    #[test]
    fn end_of_stream_closes_queue() {
        let stop = StopToken::new();
        let (tx, rx) = bounded(8, OverflowPolicy::Drop, Duration::from_millis(1)).unwrap();

        let report = run_capture(stub(5), tx, stop.clone());
        assert_eq!(report.exit, StageExit::EndOfStream);
        assert_eq!(report.frames_captured, 5);
        assert!(!stop.is_cancelled());

        let mut seqs = Vec::new();
        loop {
            match rx.pop(Duration::from_millis(10)) {
                Pop::Item(frame) => seqs.push(frame.seq()),
                Pop::Timeout => continue,
                Pop::Closed => break,
            }
        }
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn full_queue_drops_frames() {
        let stop = StopToken::new();
        let (tx, rx) = bounded(2, OverflowPolicy::Drop, Duration::from_millis(1)).unwrap();

        let report = run_capture(stub(10), tx, stop);
        assert_eq!(report.frames_captured, 10);
        assert_eq!(report.frames_dropped, 8);
        assert_eq!(rx.len(), 2);
    }

    #[test]
    fn read_error_cancels_stop() {
        let stop = StopToken::new();
        let (tx, _rx) = bounded(2, OverflowPolicy::Drop, Duration::from_millis(1)).unwrap();

        let report = run_capture(Box::new(BrokenSource), tx, stop.clone());
        assert!(matches!(report.exit, StageExit::Failed(_)));
        assert!(stop.is_cancelled());
    }

    #[test]
    fn observes_stop_before_reading() {
        let stop = StopToken::new();
        stop.cancel();
        let (tx, _rx) = bounded(2, OverflowPolicy::Drop, Duration::from_millis(1)).unwrap();
        let report = run_capture(stub(10), tx, stop);
        assert_eq!(report.frames_captured, 0);
        assert_eq!(report.exit, StageExit::Stopped);
    }
}
