//! Frame ingestion sources.
//!
//! This module provides the sources the capture stage reads from:
//! - Synthetic source (`stub://name?frames=N`), for demos and tests
//! - ffmpeg pipe source for capture devices, files and network streams
//!
//! Every source produces BGR24 `Frame`s at the configured capture resolution,
//! numbered from 0 in capture order. `next_frame` returns `Ok(None)` at end of
//! stream and `Err` on a read failure.

pub mod ffmpeg_pipe;
pub mod synthetic;

use anyhow::{bail, Context, Result};

use crate::config::SourceSettings;
use crate::frame::Frame;

pub use ffmpeg_pipe::FfmpegPipeSource;
pub use synthetic::SyntheticSource;

/// Blocking producer of raw frames.
pub trait FrameSource: Send {
    /// Human-readable source identifier for logs.
    fn describe(&self) -> String;

    /// Read the next frame. May block.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    fn stats(&self) -> SourceStats;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub uri: String,
}

/// What a source string refers to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceSpec {
    /// Local capture device index.
    Device(u32),
    /// `stub://...` synthetic source.
    Synthetic(String),
    /// File path or stream URL handed to the decoder.
    Location(String),
}

impl SourceSpec {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            bail!("source must not be empty");
        }
        if let Ok(index) = raw.parse::<u32>() {
            return Ok(Self::Device(index));
        }
        if raw.starts_with("stub://") {
            return Ok(Self::Synthetic(raw.to_string()));
        }
        Ok(Self::Location(raw.to_string()))
    }
}

/// Open the configured source and read its first frame.
///
/// A source that cannot be opened, or that ends before producing a frame, is
/// fatal to the pipeline.
pub fn open_source(settings: &SourceSettings) -> Result<Box<dyn FrameSource>> {
    let spec = SourceSpec::parse(&settings.uri)?;
    let inner: Box<dyn FrameSource> = match spec {
        SourceSpec::Synthetic(uri) => Box::new(SyntheticSource::from_uri(&uri, settings)?),
        other => Box::new(FfmpegPipeSource::open(&other, settings)?),
    };
    let primed = PrimedSource::new(inner)
        .with_context(|| format!("failed to open source {}", settings.uri))?;
    log::info!("source {} opened", primed.describe());
    Ok(Box::new(primed))
}

/// Wrapper that holds the probed first frame until it is asked for.
struct PrimedSource {
    first: Option<Frame>,
    inner: Box<dyn FrameSource>,
}

impl PrimedSource {
    fn new(mut inner: Box<dyn FrameSource>) -> Result<Self> {
        match inner.next_frame()? {
            Some(frame) => Ok(Self {
                first: Some(frame),
                inner,
            }),
            None => bail!("source {} produced no frames", inner.describe()),
        }
    }
}

impl FrameSource for PrimedSource {
    fn describe(&self) -> String {
        self.inner.describe()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if let Some(frame) = self.first.take() {
            return Ok(Some(frame));
        }
        self.inner.next_frame()
    }

    fn stats(&self) -> SourceStats {
        self.inner.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(uri: &str) -> SourceSettings {
        SourceSettings {
            uri: uri.to_string(),
            width: 8,
            height: 4,
            fps: 25,
        }
    }

    #[test]
    fn classifies_source_strings() {
        assert_eq!(SourceSpec::parse("0").unwrap(), SourceSpec::Device(0));
        assert_eq!(SourceSpec::parse(" 2 ").unwrap(), SourceSpec::Device(2));
        assert_eq!(
            SourceSpec::parse("stub://cam").unwrap(),
            SourceSpec::Synthetic("stub://cam".to_string())
        );
        assert_eq!(
            SourceSpec::parse("rtsp://10.0.0.2/main").unwrap(),
            SourceSpec::Location("rtsp://10.0.0.2/main".to_string())
        );
        assert!(SourceSpec::parse("  ").is_err());
    }

    #[test]
    fn opened_source_replays_probe_frame_first() {
        let mut source = open_source(&settings("stub://cam?frames=3")).unwrap();
        let mut seqs = Vec::new();
        while let Some(frame) = source.next_frame().unwrap() {
            assert_eq!(frame.dimensions(), (8, 4));
            seqs.push(frame.seq());
        }
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(source.stats().frames_captured, 3);
    }

    #[test]
    fn empty_source_is_fatal() {
        assert!(open_source(&settings("stub://cam?frames=0")).is_err());
    }

    #[test]
    fn missing_file_is_fatal() {
        assert!(open_source(&settings("/nonexistent/clip.mp4")).is_err());
    }
}
