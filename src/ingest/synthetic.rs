use anyhow::{anyhow, bail, Result};
use std::time::{Duration, Instant};

use super::{FrameSource, SourceStats};
use crate::config::SourceSettings;
use crate::frame::{expected_len, Frame, BGR_CHANNELS};

/// Synthetic source for `stub://` URIs.
///
/// Query parameters: `frames` (stop after N frames, endless when absent),
/// `width`/`height` (override the capture resolution) and `fps` (pace output;
/// `0` produces frames as fast as they are read).
pub struct SyntheticSource {
    uri: String,
    width: u32,
    height: u32,
    frame_limit: Option<u64>,
    interval: Option<Duration>,
    frame_count: u64,
    last_frame_at: Option<Instant>,
}

impl SyntheticSource {
    pub fn from_uri(uri: &str, settings: &SourceSettings) -> Result<Self> {
        let parsed =
            url::Url::parse(uri).map_err(|e| anyhow!("invalid stub uri '{}': {}", uri, e))?;
        if parsed.scheme() != "stub" {
            bail!("not a stub uri: {}", uri);
        }

        let mut source = Self {
            uri: uri.to_string(),
            width: settings.width,
            height: settings.height,
            frame_limit: None,
            interval: None,
            frame_count: 0,
            last_frame_at: None,
        };

        for (key, value) in parsed.query_pairs() {
            let number = || {
                value.parse::<u64>().map_err(|_| {
                    anyhow!("stub parameter '{}' must be an integer, got '{}'", key, value)
                })
            };
            match key.as_ref() {
                "frames" => source.frame_limit = Some(number()?),
                "width" => source.width = number()? as u32,
                "height" => source.height = number()? as u32,
                "fps" => {
                    let fps = number()?;
                    source.interval = (fps > 0).then(|| Duration::from_secs_f64(1.0 / fps as f64));
                }
                other => log::warn!("ignoring unknown stub parameter '{}'", other),
            }
        }

        if source.width == 0 || source.height == 0 {
            bail!("stub source needs a non-zero resolution");
        }
        Ok(source)
    }

    /// Moving diagonal gradient so consecutive frames differ.
    fn generate_pixels(&self) -> Result<Vec<u8>> {
        let len = expected_len(self.width, self.height, BGR_CHANNELS)?;
        let width = self.width as usize;
        let shift = self.frame_count as usize;
        let mut pixels = vec![0u8; len];
        for (i, px) in pixels.chunks_exact_mut(3).enumerate() {
            let (x, y) = (i % width, i / width);
            px[0] = ((x + shift) % 256) as u8;
            px[1] = ((y + shift) % 256) as u8;
            px[2] = ((x + y) % 256) as u8;
        }
        Ok(pixels)
    }

    fn pace(&mut self) {
        if let (Some(interval), Some(last)) = (self.interval, self.last_frame_at) {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last_frame_at = Some(Instant::now());
    }
}

impl FrameSource for SyntheticSource {
    fn describe(&self) -> String {
        format!("{} (synthetic {}x{})", self.uri, self.width, self.height)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if let Some(limit) = self.frame_limit {
            if self.frame_count >= limit {
                return Ok(None);
            }
        }
        self.pace();
        let frame = Frame::new(self.frame_count, self.width, self.height, self.generate_pixels()?)?;
        self.frame_count += 1;
        Ok(Some(frame))
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            uri: self.uri.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> SourceSettings {
        SourceSettings {
            uri: String::new(),
            width: 16,
            height: 8,
            fps: 25,
        }
    }

    #[test]
    fn query_overrides_resolution_and_limit() {
        let mut source =
            SyntheticSource::from_uri("stub://cam?frames=2&width=4&height=2", &settings()).unwrap();
        let first = source.next_frame().unwrap().unwrap();
        assert_eq!(first.dimensions(), (4, 2));
        let second = source.next_frame().unwrap().unwrap();
        assert_ne!(first.pixels(), second.pixels());
        assert!(source.next_frame().unwrap().is_none());
        assert_eq!(source.stats().frames_captured, 2);
    }

    #[test]
    fn endless_without_frame_limit() {
        let mut source = SyntheticSource::from_uri("stub://cam", &settings()).unwrap();
        for seq in 0..20 {
            assert_eq!(source.next_frame().unwrap().unwrap().seq(), seq);
        }
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(SyntheticSource::from_uri("stub://cam?frames=lots", &settings()).is_err());
        assert!(SyntheticSource::from_uri("stub://cam?width=0", &settings()).is_err());
    }

    #[test]
    fn fps_paces_output() {
        let mut source =
            SyntheticSource::from_uri("stub://cam?fps=50&frames=3", &settings()).unwrap();
        let started = Instant::now();
        while source.next_frame().unwrap().is_some() {}
        // two inter-frame gaps of 20ms
        assert!(started.elapsed() >= Duration::from_millis(35));
    }
}
