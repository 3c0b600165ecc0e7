//! Raw frame container.
//!
//! A `Frame` is one BGR24 image sample plus its capture metadata. Frames move
//! between pipeline stages by value: there is no `Clone` impl, and pixel data
//! is private and read-only once constructed. Derived frames (annotated,
//! resized) are new allocations that keep the capture sequence and timestamp
//! of the frame they were derived from.

use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Rgb, RgbImage};
use std::time::{Duration, Instant, SystemTime};

/// Channel count of the only pixel layout the pipeline carries (BGR24).
pub const BGR_CHANNELS: u8 = 3;

// Explicitly NOT implementing Clone: a frame is owned by exactly one stage.
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    channels: u8,
    /// Capture order, assigned by the source starting at 0.
    seq: u64,
    captured_at: SystemTime,
    capture_instant: Instant,
}

impl Frame {
    /// Build a BGR24 frame. The buffer length must match the dimensions exactly.
    pub fn new(seq: u64, width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = expected_len(width, height, BGR_CHANNELS)?;
        if data.len() != expected {
            return Err(anyhow!(
                "frame {}x{} expects {} BGR bytes, received {}",
                width,
                height,
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            channels: BGR_CHANNELS,
            seq,
            captured_at: SystemTime::now(),
            capture_instant: Instant::now(),
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }

    /// Time since capture (monotonic clock).
    pub fn age(&self) -> Duration {
        self.capture_instant.elapsed()
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Copy the pixels into an image buffer for drawing.
    ///
    /// The buffer is typed `Rgb` but keeps BGR byte order; callers pick colours
    /// in BGR.
    pub fn to_image(&self) -> Result<RgbImage> {
        ImageBuffer::from_raw(self.width, self.height, self.data.clone())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", self.width, self.height))
    }

    /// Build a frame from a drawn image, keeping this frame's capture metadata.
    pub fn derive_from_image(&self, image: RgbImage) -> Result<Frame> {
        let (width, height) = image.dimensions();
        self.derive(width, height, image.into_raw())
    }

    /// Nearest-neighbour resize. Returns a new frame with the same capture metadata.
    pub fn resized(&self, width: u32, height: u32) -> Result<Frame> {
        if width == 0 || height == 0 {
            return Err(anyhow!("cannot resize frame to {}x{}", width, height));
        }
        let src: ImageBuffer<Rgb<u8>, &[u8]> =
            ImageBuffer::from_raw(self.width, self.height, self.data.as_slice())
                .ok_or_else(|| {
                    anyhow!("frame buffer does not match {}x{}", self.width, self.height)
                })?;
        let out = imageops::resize(&src, width, height, FilterType::Nearest);
        self.derive(width, height, out.into_raw())
    }

    fn derive(&self, width: u32, height: u32, data: Vec<u8>) -> Result<Frame> {
        let mut frame = Frame::new(self.seq, width, height, data)?;
        frame.captured_at = self.captured_at;
        frame.capture_instant = self.capture_instant;
        Ok(frame)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // pixel bytes are never formatted
        f.debug_struct("Frame")
            .field("seq", &self.seq)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("channels", &self.channels)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Byte length of a packed frame, guarding against overflow.
pub fn expected_len(width: u32, height: u32, channels: u8) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(channels as usize))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(seq: u64, width: u32, height: u32) -> Frame {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[x as u8, y as u8, 7]);
            }
        }
        Frame::new(seq, width, height, data).unwrap()
    }

    #[test]
    fn rejects_mismatched_buffer() {
        let err = Frame::new(0, 4, 4, vec![0u8; 10]).unwrap_err();
        assert!(err.to_string().contains("expects 48"));
    }

    #[test]
    fn resize_keeps_capture_metadata() {
        let frame = gradient(42, 8, 6);
        let resized = frame.resized(4, 3).unwrap();
        assert_eq!(resized.dimensions(), (4, 3));
        assert_eq!(resized.byte_len(), 4 * 3 * 3);
        assert_eq!(resized.seq(), 42);
        assert_eq!(resized.captured_at(), frame.captured_at());
        // nearest sampling only reuses source values
        assert!(resized.pixels().chunks(3).all(|px| px[2] == 7));
    }

    #[test]
    fn resize_rejects_zero_target() {
        let frame = gradient(0, 2, 2);
        assert!(frame.resized(0, 2).is_err());
    }
}
