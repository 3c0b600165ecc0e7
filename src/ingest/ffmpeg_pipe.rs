//! Decoder-backed frame source.
//!
//! Spawns `ffmpeg` to decode a capture device, file or network stream and
//! scale it to the capture resolution, reading packed BGR24 frames from its
//! stdout. The child is killed when the source is dropped.

use anyhow::{anyhow, bail, Context, Result};
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::time::{Duration, Instant};

use super::{FrameSource, SourceSpec, SourceStats};
use crate::config::SourceSettings;
use crate::frame::{expected_len, Frame, BGR_CHANNELS};

/// How long a decoder that closed its output gets to report an exit status.
const EXIT_GRACE: Duration = Duration::from_secs(2);

pub struct FfmpegPipeSource {
    uri: String,
    width: u32,
    height: u32,
    frame_len: usize,
    child: Child,
    stdout: ChildStdout,
    frame_count: u64,
}

impl FfmpegPipeSource {
    pub fn open(spec: &SourceSpec, settings: &SourceSettings) -> Result<Self> {
        let program = which::which("ffmpeg").map_err(|_| anyhow!("ffmpeg not found on PATH"))?;
        Self::open_with(program, spec, settings)
    }

    /// Open using an explicit decoder binary.
    pub fn open_with(
        program: PathBuf,
        spec: &SourceSpec,
        settings: &SourceSettings,
    ) -> Result<Self> {
        let (uri, input_args) = input_args(spec, settings)?;
        let frame_len = expected_len(settings.width, settings.height, BGR_CHANNELS)?;

        let mut args = vec!["-hide_banner".to_string(), "-loglevel".into(), "error".into()];
        args.extend(input_args);
        args.extend([
            "-an".to_string(),
            "-vf".into(),
            format!("scale={}:{}", settings.width, settings.height),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "bgr24".into(),
            "-".into(),
        ]);
        log::debug!("spawning decoder: {} {}", program.display(), args.join(" "));

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to spawn {}", program.display()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("decoder stdout was not captured"))?;

        Ok(Self {
            uri,
            width: settings.width,
            height: settings.height,
            frame_len,
            child,
            stdout,
            frame_count: 0,
        })
    }

    /// Called once stdout hits EOF: only a clean decoder exit is end of stream.
    fn finish(&mut self) -> Result<Option<Frame>> {
        let deadline = Instant::now() + EXIT_GRACE;
        let status = loop {
            match self.child.try_wait().context("failed to poll decoder process")? {
                Some(status) => break status,
                None if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                None => bail!("{}: decoder closed its output but did not exit", self.uri),
            }
        };
        if !status.success() {
            bail!(
                "{}: decoder exited with {} after {} frames",
                self.uri,
                status,
                self.frame_count
            );
        }
        log::info!("{}: end of stream after {} frames", self.uri, self.frame_count);
        Ok(None)
    }
}

fn input_args(spec: &SourceSpec, settings: &SourceSettings) -> Result<(String, Vec<String>)> {
    match spec {
        SourceSpec::Device(index) => {
            Ok((format!("device {}", index), device_args(*index, settings)))
        }
        SourceSpec::Location(location) => {
            let mut args = Vec::new();
            if is_local_path(location) {
                if !Path::new(location).exists() {
                    bail!("input file {} does not exist", location);
                }
            } else if location.starts_with("rtsp://") {
                args.extend(["-rtsp_transport".to_string(), "tcp".into()]);
            }
            args.extend(["-i".to_string(), location.clone()]);
            Ok((location.clone(), args))
        }
        SourceSpec::Synthetic(uri) => bail!("{} is not a decoder input", uri),
    }
}

#[cfg(target_os = "macos")]
fn device_args(index: u32, settings: &SourceSettings) -> Vec<String> {
    vec![
        "-f".into(),
        "avfoundation".into(),
        "-framerate".into(),
        settings.fps.to_string(),
        "-i".into(),
        index.to_string(),
    ]
}

#[cfg(not(target_os = "macos"))]
fn device_args(index: u32, settings: &SourceSettings) -> Vec<String> {
    vec![
        "-f".into(),
        "v4l2".into(),
        "-framerate".into(),
        settings.fps.to_string(),
        "-i".into(),
        format!("/dev/video{}", index),
    ]
}

/// Anything without a URL scheme is treated as a local file.
fn is_local_path(location: &str) -> bool {
    match url::Url::parse(location) {
        // single-letter schemes are windows drive letters
        Ok(url) => url.scheme() == "file" || url.scheme().len() == 1,
        Err(_) => true,
    }
}

impl FrameSource for FfmpegPipeSource {
    fn describe(&self) -> String {
        format!("{} (ffmpeg {}x{})", self.uri, self.width, self.height)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let mut buf = vec![0u8; self.frame_len];
        match self.stdout.read_exact(&mut buf) {
            Ok(()) => {}
            // a trailing partial frame is discarded
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return self.finish(),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read frame from {}", self.uri));
            }
        }
        let frame = Frame::new(self.frame_count, self.width, self.height, buf)?;
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

impl Drop for FfmpegPipeSource {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> SourceSettings {
        SourceSettings {
            uri: String::new(),
            width: 2,
            height: 2,
            fps: 25,
        }
    }

    #[test]
    fn classifies_local_paths() {
        assert!(is_local_path("clip.mp4"));
        assert!(is_local_path("/data/clip.mp4"));
        assert!(is_local_path("C:\\videos\\clip.mp4"));
        assert!(!is_local_path("rtsp://192.168.1.10:8554/main"));
        assert!(!is_local_path("rtmp://host/live/key"));
    }

    #[test]
    fn rtsp_inputs_use_tcp_transport() {
        let spec = SourceSpec::Location("rtsp://cam/main".to_string());
        let (_, args) = input_args(&spec, &settings()).unwrap();
        assert_eq!(args, vec!["-rtsp_transport", "tcp", "-i", "rtsp://cam/main"]);
    }

    #[test]
    fn missing_local_file_is_rejected_before_spawn() {
        let spec = SourceSpec::Location("/nonexistent/clip.mp4".to_string());
        assert!(input_args(&spec, &settings()).is_err());
    }

    /// A stand-in decoder: a shell script that ignores its arguments.
    #[cfg(unix)]
    fn script_decoder(body: &str) -> tempfile::TempPath {
        let script = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(script.path(), format!("#!/bin/sh\n{}\n", body)).unwrap();
        let mut perms = std::fs::metadata(script.path()).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(script.path(), perms).unwrap();
        script.into_temp_path()
    }

    #[cfg(unix)]
    #[test]
    fn reads_packed_frames_until_eof() {
        // 2.5 frames of 12 bytes, then a clean exit
        let decoder = script_decoder("printf 'aaaaaaaaaaaabbbbbbbbbbbbcccccc'");
        let input = tempfile::NamedTempFile::new().unwrap();
        let spec = SourceSpec::Location(input.path().display().to_string());
        let mut source =
            FfmpegPipeSource::open_with(decoder.to_path_buf(), &spec, &settings()).unwrap();

        let first = source.next_frame().unwrap().unwrap();
        assert_eq!(first.pixels(), b"aaaaaaaaaaaa");
        let second = source.next_frame().unwrap().unwrap();
        assert_eq!(second.seq(), 1);
        assert!(source.next_frame().unwrap().is_none());
        assert_eq!(source.stats().frames_captured, 2);
    }

    #[cfg(unix)]
    #[test]
    fn decoder_crash_is_a_read_error() {
        let decoder = script_decoder("printf 'aaaaaaaaaaaa'; exit 1");
        let input = tempfile::NamedTempFile::new().unwrap();
        let spec = SourceSpec::Location(input.path().display().to_string());
        let mut source =
            FfmpegPipeSource::open_with(decoder.to_path_buf(), &spec, &settings()).unwrap();

        assert!(source.next_frame().unwrap().is_some());
        let err = source.next_frame().unwrap_err();
        assert!(format!("{:#}", err).contains("decoder exited"));
        assert_eq!(source.stats().frames_captured, 1);
    }
}
