//! Re-encoding sink backed by an encoder subprocess.
//!
//! Annotated frames are written as packed BGR24 to the encoder's stdin. The
//! encoder process is a managed resource: started explicitly, restarted at
//! most once per failure episode, and terminated on `close()` or drop.

use anyhow::{anyhow, Context, Result};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::time::{Duration, Instant};

use super::health::{RecoveryAction, SinkHealth};
use crate::config::StreamSettings;
use crate::frame::Frame;

/// Lifecycle state of a [`StreamSink`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    NotStarted,
    Started,
    Failed,
    Closed,
}

/// Program and arguments used to launch the encoder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncoderCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl EncoderCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// `ffmpeg` reading raw BGR24 from stdin and pushing H.264/FLV to `settings.url`.
    pub fn ffmpeg(settings: &StreamSettings) -> Self {
        let gop = (settings.fps * 2).to_string();
        let size = format!("{}x{}", settings.width, settings.height);
        let fps = settings.fps.to_string();
        let args = [
            "-loglevel",
            "error",
            "-f",
            "rawvideo",
            "-pix_fmt",
            "bgr24",
            "-s",
            size.as_str(),
            "-r",
            fps.as_str(),
            "-i",
            "-",
            "-c:v",
            "libx264",
            "-preset",
            "veryfast",
            "-tune",
            "zerolatency",
            "-profile:v",
            "main",
            "-level",
            "3.1",
            "-g",
            gop.as_str(),
            "-keyint_min",
            gop.as_str(),
            "-sc_threshold",
            "0",
            "-b:v",
            "2300k",
            "-maxrate",
            "2500k",
            "-bufsize",
            "5000k",
            "-an",
            "-f",
            "flv",
            settings.url.as_str(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        Self::new(settings.encoder.clone(), args)
    }
}

struct EncoderProcess {
    child: Child,
    stdin: Option<ChildStdin>,
}

pub struct StreamSink {
    command: EncoderCommand,
    width: u32,
    height: u32,
    close_timeout: Duration,
    state: StreamState,
    process: Option<EncoderProcess>,
    health: SinkHealth,
    frames_written: u64,
}

impl StreamSink {
    pub fn new(settings: &StreamSettings) -> Self {
        let mut command = EncoderCommand::ffmpeg(settings);
        if let Ok(resolved) = which::which(&settings.encoder) {
            command.program = resolved;
        }
        Self::with_command(command, settings)
    }

    /// Sink with an explicit encoder command; target size and timeouts come from `settings`.
    pub fn with_command(command: EncoderCommand, settings: &StreamSettings) -> Self {
        Self {
            command,
            width: settings.width,
            height: settings.height,
            close_timeout: settings.close_timeout,
            state: StreamState::NotStarted,
            process: None,
            health: SinkHealth::new(),
            frames_written: 0,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn health(&self) -> &SinkHealth {
        &self.health
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Process id of the running encoder, if any.
    pub fn encoder_pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.child.id())
    }

    /// Spawn the encoder. Only acts from `NotStarted` or `Closed`.
    ///
    /// Returns whether an encoder is running afterwards.
    pub fn start(&mut self) -> bool {
        match self.state {
            StreamState::Started => return true,
            StreamState::Failed => return false,
            StreamState::NotStarted | StreamState::Closed => {}
        }
        self.health.reset();
        match self.spawn() {
            Ok(()) => {
                self.state = StreamState::Started;
                self.health.mark_connected();
                log::info!(
                    "stream encoder started ({} {}x{})",
                    self.command.program.display(),
                    self.width,
                    self.height
                );
                true
            }
            Err(e) => {
                log::error!("stream encoder failed to start: {:#}", e);
                self.state = StreamState::Failed;
                // a sink that never started has no restart budget either
                self.health.disable();
                false
            }
        }
    }

    fn spawn(&mut self) -> Result<()> {
        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.command.program.display()))?;
        let stdin = child.stdin.take();
        if stdin.is_none() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(anyhow!("encoder stdin was not captured"));
        }
        self.process = Some(EncoderProcess { child, stdin });
        Ok(())
    }

    /// Send one frame to the encoder, resizing to the target size if needed.
    ///
    /// Failures are handled here: the triggering frame is discarded and one
    /// restart is attempted per failure episode.
    pub fn write(&mut self, frame: &Frame) {
        if self.state != StreamState::Started {
            return;
        }
        match self.try_write(frame) {
            Ok(()) => {
                self.frames_written += 1;
                self.health.record_success();
            }
            Err(e) => self.handle_failure(e),
        }
    }

    fn try_write(&mut self, frame: &Frame) -> Result<()> {
        let process = self
            .process
            .as_mut()
            .ok_or_else(|| anyhow!("encoder process is absent"))?;
        if let Some(status) = process
            .child
            .try_wait()
            .context("failed to poll encoder process")?
        {
            return Err(anyhow!("encoder exited with {}", status));
        }

        let resized;
        let frame = if frame.dimensions() == (self.width, self.height) {
            frame
        } else {
            resized = frame.resized(self.width, self.height)?;
            &resized
        };

        let stdin = process
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("encoder stdin is closed"))?;
        stdin
            .write_all(frame.pixels())
            .context("failed to write frame to encoder")?;
        Ok(())
    }

    fn handle_failure(&mut self, err: anyhow::Error) {
        self.state = StreamState::Failed;
        self.reap(Duration::ZERO);

        match self.health.record_failure() {
            RecoveryAction::Restart => {
                log::warn!("stream encoder failed ({:#}), restarting", err);
                match self.spawn() {
                    Ok(()) => {
                        self.state = StreamState::Started;
                        self.health.mark_connected();
                    }
                    Err(e) => log::error!("stream encoder restart failed: {:#}", e),
                }
            }
            RecoveryAction::Absorb => {
                log::debug!("stream encoder failure absorbed: {:#}", err);
            }
        }
    }

    /// Close stdin, ask the encoder to exit, wait up to `timeout`, then kill.
    fn reap(&mut self, timeout: Duration) {
        let Some(mut process) = self.process.take() else {
            return;
        };
        drop(process.stdin.take());
        if !terminate_if_running(&mut process.child) {
            return;
        }

        let deadline = Instant::now() + timeout;
        loop {
            match process.child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                _ => break,
            }
        }
        log::debug!("stream encoder did not exit in {:?}, killing", timeout);
        let _ = process.child.kill();
        let _ = process.child.wait();
    }

    /// Stop the encoder. Idempotent; safe on a sink that never started.
    pub fn close(&mut self) {
        if matches!(self.state, StreamState::NotStarted | StreamState::Closed) {
            return;
        }
        self.reap(self.close_timeout);
        self.state = StreamState::Closed;
        log::info!(
            "stream encoder closed after {} frames ({} restarts)",
            self.frames_written,
            self.health.restarts()
        );
    }
}

impl Drop for StreamSink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Ask a live encoder to exit. Returns `false` when the child has already
/// exited and been reaped, in which case its pid is not signalled.
fn terminate_if_running(child: &mut Child) -> bool {
    match child.try_wait() {
        Ok(Some(_)) => false,
        _ => {
            terminate(child);
            true
        }
    }
}

#[cfg(unix)]
fn terminate(child: &Child) {
    // SAFETY: plain kill(2) on a pid we spawned and have not yet reaped.
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate(_child: &Child) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> StreamSettings {
        StreamSettings {
            enabled: true,
            url: "rtmp://example/live/key".to_string(),
            width: 4,
            height: 2,
            fps: 25,
            encoder: "ffmpeg".to_string(),
            close_timeout: Duration::from_millis(500),
        }
    }

    #[test]
    fn ffmpeg_command_matches_relay_profile() {
        let mut s = settings();
        s.width = 1280;
        s.height = 720;
        let cmd = EncoderCommand::ffmpeg(&s);
        let joined = cmd.args.join(" ");
        assert!(joined
            .starts_with("-loglevel error -f rawvideo -pix_fmt bgr24 -s 1280x720 -r 25 -i -"));
        assert!(joined.contains("-g 50 -keyint_min 50 -sc_threshold 0"));
        assert!(joined.contains("-b:v 2300k -maxrate 2500k -bufsize 5000k -an"));
        assert!(joined.ends_with("-f flv rtmp://example/live/key"));
    }

    #[test]
    fn close_on_never_started_sink_is_noop() {
        let mut sink =
            StreamSink::with_command(EncoderCommand::new("/nonexistent", vec![]), &settings());
        sink.close();
        sink.close();
        assert_eq!(sink.state(), StreamState::NotStarted);
    }

    #[test]
    fn failed_spawn_leaves_sink_failed_without_restarts() {
        let mut sink = StreamSink::with_command(
            EncoderCommand::new("/nonexistent/encoder", vec![]),
            &settings(),
        );
        assert!(!sink.start());
        assert_eq!(sink.state(), StreamState::Failed);
        // start is not retried from Failed
        assert!(!sink.start());

        let frame = Frame::new(0, 4, 2, vec![0u8; 24]).unwrap();
        sink.write(&frame);
        assert_eq!(sink.health().restarts(), 0);

        sink.close();
        assert_eq!(sink.state(), StreamState::Closed);
    }

    #[cfg(unix)]
    #[test]
    fn reaped_encoder_is_not_signalled() {
        let mut exited = Command::new("true").spawn().unwrap();
        exited.wait().unwrap();
        assert!(!terminate_if_running(&mut exited));

        let mut running = Command::new("sleep").arg("5").spawn().unwrap();
        assert!(terminate_if_running(&mut running));
        let status = running.wait().unwrap();
        assert!(!status.success());
    }
}
