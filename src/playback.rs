//! Push-style playback over a capture session.
//!
//! `PlaybackController` runs a decode loop on a background thread and
//! reports each frame through a handler. The loop owns the session while it
//! runs; `pause()` clears the shared flag, joins the thread, and takes the
//! session back. Once `pause()` returns no further event is delivered.
//!
//! When nothing is ready the loop sleeps `1 / (divisor * frame_rate)`
//! seconds before retrying. Both the divisor and the rate used when the
//! device reports none are configurable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{CaptureError, Result};
use crate::frame::Frame;
use crate::session::{CaptureSession, ReadStatus, SessionState};

pub const DEFAULT_BACKOFF_DIVISOR: u32 = 4;
pub const DEFAULT_FALLBACK_FPS: f64 = 60.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlaybackConfig {
    pub backoff_divisor: u32,
    /// Nominal rate used for the backoff when the device reports none.
    pub fallback_fps: f64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            backoff_divisor: DEFAULT_BACKOFF_DIVISOR,
            fallback_fps: DEFAULT_FALLBACK_FPS,
        }
    }
}

impl PlaybackConfig {
    /// Sleep between "no frame yet" retries for a device running at `hz`.
    ///
    /// An unusable `fallback_fps` is replaced by [`DEFAULT_FALLBACK_FPS`].
    pub fn backoff(&self, hz: Option<f64>) -> Duration {
        let usable = |hz: &f64| hz.is_finite() && *hz > 0.0;
        let hz = hz
            .filter(usable)
            .or(Some(self.fallback_fps).filter(usable))
            .unwrap_or(DEFAULT_FALLBACK_FPS);
        let divisor = self.backoff_divisor.max(1) as f64;
        Duration::from_secs_f64(1.0 / (divisor * hz))
    }
}

#[derive(Debug)]
pub enum PlaybackEvent {
    Frame(Frame),
    EndOfStream,
    /// The loop stopped on a fatal capture error. `pause()` returns it.
    Error(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackState {
    Paused,
    Playing,
}

type EventHandler = Box<dyn FnMut(PlaybackEvent) + Send>;

struct LoopOutcome {
    session: CaptureSession,
    handler: EventHandler,
    result: Result<()>,
}

pub struct PlaybackController {
    session: Option<CaptureSession>,
    handler: Option<EventHandler>,
    playing: Arc<AtomicBool>,
    worker: Option<JoinHandle<LoopOutcome>>,
    config: PlaybackConfig,
}

impl PlaybackController {
    pub fn new<F>(session: CaptureSession, config: PlaybackConfig, handler: F) -> Self
    where
        F: FnMut(PlaybackEvent) + Send + 'static,
    {
        Self {
            session: Some(session),
            handler: Some(Box::new(handler)),
            playing: Arc::new(AtomicBool::new(false)),
            worker: None,
            config,
        }
    }

    /// Deliver events through a channel instead of a handler.
    pub fn with_channel(
        session: CaptureSession,
        config: PlaybackConfig,
    ) -> (Self, mpsc::Receiver<PlaybackEvent>) {
        let (tx, rx) = mpsc::channel();
        let controller = Self::new(session, config, move |event| {
            // A dropped receiver only means nobody is listening any more.
            let _ = tx.send(event);
        });
        (controller, rx)
    }

    pub fn state(&self) -> PlaybackState {
        if self.playing.load(Ordering::SeqCst) {
            PlaybackState::Playing
        } else {
            PlaybackState::Paused
        }
    }

    pub fn is_playing(&self) -> bool {
        self.state() == PlaybackState::Playing
    }

    /// The session, while paused.
    pub fn session(&self) -> Option<&CaptureSession> {
        self.session.as_ref()
    }

    pub fn play(&mut self) -> Result<()> {
        if self.is_playing() {
            return Ok(());
        }
        // The loop may have ended by itself (end of stream or error).
        if let Err(err) = self.join_worker() {
            log::warn!("PlaybackController: previous decode loop ended with: {}", err);
        }

        let mut session = self.session.take().ok_or_else(|| {
            CaptureError::StreamStart("session lost after playback thread panic".to_string())
        })?;
        let handler = self.handler.take().ok_or_else(|| {
            CaptureError::StreamStart("handler lost after playback thread panic".to_string())
        })?;
        if session.state() == SessionState::Idle {
            if let Err(err) = session.start_capture() {
                self.session = Some(session);
                self.handler = Some(handler);
                return Err(err);
            }
        }

        let backoff = self.config.backoff(session.format().frame_rate_hz());
        let device = session.device().path.clone();
        self.playing.store(true, Ordering::SeqCst);
        let playing = Arc::clone(&self.playing);
        let worker = std::thread::Builder::new()
            .name(format!("playback:{}", device))
            .spawn(move || decode_loop(session, handler, playing, backoff));
        match worker {
            Ok(worker) => {
                self.worker = Some(worker);
                log::info!(
                    "PlaybackController: playing {} (backoff {:?})",
                    device,
                    backoff
                );
                Ok(())
            }
            Err(err) => {
                self.playing.store(false, Ordering::SeqCst);
                Err(CaptureError::StreamStart(format!(
                    "spawn playback thread: {}",
                    err
                )))
            }
        }
    }

    /// Stop the decode loop and wait for it to exit.
    pub fn pause(&mut self) -> Result<()> {
        self.playing.store(false, Ordering::SeqCst);
        let result = self.join_worker();
        if let Some(session) = &self.session {
            log::info!("PlaybackController: paused {}", session.device().path);
        }
        result
    }

    /// Pause, then stop the underlying capture.
    ///
    /// Capture is stopped even when the decode loop had failed; that
    /// failure is still returned.
    pub fn stop_capture(&mut self) -> Result<()> {
        let paused = self.pause();
        let stopped = match self.session.as_mut() {
            Some(session) => session.stop_capture(),
            None => Ok(()),
        };
        paused.and(stopped)
    }

    /// Pause and hand the session back.
    pub fn into_session(mut self) -> Result<CaptureSession> {
        self.pause()?;
        self.session.take().ok_or_else(|| {
            CaptureError::StreamStop("session lost after playback thread panic".to_string())
        })
    }

    fn join_worker(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let outcome = worker
            .join()
            .map_err(|_| CaptureError::StreamStop("playback thread panicked".to_string()))?;
        self.session = Some(outcome.session);
        self.handler = Some(outcome.handler);
        outcome.result
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        if let Err(err) = self.pause() {
            log::warn!("PlaybackController: pause on drop failed: {}", err);
        }
    }
}

fn decode_loop(
    mut session: CaptureSession,
    mut handler: EventHandler,
    playing: Arc<AtomicBool>,
    backoff: Duration,
) -> LoopOutcome {
    let mut result = Ok(());
    while playing.load(Ordering::SeqCst) {
        match session.try_read_frame() {
            Ok(ReadStatus::Frame(frame)) => {
                handler(PlaybackEvent::Frame(frame));
            }
            Ok(ReadStatus::NoFrameYet) => std::thread::sleep(backoff),
            Ok(ReadStatus::EndOfStream) => {
                log::info!("PlaybackController: end of stream on {}", session.device().path);
                handler(PlaybackEvent::EndOfStream);
                playing.store(false, Ordering::SeqCst);
            }
            Err(err) => {
                log::error!(
                    "PlaybackController: decode loop on {} failed: {}",
                    session.device().path,
                    err
                );
                handler(PlaybackEvent::Error(err.to_string()));
                playing.store(false, Ordering::SeqCst);
                result = Err(err);
            }
        }
    }
    LoopOutcome {
        session,
        handler,
        result,
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::FormatRequest;

    #[test]
    fn backoff_is_quarter_frame_period() {
        let config = PlaybackConfig::default();
        assert_eq!(config.backoff(Some(25.0)), Duration::from_millis(10));
        // Unknown or zero rates fall back to 60 Hz.
        let fallback = Duration::from_secs_f64(1.0 / 240.0);
        assert_eq!(config.backoff(None), fallback);
        assert_eq!(config.backoff(Some(0.0)), fallback);

        let custom = PlaybackConfig {
            backoff_divisor: 1,
            fallback_fps: 10.0,
        };
        assert_eq!(custom.backoff(None), Duration::from_millis(100));
    }

    #[test]
    fn unusable_fallback_rate_uses_default() {
        let fallback = Duration::from_secs_f64(1.0 / (4.0 * DEFAULT_FALLBACK_FPS));
        for fallback_fps in [0.0, -5.0, f64::NAN, f64::INFINITY] {
            let config = PlaybackConfig {
                backoff_divisor: 4,
                fallback_fps,
            };
            assert_eq!(config.backoff(None), fallback);
        }
        // A usable device rate still wins.
        let config = PlaybackConfig {
            backoff_divisor: 4,
            fallback_fps: 0.0,
        };
        assert_eq!(config.backoff(Some(25.0)), Duration::from_millis(10));
    }

    #[test]
    fn end_of_stream_stops_loop() -> Result<()> {
        let session = CaptureSession::open_path(
            "stub://display?frames=3&fps=200",
            &FormatRequest::default(),
        )?;
        let (mut controller, events) =
            PlaybackController::with_channel(session, PlaybackConfig::default());
        controller.play()?;

        let mut frames = 0;
        loop {
            match events.recv_timeout(Duration::from_secs(5)) {
                Ok(PlaybackEvent::Frame(_)) => frames += 1,
                Ok(PlaybackEvent::EndOfStream) => break,
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(frames, 3);
        controller.pause()?;
        assert_eq!(controller.state(), PlaybackState::Paused);
        Ok(())
    }

    #[test]
    fn poll_timeout_surfaces_from_pause() -> Result<()> {
        use crate::device::DevicePath;
        use crate::ingest::ring::{BufferRing, RingConfig};
        use crate::ingest::synthetic::SimulatedRingDevice;
        use crate::session::{CaptureBackend, SessionConfig};

        let ring = BufferRing::open(
            Box::new(SimulatedRingDevice::webcam("stub://stalled").stalled()),
            &FormatRequest::default(),
            RingConfig::default(),
        )?;
        let session = CaptureSession::with_backend(
            DevicePath::parse("stub://stalled"),
            CaptureBackend::Ring(ring),
            SessionConfig::default(),
        );
        let (mut controller, events) =
            PlaybackController::with_channel(session, PlaybackConfig::default());
        controller.play()?;
        assert!(matches!(
            events.recv_timeout(Duration::from_secs(5)),
            Ok(PlaybackEvent::Error(_))
        ));
        assert!(matches!(
            controller.pause(),
            Err(CaptureError::PollTimeout(_))
        ));
        Ok(())
    }

    #[test]
    fn stop_capture_after_loop_failure_still_stops_stream() -> Result<()> {
        use crate::device::DevicePath;
        use crate::ingest::ring::{BufferRing, RingConfig};
        use crate::ingest::synthetic::{ResourceCounter, SimulatedRingDevice};
        use crate::session::{CaptureBackend, SessionConfig};

        let counter = ResourceCounter::default();
        let ring = BufferRing::open(
            Box::new(
                SimulatedRingDevice::webcam("stub://stalled")
                    .with_counter(&counter)
                    .stalled(),
            ),
            &FormatRequest::default(),
            RingConfig {
                poll_timeout: Duration::from_millis(20),
                ..RingConfig::default()
            },
        )?;
        let session = CaptureSession::with_backend(
            DevicePath::parse("stub://stalled"),
            CaptureBackend::Ring(ring),
            SessionConfig::default(),
        );
        let (mut controller, events) =
            PlaybackController::with_channel(session, PlaybackConfig::default());
        controller.play()?;
        assert!(matches!(
            events.recv_timeout(Duration::from_secs(5)),
            Ok(PlaybackEvent::Error(_))
        ));

        assert!(matches!(
            controller.stop_capture(),
            Err(CaptureError::PollTimeout(_))
        ));
        assert!(!counter.streaming());
        let state = controller.session().map(|session| session.state());
        assert_eq!(state, Some(SessionState::Idle));
        Ok(())
    }
}
