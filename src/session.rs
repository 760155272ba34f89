//! Capture sessions.
//!
//! A `CaptureSession` presents one contract over both capture strategies:
//! `start_capture`, `stop_capture`, the non-blocking `try_read_frame` and
//! the blocking `read_frame`. The backend is picked once at open time and
//! held as a closed [`CaptureBackend`] variant.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::device::{DeviceKind, DevicePath};
use crate::error::{CaptureError, Result};
use crate::format::{FormatRequest, NegotiatedFormat};
use crate::frame::Frame;
use crate::ingest::callback::{FrameSource, QueueBackend, DEFAULT_QUEUE_CAPACITY};
use crate::ingest::ring::{BufferRing, RingConfig, RingStats};
use crate::ingest::synthetic::{SimulatedRingDevice, StubOptions, SyntheticProducer};
use crate::queue::QueueStats;

pub use crate::ingest::ReadStatus;

/// Pause after a successful blocking read.
pub const DEFAULT_READ_QUANTUM: Duration = Duration::from_millis(1);

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub ring: RingConfig,
    pub queue_capacity: usize,
    pub read_quantum: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ring: RingConfig::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            read_quantum: DEFAULT_READ_QUANTUM,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Capturing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Idle => "idle",
            SessionState::Capturing => "capturing",
        })
    }
}

// ----------------------------------------------------------------------------
// Backend variant
// ----------------------------------------------------------------------------

pub enum CaptureBackend {
    /// Kernel buffer ring polled with a bounded wait.
    Ring(BufferRing),
    /// Bounded queue fed by a framework callback.
    Queue(QueueBackend),
}

impl CaptureBackend {
    fn start(&mut self) -> Result<()> {
        match self {
            CaptureBackend::Ring(ring) => ring.start(),
            CaptureBackend::Queue(queue) => queue.start(),
        }
    }

    fn stop(&mut self) -> Result<()> {
        match self {
            CaptureBackend::Ring(ring) => ring.stop(),
            CaptureBackend::Queue(queue) => queue.stop(),
        }
    }

    fn try_read(&mut self) -> Result<ReadStatus> {
        match self {
            CaptureBackend::Ring(ring) => Ok(match ring.try_read_frame()? {
                Some(frame) => ReadStatus::Frame(frame),
                None => ReadStatus::NoFrameYet,
            }),
            CaptureBackend::Queue(queue) => queue.try_read(),
        }
    }

    pub fn format(&self) -> &NegotiatedFormat {
        match self {
            CaptureBackend::Ring(ring) => ring.format(),
            CaptureBackend::Queue(queue) => queue.format(),
        }
    }

    /// `None` for the ring backend.
    pub fn source(&self) -> Option<FrameSource> {
        match self {
            CaptureBackend::Ring(_) => None,
            CaptureBackend::Queue(queue) => Some(queue.source()),
        }
    }

    fn is_healthy(&self) -> bool {
        match self {
            CaptureBackend::Ring(ring) => ring.is_healthy(),
            CaptureBackend::Queue(_) => true,
        }
    }

    fn close(self) -> Result<()> {
        match self {
            CaptureBackend::Ring(ring) => ring.close(),
            CaptureBackend::Queue(queue) => queue.close(),
        }
    }
}

impl fmt::Debug for CaptureBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureBackend::Ring(ring) => write!(f, "Ring({})", ring.device_name()),
            CaptureBackend::Queue(queue) => {
                write!(f, "Queue({:?}, {})", queue.source(), queue.device_name())
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Backend selection
// ----------------------------------------------------------------------------

fn open_backend(
    device: &DevicePath,
    request: &FormatRequest,
    config: &SessionConfig,
) -> Result<CaptureBackend> {
    if let Some(options) = StubOptions::parse(&device.path) {
        return open_stub(device, &options, request, config);
    }
    match device.kind {
        DeviceKind::Camera => open_camera(device, request, config),
        DeviceKind::Display | DeviceKind::Window => open_screen(device, request, config),
    }
}

fn open_stub(
    device: &DevicePath,
    options: &StubOptions,
    request: &FormatRequest,
    config: &SessionConfig,
) -> Result<CaptureBackend> {
    let source = match (device.kind, options.source.as_deref()) {
        (DeviceKind::Camera, None | Some("ring")) => None,
        (DeviceKind::Camera, Some("media")) => Some(FrameSource::MediaFramework),
        (DeviceKind::Camera, Some(other)) => {
            return Err(CaptureError::device_open(
                &device.path,
                format!("unknown stub source '{}'", other),
            ))
        }
        (DeviceKind::Display | DeviceKind::Window, _) => Some(FrameSource::CaptureGraph),
    };
    match source {
        None => {
            let ring_device = SimulatedRingDevice::from_stub(options);
            Ok(CaptureBackend::Ring(BufferRing::open(
                Box::new(ring_device),
                request,
                config.ring.clone(),
            )?))
        }
        Some(source) => {
            let producer = SyntheticProducer::from_stub(options, source);
            Ok(CaptureBackend::Queue(QueueBackend::open(
                Box::new(producer),
                request,
                config.queue_capacity,
            )?))
        }
    }
}

fn open_camera(
    device: &DevicePath,
    request: &FormatRequest,
    config: &SessionConfig,
) -> Result<CaptureBackend> {
    #[cfg(all(feature = "v4l2", target_os = "linux"))]
    {
        let ring_device = crate::ingest::v4l2::V4l2Device::open(&device.path)?;
        Ok(CaptureBackend::Ring(BufferRing::open(
            Box::new(ring_device),
            request,
            config.ring.clone(),
        )?))
    }
    #[cfg(all(feature = "gstreamer", not(all(feature = "v4l2", target_os = "linux"))))]
    {
        let producer = crate::ingest::gstreamer::GstProducer::open(device, request)?;
        Ok(CaptureBackend::Queue(QueueBackend::open(
            Box::new(producer),
            request,
            config.queue_capacity,
        )?))
    }
    #[cfg(not(any(all(feature = "v4l2", target_os = "linux"), feature = "gstreamer")))]
    {
        let _ = (request, config);
        Err(CaptureError::Unsupported(format!(
            "camera capture of {} requires the v4l2 or gstreamer feature",
            device.path
        )))
    }
}

fn open_screen(
    device: &DevicePath,
    request: &FormatRequest,
    config: &SessionConfig,
) -> Result<CaptureBackend> {
    #[cfg(feature = "gstreamer")]
    {
        let producer = crate::ingest::gstreamer::GstProducer::open(device, request)?;
        Ok(CaptureBackend::Queue(QueueBackend::open(
            Box::new(producer),
            request,
            config.queue_capacity,
        )?))
    }
    #[cfg(not(feature = "gstreamer"))]
    {
        let _ = (request, config);
        Err(CaptureError::Unsupported(format!(
            "{} capture of {} requires the gstreamer feature",
            device.kind, device.path
        )))
    }
}

// ----------------------------------------------------------------------------
// CaptureSession
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize)]
pub struct SessionStats {
    pub device: String,
    pub state: SessionState,
    pub format: NegotiatedFormat,
    pub frames_read: u64,
    pub ring_buffers: Option<usize>,
    pub frames_captured: Option<u64>,
    pub queue_depth: Option<usize>,
    pub frames_enqueued: Option<u64>,
    pub frames_evicted: Option<u64>,
    pub healthy: bool,
}

impl SessionStats {
    fn with_ring(mut self, stats: RingStats) -> Self {
        self.ring_buffers = Some(stats.buffers);
        self.frames_captured = Some(stats.frames_captured);
        self
    }

    fn with_queue(mut self, stats: QueueStats) -> Self {
        self.queue_depth = Some(stats.depth);
        self.frames_enqueued = Some(stats.frames_enqueued);
        self.frames_evicted = Some(stats.frames_evicted);
        self
    }
}

/// One open device. Single consumer: reads must not run concurrently.
pub struct CaptureSession {
    device: DevicePath,
    backend: CaptureBackend,
    state: SessionState,
    config: SessionConfig,
    frames_read: u64,
}

impl fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureSession")
            .field("device", &self.device.path)
            .field("backend", &self.backend)
            .field("state", &self.state)
            .field("frames_read", &self.frames_read)
            .finish()
    }
}

impl CaptureSession {
    /// Open `device`, negotiate a format for `request`, and pick a backend.
    pub fn open(
        device: &DevicePath,
        request: &FormatRequest,
        config: SessionConfig,
    ) -> Result<Self> {
        let backend = open_backend(device, request, &config)?;
        log::info!(
            "CaptureSession: opened {} with {:?} ({})",
            device,
            backend,
            backend.format()
        );
        Ok(Self::with_backend(device.clone(), backend, config))
    }

    /// Open a path string, inferring the device kind.
    pub fn open_path(path: &str, request: &FormatRequest) -> Result<Self> {
        Self::open(&DevicePath::parse(path), request, SessionConfig::default())
    }

    /// Wrap an already opened backend.
    pub fn with_backend(
        device: DevicePath,
        backend: CaptureBackend,
        config: SessionConfig,
    ) -> Self {
        Self {
            device,
            backend,
            state: SessionState::Idle,
            config,
            frames_read: 0,
        }
    }

    pub fn start_capture(&mut self) -> Result<()> {
        if self.state == SessionState::Capturing {
            return Ok(());
        }
        self.backend.start()?;
        self.state = SessionState::Capturing;
        Ok(())
    }

    pub fn stop_capture(&mut self) -> Result<()> {
        if self.state == SessionState::Idle {
            return Ok(());
        }
        self.backend.stop()?;
        self.state = SessionState::Idle;
        Ok(())
    }

    /// Non-blocking read. "No frame yet" and end of stream are statuses.
    pub fn try_read_frame(&mut self) -> Result<ReadStatus> {
        if self.state == SessionState::Idle {
            return Err(CaptureError::NotCapturing);
        }
        let status = self.backend.try_read()?;
        if matches!(status, ReadStatus::Frame(_)) {
            self.frames_read += 1;
        }
        Ok(status)
    }

    /// Block until a frame arrives. Fails with [`CaptureError::EndOfStream`]
    /// once the producer has finished.
    pub fn read_frame(&mut self) -> Result<Frame> {
        loop {
            match self.try_read_frame()? {
                ReadStatus::Frame(frame) => {
                    std::thread::sleep(self.config.read_quantum);
                    return Ok(frame);
                }
                ReadStatus::NoFrameYet => std::thread::sleep(self.config.read_quantum),
                ReadStatus::EndOfStream => return Err(CaptureError::EndOfStream),
            }
        }
    }

    pub fn format(&self) -> &NegotiatedFormat {
        self.backend.format()
    }

    pub fn device(&self) -> &DevicePath {
        &self.device
    }

    pub fn backend(&self) -> &CaptureBackend {
        &self.backend
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_capturing(&self) -> bool {
        self.state == SessionState::Capturing
    }

    pub fn is_healthy(&self) -> bool {
        self.backend.is_healthy()
    }

    pub fn stats(&self) -> SessionStats {
        let stats = SessionStats {
            device: self.device.path.clone(),
            state: self.state,
            format: self.format().clone(),
            frames_read: self.frames_read,
            ring_buffers: None,
            frames_captured: None,
            queue_depth: None,
            frames_enqueued: None,
            frames_evicted: None,
            healthy: self.is_healthy(),
        };
        match &self.backend {
            CaptureBackend::Ring(ring) => stats.with_ring(ring.stats()),
            CaptureBackend::Queue(queue) => stats.with_queue(queue.queue_stats()),
        }
    }

    /// Stop capturing and release the device.
    pub fn close(self) -> Result<()> {
        let device = self.device.path.clone();
        self.backend.close()?;
        log::info!("CaptureSession: closed {}", device);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
