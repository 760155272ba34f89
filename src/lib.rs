//! framegrab
//!
//! Live frame capture from cameras, displays and windows behind one
//! pull/push API.
//!
//! # Architecture
//!
//! The pipeline guarantees, by construction:
//!
//! 1. **No aliasing**: a returned `Frame` is a private copy. It never points
//!    into a kernel buffer or a queue slot.
//! 2. **Strict buffer ownership**: a ring buffer belongs to either the kernel
//!    or userspace, and only the ring protocol moves it between them.
//! 3. **Bounded retention**: the callback queue holds at most its capacity
//!    and evicts the oldest frame when full.
//! 4. **Quiet after pause**: no frame notification fires once
//!    `PlaybackController::pause` has returned.
//!
//! # Module Structure
//!
//! - `frame`, `format`: frame values, pixel formats, format negotiation
//! - `queue`: the bounded cross-thread frame queue
//! - `ingest`: buffer-ring and callback backends (V4L2, GStreamer, `stub://`)
//! - `session`: `CaptureSession` over either backend
//! - `playback`: background decode loop with frame notifications
//! - `device`: device identifiers, enumeration, hot-plug watching
//! - `config`: file + environment configuration

pub mod config;
pub mod device;
pub mod error;
pub mod format;
pub mod frame;
pub mod ingest;
pub mod playback;
pub mod queue;
pub mod session;

pub use device::{DeviceEnumerator, DeviceEvent, DeviceKind, DevicePath, DeviceWatcher};
pub use error::{CaptureError, Result};
pub use format::{
    FormatNegotiator, FormatRequest, FrameRate, NegotiatedFormat, Origin, Resolution,
};
pub use frame::{FourCc, Frame, PixelFormat};
pub use playback::{PlaybackConfig, PlaybackController, PlaybackEvent, PlaybackState};
pub use queue::{FrameQueue, FrameSink};
pub use session::{
    CaptureBackend, CaptureSession, ReadStatus, SessionConfig, SessionState, SessionStats,
};
