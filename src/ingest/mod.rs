//! Capture backends.
//!
//! Two strategies exist for getting frames out of a device:
//! - `ring`: a kernel-managed ring of memory-mapped buffers, polled with a
//!   bounded wait (V4L2 cameras, feature: v4l2)
//! - `callback`: an external framework pushes frames into a bounded queue
//!   from its own thread (media frameworks and capture graphs, feature:
//!   gstreamer)
//!
//! `synthetic` provides `stub://` devices for both strategies so the whole
//! pipeline runs without hardware.
//!
//! Backends MUST NOT:
//! - Let a returned frame alias device memory
//! - Touch a ring buffer while the kernel owns it
//! - Retain more frames than the queue capacity

pub mod callback;
#[cfg(feature = "gstreamer")]
pub mod gstreamer;
pub mod ring;
pub mod synthetic;
#[cfg(all(feature = "v4l2", target_os = "linux"))]
pub mod v4l2;

pub use callback::{FrameProducer, FrameSource, QueueBackend};
pub use ring::{BufferRing, RingConfig, RingDevice};
pub use synthetic::{ResourceCounter, SimulatedRingDevice, StubOptions, SyntheticProducer};
#[cfg(all(feature = "v4l2", target_os = "linux"))]
pub use v4l2::V4l2Device;

use crate::frame::Frame;

/// Outcome of a non-blocking read.
#[derive(Debug)]
pub enum ReadStatus {
    Frame(Frame),
    /// Nothing ready yet; retry later.
    NoFrameYet,
    /// The producer finished and every retained frame was consumed.
    EndOfStream,
}

impl ReadStatus {
    pub fn into_frame(self) -> Option<Frame> {
        match self {
            ReadStatus::Frame(frame) => Some(frame),
            ReadStatus::NoFrameYet | ReadStatus::EndOfStream => None,
        }
    }
}
