//! Memory-mapped capture buffer ring.
//!
//! This module drives a kernel capture device through a fixed ring of
//! buffers shared with the kernel:
//!
//! 1. open: negotiate the format, request N buffers, map each one
//! 2. start: queue every buffer with the kernel, enable streaming
//! 3. read: wait for readiness, dequeue, copy out, requeue
//! 4. stop: disable streaming
//! 5. close: unmap every buffer, release the device
//!
//! Each buffer is owned either by the kernel or by userspace, never both.
//! Ownership only moves through queue/dequeue. A dequeued buffer can only
//! go back to the kernel after its bytes were copied into a caller-owned
//! [`Frame`], so no caller ever holds a view the kernel may overwrite.
//!
//! The kernel side is abstracted behind [`RingDevice`] so the same protocol
//! runs against V4L2 and against the simulated devices used in tests.

use std::time::{Duration, Instant};

use crate::error::{CaptureError, Result};
use crate::format::{CapabilitySource, FormatNegotiator, FormatRequest, NegotiatedFormat};
use crate::frame::Frame;

/// Fewest buffers the ring can run with.
pub const MIN_RING_BUFFERS: u32 = 2;
/// Number of buffers requested by default.
pub const DEFAULT_RING_BUFFERS: u32 = 4;
/// Readiness wait after which the device is considered stalled.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct RingConfig {
    /// Buffers to request from the device.
    pub buffer_count: u32,
    /// Fewest granted buffers accepted before open fails.
    pub min_buffers: u32,
    pub poll_timeout: Duration,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            buffer_count: DEFAULT_RING_BUFFERS,
            min_buffers: MIN_RING_BUFFERS,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

// ----------------------------------------------------------------------------
// Kernel boundary
// ----------------------------------------------------------------------------

/// Where the kernel placed a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferLocation {
    pub index: u32,
    pub offset: u64,
    pub length: usize,
}

/// A buffer handed back by the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DequeuedSlot {
    pub index: u32,
    pub bytes_used: usize,
}

/// Result of waiting for buffer readiness.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    TimedOut,
    /// The wait was interrupted by a signal; retry later.
    Interrupted,
}

/// Process mapping of one kernel buffer. Dropping it unmaps the memory.
pub trait MappedRegion: Send {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the first `dst.len()` bytes of the region into `dst`.
    fn copy_to(&self, dst: &mut [u8]) -> Result<()>;
}

/// Buffer-ring operations of a kernel capture device.
pub trait RingDevice: CapabilitySource + Send {
    /// Ask for `count` buffers. Returns how many the device granted.
    fn request_buffers(&mut self, count: u32) -> Result<u32>;

    fn query_buffer(&mut self, index: u32) -> Result<BufferLocation>;

    fn map_buffer(&mut self, location: BufferLocation) -> Result<Box<dyn MappedRegion>>;

    /// Give a buffer to the kernel.
    fn queue_buffer(&mut self, index: u32) -> Result<()>;

    /// Take the next filled buffer from the kernel.
    fn dequeue_buffer(&mut self) -> Result<DequeuedSlot>;

    fn stream_on(&mut self) -> Result<()>;

    /// Disable streaming. The kernel gives up every queued buffer.
    fn stream_off(&mut self) -> Result<()>;

    fn wait_ready(&mut self, timeout: Duration) -> Result<Readiness>;

    /// Free the kernel-side buffers. Called after every region is unmapped.
    fn release_buffers(&mut self) -> Result<()>;
}

// ----------------------------------------------------------------------------
// BufferRing
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferOwner {
    Kernel,
    User,
}

struct MappedBuffer {
    index: u32,
    length: usize,
    region: Box<dyn MappedRegion>,
    owner: BufferOwner,
}

#[derive(Clone, Debug)]
pub struct RingStats {
    pub device: String,
    pub buffers: usize,
    pub frames_captured: u64,
    pub streaming: bool,
}

pub struct BufferRing {
    device: Box<dyn RingDevice>,
    device_name: String,
    format: NegotiatedFormat,
    buffers: Vec<MappedBuffer>,
    config: RingConfig,
    streaming: bool,
    released: bool,
    frames_captured: u64,
    last_frame_at: Option<Instant>,
    streaming_since: Option<Instant>,
    stalled: bool,
}

impl BufferRing {
    /// Negotiate a format, then request and map the buffer ring.
    pub fn open(
        mut device: Box<dyn RingDevice>,
        request: &FormatRequest,
        config: RingConfig,
    ) -> Result<Self> {
        let device_name = device.device_name();
        let format = FormatNegotiator::negotiate(device.as_mut(), request)?;

        let min_buffers = config.min_buffers.max(MIN_RING_BUFFERS);
        let granted = device.request_buffers(config.buffer_count)?;
        if granted < min_buffers {
            if let Err(err) = device.release_buffers() {
                log::warn!("BufferRing: releasing short ring on {}: {}", device_name, err);
            }
            return Err(CaptureError::device_open(
                &device_name,
                format!(
                    "device granted {} buffers, need at least {}",
                    granted, min_buffers
                ),
            ));
        }
        log::debug!(
            "BufferRing: {} granted {} of {} requested buffers",
            device_name,
            granted,
            config.buffer_count
        );

        let mut ring = Self {
            device,
            device_name,
            format,
            buffers: Vec::with_capacity(granted as usize),
            config,
            streaming: false,
            released: false,
            frames_captured: 0,
            last_frame_at: None,
            streaming_since: None,
            stalled: false,
        };
        for index in 0..granted {
            // On failure `ring` drops here and unmaps what was mapped so far.
            let location = ring.device.query_buffer(index)?;
            let region = ring.device.map_buffer(location)?;
            ring.buffers.push(MappedBuffer {
                index,
                length: location.length,
                region,
                owner: BufferOwner::User,
            });
        }

        log::info!(
            "BufferRing: opened {} ({}, {} buffers)",
            ring.device_name,
            ring.format,
            ring.buffers.len()
        );
        Ok(ring)
    }

    /// Queue every buffer with the kernel and enable streaming.
    pub fn start(&mut self) -> Result<()> {
        if self.streaming {
            return Ok(());
        }
        for buffer in self.buffers.iter_mut() {
            if buffer.owner == BufferOwner::User {
                self.device.queue_buffer(buffer.index)?;
                buffer.owner = BufferOwner::Kernel;
            }
        }
        self.device
            .stream_on()
            .map_err(|err| CaptureError::StreamStart(format!("{}: {}", self.device_name, err)))?;
        self.streaming = true;
        self.streaming_since = Some(Instant::now());
        self.stalled = false;
        log::info!("BufferRing: streaming on {}", self.device_name);
        Ok(())
    }

    /// Disable streaming. Buffers stay mapped until close.
    pub fn stop(&mut self) -> Result<()> {
        if !self.streaming {
            return Ok(());
        }
        self.device
            .stream_off()
            .map_err(|err| CaptureError::StreamStop(format!("{}: {}", self.device_name, err)))?;
        self.streaming = false;
        self.streaming_since = None;
        for buffer in self.buffers.iter_mut() {
            buffer.owner = BufferOwner::User;
        }
        log::info!("BufferRing: streaming off on {}", self.device_name);
        Ok(())
    }

    /// Wait (bounded) for a filled buffer and copy it into `frame`.
    ///
    /// Returns `Ok(false)` when the wait was interrupted and the caller
    /// should retry. A readiness timeout is fatal.
    pub fn try_read_into(&mut self, frame: &mut Frame) -> Result<bool> {
        if !self.streaming {
            return Err(CaptureError::NotCapturing);
        }
        self.reclaim_abandoned()?;

        match self.device.wait_ready(self.config.poll_timeout)? {
            Readiness::Ready => {}
            Readiness::Interrupted => return Ok(false),
            Readiness::TimedOut => {
                self.stalled = true;
                log::error!(
                    "BufferRing: {} produced no buffer within {:?}",
                    self.device_name,
                    self.config.poll_timeout
                );
                return Err(CaptureError::PollTimeout(self.config.poll_timeout));
            }
        }

        self.dequeue()?.copy_into(frame)?.requeue()?;
        Ok(true)
    }

    /// Non-blocking read returning a fresh frame, or `None` when the wait
    /// was interrupted.
    pub fn try_read_frame(&mut self) -> Result<Option<Frame>> {
        let mut frame = Frame::empty();
        Ok(self.try_read_into(&mut frame)?.then_some(frame))
    }

    /// Take the next filled buffer from the kernel.
    ///
    /// The returned guard only allows copying the bytes out; the buffer
    /// returns to the kernel through the copied state:
    ///
    /// ```compile_fail
    /// # fn demo(ring: &mut framegrab::ingest::ring::BufferRing) -> framegrab::Result<()> {
    /// let buffer = ring.dequeue()?;
    /// buffer.requeue()?; // no requeue before the bytes were copied out
    /// # Ok(())
    /// # }
    /// ```
    pub fn dequeue(&mut self) -> Result<DequeuedBuffer<'_>> {
        if !self.streaming {
            return Err(CaptureError::NotCapturing);
        }
        let slot = self.device.dequeue_buffer()?;
        let position = self.position(slot.index)?;
        let buffer = &mut self.buffers[position];
        if buffer.owner != BufferOwner::Kernel {
            return Err(CaptureError::protocol(
                "dequeue",
                format!("buffer {} was not queued", slot.index),
            ));
        }
        if slot.bytes_used > buffer.length {
            return Err(CaptureError::protocol(
                "dequeue",
                format!(
                    "buffer {} reports {} bytes used but is {} bytes long",
                    slot.index, slot.bytes_used, buffer.length
                ),
            ));
        }
        buffer.owner = BufferOwner::User;
        Ok(DequeuedBuffer {
            ring: self,
            position,
            bytes_used: slot.bytes_used,
        })
    }

    fn position(&self, index: u32) -> Result<usize> {
        self.buffers
            .iter()
            .position(|b| b.index == index)
            .ok_or_else(|| CaptureError::protocol("dequeue", format!("unknown buffer {}", index)))
    }

    /// Return buffers whose guard was dropped before requeueing.
    fn reclaim_abandoned(&mut self) -> Result<()> {
        for buffer in self.buffers.iter_mut() {
            if buffer.owner == BufferOwner::User {
                log::debug!("BufferRing: requeueing abandoned buffer {}", buffer.index);
                self.device.queue_buffer(buffer.index)?;
                buffer.owner = BufferOwner::Kernel;
            }
        }
        Ok(())
    }

    pub fn format(&self) -> &NegotiatedFormat {
        &self.format
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffer_len(&self, index: u32) -> Option<usize> {
        self.buffers
            .iter()
            .find(|b| b.index == index)
            .map(|b| b.length)
    }

    pub fn owner(&self, index: u32) -> Option<BufferOwner> {
        self.buffers
            .iter()
            .find(|b| b.index == index)
            .map(|b| b.owner)
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn is_healthy(&self) -> bool {
        if self.stalled {
            return false;
        }
        if !self.streaming {
            return true;
        }
        // Before the first frame, staleness counts from stream start.
        let Some(reference) = self.last_frame_at.or(self.streaming_since) else {
            return true;
        };
        reference.elapsed() <= self.health_grace()
    }

    fn health_grace(&self) -> Duration {
        let frame_period = self
            .format
            .frame_rate_hz()
            .map(|hz| Duration::from_secs_f64(6.0 / hz))
            .unwrap_or_default();
        frame_period.max(Duration::from_secs(2))
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            device: self.device_name.clone(),
            buffers: self.buffers.len(),
            frames_captured: self.frames_captured,
            streaming: self.streaming,
        }
    }

    /// Unmap every buffer and release the device.
    pub fn close(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        let stop_result = self.stop();
        // Dropping the regions unmaps them.
        self.buffers.clear();
        self.released = true;
        let release_result = self.device.release_buffers();
        log::debug!("BufferRing: closed {}", self.device_name);
        stop_result.and(release_result)
    }
}

impl Drop for BufferRing {
    fn drop(&mut self) {
        if let Err(err) = self.teardown() {
            log::warn!("BufferRing: teardown of {} failed: {}", self.device_name, err);
        }
    }
}

// ----------------------------------------------------------------------------
// Dequeued -> copied -> requeued
// ----------------------------------------------------------------------------

/// A buffer owned by userspace whose bytes have not been copied out yet.
#[must_use = "a dequeued buffer must be copied out and requeued"]
pub struct DequeuedBuffer<'r> {
    ring: &'r mut BufferRing,
    position: usize,
    bytes_used: usize,
}

impl<'r> DequeuedBuffer<'r> {
    pub fn index(&self) -> u32 {
        self.ring.buffers[self.position].index
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Copy the filled bytes into `frame`, reallocating its storage only
    /// when the byte count changed.
    pub fn copy_into(self, frame: &mut Frame) -> Result<CopiedBuffer<'r>> {
        let ring = self.ring;
        let buffer = &ring.buffers[self.position];
        buffer.region.copy_to(frame.buffer_for(self.bytes_used))?;

        ring.frames_captured += 1;
        ring.last_frame_at = Some(Instant::now());
        frame.width = ring.format.resolution.width;
        frame.height = ring.format.resolution.height;
        frame.format = ring.format.pixel_format;
        frame.sequence = ring.frames_captured;

        Ok(CopiedBuffer {
            ring,
            position: self.position,
        })
    }
}

/// A buffer whose bytes now live in a caller-owned frame.
#[must_use = "a copied buffer must be requeued"]
pub struct CopiedBuffer<'r> {
    ring: &'r mut BufferRing,
    position: usize,
}

impl CopiedBuffer<'_> {
    /// Hand the buffer back to the kernel.
    pub fn requeue(mut self) -> Result<()> {
        let buffer = &mut self.ring.buffers[self.position];
        self.ring.device.queue_buffer(buffer.index)?;
        buffer.owner = BufferOwner::Kernel;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{FrameRate, Resolution};
    use crate::frame::PixelFormat;
    use crate::ingest::synthetic::{ResourceCounter, SimulatedRingDevice};

    fn open_ring(device: SimulatedRingDevice) -> Result<BufferRing> {
        BufferRing::open(
            Box::new(device),
            &FormatRequest::default(),
            RingConfig::default(),
        )
    }

    #[test]
    fn open_negotiates_and_maps_ring() -> Result<()> {
        let counter = ResourceCounter::default();
        let ring = open_ring(SimulatedRingDevice::webcam("stub://cam").with_counter(&counter))?;

        assert_eq!(ring.format().resolution, Resolution::new(640, 480));
        assert_eq!(ring.format().pixel_format, PixelFormat::Yuyv);
        assert_eq!(ring.format().frame_rate, Some(FrameRate::new(30, 1)));
        assert_eq!(ring.buffer_count(), 4);
        assert_eq!(counter.mapped(), 4);
        assert_eq!(ring.owner(0), Some(BufferOwner::User));

        ring.close()?;
        assert_eq!(counter.mapped(), 0);
        assert!(counter.released());
        Ok(())
    }

    #[test]
    fn open_fails_when_too_few_buffers_granted() {
        let counter = ResourceCounter::default();
        let device = SimulatedRingDevice::webcam("stub://cam")
            .with_counter(&counter)
            .granting(1);
        let err = open_ring(device).err().expect("open must fail");
        assert!(matches!(err, CaptureError::DeviceOpen { .. }));
        assert_eq!(counter.mapped(), 0);
    }

    #[test]
    fn read_copies_then_requeues() -> Result<()> {
        let counter = ResourceCounter::default();
        let mut ring = open_ring(SimulatedRingDevice::webcam("stub://cam").with_counter(&counter))?;
        ring.start()?;
        assert_eq!(counter.queued(), 4);

        let mut frame = Frame::empty();
        assert!(ring.try_read_into(&mut frame)?);
        assert_eq!(frame.len(), 640 * 480 * 2);
        assert_eq!(Some(frame.len()), frame.expected_len());
        assert_eq!(frame.sequence, 1);
        // The buffer went straight back to the kernel.
        assert_eq!(counter.queued(), 4);
        for index in 0..4 {
            assert_eq!(ring.owner(index), Some(BufferOwner::Kernel));
        }

        ring.close()?;
        assert_eq!(counter.mapped(), 0);
        Ok(())
    }

    #[test]
    fn frames_do_not_alias_mapped_memory() -> Result<()> {
        let mut ring = open_ring(SimulatedRingDevice::webcam("stub://cam"))?;
        ring.start()?;

        let first = ring.try_read_frame()?.expect("frame");
        let snapshot = first.data().to_vec();
        // Cycle through the whole ring so the kernel rewrites every buffer.
        for _ in 0..8 {
            ring.try_read_frame()?;
        }
        assert_eq!(first.data(), snapshot.as_slice());
        Ok(())
    }

    #[test]
    fn refill_keeps_allocation_for_same_size() -> Result<()> {
        let mut ring = open_ring(SimulatedRingDevice::webcam("stub://cam"))?;
        ring.start()?;
        let mut frame = Frame::empty();
        ring.try_read_into(&mut frame)?;
        let ptr = frame.data().as_ptr();
        ring.try_read_into(&mut frame)?;
        assert_eq!(frame.data().as_ptr(), ptr);
        assert_eq!(frame.sequence, 2);
        Ok(())
    }

    #[test]
    fn poll_timeout_is_fatal() -> Result<()> {
        let device = SimulatedRingDevice::webcam("stub://cam").stalled();
        let mut ring = open_ring(device)?;
        ring.start()?;
        let mut frame = Frame::empty();
        let err = ring.try_read_into(&mut frame).unwrap_err();
        assert!(matches!(err, CaptureError::PollTimeout(t) if t == DEFAULT_POLL_TIMEOUT));
        assert!(!ring.is_healthy());
        Ok(())
    }

    #[test]
    fn interrupted_wait_means_no_frame_yet() -> Result<()> {
        let device = SimulatedRingDevice::webcam("stub://cam")
            .with_readiness([Readiness::Interrupted, Readiness::Ready]);
        let mut ring = open_ring(device)?;
        ring.start()?;
        assert!(ring.try_read_frame()?.is_none());
        assert!(ring.try_read_frame()?.is_some());
        Ok(())
    }

    #[test]
    fn configured_minimum_cannot_go_below_two() {
        let device = SimulatedRingDevice::webcam("stub://cam").granting(1);
        let config = RingConfig {
            buffer_count: 1,
            min_buffers: 1,
            ..RingConfig::default()
        };
        let err = BufferRing::open(Box::new(device), &FormatRequest::default(), config)
            .err()
            .expect("open must fail");
        assert!(matches!(err, CaptureError::DeviceOpen { .. }));
    }

    #[test]
    fn silent_stream_becomes_unhealthy() -> Result<()> {
        let mut ring = open_ring(SimulatedRingDevice::webcam("stub://cam"))?;
        ring.start()?;
        assert!(ring.try_read_frame()?.is_some());
        assert!(ring.is_healthy());

        // 30 fps: six periods is under the 2 s floor.
        let stale = Instant::now()
            .checked_sub(Duration::from_secs(3))
            .expect("instant");
        ring.last_frame_at = Some(stale);
        assert!(!ring.is_healthy());

        // No frame at all since streaming started.
        ring.last_frame_at = None;
        ring.streaming_since = Some(stale);
        assert!(!ring.is_healthy());

        ring.stop()?;
        assert!(ring.is_healthy());
        Ok(())
    }

    #[test]
    fn dequeue_requires_streaming() -> Result<()> {
        let mut ring = open_ring(SimulatedRingDevice::webcam("stub://cam"))?;
        assert!(matches!(ring.dequeue(), Err(CaptureError::NotCapturing)));
        Ok(())
    }

    #[test]
    fn read_requires_streaming() -> Result<()> {
        let mut ring = open_ring(SimulatedRingDevice::webcam("stub://cam"))?;
        assert!(matches!(
            ring.try_read_frame(),
            Err(CaptureError::NotCapturing)
        ));
        Ok(())
    }

    #[test]
    fn start_failure_is_stream_start_error() -> Result<()> {
        let mut ring = open_ring(SimulatedRingDevice::webcam("stub://cam").refusing_stream())?;
        assert!(matches!(ring.start(), Err(CaptureError::StreamStart(_))));
        Ok(())
    }

    #[test]
    fn start_and_stop_are_idempotent() -> Result<()> {
        let counter = ResourceCounter::default();
        let mut ring = open_ring(SimulatedRingDevice::webcam("stub://cam").with_counter(&counter))?;
        ring.start()?;
        ring.start()?;
        assert_eq!(counter.stream_ons(), 1);
        assert_eq!(counter.queued(), 4);

        ring.stop()?;
        ring.stop()?;
        assert_eq!(counter.stream_offs(), 1);
        assert_eq!(counter.queued(), 0);

        // Restart queues the ring again.
        ring.start()?;
        assert_eq!(counter.queued(), 4);
        assert!(ring.try_read_frame()?.is_some());
        Ok(())
    }

    #[test]
    fn abandoned_buffer_is_reclaimed() -> Result<()> {
        let counter = ResourceCounter::default();
        let mut ring = open_ring(SimulatedRingDevice::webcam("stub://cam").with_counter(&counter))?;
        ring.start()?;
        {
            let buffer = ring.dequeue()?;
            assert_eq!(buffer.bytes_used(), 640 * 480 * 2);
            // Dropped without copy or requeue.
        }
        assert_eq!(counter.queued(), 3);
        assert!(ring.try_read_frame()?.is_some());
        assert_eq!(counter.queued(), 4);
        Ok(())
    }

    #[test]
    fn drop_without_close_unmaps() -> Result<()> {
        let counter = ResourceCounter::default();
        {
            let mut ring =
                open_ring(SimulatedRingDevice::webcam("stub://cam").with_counter(&counter))?;
            ring.start()?;
            ring.try_read_frame()?;
        }
        assert_eq!(counter.mapped(), 0);
        assert!(counter.released());
        assert!(!counter.streaming());
        Ok(())
    }
}
