//! Callback-driven capture backend.
//!
//! Some capture frameworks do not expose a pollable descriptor. They push
//! frames into a callback on a thread of their choosing. This backend gives
//! such a framework a [`FrameSink`] and reads frames back out of the
//! [`FrameQueue`] behind it.
//!
//! Two producer flavours exist:
//! - media framework: the callback receives pixels, dimensions and a
//!   pixel-format tag for each sample
//! - capture graph: the callback receives a sample time and a buffer laid
//!   out in the negotiated format (display, window and legacy camera capture)
//!
//! The only contract with either is "call the sink synchronously from within
//! the callback".

use std::sync::Arc;

use super::ReadStatus;
use crate::error::{CaptureError, Result};
use crate::format::{CapabilitySource, FormatNegotiator, FormatRequest, NegotiatedFormat};
use crate::queue::{FrameQueue, FrameSink, QueuePoll, QueueStats};

/// Default number of frames retained between consumer reads.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameSource {
    MediaFramework,
    CaptureGraph,
}

/// An external capture framework that delivers frames through a callback.
pub trait FrameProducer: CapabilitySource + Send {
    fn source(&self) -> FrameSource;

    /// Start the framework session. Every delivered frame goes to `sink`.
    fn start(&mut self, sink: FrameSink) -> Result<()>;

    /// Stop the framework session. No delivery may happen after this returns.
    fn stop(&mut self) -> Result<()>;
}

pub struct QueueBackend {
    producer: Box<dyn FrameProducer>,
    device_name: String,
    queue: Arc<FrameQueue>,
    format: NegotiatedFormat,
    running: bool,
}

impl QueueBackend {
    pub fn open(
        mut producer: Box<dyn FrameProducer>,
        request: &FormatRequest,
        capacity: usize,
    ) -> Result<Self> {
        let device_name = producer.device_name();
        let queue = Arc::new(FrameQueue::new(capacity)?);
        let format = FormatNegotiator::negotiate(producer.as_mut(), request)?;
        log::info!(
            "QueueBackend: opened {} ({:?}, {}, queue capacity {})",
            device_name,
            producer.source(),
            format,
            capacity
        );
        Ok(Self {
            producer,
            device_name,
            queue,
            format,
            running: false,
        })
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }
        self.queue.reset();
        let sink = FrameSink::new(Arc::clone(&self.queue), self.format.clone());
        self.producer
            .start(sink)
            .map_err(|err| CaptureError::StreamStart(format!("{}: {}", self.device_name, err)))?;
        self.running = true;
        log::info!("QueueBackend: capture started on {}", self.device_name);
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        self.producer
            .stop()
            .map_err(|err| CaptureError::StreamStop(format!("{}: {}", self.device_name, err)))?;
        self.running = false;
        log::info!("QueueBackend: capture stopped on {}", self.device_name);
        Ok(())
    }

    pub fn try_read(&mut self) -> Result<ReadStatus> {
        if !self.running {
            return Err(CaptureError::NotCapturing);
        }
        Ok(match self.queue.poll() {
            QueuePoll::Frame(frame) => ReadStatus::Frame(frame),
            QueuePoll::Empty => ReadStatus::NoFrameYet,
            QueuePoll::Closed => ReadStatus::EndOfStream,
        })
    }

    pub fn source(&self) -> FrameSource {
        self.producer.source()
    }

    pub fn format(&self) -> &NegotiatedFormat {
        &self.format
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Frames currently holding queue storage.
    pub fn retained_frames(&self) -> usize {
        self.queue.allocated_slots()
    }

    pub fn close(mut self) -> Result<()> {
        let result = self.stop();
        self.queue.reset();
        result
    }
}

impl Drop for QueueBackend {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::warn!("QueueBackend: stop on drop failed for {}: {}", self.device_name, err);
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Resolution;
    use crate::frame::PixelFormat;
    use crate::ingest::synthetic::{ResourceCounter, SyntheticProducer};
    use std::time::{Duration, Instant};

    fn read_until_frame(backend: &mut QueueBackend) -> Result<crate::frame::Frame> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match backend.try_read()? {
                ReadStatus::Frame(frame) => return Ok(frame),
                ReadStatus::NoFrameYet if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(1))
                }
                other => panic!("unexpected status {:?}", other),
            }
        }
    }

    #[test]
    fn capture_graph_frames_flow_through_queue() -> Result<()> {
        let producer = SyntheticProducer::display("stub://display");
        let mut backend = QueueBackend::open(Box::new(producer), &FormatRequest::default(), 4)?;
        assert_eq!(backend.source(), FrameSource::CaptureGraph);
        backend.start()?;

        let frame = read_until_frame(&mut backend)?;
        assert_eq!(frame.format, PixelFormat::Bgra);
        assert_eq!(
            Resolution::new(frame.width, frame.height),
            backend.format().resolution
        );
        assert_eq!(Some(frame.len()), frame.expected_len());
        backend.close()
    }

    #[test]
    fn finished_producer_reports_end_of_stream() -> Result<()> {
        let producer = SyntheticProducer::display("stub://display").with_frame_limit(2);
        let mut backend = QueueBackend::open(Box::new(producer), &FormatRequest::default(), 4)?;
        backend.start()?;

        let mut frames = 0;
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match backend.try_read()? {
                ReadStatus::Frame(_) => frames += 1,
                ReadStatus::NoFrameYet => {
                    assert!(Instant::now() < deadline, "stream never ended");
                    std::thread::sleep(Duration::from_millis(1));
                }
                ReadStatus::EndOfStream => break,
            }
        }
        assert_eq!(frames, 2);
        Ok(())
    }

    #[test]
    fn stop_joins_producer_and_start_stop_are_idempotent() -> Result<()> {
        let counter = ResourceCounter::default();
        let producer = SyntheticProducer::display("stub://display").with_counter(&counter);
        let mut backend = QueueBackend::open(Box::new(producer), &FormatRequest::default(), 2)?;

        backend.start()?;
        backend.start()?;
        assert_eq!(counter.producers(), 1);

        backend.stop()?;
        backend.stop()?;
        assert_eq!(counter.producers(), 0);
        assert!(matches!(backend.try_read(), Err(CaptureError::NotCapturing)));
        Ok(())
    }
}
