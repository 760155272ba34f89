//! Synthetic devices for `stub://` paths and tests.
//!
//! - `SimulatedRingDevice` plays the kernel side of the buffer-ring
//!   protocol: it owns the buffer memory, fills a buffer when it is
//!   dequeued, and only ever writes to buffers it currently owns.
//! - `SyntheticProducer` plays a callback-driven capture framework: it
//!   delivers frames into a `FrameSink` from its own thread.
//!
//! Both report to a shared `ResourceCounter` so tests can assert that no
//! mapping, queued buffer or producer thread outlives its session.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::callback::{FrameProducer, FrameSource};
use super::ring::{BufferLocation, DequeuedSlot, MappedRegion, Readiness, RingDevice};
use crate::error::{CaptureError, Result};
use crate::format::{
    CapabilitySource, FormatDescriptor, FrameRate, NegotiatedFormat, Resolution, SizeDescriptor,
};
use crate::frame::PixelFormat;
use crate::queue::FrameSink;

pub const STUB_SCHEME: &str = "stub://";

// ----------------------------------------------------------------------------
// Resource counting
// ----------------------------------------------------------------------------

#[derive(Default)]
struct Counts {
    mapped: AtomicUsize,
    queued: AtomicUsize,
    stream_ons: AtomicUsize,
    stream_offs: AtomicUsize,
    producers: AtomicUsize,
    streaming: AtomicBool,
    released: AtomicBool,
}

/// Shared tallies of resources held by synthetic devices.
#[derive(Clone, Default)]
pub struct ResourceCounter {
    counts: Arc<Counts>,
}

impl ResourceCounter {
    /// Regions currently mapped.
    pub fn mapped(&self) -> usize {
        self.counts.mapped.load(Ordering::SeqCst)
    }

    /// Buffers currently owned by the (simulated) kernel.
    pub fn queued(&self) -> usize {
        self.counts.queued.load(Ordering::SeqCst)
    }

    pub fn stream_ons(&self) -> usize {
        self.counts.stream_ons.load(Ordering::SeqCst)
    }

    pub fn stream_offs(&self) -> usize {
        self.counts.stream_offs.load(Ordering::SeqCst)
    }

    pub fn streaming(&self) -> bool {
        self.counts.streaming.load(Ordering::SeqCst)
    }

    /// Whether the kernel-side buffers were released.
    pub fn released(&self) -> bool {
        self.counts.released.load(Ordering::SeqCst)
    }

    /// Producer threads currently running.
    pub fn producers(&self) -> usize {
        self.counts.producers.load(Ordering::SeqCst)
    }

    /// True when nothing is mapped, queued, streaming or producing.
    pub fn is_idle(&self) -> bool {
        self.mapped() == 0 && self.queued() == 0 && !self.streaming() && self.producers() == 0
    }
}

// ----------------------------------------------------------------------------
// stub:// options
// ----------------------------------------------------------------------------

/// Options parsed from a `stub://name?key=value&...` path.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StubOptions {
    pub name: String,
    /// End the stream after this many frames.
    pub frames: Option<u64>,
    pub fps: Option<u32>,
    /// `media` routes a stub camera through the callback backend.
    pub source: Option<String>,
}

impl StubOptions {
    pub fn parse(path: &str) -> Option<Self> {
        let rest = path.strip_prefix(STUB_SCHEME)?;
        let (name, query) = rest.split_once('?').unwrap_or((rest, ""));
        let mut options = StubOptions {
            name: name.to_string(),
            ..StubOptions::default()
        };
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "frames" => options.frames = value.parse().ok(),
                "fps" => options.fps = value.parse().ok(),
                "source" => options.source = Some(value.to_string()),
                other => log::warn!("stub: ignoring unknown option '{}' in {}", other, path),
            }
        }
        Some(options)
    }

    pub fn is_stub(path: &str) -> bool {
        path.starts_with(STUB_SCHEME)
    }
}

fn frame_period(rate: Option<FrameRate>) -> Duration {
    rate.and_then(|r| r.as_hz())
        .map(|hz| Duration::from_secs_f64(1.0 / hz))
        .unwrap_or(Duration::from_millis(33))
}

fn fill_pattern(bytes: &mut [u8], frame_number: u64) {
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = ((i as u64).wrapping_add(frame_number) % 251) as u8;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------------
// SimulatedRingDevice
// ----------------------------------------------------------------------------

struct SimulatedRegion {
    memory: Arc<Mutex<Vec<u8>>>,
    counter: ResourceCounter,
}

impl MappedRegion for SimulatedRegion {
    fn len(&self) -> usize {
        lock(&self.memory).len()
    }

    fn copy_to(&self, dst: &mut [u8]) -> Result<()> {
        let memory = lock(&self.memory);
        let src = memory
            .get(..dst.len())
            .ok_or_else(|| CaptureError::protocol("copy", "read past end of mapped buffer"))?;
        dst.copy_from_slice(src);
        Ok(())
    }
}

impl Drop for SimulatedRegion {
    fn drop(&mut self) {
        self.counter.counts.mapped.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Kernel side of the buffer-ring protocol, simulated in memory.
pub struct SimulatedRingDevice {
    name: String,
    formats: Vec<FormatDescriptor>,
    current: Option<NegotiatedFormat>,
    applied: Option<NegotiatedFormat>,
    grant_limit: Option<u32>,
    buffers: Vec<Arc<Mutex<Vec<u8>>>>,
    queued: VecDeque<u32>,
    readiness: VecDeque<Readiness>,
    stalled: bool,
    refuse_stream: bool,
    streaming: bool,
    pace: Option<Duration>,
    next_frame_at: Option<Instant>,
    frames: u64,
    counter: ResourceCounter,
}

impl SimulatedRingDevice {
    /// A webcam offering YUYV 640x480 at 30/1 (current) and 1280x720 at
    /// 10/1, plus MJPEG 1920x1080.
    pub fn webcam(name: &str) -> Self {
        let formats = vec![
            FormatDescriptor {
                pixel_format: PixelFormat::Yuyv,
                sizes: vec![
                    SizeDescriptor {
                        resolution: Resolution::new(640, 480),
                        frame_rates: vec![FrameRate::new(30, 1), FrameRate::new(15, 1)],
                    },
                    SizeDescriptor {
                        resolution: Resolution::new(1280, 720),
                        frame_rates: vec![FrameRate::new(10, 1)],
                    },
                ],
            },
            FormatDescriptor {
                pixel_format: PixelFormat::Mjpeg,
                sizes: vec![SizeDescriptor {
                    resolution: Resolution::new(1920, 1080),
                    frame_rates: vec![FrameRate::new(30, 1)],
                }],
            },
        ];
        let current = NegotiatedFormat {
            resolution: Resolution::new(640, 480),
            pixel_format: PixelFormat::Yuyv,
            frame_rate: Some(FrameRate::new(30, 1)),
            origin: None,
        };
        Self::new(name, formats, Some(current))
    }

    pub fn new(
        name: &str,
        formats: Vec<FormatDescriptor>,
        current: Option<NegotiatedFormat>,
    ) -> Self {
        Self {
            name: name.to_string(),
            formats,
            current,
            applied: None,
            grant_limit: None,
            buffers: Vec::new(),
            queued: VecDeque::new(),
            readiness: VecDeque::new(),
            stalled: false,
            refuse_stream: false,
            streaming: false,
            pace: None,
            next_frame_at: None,
            frames: 0,
            counter: ResourceCounter::default(),
        }
    }

    /// Build the device for a `stub://` camera path.
    pub fn from_stub(options: &StubOptions) -> Self {
        let mut device = Self::webcam(&format!("{}{}", STUB_SCHEME, options.name)).paced();
        if let Some(fps) = options.fps {
            device.pace = Some(frame_period(Some(FrameRate::fps(fps.max(1)))));
        }
        device
    }

    pub fn with_counter(mut self, counter: &ResourceCounter) -> Self {
        self.counter = counter.clone();
        self
    }

    /// Grant at most `limit` buffers.
    pub fn granting(mut self, limit: u32) -> Self {
        self.grant_limit = Some(limit);
        self
    }

    /// Scripted readiness results, consumed before normal behaviour resumes.
    pub fn with_readiness(mut self, script: impl IntoIterator<Item = Readiness>) -> Self {
        self.readiness.extend(script);
        self
    }

    /// Never produce a buffer; every wait times out.
    pub fn stalled(mut self) -> Self {
        self.stalled = true;
        self
    }

    pub fn refusing_stream(mut self) -> Self {
        self.refuse_stream = true;
        self
    }

    /// Deliver buffers at the negotiated frame rate instead of immediately.
    pub fn paced(mut self) -> Self {
        self.pace = Some(frame_period(self.current.as_ref().and_then(|c| c.frame_rate)));
        self
    }

    fn buffer_len(&self) -> usize {
        self.applied
            .as_ref()
            .map(|f| {
                f.frame_size().unwrap_or(
                    // Compressed formats: worst case of one byte per pixel.
                    f.resolution.pixels() as usize,
                )
            })
            .unwrap_or(0)
    }
}

impl CapabilitySource for SimulatedRingDevice {
    fn device_name(&self) -> String {
        self.name.clone()
    }

    fn formats(&mut self) -> Result<Vec<FormatDescriptor>> {
        Ok(self.formats.clone())
    }

    fn current_format(&mut self) -> Result<Option<NegotiatedFormat>> {
        Ok(self.current.clone())
    }

    fn apply_format(&mut self, format: &NegotiatedFormat) -> Result<NegotiatedFormat> {
        let offered = self
            .formats
            .iter()
            .any(|f| f.pixel_format == format.pixel_format);
        let mut applied = format.clone();
        if !offered {
            // Like a driver, substitute rather than fail.
            if let Some(first) = self.formats.first() {
                applied.pixel_format = first.pixel_format;
            }
        }
        if self.pace.is_some() {
            self.pace = Some(frame_period(applied.frame_rate));
        }
        self.applied = Some(applied.clone());
        self.current = Some(applied.clone());
        Ok(applied)
    }
}

impl RingDevice for SimulatedRingDevice {
    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        if count == 0 {
            self.buffers.clear();
            return Ok(0);
        }
        let granted = self.grant_limit.map_or(count, |limit| count.min(limit));
        let len = self.buffer_len();
        self.buffers = (0..granted)
            .map(|_| Arc::new(Mutex::new(vec![0u8; len])))
            .collect();
        self.counter.counts.released.store(false, Ordering::SeqCst);
        Ok(granted)
    }

    fn query_buffer(&mut self, index: u32) -> Result<BufferLocation> {
        let buffer = self
            .buffers
            .get(index as usize)
            .ok_or_else(|| CaptureError::protocol("query", format!("no buffer {}", index)))?;
        let length = lock(buffer).len();
        Ok(BufferLocation {
            index,
            offset: index as u64 * length as u64,
            length,
        })
    }

    fn map_buffer(&mut self, location: BufferLocation) -> Result<Box<dyn MappedRegion>> {
        let memory = self
            .buffers
            .get(location.index as usize)
            .cloned()
            .ok_or_else(|| {
                CaptureError::protocol("map", format!("no buffer {}", location.index))
            })?;
        self.counter.counts.mapped.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimulatedRegion {
            memory,
            counter: self.counter.clone(),
        }))
    }

    fn queue_buffer(&mut self, index: u32) -> Result<()> {
        if index as usize >= self.buffers.len() {
            return Err(CaptureError::protocol("queue", format!("no buffer {}", index)));
        }
        if self.queued.contains(&index) {
            return Err(CaptureError::protocol(
                "queue",
                format!("buffer {} already queued", index),
            ));
        }
        self.queued.push_back(index);
        self.counter.counts.queued.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> Result<DequeuedSlot> {
        if !self.streaming {
            return Err(CaptureError::protocol("dequeue", "not streaming"));
        }
        let index = self
            .queued
            .pop_front()
            .ok_or_else(|| CaptureError::protocol("dequeue", "no buffer queued"))?;
        self.counter.counts.queued.fetch_sub(1, Ordering::SeqCst);

        // The "hardware" writes only into a buffer the kernel owns, right
        // before handing it over.
        self.frames += 1;
        let mut memory = lock(&self.buffers[index as usize]);
        fill_pattern(&mut memory, self.frames);
        Ok(DequeuedSlot {
            index,
            bytes_used: memory.len(),
        })
    }

    fn stream_on(&mut self) -> Result<()> {
        if self.refuse_stream {
            return Err(CaptureError::protocol("stream on", "device busy"));
        }
        self.streaming = true;
        self.next_frame_at = None;
        self.counter.counts.streaming.store(true, Ordering::SeqCst);
        self.counter.counts.stream_ons.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        self.streaming = false;
        let returned = self.queued.len();
        self.queued.clear();
        self.counter
            .counts
            .queued
            .fetch_sub(returned, Ordering::SeqCst);
        self.counter.counts.streaming.store(false, Ordering::SeqCst);
        self.counter.counts.stream_offs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn wait_ready(&mut self, timeout: Duration) -> Result<Readiness> {
        if let Some(scripted) = self.readiness.pop_front() {
            return Ok(scripted);
        }
        if self.stalled || !self.streaming || self.queued.is_empty() {
            return Ok(Readiness::TimedOut);
        }
        if let Some(period) = self.pace {
            let now = Instant::now();
            let due = self.next_frame_at.unwrap_or(now);
            let wait = due.saturating_duration_since(now);
            if wait > timeout {
                std::thread::sleep(timeout);
                return Ok(Readiness::TimedOut);
            }
            std::thread::sleep(wait);
            self.next_frame_at = Some(due.max(now) + period);
        }
        Ok(Readiness::Ready)
    }

    fn release_buffers(&mut self) -> Result<()> {
        self.buffers.clear();
        self.counter.counts.released.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// SyntheticProducer
// ----------------------------------------------------------------------------

struct ProducerWorker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Callback-driven capture framework, simulated with a delivery thread.
pub struct SyntheticProducer {
    name: String,
    source: FrameSource,
    formats: Vec<FormatDescriptor>,
    current: NegotiatedFormat,
    frame_limit: Option<u64>,
    worker: Option<ProducerWorker>,
    counter: ResourceCounter,
}

impl SyntheticProducer {
    /// A display-capture graph delivering 320x240 BGRA at 30/1.
    pub fn display(name: &str) -> Self {
        let current = NegotiatedFormat {
            resolution: Resolution::new(320, 240),
            pixel_format: PixelFormat::Bgra,
            frame_rate: Some(FrameRate::new(30, 1)),
            origin: None,
        };
        let formats = vec![FormatDescriptor {
            pixel_format: PixelFormat::Bgra,
            sizes: vec![SizeDescriptor {
                resolution: current.resolution,
                frame_rates: vec![FrameRate::new(30, 1)],
            }],
        }];
        Self {
            name: name.to_string(),
            source: FrameSource::CaptureGraph,
            formats,
            current,
            frame_limit: None,
            worker: None,
            counter: ResourceCounter::default(),
        }
    }

    /// A camera behind a media framework delivering 640x480 NV12 at 30/1.
    pub fn camera(name: &str) -> Self {
        let current = NegotiatedFormat {
            resolution: Resolution::new(640, 480),
            pixel_format: PixelFormat::Nv12,
            frame_rate: Some(FrameRate::new(30, 1)),
            origin: None,
        };
        let formats = vec![FormatDescriptor {
            pixel_format: PixelFormat::Nv12,
            sizes: vec![SizeDescriptor {
                resolution: current.resolution,
                frame_rates: vec![FrameRate::new(30, 1)],
            }],
        }];
        Self {
            name: name.to_string(),
            source: FrameSource::MediaFramework,
            formats,
            current,
            frame_limit: None,
            worker: None,
            counter: ResourceCounter::default(),
        }
    }

    /// Build the producer for a `stub://` display, window or media-framework path.
    pub fn from_stub(options: &StubOptions, source: FrameSource) -> Self {
        let name = format!("{}{}", STUB_SCHEME, options.name);
        let mut producer = match source {
            FrameSource::CaptureGraph => Self::display(&name),
            FrameSource::MediaFramework => Self::camera(&name),
        };
        if let Some(fps) = options.fps {
            let rate = FrameRate::fps(fps.max(1));
            producer.current.frame_rate = Some(rate);
            for format in producer.formats.iter_mut() {
                for size in format.sizes.iter_mut() {
                    size.frame_rates = vec![rate];
                }
            }
        }
        producer.frame_limit = options.frames;
        producer
    }

    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.frame_limit = Some(frames);
        self
    }

    pub fn with_counter(mut self, counter: &ResourceCounter) -> Self {
        self.counter = counter.clone();
        self
    }
}

impl CapabilitySource for SyntheticProducer {
    fn device_name(&self) -> String {
        self.name.clone()
    }

    fn formats(&mut self) -> Result<Vec<FormatDescriptor>> {
        Ok(self.formats.clone())
    }

    fn current_format(&mut self) -> Result<Option<NegotiatedFormat>> {
        Ok(Some(self.current.clone()))
    }

    fn apply_format(&mut self, format: &NegotiatedFormat) -> Result<NegotiatedFormat> {
        self.current = format.clone();
        Ok(format.clone())
    }
}

impl FrameProducer for SyntheticProducer {
    fn source(&self) -> FrameSource {
        self.source
    }

    fn start(&mut self, sink: FrameSink) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);
        let source = self.source;
        let limit = self.frame_limit;
        let format = sink.format().clone();
        let period = frame_period(format.frame_rate);
        let len = format
            .frame_size()
            .unwrap_or(format.resolution.pixels() as usize);
        let counter = self.counter.clone();
        counter.counts.producers.fetch_add(1, Ordering::SeqCst);

        let handle = std::thread::Builder::new()
            .name(format!("synthetic-producer:{}", self.name))
            .spawn(move || {
                let mut scratch = vec![0u8; len];
                let mut delivered = 0u64;
                while !stop_thread.load(Ordering::SeqCst) {
                    if limit.is_some_and(|limit| delivered >= limit) {
                        sink.finish();
                        break;
                    }
                    delivered += 1;
                    fill_pattern(&mut scratch, delivered);
                    match source {
                        FrameSource::MediaFramework => {
                            sink.deliver(
                                &scratch,
                                format.resolution.width,
                                format.resolution.height,
                                format.pixel_format,
                            );
                        }
                        FrameSource::CaptureGraph => {
                            let sample_time = delivered as f64 * period.as_secs_f64();
                            sink.deliver_buffer(sample_time, &scratch);
                        }
                    }
                    std::thread::sleep(period);
                }
                counter.counts.producers.fetch_sub(1, Ordering::SeqCst);
            });
        let handle = match handle {
            Ok(handle) => handle,
            Err(err) => {
                self.counter.counts.producers.fetch_sub(1, Ordering::SeqCst);
                return Err(CaptureError::StreamStart(format!("spawn producer: {}", err)));
            }
        };

        self.worker = Some(ProducerWorker { stop, handle });
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        worker.stop.store(true, Ordering::SeqCst);
        worker
            .handle
            .join()
            .map_err(|_| CaptureError::StreamStop("synthetic producer panicked".to_string()))
    }
}

impl Drop for SyntheticProducer {
    fn drop(&mut self) {
        let _ = FrameProducer::stop(self);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stub_options() {
        let options = StubOptions::parse("stub://desk?frames=5&fps=12&source=media").expect("stub");
        assert_eq!(options.name, "desk");
        assert_eq!(options.frames, Some(5));
        assert_eq!(options.fps, Some(12));
        assert_eq!(options.source.as_deref(), Some("media"));

        assert_eq!(StubOptions::parse("/dev/video0"), None);
        assert_eq!(
            StubOptions::parse("stub://plain"),
            Some(StubOptions {
                name: "plain".to_string(),
                ..StubOptions::default()
            })
        );
    }

    #[test]
    fn simulated_device_rejects_double_queue() -> Result<()> {
        let mut device = SimulatedRingDevice::webcam("stub://cam");
        let current = device.current_format()?.expect("current");
        device.apply_format(&current)?;
        assert_eq!(device.request_buffers(2)?, 2);
        device.queue_buffer(0)?;
        assert!(device.queue_buffer(0).is_err());
        assert!(device.queue_buffer(7).is_err());
        Ok(())
    }

    #[test]
    fn simulated_device_substitutes_unknown_format() -> Result<()> {
        let mut device = SimulatedRingDevice::webcam("stub://cam");
        let mut wanted = device.current_format()?.expect("current");
        wanted.pixel_format = PixelFormat::Rgb24;
        let applied = device.apply_format(&wanted)?;
        assert_eq!(applied.pixel_format, PixelFormat::Yuyv);
        Ok(())
    }

    #[test]
    fn producer_thread_exits_on_stop() -> Result<()> {
        let counter = ResourceCounter::default();
        let mut producer = SyntheticProducer::camera("stub://cam").with_counter(&counter);
        let queue = Arc::new(crate::queue::FrameQueue::new(2)?);
        let format = producer.current_format()?.expect("current");
        producer.start(FrameSink::new(Arc::clone(&queue), format))?;
        assert_eq!(counter.producers(), 1);
        FrameProducer::stop(&mut producer)?;
        assert_eq!(counter.producers(), 0);
        assert!(counter.is_idle());
        Ok(())
    }
}
