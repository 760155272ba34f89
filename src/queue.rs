//! Cross-thread bounded frame queue.
//!
//! Callback-driven capture frameworks deliver frames on a thread we do not
//! own and cannot block. `FrameQueue` sits between that producer and the
//! single consumer calling `try_read_frame`:
//!
//! - Fixed capacity, set at construction.
//! - Overwrite-oldest when full. The producer never waits.
//! - Copy in on enqueue, hand out an owned frame on dequeue. Nothing the
//!   producer passes in is referenced after `enqueue` returns.
//! - One mutex, held only for the duration of a single enqueue or dequeue.
//!
//! Frames keep their capture order; when the consumer falls behind, the
//! oldest retained frames are dropped first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{CaptureError, Result};
use crate::format::NegotiatedFormat;
use crate::frame::{Frame, PixelFormat};

struct QueueSlot {
    data: Vec<u8>,
    width: u32,
    height: u32,
    format: PixelFormat,
    sequence: u64,
}

struct QueueState {
    slots: Vec<Option<QueueSlot>>,
    head: usize,
    tail: usize,
    count: usize,
    closed: bool,
    next_sequence: u64,
    enqueued: u64,
    evicted: u64,
}

/// Outcome of a dequeue attempt.
#[derive(Debug)]
pub enum QueuePoll {
    Frame(Frame),
    Empty,
    /// The producer finished and every retained frame has been drained.
    Closed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub capacity: usize,
    pub depth: usize,
    pub frames_enqueued: u64,
    pub frames_evicted: u64,
}

pub struct FrameQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    warned_overflow: AtomicBool,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(CaptureError::InvalidConfig(
                "frame queue capacity must be at least 1".to_string(),
            ));
        }
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Ok(Self {
            capacity,
            state: Mutex::new(QueueState {
                slots,
                head: 0,
                tail: 0,
                count: 0,
                closed: false,
                next_sequence: 1,
                enqueued: 0,
                evicted: 0,
            }),
            warned_overflow: AtomicBool::new(false),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Every critical section leaves the indices consistent, so a panic
        // elsewhere while holding the lock does not corrupt the queue.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy a frame into the queue, evicting the oldest slot when full.
    ///
    /// Returns `true` when an eviction happened. Frames offered after
    /// [`FrameQueue::close`] are discarded.
    pub fn enqueue(&self, bytes: &[u8], width: u32, height: u32, format: PixelFormat) -> bool {
        let mut state = self.lock();
        if state.closed {
            log::debug!("FrameQueue: discarding frame delivered after close");
            return false;
        }

        let mut evicted = false;
        if state.count == self.capacity {
            let head = state.head;
            state.slots[head] = None;
            state.head = (head + 1) % self.capacity;
            state.count -= 1;
            state.evicted += 1;
            evicted = true;
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let tail = state.tail;
        state.slots[tail] = Some(QueueSlot {
            data: bytes.to_vec(),
            width,
            height,
            format,
            sequence,
        });
        state.tail = (tail + 1) % self.capacity;
        state.count += 1;
        state.enqueued += 1;
        drop(state);

        if evicted {
            if !self.warned_overflow.swap(true, Ordering::Relaxed) {
                log::warn!(
                    "FrameQueue: consumer is falling behind, dropping oldest frames (capacity {})",
                    self.capacity
                );
            } else {
                log::debug!("FrameQueue: evicted oldest frame");
            }
        }
        evicted
    }

    pub fn enqueue_frame(&self, frame: &Frame) -> bool {
        self.enqueue(frame.data(), frame.width, frame.height, frame.format)
    }

    /// Take the oldest retained frame, if any.
    pub fn try_dequeue(&self) -> Option<Frame> {
        match self.poll() {
            QueuePoll::Frame(frame) => Some(frame),
            QueuePoll::Empty | QueuePoll::Closed => None,
        }
    }

    /// Like [`FrameQueue::try_dequeue`], but distinguishes "empty for now"
    /// from "closed and drained".
    pub fn poll(&self) -> QueuePoll {
        let mut state = self.lock();
        if state.count == 0 {
            return if state.closed {
                QueuePoll::Closed
            } else {
                QueuePoll::Empty
            };
        }

        let head = state.head;
        let slot = state.slots[head].take();
        state.head = (head + 1) % self.capacity;
        state.count -= 1;
        drop(state);

        match slot {
            Some(slot) => QueuePoll::Frame(
                Frame::new(slot.width, slot.height, slot.format, slot.data)
                    .with_sequence(slot.sequence),
            ),
            // count > 0 guarantees the head slot is occupied.
            None => QueuePoll::Empty,
        }
    }

    /// Mark the producer as finished. Retained frames can still be drained.
    pub fn close(&self) {
        self.lock().closed = true;
    }

    /// Drop retained frames and accept new ones again.
    pub fn reset(&self) {
        let mut state = self.lock();
        for slot in state.slots.iter_mut() {
            *slot = None;
        }
        state.head = 0;
        state.tail = 0;
        state.count = 0;
        state.closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently holding frame storage.
    pub fn allocated_slots(&self) -> usize {
        self.lock().slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        QueueStats {
            capacity: self.capacity,
            depth: state.count,
            frames_enqueued: state.enqueued,
            frames_evicted: state.evicted,
        }
    }
}

// ----------------------------------------------------------------------------
// FrameSink: producer-side handle
// ----------------------------------------------------------------------------

/// Handle given to capture-framework callbacks. Cloneable and `Send`; each
/// call copies the delivered bytes into the queue before returning.
#[derive(Clone)]
pub struct FrameSink {
    queue: Arc<FrameQueue>,
    format: NegotiatedFormat,
}

impl FrameSink {
    pub fn new(queue: Arc<FrameQueue>, format: NegotiatedFormat) -> Self {
        Self { queue, format }
    }

    /// Media-framework delivery: raw pixels with their own dimensions and
    /// pixel-format tag.
    pub fn deliver(&self, bytes: &[u8], width: u32, height: u32, format: PixelFormat) -> bool {
        self.queue.enqueue(bytes, width, height, format)
    }

    /// Capture-graph delivery: a sample time and a buffer laid out in the
    /// negotiated format.
    pub fn deliver_buffer(&self, sample_time: f64, bytes: &[u8]) -> bool {
        if let Some(expected) = self.format.frame_size() {
            if bytes.len() != expected {
                log::debug!(
                    "FrameSink: buffer at {:.3}s has {} bytes, expected {}",
                    sample_time,
                    bytes.len(),
                    expected
                );
            }
        }
        self.queue.enqueue(
            bytes,
            self.format.resolution.width,
            self.format.resolution.height,
            self.format.pixel_format,
        )
    }

    /// Signal end of stream.
    pub fn finish(&self) {
        self.queue.close();
    }

    pub fn format(&self) -> &NegotiatedFormat {
        &self.format
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{FrameRate, Resolution};

    fn push(queue: &FrameQueue, tag: u8) -> bool {
        queue.enqueue(&[tag; 4], 2, 2, PixelFormat::Gray8)
    }

    fn tags(queue: &FrameQueue) -> Vec<u8> {
        std::iter::from_fn(|| queue.try_dequeue())
            .map(|frame| frame.data()[0])
            .collect()
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(FrameQueue::new(0).is_err());
    }

    #[test]
    fn overwrite_oldest_keeps_latest_frames_in_order() -> Result<()> {
        let queue = FrameQueue::new(2)?;
        assert!(!push(&queue, b'A'));
        assert!(!push(&queue, b'B'));
        assert!(push(&queue, b'C'), "third enqueue must evict");

        assert_eq!(queue.len(), 2);
        let first = queue.try_dequeue().map(|f| f.data()[0]);
        let second = queue.try_dequeue().map(|f| f.data()[0]);
        assert_eq!(first, Some(b'B'));
        assert_eq!(second, Some(b'C'));
        assert!(queue.try_dequeue().is_none());
        assert_eq!(queue.len(), 0);
        Ok(())
    }

    #[test]
    fn count_never_exceeds_capacity() -> Result<()> {
        for capacity in 1..=5usize {
            let queue = FrameQueue::new(capacity)?;
            for n in 0..(capacity as u8 * 3 + 1) {
                push(&queue, n);
                assert!(queue.len() <= capacity);
                assert_eq!(queue.allocated_slots(), queue.len());
            }
            let total = capacity as u8 * 3 + 1;
            let expected: Vec<u8> = (total - capacity as u8..total).collect();
            assert_eq!(tags(&queue), expected);
        }
        Ok(())
    }

    #[test]
    fn fifo_drain_leaves_queue_empty() -> Result<()> {
        let queue = FrameQueue::new(3)?;
        for tag in [1, 2, 3] {
            push(&queue, tag);
        }
        assert_eq!(tags(&queue), vec![1, 2, 3]);
        assert!(queue.is_empty());
        assert_eq!(queue.allocated_slots(), 0);
        assert!(matches!(queue.poll(), QueuePoll::Empty));
        Ok(())
    }

    #[test]
    fn sequences_follow_enqueue_order() -> Result<()> {
        let queue = FrameQueue::new(2)?;
        for tag in 0..5 {
            push(&queue, tag);
        }
        let sequences: Vec<u64> = std::iter::from_fn(|| queue.try_dequeue())
            .map(|f| f.sequence)
            .collect();
        assert_eq!(sequences, vec![4, 5]);
        Ok(())
    }

    #[test]
    fn close_drains_then_reports_closed() -> Result<()> {
        let queue = FrameQueue::new(2)?;
        push(&queue, 9);
        queue.close();
        assert!(!push(&queue, 10), "closed queue discards new frames");
        assert!(matches!(queue.poll(), QueuePoll::Frame(_)));
        assert!(matches!(queue.poll(), QueuePoll::Closed));

        queue.reset();
        assert!(!queue.is_closed());
        assert!(matches!(queue.poll(), QueuePoll::Empty));
        Ok(())
    }

    #[test]
    fn stats_track_evictions() -> Result<()> {
        let queue = FrameQueue::new(1)?;
        push(&queue, 1);
        push(&queue, 2);
        push(&queue, 3);
        let stats = queue.stats();
        assert_eq!(stats.frames_enqueued, 3);
        assert_eq!(stats.frames_evicted, 2);
        assert_eq!(stats.depth, 1);
        Ok(())
    }

    #[test]
    fn producer_thread_hands_off_copies() -> Result<()> {
        let queue = Arc::new(FrameQueue::new(64)?);
        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                for tag in 0..32u8 {
                    let scratch = vec![tag; 8];
                    queue.enqueue(&scratch, 4, 1, PixelFormat::Yuyv);
                    // The producer's buffer dies here; the queue holds its own copy.
                }
            })
        };
        producer.join().expect("producer thread");
        let received = tags(&queue);
        assert_eq!(received, (0..32u8).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn capture_graph_delivery_uses_negotiated_layout() -> Result<()> {
        let queue = Arc::new(FrameQueue::new(2)?);
        let sink = FrameSink::new(
            Arc::clone(&queue),
            NegotiatedFormat {
                resolution: Resolution::new(2, 1),
                pixel_format: PixelFormat::Bgra,
                frame_rate: Some(FrameRate::fps(30)),
                origin: None,
            },
        );
        sink.deliver_buffer(0.033, &[0u8; 8]);
        let frame = queue.try_dequeue().expect("frame");
        assert_eq!((frame.width, frame.height), (2, 1));
        assert_eq!(frame.format, PixelFormat::Bgra);
        assert_eq!(Some(frame.len()), frame.expected_len());

        sink.finish();
        assert!(queue.is_closed());
        Ok(())
    }
}
