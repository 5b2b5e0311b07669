//! Lock-free single-producer/single-consumer frame ring.
//!
//! `capacity` frames are stored in `capacity + 1` slots so that full and
//! empty are distinguishable from the two indices alone:
//!
//! - empty  ⇔ `write == read`
//! - full   ⇔ `(write + 1) % (capacity + 1) == read`
//! - len    = `(write - read) mod (capacity + 1)`
//!
//! The producer publishes a frame's payload strictly before the release
//! store of its write index; the consumer acquires the write index before
//! touching payload. The symmetric protocol holds for the read index, which
//! is what lets the producer reuse a slot only after the consumer is done
//! with it.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::Frame;

struct Shared {
    slots: Box<[UnsafeCell<Option<Frame>>]>,
    write: AtomicUsize,
    read: AtomicUsize,
    capacity: usize,
}

// Slot payloads are only touched under the SPSC index protocol above: the
// producer writes a slot before publishing it, the consumer takes it before
// releasing it. The handles are not Clone, so there is exactly one of each.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    fn slot_count(&self) -> usize {
        self.capacity + 1
    }

    fn len(&self) -> usize {
        let write = self.write.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Acquire);
        (write + self.slot_count() - read) % self.slot_count()
    }
}

/// Creates a ring holding up to `capacity` frames and returns the two
/// endpoint handles.
pub fn frame_ring(capacity: usize) -> (RingProducer, RingConsumer) {
    assert!(capacity > 0, "frame ring capacity must be non-zero");
    let slots = (0..capacity + 1)
        .map(|_| UnsafeCell::new(None))
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let shared = Arc::new(Shared {
        slots,
        write: AtomicUsize::new(0),
        read: AtomicUsize::new(0),
        capacity,
    });
    (
        RingProducer {
            shared: Arc::clone(&shared),
        },
        RingConsumer { shared },
    )
}

/// Producer endpoint; exactly one exists per ring.
pub struct RingProducer {
    shared: Arc<Shared>,
}

impl RingProducer {
    /// Attempts to publish a frame. Returns the frame back when the ring is
    /// full, leaving the ring unchanged.
    pub fn try_push(&mut self, frame: Frame) -> Result<(), Frame> {
        let write = self.shared.write.load(Ordering::Relaxed);
        let next = (write + 1) % self.shared.slot_count();
        if next == self.shared.read.load(Ordering::Acquire) {
            return Err(frame);
        }
        // Payload store happens-before the index publication below.
        unsafe {
            *self.shared.slots[write].get() = Some(frame);
        }
        self.shared.write.store(next, Ordering::Release);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.shared.capacity
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

/// Consumer endpoint; exactly one exists per ring. Peeking is only offered
/// here because only the popper may observe the oldest slot.
pub struct RingConsumer {
    shared: Arc<Shared>,
}

impl RingConsumer {
    /// Removes and returns the oldest frame, or `None` when empty.
    pub fn try_pop(&mut self) -> Option<Frame> {
        let read = self.shared.read.load(Ordering::Relaxed);
        if read == self.shared.write.load(Ordering::Acquire) {
            return None;
        }
        let frame = unsafe { (*self.shared.slots[read].get()).take() };
        debug_assert!(frame.is_some(), "published slot was empty");
        self.shared
            .read
            .store((read + 1) % self.shared.slot_count(), Ordering::Release);
        frame
    }

    /// Non-destructive view of the oldest frame, used to inspect its PTS
    /// before deciding to emit or drop.
    pub fn peek(&self) -> Option<&Frame> {
        let read = self.shared.read.load(Ordering::Relaxed);
        if read == self.shared.write.load(Ordering::Acquire) {
            return None;
        }
        unsafe { (*self.shared.slots[read].get()).as_ref() }
    }

    /// Drains every buffered frame. Teardown-only: the producer must have
    /// stopped pushing.
    pub fn clear(&mut self) {
        while self.try_pop().is_some() {}
    }

    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Read-only depth/capacity handle for observers such as the
    /// orchestration tick.
    pub fn watch(&self) -> RingWatch {
        RingWatch {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Cloneable read-only view of ring occupancy.
#[derive(Clone)]
pub struct RingWatch {
    shared: Arc<Shared>,
}

impl RingWatch {
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_frame(pts_us: i64) -> Frame {
        Frame {
            pts_us,
            dts_us: pts_us,
            duration_s: 1.0 / 30.0,
            source_uri: Arc::from("test"),
            width: 4,
            height: 4,
            data: vec![pts_us as u8; Frame::yuv420_len(4, 4)],
        }
    }

    #[test]
    fn push_pop_is_fifo() {
        let (mut producer, mut consumer) = frame_ring(8);
        for pts in 0..5 {
            producer
                .try_push(test_frame(pts))
                .expect("push into non-full ring failed");
        }
        for pts in 0..5 {
            let frame = consumer.try_pop().expect("pop from non-empty ring failed");
            assert_eq!(frame.pts_us, pts);
        }
        assert!(consumer.try_pop().is_none());
    }

    #[test]
    fn full_push_returns_frame_and_leaves_state_unchanged() {
        let (mut producer, consumer) = frame_ring(2);
        producer.try_push(test_frame(0)).expect("push failed");
        producer.try_push(test_frame(1)).expect("push failed");
        assert!(producer.is_full());
        let rejected = producer
            .try_push(test_frame(2))
            .expect_err("push into full ring succeeded");
        assert_eq!(rejected.pts_us, 2);
        assert_eq!(consumer.len(), 2);
        assert_eq!(consumer.peek().expect("peek failed").pts_us, 0);
    }

    #[test]
    fn empty_pop_leaves_state_unchanged() {
        let (producer, mut consumer) = frame_ring(2);
        assert!(consumer.try_pop().is_none());
        assert!(consumer.peek().is_none());
        assert_eq!(producer.len(), 0);
    }

    #[test]
    fn occupancy_stays_within_bounds() {
        let (mut producer, mut consumer) = frame_ring(3);
        for round in 0..20 {
            let _ = producer.try_push(test_frame(round));
            assert!(consumer.len() <= consumer.capacity());
            if round % 2 == 0 {
                let _ = consumer.try_pop();
            }
        }
    }

    #[test]
    fn peek_does_not_consume() {
        let (mut producer, mut consumer) = frame_ring(4);
        producer.try_push(test_frame(42)).expect("push failed");
        assert_eq!(consumer.peek().expect("peek failed").pts_us, 42);
        assert_eq!(consumer.peek().expect("peek failed").pts_us, 42);
        assert_eq!(consumer.len(), 1);
        assert_eq!(consumer.try_pop().expect("pop failed").pts_us, 42);
    }

    #[test]
    fn clear_empties_the_ring() {
        let (mut producer, mut consumer) = frame_ring(4);
        for pts in 0..4 {
            producer.try_push(test_frame(pts)).expect("push failed");
        }
        consumer.clear();
        assert!(consumer.is_empty());
        producer.try_push(test_frame(9)).expect("push after clear failed");
        assert_eq!(consumer.try_pop().expect("pop failed").pts_us, 9);
    }

    #[test]
    fn watch_tracks_depth() {
        let (mut producer, consumer) = frame_ring(4);
        let watch = consumer.watch();
        assert_eq!(watch.len(), 0);
        producer.try_push(test_frame(0)).expect("push failed");
        assert_eq!(watch.len(), 1);
        assert_eq!(watch.capacity(), 4);
    }

    #[test]
    fn threaded_spsc_preserves_order_and_delivers_everything() {
        const TOTAL: i64 = 20_000;
        let (mut producer, mut consumer) = frame_ring(16);

        let pusher = std::thread::spawn(move || {
            let mut pending: Option<Frame> = None;
            let mut next = 0;
            while next < TOTAL || pending.is_some() {
                let frame = pending.take().unwrap_or_else(|| {
                    let f = test_frame(next);
                    next += 1;
                    f
                });
                if let Err(back) = producer.try_push(frame) {
                    pending = Some(back);
                    std::thread::yield_now();
                }
            }
        });

        let mut expected = 0;
        while expected < TOTAL {
            match consumer.try_pop() {
                Some(frame) => {
                    assert_eq!(frame.pts_us, expected, "frames popped out of order");
                    expected += 1;
                }
                None => std::thread::yield_now(),
            }
        }
        pusher.join().expect("failed to join producer thread");
        assert!(consumer.try_pop().is_none());
    }
}
