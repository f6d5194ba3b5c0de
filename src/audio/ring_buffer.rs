// RingBuffer - bounded, mutex-protected circular store of fixed-size items
//
// Every bridge queue is one of these. An item is one engine period of
// interleaved samples; the buffer holds `capacity` item slots in a single
// contiguous allocation made at construction time.
//
// Policy:
// - enqueue never blocks and never fails; when full it overwrites the oldest
//   unread item (lossy under sustained backlog)
// - dequeue on an empty buffer copies nothing and reports `false`
// - all cursor/count mutations happen under one mutex per instance
//
// Waiting for data is not built in. The bridges layer condition variables on
// top (see audio::wait).

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Default number of item slots per queue
pub const DEFAULT_CAPACITY_ITEMS: usize = 100;

/// What an enqueue did to the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Stored,
    /// The buffer was full and the oldest unread item was replaced
    OverwroteOldest,
}

struct Slots<T> {
    data: Box<[T]>,
    /// Next slot to write, in items
    write: usize,
    /// Next slot to read, in items
    read: usize,
    count: usize,
    overwritten: u64,
}

/// Fixed-item ring buffer shared between one producer and one consumer thread
pub struct RingBuffer<T> {
    item_len: usize,
    capacity: usize,
    slots: Mutex<Slots<T>>,
}

impl<T: Copy + Default> RingBuffer<T> {
    /// Create a ring buffer of `capacity` items, each `item_len` samples long
    pub fn new(capacity: usize, item_len: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            item_len,
            capacity,
            slots: Mutex::new(Slots {
                data: vec![T::default(); capacity * item_len].into_boxed_slice(),
                write: 0,
                read: 0,
                count: 0,
                overwritten: 0,
            }),
        }
    }

    pub fn item_len(&self) -> usize {
        self.item_len
    }

    /// Capacity in items
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy one item in. A short `item` is zero-padded, a long one truncated.
    pub fn enqueue(&self, item: &[T]) -> Enqueued {
        let mut slots = self.lock();
        let item_len = self.item_len;
        let start = slots.write * item_len;
        let slot = &mut slots.data[start..start + item_len];
        let copied = item.len().min(item_len);
        slot[..copied].copy_from_slice(&item[..copied]);
        slot[copied..].fill(T::default());

        slots.write = (slots.write + 1) % self.capacity;
        if slots.count == self.capacity {
            // Oldest unread slot was just overwritten; keep the read cursor on
            // the oldest surviving item.
            slots.read = (slots.read + 1) % self.capacity;
            slots.overwritten += 1;
            Enqueued::OverwroteOldest
        } else {
            slots.count += 1;
            Enqueued::Stored
        }
    }

    /// Copy the oldest item into `out`. Returns `false` and leaves `out`
    /// untouched when the buffer is empty.
    pub fn dequeue(&self, out: &mut [T]) -> bool {
        let mut slots = self.lock();
        if slots.count == 0 {
            return false;
        }
        let start = slots.read * self.item_len;
        let copied = out.len().min(self.item_len);
        out[..copied].copy_from_slice(&slots.data[start..start + copied]);
        out[copied..].fill(T::default());
        slots.read = (slots.read + 1) % self.capacity;
        slots.count -= 1;
        true
    }

    /// Drop the oldest item without copying it out
    pub fn discard(&self) -> bool {
        let mut slots = self.lock();
        if slots.count == 0 {
            return false;
        }
        slots.read = (slots.read + 1) % self.capacity;
        slots.count -= 1;
        true
    }

    /// Drop oldest items until at most `keep` remain. Returns how many were dropped.
    pub fn drain_to(&self, keep: usize) -> usize {
        let mut slots = self.lock();
        let excess = slots.count.saturating_sub(keep);
        slots.read = (slots.read + excess) % self.capacity;
        slots.count -= excess;
        excess
    }

    /// Drop every queued item. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        self.drain_to(0)
    }

    /// Current number of queued items
    pub fn count(&self) -> usize {
        self.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Total items lost to overwrite since construction
    pub fn overwritten(&self) -> u64 {
        self.lock().overwritten
    }

    fn lock(&self) -> MutexGuard<'_, Slots<T>> {
        // Slot state stays consistent even if a holder panicked mid-copy.
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(value: f32, len: usize) -> Vec<f32> {
        vec![value; len]
    }

    #[test]
    fn test_fifo_order_and_count() {
        let ring = RingBuffer::new(8, 4);
        for i in 0..5 {
            assert_eq!(ring.enqueue(&item(i as f32, 4)), Enqueued::Stored);
        }
        assert_eq!(ring.count(), 5);

        let mut out = vec![0.0; 4];
        for i in 0..3 {
            assert!(ring.dequeue(&mut out));
            assert_eq!(out, item(i as f32, 4));
        }
        assert_eq!(ring.count(), 2);
    }

    #[test]
    fn test_interleaved_enqueue_dequeue_wraps() {
        let ring = RingBuffer::new(3, 2);
        let mut out = vec![0.0; 2];
        let mut expected = 0.0;
        for i in 0..20 {
            ring.enqueue(&item(i as f32, 2));
            if i % 2 == 1 {
                assert!(ring.dequeue(&mut out));
                assert_eq!(out[0], expected);
                expected += 1.0;
                assert!(ring.dequeue(&mut out));
                assert_eq!(out[0], expected);
                expected += 1.0;
            }
            assert!(ring.count() <= ring.capacity());
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn test_overwrite_replaces_oldest_only() {
        let ring = RingBuffer::new(3, 1);
        ring.enqueue(&[1.0]);
        ring.enqueue(&[2.0]);
        ring.enqueue(&[3.0]);
        assert_eq!(ring.enqueue(&[4.0]), Enqueued::OverwroteOldest);
        assert_eq!(ring.enqueue(&[5.0]), Enqueued::OverwroteOldest);

        assert_eq!(ring.count(), 3);
        assert_eq!(ring.overwritten(), 2);

        let mut out = [0.0];
        let mut seen = Vec::new();
        while ring.dequeue(&mut out) {
            seen.push(out[0]);
        }
        assert_eq!(seen, vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_dequeue_empty_leaves_output_untouched() {
        let ring: RingBuffer<f32> = RingBuffer::new(4, 2);
        let mut out = [7.0, 7.0];
        assert!(!ring.dequeue(&mut out));
        assert_eq!(out, [7.0, 7.0]);
        assert!(!ring.discard());
    }

    #[test]
    fn test_drain_to_keeps_newest() {
        let ring = RingBuffer::new(10, 1);
        for i in 0..6 {
            ring.enqueue(&[i as f32]);
        }
        assert_eq!(ring.drain_to(2), 4);
        assert_eq!(ring.count(), 2);

        let mut out = [0.0];
        ring.dequeue(&mut out);
        assert_eq!(out[0], 4.0);
        assert_eq!(ring.drain_to(5), 0);
        assert_eq!(ring.clear(), 1);
    }

    #[test]
    fn test_round_trip_is_bit_identical() {
        let ring = RingBuffer::new(DEFAULT_CAPACITY_ITEMS, 8);
        let frames: Vec<Vec<f32>> = (0..DEFAULT_CAPACITY_ITEMS)
            .map(|n| (0..8).map(|s| (n * 8 + s) as f32 * 0.001 - 0.37).collect())
            .collect();
        for frame in &frames {
            ring.enqueue(frame);
        }

        let mut out = vec![0.0; 8];
        for frame in &frames {
            assert!(ring.dequeue(&mut out));
            let expected: Vec<u32> = frame.iter().map(|s| s.to_bits()).collect();
            let actual: Vec<u32> = out.iter().map(|s| s.to_bits()).collect();
            assert_eq!(actual, expected);
        }
    }

    #[test]
    fn test_short_item_is_zero_padded() {
        let ring = RingBuffer::new(2, 4);
        ring.enqueue(&[1.0, 2.0]);
        let mut out = [9.0; 4];
        ring.dequeue(&mut out);
        assert_eq!(out, [1.0, 2.0, 0.0, 0.0]);
    }

    #[test]
    fn test_concurrent_producer_consumer_preserves_order() {
        use std::sync::Arc;
        use std::thread;

        let ring = Arc::new(RingBuffer::new(1000, 1));
        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                for i in 0..500 {
                    ring.enqueue(&[i as f32]);
                }
            })
        };

        let mut received = Vec::new();
        let mut out = [0.0];
        while received.len() < 500 {
            if ring.dequeue(&mut out) {
                received.push(out[0] as usize);
            } else {
                thread::yield_now();
            }
        }
        producer.join().unwrap();

        assert!(received.windows(2).all(|w| w[0] + 1 == w[1]));
    }
}
