//! Lock-free single-producer / single-consumer trigger ring
//!
//! Slots hold click timestamps (nanoseconds since the ring was created).
//! The capture loop is the only producer and the playback thread the only
//! consumer; `push` never blocks and drops the new trigger when full.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::thread::Thread;
use std::time::{Duration, Instant};

pub struct TriggerRing {
    slots: Box<[AtomicU64]>,
    /// Next slot to read, written by the consumer only
    head: AtomicUsize,
    /// Next slot to write, written by the producer only
    tail: AtomicUsize,
    epoch: Instant,
    consumer: OnceLock<Thread>,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl TriggerRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| AtomicU64::new(0)).collect(),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            epoch: Instant::now(),
            consumer: OnceLock::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Triggers rejected because the ring was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Register the thread to unpark on push
    pub(crate) fn set_consumer(&self, thread: Thread) {
        let _ = self.consumer.set(thread);
    }

    /// Stop accepting triggers (audio disabled for the session)
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Enqueue a trigger stamped `at`. Returns false if the ring is full or
    /// closed. Producer side only.
    pub fn push(&self, at: Instant) -> bool {
        if self.is_closed() {
            return false;
        }

        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= self.slots.len() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let stamp = at.saturating_duration_since(self.epoch).as_nanos() as u64;
        self.slots[tail % self.slots.len()].store(stamp, Ordering::Relaxed);
        self.tail.store(tail.wrapping_add(1), Ordering::Release);

        if let Some(consumer) = self.consumer.get() {
            consumer.unpark();
        }
        true
    }

    /// Dequeue the oldest trigger. Consumer side only.
    pub fn pop(&self) -> Option<Instant> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }

        let stamp = self.slots[head % self.slots.len()].load(Ordering::Relaxed);
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(self.epoch + Duration::from_nanos(stamp))
    }
}
