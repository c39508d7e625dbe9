use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;

/// Bounded FIFO outbound frame queue, one per viewer. The presenter side
/// never blocks on it: when full, the oldest queued frame is dropped to make
/// room, keeping recency over completeness. A frame occupies exactly one
/// slot and is never fragmented.
pub struct FrameQueue {
    capacity: usize,
    frames: Mutex<VecDeque<Bytes>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "frame queue capacity must be positive");
        Self {
            capacity,
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Non-blocking enqueue. Returns the number of frames dropped to make room.
    pub fn push(&self, frame: Bytes) -> u64 {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }
        let mut dropped = 0;
        {
            let mut frames = self.frames.lock();
            while frames.len() >= self.capacity {
                frames.pop_front();
                dropped += 1;
            }
            frames.push_back(frame);
        }
        if dropped > 0 {
            self.dropped.fetch_add(dropped, Ordering::Relaxed);
            metrics::counter!("relay_frames_dropped", dropped);
        }
        self.notify.notify_one();
        dropped
    }

    /// Awaits the next frame in enqueue order. Returns `None` once the queue
    /// is closed and drained.
    pub async fn pop(&self) -> Option<Bytes> {
        loop {
            if let Some(frame) = self.frames.lock().pop_front() {
                return Some(frame);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
