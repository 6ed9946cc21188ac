//! Thread-safe bounded queue for interleaved audio samples.
//!
//! The rest of the crate uses [`SharedAudio`] as the wire format between
//! stages: decode thread -> queue -> resample thread -> queue -> the CPAL
//! callback drains it without blocking. Shutdown is deterministic via
//! `close()` plus draining semantics, which keeps the real-time callback
//! simple.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

pub struct SharedAudio {
    channels: usize,
    inner: Mutex<SharedInner>,
    cv: Condvar,
    max_buffered_samples: usize,
}

struct SharedInner {
    queue: VecDeque<f32>,
    done: bool,
}

/// Strategy for popping interleaved frames from the queue.
pub enum PopStrategy {
    /// Block until exactly `frames` are available, or return `None` if closed before enough data.
    BlockingExact { frames: usize },
    /// Block until at least one frame is available, then return up to `max_frames`.
    BlockingUpTo { max_frames: usize },
    /// Return immediately with up to `max_frames`, or `None` if currently empty.
    NonBlocking { max_frames: usize },
}

/// Compute a conservative queue capacity in samples for a `(rate, channels, seconds)` target.
pub fn calc_max_buffered_samples(rate_hz: u32, channels: usize, buffer_seconds: f32) -> usize {
    let secs = if buffer_seconds.is_finite() && buffer_seconds > 0.0 {
        buffer_seconds
    } else {
        2.0
    };
    let frames = (rate_hz as f32 * secs).ceil() as usize;
    frames.saturating_mul(channels)
}

impl SharedAudio {
    pub fn new(channels: usize, max_buffered_samples: usize) -> Self {
        Self {
            channels,
            inner: Mutex::new(SharedInner { queue: VecDeque::new(), done: false }),
            cv: Condvar::new(),
            max_buffered_samples,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Maximum buffered frames (capacity) for this queue.
    pub fn max_frames(&self) -> usize {
        self.max_buffered_samples / self.channels
    }

    /// Current buffered frames (best-effort snapshot).
    pub fn len_frames(&self) -> usize {
        let g = self.inner.lock().unwrap();
        g.queue.len() / self.channels
    }

    pub fn is_done(&self) -> bool {
        let g = self.inner.lock().unwrap();
        g.done
    }

    /// Mark the queue as finished and wake all waiters. Idempotent.
    pub fn close(&self) {
        let mut g = self.inner.lock().unwrap();
        g.done = true;
        drop(g);
        self.cv.notify_all();
    }

    /// Push interleaved samples, blocking while the queue is full.
    pub fn push_interleaved_blocking(&self, samples: &[f32]) {
        let mut offset = 0;
        while offset < samples.len() {
            let mut g = self.inner.lock().unwrap();
            while g.queue.len() >= self.max_buffered_samples && !g.done {
                g = self.cv.wait(g).unwrap();
            }
            if g.done {
                return;
            }
            let mut pushed_any = false;
            while offset < samples.len() && g.queue.len() < self.max_buffered_samples {
                g.queue.push_back(samples[offset]);
                offset += 1;
                pushed_any = true;
            }
            drop(g);
            if pushed_any {
                self.cv.notify_all();
            }
        }
    }

    /// Pop interleaved frames per `strategy`. `None` means closed and unable to satisfy it.
    pub fn pop(&self, strategy: PopStrategy) -> Option<Vec<f32>> {
        match strategy {
            PopStrategy::BlockingExact { frames } => {
                let want = frames * self.channels;
                let mut g = self.inner.lock().unwrap();
                while g.queue.len() < want && !g.done {
                    g = self.cv.wait(g).unwrap();
                }
                if g.queue.len() < want {
                    return None;
                }
                let out = drain_front(&mut g.queue, want);
                drop(g);
                self.cv.notify_all();
                Some(out)
            }
            PopStrategy::BlockingUpTo { max_frames } => {
                let mut g = self.inner.lock().unwrap();
                while g.queue.is_empty() && !g.done {
                    g = self.cv.wait(g).unwrap();
                }
                if g.queue.is_empty() && g.done {
                    return None;
                }
                let take = (g.queue.len() / self.channels).min(max_frames) * self.channels;
                let out = drain_front(&mut g.queue, take);
                drop(g);
                self.cv.notify_all();
                Some(out)
            }
            PopStrategy::NonBlocking { max_frames } => {
                let mut g = self.inner.lock().unwrap();
                let take = (g.queue.len() / self.channels).min(max_frames) * self.channels;
                if take == 0 {
                    return None;
                }
                let out = drain_front(&mut g.queue, take);
                drop(g);
                self.cv.notify_all();
                Some(out)
            }
        }
    }
}

fn drain_front(queue: &mut VecDeque<f32>, n: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(queue.pop_front().unwrap_or(0.0));
    }
    out
}

/// Block until `q` is closed and fully drained.
pub fn wait_until_done_and_empty(q: &Arc<SharedAudio>) {
    let mut g = q.inner.lock().unwrap();
    while !(g.done && g.queue.is_empty()) {
        g = q.cv.wait(g).unwrap();
    }
}

/// Block until `q` is closed+empty OR `cancel` becomes true. Returns whether it drained normally.
pub fn wait_until_done_and_empty_or_cancel(q: &Arc<SharedAudio>, cancel: &Arc<AtomicBool>) -> bool {
    let mut g = q.inner.lock().unwrap();
    loop {
        if cancel.load(Ordering::Relaxed) {
            return false;
        }
        if g.done && g.queue.is_empty() {
            return true;
        }
        let (ng, _timeout) = q.cv.wait_timeout(g, Duration::from_millis(50)).unwrap();
        g = ng;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn calc_max_buffered_samples_fallbacks() {
        assert_eq!(calc_max_buffered_samples(48_000, 2, 2.0), 192_000);
        assert_eq!(calc_max_buffered_samples(48_000, 2, -1.0), 192_000);
        assert_eq!(calc_max_buffered_samples(48_000, 2, f32::NAN), 192_000);
    }

    #[test]
    fn pop_nonblocking_empty() {
        let q = SharedAudio::new(2, 16);
        assert!(q.pop(PopStrategy::NonBlocking { max_frames: 4 }).is_none());
    }

    #[test]
    fn pop_blocking_exact_waits_for_full_frames() {
        let q = Arc::new(SharedAudio::new(2, 64));
        let q_push = q.clone();
        let barrier = Arc::new(std::sync::Barrier::new(2));
        let start = barrier.clone();

        let handle = thread::spawn(move || {
            start.wait();
            let out = q.pop(PopStrategy::BlockingExact { frames: 3 }).unwrap();
            assert_eq!(out.len(), 6);
        });

        barrier.wait();
        q_push.push_interleaved_blocking(&[0.1, 0.2, 0.3, 0.4]);
        q_push.push_interleaved_blocking(&[0.5, 0.6]);
        handle.join().unwrap();
    }

    #[test]
    fn max_frames_and_len_frames_track_capacity_and_fill() {
        let q = SharedAudio::new(2, 64);
        assert_eq!(q.max_frames(), 32);
        q.push_interleaved_blocking(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(q.len_frames(), 2);
    }

    #[test]
    fn wait_until_done_and_empty_or_cancel_respects_cancel() {
        let q = Arc::new(SharedAudio::new(2, 64));
        let cancel = Arc::new(AtomicBool::new(true));
        assert!(!wait_until_done_and_empty_or_cancel(&q, &cancel));
    }

    #[test]
    fn wait_until_done_and_empty_returns_when_closed() {
        let q = Arc::new(SharedAudio::new(2, 64));
        q.close();
        wait_until_done_and_empty(&q);
        assert!(q.is_done());
    }
}
