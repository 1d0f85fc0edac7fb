//! Thread-safe bounded queue for interleaved audio samples.
//!
//! Used between the playback stages:
//! - decode thread → queue
//! - optional resampler thread → queue
//! - CPAL callback drains the queue (non-blocking)
//!
//! Closing the queue is how a stage tells the others to wind down; a `done` flag lives under
//! the same mutex as the samples so close-vs-push cannot race.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};

/// Bounded multi-producer/multi-consumer queue of interleaved `f32` samples.
pub struct SharedAudio {
    channels: usize,
    max_buffered_samples: usize,
    inner: Mutex<SharedInner>,
    cv: Condvar,
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

/// Queue capacity in samples for `seconds` of audio; non-finite or non-positive falls back to 2s.
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
        let channels = channels.max(1);
        Self {
            channels,
            max_buffered_samples: max_buffered_samples.max(channels),
            inner: Mutex::new(SharedInner {
                queue: VecDeque::new(),
                done: false,
            }),
            cv: Condvar::new(),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    fn lock(&self) -> MutexGuard<'_, SharedInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark the queue as finished and wake all waiters. Idempotent.
    pub fn close(&self) {
        self.lock().done = true;
        self.cv.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().done
    }

    /// Closed by the producer and fully consumed.
    pub fn is_drained(&self) -> bool {
        let g = self.lock();
        g.done && g.queue.is_empty()
    }

    /// Push samples, blocking while the queue is full.
    ///
    /// Returns `false` if the queue was closed before everything was accepted.
    pub fn push_interleaved_blocking(&self, samples: &[f32]) -> bool {
        let mut offset = 0;
        while offset < samples.len() {
            let mut g = self.lock();
            while g.queue.len() >= self.max_buffered_samples && !g.done {
                g = self.cv.wait(g).unwrap_or_else(|e| e.into_inner());
            }
            if g.done {
                return false;
            }
            let room = self.max_buffered_samples - g.queue.len();
            let take = room.min(samples.len() - offset);
            g.queue.extend(&samples[offset..offset + take]);
            offset += take;
            drop(g);
            self.cv.notify_all();
        }
        true
    }

    /// Pop interleaved frames using the requested strategy.
    ///
    /// Returns `None` when no data can satisfy the request (closed, or empty for non-blocking).
    pub fn pop(&self, strategy: PopStrategy) -> Option<Vec<f32>> {
        let mut g = self.lock();
        let take_samples = match strategy {
            PopStrategy::BlockingExact { frames } => {
                let want = frames * self.channels;
                while g.queue.len() < want && !g.done {
                    g = self.cv.wait(g).unwrap_or_else(|e| e.into_inner());
                }
                if g.queue.len() < want {
                    return None;
                }
                want
            }
            PopStrategy::BlockingUpTo { max_frames } => {
                while g.queue.is_empty() && !g.done {
                    g = self.cv.wait(g).unwrap_or_else(|e| e.into_inner());
                }
                let available = g.queue.len() / self.channels;
                available.min(max_frames) * self.channels
            }
            PopStrategy::NonBlocking { max_frames } => {
                let available = g.queue.len() / self.channels;
                available.min(max_frames) * self.channels
            }
        };
        if take_samples == 0 {
            return None;
        }
        let out: Vec<f32> = g.queue.drain(..take_samples).collect();
        drop(g);
        self.cv.notify_all();
        Some(out)
    }
}
