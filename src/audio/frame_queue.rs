//! Bounded frame FIFO between the capture thread and the detection loop.
//!
//! Capacity is sized to a few hundred milliseconds of audio: enough to
//! absorb scheduling jitter, small enough that stale audio cannot linger.
//! On overflow the oldest frame is dropped so the producer never blocks.
//! `clear` empties the queue synchronously from any thread; the detector's
//! stop path relies on it to guarantee no stale-audio re-trigger.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use tracing::trace;

use super::AudioFrame;

pub struct FrameQueue {
    frames: Mutex<VecDeque<AudioFrame>>,
    capacity: usize,
    available: Condvar,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "frame queue capacity must be nonzero");
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            available: Condvar::new(),
        }
    }

    /// Push a frame, dropping the oldest one when full. Never blocks.
    pub fn push(&self, frame: AudioFrame) {
        let mut guard = self.frames.lock().unwrap();
        if guard.len() == self.capacity {
            guard.pop_front();
            trace!("frame queue full, dropped oldest frame");
        }
        guard.push_back(frame);
        drop(guard);
        self.available.notify_one();
    }

    /// Pop the next frame, waiting up to `timeout` for one to arrive.
    pub fn pop(&self, timeout: Duration) -> Option<AudioFrame> {
        let guard = self.frames.lock().unwrap();
        let (mut guard, _timeout_result) = self
            .available
            .wait_timeout_while(guard, timeout, |q| q.is_empty())
            .unwrap();
        guard.pop_front()
    }

    /// Discard everything currently buffered.
    pub fn clear(&self) {
        self.frames.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
