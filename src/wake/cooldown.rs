//! Per-label detection cooldown.
//!
//! The classifier can stay above threshold for several consecutive frames
//! of a single utterance; the cooldown window collapses that burst into
//! one detection per label.

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct CooldownState {
    window: Duration,
    last_fire: HashMap<String, Instant>,
}

impl CooldownState {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_fire: HashMap::new(),
        }
    }

    /// Whether a detection for `label` may fire at `now`. Records the fire
    /// time when it may.
    pub fn try_fire(&mut self, label: &str, now: Instant) -> bool {
        match self.last_fire.get(label) {
            Some(last) if now.duration_since(*last) < self.window => false,
            _ => {
                self.last_fire.insert(label.to_string(), now);
                true
            }
        }
    }

    /// Forget all fire times.
    pub fn reset(&mut self) {
        self.last_fire.clear();
    }
}
