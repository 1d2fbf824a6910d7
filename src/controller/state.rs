//! Atomic controller state.
//!
//! Compare-exchange transitions keep the orchestrator's state readable from
//! any thread without locking, and make illegal transitions (a stale event
//! arriving in the wrong state) cheap to detect and ignore.

use std::sync::atomic::{AtomicU8, Ordering};

/// Orchestrator lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControllerState {
    /// Wake-word detector running, waiting for a detection.
    Idle = 0,
    /// Handing the microphone from the detector to the session.
    Activating = 1,
    /// Recognition session capturing.
    Listening = 2,
    /// Handing the microphone back to the detector.
    Resuming = 3,
}

impl ControllerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Activating,
            2 => Self::Listening,
            3 => Self::Resuming,
            _ => Self::Idle,
        }
    }
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Activating => write!(f, "activating"),
            Self::Listening => write!(f, "listening"),
            Self::Resuming => write!(f, "resuming"),
        }
    }
}

#[derive(Debug)]
pub struct StateCell {
    state: AtomicU8,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ControllerState::Idle as u8),
        }
    }

    pub fn current(&self) -> ControllerState {
        ControllerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Transition `from -> to`; false when the current state is not `from`.
    pub fn transition(&self, from: ControllerState, to: ControllerState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Unconditional transition, for recovery paths.
    pub fn force(&self, to: ControllerState) {
        self.state.store(to as u8, Ordering::Release);
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}
