//! Exclusive microphone ownership.
//!
//! The microphone is the single shared resource in the orchestrator. A
//! `MicSlot` records which consumer currently holds it; an `OwnershipToken`
//! is the RAII proof of that claim. Tokens are acquired before a capture
//! stream opens and travel into the capture thread, which drops them only
//! after the stream has closed — token lifetime contains open-handle
//! lifetime, so two consumers can never hold open handles at once.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tracing::debug;

/// Who currently holds the microphone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Holder {
    Free = 0,
    Detector = 1,
    Session = 2,
}

impl Holder {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Detector,
            2 => Self::Session,
            _ => Self::Free,
        }
    }
}

impl std::fmt::Display for Holder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Detector => write!(f, "detector"),
            Self::Session => write!(f, "session"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AcquireError {
    #[error("microphone already held by {0}")]
    Held(Holder),
}

/// Shared slot tracking the current microphone holder.
#[derive(Debug)]
pub struct MicSlot {
    holder: AtomicU8,
}

impl MicSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            holder: AtomicU8::new(Holder::Free as u8),
        })
    }

    /// Current holder.
    pub fn holder(&self) -> Holder {
        Holder::from_u8(self.holder.load(Ordering::Acquire))
    }

    /// Claim the slot for `who`. Fails while any consumer holds it.
    pub fn acquire(self: &Arc<Self>, who: Holder) -> Result<OwnershipToken, AcquireError> {
        debug_assert!(who != Holder::Free);
        match self.holder.compare_exchange(
            Holder::Free as u8,
            who as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                debug!(holder = %who, "microphone acquired");
                Ok(OwnershipToken {
                    slot: Arc::clone(self),
                    who,
                })
            }
            Err(current) => Err(AcquireError::Held(Holder::from_u8(current))),
        }
    }
}

/// RAII claim on the microphone. Dropping releases the slot.
#[derive(Debug)]
pub struct OwnershipToken {
    slot: Arc<MicSlot>,
    who: Holder,
}

impl OwnershipToken {
    pub fn who(&self) -> Holder {
        self.who
    }
}

impl PartialEq for OwnershipToken {
    fn eq(&self, other: &Self) -> bool {
        self.who == other.who && Arc::ptr_eq(&self.slot, &other.slot)
    }
}

impl Drop for OwnershipToken {
    fn drop(&mut self) {
        self.slot.holder.store(Holder::Free as u8, Ordering::Release);
        debug!(holder = %self.who, "microphone released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_free_slot() {
        let slot = MicSlot::new();
        let token = slot.acquire(Holder::Detector).unwrap();
        assert_eq!(slot.holder(), Holder::Detector);
        assert_eq!(token.who(), Holder::Detector);
    }

    #[test]
    fn second_acquire_fails_while_held() {
        let slot = MicSlot::new();
        let _token = slot.acquire(Holder::Detector).unwrap();
        assert_eq!(
            slot.acquire(Holder::Session),
            Err(AcquireError::Held(Holder::Detector))
        );
    }

    #[test]
    fn drop_releases_slot() {
        let slot = MicSlot::new();
        let token = slot.acquire(Holder::Session).unwrap();
        drop(token);
        assert_eq!(slot.holder(), Holder::Free);
        assert!(slot.acquire(Holder::Detector).is_ok());
    }

    #[test]
    fn holder_transitions_across_handoff() {
        let slot = MicSlot::new();
        let detector_token = slot.acquire(Holder::Detector).unwrap();
        drop(detector_token);
        let _session_token = slot.acquire(Holder::Session).unwrap();
        assert_eq!(slot.holder(), Holder::Session);
    }
}
