//! Audio session orchestration for a voice-activation front end.
//!
//! Listens continuously for a trained wake phrase and, on detection, hands
//! the single microphone device over to a streaming speech-recognition
//! session whose finalized sentences are delivered to a downstream
//! processor. The machine-learning pieces (wake-word classifier, streaming
//! decoder) and the processor itself sit behind traits; what lives here is
//! the concurrency and resource-arbitration layer that sequences two
//! audio consumers on one device without deadlocks, stale audio, or lost
//! sentences.
//!
//! The moving parts:
//! - [`wake::WakeWordDetector`] — background capture + classification loop
//!   with threshold and per-label cooldown.
//! - [`ownership::MicSlot`] / [`arbiter::handoff`] — exclusive microphone
//!   ownership and the stop/settle/start transfer protocol.
//! - [`recognize::SpeechRecognitionSession`] — foreground decoding with
//!   streaming sentence boundaries, silence timeout, and a duration cap.
//! - [`dispatch::SentenceDispatcher`] — per-sentence delivery with bounded
//!   retries, off the capture path.
//! - [`controller::SessionController`] — the state machine tying the
//!   cycle together: idle detection, activation, listening, resume.

pub mod arbiter;
pub mod audio;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod ownership;
pub mod recognize;
pub mod wake;

#[cfg(test)]
pub(crate) mod testutil;

pub use arbiter::{handoff, AudioConsumer, HandoffError, StartError};
pub use audio::capture::CpalFrameSource;
pub use audio::{AudioFrame, CaptureError, FrameReadError, FrameSource, FrameStream};
pub use config::OrchestratorConfig;
pub use controller::{ControllerEvent, ControllerHandle, SessionController};
pub use dispatch::{
    DeliveryError, DispatchConfig, HttpTransport, SentenceDispatcher, SentenceRequest,
    SentenceResponse, TranscriptTransport,
};
pub use ownership::{Holder, MicSlot, OwnershipToken};
pub use recognize::{
    Decoded, Decoder, SessionConfig, SessionOutcome, SessionPhase, SessionReport,
    SpeechRecognitionSession, TranscriptSentence,
};
pub use wake::{
    Classifier, DetectionEvent, WakeDetectorConfig, WakeEvent, WakeWordDetector,
};
