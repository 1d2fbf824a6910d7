//! Audio frames and the microphone collaborator boundary.
//!
//! `AudioFrame` is the unit of audio moving through the orchestrator: a
//! fixed-length chunk of 16 kHz mono samples stamped with a monotonic
//! capture time. `FrameSource` abstracts the physical microphone so the
//! wake-word detector and the recognition session can share one device
//! through the ownership handoff, and so tests can substitute an
//! instrumented fake.

pub mod capture;
pub mod frame_queue;
pub mod ring_buffer;

use std::time::{Duration, Instant};

/// Target sample rate for the processing pipeline.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Frame size in samples (80 ms at 16 kHz).
pub const FRAME_SAMPLES: usize = 1280;

/// A fixed-length chunk of mono audio. Immutable after creation; moved
/// between the capture thread, the frame queue, and whichever consumer
/// currently owns the microphone.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub captured_at: Instant,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            captured_at: Instant::now(),
        }
    }

    /// Wall-clock span covered by this frame.
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

/// Errors opening a capture stream.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CaptureError {
    #[error("no input device available")]
    NoDevice,
    #[error("input device busy or unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("failed to build input stream: {0}")]
    StreamBuild(String),
}

/// Errors reading a frame from an open stream.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FrameReadError {
    /// No full frame arrived within the timeout. Not fatal; loops poll
    /// again so their running flag stays responsive.
    #[error("timed out waiting for a frame")]
    TimedOut,
    /// The capture stream died. The owning loop must stop.
    #[error("capture stream failed: {0}")]
    Fatal(String),
}

/// A source of audio frames (the microphone, or a test fake).
///
/// `open` may be called again after a previous stream was dropped, possibly
/// by a different owner shortly after — supporting that close-then-reopen
/// is the handoff protocol's whole premise.
pub trait FrameSource: Send + Sync {
    fn open(&self) -> Result<Box<dyn FrameStream>, CaptureError>;
}

/// An open capture stream. Closing is dropping. Deliberately not `Send`:
/// each consumer opens its stream on its own capture thread and drops it
/// there too.
pub trait FrameStream {
    /// Block up to `timeout` for the next full frame.
    fn read_frame(&mut self, timeout: Duration) -> Result<AudioFrame, FrameReadError>;
}
