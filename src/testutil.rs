//! Shared test fakes for the collaborator boundaries.
//!
//! `MicProbe` instruments open/close so tests can assert the mutual
//! exclusion property (never more than one open capture handle). The fake
//! classifier, decoder, and transport replay scripts so timing-sensitive
//! orchestration paths can be driven deterministically without hardware or
//! network.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::audio::{
    AudioFrame, CaptureError, FrameReadError, FrameSource, FrameStream, FRAME_SAMPLES,
    TARGET_SAMPLE_RATE,
};
use crate::dispatch::{DeliveryError, SentenceRequest, TranscriptTransport};
use crate::recognize::{Decoded, Decoder};
use crate::wake::Classifier;

/// Install a test subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------------
// Microphone
// ---------------------------------------------------------------------------

/// Counts stream opens/closes across every consumer of a fake source.
#[derive(Debug, Default)]
pub struct MicProbe {
    open_streams: AtomicUsize,
    max_open: AtomicUsize,
    opens: AtomicUsize,
}

impl MicProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open streams ever observed.
    pub fn max_open(&self) -> usize {
        self.max_open.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn record_open(&self) {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let now_open = self.open_streams.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open.fetch_max(now_open, Ordering::SeqCst);
    }

    fn record_close(&self) {
        self.open_streams.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Frame source producing silent frames at a fixed cadence.
pub struct FakeFrameSource {
    probe: Arc<MicProbe>,
    frame_interval: Duration,
    fail_open: bool,
    fail_open_calls: Vec<usize>,
    open_calls: AtomicUsize,
    fail_after: Option<usize>,
}

impl FakeFrameSource {
    pub fn new(probe: Arc<MicProbe>, frame_interval: Duration) -> Self {
        Self {
            probe,
            frame_interval,
            fail_open: false,
            fail_open_calls: Vec::new(),
            open_calls: AtomicUsize::new(0),
            fail_after: None,
        }
    }

    /// Every `open` fails as if the device were busy.
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Only the listed `open` calls (1-based) fail.
    pub fn failing_open_on(mut self, calls: Vec<usize>) -> Self {
        self.fail_open_calls = calls;
        self
    }

    /// The stream dies fatally after producing `frames` frames.
    pub fn failing_after(mut self, frames: usize) -> Self {
        self.fail_after = Some(frames);
        self
    }
}

impl FrameSource for FakeFrameSource {
    fn open(&self) -> Result<Box<dyn FrameStream>, CaptureError> {
        let call = self.open_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_open || self.fail_open_calls.contains(&call) {
            return Err(CaptureError::DeviceUnavailable(
                "injected open failure".to_string(),
            ));
        }
        self.probe.record_open();
        Ok(Box::new(FakeStream {
            probe: Arc::clone(&self.probe),
            frame_interval: self.frame_interval,
            fail_after: self.fail_after,
            produced: 0,
        }))
    }
}

struct FakeStream {
    probe: Arc<MicProbe>,
    frame_interval: Duration,
    fail_after: Option<usize>,
    produced: usize,
}

impl FrameStream for FakeStream {
    fn read_frame(&mut self, timeout: Duration) -> Result<AudioFrame, FrameReadError> {
        if let Some(limit) = self.fail_after {
            if self.produced >= limit {
                return Err(FrameReadError::Fatal("injected capture failure".to_string()));
            }
        }
        if self.frame_interval >= timeout {
            std::thread::sleep(timeout);
            return Err(FrameReadError::TimedOut);
        }
        std::thread::sleep(self.frame_interval);
        self.produced += 1;
        Ok(AudioFrame::new(
            vec![0.0; FRAME_SAMPLES],
            TARGET_SAMPLE_RATE,
        ))
    }
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        self.probe.record_close();
    }
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

/// Classifier replaying a per-frame score script, then a default score.
pub struct FakeClassifier {
    label: String,
    script: Mutex<VecDeque<Result<f32, String>>>,
    default_score: f32,
    delay: Duration,
}

impl FakeClassifier {
    /// Same score for every frame.
    pub fn constant(label: &str, score: f32) -> Self {
        Self::scripted(label, Vec::new(), score)
    }

    /// Scripted per-frame results (`Err` = classifier failure on that
    /// frame), falling back to `default_score` when exhausted.
    pub fn scripted(label: &str, script: Vec<Result<f32, String>>, default_score: f32) -> Self {
        Self {
            label: label.to_string(),
            script: Mutex::new(script.into()),
            default_score,
            delay: Duration::ZERO,
        }
    }

    /// Make every classification take `delay` (to back up the frame queue).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Classifier for FakeClassifier {
    fn classify(&mut self, _frame: &AudioFrame) -> anyhow::Result<Vec<(String, f32)>> {
        if self.delay > Duration::ZERO {
            std::thread::sleep(self.delay);
        }
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(score)) => Ok(vec![(self.label.clone(), score)]),
            Some(Err(message)) => Err(anyhow::anyhow!(message)),
            None => Ok(vec![(self.label.clone(), self.default_score)]),
        }
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// Decoder replaying a per-frame script, then `Decoded::Silence`.
pub struct FakeDecoder {
    script: Mutex<VecDeque<Result<Decoded, String>>>,
    tail: Mutex<Option<String>>,
    resets: Arc<AtomicUsize>,
}

impl FakeDecoder {
    pub fn new(script: Vec<Result<Decoded, String>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            tail: Mutex::new(None),
            resets: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn silent() -> Self {
        Self::new(Vec::new())
    }

    /// Text `finalize` will flush at end of session.
    pub fn with_tail(self, text: &str) -> Self {
        *self.tail.lock().unwrap() = Some(text.to_string());
        self
    }

    /// Reset counter that stays observable after the decoder moves into a
    /// session.
    pub fn resets_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.resets)
    }
}

impl Decoder for FakeDecoder {
    fn reset(&mut self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }

    fn feed(&mut self, _frame: &AudioFrame) -> anyhow::Result<Decoded> {
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(decoded)) => Ok(decoded),
            Some(Err(message)) => Err(anyhow::anyhow!(message)),
            None => Ok(Decoded::Silence),
        }
    }

    fn finalize(&mut self) -> anyhow::Result<Option<String>> {
        Ok(self.tail.lock().unwrap().take())
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Transport replaying a per-attempt result script, then `Ok`. Clones share
/// state, so tests can keep one and hand the other to a dispatcher.
#[derive(Clone, Default)]
pub struct FakeTransport {
    inner: Arc<FakeTransportInner>,
}

#[derive(Default)]
struct FakeTransportInner {
    script: Mutex<VecDeque<Result<(), DeliveryError>>>,
    attempts: Mutex<Vec<SentenceRequest>>,
    delivered: Mutex<Vec<SentenceRequest>>,
}

impl FakeTransport {
    pub fn succeeding() -> Self {
        Self::scripted(Vec::new())
    }

    pub fn scripted(script: Vec<Result<(), DeliveryError>>) -> Self {
        Self {
            inner: Arc::new(FakeTransportInner {
                script: Mutex::new(script.into()),
                attempts: Mutex::new(Vec::new()),
                delivered: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Every attempt made, in call order.
    pub fn attempts(&self) -> Vec<SentenceRequest> {
        self.inner.attempts.lock().unwrap().clone()
    }

    /// Successfully delivered requests, in completion order.
    pub fn delivered(&self) -> Vec<SentenceRequest> {
        self.inner.delivered.lock().unwrap().clone()
    }
}

impl TranscriptTransport for FakeTransport {
    fn deliver(
        &self,
        request: &SentenceRequest,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send {
        async move {
            self.inner.attempts.lock().unwrap().push(request.clone());
            let next = self
                .inner
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(()));
            if next.is_ok() {
                self.inner.delivered.lock().unwrap().push(request.clone());
            }
            next
        }
    }
}
