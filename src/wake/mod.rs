//! Background wake-word detection.
//!
//! A running detector owns two threads: a capture thread that holds the
//! device stream (and the ownership token) and feeds the bounded frame
//! queue, and a detection loop that classifies frames and raises events.
//! The event callback runs synchronously in the detection loop thread;
//! callers that stop the detector from inside that callback rely on the
//! non-blocking stop path, and `stop` refuses to join its own loop either
//! way.

pub mod cooldown;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::arbiter::{AudioConsumer, StartError};
use crate::audio::frame_queue::FrameQueue;
use crate::audio::{AudioFrame, CaptureError, FrameReadError, FrameSource};
use crate::ownership::{Holder, MicSlot, OwnershipToken};

use cooldown::CooldownState;

/// How long each loop waits per poll before rechecking its running flag.
const LOOP_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Bound on waiting for the capture thread to confirm its stream opened.
const OPEN_ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Bound on waiting for loop threads to exit during stop.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Wake-word classifier collaborator: one frame in, label scores out.
/// Stateless per call from the orchestrator's point of view.
pub trait Classifier: Send {
    fn classify(&mut self, frame: &AudioFrame) -> anyhow::Result<Vec<(String, f32)>>;
}

/// A wake phrase accepted by the threshold + cooldown policy.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionEvent {
    pub label: String,
    pub confidence: f32,
    pub at: Instant,
}

/// Events raised through the detector callback.
#[derive(Debug, Clone, PartialEq)]
pub enum WakeEvent {
    /// Wake phrase accepted. Raised synchronously in the detection loop
    /// thread.
    Detected(DetectionEvent),
    /// The capture stream died; the detector has stopped feeding itself
    /// and must be restarted by its owner.
    Fatal { message: String },
}

/// Callback invoked from the detector's own threads. Must not block.
pub type WakeCallback = Arc<dyn Fn(WakeEvent) + Send + Sync>;

/// Detector tuning.
#[derive(Debug, Clone)]
pub struct WakeDetectorConfig {
    /// Minimum confidence to accept a detection.
    pub threshold: f32,
    /// Minimum spacing between two accepted detections of one label.
    pub cooldown_window: Duration,
    /// Frame queue capacity, in frames (~80 ms each).
    pub queue_capacity: usize,
}

impl Default for WakeDetectorConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            cooldown_window: Duration::from_millis(2000),
            queue_capacity: 6,
        }
    }
}

/// Bookkeeping for a running detector. The running flag lives here, not on
/// the detector: a loop from a previous run that is still winding down
/// after a non-blocking stop must never mistake a fresh start for "keep
/// going".
struct RunningState {
    running: Arc<AtomicBool>,
    capture_join: Option<JoinHandle<()>>,
    detect_join: Option<JoinHandle<()>>,
    detect_thread: ThreadId,
    capture_exit_rx: Receiver<()>,
    detect_exit_rx: Receiver<()>,
}

pub struct WakeWordDetector {
    config: WakeDetectorConfig,
    source: Arc<dyn FrameSource>,
    classifier: Arc<Mutex<Box<dyn Classifier>>>,
    slot: Arc<MicSlot>,
    on_event: WakeCallback,
    queue: Arc<FrameQueue>,
    state: Mutex<Option<RunningState>>,
}

impl WakeWordDetector {
    pub fn new(
        source: Arc<dyn FrameSource>,
        classifier: Box<dyn Classifier>,
        slot: Arc<MicSlot>,
        config: WakeDetectorConfig,
        on_event: WakeCallback,
    ) -> Self {
        let queue = Arc::new(FrameQueue::new(config.queue_capacity));
        Self {
            config,
            source,
            classifier: Arc::new(Mutex::new(classifier)),
            slot,
            on_event,
            queue,
            state: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().is_some()
    }

    /// Frames currently buffered. Zero after every stop.
    pub fn queued_frames(&self) -> usize {
        self.queue.len()
    }

    /// Acquire the microphone and spawn the capture and detection threads.
    pub fn start(&self) -> Result<(), StartError> {
        let mut state = self.state.lock().unwrap();
        if state.is_some() {
            return Err(StartError::AlreadyRunning);
        }

        let token = self.slot.acquire(Holder::Detector)?;
        let running = Arc::new(AtomicBool::new(true));
        self.queue.clear();

        // Capture thread: owns the stream and the token for its lifetime.
        let (ack_tx, ack_rx) = mpsc::channel();
        let (capture_exit_tx, capture_exit_rx) = mpsc::channel();
        let source = Arc::clone(&self.source);
        let queue = Arc::clone(&self.queue);
        let capture_running = Arc::clone(&running);
        let on_event = Arc::clone(&self.on_event);
        let capture_join = thread::spawn(move || {
            capture_thread_main(source, queue, capture_running, on_event, token, ack_tx);
            let _ = capture_exit_tx.send(());
        });

        match ack_rx.recv_timeout(OPEN_ACK_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                running.store(false, Ordering::SeqCst);
                let _ = capture_join.join();
                return Err(err.into());
            }
            Err(_) => {
                // Capture thread wedged on open; it will release the token
                // on its own once the open returns and sees the flag.
                running.store(false, Ordering::SeqCst);
                return Err(StartError::CaptureFailed(
                    "timed out opening capture stream".to_string(),
                ));
            }
        }

        // Detection loop thread.
        let (detect_exit_tx, detect_exit_rx) = mpsc::channel();
        let queue = Arc::clone(&self.queue);
        let detect_running = Arc::clone(&running);
        let classifier = Arc::clone(&self.classifier);
        let on_event = Arc::clone(&self.on_event);
        let config = self.config.clone();
        let detect_join = thread::spawn(move || {
            detection_loop_main(queue, detect_running, classifier, config, on_event);
            let _ = detect_exit_tx.send(());
        });
        let detect_thread = detect_join.thread().id();

        *state = Some(RunningState {
            running,
            capture_join: Some(capture_join),
            detect_join: Some(detect_join),
            detect_thread,
            capture_exit_rx,
            detect_exit_rx,
        });

        info!(threshold = self.config.threshold, "wake word detector started");
        Ok(())
    }

    /// Stop the detector.
    ///
    /// Signals both loops, waits (bounded) for the capture thread to close
    /// the stream and release the microphone, then drains the frame queue
    /// so no stale audio can re-trigger on the next start. When `blocking`,
    /// the detection loop is joined too — unless the caller *is* the
    /// detection loop (a callback stopping its own detector), in which case
    /// that join is skipped to avoid deadlocking on ourselves.
    pub fn stop(&self, blocking: bool) {
        let taken = self.state.lock().unwrap().take();
        let Some(mut run) = taken else {
            debug!("stop requested but detector not running");
            return;
        };

        run.running.store(false, Ordering::SeqCst);

        // The capture thread closes the stream and drops the ownership
        // token on its way out; wait for that before draining so nothing
        // can be pushed after the drain.
        match run.capture_exit_rx.recv_timeout(STOP_JOIN_TIMEOUT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = run.capture_join.take() {
                    let _ = handle.join();
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("timed out waiting for capture thread to exit");
            }
        }

        self.queue.clear();

        let self_stop = thread::current().id() == run.detect_thread;
        if blocking && !self_stop {
            match run.detect_exit_rx.recv_timeout(STOP_JOIN_TIMEOUT) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if let Some(handle) = run.detect_join.take() {
                        let _ = handle.join();
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!("timed out waiting for detection loop to exit");
                }
            }
        } else if self_stop {
            debug!("stop called from the detection loop itself, skipping join");
        }

        info!("wake word detector stopped");
    }
}

impl AudioConsumer for WakeWordDetector {
    fn name(&self) -> &'static str {
        "wake-word detector"
    }

    fn start(&self) -> Result<(), StartError> {
        WakeWordDetector::start(self)
    }

    fn stop(&self, blocking: bool) {
        WakeWordDetector::stop(self, blocking)
    }
}

/// Capture thread: open the stream, confirm back to `start`, then feed the
/// frame queue until told to stop. Owns the stream and the token; both are
/// released here, never from `stop`.
fn capture_thread_main(
    source: Arc<dyn FrameSource>,
    queue: Arc<FrameQueue>,
    running: Arc<AtomicBool>,
    on_event: WakeCallback,
    token: OwnershipToken,
    ack_tx: mpsc::Sender<Result<(), CaptureError>>,
) {
    let mut stream = match source.open() {
        Ok(stream) => stream,
        Err(err) => {
            drop(token);
            let _ = ack_tx.send(Err(err));
            return;
        }
    };
    let _ = ack_tx.send(Ok(()));
    debug!("capture thread started");

    while running.load(Ordering::SeqCst) {
        match stream.read_frame(LOOP_READ_TIMEOUT) {
            Ok(frame) => {
                // A stop may have landed mid-read; a frame captured after
                // that must not survive the drain.
                if running.load(Ordering::SeqCst) {
                    queue.push(frame);
                }
            }
            Err(FrameReadError::TimedOut) => continue,
            Err(FrameReadError::Fatal(message)) => {
                warn!(%message, "capture stream failed, stopping detector");
                running.store(false, Ordering::SeqCst);
                on_event(WakeEvent::Fatal { message });
                break;
            }
        }
    }

    drop(stream);
    drop(token);
    debug!("capture thread exiting");
}

/// Detection loop: pop frames, classify, apply threshold + cooldown, raise
/// events synchronously. Classifier errors skip the frame; they never kill
/// the loop.
fn detection_loop_main(
    queue: Arc<FrameQueue>,
    running: Arc<AtomicBool>,
    classifier: Arc<Mutex<Box<dyn Classifier>>>,
    config: WakeDetectorConfig,
    on_event: WakeCallback,
) {
    debug!("detection loop started");
    let mut cooldown = CooldownState::new(config.cooldown_window);

    while running.load(Ordering::SeqCst) {
        let Some(frame) = queue.pop(LOOP_READ_TIMEOUT) else {
            continue;
        };

        let scores = match classifier.lock().unwrap().classify(&frame) {
            Ok(scores) => scores,
            Err(err) => {
                warn!(error = %err, "classifier failed on frame, skipping");
                continue;
            }
        };

        for (label, confidence) in scores {
            if confidence < config.threshold {
                continue;
            }
            let now = Instant::now();
            if !cooldown.try_fire(&label, now) {
                debug!(%label, confidence, "detection suppressed by cooldown");
                continue;
            }
            // A stop may have landed while we were classifying; do not
            // raise a detection we already know is stale.
            if !running.load(Ordering::SeqCst) {
                debug!(%label, "detected but stop requested, dropping event");
                break;
            }
            info!(%label, confidence, "wake word detected");
            on_event(WakeEvent::Detected(DetectionEvent {
                label,
                confidence,
                at: now,
            }));
        }
    }

    debug!("detection loop exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeClassifier, FakeFrameSource, MicProbe};

    fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if predicate() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        predicate()
    }

    fn collecting_callback() -> (WakeCallback, Receiver<WakeEvent>) {
        let (tx, rx) = mpsc::channel();
        let callback: WakeCallback = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        (callback, rx)
    }

    #[test]
    fn detects_once_per_cooldown_window() {
        let probe = MicProbe::new();
        let source = Arc::new(FakeFrameSource::new(Arc::clone(&probe), Duration::from_millis(5)));
        // Every frame scores above threshold; the cooldown must collapse
        // the burst into a single event.
        let classifier = FakeClassifier::constant("wake", 0.9);
        let (callback, events) = collecting_callback();
        let detector = WakeWordDetector::new(
            source,
            Box::new(classifier),
            MicSlot::new(),
            WakeDetectorConfig {
                threshold: 0.5,
                cooldown_window: Duration::from_secs(10),
                queue_capacity: 6,
            },
            callback,
        );

        detector.start().unwrap();
        let first = events.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(first, WakeEvent::Detected(ref d) if d.label == "wake"));

        // Give the loop time to process many more above-threshold frames.
        thread::sleep(Duration::from_millis(150));
        detector.stop(true);

        assert!(events.try_recv().is_err(), "cooldown failed to suppress repeats");
    }

    #[test]
    fn below_threshold_scores_never_fire() {
        let probe = MicProbe::new();
        let source = Arc::new(FakeFrameSource::new(Arc::clone(&probe), Duration::from_millis(5)));
        let classifier = FakeClassifier::constant("wake", 0.3);
        let (callback, events) = collecting_callback();
        let detector = WakeWordDetector::new(
            source,
            Box::new(classifier),
            MicSlot::new(),
            WakeDetectorConfig::default(),
            callback,
        );

        detector.start().unwrap();
        thread::sleep(Duration::from_millis(100));
        detector.stop(true);

        assert!(events.try_recv().is_err());
    }

    #[test]
    fn queue_is_drained_after_stop() {
        let probe = MicProbe::new();
        // Fast frames + a slow classifier keep the queue populated.
        let source = Arc::new(FakeFrameSource::new(Arc::clone(&probe), Duration::from_millis(2)));
        let classifier = FakeClassifier::constant("wake", 0.0).with_delay(Duration::from_millis(50));
        let (callback, _events) = collecting_callback();
        let detector = WakeWordDetector::new(
            source,
            Box::new(classifier),
            MicSlot::new(),
            WakeDetectorConfig::default(),
            callback,
        );

        detector.start().unwrap();
        assert!(
            wait_until(Duration::from_secs(1), || detector.queued_frames() > 0),
            "queue never filled"
        );

        detector.stop(true);
        assert_eq!(detector.queued_frames(), 0);
    }

    #[test]
    fn stop_from_detection_callback_does_not_deadlock() {
        crate::testutil::init_tracing();
        let probe = MicProbe::new();
        let source = Arc::new(FakeFrameSource::new(Arc::clone(&probe), Duration::from_millis(5)));
        let classifier = FakeClassifier::constant("wake", 0.9);

        let detector_cell: Arc<std::sync::OnceLock<Arc<WakeWordDetector>>> =
            Arc::new(std::sync::OnceLock::new());
        let (done_tx, done_rx) = mpsc::channel();
        let cell = Arc::clone(&detector_cell);
        let callback: WakeCallback = Arc::new(move |event| {
            if matches!(event, WakeEvent::Detected(_)) {
                if let Some(detector) = cell.get() {
                    // The regression under test: a blocking stop issued
                    // from the detection loop's own callback must return
                    // rather than joining itself.
                    detector.stop(true);
                }
                let _ = done_tx.send(Instant::now());
            }
        });

        let detector = Arc::new(WakeWordDetector::new(
            source,
            Box::new(classifier),
            MicSlot::new(),
            WakeDetectorConfig::default(),
            callback,
        ));
        detector_cell.set(Arc::clone(&detector)).ok();

        detector.start().unwrap();
        done_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("callback never completed — stop deadlocked on its own loop");

        assert!(!detector.is_running());
        assert_eq!(detector.queued_frames(), 0);
    }

    #[test]
    fn start_fails_when_microphone_held() {
        let probe = MicProbe::new();
        let source = Arc::new(FakeFrameSource::new(Arc::clone(&probe), Duration::from_millis(5)));
        let slot = MicSlot::new();
        let _held = slot.acquire(Holder::Session).unwrap();

        let (callback, _events) = collecting_callback();
        let detector = WakeWordDetector::new(
            source,
            Box::new(FakeClassifier::constant("wake", 0.0)),
            slot,
            WakeDetectorConfig::default(),
            callback,
        );

        assert!(matches!(
            detector.start(),
            Err(StartError::DeviceUnavailable(_))
        ));
        assert!(!detector.is_running());
    }

    #[test]
    fn double_start_reports_already_running() {
        let probe = MicProbe::new();
        let source = Arc::new(FakeFrameSource::new(Arc::clone(&probe), Duration::from_millis(5)));
        let (callback, _events) = collecting_callback();
        let detector = WakeWordDetector::new(
            source,
            Box::new(FakeClassifier::constant("wake", 0.0)),
            MicSlot::new(),
            WakeDetectorConfig::default(),
            callback,
        );

        detector.start().unwrap();
        assert_eq!(detector.start(), Err(StartError::AlreadyRunning));
        detector.stop(true);
    }

    #[test]
    fn open_failure_surfaces_and_releases_token() {
        let probe = MicProbe::new();
        let source = Arc::new(
            FakeFrameSource::new(Arc::clone(&probe), Duration::from_millis(5)).failing_open(),
        );
        let slot = MicSlot::new();
        let (callback, _events) = collecting_callback();
        let detector = WakeWordDetector::new(
            source,
            Box::new(FakeClassifier::constant("wake", 0.0)),
            Arc::clone(&slot),
            WakeDetectorConfig::default(),
            callback,
        );

        assert!(matches!(
            detector.start(),
            Err(StartError::DeviceUnavailable(_))
        ));
        // The failed start must not leave the microphone claimed.
        assert!(slot.acquire(Holder::Session).is_ok());
    }

    #[test]
    fn fatal_stream_error_raises_event_and_releases_microphone() {
        let probe = MicProbe::new();
        let source = Arc::new(
            FakeFrameSource::new(Arc::clone(&probe), Duration::from_millis(5)).failing_after(3),
        );
        let slot = MicSlot::new();
        let (callback, events) = collecting_callback();
        let detector = WakeWordDetector::new(
            source,
            Box::new(FakeClassifier::constant("wake", 0.0)),
            Arc::clone(&slot),
            WakeDetectorConfig::default(),
            callback,
        );

        detector.start().unwrap();
        let mut saw_fatal = false;
        while let Ok(event) = events.recv_timeout(Duration::from_secs(2)) {
            if matches!(event, WakeEvent::Fatal { .. }) {
                saw_fatal = true;
                break;
            }
        }
        assert!(saw_fatal, "fatal capture error never surfaced");

        assert!(
            wait_until(Duration::from_secs(1), || slot.holder() == Holder::Free),
            "microphone not released after fatal error"
        );
        detector.stop(true);
    }

    #[test]
    fn classifier_errors_skip_frame_and_loop_continues() {
        let probe = MicProbe::new();
        let source = Arc::new(FakeFrameSource::new(Arc::clone(&probe), Duration::from_millis(5)));
        // First two frames fail, third scores above threshold.
        let classifier = FakeClassifier::scripted(
            "wake",
            vec![
                Err("model hiccup".to_string()),
                Err("model hiccup".to_string()),
                Ok(0.9),
            ],
            0.0,
        );
        let (callback, events) = collecting_callback();
        let detector = WakeWordDetector::new(
            source,
            Box::new(classifier),
            MicSlot::new(),
            WakeDetectorConfig::default(),
            callback,
        );

        detector.start().unwrap();
        let event = events.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(event, WakeEvent::Detected(_)));
        detector.stop(true);
    }
}
