//! Foreground speech-recognition session.
//!
//! Started by the controller once the wake-word detector has released the
//! microphone. A single loop thread owns the capture stream, feeds frames
//! to the streaming decoder, and emits each finalized sentence the moment
//! its boundary is reported — never batched until session end. The session
//! ends itself on silence or a hard duration cap and announces that to the
//! controller; `stop` is only ever called from the controller thread, so
//! unlike the detector there is no self-join hazard here.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::arbiter::{AudioConsumer, StartError};
use crate::audio::{CaptureError, FrameReadError, FrameSource, AudioFrame};
use crate::ownership::{Holder, MicSlot, OwnershipToken};

/// How long the loop waits per frame read before rechecking its timers.
const LOOP_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Bound on waiting for the loop thread to confirm its stream opened.
const OPEN_ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Bound on joining the loop thread during stop.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Streaming decoder collaborator. Stateful across `feed` calls within one
/// session; `reset` is called at session start, `finalize` flushes any
/// pending hypothesis when the session ends.
pub trait Decoder: Send {
    fn reset(&mut self);
    fn feed(&mut self, frame: &AudioFrame) -> anyhow::Result<Decoded>;
    fn finalize(&mut self) -> anyhow::Result<Option<String>>;
}

/// One decoder step.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Nothing recognizable in this frame.
    Silence,
    /// In-progress hypothesis; may still be revised.
    Partial(String),
    /// Committed sentence boundary. The text will not be revised.
    Final(String),
}

/// A finalized sentence. Ownership moves to the dispatcher the moment the
/// boundary is detected.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptSentence {
    pub text: String,
    pub finalized_at: DateTime<Utc>,
    /// Position within the session; strictly increasing.
    pub sequence: u64,
}

/// Why a session ended on its own.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    SilenceTimeout,
    MaxDuration,
    Error(String),
}

/// Summary returned by `stop`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub session_id: String,
    /// `None` when the session was stopped externally before it finished.
    pub outcome: Option<SessionOutcome>,
    pub sentences_sent: u64,
}

/// Session phase, readable from any thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionPhase {
    Inactive = 0,
    Capturing = 1,
}

impl SessionPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Capturing,
            _ => Self::Inactive,
        }
    }
}

/// Callback for each finalized sentence: `(session_id, sentence)`. Runs in
/// the session loop thread; must not block (hand the sentence off and
/// return).
pub type SentenceCallback = Arc<dyn Fn(&str, TranscriptSentence) + Send + Sync>;

/// Callback invoked when a session ends on its own (timeout or error).
pub type SessionEndCallback = Arc<dyn Fn(SessionOutcome) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// End the session after this much time without speech.
    pub silence_timeout: Duration,
    /// Hard cap on session length, speech or not.
    pub max_duration: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            silence_timeout: Duration::from_secs(3),
            max_duration: Duration::from_secs(30),
        }
    }
}

/// State shared between the session object and its loop thread. Created
/// fresh per activation so a loop still winding down from a previous
/// session cannot touch the next one's bookkeeping.
struct SessionShared {
    phase: AtomicU8,
    sentences_sent: AtomicU64,
    outcome: Mutex<Option<SessionOutcome>>,
    last_partial: Mutex<String>,
}

struct ActiveSession {
    running: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
    exit_rx: Receiver<()>,
    session_id: String,
    shared: Arc<SessionShared>,
}

pub struct SpeechRecognitionSession {
    config: SessionConfig,
    source: Arc<dyn FrameSource>,
    decoder: Arc<Mutex<Box<dyn Decoder>>>,
    slot: Arc<MicSlot>,
    on_sentence: SentenceCallback,
    on_end: SessionEndCallback,
    state: Mutex<Option<ActiveSession>>,
}

impl SpeechRecognitionSession {
    pub fn new(
        source: Arc<dyn FrameSource>,
        decoder: Box<dyn Decoder>,
        slot: Arc<MicSlot>,
        config: SessionConfig,
        on_sentence: SentenceCallback,
        on_end: SessionEndCallback,
    ) -> Self {
        Self {
            config,
            source,
            decoder: Arc::new(Mutex::new(decoder)),
            slot,
            on_sentence,
            on_end,
            state: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.state
            .lock()
            .unwrap()
            .as_ref()
            .map(|active| SessionPhase::from_u8(active.shared.phase.load(Ordering::Acquire)))
            .unwrap_or(SessionPhase::Inactive)
    }

    /// Most recent in-progress hypothesis. Diagnostic display only; partial
    /// text is never dispatched.
    pub fn last_partial(&self) -> String {
        self.state
            .lock()
            .unwrap()
            .as_ref()
            .map(|active| active.shared.last_partial.lock().unwrap().clone())
            .unwrap_or_default()
    }

    /// Acquire the microphone, reset the decoder, and start capturing.
    pub fn start(&self) -> Result<(), StartError> {
        let mut state = self.state.lock().unwrap();
        if state.is_some() {
            return Err(StartError::AlreadyRunning);
        }

        let token = self.slot.acquire(Holder::Session)?;
        self.decoder.lock().unwrap().reset();

        let session_id = Uuid::new_v4().to_string();
        let shared = Arc::new(SessionShared {
            phase: AtomicU8::new(SessionPhase::Inactive as u8),
            sentences_sent: AtomicU64::new(0),
            outcome: Mutex::new(None),
            last_partial: Mutex::new(String::new()),
        });
        let running = Arc::new(AtomicBool::new(true));

        let (ack_tx, ack_rx) = mpsc::channel();
        let (exit_tx, exit_rx) = mpsc::channel();
        let loop_ctx = LoopContext {
            source: Arc::clone(&self.source),
            decoder: Arc::clone(&self.decoder),
            config: self.config.clone(),
            running: Arc::clone(&running),
            shared: Arc::clone(&shared),
            on_sentence: Arc::clone(&self.on_sentence),
            on_end: Arc::clone(&self.on_end),
            session_id: session_id.clone(),
        };
        let join = thread::spawn(move || {
            session_loop_main(loop_ctx, token, ack_tx);
            let _ = exit_tx.send(());
        });

        match ack_rx.recv_timeout(OPEN_ACK_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                running.store(false, Ordering::SeqCst);
                let _ = join.join();
                return Err(err.into());
            }
            Err(_) => {
                running.store(false, Ordering::SeqCst);
                return Err(StartError::CaptureFailed(
                    "timed out opening capture stream".to_string(),
                ));
            }
        }

        shared
            .phase
            .store(SessionPhase::Capturing as u8, Ordering::Release);
        *state = Some(ActiveSession {
            running,
            join: Some(join),
            exit_rx,
            session_id: session_id.clone(),
            shared,
        });

        info!(session = %session_id, "recognition session started");
        Ok(())
    }

    /// Stop the session and collect its report.
    ///
    /// Always runs in the controller thread, never inside the session loop,
    /// so a plain bounded join is safe.
    pub fn stop(&self) -> Option<SessionReport> {
        let taken = self.state.lock().unwrap().take();
        let Some(mut active) = taken else {
            debug!("stop requested but no active session");
            return None;
        };

        active.running.store(false, Ordering::SeqCst);
        match active.exit_rx.recv_timeout(STOP_JOIN_TIMEOUT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = active.join.take() {
                    let _ = handle.join();
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("timed out waiting for session loop to exit");
            }
        }

        let outcome = active.shared.outcome.lock().unwrap().clone();
        let report = SessionReport {
            session_id: active.session_id,
            outcome,
            sentences_sent: active.shared.sentences_sent.load(Ordering::SeqCst),
        };
        info!(
            session = %report.session_id,
            sentences = report.sentences_sent,
            outcome = ?report.outcome,
            "recognition session stopped"
        );
        Some(report)
    }
}

impl AudioConsumer for SpeechRecognitionSession {
    fn name(&self) -> &'static str {
        "recognition session"
    }

    fn start(&self) -> Result<(), StartError> {
        SpeechRecognitionSession::start(self)
    }

    fn stop(&self, _blocking: bool) {
        // The session loop never stops itself through the arbiter, and stop
        // is always join-safe from the controller thread.
        let _ = SpeechRecognitionSession::stop(self);
    }
}

/// Everything the loop thread needs, bundled to keep the spawn readable.
struct LoopContext {
    source: Arc<dyn FrameSource>,
    decoder: Arc<Mutex<Box<dyn Decoder>>>,
    config: SessionConfig,
    running: Arc<AtomicBool>,
    shared: Arc<SessionShared>,
    on_sentence: SentenceCallback,
    on_end: SessionEndCallback,
    session_id: String,
}

fn session_loop_main(
    ctx: LoopContext,
    token: OwnershipToken,
    ack_tx: mpsc::Sender<Result<(), CaptureError>>,
) {
    let mut stream = match ctx.source.open() {
        Ok(stream) => stream,
        Err(err) => {
            drop(token);
            let _ = ack_tx.send(Err(err));
            return;
        }
    };
    let _ = ack_tx.send(Ok(()));

    let activation = Instant::now();
    // Initialized to activation time: a session that never hears speech
    // ends after one silence timeout instead of running to the hard cap.
    let mut last_speech = activation;
    let mut sequence: u64 = 0;
    info!(session = %ctx.session_id, "session capturing");

    let outcome = loop {
        if !ctx.running.load(Ordering::SeqCst) {
            debug!(session = %ctx.session_id, "session stopped externally");
            break None;
        }
        if activation.elapsed() > ctx.config.max_duration {
            info!(session = %ctx.session_id, "max session duration reached");
            break Some(SessionOutcome::MaxDuration);
        }

        match stream.read_frame(LOOP_READ_TIMEOUT) {
            Ok(frame) => match ctx.decoder.lock().unwrap().feed(&frame) {
                Ok(Decoded::Final(text)) => {
                    if !text.trim().is_empty() {
                        last_speech = Instant::now();
                        emit_sentence(&ctx, text.trim(), sequence);
                        sequence += 1;
                    }
                }
                Ok(Decoded::Partial(text)) => {
                    if !text.is_empty() {
                        last_speech = Instant::now();
                        *ctx.shared.last_partial.lock().unwrap() = text;
                    }
                }
                Ok(Decoded::Silence) => {}
                Err(err) => {
                    warn!(session = %ctx.session_id, error = %err, "decoder failed on frame, skipping");
                }
            },
            Err(FrameReadError::TimedOut) => {}
            Err(FrameReadError::Fatal(message)) => {
                warn!(session = %ctx.session_id, %message, "capture stream failed mid-session");
                break Some(SessionOutcome::Error(message));
            }
        }

        if last_speech.elapsed() > ctx.config.silence_timeout {
            info!(session = %ctx.session_id, "silence timeout reached");
            break Some(SessionOutcome::SilenceTimeout);
        }
    };

    // Flush whatever the decoder still holds — a boundary it never got to
    // report is still a sentence the user spoke.
    match ctx.decoder.lock().unwrap().finalize() {
        Ok(Some(text)) if !text.trim().is_empty() => {
            emit_sentence(&ctx, text.trim(), sequence);
        }
        Ok(_) => {}
        Err(err) => {
            warn!(session = %ctx.session_id, error = %err, "decoder finalize failed");
        }
    }

    drop(stream);
    drop(token);
    ctx.shared
        .phase
        .store(SessionPhase::Inactive as u8, Ordering::Release);

    if let Some(outcome) = outcome {
        *ctx.shared.outcome.lock().unwrap() = Some(outcome.clone());
        (ctx.on_end)(outcome);
    }
}

fn emit_sentence(ctx: &LoopContext, text: &str, sequence: u64) {
    let sentence = TranscriptSentence {
        text: text.to_string(),
        finalized_at: Utc::now(),
        sequence,
    };
    ctx.shared.sentences_sent.fetch_add(1, Ordering::SeqCst);
    info!(session = %ctx.session_id, sequence, text = %sentence.text, "sentence finalized");
    (ctx.on_sentence)(&ctx.session_id, sentence);
}
