//! Top-level session state machine.
//!
//! One async task owns every lifecycle decision: it consumes detector and
//! session events from a bounded channel strictly one at a time, so
//! transitions are serialized and the blocking stop paths always run on a
//! thread that is not a capture or detection loop. The detector and session
//! never call each other — all handoffs go through here.

pub mod state;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::arbiter;
use crate::audio::FrameSource;
use crate::config::OrchestratorConfig;
use crate::dispatch::{SentenceDispatcher, TranscriptTransport};
use crate::ownership::MicSlot;
use crate::recognize::{
    Decoder, SentenceCallback, SessionEndCallback, SessionOutcome, SpeechRecognitionSession,
};
use crate::wake::{Classifier, DetectionEvent, WakeCallback, WakeEvent, WakeWordDetector};

use state::{ControllerState, StateCell};

/// Event channel capacity. Detections and session ends are rare; a small
/// bound keeps a wedged controller from accumulating stale events.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Bound on waiting out in-flight deliveries during shutdown.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Events driving the controller, processed strictly one at a time in
/// arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    Detected(DetectionEvent),
    DetectorFatal { message: String },
    SessionEnded(SessionOutcome),
    Shutdown,
}

/// Cloneable handle for shutting the controller down from the host.
#[derive(Clone)]
pub struct ControllerHandle {
    events_tx: mpsc::Sender<ControllerEvent>,
}

impl ControllerHandle {
    /// Request an orderly shutdown. Resolves once the request is queued;
    /// the controller finishes its current transition first.
    pub async fn shutdown(&self) {
        let _ = self.events_tx.send(ControllerEvent::Shutdown).await;
    }
}

pub struct SessionController<T: TranscriptTransport + 'static> {
    detector: Arc<WakeWordDetector>,
    session: Arc<SpeechRecognitionSession>,
    dispatcher: SentenceDispatcher<T>,
    settle: Duration,
    state: StateCell,
    events_rx: mpsc::Receiver<ControllerEvent>,
    events_tx: mpsc::Sender<ControllerEvent>,
}

impl<T: TranscriptTransport + 'static> SessionController<T> {
    /// Wire the orchestrator together. Must be called from within a tokio
    /// runtime (the dispatcher captures the runtime handle).
    pub fn new(
        source: Arc<dyn FrameSource>,
        classifier: Box<dyn Classifier>,
        decoder: Box<dyn Decoder>,
        transport: T,
        config: &OrchestratorConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let slot = MicSlot::new();

        let dispatcher = SentenceDispatcher::new(transport, config.dispatch_config());

        // Detection callback: runs in the detection loop thread; forward
        // into the event channel without ever blocking it.
        let wake_tx = events_tx.clone();
        let on_wake: WakeCallback = Arc::new(move |event| {
            let forwarded = match event {
                WakeEvent::Detected(detection) => ControllerEvent::Detected(detection),
                WakeEvent::Fatal { message } => ControllerEvent::DetectorFatal { message },
            };
            if let Err(err) = wake_tx.try_send(forwarded) {
                warn!(error = %err, "controller event channel full, dropping wake event");
            }
        });
        let detector = Arc::new(WakeWordDetector::new(
            Arc::clone(&source),
            classifier,
            Arc::clone(&slot),
            config.detector_config(),
            on_wake,
        ));

        // Sentence callback: hand each finalized sentence to the dispatcher
        // the moment its boundary is reported.
        let sentence_dispatcher = dispatcher.clone();
        let on_sentence: SentenceCallback = Arc::new(move |session_id, sentence| {
            sentence_dispatcher.dispatch(session_id, sentence);
        });

        let end_tx = events_tx.clone();
        let on_end: SessionEndCallback = Arc::new(move |outcome| {
            if let Err(err) = end_tx.try_send(ControllerEvent::SessionEnded(outcome)) {
                warn!(error = %err, "controller event channel full, dropping session end");
            }
        });
        let session = Arc::new(SpeechRecognitionSession::new(
            source,
            decoder,
            slot,
            config.session_config(),
            on_sentence,
            on_end,
        ));

        Self {
            detector,
            session,
            dispatcher,
            settle: config.settle_interval(),
            state: StateCell::new(),
            events_rx,
            events_tx,
        }
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            events_tx: self.events_tx.clone(),
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state.current()
    }

    pub fn dispatcher(&self) -> &SentenceDispatcher<T> {
        &self.dispatcher
    }

    /// Run until shutdown. Returns an error only for the one unrecoverable
    /// condition: the wake-word detector cannot be (re)started.
    pub async fn run(mut self) -> anyhow::Result<()> {
        self.detector
            .start()
            .map_err(|e| anyhow::anyhow!("initial detector start failed: {e}"))?;
        info!("controller idle, wake-word detection running");

        while let Some(event) = self.events_rx.recv().await {
            match event {
                ControllerEvent::Shutdown => {
                    info!("shutdown requested");
                    break;
                }
                ControllerEvent::Detected(detection) => self.activate(detection).await?,
                ControllerEvent::SessionEnded(outcome) => self.resume(outcome).await?,
                ControllerEvent::DetectorFatal { message } => {
                    self.recover_detector(message).await?
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// IDLE -> ACTIVATING -> LISTENING, or back to IDLE on a missed
    /// activation.
    async fn activate(&self, detection: DetectionEvent) -> anyhow::Result<()> {
        if !self
            .state
            .transition(ControllerState::Idle, ControllerState::Activating)
        {
            debug!(
                label = %detection.label,
                state = %self.state.current(),
                "ignoring detection outside idle"
            );
            return Ok(());
        }
        info!(
            label = %detection.label,
            confidence = detection.confidence,
            "wake word accepted, activating session"
        );

        match arbiter::handoff(self.detector.as_ref(), self.session.as_ref(), self.settle).await {
            Ok(()) => {
                self.state.force(ControllerState::Listening);
                Ok(())
            }
            Err(err) => {
                // Missed activation: give the microphone back to the
                // detector and return to idle.
                warn!(error = %err, "session activation failed, resuming detection");
                self.restart_detector().await?;
                self.state.force(ControllerState::Idle);
                Ok(())
            }
        }
    }

    /// LISTENING -> RESUMING -> IDLE once the session ends itself.
    async fn resume(&self, outcome: SessionOutcome) -> anyhow::Result<()> {
        if !self
            .state
            .transition(ControllerState::Listening, ControllerState::Resuming)
        {
            debug!(
                state = %self.state.current(),
                "ignoring session end outside listening"
            );
            return Ok(());
        }

        if let Some(report) = self.session.stop() {
            info!(
                session = %report.session_id,
                sentences = report.sentences_sent,
                outcome = ?outcome,
                "session complete"
            );
        }

        arbiter::handoff(self.session.as_ref(), self.detector.as_ref(), self.settle)
            .await
            .map_err(|e| anyhow::anyhow!("detector restart failed after session: {e}"))?;
        self.state.force(ControllerState::Idle);
        info!("controller idle, wake-word detection running");
        Ok(())
    }

    /// The detector's capture stream died while idle. Clean up the
    /// half-stopped detector and bring it back; failing that is fatal.
    async fn recover_detector(&self, message: String) -> anyhow::Result<()> {
        if self.state.current() != ControllerState::Idle {
            debug!(%message, "ignoring detector fatal outside idle");
            return Ok(());
        }
        warn!(%message, "detector reported fatal capture failure, restarting");
        self.restart_detector().await
    }

    async fn restart_detector(&self) -> anyhow::Result<()> {
        self.detector.stop(true);
        tokio::time::sleep(self.settle).await;
        self.detector
            .start()
            .map_err(|e| anyhow::anyhow!("detector restart failed: {e}"))
    }

    async fn shutdown(&self) {
        match self.state.current() {
            ControllerState::Listening | ControllerState::Activating => {
                let _ = self.session.stop();
            }
            _ => {}
        }
        self.detector.stop(true);
        if !self.dispatcher.wait_idle(SHUTDOWN_DRAIN_TIMEOUT).await {
            warn!("shutting down with deliveries still in flight");
        }
        info!("controller shut down");
    }
}
