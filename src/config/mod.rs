//! Configuration surface.
//!
//! The orchestrator never reads files; hosts deserialize (or construct) an
//! `OrchestratorConfig` and pass it in. Millisecond integers sit at the
//! serde boundary, `Duration` accessors face the modules. Every field has a
//! default, so a partial JSON document configures only what it names.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dispatch::DispatchConfig;
use crate::recognize::SessionConfig;
use crate::wake::WakeDetectorConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Minimum classifier confidence to accept a detection.
    pub detection_threshold: f32,
    /// Minimum spacing between accepted detections of one label (ms).
    pub cooldown_window_ms: u64,
    /// Detector frame queue capacity, in frames (~80 ms each).
    pub frame_queue_capacity: usize,
    /// End a session after this much time without speech (ms).
    pub silence_timeout_ms: u64,
    /// Hard cap on session length (ms).
    pub max_duration_ms: u64,
    /// Pause between releasing one audio backend and opening the next (ms).
    pub settle_interval_ms: u64,
    /// Downstream processor endpoint.
    pub endpoint: String,
    /// Deliver sentences downstream; when false they are only logged.
    pub dispatch_enabled: bool,
    /// Delivery attempts per sentence.
    pub dispatch_attempts: u32,
    /// Base backoff delay, doubled per retry (ms).
    pub dispatch_backoff_ms: u64,
    /// Per-attempt transport timeout (ms).
    pub dispatch_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            detection_threshold: 0.5,
            cooldown_window_ms: 2000,
            frame_queue_capacity: 6,
            silence_timeout_ms: 3000,
            max_duration_ms: 30_000,
            settle_interval_ms: 300,
            endpoint: "http://localhost:8000/process".to_string(),
            dispatch_enabled: true,
            dispatch_attempts: 3,
            dispatch_backoff_ms: 1000,
            dispatch_timeout_ms: 5000,
        }
    }
}

impl OrchestratorConfig {
    pub fn detector_config(&self) -> WakeDetectorConfig {
        WakeDetectorConfig {
            threshold: self.detection_threshold,
            cooldown_window: Duration::from_millis(self.cooldown_window_ms),
            queue_capacity: self.frame_queue_capacity,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            silence_timeout: Duration::from_millis(self.silence_timeout_ms),
            max_duration: Duration::from_millis(self.max_duration_ms),
        }
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            endpoint: self.endpoint.clone(),
            enabled: self.dispatch_enabled,
            attempts: self.dispatch_attempts,
            backoff_base: Duration::from_millis(self.dispatch_backoff_ms),
            request_timeout: Duration::from_millis(self.dispatch_timeout_ms),
        }
    }

    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_interval_ms)
    }
}
