//! Microphone handoff protocol.
//!
//! Encodes the one legal way to move the device between the wake-word
//! detector and the recognition session. The arbiter holds no state — it
//! is a protocol over two consumer handles, not a resource holder.

use std::time::Duration;

use tracing::{debug, info};

use crate::audio::CaptureError;
use crate::ownership::AcquireError;

/// Lifecycle face the arbiter coordinates. Implemented by the wake-word
/// detector and the recognition session.
pub trait AudioConsumer: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Begin capturing. Fails when the microphone is unavailable.
    fn start(&self) -> Result<(), StartError>;

    /// Stop capturing. `blocking` requests a join of the consumer's loop;
    /// it must be false whenever the caller could be that loop itself.
    fn stop(&self, blocking: bool);
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StartError {
    #[error("microphone unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("already running")]
    AlreadyRunning,
    #[error("capture start failed: {0}")]
    CaptureFailed(String),
}

impl From<AcquireError> for StartError {
    fn from(err: AcquireError) -> Self {
        StartError::DeviceUnavailable(err.to_string())
    }
}

impl From<CaptureError> for StartError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::NoDevice | CaptureError::DeviceUnavailable(_) => {
                StartError::DeviceUnavailable(err.to_string())
            }
            CaptureError::StreamBuild(_) => StartError::CaptureFailed(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HandoffError {
    #[error("failed to start {to}: {source}")]
    StartFailed {
        to: &'static str,
        #[source]
        source: StartError,
    },
}

/// Transfer the microphone from one consumer to the other.
///
/// Stops `from` without joining (safe even when invoked on behalf of a
/// callback running inside `from`'s own loop), sleeps a fixed settle
/// interval, then starts `to`. Closing one audio backend and opening
/// another on the same physical device is not instantaneous at the driver
/// level; skipping the settle causes intermittent device-busy failures.
pub async fn handoff(
    from: &dyn AudioConsumer,
    to: &dyn AudioConsumer,
    settle: Duration,
) -> Result<(), HandoffError> {
    debug!(
        from = from.name(),
        to = to.name(),
        settle_ms = settle.as_millis() as u64,
        "handoff starting"
    );

    from.stop(false);
    tokio::time::sleep(settle).await;
    to.start().map_err(|source| HandoffError::StartFailed {
        to: to.name(),
        source,
    })?;

    info!(from = from.name(), to = to.name(), "microphone handed off");
    Ok(())
}
