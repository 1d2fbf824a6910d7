//! Sentence delivery to the downstream processor.
//!
//! Every finalized sentence is delivered independently: one tokio task per
//! sentence, bounded retries with exponential backoff, and no path by which
//! a slow or failing delivery can block continued audio capture. Delivery
//! completion order across sentences is best-effort; the sequence numbers
//! carry the capture order.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::recognize::TranscriptSentence;

/// Delivery failure classification. Transient failures are retried with
/// backoff; permanent ones are logged and the sentence is dropped.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeliveryError {
    #[error("transient delivery failure: {0}")]
    Transient(String),
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

/// Wire request for one finalized sentence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentenceRequest {
    pub transcript: String,
    /// RFC 3339 finalization time.
    pub timestamp: String,
    pub sequence: u64,
    pub session_id: String,
}

/// Wire response from the downstream processor.
#[derive(Debug, Clone, Deserialize)]
pub struct SentenceResponse {
    pub status: String,
    #[serde(default)]
    pub detail: Option<String>,
}

/// Transport collaborator: one delivery attempt, classified on failure.
pub trait TranscriptTransport: Send + Sync {
    fn deliver(
        &self,
        request: &SentenceRequest,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send;
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Downstream processor endpoint.
    pub endpoint: String,
    /// When false, sentences are logged and dropped locally.
    pub enabled: bool,
    /// Total attempts per sentence.
    pub attempts: u32,
    /// Base backoff delay, doubled on each retry.
    pub backoff_base: Duration,
    /// Per-attempt transport timeout.
    pub request_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8000/process".to_string(),
            enabled: true,
            attempts: 3,
            backoff_base: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Fire-and-forget sentence delivery.
///
/// Cloneable so the session's sentence callback can hold one; clones share
/// the transport and the in-flight counter.
pub struct SentenceDispatcher<T: TranscriptTransport + 'static> {
    transport: Arc<T>,
    config: DispatchConfig,
    runtime: tokio::runtime::Handle,
    inflight: Arc<AtomicUsize>,
}

impl<T: TranscriptTransport + 'static> Clone for SentenceDispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            config: self.config.clone(),
            runtime: self.runtime.clone(),
            inflight: Arc::clone(&self.inflight),
        }
    }
}

impl<T: TranscriptTransport + 'static> SentenceDispatcher<T> {
    /// Must be called from within a tokio runtime: delivery tasks are
    /// spawned onto the current runtime, while `dispatch` itself may later
    /// be called from plain threads (the session loop).
    pub fn new(transport: T, config: DispatchConfig) -> Self {
        Self {
            transport: Arc::new(transport),
            config,
            runtime: tokio::runtime::Handle::current(),
            inflight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Deliveries currently in progress.
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Deliver one sentence in the background and return immediately.
    pub fn dispatch(&self, session_id: &str, sentence: TranscriptSentence) {
        if !self.config.enabled {
            debug!(
                sequence = sentence.sequence,
                text = %sentence.text,
                "dispatch disabled, dropping sentence locally"
            );
            return;
        }

        let request = SentenceRequest {
            transcript: sentence.text,
            timestamp: sentence.finalized_at.to_rfc3339(),
            sequence: sentence.sequence,
            session_id: session_id.to_string(),
        };
        let transport = Arc::clone(&self.transport);
        let config = self.config.clone();
        let inflight = Arc::clone(&self.inflight);
        inflight.fetch_add(1, Ordering::SeqCst);

        self.runtime.spawn(async move {
            deliver_with_retry(transport.as_ref(), &config, &request).await;
            inflight.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Wait until every in-flight delivery finishes, up to `timeout`.
    /// Returns false when deliveries were still pending at the deadline.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.inflight() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }
}

/// Retry loop for one sentence: up to `config.attempts` tries, backoff
/// doubling from `backoff_base`. Failures never propagate — the session
/// must keep capturing no matter what happens here.
async fn deliver_with_retry<T: TranscriptTransport>(
    transport: &T,
    config: &DispatchConfig,
    request: &SentenceRequest,
) {
    let mut attempt = 0u32;
    loop {
        match transport.deliver(request).await {
            Ok(()) => {
                info!(
                    sequence = request.sequence,
                    attempt = attempt + 1,
                    "sentence delivered"
                );
                return;
            }
            Err(DeliveryError::Permanent(reason)) => {
                warn!(
                    sequence = request.sequence,
                    %reason,
                    "permanent delivery failure, dropping sentence"
                );
                return;
            }
            Err(DeliveryError::Transient(reason)) => {
                attempt += 1;
                if attempt >= config.attempts {
                    warn!(
                        sequence = request.sequence,
                        attempts = attempt,
                        %reason,
                        "delivery retries exhausted, dropping sentence"
                    );
                    return;
                }
                let delay = config.backoff_base * 2u32.pow(attempt - 1);
                warn!(
                    sequence = request.sequence,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    %reason,
                    "transient delivery failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP transport
// ---------------------------------------------------------------------------

/// Production transport: POST the sentence as JSON, read `{status, ...}`.
pub struct HttpTransport {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: &DispatchConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            endpoint: config.endpoint.clone(),
            client,
        })
    }
}

impl TranscriptTransport for HttpTransport {
    fn deliver(
        &self,
        request: &SentenceRequest,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send {
        async move {
            let resp = self
                .client
                .post(&self.endpoint)
                .json(request)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() || e.is_connect() {
                        DeliveryError::Transient(e.to_string())
                    } else {
                        DeliveryError::Permanent(e.to_string())
                    }
                })?;

            let status = resp.status();
            if status.is_server_error() {
                return Err(DeliveryError::Transient(format!("server returned {status}")));
            }
            if !status.is_success() {
                return Err(DeliveryError::Permanent(format!("server returned {status}")));
            }

            let body: SentenceResponse = resp
                .json()
                .await
                .map_err(|e| DeliveryError::Permanent(format!("malformed response: {e}")))?;

            if body.status != "success" {
                let detail = body.detail.unwrap_or(body.status);
                return Err(DeliveryError::Permanent(format!(
                    "processor rejected sentence: {detail}"
                )));
            }

            Ok(())
        }
    }
}
