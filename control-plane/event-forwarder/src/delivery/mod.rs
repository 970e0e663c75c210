//! Delivery of log records to the sink.
//!
//! [`DeliveryClient`] owns the transport for the lifetime of the process and
//! is shared by every reconcile. It retries transient send failures with
//! exponential backoff, classifies permanent rejections, and mirrors every
//! failed delivery onto an error channel so alerting can hang off it without
//! touching the reconciler.

mod backoff;
mod loki;

pub use backoff::BackoffPolicy;
pub use loki::{LEVEL_LABEL, LokiTransport};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};

use crate::event::LogRecord;

const ERROR_CHANNEL_CAPACITY: usize = 256;

/// Failure of a single send, as classified by the transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("transient send failure: {0}")]
    Transient(String),

    #[error("sink rejected record: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("sink unreachable: {0}")]
    Unreachable(String),

    #[error("delivery failed after {attempts} attempt(s): {reason}")]
    Retryable { attempts: u32, reason: String },

    #[error("record permanently rejected: {0}")]
    Fatal(String),

    #[error("delivery client is closed")]
    Closed,
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Retryable { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub attempts: u32,
}

/// Wire-level access to the sink.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, record: &LogRecord) -> Result<(), SendError>;

    /// Cheap reachability check used before accepting any work.
    async fn probe(&self) -> Result<(), SendError>;

    /// Flush and release whatever the transport holds.
    async fn shutdown(&self) {}
}

/// What the reconciler needs from a delivery client.
#[async_trait]
pub trait Deliver: Send + Sync {
    async fn deliver(&self, record: LogRecord) -> Result<Ack, DeliveryError>;
}

pub struct DeliveryClient<T: Transport> {
    transport: RwLock<Option<T>>,
    policy: BackoffPolicy,
    errors_tx: flume::Sender<DeliveryError>,
    errors_rx: flume::Receiver<DeliveryError>,
}

impl<T: Transport> DeliveryClient<T> {
    /// Probe the sink and build a client. An unreachable sink is an error the
    /// caller is expected to treat as fatal.
    pub async fn connect(
        transport: T,
        policy: BackoffPolicy,
    ) -> Result<Self, DeliveryError> {
        transport
            .probe()
            .await
            .map_err(|e| DeliveryError::Unreachable(e.to_string()))?;
        info!(max_attempts = policy.max_attempts(), "sink reachable");
        let (errors_tx, errors_rx) = flume::bounded(ERROR_CHANNEL_CAPACITY);
        Ok(Self {
            transport: RwLock::new(Some(transport)),
            policy,
            errors_tx,
            errors_rx,
        })
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Receiving side of the error-reporting channel.
    pub fn errors(&self) -> flume::Receiver<DeliveryError> {
        self.errors_rx.clone()
    }

    /// Wait for in-flight deliveries, then release the transport. Later
    /// deliveries fail with [`DeliveryError::Closed`].
    pub async fn close(&self) {
        let taken = self.transport.write().await.take();
        if let Some(transport) = taken {
            transport.shutdown().await;
            info!("delivery client closed");
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.transport.read().await.is_none()
    }

    fn report(&self, err: DeliveryError) -> DeliveryError {
        if let Err(flume::TrySendError::Full(_)) =
            self.errors_tx.try_send(err.clone())
        {
            debug!(error = %err, "delivery error channel full; report dropped");
        }
        err
    }
}

#[async_trait]
impl<T: Transport> Deliver for DeliveryClient<T> {
    async fn deliver(&self, record: LogRecord) -> Result<Ack, DeliveryError> {
        let guard = self.transport.read().await;
        let Some(transport) = guard.as_ref() else {
            return Err(self.report(DeliveryError::Closed));
        };

        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match transport.send(&record).await {
                Ok(()) => {
                    trace!(attempt, "record delivered");
                    return Ok(Ack { attempts: attempt });
                }
                Err(SendError::Rejected(reason)) => {
                    warn!(attempt, error = %reason, "record rejected by sink");
                    return Err(self.report(DeliveryError::Fatal(reason)));
                }
                Err(SendError::Transient(reason)) => {
                    if attempt >= max_attempts {
                        warn!(attempt, error = %reason, "delivery retries exhausted");
                        return Err(self.report(DeliveryError::Retryable {
                            attempts: attempt,
                            reason,
                        }));
                    }
                    let backoff = self.policy.delay_for(attempt - 1);
                    debug!(attempt, backoff_ms = backoff.as_millis() as u64, error = %reason, "delivery retry");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}
