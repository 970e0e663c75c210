use std::sync::Arc;

use tracing::{debug, error, instrument, warn};

use crate::delivery::Deliver;
use crate::event::EventRef;
use crate::labels::{CommonLabels, build_record};
use crate::leader::Leadership;
use crate::metrics::{ForwarderMetrics, forwarder_metrics};
use crate::source::EventSource;

/// Result of processing one event reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Delivered { attempts: u32 },
    /// The event vanished between notification and fetch.
    Skipped,
    /// This replica is not the leader; nothing was read or sent.
    NotLeader,
    /// Fetch or delivery hiccup; the notification source is expected to
    /// redeliver.
    TransientFailure(String),
    /// The sink rejected the record. Logged and dropped.
    PermanentFailure(String),
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Delivered { .. } => "delivered",
            Outcome::Skipped => "skipped",
            Outcome::NotLeader => "not_leader",
            Outcome::TransientFailure(_) => "transient_failure",
            Outcome::PermanentFailure(_) => "permanent_failure",
        }
    }
}

/// Turns one event reference into at most one delivered log record.
///
/// Holds no per-event state; every call stands alone. Leadership is checked
/// once, on entry. Losing it mid-call does not stop the current delivery, so
/// a handover can produce a duplicate record, which at-least-once delivery
/// tolerates.
#[derive(Clone)]
pub struct Reconciler {
    source: Arc<dyn EventSource>,
    delivery: Arc<dyn Deliver>,
    leadership: Arc<dyn Leadership>,
    common_labels: CommonLabels,
    metrics: ForwarderMetrics,
}

impl Reconciler {
    pub fn new(
        source: Arc<dyn EventSource>,
        delivery: Arc<dyn Deliver>,
        leadership: Arc<dyn Leadership>,
        common_labels: CommonLabels,
    ) -> Self {
        Self {
            source,
            delivery,
            leadership,
            common_labels,
            metrics: forwarder_metrics(),
        }
    }

    #[instrument(level = "debug", skip(self), fields(event = %id))]
    pub async fn process(&self, id: &EventRef) -> Outcome {
        let outcome = self.run(id).await;
        self.metrics.record_outcome(outcome.as_str());
        match &outcome {
            Outcome::Delivered { attempts } => {
                debug!(%id, attempts, "event forwarded")
            }
            Outcome::Skipped => debug!(%id, "event gone before fetch; skipped"),
            Outcome::NotLeader => debug!(%id, "not leader; skipped"),
            Outcome::TransientFailure(reason) => {
                warn!(%id, error = %reason, "transient failure; awaiting redelivery")
            }
            Outcome::PermanentFailure(reason) => {
                error!(%id, error = %reason, "event dropped")
            }
        }
        outcome
    }

    async fn run(&self, id: &EventRef) -> Outcome {
        if !self.leadership.is_leader() {
            return Outcome::NotLeader;
        }

        let event = match self.source.fetch(id).await {
            Ok(Some(event)) => event,
            Ok(None) => return Outcome::Skipped,
            Err(e) => return Outcome::TransientFailure(e.to_string()),
        };

        let record = build_record(&event, &self.common_labels);
        match self.delivery.deliver(record).await {
            Ok(ack) => Outcome::Delivered {
                attempts: ack.attempts,
            },
            Err(e) if e.is_retryable() => Outcome::TransientFailure(e.to_string()),
            Err(e) => Outcome::PermanentFailure(e.to_string()),
        }
    }
}
