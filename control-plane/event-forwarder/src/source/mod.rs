//! Where change events are read from.

mod k8s;

pub use k8s::{KubeEventSource, change_event_from_k8s};

use async_trait::async_trait;

use crate::event::{ChangeEvent, EventRef};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("failed to fetch event {id}: {reason}")]
    Unavailable { id: String, reason: String },
}

/// Read access to events by identifier.
///
/// `Ok(None)` means the event no longer exists upstream, which is an
/// expected race between notification and fetch.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn fetch(&self, id: &EventRef) -> Result<Option<ChangeEvent>, FetchError>;
}
