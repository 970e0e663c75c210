use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Event;
use kube::{Api, Client};
use tracing::trace;

use super::{EventSource, FetchError};
use crate::event::{ChangeEvent, EventRef, EventType, SubjectRef};

/// Reads `core/v1` events straight from the API server.
#[derive(Clone)]
pub struct KubeEventSource {
    client: Client,
}

impl KubeEventSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventSource for KubeEventSource {
    async fn fetch(&self, id: &EventRef) -> Result<Option<ChangeEvent>, FetchError> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), &id.namespace);
        let found = api.get_opt(&id.name).await.map_err(|e| {
            FetchError::Unavailable {
                id: id.to_string(),
                reason: e.to_string(),
            }
        })?;
        trace!(event = %id, found = found.is_some(), "fetched event");
        Ok(found.map(|ev| change_event_from_k8s(id.clone(), &ev)))
    }
}

/// Convert an API event. Missing fields become empty strings.
///
/// Timestamp preference: `eventTime`, `lastTimestamp`, `firstTimestamp`,
/// `metadata.creationTimestamp`, then the current time.
pub fn change_event_from_k8s(id: EventRef, ev: &Event) -> ChangeEvent {
    let obj = &ev.involved_object;
    let timestamp = ev
        .event_time
        .as_ref()
        .map(|t| t.0)
        .or_else(|| ev.last_timestamp.as_ref().map(|t| t.0))
        .or_else(|| ev.first_timestamp.as_ref().map(|t| t.0))
        .or_else(|| ev.metadata.creation_timestamp.as_ref().map(|t| t.0))
        .unwrap_or_else(Utc::now);

    let raw_type = ev.type_.clone().unwrap_or_default();
    ChangeEvent {
        id,
        subject: SubjectRef {
            kind: obj.kind.clone().unwrap_or_default(),
            name: obj.name.clone().unwrap_or_default(),
            namespace: obj.namespace.clone().unwrap_or_default(),
        },
        reason: ev.reason.clone().unwrap_or_default(),
        message: ev.message.clone().unwrap_or_default(),
        event_type: EventType::parse(&raw_type),
        raw_type,
        timestamp,
    }
}
