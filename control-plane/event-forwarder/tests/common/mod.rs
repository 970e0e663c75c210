#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use event_forwarder::delivery::{BackoffPolicy, DeliveryClient, LokiTransport};
use event_forwarder::event::{ChangeEvent, EventRef, EventType, SubjectRef};
use event_forwarder::source::{EventSource, FetchError};
use kube::Client;
use loki_push::PUSH_PATH;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

/// In-memory notification source with an optional hook run after each fetch.
#[derive(Default)]
pub struct MemorySource {
    pub events: HashMap<EventRef, ChangeEvent>,
    pub fetches: AtomicU32,
    pub after_fetch: Option<Box<dyn Fn() + Send + Sync>>,
}

impl MemorySource {
    pub fn with(events: impl IntoIterator<Item = ChangeEvent>) -> Self {
        Self {
            events: events.into_iter().map(|e| (e.id.clone(), e)).collect(),
            ..Default::default()
        }
    }

    pub fn fetch_count(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventSource for MemorySource {
    async fn fetch(&self, id: &EventRef) -> Result<Option<ChangeEvent>, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = &self.after_fetch {
            hook();
        }
        Ok(self.events.get(id).cloned())
    }
}

pub fn observed_at() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

pub fn killing_event() -> ChangeEvent {
    ChangeEvent {
        id: EventRef::new("kube-system", "foo.17a2b3c4d5e6f"),
        subject: SubjectRef {
            kind: "Pod".into(),
            name: "foo".into(),
            namespace: "kube-system".into(),
        },
        reason: "Killing".into(),
        message: "stopping container".into(),
        event_type: EventType::Warning,
        raw_type: "Warning".into(),
        timestamp: observed_at(),
    }
}

pub fn fast_policy(max_attempts: u32) -> BackoffPolicy {
    BackoffPolicy {
        base: Duration::from_millis(10),
        multiplier: 2.0,
        max_delay: Duration::from_millis(50),
        max_attempts,
    }
}

/// Loki double answering `/ready` with 200.
pub async fn ready_loki() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ready"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ready"))
        .mount(&server)
        .await;
    server
}

pub fn push_url(server: &MockServer) -> String {
    format!("{}{}", server.uri(), PUSH_PATH)
}

pub async fn connect(
    server: &MockServer,
    max_attempts: u32,
) -> Arc<DeliveryClient<LokiTransport>> {
    let transport =
        LokiTransport::from_url(&push_url(server), Duration::from_secs(2))
            .expect("transport");
    Arc::new(
        DeliveryClient::connect(transport, fast_policy(max_attempts))
            .await
            .expect("sink reachable"),
    )
}

pub async fn push_requests(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == PUSH_PATH)
        .count()
}

/// Kube client from the ambient kubeconfig, with the rustls provider pinned
/// the same way `main` does.
pub async fn kube_client() -> Client {
    let _ = rustls::crypto::CryptoProvider::install_default(
        rustls::crypto::aws_lc_rs::default_provider(),
    );
    Client::try_default().await.expect("kube client")
}
