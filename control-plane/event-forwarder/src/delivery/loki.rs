use std::time::Duration;

use async_trait::async_trait;
use loki_push::{LokiClient, PushError, PushStream};

use super::{SendError, Transport};
use crate::event::LogRecord;

/// Stream label carrying the record severity.
pub const LEVEL_LABEL: &str = "level";

/// Pushes each record as its own Loki stream.
#[derive(Clone, Debug)]
pub struct LokiTransport {
    client: LokiClient,
}

impl LokiTransport {
    pub fn new(client: LokiClient) -> Self {
        Self { client }
    }

    pub fn from_url(push_url: &str, timeout: Duration) -> Result<Self, PushError> {
        Ok(Self::new(LokiClient::new(push_url, timeout)?))
    }

    pub fn push_url(&self) -> &str {
        self.client.push_url()
    }
}

pub(crate) fn to_stream(record: &LogRecord) -> PushStream {
    let mut labels = record.labels.clone();
    labels.insert(LEVEL_LABEL.to_string(), record.severity.as_str().to_string());
    PushStream::new(labels).with_entry(record.timestamp, record.message.clone())
}

fn classify(e: PushError) -> SendError {
    if e.is_retryable() {
        SendError::Transient(e.to_string())
    } else {
        SendError::Rejected(e.to_string())
    }
}

#[async_trait]
impl Transport for LokiTransport {
    async fn send(&self, record: &LogRecord) -> Result<(), SendError> {
        self.client.push(&[to_stream(record)]).await.map_err(classify)
    }

    async fn probe(&self) -> Result<(), SendError> {
        self.client.ready().await.map_err(classify)
    }
}
