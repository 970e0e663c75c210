use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A single log line with its timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEntry {
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

/// A set of entries sharing one label set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushStream {
    pub labels: BTreeMap<String, String>,
    pub entries: Vec<PushEntry>,
}

impl PushStream {
    pub fn new(labels: BTreeMap<String, String>) -> Self {
        Self {
            labels,
            entries: Vec::new(),
        }
    }

    pub fn with_entry(
        mut self,
        timestamp: DateTime<Utc>,
        line: impl Into<String>,
    ) -> Self {
        self.entries.push(PushEntry {
            timestamp,
            line: line.into(),
        });
        self
    }
}

#[derive(Serialize)]
pub(crate) struct PushRequest<'a> {
    streams: Vec<WireStream<'a>>,
}

#[derive(Serialize)]
struct WireStream<'a> {
    stream: &'a BTreeMap<String, String>,
    values: Vec<[String; 2]>,
}

impl<'a> PushRequest<'a> {
    pub(crate) fn from_streams(streams: &'a [PushStream]) -> Self {
        let streams = streams
            .iter()
            .map(|s| WireStream {
                stream: &s.labels,
                values: s
                    .entries
                    .iter()
                    .map(|e| [unix_nanos(&e.timestamp), e.line.clone()])
                    .collect(),
            })
            .collect();
        Self { streams }
    }
}

/// Loki expects nanoseconds since the epoch as a decimal string.
pub(crate) fn unix_nanos(ts: &DateTime<Utc>) -> String {
    ts.timestamp_nanos_opt()
        .unwrap_or_else(|| ts.timestamp_micros().saturating_mul(1_000))
        .to_string()
}
