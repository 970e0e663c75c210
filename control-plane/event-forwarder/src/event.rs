use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

/// Label key → value. Ordered so records serialize deterministically.
pub type LabelSet = BTreeMap<String, String>;

/// Stable identifier of an event object: namespace plus name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventRef {
    pub namespace: String,
    pub name: String,
}

impl EventRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for EventRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The object an event is about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectRef {
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    /// Only the exact string `Normal` is normal; anything else, including an
    /// empty or unknown type, is treated as a warning.
    pub fn parse(s: &str) -> Self {
        match s {
            "Normal" => EventType::Normal,
            _ => EventType::Warning,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub id: EventRef,
    pub subject: SubjectRef,
    pub reason: String,
    pub message: String,
    pub event_type: EventType,
    /// The type string exactly as reported upstream, used for the `type` label.
    pub raw_type: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warn,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warn => "warn",
        }
    }
}

impl From<EventType> for Severity {
    fn from(t: EventType) -> Self {
        match t {
            EventType::Normal => Severity::Info,
            EventType::Warning => Severity::Warn,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What gets handed to the delivery client. Built once per event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub labels: LabelSet,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}
