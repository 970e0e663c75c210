use std::collections::BTreeMap;
use std::sync::Arc;

use crate::event::{ChangeEvent, LabelSet, LogRecord, Severity};

pub const LABEL_NAMESPACE: &str = "namespace";
pub const LABEL_REASON: &str = "reason";
pub const LABEL_TYPE: &str = "type";
/// Subject name key. Kept as `pod` for every subject kind so existing
/// queries keep matching.
pub const LABEL_SUBJECT: &str = "pod";

pub const CORE_LABELS: [&str; 4] =
    [LABEL_NAMESPACE, LABEL_REASON, LABEL_TYPE, LABEL_SUBJECT];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LabelsError {
    #[error("malformed label entry '{0}', expected key=value")]
    MalformedEntry(String),

    #[error("invalid label name '{0}'")]
    InvalidName(String),
}

/// Derive the core labels and severity of an event. Total and pure.
pub fn derive(event: &ChangeEvent) -> (LabelSet, Severity) {
    let labels = BTreeMap::from([
        (LABEL_NAMESPACE.to_string(), event.subject.namespace.clone()),
        (LABEL_REASON.to_string(), event.reason.clone()),
        (LABEL_TYPE.to_string(), event.raw_type.clone()),
        (LABEL_SUBJECT.to_string(), event.subject.name.clone()),
    ]);
    (labels, Severity::from(event.event_type))
}

/// Process-wide labels attached to every record. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommonLabels(Arc<LabelSet>);

impl CommonLabels {
    pub fn new(labels: LabelSet) -> Result<Self, LabelsError> {
        if let Some(bad) = labels.keys().find(|k| !is_valid_label_name(k)) {
            return Err(LabelsError::InvalidName(bad.clone()));
        }
        Ok(Self(Arc::new(labels)))
    }

    /// Parse `key=value,key=value`. Blank entries are ignored.
    pub fn parse(s: &str) -> Result<Self, LabelsError> {
        let mut labels = LabelSet::new();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (k, v) = entry
                .split_once('=')
                .ok_or_else(|| LabelsError::MalformedEntry(entry.to_string()))?;
            labels.insert(k.trim().to_string(), v.trim().to_string());
        }
        Self::new(labels)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Overlay core labels on top of the common ones; core keys always win.
pub fn merge(core: LabelSet, common: &CommonLabels) -> LabelSet {
    let mut merged: LabelSet = common
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    merged.extend(core);
    merged
}

pub fn build_record(event: &ChangeEvent, common: &CommonLabels) -> LogRecord {
    let (core, severity) = derive(event);
    LogRecord {
        labels: merge(core, common),
        severity,
        message: event.message.clone(),
        timestamp: event.timestamp,
    }
}
