//! Message envelope: immutable payload + headers (+ sequence details).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{CorrelationId, MessageId};

/// Header mapping. Ordered so that logs and debug output are stable.
pub type Headers = BTreeMap<String, serde_json::Value>;

/// Position of a message inside a split sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequenceDetails {
    pub correlation_id: CorrelationId,

    /// 1-indexed position in the original split order.
    pub sequence_number: u32,

    pub sequence_size: u32,
}

/// A message travelling through a flow.
///
/// Messages are never mutated in place: the `with_*` methods consume `self`
/// while a message is being built, and `map_payload` / `with_payload` derive a
/// new message (new id, same headers and sequence details).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message<T = serde_json::Value> {
    id: MessageId,
    payload: T,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    headers: Headers,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    sequence: Option<SequenceDetails>,

    timestamp: DateTime<Utc>,
}

impl<T> Message<T> {
    pub fn new(payload: T) -> Self {
        Self {
            id: MessageId::generate(),
            payload,
            headers: Headers::new(),
            sequence: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Copy every header of `headers` that is not already set.
    pub fn with_headers(mut self, headers: &Headers) -> Self {
        for (k, v) in headers {
            self.headers.entry(k.clone()).or_insert_with(|| v.clone());
        }
        self
    }

    pub fn with_sequence(mut self, sequence: SequenceDetails) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Derive a new message carrying `payload`, keeping headers and sequence.
    pub fn with_payload<U>(&self, payload: U) -> Message<U> {
        Message {
            id: MessageId::generate(),
            payload,
            headers: self.headers.clone(),
            sequence: self.sequence,
            timestamp: Utc::now(),
        }
    }

    pub fn map_payload<U>(self, f: impl FnOnce(T) -> U) -> Message<U> {
        Message {
            id: MessageId::generate(),
            payload: f(self.payload),
            headers: self.headers,
            sequence: self.sequence,
            timestamp: Utc::now(),
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn into_payload(self) -> T {
        self.payload
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&serde_json::Value> {
        self.headers.get(key)
    }

    pub fn sequence(&self) -> Option<&SequenceDetails> {
        self.sequence.as_ref()
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.sequence.map(|s| s.correlation_id)
    }

    /// 0 when the message is not part of a sequence.
    pub fn sequence_number(&self) -> u32 {
        self.sequence.map_or(0, |s| s.sequence_number)
    }

    /// 0 when the message is not part of a sequence.
    pub fn sequence_size(&self) -> u32 {
        self.sequence.map_or(0, |s| s.sequence_size)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}
