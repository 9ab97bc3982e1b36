//! Correlation group: the parts received so far for one correlation id.

use std::collections::BTreeMap;

use tokio::time::Instant;

use crate::domain::{CorrelationId, Message};

/// Design:
/// - `received` is keyed by sequence number, so iteration order is the
///   original split order no matter how parts arrived.
/// - A group lives in the aggregator's store until it is released or reaped;
///   both paths remove it under the same lock.
#[derive(Debug, Clone)]
pub struct CorrelationGroup {
    pub correlation_id: CorrelationId,
    pub expected_size: u32,
    received: BTreeMap<u32, Message>,
    pub created_at: Instant,
    pub deadline: Instant,
    pub released: bool,
}

impl CorrelationGroup {
    pub fn new(correlation_id: CorrelationId, expected_size: u32, created_at: Instant, deadline: Instant) -> Self {
        Self {
            correlation_id,
            expected_size,
            received: BTreeMap::new(),
            created_at,
            deadline,
            released: false,
        }
    }

    /// Does `message` belong to this group's sequence: same size, and a
    /// sequence number in `1..=expected_size`?
    pub fn fits(&self, message: &Message) -> bool {
        let seq = message.sequence_number();
        message.sequence_size().max(1) == self.expected_size && (1..=self.expected_size).contains(&seq)
    }

    /// Add a part. Returns `false` for a duplicate sequence number.
    pub fn add(&mut self, message: Message) -> bool {
        let seq = message.sequence_number();
        if self.received.contains_key(&seq) {
            return false;
        }
        self.received.insert(seq, message);
        true
    }

    pub fn received_count(&self) -> u32 {
        self.received.len() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.received_count() == self.expected_size
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Mark released and hand out the parts in sequence order.
    pub fn release(mut self) -> Vec<Message> {
        self.released = true;
        std::mem::take(&mut self.received).into_values().collect()
    }
}
