//! Observability - 集計カウンタのビュー

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatorStats {
    pub open_groups: usize,
    pub released: u64,
    pub expired: u64,
    pub late_discarded: u64,
    pub duplicates_discarded: u64,

    /// Parts whose sequence number or size does not match their group.
    pub invalid_discarded: u64,
}

/// Point-in-time view of a running flow, for status output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowStatus {
    pub name: String,

    /// Pending messages per channel.
    pub channels: BTreeMap<String, usize>,
}
