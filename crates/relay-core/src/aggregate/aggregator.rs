//! Aggregator: correlate split parts back into one message.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::group::CorrelationGroup;
use crate::channel::Channel;
use crate::domain::{CorrelationId, FlowError, GroupEvent, Message};
use crate::impls::NoopEventSink;
use crate::observability::AggregatorStats;
use crate::ports::{Clock, EventSink, SystemClock};

/// Header set on a message released by the reaper before all parts arrived.
pub const PARTIAL_HEADER: &str = "relay_partial";

/// Header carrying the correlation id on a combined message.
pub const CORRELATION_HEADER: &str = "relay_correlation_id";

/// Header on a message sent to the discard channel: why it was dropped.
pub const DISCARD_REASON_HEADER: &str = "relay_discard_reason";

/// Combines the parts of a group (in sequence order) into one message.
pub type CombineFn = Arc<dyn Fn(CorrelationId, Vec<Message>) -> Result<Message, FlowError> + Send + Sync>;

/// Default combiner: a JSON array of the part payloads, in sequence order.
/// Headers come from the first part.
pub fn collect_payloads() -> CombineFn {
    Arc::new(|correlation_id: CorrelationId, parts: Vec<Message>| {
        let headers = parts.first().map(|m| m.headers().clone()).unwrap_or_default();
        let payloads = parts.into_iter().map(Message::into_payload).collect();
        Ok(Message::new(serde_json::Value::Array(payloads))
            .with_headers(&headers)
            .with_header(CORRELATION_HEADER, correlation_id.to_string()))
    })
}

/// What happens to a group the reaper finds past its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryPolicy {
    /// Combine whatever arrived and emit it, tagged with `relay_partial`.
    ReleasePartial,

    /// Drop the parts (to the discard channel, if one is set).
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorConfig {
    /// Deadline for a group, counted from its first part.
    pub group_timeout: Duration,

    pub expiry: ExpiryPolicy,

    /// How long completed correlation ids are remembered to reject late parts.
    pub tombstone_retention: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            group_timeout: Duration::from_secs(30),
            expiry: ExpiryPolicy::Discard,
            tombstone_retention: Duration::from_secs(300),
        }
    }
}

/// Result of handing one message to the aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// Not part of a sequence; forwarded unchanged.
    PassedThrough,

    Pending { received: u32, expected: u32 },

    Released { correlation_id: CorrelationId, size: u32 },

    /// Late, duplicate or out-of-range part; the group is not touched.
    Discarded,
}

struct GroupStore {
    groups: HashMap<CorrelationId, CorrelationGroup>,

    /// Released or reaped ids, with the time they completed.
    completed: HashMap<CorrelationId, tokio::time::Instant>,

    stats: AggregatorStats,
}

enum Admission {
    Pending { received: u32, expected: u32 },
    Complete(CorrelationGroup),
    Late,
    Duplicate,
    Invalid,
}

/// Design:
/// - One mutex guards all groups; `add` and `reap_expired` both remove a
///   finished group under it, so a group is released at most once.
/// - Combining and sending happen after the lock is released.
pub struct Aggregator {
    combine: CombineFn,
    config: AggregatorConfig,
    store: Mutex<GroupStore>,
    output: Arc<Channel>,
    discard: Option<Arc<Channel>>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
}

impl Aggregator {
    pub fn new(combine: CombineFn, config: AggregatorConfig, output: Arc<Channel>) -> Self {
        Self {
            combine,
            config,
            store: Mutex::new(GroupStore {
                groups: HashMap::new(),
                completed: HashMap::new(),
                stats: AggregatorStats::default(),
            }),
            output,
            discard: None,
            clock: Arc::new(SystemClock),
            sink: Arc::new(NoopEventSink),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Late parts and discarded partial groups are forwarded here.
    pub fn with_discard_channel(mut self, discard: Arc<Channel>) -> Self {
        self.discard = Some(discard);
        self
    }

    pub fn output(&self) -> &Arc<Channel> {
        &self.output
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub async fn stats(&self) -> AggregatorStats {
        let store = self.store.lock().await;
        AggregatorStats {
            open_groups: store.groups.len(),
            ..store.stats.clone()
        }
    }

    /// Add one part. When it completes its group, the combined message is sent
    /// to the output channel.
    pub async fn add(&self, message: Message) -> Result<AddOutcome, FlowError> {
        let Some(seq) = message.sequence().copied() else {
            self.output.send(message).await?;
            return Ok(AddOutcome::PassedThrough);
        };
        let correlation_id = seq.correlation_id;
        let now = self.clock.now();

        let admission = {
            let mut guard = self.store.lock().await;
            let store = &mut *guard;

            if store.completed.contains_key(&correlation_id) {
                store.stats.late_discarded += 1;
                Admission::Late
            } else if !(1..=seq.sequence_size.max(1)).contains(&seq.sequence_number) {
                store.stats.invalid_discarded += 1;
                Admission::Invalid
            } else {
                let deadline = now + self.config.group_timeout;
                let group = store.groups.entry(correlation_id).or_insert_with(|| {
                    CorrelationGroup::new(correlation_id, seq.sequence_size.max(1), now, deadline)
                });

                if !group.fits(&message) {
                    store.stats.invalid_discarded += 1;
                    Admission::Invalid
                } else if !group.add(message.clone()) {
                    store.stats.duplicates_discarded += 1;
                    Admission::Duplicate
                } else if !group.is_complete() {
                    Admission::Pending {
                        received: group.received_count(),
                        expected: group.expected_size,
                    }
                } else {
                    match store.groups.remove(&correlation_id) {
                        Some(group) => {
                            store.completed.insert(correlation_id, now);
                            Admission::Complete(group)
                        }
                        None => Admission::Duplicate,
                    }
                }
            }
        };

        match admission {
            Admission::Pending { received, expected } => {
                debug!(%correlation_id, received, expected, "part added");
                Ok(AddOutcome::Pending { received, expected })
            }
            Admission::Late => {
                warn!(
                    %correlation_id,
                    sequence_number = seq.sequence_number,
                    "discarding part for completed group"
                );
                self.sink.emit(
                    GroupEvent::LateDiscarded {
                        correlation_id,
                        sequence_number: seq.sequence_number,
                    }
                    .into(),
                );
                self.discard_parts(vec![message], "late part for completed group").await;
                Ok(AddOutcome::Discarded)
            }
            Admission::Invalid => {
                warn!(
                    %correlation_id,
                    sequence_number = seq.sequence_number,
                    sequence_size = seq.sequence_size,
                    "discarding part outside its sequence"
                );
                self.discard_parts(vec![message], "sequence number or size mismatch").await;
                Ok(AddOutcome::Discarded)
            }
            Admission::Duplicate => {
                debug!(%correlation_id, sequence_number = seq.sequence_number, "duplicate part ignored");
                Ok(AddOutcome::Discarded)
            }
            Admission::Complete(group) => {
                let size = group.expected_size;
                let combined = match (self.combine)(correlation_id, group.release()) {
                    Ok(combined) => combined,
                    Err(err) => {
                        warn!(%correlation_id, size, %err, "combining complete group failed");
                        return Err(err);
                    }
                };
                self.store.lock().await.stats.released += 1;
                self.sink.emit(GroupEvent::Released { correlation_id, size }.into());
                debug!(%correlation_id, size, "group released");
                self.output.send(combined).await?;
                Ok(AddOutcome::Released { correlation_id, size })
            }
        }
    }

    /// Force-complete every group whose deadline has passed. Returns the
    /// reaped correlation ids.
    pub async fn reap_expired(&self) -> Vec<CorrelationId> {
        let now = self.clock.now();

        let expired: Vec<CorrelationGroup> = {
            let mut guard = self.store.lock().await;
            let store = &mut *guard;

            let ids: Vec<CorrelationId> = store
                .groups
                .values()
                .filter(|g| g.is_expired(now))
                .map(|g| g.correlation_id)
                .collect();

            let mut expired = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(group) = store.groups.remove(&id) {
                    store.completed.insert(id, now);
                    expired.push(group);
                }
            }
            store.stats.expired += expired.len() as u64;

            let retention = self.config.tombstone_retention;
            store
                .completed
                .retain(|_, at| now.saturating_duration_since(*at) < retention);

            expired
        };

        let mut reaped = Vec::with_capacity(expired.len());
        for group in expired {
            let correlation_id = group.correlation_id;
            let received = group.received_count();
            let expected = group.expected_size;
            let parts = group.release();

            let partial_emitted = match self.config.expiry {
                ExpiryPolicy::ReleasePartial if !parts.is_empty() => {
                    self.emit_partial(correlation_id, parts).await
                }
                _ => {
                    let reason = FlowError::GroupExpired(correlation_id).to_string();
                    self.discard_parts(parts, &reason).await;
                    false
                }
            };

            warn!(
                %correlation_id,
                received,
                expected,
                partial_emitted,
                err = %FlowError::GroupExpired(correlation_id),
                "group expired"
            );
            self.sink.emit(
                GroupEvent::Expired {
                    correlation_id,
                    received,
                    expected,
                    partial_emitted,
                }
                .into(),
            );
            reaped.push(correlation_id);
        }
        reaped
    }

    async fn emit_partial(&self, correlation_id: CorrelationId, parts: Vec<Message>) -> bool {
        let combined = match (self.combine)(correlation_id, parts) {
            Ok(m) => m.with_header(PARTIAL_HEADER, true),
            Err(err) => {
                warn!(%correlation_id, %err, "combining partial group failed");
                return false;
            }
        };
        match self.output.send(combined).await {
            Ok(()) => true,
            Err(err) => {
                warn!(%correlation_id, %err, "emitting partial group failed");
                false
            }
        }
    }

    async fn discard_parts(&self, parts: Vec<Message>, reason: &str) {
        let Some(discard) = &self.discard else {
            return;
        };
        for part in parts {
            if let Err(err) = discard.send(part.with_header(DISCARD_REASON_HEADER, reason)).await {
                warn!(channel = discard.name(), %err, "discard channel rejected part");
                break;
            }
        }
    }
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("config", &self.config)
            .field("output", &self.output.name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Splitter;
    use crate::channel::ReceiveTimeout;
    use crate::impls::RecordingEventSink;
    use crate::ports::ManualClock;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rstest::rstest;
    use serde_json::json;

    struct Fixture {
        agg: Aggregator,
        out: Arc<Channel>,
        discard: Arc<Channel>,
        clock: Arc<ManualClock>,
        sink: Arc<RecordingEventSink>,
    }

    fn fixture(expiry: ExpiryPolicy) -> Fixture {
        let out = Arc::new(Channel::new("aggregated"));
        let discard = Arc::new(Channel::new("discarded"));
        let clock = Arc::new(ManualClock::new());
        let sink = Arc::new(RecordingEventSink::new());
        let agg = Aggregator::new(
            collect_payloads(),
            AggregatorConfig {
                group_timeout: Duration::from_secs(5),
                expiry,
                tombstone_retention: Duration::from_secs(60),
            },
            out.clone(),
        )
        .with_clock(clock.clone())
        .with_sink(sink.clone())
        .with_discard_channel(discard.clone());
        Fixture {
            agg,
            out,
            discard,
            clock,
            sink,
        }
    }

    fn split(n: usize) -> Vec<Message> {
        let items: Vec<_> = (1..=n).map(|i| json!(i)).collect();
        Splitter::json_array()
            .split(&Message::new(json!(items)))
            .unwrap()
    }

    #[rstest]
    #[case(1, 11)]
    #[case(2, 12)]
    #[case(3, 13)]
    #[case(5, 14)]
    #[case(8, 15)]
    #[case(13, 16)]
    #[tokio::test]
    async fn any_arrival_order_releases_once_in_sequence_order(#[case] n: usize, #[case] seed: u64) {
        let f = fixture(ExpiryPolicy::Discard);
        let mut parts = split(n);
        parts.shuffle(&mut StdRng::seed_from_u64(seed));

        let mut releases = 0;
        for p in parts {
            if let AddOutcome::Released { size, .. } = f.agg.add(p).await.unwrap() {
                assert_eq!(size, n as u32);
                releases += 1;
            }
        }
        assert_eq!(releases, 1);

        let combined = f.out.receive(ReceiveTimeout::Immediate).await.unwrap();
        let expected: Vec<_> = (1..=n).map(|i| json!(i)).collect();
        assert_eq!(combined.payload(), &json!(expected));
        assert!(f.out.is_empty().await);
        assert_eq!(f.agg.stats().await.open_groups, 0);
    }

    #[tokio::test]
    async fn pending_until_all_parts_arrive() {
        let f = fixture(ExpiryPolicy::Discard);
        let parts = split(3);

        assert_eq!(
            f.agg.add(parts[0].clone()).await.unwrap(),
            AddOutcome::Pending { received: 1, expected: 3 }
        );
        assert_eq!(
            f.agg.add(parts[2].clone()).await.unwrap(),
            AddOutcome::Pending { received: 2, expected: 3 }
        );
        assert!(f.out.is_empty().await);
    }

    #[tokio::test]
    async fn unsequenced_messages_pass_through() {
        let f = fixture(ExpiryPolicy::Discard);
        let m = Message::new(json!("solo"));

        assert_eq!(f.agg.add(m.clone()).await.unwrap(), AddOutcome::PassedThrough);
        assert_eq!(f.out.receive(ReceiveTimeout::Immediate).await.unwrap(), m);
    }

    #[tokio::test]
    async fn duplicate_part_does_not_complete_group() {
        let f = fixture(ExpiryPolicy::Discard);
        let parts = split(2);

        f.agg.add(parts[0].clone()).await.unwrap();
        assert_eq!(f.agg.add(parts[0].clone()).await.unwrap(), AddOutcome::Discarded);
        assert!(f.out.is_empty().await);
        assert_eq!(f.agg.stats().await.duplicates_discarded, 1);
    }

    fn numbered(id: CorrelationId, n: u32, size: u32) -> Message {
        Message::new(json!(n)).with_sequence(crate::domain::SequenceDetails {
            correlation_id: id,
            sequence_number: n,
            sequence_size: size,
        })
    }

    #[tokio::test]
    async fn out_of_range_part_never_completes_group() {
        let f = fixture(ExpiryPolicy::Discard);
        let id = CorrelationId::generate();

        f.agg.add(numbered(id, 1, 3)).await.unwrap();
        f.agg.add(numbered(id, 2, 3)).await.unwrap();
        assert_eq!(f.agg.add(numbered(id, 7, 3)).await.unwrap(), AddOutcome::Discarded);
        assert_eq!(f.agg.add(numbered(id, 0, 3)).await.unwrap(), AddOutcome::Discarded);
        assert!(f.out.is_empty().await);

        let stats = f.agg.stats().await;
        assert_eq!(stats.invalid_discarded, 2);
        assert_eq!(stats.open_groups, 1);
        let stray = f.discard.receive(ReceiveTimeout::Immediate).await.unwrap();
        assert_eq!(stray.sequence_number(), 7);
        assert!(stray.header(DISCARD_REASON_HEADER).is_some());

        assert_eq!(
            f.agg.add(numbered(id, 3, 3)).await.unwrap(),
            AddOutcome::Released { correlation_id: id, size: 3 }
        );
        let combined = f.out.receive(ReceiveTimeout::Immediate).await.unwrap();
        assert_eq!(combined.payload(), &json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn part_with_mismatched_size_is_discarded() {
        let f = fixture(ExpiryPolicy::Discard);
        let id = CorrelationId::generate();

        f.agg.add(numbered(id, 1, 2)).await.unwrap();
        assert_eq!(f.agg.add(numbered(id, 2, 4)).await.unwrap(), AddOutcome::Discarded);
        assert!(f.out.is_empty().await);
        assert_eq!(f.agg.stats().await.invalid_discarded, 1);
    }

    #[tokio::test]
    async fn out_of_range_first_part_opens_no_group() {
        let f = fixture(ExpiryPolicy::Discard);

        assert_eq!(
            f.agg.add(numbered(CorrelationId::generate(), 4, 3)).await.unwrap(),
            AddOutcome::Discarded
        );
        assert_eq!(f.agg.stats().await.open_groups, 0);
    }

    #[tokio::test]
    async fn late_part_after_release_is_discarded() {
        let f = fixture(ExpiryPolicy::Discard);
        let parts = split(2);

        f.agg.add(parts[0].clone()).await.unwrap();
        f.agg.add(parts[1].clone()).await.unwrap();
        assert_eq!(f.agg.add(parts[1].clone()).await.unwrap(), AddOutcome::Discarded);

        let stats = f.agg.stats().await;
        assert_eq!(stats.released, 1);
        assert_eq!(stats.late_discarded, 1);
        assert_eq!(stats.open_groups, 0);
        assert_eq!(f.out.len().await, 1);
        assert_eq!(f.discard.len().await, 1);
    }

    #[tokio::test]
    async fn reaper_discards_incomplete_group_and_late_part_stays_out() {
        let f = fixture(ExpiryPolicy::Discard);
        let parts = split(3);
        let id = parts[0].correlation_id().unwrap();

        f.agg.add(parts[0].clone()).await.unwrap();
        f.agg.add(parts[2].clone()).await.unwrap();

        f.clock.advance(Duration::from_secs(4));
        assert!(f.agg.reap_expired().await.is_empty());

        f.clock.advance(Duration::from_secs(1));
        assert_eq!(f.agg.reap_expired().await, vec![id]);

        assert_eq!(f.agg.add(parts[1].clone()).await.unwrap(), AddOutcome::Discarded);
        assert!(f.out.is_empty().await);
        // parts 1 and 3 from the reaped group, then the late part 2
        assert_eq!(f.discard.len().await, 3);
        let reaped = f.discard.receive(ReceiveTimeout::Immediate).await.unwrap();
        assert_eq!(
            reaped.header(DISCARD_REASON_HEADER),
            Some(&json!(FlowError::GroupExpired(id).to_string()))
        );

        let events = f.sink.group_events();
        assert!(events.contains(&GroupEvent::Expired {
            correlation_id: id,
            received: 2,
            expected: 3,
            partial_emitted: false,
        }));
        assert!(events.contains(&GroupEvent::LateDiscarded {
            correlation_id: id,
            sequence_number: 2,
        }));
        assert!(!events.iter().any(|e| matches!(e, GroupEvent::Released { .. })));
    }

    #[tokio::test]
    async fn reaper_can_release_partial_group() {
        let f = fixture(ExpiryPolicy::ReleasePartial);
        let parts = split(3);

        f.agg.add(parts[0].clone()).await.unwrap();
        f.agg.add(parts[2].clone()).await.unwrap();
        f.clock.advance(Duration::from_secs(5));
        f.agg.reap_expired().await;

        let partial = f.out.receive(ReceiveTimeout::Immediate).await.unwrap();
        assert_eq!(partial.payload(), &json!([1, 3]));
        assert_eq!(partial.header(PARTIAL_HEADER), Some(&json!(true)));

        // still at most one release for this correlation id
        assert_eq!(f.agg.add(parts[1].clone()).await.unwrap(), AddOutcome::Discarded);
        assert!(f.out.is_empty().await);
    }

    #[tokio::test]
    async fn released_group_is_never_reaped() {
        let f = fixture(ExpiryPolicy::ReleasePartial);
        for p in split(2) {
            f.agg.add(p).await.unwrap();
        }
        f.clock.advance(Duration::from_secs(10));

        assert!(f.agg.reap_expired().await.is_empty());
        assert_eq!(f.out.len().await, 1);
        assert_eq!(f.agg.stats().await.expired, 0);
    }

    #[tokio::test]
    async fn tombstones_are_pruned_after_retention() {
        let f = fixture(ExpiryPolicy::Discard);
        let parts = split(2);
        f.agg.add(parts[0].clone()).await.unwrap();
        f.agg.add(parts[1].clone()).await.unwrap();

        f.clock.advance(Duration::from_secs(61));
        f.agg.reap_expired().await;

        // the id is forgotten, so a straggler opens a fresh group
        assert_eq!(
            f.agg.add(parts[1].clone()).await.unwrap(),
            AddOutcome::Pending { received: 1, expected: 2 }
        );
    }

    #[tokio::test]
    async fn concurrent_adds_release_exactly_once() {
        let out = Arc::new(Channel::new("aggregated"));
        let agg = Arc::new(Aggregator::new(
            collect_payloads(),
            AggregatorConfig::default(),
            out.clone(),
        ));

        let parts = split(16);
        let handles: Vec<_> = parts
            .into_iter()
            .map(|p| {
                let agg = Arc::clone(&agg);
                tokio::spawn(async move { agg.add(p).await })
            })
            .collect();

        let mut releases = 0;
        for h in handles {
            if matches!(h.await.unwrap().unwrap(), AddOutcome::Released { .. }) {
                releases += 1;
            }
        }
        assert_eq!(releases, 1);
        assert_eq!(out.len().await, 1);
    }

    #[tokio::test]
    async fn combiner_error_surfaces_as_transform_error() {
        let out = Arc::new(Channel::new("aggregated"));
        let agg = Aggregator::new(
            Arc::new(|_: CorrelationId, _: Vec<Message>| -> Result<Message, FlowError> {
                Err(FlowError::transform("cannot combine"))
            }),
            AggregatorConfig::default(),
            out.clone(),
        );

        let err = agg.add(split(1).remove(0)).await.unwrap_err();
        assert!(matches!(err, FlowError::TransformError(_)));
        assert!(out.is_empty().await);
    }

    #[tokio::test]
    async fn combiner_error_emits_no_release() {
        let out = Arc::new(Channel::new("aggregated"));
        let sink = Arc::new(RecordingEventSink::new());
        let agg = Aggregator::new(
            Arc::new(|_: CorrelationId, _: Vec<Message>| -> Result<Message, FlowError> {
                Err(FlowError::transform("cannot combine"))
            }),
            AggregatorConfig::default(),
            out.clone(),
        )
        .with_sink(sink.clone());

        for p in split(2) {
            let _ = agg.add(p).await;
        }

        assert!(sink.group_events().is_empty());
        assert_eq!(agg.stats().await.released, 0);
        assert!(out.is_empty().await);
    }
}
