//! Split / aggregate - splitter・aggregator・reaper の組み立て

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::aggregate::{AddOutcome, Aggregator, AggregatorConfig, CombineFn, SplitFn, Splitter};
use crate::channel::Channel;
use crate::domain::{CorrelationId, FlowError, Message};
use crate::impls::NoopEventSink;
use crate::ports::EventSink;

use super::reaper_loop::ReaperLoop;

/// A splitter and the aggregator that reassembles its parts.
///
/// Combined messages (and partial releases) appear on [`SplitAggregate::output`].
pub struct SplitAggregate {
    splitter: Splitter,
    aggregator: Arc<Aggregator>,
}

/// Build a splitter/aggregator pair with default expiry settings.
/// Start the reaper with [`SplitAggregate::start_reaper`].
pub fn configure(split_fn: SplitFn, combine_fn: CombineFn, group_timeout: Duration) -> SplitAggregate {
    configure_with(
        split_fn,
        combine_fn,
        AggregatorConfig {
            group_timeout,
            ..AggregatorConfig::default()
        },
        Arc::new(Channel::new("aggregated")),
        Arc::new(NoopEventSink),
    )
}

/// Full form of [`configure`]: explicit aggregator settings, output channel
/// and listener for group events.
pub fn configure_with(
    split_fn: SplitFn,
    combine_fn: CombineFn,
    config: AggregatorConfig,
    output: Arc<Channel>,
    listener: Arc<dyn EventSink>,
) -> SplitAggregate {
    SplitAggregate {
        splitter: Splitter::from_fn(split_fn),
        aggregator: Arc::new(Aggregator::new(combine_fn, config, output).with_sink(listener)),
    }
}

impl SplitAggregate {
    pub fn splitter(&self) -> &Splitter {
        &self.splitter
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    pub fn output(&self) -> &Arc<Channel> {
        self.aggregator.output()
    }

    pub fn split(&self, message: &Message) -> Result<Vec<Message>, FlowError> {
        self.splitter.split(message)
    }

    pub async fn aggregate(&self, part: Message) -> Result<AddOutcome, FlowError> {
        self.aggregator.add(part).await
    }

    /// Split `message` and send every part to `channel`, in sequence order.
    pub async fn scatter(&self, message: &Message, channel: &Channel) -> Result<CorrelationId, FlowError> {
        let parts = self.split(message)?;
        let correlation_id = parts
            .first()
            .and_then(Message::correlation_id)
            .ok_or_else(|| FlowError::transform("split produced no parts"))?;
        debug!(%correlation_id, parts = parts.len(), channel = channel.name(), "scatter");
        for part in parts {
            channel.send(part).await?;
        }
        Ok(correlation_id)
    }

    pub fn start_reaper(&self, interval: Duration) -> ReaperLoop {
        ReaperLoop::spawn(Arc::clone(&self.aggregator), interval)
    }
}

impl std::fmt::Debug for SplitAggregate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SplitAggregate")
            .field("aggregator", &self.aggregator)
            .finish_non_exhaustive()
    }
}
