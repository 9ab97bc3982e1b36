//! Splitter: fan one message out into an ordered sequence of parts.

use std::sync::Arc;

use tracing::debug;

use crate::domain::{CorrelationId, FlowError, Message, SequenceDetails};

/// Turns a parent message into the payloads of its parts.
pub type SplitFn = Arc<dyn Fn(&Message) -> Result<Vec<serde_json::Value>, FlowError> + Send + Sync>;

#[derive(Clone)]
pub struct Splitter {
    split_fn: SplitFn,
}

impl Splitter {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Message) -> Result<Vec<serde_json::Value>, FlowError> + Send + Sync + 'static,
    {
        Self {
            split_fn: Arc::new(f),
        }
    }

    pub fn from_fn(split_fn: SplitFn) -> Self {
        Self { split_fn }
    }

    /// Splits a JSON array payload into its elements.
    pub fn json_array() -> Self {
        Self::new(|m| match m.payload() {
            serde_json::Value::Array(items) => Ok(items.clone()),
            other => Err(FlowError::transform(format!(
                "expected array payload, got {other}"
            ))),
        })
    }

    /// Each child gets a fresh correlation id shared with its siblings,
    /// `sequence_number` 1..=N, `sequence_size` N, and the parent's headers.
    pub fn split(&self, message: &Message) -> Result<Vec<Message>, FlowError> {
        let payloads = (self.split_fn)(message)?;
        let size = u32::try_from(payloads.len())
            .map_err(|_| FlowError::transform("too many parts for one sequence"))?;
        let correlation_id = CorrelationId::generate();

        debug!(parent = %message.id(), %correlation_id, size, "split");

        Ok(payloads
            .into_iter()
            .zip(1..)
            .map(|(payload, sequence_number)| {
                Message::new(payload)
                    .with_headers(message.headers())
                    .with_sequence(SequenceDetails {
                        correlation_id,
                        sequence_number,
                        sequence_size: size,
                    })
            })
            .collect())
    }
}

impl std::fmt::Debug for Splitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Splitter").finish_non_exhaustive()
    }
}
