//! Pending state aggregation.
//!
//! A [`StateAggregator`] folds buffered state messages into the single
//! document written per flush. Later messages win over earlier ones for the
//! same key.

use std::collections::BTreeMap;

use serde_json::Value;
use syncledger_types::state::{StateMessage, StateType, StateWrapper, StreamStateEntry};
use syncledger_types::stream::StreamKey;

/// Folds state messages into one persistable document.
pub trait StateAggregator: Send {
    /// Add a message. Replaces any earlier value for the same key.
    fn ingest(&mut self, state: StateMessage);

    /// Whether nothing has been ingested.
    fn is_empty(&self) -> bool;

    /// The document to persist, `None` when empty.
    fn aggregated(&self) -> Option<StateWrapper>;

    /// Messages that reproduce this aggregator's content when ingested,
    /// in order, into an empty one.
    fn into_messages(self: Box<Self>) -> Vec<StateMessage>;
}

/// Creates empty aggregators.
pub trait StateAggregatorFactory: Send + Sync {
    fn create(&self) -> Box<dyn StateAggregator>;
}

// ---------------------------------------------------------------------------
// Default implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
enum Slots {
    #[default]
    Empty,
    /// One slot per stream.
    Streams(BTreeMap<StreamKey, Option<Value>>),
    /// Whole-sync GLOBAL or LEGACY message.
    Single(StateMessage),
}

/// Last-write-wins aggregator.
///
/// STREAM messages keep one slot per descriptor. GLOBAL and LEGACY messages
/// keep a single slot. A message of another shape replaces everything.
#[derive(Debug, Default)]
pub struct DefaultStateAggregator {
    slots: Slots,
}

impl DefaultStateAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn current_type(&self) -> Option<StateType> {
        match &self.slots {
            Slots::Empty => None,
            Slots::Streams(_) => Some(StateType::Stream),
            Slots::Single(msg) => Some(msg.state_type()),
        }
    }
}

impl StateAggregator for DefaultStateAggregator {
    fn ingest(&mut self, state: StateMessage) {
        let incoming = state.state_type();
        if let Some(current) = self.current_type() {
            if current != incoming {
                tracing::warn!(
                    previous = %current,
                    incoming = %incoming,
                    "State type changed mid-sync, discarding buffered state"
                );
                self.slots = Slots::Empty;
            }
        }

        match state {
            StateMessage::Stream {
                descriptor, state, ..
            } => {
                if let Slots::Streams(streams) = &mut self.slots {
                    streams.insert(descriptor, state);
                } else {
                    self.slots = Slots::Streams(BTreeMap::from([(descriptor, state)]));
                }
            }
            other => self.slots = Slots::Single(other),
        }
    }

    fn is_empty(&self) -> bool {
        matches!(self.slots, Slots::Empty)
    }

    fn aggregated(&self) -> Option<StateWrapper> {
        match &self.slots {
            Slots::Empty => None,
            Slots::Streams(streams) => Some(StateWrapper::Stream {
                streams: streams
                    .iter()
                    .map(|(key, state)| StreamStateEntry::new(key.clone(), state.clone()))
                    .collect(),
            }),
            Slots::Single(StateMessage::Global {
                shared_state,
                stream_states,
                ..
            }) => Some(StateWrapper::Global {
                shared_state: shared_state.clone(),
                stream_states: stream_states.clone(),
            }),
            Slots::Single(StateMessage::Legacy { data }) => {
                Some(StateWrapper::Legacy { data: data.clone() })
            }
            Slots::Single(StateMessage::Stream {
                descriptor, state, ..
            }) => {
                Some(StateWrapper::Stream {
                    streams: vec![StreamStateEntry::new(descriptor.clone(), state.clone())],
                })
            }
        }
    }

    fn into_messages(self: Box<Self>) -> Vec<StateMessage> {
        match self.slots {
            Slots::Empty => Vec::new(),
            Slots::Streams(streams) => streams
                .into_iter()
                .map(|(descriptor, state)| StateMessage::stream_entry(descriptor, state))
                .collect(),
            Slots::Single(msg) => vec![msg],
        }
    }
}

/// Factory for [`DefaultStateAggregator`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultStateAggregatorFactory;

impl StateAggregatorFactory for DefaultStateAggregatorFactory {
    fn create(&self) -> Box<dyn StateAggregator> {
        Box::new(DefaultStateAggregator::new())
    }
}
