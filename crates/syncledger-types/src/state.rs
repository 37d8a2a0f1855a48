//! State message model.
//!
//! A [`StateMessage`] is a checkpoint raised by a source and acknowledged by
//! a destination. A [`StateWrapper`] is the aggregated, persistable document
//! stored per connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::stream::StreamKey;

/// Shape of a state message or stored state document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateType {
    /// One checkpoint per stream.
    Stream,
    /// One shared checkpoint covering every stream.
    Global,
    /// Pre-per-stream opaque blob.
    Legacy,
}

impl StateType {
    /// Wire-format string for storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Global => "global",
            Self::Legacy => "legacy",
        }
    }

    /// Parse the storage representation produced by [`StateType::as_str`].
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "stream" => Some(Self::Stream),
            "global" => Some(Self::Global),
            "legacy" => Some(Self::Legacy),
            _ => None,
        }
    }
}

impl std::fmt::Display for StateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a single stream, as carried inside STREAM and GLOBAL shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStateEntry {
    pub descriptor: StreamKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
}

impl StreamStateEntry {
    #[must_use]
    pub fn new(descriptor: StreamKey, state: Option<Value>) -> Self {
        Self { descriptor, state }
    }
}

// ---------------------------------------------------------------------------
// Checkpoint messages
// ---------------------------------------------------------------------------

/// Record counts a connector attaches to a checkpoint: how many records it
/// read (source) or wrote and rejected (destination) since the previous
/// checkpoint of the same scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_record_count: Option<u64>,
}

impl StateStats {
    #[must_use]
    pub fn records(record_count: u64) -> Self {
        Self {
            record_count: Some(record_count),
            rejected_record_count: None,
        }
    }

    #[must_use]
    pub fn with_rejected(mut self, rejected: u64) -> Self {
        self.rejected_record_count = Some(rejected);
        self
    }
}

/// A checkpoint emitted by a source or echoed back by a destination.
///
/// `source_stats` and `destination_stats` are annotations and take no part
/// in [`same_checkpoint`](Self::same_checkpoint).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateMessage {
    Stream {
        descriptor: StreamKey,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source_stats: Option<StateStats>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        destination_stats: Option<StateStats>,
    },
    Global {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shared_state: Option<Value>,
        #[serde(default)]
        stream_states: Vec<StreamStateEntry>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source_stats: Option<StateStats>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        destination_stats: Option<StateStats>,
    },
    Legacy {
        data: Value,
    },
}

impl StateMessage {
    /// Checkpoint for one stream.
    #[must_use]
    pub fn stream(descriptor: StreamKey, state: Value) -> Self {
        Self::stream_entry(descriptor, Some(state))
    }

    /// Checkpoint for one stream whose state may be absent.
    #[must_use]
    pub fn stream_entry(descriptor: StreamKey, state: Option<Value>) -> Self {
        Self::Stream {
            descriptor,
            state,
            source_stats: None,
            destination_stats: None,
        }
    }

    /// Shared checkpoint over `stream_states`.
    #[must_use]
    pub fn global(shared_state: Option<Value>, stream_states: Vec<StreamStateEntry>) -> Self {
        Self::Global {
            shared_state,
            stream_states,
            source_stats: None,
            destination_stats: None,
        }
    }

    /// Opaque pre-per-stream checkpoint.
    #[must_use]
    pub fn legacy(data: Value) -> Self {
        Self::Legacy { data }
    }

    #[must_use]
    pub fn state_type(&self) -> StateType {
        match self {
            Self::Stream { .. } => StateType::Stream,
            Self::Global { .. } => StateType::Global,
            Self::Legacy { .. } => StateType::Legacy,
        }
    }

    /// Whether `other` denotes the same checkpoint.
    ///
    /// Structural equality over discriminant, descriptors and state
    /// payloads. Attached record counts are ignored.
    #[must_use]
    pub fn same_checkpoint(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Stream {
                    descriptor: a,
                    state: sa,
                    ..
                },
                Self::Stream {
                    descriptor: b,
                    state: sb,
                    ..
                },
            ) => a == b && sa == sb,
            (
                Self::Global {
                    shared_state: a,
                    stream_states: sa,
                    ..
                },
                Self::Global {
                    shared_state: b,
                    stream_states: sb,
                    ..
                },
            ) => a == b && sa == sb,
            (Self::Legacy { data: a }, Self::Legacy { data: b }) => a == b,
            _ => false,
        }
    }

    /// Counts attached by the source. Always `None` for LEGACY.
    #[must_use]
    pub fn source_stats(&self) -> Option<&StateStats> {
        match self {
            Self::Stream { source_stats, .. } | Self::Global { source_stats, .. } => {
                source_stats.as_ref()
            }
            Self::Legacy { .. } => None,
        }
    }

    /// Counts attached by the destination. Always `None` for LEGACY.
    #[must_use]
    pub fn destination_stats(&self) -> Option<&StateStats> {
        match self {
            Self::Stream {
                destination_stats, ..
            }
            | Self::Global {
                destination_stats, ..
            } => destination_stats.as_ref(),
            Self::Legacy { .. } => None,
        }
    }

    /// Attach source counts. LEGACY messages are returned unchanged.
    #[must_use]
    pub fn with_source_stats(mut self, stats: StateStats) -> Self {
        if let Self::Stream { source_stats, .. } | Self::Global { source_stats, .. } = &mut self {
            *source_stats = Some(stats);
        }
        self
    }

    /// Attach destination counts. LEGACY messages are returned unchanged.
    #[must_use]
    pub fn with_destination_stats(mut self, stats: StateStats) -> Self {
        if let Self::Stream {
            destination_stats, ..
        }
        | Self::Global {
            destination_stats, ..
        } = &mut self
        {
            *destination_stats = Some(stats);
        }
        self
    }

    /// Streams this checkpoint names explicitly. Empty for LEGACY.
    #[must_use]
    pub fn streams(&self) -> Vec<&StreamKey> {
        match self {
            Self::Stream { descriptor, .. } => vec![descriptor],
            Self::Global { stream_states, .. } => {
                stream_states.iter().map(|s| &s.descriptor).collect()
            }
            Self::Legacy { .. } => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Persisted documents
// ---------------------------------------------------------------------------

/// Aggregated state document stored per connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state_type", rename_all = "snake_case")]
pub enum StateWrapper {
    Stream {
        streams: Vec<StreamStateEntry>,
    },
    Global {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shared_state: Option<Value>,
        #[serde(default)]
        stream_states: Vec<StreamStateEntry>,
    },
    Legacy {
        data: Value,
    },
}

impl StateWrapper {
    #[must_use]
    pub fn state_type(&self) -> StateType {
        match self {
            Self::Stream { .. } => StateType::Stream,
            Self::Global { .. } => StateType::Global,
            Self::Legacy { .. } => StateType::Legacy,
        }
    }

    /// Descriptors of every stream that has an entry in this document.
    #[must_use]
    pub fn stream_keys(&self) -> Vec<&StreamKey> {
        match self {
            Self::Stream { streams } => streams.iter().map(|s| &s.descriptor).collect(),
            Self::Global { stream_states, .. } => {
                stream_states.iter().map(|s| &s.descriptor).collect()
            }
            Self::Legacy { .. } => Vec::new(),
        }
    }

    /// Expand back into the state messages that would produce this document.
    #[must_use]
    pub fn into_messages(self) -> Vec<StateMessage> {
        match self {
            Self::Stream { streams } => streams
                .into_iter()
                .map(|s| StateMessage::stream_entry(s.descriptor, s.state))
                .collect(),
            Self::Global {
                shared_state,
                stream_states,
            } => vec![StateMessage::global(shared_state, stream_states)],
            Self::Legacy { data } => vec![StateMessage::Legacy { data }],
        }
    }
}
