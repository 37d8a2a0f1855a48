//! Per-checkpoint record count validation.
//!
//! Connectors may attach the number of records they read or wrote since
//! the previous checkpoint. Those counts are compared with the records the
//! platform itself saw between the same two checkpoints.

use std::fmt;

use syncledger_types::state::{StateMessage, StateType};
use syncledger_types::stream::StreamKey;

/// Side of the pipeline a checkpoint was observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOrigin {
    Source,
    Destination,
}

impl CheckpointOrigin {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Destination => "destination",
        }
    }
}

impl fmt::Display for CheckpointOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connector-reported record counts that disagree with the platform count.
///
/// `destination_count` already includes records the destination rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumMismatch {
    pub origin: CheckpointOrigin,
    pub state_type: StateType,
    /// Set for STREAM checkpoints.
    pub stream: Option<StreamKey>,
    pub platform_count: u64,
    pub source_count: Option<u64>,
    pub destination_count: Option<u64>,
}

impl fmt::Display for ChecksumMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} state checksum is invalid", self.origin, self.state_type)?;
        if let Some(stream) = &self.stream {
            write!(f, " for stream {stream}")?;
        }
        write!(f, ": platform counted {} records", self.platform_count)?;
        if let Some(count) = self.source_count {
            write!(f, ", source reported {count}")?;
        }
        if let Some(count) = self.destination_count {
            write!(f, ", destination reported {count}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ChecksumMismatch {}

/// Compare the counts attached to `state` with `platform_count`.
///
/// Only STREAM and GLOBAL checkpoints are validated. A checkpoint without
/// counts for `origin` is accepted.
pub(crate) fn validate(
    origin: CheckpointOrigin,
    state: &StateMessage,
    platform_count: u64,
) -> Result<(), ChecksumMismatch> {
    let stream = match state {
        StateMessage::Stream { descriptor, .. } => Some(descriptor.clone()),
        StateMessage::Global { .. } => None,
        StateMessage::Legacy { .. } => return Ok(()),
    };
    let source_count = state.source_stats().and_then(|s| s.record_count);

    let (source_count, destination_count) = match origin {
        CheckpointOrigin::Source => match source_count {
            Some(count) if count != platform_count => (Some(count), None),
            _ => return Ok(()),
        },
        CheckpointOrigin::Destination => {
            let Some(stats) = state.destination_stats() else {
                return Ok(());
            };
            let Some(written) = stats.record_count else {
                return Ok(());
            };
            let total = written.saturating_add(stats.rejected_record_count.unwrap_or(0));
            let source_agrees = source_count.map_or(true, |count| count == total);
            if source_agrees && platform_count == total {
                return Ok(());
            }
            (source_count, Some(total))
        }
    };

    Err(ChecksumMismatch {
        origin,
        state_type: state.state_type(),
        stream,
        platform_count,
        source_count,
        destination_count,
    })
}
