//! Streaming Types
//!
//! Messages as they arrive from the broker and the columnar frames they are
//! shaped into before leaving the bridge.

mod builder;
mod frame;

use bytes::Bytes;
use chrono::{DateTime, Utc};

pub use builder::FrameBuilder;
pub use frame::{Column, ColumnValues, DATA_COLUMN, Frame, FrameMeta, TIME_COLUMN};

/// A broker message stamped with its local arrival time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedMessage {
    /// Topic the message was published on.
    pub topic: String,
    /// Raw payload.
    pub payload: Bytes,
    /// When the bridge received the message.
    pub acquired_at: DateTime<Utc>,
}

impl TimedMessage {
    /// Stamp a payload with the current time.
    #[must_use]
    pub fn now(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::at(topic, payload, Utc::now())
    }

    /// Create a message with an explicit arrival time.
    #[must_use]
    pub fn at(topic: impl Into<String>, payload: impl Into<Bytes>, acquired_at: DateTime<Utc>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            acquired_at,
        }
    }
}
