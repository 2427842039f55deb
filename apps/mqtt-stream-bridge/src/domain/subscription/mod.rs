//! Subscription Types
//!
//! Domain types describing what a stream session asked for and how that
//! request is addressed by the host platform.
//!
//! # Design
//!
//! A [`SubscriptionModel`] is the value a session is opened with: a broker
//! topic plus local presentation options. Two sessions with equal models
//! are still separate listeners, but they share the single broker
//! subscription for their topic.
//!
//! The model travels between the host and the bridge as a
//! [`ChannelAddress`], whose text form is the only persisted
//! representation.

mod address;
mod duration;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use address::{AddressError, ChannelAddress};
pub use duration::{DurationError, format_duration, parse_duration};

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a stream session.
pub type SessionId = u64;

/// A broker topic (or topic filter) string.
pub type Topic = String;

/// Generate a fresh session identifier.
#[must_use]
pub fn new_session_id() -> SessionId {
    uuid::Uuid::new_v4().as_u64_pair().0
}

// =============================================================================
// Subscription Model
// =============================================================================

/// What a single stream session subscribes to and how it presents the data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionModel {
    /// Broker topic.
    pub topic: Topic,
    /// Parse JSON object payloads into one column per key.
    pub include_schema: bool,
    /// Batch messages into fixed time windows.
    pub use_interval: bool,
    /// Window length in milliseconds.
    pub interval_millis: u64,
}

impl SubscriptionModel {
    /// Create a model for a topic with default options.
    #[must_use]
    pub fn new(topic: impl Into<Topic>) -> Self {
        Self {
            topic: topic.into(),
            ..Self::default()
        }
    }

    /// Enable JSON schema inference.
    #[must_use]
    pub fn with_schema(mut self, include_schema: bool) -> Self {
        self.include_schema = include_schema;
        self
    }

    /// Enable windowing with the given interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.use_interval = true;
        self.interval_millis = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// The window length as a [`Duration`].
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_millis)
    }

    /// Window length if windowing is active.
    ///
    /// A zero interval behaves like windowing disabled.
    #[must_use]
    pub const fn window(&self) -> Option<Duration> {
        if self.use_interval && self.interval_millis > 0 {
            Some(self.interval())
        } else {
            None
        }
    }

    /// Encode the path part of the channel address (without `ds/<uid>/`).
    #[must_use]
    pub fn to_path(&self) -> String {
        format!(
            "topic={}.useInterval={}.includeSchema={}.interval={}",
            self.topic,
            self.use_interval,
            self.include_schema,
            format_duration(self.interval())
        )
    }

    /// Decode a channel path (with or without the `ds/<uid>/` prefix).
    ///
    /// # Errors
    ///
    /// Returns [`AddressError`] if a boolean or duration value is malformed.
    pub fn from_path(path: &str) -> Result<Self, AddressError> {
        address::decode_path(path)
    }
}

// =============================================================================
// Topic Validation
// =============================================================================

/// Why a topic was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    /// Topic is empty.
    #[error("topic must not be empty")]
    Empty,
    /// Topic contains whitespace.
    #[error("topic must not contain whitespace")]
    Whitespace,
}

/// Check that a topic can be subscribed to and addressed.
///
/// # Errors
///
/// Returns [`TopicError`] for empty topics or topics containing whitespace.
pub fn validate_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.chars().any(char::is_whitespace) {
        return Err(TopicError::Whitespace);
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
