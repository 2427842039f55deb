//! Broker Port (Driven Port)
//!
//! Interface to the single logical MQTT broker connection. The adapter is
//! responsible for the wire protocol; callers only see acknowledged
//! operations that either complete or fail with a [`BrokerError`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::streaming::TimedMessage;

/// Callback invoked for every message on a subscribed topic.
///
/// Runs on the broker's delivery task and must not block.
pub type MessageHandler = Arc<dyn Fn(TimedMessage) + Send + Sync>;

/// MQTT quality of service level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QosLevel {
    /// Fire and forget.
    #[default]
    AtMostOnce,
    /// Acknowledged delivery, duplicates possible.
    AtLeastOnce,
    /// Assured single delivery.
    ExactlyOnce,
}

impl TryFrom<u8> for QosLevel {
    type Error = InvalidQos;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            other => Err(InvalidQos(other)),
        }
    }
}

impl From<QosLevel> for u8 {
    fn from(qos: QosLevel) -> Self {
        match qos {
            QosLevel::AtMostOnce => 0,
            QosLevel::AtLeastOnce => 1,
            QosLevel::ExactlyOnce => 2,
        }
    }
}

/// QoS value outside 0..=2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("QoS must be 0, 1 or 2, got {0}")]
pub struct InvalidQos(pub u8);

impl fmt::Display for QosLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

/// Broker port error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// Connecting to the broker failed.
    #[error("Broker connection error: {message}")]
    Connection {
        /// Error details.
        message: String,
    },

    /// The broker refused or failed a subscription.
    #[error("Subscribe to {topic} failed: {message}")]
    Subscription {
        /// Topic filter.
        topic: String,
        /// Error details.
        message: String,
    },

    /// The broker failed an unsubscription.
    #[error("Unsubscribe from {topic} failed: {message}")]
    Unsubscription {
        /// Topic filter.
        topic: String,
        /// Error details.
        message: String,
    },

    /// The client could not queue the request.
    #[error("Broker request rejected: {message}")]
    RequestRejected {
        /// Error details.
        message: String,
    },
}

/// Port for the broker connection.
///
/// Implementations must be safe to call concurrently. `connect` and
/// `disconnect` are idempotent.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Connect if not already connected and wait for the broker to accept.
    async fn connect(&self) -> Result<(), BrokerError>;

    /// Close the connection, bounded by a short grace period.
    async fn disconnect(&self);

    /// Whether the connection is currently established.
    fn is_connected(&self) -> bool;

    /// Subscribe to a topic filter and route matching messages to `handler`.
    ///
    /// Connects first if needed and waits for the broker acknowledgement.
    async fn subscribe(
        &self,
        topic: &str,
        qos: QosLevel,
        handler: MessageHandler,
    ) -> Result<(), BrokerError>;

    /// Remove the subscription for a topic filter.
    async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError>;
}
