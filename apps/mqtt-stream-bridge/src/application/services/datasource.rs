//! Datasource
//!
//! The host-facing surface of one bridge instance: query validation and
//! channel address minting, health checks, and stream open/run/close. Owns
//! the broker connection and the topic registry shared by every session.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::registry::TopicSubscriptionRegistry;
use super::session::{SessionError, SessionSummary, StreamSession};
use crate::application::ports::{BrokerClient, FrameSender, QosLevel};
use crate::domain::streaming::Frame;
use crate::domain::subscription::{
    ChannelAddress, DurationError, SubscriptionModel, TopicError, parse_duration, validate_topic,
};

/// Health check message on success.
pub const HEALTHY_MESSAGE: &str = "Data source is working";

// =============================================================================
// Queries
// =============================================================================

/// One query from the host.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DataQuery {
    /// Identifier the response is keyed by.
    #[serde(rename = "refId", default)]
    pub ref_id: String,
    /// Remaining query fields, decoded into a [`QueryModel`].
    #[serde(flatten)]
    pub json: serde_json::Value,
}

/// A batch of queries.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct QueryDataRequest {
    /// Queries, answered independently.
    pub queries: Vec<DataQuery>,
}

/// Query fields the bridge understands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryModel {
    /// Broker topic.
    pub topic: String,
    /// Batch messages into time windows.
    pub use_interval: bool,
    /// Parse JSON object payloads into columns.
    pub include_schema: bool,
    /// Window length as a duration literal.
    pub interval: Option<String>,
    /// Window length in milliseconds, used when `interval` is absent.
    pub interval_ms: Option<u64>,
}

impl QueryModel {
    fn window(&self) -> Result<Duration, DurationError> {
        match (&self.interval, self.interval_ms) {
            (Some(literal), _) => parse_duration(literal),
            (None, Some(millis)) => Ok(Duration::from_millis(millis)),
            (None, None) => Ok(Duration::ZERO),
        }
    }
}

/// Query error. Returned to the host as a bad request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    /// The topic is empty or contains whitespace.
    #[error("invalid topic {topic:?}: {reason}")]
    InvalidTopic {
        /// Offending topic.
        topic: String,
        /// Why it was rejected.
        reason: TopicError,
    },

    /// The query JSON could not be decoded.
    #[error("malformed query: {message}")]
    MalformedQuery {
        /// Error details.
        message: String,
    },
}

/// Response status for one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "u16")]
pub enum ResponseStatus {
    /// Query accepted.
    Ok,
    /// Query rejected.
    BadRequest,
}

impl From<ResponseStatus> for u16 {
    fn from(status: ResponseStatus) -> Self {
        match status {
            ResponseStatus::Ok => 200,
            ResponseStatus::BadRequest => 400,
        }
    }
}

/// Response to one query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataResponse {
    /// Status code.
    pub status: ResponseStatus,
    /// Frames on success.
    pub frames: Vec<Frame>,
    /// Error text on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Result<Frame, QueryError>> for DataResponse {
    fn from(result: Result<Frame, QueryError>) -> Self {
        match result {
            Ok(frame) => Self {
                status: ResponseStatus::Ok,
                frames: vec![frame],
                error: None,
            },
            Err(e) => Self {
                status: ResponseStatus::BadRequest,
                frames: Vec::new(),
                error: Some(e.to_string()),
            },
        }
    }
}

/// Responses keyed by `refId`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryDataResponse {
    /// One response per query.
    pub responses: BTreeMap<String, DataResponse>,
}

// =============================================================================
// Health and Streams
// =============================================================================

/// Health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    /// Broker reachable.
    Ok,
    /// Broker unreachable.
    Error,
}

/// Result of a health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheckResult {
    /// Status.
    pub status: HealthStatus,
    /// Human readable message.
    pub message: String,
}

impl HealthCheckResult {
    /// Whether the check passed.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Ok
    }
}

/// Answer to a stream subscription request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscribeStreamStatus {
    /// The stream may be opened.
    Ok,
    /// The stream does not exist.
    NotFound,
    /// The caller may not open the stream.
    PermissionDenied,
}

/// Stream operation error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// Publishing into bridge channels is not supported.
    #[error("publishing to {path} is not permitted")]
    PermissionDenied {
        /// Channel path.
        path: String,
    },
}

// =============================================================================
// Datasource
// =============================================================================

/// One bridge instance.
pub struct Datasource {
    uid: String,
    broker: Arc<dyn BrokerClient>,
    registry: Arc<TopicSubscriptionRegistry>,
    queue_capacity: usize,
}

impl std::fmt::Debug for Datasource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datasource")
            .field("uid", &self.uid)
            .field("connected", &self.broker.is_connected())
            .field("registry", &self.registry)
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

impl Datasource {
    /// Create a datasource around a broker connection.
    #[must_use]
    pub fn new(
        uid: impl Into<String>,
        broker: Arc<dyn BrokerClient>,
        qos: QosLevel,
        queue_capacity: usize,
    ) -> Self {
        let registry = Arc::new(TopicSubscriptionRegistry::new(Arc::clone(&broker), qos));
        Self {
            uid: uid.into(),
            broker,
            registry,
            queue_capacity,
        }
    }

    /// Datasource UID used in channel addresses.
    #[must_use]
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// The shared topic registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<TopicSubscriptionRegistry> {
        &self.registry
    }

    /// Validate one query and mint its channel address.
    ///
    /// Returns a frame with no rows whose `meta.channel` is the address a
    /// client opens to stream the topic.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError`] for undecodable JSON or an invalid topic.
    pub fn query(&self, query: &DataQuery) -> Result<Frame, QueryError> {
        let model: QueryModel = serde_json::from_value(query.json.clone()).map_err(|e| {
            QueryError::MalformedQuery {
                message: e.to_string(),
            }
        })?;

        validate_topic(&model.topic).map_err(|reason| QueryError::InvalidTopic {
            topic: model.topic.clone(),
            reason,
        })?;

        let window = model.window().map_err(|e| QueryError::MalformedQuery {
            message: e.to_string(),
        })?;

        let mut subscription = SubscriptionModel::new(model.topic).with_schema(model.include_schema);
        subscription.use_interval = model.use_interval;
        subscription.interval_millis = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);

        let address = ChannelAddress::new(self.uid.clone(), subscription);
        let mut frame = Frame::empty(query.ref_id.clone());
        frame.meta.channel = Some(address.to_string());

        tracing::debug!(ref_id = %query.ref_id, channel = %address, "query answered");
        Ok(frame)
    }

    /// Answer a batch of queries, each independently.
    #[must_use]
    pub fn query_data(&self, request: &QueryDataRequest) -> QueryDataResponse {
        let responses = request
            .queries
            .iter()
            .map(|query| {
                let result = self.query(query);
                if let Err(e) = &result {
                    tracing::warn!(ref_id = %query.ref_id, error = %e, "query rejected");
                }
                (query.ref_id.clone(), DataResponse::from(result))
            })
            .collect();

        QueryDataResponse { responses }
    }

    /// Check that the broker is reachable.
    pub async fn check_health(&self) -> HealthCheckResult {
        match self.broker.connect().await {
            Ok(()) => HealthCheckResult {
                status: HealthStatus::Ok,
                message: HEALTHY_MESSAGE.to_string(),
            },
            Err(e) => {
                tracing::error!(error = %e, "health check failed to reach broker");
                HealthCheckResult {
                    status: HealthStatus::Error,
                    message: e.to_string(),
                }
            }
        }
    }

    /// Authorize opening a stream. Every path is allowed.
    #[must_use]
    pub fn subscribe_stream(&self, path: &str) -> SubscribeStreamStatus {
        tracing::info!(path, "stream subscription requested");
        SubscribeStreamStatus::Ok
    }

    /// Reject publishing into a stream.
    ///
    /// # Errors
    ///
    /// Always returns [`StreamError::PermissionDenied`].
    pub fn publish_stream(&self, path: &str) -> Result<(), StreamError> {
        tracing::debug!(path, "stream publish rejected");
        Err(StreamError::PermissionDenied {
            path: path.to_string(),
        })
    }

    /// Open a stream session for `path` with its listener registered.
    ///
    /// The caller must drive the session with [`StreamSession::run`] so the
    /// listener is released again.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] if the path is invalid or the topic cannot
    /// be subscribed.
    pub async fn open_stream(&self, path: &str) -> Result<StreamSession, SessionError> {
        let mut session =
            StreamSession::from_path(path, Arc::clone(&self.registry), self.queue_capacity)?;
        session.open().await?;
        Ok(session)
    }

    /// Run a stream session for `path` until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] if the path is invalid or the topic cannot
    /// be subscribed.
    pub async fn run_stream(
        &self,
        path: &str,
        cancel: CancellationToken,
        sender: &dyn FrameSender,
    ) -> Result<SessionSummary, SessionError> {
        tracing::info!(path, "run stream");
        let mut session = self.open_stream(path).await?;
        session.run(cancel, sender).await
    }

    /// Release the broker connection.
    pub async fn dispose(&self) {
        tracing::info!(uid = %self.uid, "disposing datasource");
        self.broker.disconnect().await;
    }
}
