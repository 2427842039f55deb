//! Stream Session
//!
//! One consumer's live stream: registers a listener for its topic, turns
//! queued messages into frames and pushes them to the host until cancelled.
//!
//! # Lifecycle
//!
//! ```text
//! Created -> Subscribed -> Streaming -> Closing -> Closed
//! ```
//!
//! A failed registration goes straight to `Closed` without streaming. Once
//! registered, the listener is always deregistered on the way out.
//!
//! [`StreamSession::open`] registers without streaming, so a caller can report
//! a failed subscription before committing to a response.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::registry::{RegistryError, TopicSubscriptionRegistry};
use super::window::WindowAggregator;
use crate::application::ports::FrameSender;
use crate::domain::streaming::{FrameBuilder, TimedMessage};
use crate::domain::subscription::{
    AddressError, SessionId, SubscriptionModel, TopicError, new_session_id, validate_topic,
};
use crate::infrastructure::metrics;

/// Default per-session queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Model decoded, nothing registered.
    Created,
    /// Listener registered with the topic registry.
    Subscribed,
    /// Delivering frames.
    Streaming,
    /// Cancelled or queue closed, tearing down.
    Closing,
    /// Listener deregistered.
    Closed,
}

/// Session open error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The channel path could not be decoded.
    #[error("invalid channel path: {0}")]
    Address(#[from] AddressError),

    /// The decoded topic cannot be subscribed.
    #[error("invalid topic: {0}")]
    InvalidTopic(#[from] TopicError),

    /// The topic subscription failed.
    #[error(transparent)]
    Subscribe(#[from] RegistryError),
}

/// What a finished session did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    /// Messages turned into frame rows.
    pub messages: usize,
    /// Frames accepted by the host.
    pub frames_sent: usize,
    /// Frames the host rejected.
    pub frames_failed: usize,
}

/// One consumer's live stream.
#[derive(Debug)]
pub struct StreamSession {
    id: SessionId,
    model: SubscriptionModel,
    registry: Arc<TopicSubscriptionRegistry>,
    queue_capacity: usize,
    state: SessionState,
    queue: Option<mpsc::Receiver<TimedMessage>>,
    opened_at: Option<Instant>,
}

impl StreamSession {
    /// Create a session for a model.
    #[must_use]
    pub fn new(
        model: SubscriptionModel,
        registry: Arc<TopicSubscriptionRegistry>,
        queue_capacity: usize,
    ) -> Self {
        Self {
            id: new_session_id(),
            model,
            registry,
            queue_capacity: queue_capacity.max(1),
            state: SessionState::Created,
            queue: None,
            opened_at: None,
        }
    }

    /// Create a session from a channel path.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] if the path does not decode or names an
    /// invalid topic.
    pub fn from_path(
        path: &str,
        registry: Arc<TopicSubscriptionRegistry>,
        queue_capacity: usize,
    ) -> Result<Self, SessionError> {
        let model = SubscriptionModel::from_path(path)?;
        validate_topic(&model.topic)?;
        Ok(Self::new(model, registry, queue_capacity))
    }

    /// Session identifier.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// The model the session was opened with.
    #[must_use]
    pub const fn model(&self) -> &SubscriptionModel {
        &self.model
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Register the session's listener with the topic registry.
    ///
    /// Does nothing unless the session is still `Created`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Subscribe`] if the listener could not be
    /// registered. The session is `Closed` afterwards.
    pub async fn open(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Created {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        if let Err(e) = self
            .registry
            .register_listener(&self.model, self.id, Arc::new(tx))
            .await
        {
            self.state = SessionState::Closed;
            tracing::warn!(topic = %self.model.topic, session_id = self.id, error = %e, "stream session failed to subscribe");
            return Err(e.into());
        }

        self.queue = Some(rx);
        self.opened_at = Some(Instant::now());
        self.state = SessionState::Subscribed;
        metrics::session_opened();
        Ok(())
    }

    /// Stream frames to `sender` until `cancel` fires or the queue closes.
    ///
    /// Opens the session first if needed. Frame send failures are logged
    /// and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Subscribe`] if the listener could not be
    /// registered. Nothing is streamed in that case.
    pub async fn run(
        &mut self,
        cancel: CancellationToken,
        sender: &dyn FrameSender,
    ) -> Result<SessionSummary, SessionError> {
        self.open().await?;
        let Some(rx) = self.queue.take() else {
            return Ok(SessionSummary::default());
        };
        let topic = self.model.topic.clone();
        let started = self.opened_at.unwrap_or_else(Instant::now);

        let mut aggregator = WindowAggregator::new(rx, self.model.window());
        let mut builder = FrameBuilder::new(self.model.include_schema);
        let mut summary = SessionSummary::default();

        self.state = SessionState::Streaming;
        tracing::info!(
            topic = %topic,
            session_id = self.id,
            windowed = aggregator.is_windowed(),
            include_schema = self.model.include_schema,
            "stream session started"
        );

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::debug!(topic = %topic, session_id = self.id, "stream session cancelled");
                    break;
                }
                batch = aggregator.next_batch() => {
                    let Some(batch) = batch else {
                        tracing::debug!(topic = %topic, session_id = self.id, "session queue closed");
                        break;
                    };

                    let frame = builder.build(&batch);
                    let rows = frame.row_count();
                    summary.messages += batch.len();

                    // A stalled host must not hold off cancellation.
                    let sent = tokio::select! {
                        biased;
                        () = cancel.cancelled() => {
                            tracing::debug!(topic = %topic, session_id = self.id, "stream session cancelled mid-send");
                            break;
                        }
                        sent = sender.send_frame(frame) => sent,
                    };

                    match sent {
                        Ok(()) => {
                            summary.frames_sent += 1;
                            metrics::record_frame_sent(rows);
                        }
                        Err(e) => {
                            summary.frames_failed += 1;
                            metrics::record_frame_failed();
                            tracing::warn!(topic = %topic, session_id = self.id, error = %e, "failed to send frame");
                        }
                    }
                }
            }
        }

        self.state = SessionState::Closing;
        aggregator.close();
        drop(builder);

        if let Err(e) = self.registry.deregister_listener(&topic, self.id).await {
            tracing::warn!(topic = %topic, session_id = self.id, error = %e, "failed to deregister stream session");
        }

        self.state = SessionState::Closed;
        metrics::session_closed(started.elapsed());
        tracing::info!(
            topic = %topic,
            session_id = self.id,
            messages = summary.messages,
            frames_sent = summary.frames_sent,
            frames_failed = summary.frames_failed,
            "stream session closed"
        );

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::application::ports::{
        BrokerError, ChannelFrameSender, MockBrokerClient, QosLevel, SendError,
    };
    use crate::domain::streaming::Frame;

    struct StalledSender;

    #[async_trait]
    impl FrameSender for StalledSender {
        async fn send_frame(&self, _frame: Frame) -> Result<(), SendError> {
            std::future::pending().await
        }
    }

    fn registry(broker: MockBrokerClient) -> Arc<TopicSubscriptionRegistry> {
        Arc::new(TopicSubscriptionRegistry::new(Arc::new(broker), QosLevel::AtMostOnce))
    }

    #[test]
    fn from_path_decodes_model() {
        let session = StreamSession::from_path(
            "topic=a/b.useInterval=true.includeSchema=true.interval=250ms",
            registry(MockBrokerClient::new()),
            DEFAULT_QUEUE_CAPACITY,
        )
        .unwrap();

        assert_eq!(session.state(), SessionState::Created);
        assert_eq!(session.model().topic, "a/b");
        assert_eq!(session.model().window(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn from_path_rejects_bad_paths() {
        let err = StreamSession::from_path(
            "topic=a.useInterval=maybe",
            registry(MockBrokerClient::new()),
            DEFAULT_QUEUE_CAPACITY,
        )
        .unwrap_err();
        assert!(matches!(err, SessionError::Address(_)));

        let err = StreamSession::from_path(
            "useInterval=false",
            registry(MockBrokerClient::new()),
            DEFAULT_QUEUE_CAPACITY,
        )
        .unwrap_err();
        assert!(matches!(err, SessionError::InvalidTopic(TopicError::Empty)));
    }

    #[tokio::test]
    async fn subscribe_failure_never_streams() {
        let mut broker = MockBrokerClient::new();
        broker.expect_subscribe().times(1).returning(|topic, _, _| {
            Err(BrokerError::Subscription {
                topic: topic.to_string(),
                message: "denied".to_string(),
            })
        });
        broker.expect_unsubscribe().never();

        let mut session =
            StreamSession::new(SubscriptionModel::new("t"), registry(broker), DEFAULT_QUEUE_CAPACITY);
        let (sender, mut frames) = ChannelFrameSender::new(4);

        let err = session.run(CancellationToken::new(), &sender).await.unwrap_err();
        assert!(matches!(err, SessionError::Subscribe(_)));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancellation_deregisters() {
        let mut broker = MockBrokerClient::new();
        broker.expect_subscribe().times(1).returning(|_, _, _| Ok(()));
        broker.expect_unsubscribe().times(1).returning(|_| Ok(()));
        let registry = registry(broker);

        let mut session =
            StreamSession::new(SubscriptionModel::new("t"), Arc::clone(&registry), DEFAULT_QUEUE_CAPACITY);
        let (sender, _frames) = ChannelFrameSender::new(4);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = session.run(cancel, &sender).await.unwrap();
        assert_eq!(summary, SessionSummary::default());
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(registry.reference_count("t"), 0);
    }

    #[tokio::test]
    async fn cancellation_interrupts_stalled_send() {
        let handler = Arc::new(parking_lot::Mutex::new(None));
        let installed = Arc::clone(&handler);

        let mut broker = MockBrokerClient::new();
        broker.expect_subscribe().times(1).returning(move |_, _, h| {
            *installed.lock() = Some(h);
            Ok(())
        });
        broker.expect_unsubscribe().times(1).returning(|_| Ok(()));
        let registry = registry(broker);

        let cancel = CancellationToken::new();
        let session_cancel = cancel.clone();
        let session_registry = Arc::clone(&registry);
        let task = tokio::spawn(async move {
            let mut session =
                StreamSession::new(SubscriptionModel::new("t"), session_registry, DEFAULT_QUEUE_CAPACITY);
            let summary = session.run(session_cancel, &StalledSender).await;
            (summary, session.state())
        });

        for _ in 0..100 {
            if handler.lock().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let deliver = handler.lock().clone().unwrap();
        deliver(TimedMessage::now("t", "stuck"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let (summary, state) = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("session returns after cancel")
            .unwrap();
        let summary = summary.unwrap();
        assert_eq!(summary.messages, 1);
        assert_eq!(summary.frames_sent, 0);
        assert_eq!(state, SessionState::Closed);
        assert_eq!(registry.reference_count("t"), 0);
    }
}
