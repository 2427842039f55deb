//! Topic Subscription Registry
//!
//! Keeps exactly one broker subscription per topic while at least one
//! stream session listens to it, and fans every message out to all of the
//! topic's listeners.
//!
//! # Design
//!
//! Each topic has an entry holding its listeners and an async mutex. The
//! mutex serializes register/deregister for that topic *including* the
//! broker call, so the first-listener subscribe and last-listener
//! unsubscribe can never interleave. Unrelated topics never contend.
//!
//! An entry that has been torn down is marked retired before its lock is
//! released. A registration that raced with the teardown sees the flag and
//! retries against a fresh entry.
//!
//! Dispatch runs on the broker's delivery task and never blocks: each
//! listener is a [`DeliveryCallback`] that either accepts the message
//! immediately or drops it for that listener alone.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::application::ports::{BrokerClient, BrokerError, MessageHandler, QosLevel};
use crate::domain::streaming::TimedMessage;
use crate::domain::subscription::{SessionId, SubscriptionModel, Topic};
use crate::infrastructure::metrics::{self, BrokerRequest};

// =============================================================================
// Delivery
// =============================================================================

/// Why a listener did not accept a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The listener's queue is full.
    #[error("listener queue full")]
    Full,
    /// The listener has gone away.
    #[error("listener closed")]
    Closed,
}

/// A listener's non-blocking delivery endpoint.
pub trait DeliveryCallback: Send + Sync {
    /// Hand over a message without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError`] if the message could not be accepted.
    fn deliver(&self, message: TimedMessage) -> Result<(), DeliveryError>;
}

impl DeliveryCallback for mpsc::Sender<TimedMessage> {
    fn deliver(&self, message: TimedMessage) -> Result<(), DeliveryError> {
        self.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Registry error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The broker rejected the first subscription for a topic.
    #[error("failed to subscribe to {topic}: {source}")]
    Subscribe {
        /// Topic.
        topic: Topic,
        /// Broker error.
        source: BrokerError,
    },

    /// The broker rejected the unsubscription after the last listener left.
    #[error("failed to unsubscribe from {topic}: {source}")]
    Unsubscribe {
        /// Topic.
        topic: Topic,
        /// Broker error.
        source: BrokerError,
    },
}

// =============================================================================
// Topic Entries
// =============================================================================

type Listeners = Arc<RwLock<HashMap<SessionId, Arc<dyn DeliveryCallback>>>>;

#[derive(Debug, Default)]
struct TopicState {
    subscribed: bool,
    retired: bool,
}

struct TopicEntry {
    state: tokio::sync::Mutex<TopicState>,
    listeners: Listeners,
}

impl TopicEntry {
    fn new() -> Self {
        Self {
            state: tokio::sync::Mutex::new(TopicState::default()),
            listeners: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

/// Build the broker handler for a topic. Installed once per subscription.
fn dispatcher(topic: Topic, listeners: Listeners) -> MessageHandler {
    Arc::new(move |message: TimedMessage| {
        metrics::record_message_received(&topic);

        let listeners = listeners.read();
        for (session_id, callback) in listeners.iter() {
            match callback.deliver(message.clone()) {
                Ok(()) => {}
                Err(DeliveryError::Full) => {
                    tracing::warn!(topic = %topic, session_id, "session queue full, dropping message");
                    metrics::record_message_dropped(&topic);
                }
                Err(DeliveryError::Closed) => {
                    tracing::debug!(topic = %topic, session_id, "session closed before delivery");
                }
            }
        }
    })
}

// =============================================================================
// Registry
// =============================================================================

/// Reference-counted broker subscriptions keyed by topic.
pub struct TopicSubscriptionRegistry {
    broker: Arc<dyn BrokerClient>,
    qos: QosLevel,
    topics: Mutex<HashMap<Topic, Arc<TopicEntry>>>,
}

impl std::fmt::Debug for TopicSubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicSubscriptionRegistry")
            .field("qos", &self.qos)
            .field("topics", &self.topics.lock().len())
            .finish_non_exhaustive()
    }
}

impl TopicSubscriptionRegistry {
    /// Create a registry subscribing through `broker` at `qos`.
    #[must_use]
    pub fn new(broker: Arc<dyn BrokerClient>, qos: QosLevel) -> Self {
        Self {
            broker,
            qos,
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Add a listener for the model's topic.
    ///
    /// The first listener for a topic subscribes at the broker. Registering
    /// a session that is already listening is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Subscribe`] if the broker subscription fails;
    /// nothing is registered in that case.
    pub async fn register_listener(
        &self,
        model: &SubscriptionModel,
        session_id: SessionId,
        callback: Arc<dyn DeliveryCallback>,
    ) -> Result<(), RegistryError> {
        let topic = &model.topic;

        loop {
            let entry = Arc::clone(
                self.topics
                    .lock()
                    .entry(topic.clone())
                    .or_insert_with(|| Arc::new(TopicEntry::new())),
            );

            let mut state = entry.state.lock().await;
            if state.retired {
                continue;
            }

            if entry.listeners.read().contains_key(&session_id) {
                return Ok(());
            }

            if state.subscribed {
                entry.listeners.write().insert(session_id, Arc::clone(&callback));
                tracing::debug!(topic = %topic, session_id, "listener joined existing subscription");
                return Ok(());
            }

            // Counted only once the broker has accepted the subscription.

            let handler = dispatcher(topic.clone(), Arc::clone(&entry.listeners));
            let result = self.broker.subscribe(topic, self.qos, handler).await;
            metrics::record_broker_request(BrokerRequest::Subscribe, result.is_ok());

            return match result {
                Ok(()) => {
                    entry.listeners.write().insert(session_id, Arc::clone(&callback));
                    state.subscribed = true;
                    metrics::set_topic_subscriptions(self.topics.lock().len());
                    tracing::info!(topic = %topic, session_id, qos = %self.qos, "subscribed topic");
                    Ok(())
                }
                Err(source) => {
                    state.retired = true;
                    self.remove_entry(topic, &entry);
                    tracing::warn!(topic = %topic, session_id, error = %source, "topic subscription failed");
                    Err(RegistryError::Subscribe {
                        topic: topic.clone(),
                        source,
                    })
                }
            };
        }
    }

    /// Remove a listener from a topic.
    ///
    /// The last listener out unsubscribes at the broker. Unknown topics and
    /// sessions are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Unsubscribe`] if the broker unsubscription
    /// fails. The topic is forgotten locally either way.
    pub async fn deregister_listener(
        &self,
        topic: &str,
        session_id: SessionId,
    ) -> Result<(), RegistryError> {
        let Some(entry) = self.topics.lock().get(topic).cloned() else {
            return Ok(());
        };

        let mut state = entry.state.lock().await;
        if state.retired {
            return Ok(());
        }

        let remaining = {
            let mut listeners = entry.listeners.write();
            if listeners.remove(&session_id).is_none() {
                return Ok(());
            }
            listeners.len()
        };

        if remaining > 0 {
            tracing::debug!(topic = %topic, session_id, remaining, "listener left");
            return Ok(());
        }

        let result = if state.subscribed {
            self.broker.unsubscribe(topic).await
        } else {
            Ok(())
        };
        metrics::record_broker_request(BrokerRequest::Unsubscribe, result.is_ok());

        state.subscribed = false;
        state.retired = true;
        self.remove_entry(topic, &entry);
        drop(state);

        match result {
            Ok(()) => {
                tracing::info!(topic = %topic, session_id, "unsubscribed topic");
                Ok(())
            }
            Err(source) => {
                tracing::warn!(topic = %topic, session_id, error = %source, "topic unsubscription failed");
                Err(RegistryError::Unsubscribe {
                    topic: topic.to_string(),
                    source,
                })
            }
        }
    }

    fn remove_entry(&self, topic: &str, entry: &Arc<TopicEntry>) {
        let mut topics = self.topics.lock();
        if topics.get(topic).is_some_and(|current| Arc::ptr_eq(current, entry)) {
            topics.remove(topic);
        }
        metrics::set_topic_subscriptions(topics.len());
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Number of listeners on a topic.
    #[must_use]
    pub fn reference_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .get(topic)
            .map_or(0, |entry| entry.listeners.read().len())
    }

    /// Topics with at least one listener.
    #[must_use]
    pub fn active_topics(&self) -> Vec<Topic> {
        self.topics
            .lock()
            .iter()
            .filter(|(_, entry)| !entry.listeners.read().is_empty())
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let topics = self.topics.lock();
        let mut stats = RegistryStats::default();
        for entry in topics.values() {
            let listeners = entry.listeners.read().len();
            if listeners > 0 {
                stats.topic_count += 1;
                stats.listener_count += listeners;
            }
        }
        stats
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Topics with at least one listener.
    pub topic_count: usize,
    /// Listeners across all topics.
    pub listener_count: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::application::ports::MockBrokerClient;

    fn model(topic: &str) -> SubscriptionModel {
        SubscriptionModel::new(topic)
    }

    fn queue(capacity: usize) -> (Arc<dyn DeliveryCallback>, mpsc::Receiver<TimedMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Arc::new(tx), rx)
    }

    /// Broker that yields during every call and keeps the installed handlers.
    #[derive(Default)]
    struct SlowBroker {
        subscribes: AtomicUsize,
        unsubscribes: AtomicUsize,
        handlers: Mutex<HashMap<String, MessageHandler>>,
    }

    impl SlowBroker {
        fn publish(&self, topic: &str, payload: &str) {
            let handler = self.handlers.lock().get(topic).cloned();
            if let Some(handler) = handler {
                handler(TimedMessage::now(topic, payload.to_string()));
            }
        }
    }

    #[async_trait]
    impl BrokerClient for SlowBroker {
        async fn connect(&self) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn disconnect(&self) {}

        fn is_connected(&self) -> bool {
            true
        }

        async fn subscribe(
            &self,
            topic: &str,
            _qos: QosLevel,
            handler: MessageHandler,
        ) -> Result<(), BrokerError> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            self.handlers.lock().insert(topic.to_string(), handler);
            Ok(())
        }

        async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.unsubscribes.fetch_add(1, Ordering::SeqCst);
            self.handlers.lock().remove(topic);
            Ok(())
        }
    }

    #[tokio::test]
    async fn first_listener_subscribes() {
        let mut broker = MockBrokerClient::new();
        broker.expect_subscribe().times(1).returning(|_, _, _| Ok(()));
        let registry = TopicSubscriptionRegistry::new(Arc::new(broker), QosLevel::AtMostOnce);

        let (a, _rx_a) = queue(4);
        let (b, _rx_b) = queue(4);
        registry.register_listener(&model("t"), 1, a).await.unwrap();
        registry.register_listener(&model("t"), 2, b).await.unwrap();

        assert_eq!(registry.reference_count("t"), 2);
        assert_eq!(registry.active_topics(), vec!["t".to_string()]);
    }

    #[tokio::test]
    async fn reregistering_a_session_is_noop() {
        let mut broker = MockBrokerClient::new();
        broker.expect_subscribe().times(1).returning(|_, _, _| Ok(()));
        let registry = TopicSubscriptionRegistry::new(Arc::new(broker), QosLevel::AtMostOnce);

        let (a, _rx) = queue(4);
        registry.register_listener(&model("t"), 1, Arc::clone(&a)).await.unwrap();
        registry.register_listener(&model("t"), 1, a).await.unwrap();

        assert_eq!(registry.reference_count("t"), 1);
    }

    #[tokio::test]
    async fn last_listener_unsubscribes() {
        let mut broker = MockBrokerClient::new();
        broker.expect_subscribe().times(1).returning(|_, _, _| Ok(()));
        broker.expect_unsubscribe().times(1).returning(|_| Ok(()));
        let registry = TopicSubscriptionRegistry::new(Arc::new(broker), QosLevel::AtLeastOnce);

        let (a, _rx_a) = queue(4);
        let (b, _rx_b) = queue(4);
        registry.register_listener(&model("t"), 1, a).await.unwrap();
        registry.register_listener(&model("t"), 2, b).await.unwrap();

        registry.deregister_listener("t", 1).await.unwrap();
        assert_eq!(registry.reference_count("t"), 1);

        registry.deregister_listener("t", 2).await.unwrap();
        assert_eq!(registry.reference_count("t"), 0);
        assert!(registry.active_topics().is_empty());
    }

    #[tokio::test]
    async fn deregister_unknown_is_silent() {
        let mut broker = MockBrokerClient::new();
        broker.expect_subscribe().times(1).returning(|_, _, _| Ok(()));
        broker.expect_unsubscribe().never();
        let registry = TopicSubscriptionRegistry::new(Arc::new(broker), QosLevel::AtMostOnce);

        registry.deregister_listener("nothing", 1).await.unwrap();

        let (a, _rx) = queue(4);
        registry.register_listener(&model("t"), 1, a).await.unwrap();
        registry.deregister_listener("t", 99).await.unwrap();
        assert_eq!(registry.reference_count("t"), 1);
    }

    #[tokio::test]
    async fn subscribe_failure_registers_nothing() {
        let mut broker = MockBrokerClient::new();
        broker.expect_subscribe().times(2).returning(|topic, _, _| {
            Err(BrokerError::Subscription {
                topic: topic.to_string(),
                message: "not authorized".to_string(),
            })
        });
        broker.expect_unsubscribe().never();
        let registry = TopicSubscriptionRegistry::new(Arc::new(broker), QosLevel::AtMostOnce);

        let (a, _rx) = queue(4);
        let err = registry
            .register_listener(&model("t"), 1, Arc::clone(&a))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Subscribe { ref topic, .. } if topic == "t"));
        assert_eq!(registry.reference_count("t"), 0);
        assert_eq!(registry.stats(), RegistryStats::default());

        // A later attempt tries the broker again.
        assert!(registry.register_listener(&model("t"), 1, a).await.is_err());
    }

    #[tokio::test]
    async fn unsubscribe_failure_still_forgets_topic() {
        let mut broker = MockBrokerClient::new();
        broker.expect_subscribe().times(2).returning(|_, _, _| Ok(()));
        broker.expect_unsubscribe().times(1).returning(|topic| {
            Err(BrokerError::Unsubscription {
                topic: topic.to_string(),
                message: "gone".to_string(),
            })
        });
        let registry = TopicSubscriptionRegistry::new(Arc::new(broker), QosLevel::AtMostOnce);

        let (a, _rx) = queue(4);
        registry.register_listener(&model("t"), 1, Arc::clone(&a)).await.unwrap();
        let err = registry.deregister_listener("t", 1).await.unwrap_err();
        assert!(matches!(err, RegistryError::Unsubscribe { .. }));
        assert_eq!(registry.reference_count("t"), 0);

        // Next listener starts a fresh subscription.
        registry.register_listener(&model("t"), 2, a).await.unwrap();
        assert_eq!(registry.reference_count("t"), 1);
    }

    #[tokio::test]
    async fn concurrent_registration_subscribes_once() {
        let broker = Arc::new(SlowBroker::default());
        let registry = Arc::new(TopicSubscriptionRegistry::new(
            Arc::clone(&broker) as Arc<dyn BrokerClient>,
            QosLevel::AtMostOnce,
        ));

        let mut handles = Vec::new();
        let mut receivers = Vec::new();
        for session in 0..10u64 {
            let (tx, rx) = mpsc::channel::<TimedMessage>(4);
            receivers.push(rx);
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry
                    .register_listener(&SubscriptionModel::new("shared"), session, Arc::new(tx))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(broker.subscribes.load(Ordering::SeqCst), 1);
        assert_eq!(registry.reference_count("shared"), 10);

        let mut handles = Vec::new();
        for session in 0..10u64 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.deregister_listener("shared", session).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(broker.unsubscribes.load(Ordering::SeqCst), 1);
        assert_eq!(registry.reference_count("shared"), 0);
    }

    #[tokio::test]
    async fn register_racing_teardown_resubscribes() {
        let broker = Arc::new(SlowBroker::default());
        let registry = Arc::new(TopicSubscriptionRegistry::new(
            Arc::clone(&broker) as Arc<dyn BrokerClient>,
            QosLevel::AtMostOnce,
        ));

        let (a, _rx_a) = queue(4);
        registry.register_listener(&model("t"), 1, a).await.unwrap();

        let leaving = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.deregister_listener("t", 1).await })
        };
        tokio::task::yield_now().await;
        let (b, _rx_b) = queue(4);
        registry.register_listener(&model("t"), 2, b).await.unwrap();
        leaving.await.unwrap().unwrap();

        assert_eq!(registry.reference_count("t"), 1);
        assert_eq!(
            broker.subscribes.load(Ordering::SeqCst) - broker.unsubscribes.load(Ordering::SeqCst),
            1
        );
    }

    #[tokio::test]
    async fn messages_fan_out_to_every_listener() {
        let broker = Arc::new(SlowBroker::default());
        let registry = TopicSubscriptionRegistry::new(
            Arc::clone(&broker) as Arc<dyn BrokerClient>,
            QosLevel::AtMostOnce,
        );

        let (a, mut rx_a) = queue(4);
        let (b, mut rx_b) = queue(4);
        registry.register_listener(&model("t"), 1, a).await.unwrap();
        registry.register_listener(&model("t"), 2, b).await.unwrap();

        broker.publish("t", "hello");

        assert_eq!(&rx_a.recv().await.unwrap().payload[..], b"hello");
        assert_eq!(&rx_b.recv().await.unwrap().payload[..], b"hello");
    }

    #[tokio::test]
    async fn full_listener_does_not_block_siblings() {
        let broker = Arc::new(SlowBroker::default());
        let registry = TopicSubscriptionRegistry::new(
            Arc::clone(&broker) as Arc<dyn BrokerClient>,
            QosLevel::AtMostOnce,
        );

        let (slow, mut rx_slow) = queue(1);
        let (fast, mut rx_fast) = queue(8);
        registry.register_listener(&model("t"), 1, slow).await.unwrap();
        registry.register_listener(&model("t"), 2, fast).await.unwrap();

        for i in 0..3 {
            broker.publish("t", &i.to_string());
        }

        let mut fast_payloads = Vec::new();
        while let Ok(message) = rx_fast.try_recv() {
            fast_payloads.push(message.payload);
        }
        assert_eq!(fast_payloads, vec!["0", "1", "2"]);

        assert_eq!(&rx_slow.try_recv().unwrap().payload[..], b"0");
        assert!(rx_slow.try_recv().is_err());
    }

    #[tokio::test]
    async fn stats_count_topics_and_listeners() {
        let broker = Arc::new(SlowBroker::default());
        let registry = TopicSubscriptionRegistry::new(broker, QosLevel::AtMostOnce);

        let (a, _rx_a) = queue(1);
        let (b, _rx_b) = queue(1);
        let (c, _rx_c) = queue(1);
        registry.register_listener(&model("x"), 1, a).await.unwrap();
        registry.register_listener(&model("x"), 2, b).await.unwrap();
        registry.register_listener(&model("y"), 1, c).await.unwrap();

        assert_eq!(
            registry.stats(),
            RegistryStats {
                topic_count: 2,
                listener_count: 3
            }
        );
        let mut topics = registry.active_topics();
        topics.sort();
        assert_eq!(topics, vec!["x".to_string(), "y".to_string()]);
    }
}
