//! Shared test doubles.

#![allow(dead_code, clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use mqtt_stream_bridge::{BrokerClient, BrokerError, MessageHandler, QosLevel, TimedMessage};

/// In-memory broker that records calls and delivers published messages to
/// the installed handlers.
#[derive(Default)]
pub struct FakeBroker {
    pub subscribes: AtomicUsize,
    pub unsubscribes: AtomicUsize,
    pub connects: AtomicUsize,
    pub fail_subscribe: AtomicBool,
    pub fail_connect: AtomicBool,
    pub subscribe_delay: Option<Duration>,
    handlers: Mutex<HashMap<String, MessageHandler>>,
}

impl FakeBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            subscribe_delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }

    pub fn has_handler(&self, topic: &str) -> bool {
        self.handlers.lock().contains_key(topic)
    }

    /// Deliver a payload to the handler for `topic`, if any.
    pub fn publish(&self, topic: &str, payload: impl Into<bytes::Bytes>) -> bool {
        let handler = self.handlers.lock().get(topic).cloned();
        handler.is_some_and(|handler| {
            handler(TimedMessage::now(topic, payload));
            true
        })
    }
}

#[async_trait]
impl BrokerClient for FakeBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection {
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }

    async fn disconnect(&self) {}

    fn is_connected(&self) -> bool {
        !self.fail_connect.load(Ordering::SeqCst)
    }

    async fn subscribe(
        &self,
        topic: &str,
        _qos: QosLevel,
        handler: MessageHandler,
    ) -> Result<(), BrokerError> {
        if let Some(delay) = self.subscribe_delay {
            tokio::time::sleep(delay).await;
        }
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(BrokerError::Subscription {
                topic: topic.to_string(),
                message: "not authorized".to_string(),
            });
        }
        self.handlers.lock().insert(topic.to_string(), handler);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        self.handlers.lock().remove(topic);
        Ok(())
    }
}

/// Poll `condition` until it holds or a second passes.
pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(condition(), "condition not reached in time");
}
