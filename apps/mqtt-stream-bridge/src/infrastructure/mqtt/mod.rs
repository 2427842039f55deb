//! MQTT Broker Adapter
//!
//! [`BrokerClient`] implementation on top of `rumqttc`. One background task
//! owns the event loop: it connects on demand, routes PUBLISH packets to the
//! handlers whose filter matches, correlates SUBACK/UNSUBACK with the calls
//! waiting on them and reconnects with backoff when an established
//! connection drops.
//!
//! # Connection lifecycle
//!
//! ```text
//! Disconnected --connect()--> Connecting --CONNACK--> Connected
//!       ^                        |                        |
//!       |                    error (first try)      error / disconnect()
//!       +------------------------+------------------------+
//! ```
//!
//! Losing an established connection keeps the connection wanted: the task
//! backs off and reconnects, re-subscribing every live filter when the broker
//! did not resume the session. A failed first attempt goes back to idle and
//! is retried lazily by the next `connect()`.

mod backoff;
mod endpoint;
mod topic;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rumqttc::{
    AsyncClient, ConnAck, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish, QoS, Request,
    SubAck, SubscribeReasonCode, Transport,
};
use tokio::sync::{Notify, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use backoff::Backoff;
pub use endpoint::{Endpoint, EndpointError};

use crate::application::ports::{BrokerClient, BrokerError, MessageHandler, QosLevel};
use crate::domain::streaming::TimedMessage;
use crate::infrastructure::config::{DatasourceSettings, ReconnectSettings};

/// Client request queue depth.
const REQUEST_CAPACITY: usize = 64;
const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Connection state published by the event loop task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Idle, nothing in progress.
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// CONNACK received.
    Connected,
    /// Last attempt failed.
    Failed(String),
}

struct Route {
    qos: QosLevel,
    handler: MessageHandler,
}

struct Waiter {
    topic: String,
    reply: oneshot::Sender<Result<(), BrokerError>>,
}

/// Matches acknowledgements to the calls waiting for them.
///
/// Requests are queued in the order they enter the client channel, which is
/// the order the event loop reports them as sent with their packet id.
/// `None` marks a request nobody waits for.
#[derive(Default)]
struct Correlator {
    queued: VecDeque<Option<Waiter>>,
    in_flight: HashMap<u16, Waiter>,
}

impl Correlator {
    fn sent(&mut self, pkid: u16) {
        if let Some(Some(waiter)) = self.queued.pop_front() {
            self.in_flight.insert(pkid, waiter);
        }
    }

    fn acked(&mut self, pkid: u16) -> Option<Waiter> {
        self.in_flight.remove(&pkid)
    }

    fn fail_all(&mut self, error: impl Fn(String) -> BrokerError) {
        let waiters = self
            .queued
            .drain(..)
            .flatten()
            .chain(self.in_flight.drain().map(|(_, waiter)| waiter));
        for waiter in waiters {
            let _ = waiter.reply.send(Err(error(waiter.topic)));
        }
    }
}

struct Shared {
    endpoint: Endpoint,
    state: watch::Sender<ConnectionState>,
    wanted: AtomicBool,
    stopped: AtomicBool,
    wake: Notify,
    drop_connection: Notify,
    routes: RwLock<HashMap<String, Route>>,
    subscribes: Mutex<Correlator>,
    unsubscribes: Mutex<Correlator>,
}

impl Shared {
    fn wanted(&self) -> bool {
        self.wanted.load(Ordering::Acquire)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn mark_connecting(&self) {
        self.state.send_if_modified(|state| {
            if matches!(state, ConnectionState::Connected | ConnectionState::Connecting) {
                false
            } else {
                *state = ConnectionState::Connecting;
                true
            }
        });
    }

    fn fail_pending(&self, reason: &str) {
        let mut subscribes = self.subscribes.lock();
        let mut unsubscribes = self.unsubscribes.lock();
        fail_correlators(&mut subscribes, &mut unsubscribes, reason);
    }

    /// Drop the connection's unsent requests and fail everyone waiting.
    ///
    /// `EventLoop::clean` parks unsent requests for replay on the next
    /// connection. Their waiters are failed here, so replayed SUBSCRIBE or
    /// UNSUBSCRIBE packets would take the packet ids of later callers. Both
    /// correlator locks are held across the drain so no caller can queue a
    /// request in between.
    fn abandon_requests(&self, eventloop: &mut EventLoop, reason: &str) {
        let mut subscribes = self.subscribes.lock();
        let mut unsubscribes = self.unsubscribes.lock();
        eventloop.clean();
        discard_replays(&mut eventloop.pending);
        fail_correlators(&mut subscribes, &mut unsubscribes, reason);
    }

    fn dispatch(&self, publish: Publish) {
        let handlers: Vec<MessageHandler> = self
            .routes
            .read()
            .iter()
            .filter(|(filter, _)| topic::matches(filter, &publish.topic))
            .map(|(_, route)| Arc::clone(&route.handler))
            .collect();

        if handlers.is_empty() {
            tracing::trace!(topic = %publish.topic, "no handler for message");
            return;
        }

        let message = TimedMessage::now(publish.topic, publish.payload);
        for handler in handlers {
            handler(message.clone());
        }
    }

    fn on_suback(&self, ack: &SubAck) {
        let Some(waiter) = self.subscribes.lock().acked(ack.pkid) else {
            return;
        };
        let refused = ack
            .return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure));
        let result = if refused {
            Err(BrokerError::Subscription {
                topic: waiter.topic,
                message: "refused by broker".to_string(),
            })
        } else {
            Ok(())
        };
        let _ = waiter.reply.send(result);
    }

    fn on_unsuback(&self, pkid: u16) {
        if let Some(waiter) = self.unsubscribes.lock().acked(pkid) {
            let _ = waiter.reply.send(Ok(()));
        }
    }

    /// Re-issue SUBSCRIBE for every routed filter after a fresh session.
    fn resubscribe(&self, client: &AsyncClient) {
        let routes: Vec<(String, QosLevel)> = self
            .routes
            .read()
            .iter()
            .map(|(filter, route)| (filter.clone(), route.qos))
            .collect();
        if routes.is_empty() {
            return;
        }

        let mut subscribes = self.subscribes.lock();
        for (filter, qos) in routes {
            match client.try_subscribe(filter.as_str(), to_qos(qos)) {
                Ok(()) => subscribes.queued.push_back(None),
                Err(e) => tracing::warn!(topic = %filter, error = %e, "failed to restore subscription"),
            }
        }
        tracing::info!(topics = subscribes.queued.len(), "restoring subscriptions");
    }
}

/// MQTT broker connection.
pub struct MqttBroker {
    client: AsyncClient,
    shared: Arc<Shared>,
    grace: Duration,
}

impl std::fmt::Debug for MqttBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttBroker")
            .field("endpoint", &self.shared.endpoint)
            .field("state", &*self.shared.state.borrow())
            .finish_non_exhaustive()
    }
}

impl MqttBroker {
    /// Build the client and spawn its event loop task.
    ///
    /// Nothing is sent to the broker until the first `connect()` or
    /// `subscribe()`. The task stops when `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Connection`] if the broker URL or client id is
    /// unusable.
    pub fn start(
        settings: &DatasourceSettings,
        reconnect: ReconnectSettings,
        grace: Duration,
        cancel: CancellationToken,
    ) -> Result<(Self, JoinHandle<()>), BrokerError> {
        let endpoint = Endpoint::parse(&settings.broker_url).map_err(|e| BrokerError::Connection {
            message: e.to_string(),
        })?;

        if settings.client_id.is_empty() || settings.client_id.starts_with(' ') {
            return Err(BrokerError::Connection {
                message: format!("invalid client id {:?}", settings.client_id),
            });
        }

        let mut options = MqttOptions::new(&settings.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(KEEP_ALIVE).set_clean_session(true);
        if endpoint.tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        let username = settings.username.clone().or_else(|| endpoint.username.clone());
        let password = settings.password.clone().or_else(|| endpoint.password.clone());
        if let Some(username) = username {
            options.set_credentials(username, password.unwrap_or_default());
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            endpoint,
            state,
            wanted: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            wake: Notify::new(),
            drop_connection: Notify::new(),
            routes: RwLock::new(HashMap::new()),
            subscribes: Mutex::new(Correlator::default()),
            unsubscribes: Mutex::new(Correlator::default()),
        });

        let task = tokio::spawn(drive(
            eventloop,
            client.clone(),
            Arc::clone(&shared),
            reconnect,
            cancel,
        ));

        Ok((
            Self {
                client,
                shared,
                grace,
            },
            task,
        ))
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    /// Broker endpoint without credentials.
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }
}

#[async_trait]
impl BrokerClient for MqttBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        let mut state = self.shared.state.subscribe();
        if *state.borrow_and_update() == ConnectionState::Connected {
            return Ok(());
        }
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(BrokerError::Connection {
                message: "event loop stopped".to_string(),
            });
        }

        if !self.shared.wanted.swap(true, Ordering::AcqRel) {
            tracing::info!(url = %self.shared.endpoint, "attempting broker connection");
        }
        self.shared.wake.notify_one();

        loop {
            state.changed().await.map_err(|_| BrokerError::Connection {
                message: "event loop stopped".to_string(),
            })?;
            let current = state.borrow_and_update().clone();
            match current {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting => {}
                ConnectionState::Failed(message) => {
                    return Err(BrokerError::Connection { message });
                }
                ConnectionState::Disconnected => {
                    return Err(BrokerError::Connection {
                        message: "connection closed".to_string(),
                    });
                }
            }
        }
    }

    async fn disconnect(&self) {
        self.shared.wanted.store(false, Ordering::Release);
        self.shared.wake.notify_one();
        if !self.is_connected() {
            return;
        }

        tracing::info!(url = %self.shared.endpoint, "disconnecting from broker");
        if let Err(e) = self.client.try_disconnect() {
            tracing::debug!(error = %e, "disconnect request not queued");
        }

        let mut state = self.shared.state.subscribe();
        let closed = tokio::time::timeout(
            self.grace,
            state.wait_for(|s| *s != ConnectionState::Connected),
        )
        .await
        .is_ok_and(|r| r.is_ok());
        if !closed {
            self.shared.drop_connection.notify_one();
        }
        tracing::info!(url = %self.shared.endpoint, "disconnected from broker");
    }

    fn is_connected(&self) -> bool {
        *self.shared.state.borrow() == ConnectionState::Connected
    }

    async fn subscribe(
        &self,
        topic: &str,
        qos: QosLevel,
        handler: MessageHandler,
    ) -> Result<(), BrokerError> {
        self.connect().await?;

        self.shared
            .routes
            .write()
            .insert(topic.to_string(), Route { qos, handler });

        let (reply, acked) = oneshot::channel();
        {
            let mut subscribes = self.shared.subscribes.lock();
            if let Err(e) = self.client.try_subscribe(topic, to_qos(qos)) {
                drop(subscribes);
                self.shared.routes.write().remove(topic);
                return Err(BrokerError::RequestRejected {
                    message: e.to_string(),
                });
            }
            subscribes.queued.push_back(Some(Waiter {
                topic: topic.to_string(),
                reply,
            }));
        }

        let result = acked.await.unwrap_or_else(|_| {
            Err(BrokerError::Subscription {
                topic: topic.to_string(),
                message: "event loop stopped".to_string(),
            })
        });
        match &result {
            Ok(()) => tracing::debug!(topic, %qos, "subscribed"),
            Err(_) => {
                self.shared.routes.write().remove(topic);
            }
        }
        result
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.shared.routes.write().remove(topic);
        if !self.is_connected() {
            return Ok(());
        }

        let (reply, acked) = oneshot::channel();
        {
            let mut unsubscribes = self.shared.unsubscribes.lock();
            self.client
                .try_unsubscribe(topic)
                .map_err(|e| BrokerError::RequestRejected {
                    message: e.to_string(),
                })?;
            unsubscribes.queued.push_back(Some(Waiter {
                topic: topic.to_string(),
                reply,
            }));
        }

        let result = acked.await.unwrap_or_else(|_| {
            Err(BrokerError::Unsubscription {
                topic: topic.to_string(),
                message: "event loop stopped".to_string(),
            })
        });
        if result.is_ok() {
            tracing::debug!(topic, "unsubscribed");
        }
        result
    }
}

fn fail_correlators(subscribes: &mut Correlator, unsubscribes: &mut Correlator, reason: &str) {
    subscribes.fail_all(|topic| BrokerError::Subscription {
        topic,
        message: reason.to_string(),
    });
    unsubscribes.fail_all(|topic| BrokerError::Unsubscription {
        topic,
        message: reason.to_string(),
    });
}

/// Keep only the requests that are safe to replay on a new connection.
fn discard_replays(pending: &mut VecDeque<Request>) {
    pending.retain(|request| {
        !matches!(
            request,
            Request::Subscribe(_) | Request::Unsubscribe(_) | Request::Disconnect(_)
        )
    });
}

const fn to_qos(qos: QosLevel) -> QoS {
    match qos {
        QosLevel::AtMostOnce => QoS::AtMostOnce,
        QosLevel::AtLeastOnce => QoS::AtLeastOnce,
        QosLevel::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// Event loop task.
async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    shared: Arc<Shared>,
    reconnect: ReconnectSettings,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new(&reconnect);
    let mut established = false;
    let mut reconnecting = false;

    loop {
        if !shared.wanted() {
            shared.state.send_if_modified(|state| {
                let idle = *state == ConnectionState::Connecting;
                if idle {
                    *state = ConnectionState::Disconnected;
                }
                idle
            });
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = shared.wake.notified() => continue,
            }
        }

        shared.mark_connecting();

        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = shared.drop_connection.notified() => {
                if !shared.wanted() {
                    established = false;
                    reconnecting = false;
                    shared.abandon_requests(&mut eventloop, "connection closed");
                    shared.set_state(ConnectionState::Disconnected);
                }
                continue;
            }
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ConnAck { session_present, .. }))) => {
                established = true;
                reconnecting = false;
                backoff.reset();
                shared.set_state(ConnectionState::Connected);
                tracing::info!(url = %shared.endpoint, session_present, "connected to broker");
                if !session_present {
                    shared.resubscribe(&client);
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => shared.dispatch(publish),
            Ok(Event::Incoming(Packet::SubAck(ack))) => shared.on_suback(&ack),
            Ok(Event::Incoming(Packet::UnsubAck(ack))) => shared.on_unsuback(ack.pkid),
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => shared.subscribes.lock().sent(pkid),
            Ok(Event::Outgoing(Outgoing::Unsubscribe(pkid))) => {
                shared.unsubscribes.lock().sent(pkid);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                established = false;
                reconnecting = false;
                shared.abandon_requests(&mut eventloop, "connection closed");
                shared.set_state(ConnectionState::Disconnected);
            }
            Ok(_) => {}
            Err(e) => {
                let message = e.to_string();
                shared.abandon_requests(&mut eventloop, &message);

                if !shared.wanted() {
                    established = false;
                    reconnecting = false;
                    shared.set_state(ConnectionState::Disconnected);
                    continue;
                }

                if established {
                    tracing::warn!(url = %shared.endpoint, error = %message, "broker connection lost");
                } else {
                    tracing::warn!(url = %shared.endpoint, error = %message, "broker connection attempt failed");
                }
                reconnecting |= std::mem::take(&mut established);

                let retry = if reconnect.enabled && reconnecting {
                    let delay = backoff.next_delay();
                    if delay.is_none() {
                        tracing::error!(
                            url = %shared.endpoint,
                            attempts = backoff.attempts(),
                            "giving up reconnecting to broker"
                        );
                        reconnecting = false;
                        backoff.reset();
                    }
                    delay
                } else {
                    None
                };

                // Clear the want before publishing the failure: a connect()
                // that reacts to `Failed` must be able to set it again.
                if retry.is_none() {
                    shared.wanted.store(false, Ordering::Release);
                }
                shared.set_state(ConnectionState::Failed(message));

                let Some(delay) = retry else {
                    continue;
                };

                tracing::info!(
                    url = %shared.endpoint,
                    attempt = backoff.attempts(),
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "reconnecting to broker"
                );
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                    () = shared.wake.notified() => {}
                }
            }
        }
    }

    shared.stopped.store(true, Ordering::Release);
    shared.fail_pending("event loop stopped");
    shared.set_state(ConnectionState::Disconnected);
    tracing::debug!("broker event loop stopped");
}
