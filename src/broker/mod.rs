//! MQTT broker session
//!
//! Owns exactly one broker connection and its state machine:
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──CONNACK──► Connected ──SUBACK──► Subscribed
//!                                 │                        │                    │
//!                          refused/timeout                 └──── drop ──► Lost ◄┘
//!                                 ▼                                        │
//!                           Disconnected                   (reconnect delay, poll again)
//!                                                                          ▼
//!                                                              Connecting (reconnect)
//! ```
//!
//! Two background tasks per session:
//! 1. the event loop, which polls `rumqttc` and drives the state machine
//!    (and re-subscribes after every CONNACK, since broker-side subscription
//!    state is not trusted to survive a drop)
//! 2. the delivery task, which hands inbound publishes to the
//!    [`MessageHandler`] so a slow handler never stalls keep-alive traffic
//!
//! `disconnect()` is terminal: a new session is needed afterwards.

pub mod endpoint;

use crate::config::BrokerConfig;
use crate::credentials::Credentials;
use crate::status::StatusBus;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ClientError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubAck,
    SubscribeReasonCode, Transport,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use endpoint::{Endpoint, SessionIdentity};

/// The one topic the relay listens on
pub const TOPIC: &str = "sms";

/// How long `disconnect()` waits for the DISCONNECT packet to go out
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("missing credential field: {0}")]
    MissingCredentials(&'static str),

    #[error("invalid broker endpoint {0}")]
    InvalidEndpoint(String),

    #[error("failed to connect: {0}")]
    ConnectFailed(String),

    #[error("timed out connecting to broker")]
    ConnectTimeout,

    #[error("broker rejected subscription to {0}")]
    SubscribeRejected(String),

    #[error("no answer from broker to subscription to {0}")]
    SubscribeTimeout(String),

    #[error("not connected to broker")]
    NotConnected,

    #[error("offline publish buffer is full")]
    BufferFull,

    #[error("session has been disconnected")]
    Closed,

    #[error("mqtt client error: {0}")]
    Client(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Subscribed,
    Lost,
}

/// Transient notifications about the session, one per transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected { reconnect: bool },
    ConnectFailed { cause: String },
    ConnectionLost { cause: String },
    Subscribed { topic: String },
    SubscribeFailed { topic: String, cause: String },
    Disconnected,
}

/// Receives inbound broker messages on the session's delivery task
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, topic: &str, payload: &[u8]);
}

#[derive(Debug)]
struct InboundMessage {
    topic: String,
    payload: Bytes,
}

type SubscribeWaiter = oneshot::Sender<Result<(), BrokerError>>;

#[derive(Debug)]
struct PendingSubscribe {
    id: u64,
    topic: String,
    /// `None` for the automatic subscribe, or once the caller gave up
    waiter: Option<SubscribeWaiter>,
}

impl PendingSubscribe {
    fn resolve(self, result: Result<(), BrokerError>) {
        if let Some(waiter) = self.waiter {
            let _ = waiter.send(result);
        }
    }
}

/// Broker-side subscription bookkeeping.
///
/// A SUBSCRIBE is first handed to the client's request channel (`queued`,
/// in send order), gets its packet id once it is written to the wire
/// (`inflight`), and is settled by the SUBACK carrying that id.
#[derive(Debug, Default)]
struct Subscriptions {
    active: HashSet<String>,
    queued: VecDeque<PendingSubscribe>,
    inflight: HashMap<u16, PendingSubscribe>,
    next_id: u64,
}

/// State shared between the session handle and its event loop
struct Shared {
    state: watch::Sender<ConnectionState>,
    status: Arc<StatusBus>,
    events: broadcast::Sender<SessionEvent>,
    subscriptions: Mutex<Subscriptions>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Broker session: {:?} -> {:?}", previous, state);
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No listeners is fine
        let _ = self.events.send(event);
    }

    fn subscriptions(&self) -> MutexGuard<'_, Subscriptions> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions().active.contains(topic)
    }

    /// Queue a SUBSCRIBE without ever waiting on the request channel.
    ///
    /// Returns an id for [`abandon_subscribe`](Self::abandon_subscribe). A
    /// full channel on the automatic subscribe is left to the caller to
    /// retry; every other failure is reported here.
    fn request_subscribe(
        &self,
        client: &AsyncClient,
        topic: &str,
        waiter: Option<SubscribeWaiter>,
    ) -> Result<u64, BrokerError> {
        let mut subs = self.subscriptions();

        match client.try_subscribe(topic, QoS::AtMostOnce) {
            Ok(()) => {
                let id = subs.next_id;
                subs.next_id += 1;
                debug!("SUBSCRIBE {} queued", topic);
                subs.queued.push_back(PendingSubscribe {
                    id,
                    topic: topic.to_string(),
                    waiter,
                });
                Ok(id)
            }
            Err(e) => {
                let err = client_error(e);
                if waiter.is_none() && err == BrokerError::BufferFull {
                    return Err(err);
                }
                warn!("Failed to subscribe to {}: {}", topic, err);
                self.emit(SessionEvent::SubscribeFailed {
                    topic: topic.to_string(),
                    cause: err.to_string(),
                });
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Err(err.clone()));
                }
                Err(err)
            }
        }
    }

    /// Issue the automatic subscribe to [`TOPIC`] unless one is already
    /// waiting to go out. `false` means the request channel is full and this
    /// has to be tried again once the client drains it.
    fn resubscribe(&self, client: &AsyncClient) -> bool {
        if self.subscriptions().queued.iter().any(|p| p.topic == TOPIC) {
            return true;
        }
        match self.request_subscribe(client, TOPIC, None) {
            Err(BrokerError::BufferFull) => {
                debug!("Request channel full, SUBSCRIBE {} deferred", TOPIC);
                false
            }
            // Any other failure has been reported
            _ => true,
        }
    }

    fn on_subscribe_sent(&self, pkid: u16) {
        let mut subs = self.subscriptions();
        match subs.queued.pop_front() {
            Some(pending) => {
                debug!("SUBSCRIBE {} sent (pkid {})", pending.topic, pkid);
                subs.inflight.insert(pkid, pending);
            }
            None => debug!("SUBSCRIBE pkid {} sent with nothing queued", pkid),
        }
    }

    /// The caller stopped waiting; a late SUBACK for it is still honoured
    /// but must never settle someone else's subscribe
    fn abandon_subscribe(&self, id: u64) {
        let mut subs = self.subscriptions();
        if let Some(pending) = subs.queued.iter_mut().find(|p| p.id == id) {
            pending.waiter = None;
            return;
        }
        let pkid = subs
            .inflight
            .iter()
            .find_map(|(pkid, p)| (p.id == id).then_some(*pkid));
        if let Some(pkid) = pkid {
            subs.inflight.remove(&pkid);
        }
    }

    fn on_connected(&self, reconnect: bool) {
        self.subscriptions().active.clear();
        self.set_state(ConnectionState::Connected);
        if reconnect {
            info!("Reconnected to broker");
        } else {
            info!("Connected to broker");
        }
        self.emit(SessionEvent::Connected { reconnect });
    }

    fn on_suback(&self, ack: &SubAck) {
        let Some(pending) = self.subscriptions().inflight.remove(&ack.pkid) else {
            debug!("SUBACK {} for no pending subscribe", ack.pkid);
            return;
        };

        let accepted = ack
            .return_codes
            .iter()
            .all(|code| matches!(code, SubscribeReasonCode::Success(_)));

        if accepted {
            self.subscriptions().active.insert(pending.topic.clone());
            self.set_state(ConnectionState::Subscribed);
            self.status.publish(true);
            info!("Subscribed to {}", pending.topic);
            self.emit(SessionEvent::Subscribed {
                topic: pending.topic.clone(),
            });
            pending.resolve(Ok(()));
        } else {
            let err = BrokerError::SubscribeRejected(pending.topic.clone());
            error!(
                "Failed to subscribe to {}: {:?}",
                pending.topic, ack.return_codes
            );
            self.emit(SessionEvent::SubscribeFailed {
                topic: pending.topic.clone(),
                cause: err.to_string(),
            });
            pending.resolve(Err(err));
        }
    }

    /// Forget broker-side subscription state and fail whoever waits on it.
    ///
    /// With `keep_queued`, subscribes still sitting in the request channel
    /// stay tracked: the client sends them after it reconnects.
    fn drop_subscriptions(&self, err: BrokerError, keep_queued: bool) {
        let dropped: Vec<PendingSubscribe> = {
            let mut subs = self.subscriptions();
            subs.active.clear();
            let mut dropped: Vec<_> = subs.inflight.drain().map(|(_, p)| p).collect();
            if !keep_queued {
                dropped.extend(subs.queued.drain(..));
            }
            dropped
        };
        for pending in dropped {
            pending.resolve(Err(err.clone()));
        }
    }

    fn on_connection_lost(&self, cause: &str) {
        self.set_state(ConnectionState::Lost);
        self.status.publish(false);
        self.drop_subscriptions(BrokerError::NotConnected, true);
        warn!("The connection was lost: {}", cause);
        self.emit(SessionEvent::ConnectionLost {
            cause: cause.to_string(),
        });
    }

    fn on_connect_failed(&self, cause: &str) {
        self.set_state(ConnectionState::Disconnected);
        self.status.publish(false);
        error!("Failed to connect: {}", cause);
        self.emit(SessionEvent::ConnectFailed {
            cause: cause.to_string(),
        });
    }
}

fn client_error(e: ClientError) -> BrokerError {
    match e {
        ClientError::TryRequest(_) => BrokerError::BufferFull,
        other => BrokerError::Client(other.to_string()),
    }
}

pub struct BrokerSession {
    config: BrokerConfig,
    shared: Arc<Shared>,
    handler: Option<Arc<dyn MessageHandler>>,
    identity: Option<SessionIdentity>,
    client: Option<AsyncClient>,
    event_loop: Option<JoinHandle<()>>,
    delivery: Option<JoinHandle<()>>,
    closed: bool,
}

impl BrokerSession {
    /// Create an idle session; nothing touches the network until `connect`
    pub fn new(
        config: BrokerConfig,
        status: Arc<StatusBus>,
        handler: Option<Arc<dyn MessageHandler>>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(32);

        Self {
            config,
            shared: Arc::new(Shared {
                state,
                status,
                events,
                subscriptions: Mutex::new(Subscriptions::default()),
            }),
            handler,
            identity: None,
            client: None,
            event_loop: None,
            delivery: None,
            closed: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub fn identity(&self) -> Option<&SessionIdentity> {
        self.identity.as_ref()
    }

    pub fn is_subscribed(&self) -> bool {
        self.shared.state() == ConnectionState::Subscribed
    }

    /// Connected now, or the event loop is still working on it
    pub fn is_active(&self) -> bool {
        !self.closed
            && self
                .event_loop
                .as_ref()
                .map(|task| !task.is_finished())
                .unwrap_or(false)
    }

    /// Open the connection and wait for the first CONNACK.
    ///
    /// The subscribe to [`TOPIC`] is issued automatically once connected; its
    /// outcome shows up in [`state`](Self::state) and the status bus. After a
    /// successful connect, later transport drops are retried in the
    /// background indefinitely.
    pub async fn connect(&mut self, credentials: &Credentials) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        if self.is_active() {
            debug!("connect() on an active session is a no-op");
            return Ok(());
        }

        if let Some(field) = credentials.missing_field() {
            let err = BrokerError::MissingCredentials(field);
            self.shared.on_connect_failed(&err.to_string());
            return Err(err);
        }

        let endpoint = match Endpoint::parse(&credentials.endpoint) {
            Ok(endpoint) => endpoint,
            Err(err) => {
                self.shared.on_connect_failed(&err.to_string());
                return Err(err);
            }
        };

        let identity = SessionIdentity::new(&credentials.username);
        info!(
            "Connecting to {} as {} (client id {})",
            endpoint,
            credentials.username,
            identity.client_id()
        );

        let mut options =
            MqttOptions::new(identity.client_id(), endpoint.host.clone(), endpoint.port);
        options
            .set_keep_alive(self.config.keep_alive())
            .set_credentials(credentials.username.clone(), credentials.password.clone())
            .set_clean_session(false);
        if endpoint.tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, eventloop) = AsyncClient::new(options, self.config.offline_buffer.max(1));
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        let (first_tx, first_rx) = oneshot::channel();

        self.shared.set_state(ConnectionState::Connecting);
        self.delivery = Some(tokio::spawn(run_delivery(delivery_rx, self.handler.clone())));
        self.event_loop = Some(tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            self.shared.clone(),
            delivery_tx,
            first_tx,
            self.config.reconnect_delay(),
        )));
        self.identity = Some(identity);
        self.client = Some(client);

        let outcome = match tokio::time::timeout(self.config.connect_timeout(), first_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BrokerError::ConnectFailed(
                "event loop ended before connecting".to_string(),
            )),
            Err(_) => {
                self.shared.on_connect_failed("timed out");
                Err(BrokerError::ConnectTimeout)
            }
        };

        if outcome.is_err() {
            self.stop_tasks();
            self.client = None;
            self.shared.set_state(ConnectionState::Disconnected);
        }
        outcome
    }

    /// Subscribe to `topic` and wait for the broker's answer, at most
    /// `connect_timeout`.
    ///
    /// Already subscribed is an immediate success.
    pub async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        if self.shared.is_subscribed(topic) {
            debug!("Already subscribed to {}", topic);
            return Ok(());
        }
        let client = self.client.as_ref().ok_or(BrokerError::NotConnected)?;

        let (tx, rx) = oneshot::channel();
        let id = self.shared.request_subscribe(client, topic, Some(tx))?;

        match tokio::time::timeout(self.config.connect_timeout(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BrokerError::NotConnected),
            Err(_) => {
                self.shared.abandon_subscribe(id);
                warn!("No SUBACK for {} in time", topic);
                Err(BrokerError::SubscribeTimeout(topic.to_string()))
            }
        }
    }

    /// Publish with QoS 1. While offline, messages wait in memory (up to
    /// `offline_buffer`); once that is full this fails fast.
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        let client = self.client.as_ref().ok_or(BrokerError::NotConnected)?;
        client
            .try_publish(topic, QoS::AtLeastOnce, false, payload.into())
            .map_err(client_error)
    }

    /// Release the connection. Safe to call more than once.
    pub async fn disconnect(&mut self) -> Result<(), BrokerError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut result = Ok(());
        if let Some(client) = self.client.take() {
            if let Err(e) = client.try_disconnect() {
                debug!("DISCONNECT not queued: {}", e);
                result = Err(client_error(e));
            }
        }

        if let Some(mut task) = self.event_loop.take() {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        if let Some(task) = self.delivery.take() {
            task.abort();
        }

        self.shared.drop_subscriptions(BrokerError::Closed, false);
        self.shared.set_state(ConnectionState::Disconnected);
        self.shared.status.publish(false);
        self.shared.emit(SessionEvent::Disconnected);
        info!("Disconnected from broker");
        result
    }

    fn stop_tasks(&mut self) {
        if let Some(task) = self.event_loop.take() {
            task.abort();
        }
        if let Some(task) = self.delivery.take() {
            task.abort();
        }
    }
}

impl Drop for BrokerSession {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    shared: Arc<Shared>,
    deliveries: mpsc::UnboundedSender<InboundMessage>,
    first: oneshot::Sender<Result<(), BrokerError>>,
    reconnect_delay: Duration,
) {
    let mut first = Some(first);
    let mut has_connected = false;
    let mut online = false;
    let mut resubscribe_due = false;

    loop {
        // Offline publishes can fill the request channel; the client drains
        // it once connected, so keep trying after every event
        if online && resubscribe_due {
            resubscribe_due = !shared.resubscribe(&client);
        }

        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                debug!("CONNACK (session present: {})", ack.session_present);
                let reconnect = has_connected;
                has_connected = true;
                online = true;
                shared.on_connected(reconnect);
                if let Some(first) = first.take() {
                    let _ = first.send(Ok(()));
                }
                resubscribe_due = true;
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => shared.on_subscribe_sent(pkid),
            Ok(Event::Incoming(Packet::SubAck(ack))) => shared.on_suback(&ack),
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(
                    "PUBLISH on {} ({} bytes)",
                    publish.topic,
                    publish.payload.len()
                );
                let message = InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                };
                if deliveries.send(message).is_err() {
                    warn!("Delivery task is gone, dropping message");
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("DISCONNECT sent, stopping event loop");
                break;
            }
            Ok(event) => {
                debug!("MQTT event: {:?}", event);
            }
            Err(e) => {
                resubscribe_due = false;
                let cause = e.to_string();
                if !has_connected {
                    shared.on_connect_failed(&cause);
                    if let Some(first) = first.take() {
                        let _ = first.send(Err(BrokerError::ConnectFailed(cause)));
                    }
                    break;
                }

                if online {
                    online = false;
                    shared.on_connection_lost(&cause);
                } else {
                    debug!("Reconnect attempt failed: {}", cause);
                    shared.set_state(ConnectionState::Lost);
                }

                tokio::time::sleep(reconnect_delay).await;
                shared.set_state(ConnectionState::Connecting);
            }
        }
    }
}

async fn run_delivery(
    mut rx: mpsc::UnboundedReceiver<InboundMessage>,
    handler: Option<Arc<dyn MessageHandler>>,
) {
    while let Some(message) = rx.recv().await {
        let Some(handler) = handler.as_ref() else {
            debug!("No handler attached, dropping message on {}", message.topic);
            continue;
        };

        let delivered = std::panic::catch_unwind(AssertUnwindSafe(|| {
            handler.on_message(&message.topic, &message.payload)
        }));
        if delivered.is_err() {
            error!("Message handler panicked on {}", message.topic);
        }
    }
}
