//! Lifecycle supervisor
//!
//! Owns at most one broker session + relay controller pair. `start` and
//! `stop` are serialized by one async mutex held over the whole transition,
//! so a second `start` racing the first just finds the session it made.

use crate::broker::{BrokerSession, MessageHandler, SessionEvent};
use crate::carrier::CarrierGateway;
use crate::config::Config;
use crate::credentials::CredentialStore;
use crate::indicator::KeepAliveIndicator;
use crate::relay::{LogObserver, RelayController, RelayObserver};
use crate::status::StatusBus;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

struct ActiveSession {
    session: BrokerSession,
    relay: Arc<RelayController>,
}

pub struct Supervisor {
    config: Config,
    store: Arc<dyn CredentialStore>,
    status: Arc<StatusBus>,
    gateway: Arc<dyn CarrierGateway>,
    indicator: Arc<dyn KeepAliveIndicator>,
    observer: Arc<dyn RelayObserver>,
    events: broadcast::Sender<SessionEvent>,
    active: Mutex<Option<ActiveSession>>,
}

impl Supervisor {
    pub fn new(
        config: Config,
        store: Arc<dyn CredentialStore>,
        status: Arc<StatusBus>,
        gateway: Arc<dyn CarrierGateway>,
        indicator: Arc<dyn KeepAliveIndicator>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            store,
            status,
            gateway,
            indicator,
            observer: Arc::new(LogObserver),
            events,
            active: Mutex::new(None),
        }
    }

    /// Replace the default (logging) relay observer
    pub fn with_relay_observer(mut self, observer: Arc<dyn RelayObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn status(&self) -> Arc<StatusBus> {
        self.status.clone()
    }

    /// Session events from every session this supervisor runs
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn is_running(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .is_some_and(|active| active.session.is_active())
    }

    /// Bring the relay up with the currently stored credentials.
    ///
    /// Already running is not an error: the current status is published
    /// again and nothing else happens.
    pub async fn start(&self) -> Result<StartOutcome> {
        let mut active = self.active.lock().await;

        if let Some(current) = active.as_ref() {
            if current.session.is_active() {
                info!("Relay already running");
                self.status.publish(current.session.is_subscribed());
                return Ok(StartOutcome::AlreadyRunning);
            }
        }
        if let Some(stale) = active.take() {
            debug!("Clearing out a session that is no longer active");
            Self::teardown(stale).await;
        }

        let credentials = self.store.load_or_empty();

        let indicator = &self.config.indicator;
        if let Err(e) = self.indicator.acquire(&indicator.title, &indicator.text) {
            warn!("Failed to acquire keep-alive indicator: {:#}", e);
        }

        let relay = RelayController::spawn(
            self.gateway.clone(),
            self.observer.clone(),
            &self.config.relay,
        );
        let handler: Arc<dyn MessageHandler> = relay.clone();
        let mut session =
            BrokerSession::new(self.config.broker.clone(), self.status.clone(), Some(handler));
        self.forward_events(&session);

        match session.connect(&credentials).await {
            Ok(()) => {
                info!("Relay started");
                *active = Some(ActiveSession { session, relay });
                Ok(StartOutcome::Started)
            }
            Err(e) => {
                relay.shutdown();
                self.indicator.release();
                self.status.publish(false);
                Err(e).context("Failed to start relay session")
            }
        }
    }

    /// Tear down the running session, if any. Always safe to call.
    pub async fn stop(&self) {
        let mut active = self.active.lock().await;
        match active.take() {
            Some(current) => {
                Self::teardown(current).await;
                self.indicator.release();
                info!("Relay stopped");
            }
            None => debug!("stop() with no running session"),
        }
        self.status.publish(false);
    }

    /// Host finished booting: come back up with the last saved credentials
    pub async fn on_boot_completed(&self) -> Result<StartOutcome> {
        info!("Boot completed, starting relay");
        self.start().await
    }

    /// Process is going away
    pub async fn shutdown(&self) {
        self.stop().await;
    }

    async fn teardown(mut current: ActiveSession) {
        if let Err(e) = current.session.disconnect().await {
            warn!("Disconnect did not complete cleanly: {}", e);
        }
        current.relay.shutdown();
    }

    /// Re-broadcast one session's events on the supervisor's channel until
    /// that session goes away
    fn forward_events(&self, session: &BrokerSession) {
        let mut rx = session.events();
        let tx = self.events.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let _ = tx.send(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Session event forwarder lagged, {} events lost", n)
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}
