//! Connection manager with statum typestate and a single link driver task
//!
//! Owns the broker session for the lifetime of the process and keeps it alive:
//! every dropped connection is retried after a fixed delay until teardown.
//!
//! # Lifecycle
//!
//! ```text
//! ConnectionManager<Idle> ──connect()──► ConnectionManager<Running> ──teardown()──► ConnectionManager<Stopped>
//! ```
//!
//! # Connection state machine
//!
//! ```text
//!                 ConnAck                     NetworkOffline
//! Connecting ───────────────► Connected ◄──────────────────► ConnectedPendingNetwork
//!    ▲  │ Failure                 │ Failure                     │ Failure
//!    │  ▼                         ▼                             ▼
//!    │ Disconnected           Disrupted ◄──────────────────► DisruptedPendingNetwork
//!    │      │                     │        NetworkOffline        │
//!    └──────┴── reconnect delay ──┴──────────────────────────────┘
//! ```
//!
//! # Driver
//!
//! One tokio task multiplexes the transport events, the heartbeat interval, the
//! reconnect delay and cancellation with `tokio::select!`. Inbound messages and
//! timers therefore never run concurrently with each other.

use rumqttc::{AsyncClient, MqttOptions};
use statum::{machine, state};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::router::TopicRouter;
use super::transport::{
    apply_credentials, EventSource, MqttEvents, MqttTransport, Transport, TransportEvent,
};
use crate::config::{LinkConfig, TimingConfig};
use crate::device::commands::{CommandDispatcher, CommandOutcome};
use crate::device::liveness::LivenessMonitor;
use crate::session::CredentialProvider;
use crate::store::StateStore;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disrupted,
    DisruptedPendingNetwork,
    ConnectedPendingNetwork,
    ConnectedPendingDisconnect,
}

impl ConnectionState {
    /// Only these two states accept commands
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::ConnectedPendingNetwork
        )
    }

    /// States from which the driver schedules the next connect attempt
    pub fn awaits_reconnect(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected
                | ConnectionState::Disrupted
                | ConnectionState::DisruptedPendingNetwork
        )
    }

    /// Next state after a transport event
    pub fn on_event(self, event: &TransportEvent) -> Self {
        use ConnectionState::*;

        match (self, event) {
            (_, TransportEvent::ConnAck) => Connected,

            (Connected, TransportEvent::NetworkOffline) => ConnectedPendingNetwork,
            (ConnectedPendingNetwork, TransportEvent::NetworkOnline) => Connected,
            (Disrupted, TransportEvent::NetworkOffline) => DisruptedPendingNetwork,
            (DisruptedPendingNetwork, TransportEvent::NetworkOnline) => Disrupted,

            (Connected, TransportEvent::Failure(_)) => Disrupted,
            (ConnectedPendingNetwork, TransportEvent::Failure(_)) => DisruptedPendingNetwork,
            (Disrupted | DisruptedPendingNetwork, TransportEvent::Failure(_)) => self,
            (_, TransportEvent::Failure(_)) => Disconnected,

            (_, TransportEvent::BrokerDisconnect | TransportEvent::Disconnecting) => Disconnected,

            (state, _) => state,
        }
    }
}

/// Lifecycle of the manager itself, not of the broker connection
#[state]
#[derive(Debug, Clone)]
pub enum LinkLifecycle {
    Idle,
    Running,
    Stopped,
}

#[machine]
pub struct ConnectionManager<S: LinkLifecycle> {
    config: LinkConfig,
    store: Arc<StateStore>,
    credentials: Arc<dyn CredentialProvider>,
    client_id: String,
    cancel: CancellationToken,
    // Cancels the driver if the manager is dropped without teardown
    _cancel_on_drop: DropGuard,
    driver: Option<JoinHandle<()>>,
}

impl<S: LinkLifecycle> ConnectionManager<S> {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn store(&self) -> Arc<StateStore> {
        self.store.clone()
    }
}

impl ConnectionManager<Idle> {
    /// Prepares a manager with a fresh client identifier.
    ///
    /// The identifier is `<prefix>-<uuid>` so that two processes (or a restarted
    /// one whose old session is still open at the broker) never collide.
    pub fn create(
        config: LinkConfig,
        store: Arc<StateStore>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let client_id = format!(
            "{}-{}",
            config.broker.client_id_prefix,
            Uuid::new_v4().simple()
        );
        let cancel = CancellationToken::new();
        let guard = cancel.clone().drop_guard();
        debug!("Created connection manager {}", client_id);

        Self::new(config, store, credentials, client_id, cancel, guard, None)
    }

    /// `rumqttc` options for the first connect attempt
    pub fn mqtt_options(&self) -> MqttOptions {
        let broker = &self.config.broker;
        let mut options = MqttOptions::new(self.client_id.clone(), broker.host.clone(), broker.port);
        options
            .set_keep_alive(Duration::from_secs(broker.keep_alive_secs))
            .set_clean_session(broker.clean_session);
        if broker.use_tls {
            options.set_transport(rumqttc::Transport::tls_with_default_config());
        }
        apply_credentials(&mut options, self.credentials.as_ref());
        options
    }

    /// Opens the broker session and starts the link driver.
    ///
    /// Must be called inside a tokio runtime.
    pub fn connect(self) -> (ConnectionManager<Running>, CommandDispatcher) {
        let options = self.mqtt_options();
        info!(
            "Connecting to {}:{} as {}",
            self.config.broker.host, self.config.broker.port, self.client_id
        );

        let (client, eventloop) = AsyncClient::new(options, self.config.broker.request_capacity);
        let transport: Arc<dyn Transport> = Arc::new(MqttTransport::new(client, self.config.qos()));
        let events = MqttEvents::new(eventloop, self.credentials.clone());
        self.connect_with(transport, events)
    }

    /// Same as [`connect`](Self::connect) over any transport / event source pair
    pub fn connect_with<E>(
        mut self,
        transport: Arc<dyn Transport>,
        events: E,
    ) -> (ConnectionManager<Running>, CommandDispatcher)
    where
        E: EventSource + 'static,
    {
        let topics = Arc::new(self.config.topics.clone());
        let liveness =
            LivenessMonitor::new(transport.clone(), self.store.clone(), &topics.device_ping);
        let dispatcher = CommandDispatcher::new(
            transport.clone(),
            self.store.clone(),
            topics.clone(),
            liveness.clone(),
        );
        let router = TopicRouter::new(
            transport.clone(),
            self.store.clone(),
            &topics,
            liveness.clone(),
        );

        self.store.set_connection(ConnectionState::Connecting);
        let driver = LinkDriver {
            state: ConnectionState::Connecting,
            store: self.store.clone(),
            transport,
            router,
            liveness,
            dispatcher: dispatcher.clone(),
            timing: self.config.timing.clone(),
            refresh_last_watered: self.config.refresh_last_watered_on_connect,
        };

        let cancel = self.cancel.clone();
        self.driver = Some(tokio::spawn(driver.run(events, cancel)));
        info!("Link driver started for {}", self.client_id);

        (self.transition(), dispatcher)
    }
}

impl ConnectionManager<Running> {
    /// Whether the driver task is still alive
    pub fn is_running(&self) -> bool {
        self.driver
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stops heartbeat and reconnect timers, disconnects gracefully and waits for
    /// the driver to finish.
    pub async fn teardown(mut self) -> ConnectionManager<Stopped> {
        info!("Tearing down link {}", self.client_id);
        self.cancel.cancel();

        if let Some(handle) = self.driver.take() {
            if let Err(e) = handle.await {
                error!("Link driver task panicked: {}", e);
            }
        }

        info!("Link {} stopped", self.client_id);
        self.transition()
    }
}

impl ConnectionManager<Stopped> {}

/// The single execution context of the link
struct LinkDriver {
    state: ConnectionState,
    store: Arc<StateStore>,
    transport: Arc<dyn Transport>,
    router: TopicRouter,
    liveness: LivenessMonitor,
    dispatcher: CommandDispatcher,
    timing: TimingConfig,
    refresh_last_watered: bool,
}

impl LinkDriver {
    async fn run<E: EventSource>(mut self, mut events: E, cancel: CancellationToken) {
        let period = self.timing.ping_interval();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reconnect_at: Option<Instant> = None;

        loop {
            let waiting = reconnect_at.is_some();
            let deadline = reconnect_at.unwrap_or_else(Instant::now);

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Cancellation received");
                    break;
                }

                _ = tokio::time::sleep_until(deadline), if waiting => {
                    reconnect_at = None;
                    events.before_reconnect();
                    self.transition(ConnectionState::Connecting);
                }

                _ = heartbeat.tick() => {
                    if let CommandOutcome::Failed(reason) = self.liveness.ping().await {
                        warn!("Scheduled ping failed: {}", reason);
                    }
                }

                event = events.next_event(), if !waiting => match event {
                    Some(event) => {
                        if self.handle_event(event).await {
                            let delay = self.timing.reconnect_delay();
                            info!("Reconnecting in {:?}", delay);
                            reconnect_at = Some(Instant::now() + delay);
                        }
                    }
                    None => {
                        warn!("Transport event source closed, stopping link driver");
                        break;
                    }
                }
            }
        }

        self.shutdown(&mut events).await;
    }

    /// Applies one transport event. Returns true when a reconnect must be scheduled.
    async fn handle_event(&mut self, event: TransportEvent) -> bool {
        match event {
            TransportEvent::Message(message) => {
                self.router.dispatch(&message);
                return false;
            }
            TransportEvent::Idle => return false,
            _ => {}
        }

        let next = self.state.on_event(&event);
        self.transition(next);

        match event {
            TransportEvent::ConnAck => {
                self.on_connected().await;
                false
            }
            TransportEvent::Failure(reason) => {
                warn!("Transport failure in state {:?}: {}", next, reason);
                next.awaits_reconnect()
            }
            TransportEvent::BrokerDisconnect => {
                warn!("Broker closed the session");
                next.awaits_reconnect()
            }
            _ => false,
        }
    }

    async fn on_connected(&mut self) {
        if let Err(e) = self.router.subscribe_all().await {
            error!("Subscribing inbound topics failed: {}", e);
        }

        if let CommandOutcome::Failed(reason) = self.liveness.ping().await {
            warn!("Initial ping failed: {}", reason);
        }

        if self.refresh_last_watered {
            self.dispatcher.request_last_watered().await;
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        if next != self.state {
            info!("Connection state: {:?} -> {:?}", self.state, next);
            self.state = next;
            self.store.set_connection(next);
        }
    }

    async fn shutdown<E: EventSource>(&mut self, events: &mut E) {
        if self.state.is_connected() {
            self.transition(ConnectionState::ConnectedPendingDisconnect);

            match self.transport.disconnect().await {
                Ok(()) => {
                    let grace = self.timing.shutdown_grace();
                    let drained = tokio::time::timeout(grace, async {
                        while let Some(event) = events.next_event().await {
                            if matches!(
                                event,
                                TransportEvent::Disconnecting | TransportEvent::Failure(_)
                            ) {
                                break;
                            }
                        }
                    })
                    .await;
                    if drained.is_err() {
                        warn!("Disconnect not confirmed within {:?}", grace);
                    }
                }
                Err(e) => warn!("Graceful disconnect failed: {}", e),
            }
        }

        self.transition(ConnectionState::Disconnected);
        debug!("Link driver finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::transport::InboundMessage;

    fn failure() -> TransportEvent {
        TransportEvent::Failure("connection reset".to_string())
    }

    #[test]
    fn only_connected_states_report_connected() {
        use ConnectionState::*;
        for state in [
            Disconnected,
            Connecting,
            Disrupted,
            DisruptedPendingNetwork,
            ConnectedPendingDisconnect,
        ] {
            assert!(!state.is_connected(), "{:?}", state);
        }
        assert!(Connected.is_connected());
        assert!(ConnectedPendingNetwork.is_connected());
    }

    #[test]
    fn handshake_success_connects_from_anywhere() {
        use ConnectionState::*;
        for state in [Connecting, Disconnected, Disrupted, DisruptedPendingNetwork] {
            assert_eq!(state.on_event(&TransportEvent::ConnAck), Connected);
        }
    }

    #[test]
    fn failures_while_connected_are_disruptions() {
        use ConnectionState::*;
        assert_eq!(Connected.on_event(&failure()), Disrupted);
        assert_eq!(
            ConnectedPendingNetwork.on_event(&failure()),
            DisruptedPendingNetwork
        );
        assert_eq!(Disrupted.on_event(&failure()), Disrupted);
    }

    #[test]
    fn handshake_failure_is_a_terminal_drop() {
        use ConnectionState::*;
        assert_eq!(Connecting.on_event(&failure()), Disconnected);
        assert!(Disconnected.awaits_reconnect());
        assert!(Disrupted.awaits_reconnect());
        assert!(DisruptedPendingNetwork.awaits_reconnect());
        assert!(!Connecting.awaits_reconnect());
        assert!(!Connected.awaits_reconnect());
    }

    #[test]
    fn network_signals_toggle_pending_states() {
        use ConnectionState::*;
        assert_eq!(
            Connected.on_event(&TransportEvent::NetworkOffline),
            ConnectedPendingNetwork
        );
        assert_eq!(
            ConnectedPendingNetwork.on_event(&TransportEvent::NetworkOnline),
            Connected
        );
        assert_eq!(
            Disrupted.on_event(&TransportEvent::NetworkOffline),
            DisruptedPendingNetwork
        );
        assert_eq!(
            DisruptedPendingNetwork.on_event(&TransportEvent::NetworkOnline),
            Disrupted
        );
        assert_eq!(Connecting.on_event(&TransportEvent::NetworkOffline), Connecting);
    }

    #[test]
    fn graceful_disconnect_ends_disconnected() {
        use ConnectionState::*;
        assert_eq!(
            ConnectedPendingDisconnect.on_event(&TransportEvent::Disconnecting),
            Disconnected
        );
        assert_eq!(
            Connected.on_event(&TransportEvent::BrokerDisconnect),
            Disconnected
        );
    }

    #[test]
    fn traffic_does_not_change_state() {
        use ConnectionState::*;
        let message = TransportEvent::Message(InboundMessage::new("plant/pong", b"{}".to_vec()));
        assert_eq!(Connected.on_event(&message), Connected);
        assert_eq!(Connected.on_event(&TransportEvent::Idle), Connected);
    }

    #[test]
    fn client_ids_are_unique_per_manager() {
        let config = LinkConfig::new();
        let store = Arc::new(StateStore::new());
        let credentials: Arc<dyn CredentialProvider> = Arc::new(crate::session::Anonymous);

        let first = ConnectionManager::create(config.clone(), store.clone(), credentials.clone());
        let second = ConnectionManager::create(config, store, credentials);

        assert!(first.client_id().starts_with("plantlink-"));
        assert_ne!(first.client_id(), second.client_id());
    }

    #[test]
    fn options_carry_identity_and_credentials() {
        let mut config = LinkConfig::new();
        config.broker.use_tls = false;
        config.broker.keep_alive_secs = 45;
        let store = Arc::new(StateStore::new());
        let credentials: Arc<dyn CredentialProvider> =
            Arc::new(crate::session::StaticCredentials::new("gardener", "secret"));

        let manager = ConnectionManager::create(config, store, credentials);
        let options = manager.mqtt_options();

        assert_eq!(options.client_id(), manager.client_id());
        assert_eq!(options.broker_address(), ("localhost".to_string(), 8883));
        assert_eq!(options.keep_alive(), Duration::from_secs(45));
        assert_eq!(
            options.credentials(),
            Some(("gardener".to_string(), "secret".to_string()))
        );
    }
}
