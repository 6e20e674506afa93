use async_trait::async_trait;
use plantlink::config::LinkConfig;
use plantlink::device::commands::{Command, CommandDispatcher, CommandOutcome, WateringDuration};
use plantlink::error::LinkError;
use plantlink::mqtt::connection::{ConnectionManager, ConnectionState, Running};
use plantlink::mqtt::transport::{InboundMessage, Transport, TransportEvent};
use plantlink::session::Anonymous;
use plantlink::store::{DeviceLiveness, Notice, StateStore};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};

/// Broker stand-in: records requests and confirms DISCONNECT like rumqttc does
#[derive(Default)]
struct FakeBroker {
    published: Mutex<Vec<(String, String)>>,
    publish_attempts: AtomicUsize,
    subscribed: Mutex<Vec<Vec<String>>>,
    disconnects: AtomicUsize,
    failing: AtomicBool,
    events: Mutex<Option<UnboundedSender<TransportEvent>>>,
}

impl FakeBroker {
    fn published_on(&self, topic: &str) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    fn subscriptions(&self) -> Vec<Vec<String>> {
        self.subscribed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for FakeBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), LinkError> {
        self.publish_attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(LinkError::PublishError {
                topic: topic.to_string(),
                reason: "request channel closed".to_string(),
            });
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), String::from_utf8(payload).unwrap()));
        Ok(())
    }

    async fn subscribe_many(&self, topics: &[String]) -> Result<(), LinkError> {
        self.subscribed.lock().unwrap().push(topics.to_vec());
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            let _ = events.send(TransportEvent::Disconnecting);
        }
        Ok(())
    }
}

struct Link {
    manager: ConnectionManager<Running>,
    dispatcher: CommandDispatcher,
    store: Arc<StateStore>,
    broker: Arc<FakeBroker>,
    events: UnboundedSender<TransportEvent>,
}

impl Link {
    fn start() -> Self {
        let store = Arc::new(StateStore::new());
        let broker = Arc::new(FakeBroker::default());
        let (events, source) = mpsc::unbounded_channel();
        *broker.events.lock().unwrap() = Some(events.clone());

        let (manager, dispatcher) =
            ConnectionManager::create(LinkConfig::new(), store.clone(), Arc::new(Anonymous))
                .connect_with(broker.clone(), source);

        Self {
            manager,
            dispatcher,
            store,
            broker,
            events,
        }
    }

    async fn send(&self, event: TransportEvent) {
        self.events.send(event).unwrap();
        settle().await;
    }

    fn state(&self) -> ConnectionState {
        self.store.snapshot().connection
    }
}

/// Lets the driver task work through everything queued so far
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

fn inbound(topic: &str, payload: &str) -> TransportEvent {
    TransportEvent::Message(InboundMessage::new(topic, payload.as_bytes().to_vec()))
}

#[tokio::test(start_paused = true)]
async fn connack_subscribes_once_and_pings() {
    let link = Link::start();
    assert_eq!(link.state(), ConnectionState::Connecting);

    link.send(TransportEvent::ConnAck).await;

    assert_eq!(link.state(), ConnectionState::Connected);
    assert_eq!(
        link.broker.subscriptions(),
        vec![vec![
            "plant/pong".to_string(),
            "plant/last-watered/report".to_string(),
            "plant/water/stopped".to_string(),
        ]]
    );
    assert_eq!(
        link.broker.published_on("plant/ping"),
        vec![r#"{"action":"PING"}"#.to_string()]
    );
    assert_eq!(
        link.broker.published_on("plant/last-watered/get"),
        vec![r#"{"status":"get"}"#.to_string()]
    );
    assert_eq!(link.store.snapshot().device, DeviceLiveness::Offline);

    link.manager.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_after_drop_restores_the_same_subscriptions() {
    let link = Link::start();
    link.send(TransportEvent::ConnAck).await;

    link.send(TransportEvent::Failure("connection reset".to_string()))
        .await;
    assert_eq!(link.state(), ConnectionState::Disrupted);
    assert!(!link.store.is_connected());

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(link.state(), ConnectionState::Connecting);

    link.send(TransportEvent::ConnAck).await;
    assert_eq!(link.state(), ConnectionState::Connected);

    let subscriptions = link.broker.subscriptions();
    assert_eq!(subscriptions.len(), 2);
    assert_eq!(subscriptions[0], subscriptions[1]);
    assert_eq!(link.broker.published_on("plant/ping").len(), 2);

    link.manager.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_handshake_retries_after_delay() {
    let link = Link::start();

    link.send(TransportEvent::Failure("connection refused".to_string()))
        .await;
    assert_eq!(link.state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(link.state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(link.state(), ConnectionState::Connecting);
    assert!(link.broker.subscriptions().is_empty());

    link.manager.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn broker_disconnect_is_retried() {
    let link = Link::start();
    link.send(TransportEvent::ConnAck).await;

    link.send(TransportEvent::BrokerDisconnect).await;
    assert_eq!(link.state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(link.state(), ConnectionState::Connecting);

    link.manager.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn heartbeat_repeats_every_interval() {
    let link = Link::start();
    link.send(TransportEvent::ConnAck).await;
    assert_eq!(link.broker.published_on("plant/ping").len(), 1);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(link.broker.published_on("plant/ping").len(), 2);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(link.broker.published_on("plant/ping").len(), 3);

    link.manager.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn pong_brings_device_online_until_next_unanswered_ping() {
    let link = Link::start();
    link.send(TransportEvent::ConnAck).await;
    assert!(!link.store.snapshot().is_device_online());

    link.send(inbound("plant/pong", "{}")).await;
    let snapshot = link.store.snapshot();
    assert!(snapshot.is_device_online());
    assert!(snapshot.last_heartbeat.is_some());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(link.store.snapshot().device, DeviceLiveness::Offline);

    link.manager.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn device_reports_update_the_snapshot() {
    let link = Link::start();
    link.send(TransportEvent::ConnAck).await;

    link.dispatcher
        .start_watering(WateringDuration::new(20).unwrap())
        .await;
    assert!(link.store.snapshot().is_watering_on());

    link.send(inbound("plant/water/stopped", "{}")).await;
    assert!(!link.store.snapshot().is_watering_on());

    link.send(inbound(
        "plant/last-watered/report",
        r#"{"timestamp":"2024-06-01T08:15:00Z"}"#,
    ))
    .await;
    assert_eq!(
        link.store.snapshot().last_watered(),
        Some("2024-06-01T08:15:00Z")
    );

    link.manager.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn commands_before_connack_are_ignored() {
    let link = Link::start();
    let before = link.store.snapshot();

    let outcome = link
        .dispatcher
        .execute(Command::StartWatering(WateringDuration::clamped(10)))
        .await;

    assert_eq!(outcome, CommandOutcome::NotConnected);
    assert_eq!(link.store.snapshot(), before);
    assert_eq!(link.broker.publish_attempts.load(Ordering::SeqCst), 0);

    link.manager.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn commands_pass_while_network_is_pending() {
    let link = Link::start();
    link.send(TransportEvent::ConnAck).await;

    link.send(TransportEvent::NetworkOffline).await;
    assert_eq!(link.state(), ConnectionState::ConnectedPendingNetwork);

    assert_eq!(
        link.dispatcher.execute(Command::StopWatering).await,
        CommandOutcome::Sent
    );

    link.send(TransportEvent::NetworkOnline).await;
    assert_eq!(link.state(), ConnectionState::Connected);

    link.manager.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_publish_is_announced_and_not_retried() {
    let link = Link::start();
    link.send(TransportEvent::ConnAck).await;
    let mut notices = link.store.notices();
    link.broker.failing.store(true, Ordering::SeqCst);
    let attempts = link.broker.publish_attempts.load(Ordering::SeqCst);

    let outcome = link
        .dispatcher
        .execute(Command::StartWatering(WateringDuration::clamped(15)))
        .await;
    assert!(matches!(outcome, CommandOutcome::Failed(_)));

    let notice = notices.try_recv().unwrap();
    assert_eq!(
        notice,
        Notice::CommandFailed {
            command: Command::StartWatering(WateringDuration::clamped(15)),
            reason: "Publish failed on 'plant/water/start': request channel closed".to_string(),
        }
    );

    settle().await;
    assert_eq!(
        link.broker.publish_attempts.load(Ordering::SeqCst),
        attempts + 1
    );

    link.manager.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn teardown_disconnects_and_stops_timers() {
    let link = Link::start();
    link.send(TransportEvent::ConnAck).await;
    assert!(link.manager.is_running());

    let broker = link.broker.clone();
    let store = link.store.clone();
    let dispatcher = link.dispatcher.clone();
    link.manager.teardown().await;

    assert_eq!(broker.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(store.snapshot().connection, ConnectionState::Disconnected);

    let pings = broker.published_on("plant/ping").len();
    tokio::time::sleep(Duration::from_secs(90)).await;
    assert_eq!(broker.published_on("plant/ping").len(), pings);

    assert_eq!(
        dispatcher.execute(Command::PingDevice).await,
        CommandOutcome::NotConnected
    );
}

#[tokio::test(start_paused = true)]
async fn teardown_while_disrupted_skips_disconnect() {
    let link = Link::start();
    link.send(TransportEvent::ConnAck).await;
    link.send(TransportEvent::Failure("broken pipe".to_string()))
        .await;

    let broker = link.broker.clone();
    let store = link.store.clone();
    link.manager.teardown().await;

    assert_eq!(broker.disconnects.load(Ordering::SeqCst), 0);
    assert_eq!(store.snapshot().connection, ConnectionState::Disconnected);
}
