//! Heartbeat of the remote device
//!
//! A ping marks the device offline right away ("no answer yet") and publishes
//! `{action:"PING"}`. The pong, routed back by the [`TopicRouter`], flips it online.
//! There is no separate timeout: if no pong arrives before the next ping, the
//! device simply stays offline. The ping interval is the timeout.
//!
//! [`TopicRouter`]: crate::mqtt::router::TopicRouter

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::commands::CommandOutcome;
use crate::mqtt::message::{encode, PingMessage};
use crate::mqtt::transport::Transport;
use crate::store::{DeviceLiveness, StateStore};

#[derive(Clone)]
pub struct LivenessMonitor {
    transport: Arc<dyn Transport>,
    store: Arc<StateStore>,
    ping_topic: String,
}

impl LivenessMonitor {
    pub fn new(transport: Arc<dyn Transport>, store: Arc<StateStore>, ping_topic: &str) -> Self {
        Self {
            transport,
            store,
            ping_topic: ping_topic.to_string(),
        }
    }

    pub async fn ping(&self) -> CommandOutcome {
        if !self.store.is_connected() {
            warn!("Not connected, skipping device ping");
            return CommandOutcome::NotConnected;
        }

        self.store.set_device(DeviceLiveness::Offline);

        let result = match encode(&PingMessage::default()) {
            Ok(payload) => self.transport.publish(&self.ping_topic, payload).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                debug!("Ping sent on {}", self.ping_topic);
                CommandOutcome::Sent
            }
            Err(e) => {
                error!("Ping publish failed: {}", e);
                CommandOutcome::Failed(e.to_string())
            }
        }
    }

    pub(crate) fn record_pong(&self) {
        debug!("Pong received");
        self.store.record_heartbeat(Utc::now());
    }
}
