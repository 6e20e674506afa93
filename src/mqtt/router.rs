//! Inbound topic routing
//!
//! The link listens to a fixed set of three topics. On every (re)connect the whole
//! set is subscribed again in one request; the broker treats a repeated SUBSCRIBE
//! for the same filter as a replacement, so nothing accumulates across reconnects.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::message::{decode, LastWateredReport};
use super::transport::{InboundMessage, Transport};
use crate::config::TopicConfig;
use crate::device::liveness::LivenessMonitor;
use crate::error::LinkError;
use crate::store::{StateStore, WateringSession};

/// What an inbound topic means for the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    DevicePong,
    LastWateredReport,
    WateringStopped,
}

pub struct TopicRouter {
    routes: HashMap<String, Route>,
    subscription: Vec<String>,
    transport: Arc<dyn Transport>,
    store: Arc<StateStore>,
    liveness: LivenessMonitor,
}

impl TopicRouter {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<StateStore>,
        topics: &TopicConfig,
        liveness: LivenessMonitor,
    ) -> Self {
        let routes: HashMap<String, Route> = [
            (topics.device_pong.clone(), Route::DevicePong),
            (topics.last_watered_report.clone(), Route::LastWateredReport),
            (topics.watering_stopped.clone(), Route::WateringStopped),
        ]
        .into_iter()
        .collect();
        let subscription = topics.inbound().iter().map(|t| t.to_string()).collect();

        Self {
            routes,
            subscription,
            transport,
            store,
            liveness,
        }
    }

    /// The fixed inbound topic set, in subscription order
    pub fn topics(&self) -> &[String] {
        &self.subscription
    }

    pub fn route(&self, topic: &str) -> Option<Route> {
        self.routes.get(topic).copied()
    }

    /// Subscribes the complete inbound set in a single request
    pub async fn subscribe_all(&self) -> Result<(), LinkError> {
        info!("Subscribing to {:?}", self.subscription);
        self.transport.subscribe_many(&self.subscription).await
    }

    /// Applies one inbound message to the store.
    ///
    /// Unknown topics and malformed payloads are logged and dropped.
    pub fn dispatch(&self, message: &InboundMessage) {
        debug!("Inbound: {:?}", message);

        match self.route(&message.topic) {
            Some(Route::DevicePong) => self.liveness.record_pong(),
            Some(Route::LastWateredReport) => {
                match decode::<LastWateredReport>(&message.payload) {
                    Ok(report) => {
                        info!("Device reports last watering at {}", report.timestamp);
                        self.store.set_last_watered(report.timestamp);
                    }
                    Err(e) => warn!(
                        "Dropping malformed last-watered report on {}: {}",
                        message.topic, e
                    ),
                }
            }
            Some(Route::WateringStopped) => {
                info!("Device reports watering stopped");
                self.store.set_watering(WateringSession::default());
            }
            None => warn!("Dropping message on unknown topic '{}'", message.topic),
        }
    }
}
