//! Outbound commands to the watering device
//!
//! All commands are fire-and-forget publishes. When the broker link is down they
//! are skipped with a warning and leave the store untouched. A publish that fails
//! is reported once as [`Notice::CommandFailed`] and never retried, so a flaky
//! link can not open the valve twice.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::liveness::LivenessMonitor;
use crate::config::TopicConfig;
use crate::error::LinkError;
use crate::mqtt::message::{encode, StatusMessage};
use crate::mqtt::transport::Transport;
use crate::store::{Notice, StateStore, WateringSession};

/// Watering time the device accepts: 1 to 60 seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WateringDuration(u8);

impl WateringDuration {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 60;

    pub fn new(seconds: i64) -> Result<Self, LinkError> {
        if (i64::from(Self::MIN)..=i64::from(Self::MAX)).contains(&seconds) {
            Ok(Self(seconds as u8))
        } else {
            Err(LinkError::InvalidDuration(seconds))
        }
    }

    /// Pulls any value into the accepted range
    pub fn clamped(seconds: i64) -> Self {
        Self(seconds.clamp(i64::from(Self::MIN), i64::from(Self::MAX)) as u8)
    }

    pub fn seconds(self) -> u8 {
        self.0
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_secs(u64::from(self.0))
    }
}

impl fmt::Display for WateringDuration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}s", self.0)
    }
}

/// User intents forwarded by the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    StartWatering(WateringDuration),
    StopWatering,
    RequestLastWatered,
    PingDevice,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Command::StartWatering(duration) => write!(f, "start {}", duration),
            Command::StopWatering => write!(f, "stop"),
            Command::RequestLastWatered => write!(f, "last"),
            Command::PingDevice => write!(f, "ping"),
        }
    }
}

impl FromStr for Command {
    type Err = LinkError;

    /// `start <secs>`, `stop`, `last` or `ping`. Durations are validated, not clamped.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let words: Vec<&str> = s.split_whitespace().collect();
        match words.as_slice() {
            ["start", seconds] => {
                let seconds: i64 = seconds
                    .parse()
                    .map_err(|_| LinkError::UnknownCommand(s.to_string()))?;
                Ok(Command::StartWatering(WateringDuration::new(seconds)?))
            }
            ["stop"] => Ok(Command::StopWatering),
            ["last"] => Ok(Command::RequestLastWatered),
            ["ping"] => Ok(Command::PingDevice),
            _ => Err(LinkError::UnknownCommand(s.to_string())),
        }
    }
}

/// Result of a command, for callers that want more than the notice channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Sent,
    /// Skipped, the broker link is down
    NotConnected,
    Failed(String),
}

#[derive(Clone)]
pub struct CommandDispatcher {
    transport: Arc<dyn Transport>,
    store: Arc<StateStore>,
    topics: Arc<TopicConfig>,
    liveness: LivenessMonitor,
}

impl CommandDispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<StateStore>,
        topics: Arc<TopicConfig>,
        liveness: LivenessMonitor,
    ) -> Self {
        Self {
            transport,
            store,
            topics,
            liveness,
        }
    }

    pub async fn execute(&self, command: Command) -> CommandOutcome {
        match command {
            Command::StartWatering(duration) => self.start_watering(duration).await,
            Command::StopWatering => self.stop_watering().await,
            Command::RequestLastWatered => self.request_last_watered().await,
            Command::PingDevice => self.ping_device().await,
        }
    }

    /// Marks watering active before the publish goes out; only a "stopped" report
    /// or [`stop_watering`](Self::stop_watering) clears it again.
    pub async fn start_watering(&self, duration: WateringDuration) -> CommandOutcome {
        let command = Command::StartWatering(duration);
        if !self.ready(command) {
            return CommandOutcome::NotConnected;
        }

        self.store.set_watering(WateringSession {
            active: true,
            requested_duration: Some(duration),
        });
        self.send(
            command,
            &self.topics.start_watering,
            &StatusMessage::on(duration.seconds()),
        )
        .await
    }

    pub async fn stop_watering(&self) -> CommandOutcome {
        let command = Command::StopWatering;
        if !self.ready(command) {
            return CommandOutcome::NotConnected;
        }

        self.store.set_watering(WateringSession::default());
        self.send(command, &self.topics.stop_watering, &StatusMessage::off())
            .await
    }

    /// The answer arrives later on the report topic
    pub async fn request_last_watered(&self) -> CommandOutcome {
        let command = Command::RequestLastWatered;
        if !self.ready(command) {
            return CommandOutcome::NotConnected;
        }

        self.send(command, &self.topics.last_watered_query, &StatusMessage::get())
            .await
    }

    pub async fn ping_device(&self) -> CommandOutcome {
        let outcome = self.liveness.ping().await;
        if let CommandOutcome::Failed(reason) = &outcome {
            self.store.notify(Notice::CommandFailed {
                command: Command::PingDevice,
                reason: reason.clone(),
            });
        }
        outcome
    }

    fn ready(&self, command: Command) -> bool {
        if self.store.is_connected() {
            true
        } else {
            warn!("Not connected, ignoring command '{}'", command);
            false
        }
    }

    async fn send<T: Serialize + Sync>(
        &self,
        command: Command,
        topic: &str,
        message: &T,
    ) -> CommandOutcome {
        let result = match encode(message) {
            Ok(payload) => self.transport.publish(topic, payload).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                info!("Sent '{}' on {}", command, topic);
                CommandOutcome::Sent
            }
            Err(e) => {
                error!("Command '{}' failed: {}", command, e);
                let reason = e.to_string();
                self.store.notify(Notice::CommandFailed {
                    command,
                    reason: reason.clone(),
                });
                CommandOutcome::Failed(reason)
            }
        }
    }
}
