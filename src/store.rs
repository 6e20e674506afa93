//! # StateStore
//!
//! Holds the one observable snapshot of the link: broker connection, device liveness,
//! watering session and the last watering time reported by the device. The store is
//! the only channel back to the presentation layer.
//!
//! ## Ownership of fields
//!
//! Each field has exactly one writer:
//!
//! ```text
//! connection      ← ConnectionManager
//! device          ← LivenessMonitor (ping, pong via TopicRouter)
//! watering        ← CommandDispatcher (optimistic) / TopicRouter (stopped report)
//! last_watered    ← TopicRouter
//! ```
//!
//! The setters are `pub(crate)`; everything outside the crate only reads.
//!
//! ## Notification
//!
//! Subscribers get a `watch::Receiver<Snapshot>` and always see the full snapshot,
//! never a diff. Setters only notify when the value really changed. Dropping the
//! receiver is the unsubscribe. Failed commands are announced separately as
//! [`Notice`]s on a broadcast channel.

use chrono::{DateTime, FixedOffset, Utc};
use std::fmt;
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::device::commands::{Command, WateringDuration};
use crate::mqtt::connection::ConnectionState;

const NOTICE_CAPACITY: usize = 16;

/// Liveness of the remote device as seen from the last heartbeat
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeviceLiveness {
    /// No ping sent yet
    #[default]
    Unknown,
    Online,
    /// A ping is outstanding or went unanswered
    Offline,
}

impl fmt::Display for DeviceLiveness {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DeviceLiveness::Unknown => write!(f, "unknown"),
            DeviceLiveness::Online => write!(f, "online"),
            DeviceLiveness::Offline => write!(f, "offline"),
        }
    }
}

/// Watering intent of the user, corrected by the device's "stopped" report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WateringSession {
    pub active: bool,
    pub requested_duration: Option<WateringDuration>,
}

/// Last watering time exactly as the device reported it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LastWateredRecord {
    pub timestamp: Option<String>,
}

impl LastWateredRecord {
    /// Parsed form for display. The raw string stays authoritative.
    pub fn parsed(&self) -> Option<DateTime<FixedOffset>> {
        self.timestamp
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub connection: ConnectionState,
    pub device: DeviceLiveness,
    pub watering: WateringSession,
    pub last_watered: LastWateredRecord,
    /// Arrival time of the most recent pong
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn is_device_online(&self) -> bool {
        self.device == DeviceLiveness::Online
    }

    pub fn is_watering_on(&self) -> bool {
        self.watering.active
    }

    pub fn last_watered(&self) -> Option<&str> {
        self.last_watered.timestamp.as_deref()
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "broker: {:?} | device: {} | watering: {} | last watered: {}",
            self.connection,
            self.device,
            if self.watering.active { "on" } else { "off" },
            self.last_watered().unwrap_or("never")
        )
    }
}

/// Transient message for the presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    CommandFailed { command: Command, reason: String },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Notice::CommandFailed { command, reason } => {
                write!(f, "Command '{}' failed: {}", command, reason)
            }
        }
    }
}

#[derive(Debug)]
pub struct StateStore {
    snapshot: watch::Sender<Snapshot>,
    notices: broadcast::Sender<Notice>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(Snapshot::default());
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self { snapshot, notices }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.snapshot.borrow().is_connected()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub(crate) fn set_connection(&self, state: ConnectionState) {
        self.update(|s| replace(&mut s.connection, state));
    }

    pub(crate) fn set_device(&self, liveness: DeviceLiveness) {
        self.update(|s| replace(&mut s.device, liveness));
    }

    pub(crate) fn record_heartbeat(&self, at: DateTime<Utc>) {
        self.update(|s| {
            let online = replace(&mut s.device, DeviceLiveness::Online);
            let beat = replace(&mut s.last_heartbeat, Some(at));
            online || beat
        });
    }

    pub(crate) fn set_watering(&self, session: WateringSession) {
        self.update(|s| replace(&mut s.watering, session));
    }

    pub(crate) fn set_last_watered(&self, timestamp: String) {
        self.update(|s| {
            replace(
                &mut s.last_watered,
                LastWateredRecord {
                    timestamp: Some(timestamp),
                },
            )
        });
    }

    pub(crate) fn notify(&self, notice: Notice) {
        // Nobody listening is fine, the failure is already logged.
        if self.notices.send(notice).is_err() {
            debug!("Notice dropped, no subscribers");
        }
    }

    fn update(&self, modify: impl FnOnce(&mut Snapshot) -> bool) {
        self.snapshot.send_if_modified(modify);
    }
}

/// Writes `value` into `slot`, reporting whether anything changed
fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}
