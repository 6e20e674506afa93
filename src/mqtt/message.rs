use serde::{Deserialize, Serialize};

use crate::error::LinkError;

/// Value of the `status` field on the command topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    On,
    Off,
    Get,
}

/// `{status:"on", seconds:N}`, `{status:"off"}` or `{status:"get"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds: Option<u8>,
}

impl StatusMessage {
    pub fn on(seconds: u8) -> Self {
        Self {
            status: CommandStatus::On,
            seconds: Some(seconds),
        }
    }

    pub fn off() -> Self {
        Self {
            status: CommandStatus::Off,
            seconds: None,
        }
    }

    pub fn get() -> Self {
        Self {
            status: CommandStatus::Get,
            seconds: None,
        }
    }
}

/// `{action:"PING"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingMessage {
    pub action: String,
}

impl Default for PingMessage {
    fn default() -> Self {
        Self {
            action: "PING".to_string(),
        }
    }
}

/// Report sent by the device on the last-watered topic
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LastWateredReport {
    pub timestamp: String,
}

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, LinkError> {
    Ok(serde_json::to_vec(message)?)
}

pub fn decode<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T, LinkError> {
    Ok(serde_json::from_slice(payload)?)
}
