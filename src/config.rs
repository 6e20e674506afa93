//! # Link Configuration
//!
//! Broker endpoint, topic names and timing of the device link. Stored as TOML so it
//! can be edited by hand; a default file is written on first start.
//!
//! Topic strings are configuration, not protocol: the device firmware and this client
//! only have to agree on them.

use color_eyre::{eyre::eyre, Result};
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = ".config/plantlink";
const CONFIG_FILE: &str = "config.toml";

/// Environment variable that overrides the config file location
pub const CONFIG_ENV: &str = "PLANTLINK_CONFIG";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LinkConfig {
    /// Ask the device for its last watering time every time the link comes up
    pub refresh_last_watered_on_connect: bool,
    /// MQTT quality of service for subscriptions and commands (0, 1 or 2)
    pub qos: u8,
    pub broker: BrokerConfig,
    pub credentials: Option<CredentialConfig>,
    pub topics: TopicConfig,
    pub timing: TimingConfig,
}

/// Connection parameters of the MQTT broker.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    /// A random suffix is appended per process so two instances never share a session
    pub client_id_prefix: String,
    pub keep_alive_secs: u64,
    /// Capacity of the request queue between client handles and the event loop
    pub request_capacity: usize,
    pub clean_session: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8883,
            use_tls: true,
            client_id_prefix: "plantlink".to_string(),
            keep_alive_secs: 30,
            request_capacity: 64,
            clean_session: true,
        }
    }
}

/// Username/password handed to the static session provider.
///
/// Password is never printed, see the `Debug` impl.
#[derive(Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct CredentialConfig {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for CredentialConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialConfig")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TopicConfig {
    pub start_watering: String,
    pub stop_watering: String,
    pub watering_stopped: String,
    pub last_watered_report: String,
    pub last_watered_query: String,
    pub device_ping: String,
    pub device_pong: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            start_watering: "plant/water/start".to_string(),
            stop_watering: "plant/water/stop".to_string(),
            watering_stopped: "plant/water/stopped".to_string(),
            last_watered_report: "plant/last-watered/report".to_string(),
            last_watered_query: "plant/last-watered/get".to_string(),
            device_ping: "plant/ping".to_string(),
            device_pong: "plant/pong".to_string(),
        }
    }
}

impl TopicConfig {
    /// Topics the link subscribes to, in a fixed order
    pub fn inbound(&self) -> [&str; 3] {
        [
            self.device_pong.as_str(),
            self.last_watered_report.as_str(),
            self.watering_stopped.as_str(),
        ]
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TimingConfig {
    /// Heartbeat period; a ping without pong inside one period means offline
    pub ping_interval_secs: u64,
    /// Fixed delay between a dropped connection and the next connect attempt
    pub reconnect_delay_secs: u64,
    /// How long teardown waits for the disconnect packet to leave
    pub shutdown_grace_millis: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 30,
            reconnect_delay_secs: 3,
            shutdown_grace_millis: 1000,
        }
    }
}

impl TimingConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_millis)
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            refresh_last_watered_on_connect: true,
            qos: 1,
            broker: BrokerConfig::default(),
            credentials: None,
            topics: TopicConfig::default(),
            timing: TimingConfig::default(),
        }
    }
}

impl LinkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves where the config lives: explicit argument, then `PLANTLINK_CONFIG`,
    /// then `~/.config/plantlink/config.toml`.
    pub fn resolve_path(explicit: Option<PathBuf>) -> PathBuf {
        if let Some(path) = explicit {
            return path;
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return PathBuf::from(path);
        }
        let mut base_path = get_home_dir();
        base_path.push(CONFIG_DIR);
        base_path.push(CONFIG_FILE);
        base_path
    }

    /// Loads the config, writing the default one first if the file is missing.
    pub async fn load(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
        {
            info!("No config at {}, creating default configuration", path.display());
            Self::new().save(path).await?;
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config: LinkConfig = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

        config.validate()?;
        debug!("Loaded link config: {:?}", config);
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
            }
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize link config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file: {}", e))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.broker.host.trim().is_empty() {
            return Err(eyre!("broker.host must not be empty"));
        }
        if self.broker.port == 0 {
            return Err(eyre!("broker.port must not be 0"));
        }
        if self.broker.request_capacity == 0 {
            return Err(eyre!("broker.request_capacity must be at least 1"));
        }
        if self.timing.ping_interval_secs == 0 || self.timing.reconnect_delay_secs == 0 {
            return Err(eyre!("timing intervals must be at least one second"));
        }
        if self.qos > 2 {
            return Err(eyre!("qos must be 0, 1 or 2, got {}", self.qos));
        }

        let inbound = self.topics.inbound();
        if inbound.iter().any(|t| t.trim().is_empty()) {
            return Err(eyre!("inbound topics must not be empty"));
        }
        let unique: HashSet<&str> = inbound.iter().copied().collect();
        if unique.len() != inbound.len() {
            return Err(eyre!("inbound topics must be distinct: {:?}", inbound));
        }
        Ok(())
    }

    pub fn qos(&self) -> QoS {
        match self.qos {
            0 => QoS::AtMostOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtLeastOnce,
        }
    }
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}
