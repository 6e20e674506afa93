//! Client side of a watering device link over MQTT.
//!
//! Keeps a broker session alive, tracks whether the device answers its heartbeat,
//! forwards watering commands and mirrors everything into a single observable
//! [`Snapshot`].

pub mod config;
pub mod device;
pub mod error;
pub mod mqtt;
pub mod session;
pub mod store;

pub use config::LinkConfig;
pub use device::commands::{Command, CommandDispatcher, CommandOutcome, WateringDuration};
pub use error::LinkError;
pub use mqtt::connection::{ConnectionManager, ConnectionState};
pub use session::{Anonymous, Credential, CredentialProvider, StaticCredentials};
pub use store::{DeviceLiveness, Notice, Snapshot, StateStore};
