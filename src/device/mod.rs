//! Device side of the link
//!
//! - [`liveness`] - ping/pong heartbeat
//! - [`commands`] - watering and query commands

pub mod commands;
pub mod liveness;
