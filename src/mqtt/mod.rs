//! # MQTT Link
//!
//! Broker side of the device link: one long-lived session that survives transport
//! drops, a fixed set of inbound topics and the JSON wire format of the device.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── connection.rs  - Connection state machine, lifecycle and the link driver task
//! ├── message.rs     - JSON payloads exchanged with the device
//! ├── router.rs      - Inbound topic set, subscription and dispatch
//! └── transport.rs   - Transport/EventSource seam over rumqttc
//! ```
//!
//! Everything the link learns ends up in the [`StateStore`](crate::store::StateStore);
//! everything the user wants goes out through the
//! [`CommandDispatcher`](crate::device::commands::CommandDispatcher).

pub mod connection;
pub mod message;
pub mod router;
pub mod transport;
