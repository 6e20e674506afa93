//! Fehlerdefinitionen für den Geräte-Link

use thiserror::Error;

/// Errors raised by the link to the watering device
///
/// Transport errors are not in here on purpose: the link driver turns them into
/// connection state transitions and never hands them to a caller.
#[derive(Debug, Error)]
pub enum LinkError {
    /// A message could not be handed to the broker connection
    #[error("Publish failed on '{topic}': {reason}")]
    PublishError { topic: String, reason: String },

    /// The subscription request for the inbound topics was rejected
    #[error("Subscribe failed: {0}")]
    SubscribeError(String),

    /// Graceful disconnect request could not be queued
    #[error("Disconnect failed: {0}")]
    DisconnectError(String),

    /// Payload (de)serialization
    #[error("Payload error: {0}")]
    PayloadError(#[from] serde_json::Error),

    /// Watering duration outside of 1..=60 seconds
    #[error("Invalid watering duration: {0}s (allowed 1-60)")]
    InvalidDuration(i64),

    /// The session provider could not hand out a credential
    #[error("Credential error: {0}")]
    CredentialError(String),

    /// Unknown console command
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
}
