//! Session provider seam
//!
//! The link only needs "a valid credential right now" when it opens the broker
//! connection. How that credential was obtained (interactive login, stored session,
//! guest access) belongs to whoever implements [`CredentialProvider`].

use crate::config::CredentialConfig;
use crate::error::LinkError;

/// Username/password pair for the MQTT CONNECT packet
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credential({}, ***)", self.username)
    }
}

/// Hands out credentials for opening the transport connection.
///
/// Called on `connect()` and again before every automatic reconnect, so a provider
/// with expiring tokens can return a fresh one each time. `Ok(None)` means guest
/// access without username/password.
pub trait CredentialProvider: Send + Sync {
    fn credential(&self) -> Result<Option<Credential>, LinkError>;
}

/// Fixed credentials, usually from the config file
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    credential: Credential,
}

impl StaticCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            credential: Credential {
                username: username.into(),
                password: password.into(),
            },
        }
    }
}

impl From<&CredentialConfig> for StaticCredentials {
    fn from(config: &CredentialConfig) -> Self {
        Self::new(config.username.clone(), config.password.clone())
    }
}

impl CredentialProvider for StaticCredentials {
    fn credential(&self) -> Result<Option<Credential>, LinkError> {
        if self.credential.username.is_empty() {
            return Err(LinkError::CredentialError(
                "username must not be empty".to_string(),
            ));
        }
        Ok(Some(self.credential.clone()))
    }
}

/// Guest access
#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymous;

impl CredentialProvider for Anonymous {
    fn credential(&self) -> Result<Option<Credential>, LinkError> {
        Ok(None)
    }
}
