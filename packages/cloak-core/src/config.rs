//! # Configuration
//!
//! Runtime knobs for a session. Every field has a default, so an empty JSON
//! object is a valid configuration. A `bundle_dir` needs a `bundle_key`
//! alongside it; bundles are never written to disk unwrapped.
//!
//! ```json
//! {
//!   "handshake_response_delay_ms": 0,
//!   "bundle_ttl_secs": 86400,
//!   "channel_capacity": 256,
//!   "bundle_dir": "/var/lib/cloak/bundles",
//!   "bundle_key": "<64 hex chars>"
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default lifetime of a persisted key bundle (one day)
pub const DEFAULT_BUNDLE_TTL_SECS: u64 = 24 * 60 * 60;

/// Default capacity of the command and frame queues
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Length of the device key in bytes
pub const BUNDLE_KEY_SIZE: usize = 32;

/// Core configuration
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Pause before answering a key request
    ///
    /// The reply is already ordered after the trust update, so this is
    /// only for pacing against slow relays. Zero disables it.
    pub handshake_response_delay_ms: u64,

    /// How long a persisted bundle stays valid
    pub bundle_ttl_secs: u64,

    /// Queue capacity for the session actor and the loopback relay
    pub channel_capacity: usize,

    /// Directory for durable bundle storage; in-memory when unset
    pub bundle_dir: Option<PathBuf>,

    /// Hex-encoded 256-bit device key that wraps stored bundles
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_key: Option<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            handshake_response_delay_ms: 0,
            bundle_ttl_secs: DEFAULT_BUNDLE_TTL_SECS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            bundle_dir: None,
            bundle_key: None,
        }
    }
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("handshake_response_delay_ms", &self.handshake_response_delay_ms)
            .field("bundle_ttl_secs", &self.bundle_ttl_secs)
            .field("channel_capacity", &self.channel_capacity)
            .field("bundle_dir", &self.bundle_dir)
            .field("bundle_key", &self.bundle_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl CoreConfig {
    /// Parse from JSON, filling missing fields with defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that would make the session unusable
    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(Error::InvalidConfig(
                "channel_capacity must be at least 1".into(),
            ));
        }
        self.bundle_key()?;
        if self.bundle_dir.is_some() && self.bundle_key.is_none() {
            return Err(Error::InvalidConfig(
                "bundle_dir requires a bundle_key".into(),
            ));
        }
        Ok(())
    }

    /// Decoded device key, if one is configured
    ///
    /// ## Errors
    ///
    /// `InvalidConfig` unless the key is exactly 64 hex characters.
    pub fn bundle_key(&self) -> Result<Option<[u8; BUNDLE_KEY_SIZE]>> {
        let Some(encoded) = &self.bundle_key else {
            return Ok(None);
        };

        let mut key = [0u8; BUNDLE_KEY_SIZE];
        hex::decode_to_slice(encoded.trim(), &mut key).map_err(|_| {
            Error::InvalidConfig(format!(
                "bundle_key must be {} hex characters",
                BUNDLE_KEY_SIZE * 2
            ))
        })?;
        Ok(Some(key))
    }

    /// Handshake response delay as a `Duration`
    pub fn handshake_response_delay(&self) -> Duration {
        Duration::from_millis(self.handshake_response_delay_ms)
    }

    /// Bundle lifetime as a `Duration`
    pub fn bundle_ttl(&self) -> Duration {
        Duration::from_secs(self.bundle_ttl_secs)
    }
}
