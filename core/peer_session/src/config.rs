//! Configuration passed into a [`MatchCoordinator`](crate::coordinator::MatchCoordinator)
//!
//! Loaded from JSON; every field has a default so a partial file (or no file)
//! is valid:
//!
//! ```json
//! {
//!   "signaling_url": "ws://relay.example.org:8080/ws",
//!   "service": "tic-tac-toe",
//!   "mode": "ranked",
//!   "handshake_timeout_ms": 15000,
//!   "recovery": { "max_restarts": 2 },
//!   "heartbeat": { "keepalive_interval_ms": 1000, "stale_after_ms": 5000 },
//!   "ice_servers": [{ "urls": "stun:stun.example.org:3478" }],
//!   "max_pending_signals": 64,
//!   "transport": { "bind_addr": "0.0.0.0:0", "cert_path": "certs/cert.pem" }
//! }
//! ```

use crate::ice::IceServer;
use serde::Deserialize;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080/ws";
pub const DEFAULT_SERVICE: &str = "peer-session";
pub const DEFAULT_MODE: &str = "casual";
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_MAX_RESTARTS: u32 = 2;
pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_STALE_AFTER_MS: u64 = 5_000;
pub const DEFAULT_MAX_PENDING_SIGNALS: usize = 64;
pub const DEFAULT_CHECK_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_DISCONNECT_AFTER_MS: u64 = 3_000;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30_000;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    /// File could not be read
    Io(std::io::Error),
    /// File is not valid JSON for this schema
    Parse(serde_json::Error),
    /// Parsed but semantically invalid
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "failed to read config: {}", e),
            ConfigError::Parse(e) => write!(f, "failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e)
    }
}

// ============================================================================
// Config
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// WebSocket URL of the signaling relay
    pub signaling_url: String,
    /// Service name reported in `connection_stable`
    pub service: String,
    /// Queue mode sent with `join_queue`
    pub mode: String,
    /// How long a Responder waits for an offer
    pub handshake_timeout_ms: u64,
    pub recovery: RecoveryPolicy,
    pub heartbeat: HeartbeatConfig,
    /// Used when the relay provides no ICE servers
    pub ice_servers: Vec<IceServer>,
    /// Per-room cap on signals buffered before a session exists
    pub max_pending_signals: usize,
    pub transport: QuicTransportConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            service: DEFAULT_SERVICE.to_string(),
            mode: DEFAULT_MODE.to_string(),
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            recovery: RecoveryPolicy::default(),
            heartbeat: HeartbeatConfig::default(),
            ice_servers: Vec::new(),
            max_pending_signals: DEFAULT_MAX_PENDING_SIGNALS,
            transport: QuicTransportConfig::default(),
        }
    }
}

impl Config {
    /// Load and validate a JSON config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    /// Parse and validate a JSON config string
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "handshake_timeout_ms must be positive".into(),
            ));
        }
        if self.heartbeat.keepalive_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat.keepalive_interval_ms must be positive".into(),
            ));
        }
        if self.heartbeat.stale_after_ms <= self.heartbeat.keepalive_interval_ms {
            return Err(ConfigError::Invalid(
                "heartbeat.stale_after_ms must exceed keepalive_interval_ms".into(),
            ));
        }
        if self.max_pending_signals == 0 {
            return Err(ConfigError::Invalid(
                "max_pending_signals must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Restart budget for hard transport failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecoveryPolicy {
    pub max_restarts: u32,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_restarts: DEFAULT_MAX_RESTARTS,
        }
    }
}

/// Keepalive cadence and silence threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeartbeatConfig {
    pub keepalive_interval_ms: u64,
    pub stale_after_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_ms: DEFAULT_KEEPALIVE_INTERVAL_MS,
            stale_after_ms: DEFAULT_STALE_AFTER_MS,
        }
    }
}

impl HeartbeatConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

/// Settings for the QUIC transport
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QuicTransportConfig {
    /// Local UDP bind address (port 0 = ephemeral)
    pub bind_addr: SocketAddr,
    /// TLS certificate (PEM), required on the Responder side
    pub cert_path: Option<String>,
    /// TLS private key (PEM), required on the Responder side
    pub key_path: Option<String>,
    /// Advertise loopback host candidates
    pub include_loopback: bool,
    /// Give up on connectivity checks after this long
    pub check_timeout_ms: u64,
    /// Report Disconnected after this much silence on a connected path
    pub disconnect_after_ms: u64,
    /// QUIC idle timeout
    pub idle_timeout_ms: u64,
}

impl Default for QuicTransportConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            cert_path: None,
            key_path: None,
            include_loopback: false,
            check_timeout_ms: DEFAULT_CHECK_TIMEOUT_MS,
            disconnect_after_ms: DEFAULT_DISCONNECT_AFTER_MS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
        }
    }
}
