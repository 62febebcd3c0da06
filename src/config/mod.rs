//! Configuration management

use crate::protocol;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: Option<ServerConfig>,
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Tunnel timing and sizing
    #[serde(default)]
    pub tunnel: TunnelConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self, crate::Error> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Shared password; hashed into the record key
    #[serde(default)]
    pub password: Option<String>,
    /// Explicit record key (base64, 16 or 32 bytes); wins over `password`
    #[serde(default)]
    pub key: Option<String>,
    /// Directory receiving uploaded files
    pub upload_dir: String,
}

impl ServerConfig {
    /// Resolve the record key, `None` when encryption is disabled
    pub fn secret(&self) -> Result<Option<Vec<u8>>, crate::Error> {
        resolve_secret(self.key.as_deref(), self.password.as_deref())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            password: Some("password".to_string()),
            key: None,
            upload_dir: "uploaded_files".to_string(),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server IPv4 address
    pub server: String,
    /// Shared password; hashed into the record key
    #[serde(default)]
    pub password: Option<String>,
    /// Explicit record key (base64, 16 or 32 bytes); wins over `password`
    #[serde(default)]
    pub key: Option<String>,
    /// Name shown in relayed chat messages
    #[serde(default)]
    pub nickname: Option<String>,
}

impl ClientConfig {
    /// Resolve the record key, `None` when encryption is disabled
    pub fn secret(&self) -> Result<Option<Vec<u8>>, crate::Error> {
        resolve_secret(self.key.as_deref(), self.password.as_deref())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1".to_string(),
            password: Some("password".to_string()),
            key: None,
            nickname: None,
        }
    }
}

fn resolve_secret(
    key: Option<&str>,
    password: Option<&str>,
) -> Result<Option<Vec<u8>>, crate::Error> {
    if let Some(key) = key {
        let bytes = STANDARD
            .decode(key.trim())
            .map_err(|e| crate::Error::Config(format!("Invalid key encoding: {}", e)))?;
        crate::crypto::validate_key(&bytes)?;
        return Ok(Some(bytes));
    }

    Ok(password.map(|pw| crate::crypto::key_from_password(pw).to_vec()))
}

/// Tunnel timing and sizing
///
/// Durations are stored in milliseconds so the TOML stays readable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Initiator wait for a matching reply
    pub round_timeout_ms: u64,
    /// Responder lifetime without any Echo
    pub idle_timeout_ms: u64,
    /// Responder pause before an empty reply
    pub idle_reply_delay_ms: u64,
    /// Payload bytes per packet
    pub max_payload: usize,
    /// Queued inbound messages per session
    pub inbox_capacity: usize,
    /// Queued unaccepted connections
    pub accept_backlog: usize,
    /// Largest secure record
    pub record_limit: usize,
    /// Deadline for one secure record body
    pub record_timeout_ms: u64,
}

impl TunnelConfig {
    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn idle_reply_delay(&self) -> Duration {
        Duration::from_millis(self.idle_reply_delay_ms)
    }

    pub fn record_timeout(&self) -> Duration {
        Duration::from_millis(self.record_timeout_ms)
    }

    /// Check values the protocol cannot work with
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.max_payload == 0 || self.max_payload > protocol::MAX_PAYLOAD_SIZE {
            return Err(crate::Error::Config(format!(
                "max_payload must be within 1..={}",
                protocol::MAX_PAYLOAD_SIZE
            )));
        }
        if self.inbox_capacity == 0 || self.accept_backlog == 0 {
            return Err(crate::Error::Config(
                "inbox_capacity and accept_backlog must be non-zero".to_string(),
            ));
        }
        if self.round_timeout_ms == 0 || self.idle_timeout_ms == 0 || self.record_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "round_timeout_ms, idle_timeout_ms and record_timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.round_timeout_ms >= self.record_timeout_ms {
            return Err(crate::Error::Config(format!(
                "round_timeout_ms ({}) must be below record_timeout_ms ({})",
                self.round_timeout_ms, self.record_timeout_ms
            )));
        }
        if self.record_limit <= crate::crypto::RECORD_OVERHEAD {
            return Err(crate::Error::Config(format!(
                "record_limit must exceed {} bytes",
                crate::crypto::RECORD_OVERHEAD
            )));
        }
        Ok(())
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            round_timeout_ms: protocol::ROUND_TIMEOUT.as_millis() as u64,
            idle_timeout_ms: protocol::IDLE_TIMEOUT.as_millis() as u64,
            idle_reply_delay_ms: protocol::IDLE_REPLY_DELAY.as_millis() as u64,
            max_payload: protocol::MAX_PAYLOAD_SIZE,
            inbox_capacity: protocol::INBOX_CAPACITY,
            accept_backlog: protocol::ACCEPT_BACKLOG,
            record_limit: protocol::MAX_RECORD_SIZE,
            record_timeout_ms: protocol::RECORD_TIMEOUT.as_millis() as u64,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        server: Some(ServerConfig::default()),
        client: Some(ClientConfig::default()),
        tunnel: TunnelConfig::default(),
        logging: LoggingConfig::default(),
    }
}
