//! # Configuration Management
//!
//! Centralized configuration for the network core.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` or strings via `from_toml()`
//! - Environment variables (`GAMEWIRE_*`) via `from_env()`
//! - Defaults with programmatic overrides via `default_with_overrides()`
//!
//! Durations are written in milliseconds.
//!
//! ## Example
//! ```toml
//! [server]
//! address = "0.0.0.0"
//! socket_ports = [8032]
//! datagram_ports = [8033]
//!
//! [transport]
//! compression = "lz4"
//! compression_threshold_bytes = 3000
//!
//! [session]
//! packet_queue_size = 100
//! max_idle_time = 30000
//! ```

use crate::core::data::DataType;
use crate::core::decoder::BinaryPacketDecoder;
use crate::core::encoder::{BinaryPacketEncoder, DEFAULT_COMPRESSION_THRESHOLD_BYTES};
use crate::core::transform::{
    BinaryPacketCompressor, BinaryPacketEncryptor, ChaChaEncryptor, CompressionKind, NoopEncryptor,
};
use crate::error::{ProtocolError, Result};
use crate::session::queue::DEFAULT_PACKET_QUEUE_SIZE;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;

/// Max allowed payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Sessions not associated to a player within this time are closed as orphans
pub const DEFAULT_ORPHAN_ALLOWANCE: Duration = Duration::from_secs(3);

/// Period of the reliable-UDP update sweep
pub const DEFAULT_KCP_UPDATE_INTERVAL: Duration = Duration::from_millis(10);

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("GAMEWIRE_SERVER_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(ports) = std::env::var("GAMEWIRE_SOCKET_PORTS") {
            config.server.socket_ports = parse_ports("GAMEWIRE_SOCKET_PORTS", &ports)?;
        }
        if let Ok(ports) = std::env::var("GAMEWIRE_DATAGRAM_PORTS") {
            config.server.datagram_ports = parse_ports("GAMEWIRE_DATAGRAM_PORTS", &ports)?;
        }
        if let Ok(ports) = std::env::var("GAMEWIRE_WEBSOCKET_PORTS") {
            config.server.websocket_ports = parse_ports("GAMEWIRE_WEBSOCKET_PORTS", &ports)?;
        }
        if let Ok(ports) = std::env::var("GAMEWIRE_KCP_PORTS") {
            config.server.kcp_ports = parse_ports("GAMEWIRE_KCP_PORTS", &ports)?;
        }

        if let Ok(value) = std::env::var("GAMEWIRE_MAX_CONNECTIONS") {
            if let Ok(val) = value.parse::<usize>() {
                config.server.max_connections = val;
            }
        }

        if let Ok(value) = std::env::var("GAMEWIRE_MAX_CONNECTIONS_PER_IP") {
            if let Ok(val) = value.parse::<usize>() {
                config.session.max_connections_per_ip = val;
            }
        }

        if let Ok(value) = std::env::var("GAMEWIRE_PACKET_QUEUE_SIZE") {
            if let Ok(val) = value.parse::<usize>() {
                config.session.packet_queue_size = val;
            }
        }

        if let Ok(value) = std::env::var("GAMEWIRE_MAX_IDLE_TIME_MS") {
            if let Ok(val) = value.parse::<u64>() {
                config.session.max_idle_time = Duration::from_millis(val);
            }
        }

        if let Ok(value) = std::env::var("GAMEWIRE_COMPRESSION") {
            config.transport.compression = match value.to_ascii_lowercase().as_str() {
                "none" => CompressionKind::None,
                "lz4" => CompressionKind::Lz4,
                "zstd" => CompressionKind::Zstd,
                other => {
                    return Err(ProtocolError::ConfigError(format!(
                        "Unknown compression in GAMEWIRE_COMPRESSION: {other}"
                    )))
                }
            };
        }

        if let Ok(key) = std::env::var("GAMEWIRE_ENCRYPTION_KEY") {
            config.transport.encryption_key = Some(key);
        }

        if let Ok(level) = std::env::var("GAMEWIRE_LOG_LEVEL") {
            config.logging.log_level = level.parse::<Level>().map_err(|_| {
                ProtocolError::ConfigError(format!("Invalid log level in GAMEWIRE_LOG_LEVEL: {level}"))
            })?;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.session.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn parse_ports(variable: &str, value: &str) -> Result<Vec<u16>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u16>().map_err(|_| {
                ProtocolError::ConfigError(format!("Invalid port '{s}' in {variable}"))
            })
        })
        .collect()
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Listener and engine sizing
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// IP address every listener binds to
    pub address: String,

    /// TCP ports speaking the raw socket transport
    pub socket_ports: Vec<u16>,

    /// UDP ports multiplexing datagram sessions
    pub datagram_ports: Vec<u16>,

    /// TCP ports accepting websocket upgrades
    pub websocket_ports: Vec<u16>,

    /// UDP ports carrying the reliable-UDP transport
    pub kcp_ports: Vec<u16>,

    /// Maximum number of live sessions across all transports
    pub max_connections: usize,

    /// Size of the per-connection read buffer
    pub reader_buffer_size: usize,

    /// Number of writer shards draining session queues
    pub writer_workers: usize,

    /// Number of handler threads
    pub handler_workers: usize,

    /// Capacity of the request queue feeding the handlers
    pub request_queue_size: usize,

    /// Timeout for graceful shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1"),
            socket_ports: vec![8032],
            datagram_ports: Vec::new(),
            websocket_ports: Vec::new(),
            kcp_ports: Vec::new(),
            max_connections: 10_000,
            reader_buffer_size: 10 * 1024,
            writer_workers: 2,
            handler_workers: default_workers(),
            request_queue_size: 10_000,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<IpAddr>().is_err() {
            errors.push(format!(
                "Invalid server address: '{}' (expected an IP such as '0.0.0.0')",
                self.address
            ));
        }

        if self.socket_ports.is_empty()
            && self.datagram_ports.is_empty()
            && self.websocket_ports.is_empty()
            && self.kcp_ports.is_empty()
        {
            errors.push("At least one listening port must be configured".to_string());
        }

        // Port 0 asks the OS for an ephemeral port and may repeat
        let mut tcp = HashSet::new();
        for port in self.socket_ports.iter().chain(&self.websocket_ports) {
            if *port != 0 && !tcp.insert(*port) {
                errors.push(format!("TCP port {port} is configured more than once"));
            }
        }
        let mut udp = HashSet::new();
        for port in self.datagram_ports.iter().chain(&self.kcp_ports) {
            if *port != 0 && !udp.insert(*port) {
                errors.push(format!("UDP port {port} is configured more than once"));
            }
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 1_000_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        if self.reader_buffer_size < 512 {
            errors.push("Reader buffer size too small (minimum: 512 bytes)".to_string());
        } else if self.reader_buffer_size > 1024 * 1024 {
            errors.push("Reader buffer size too large (maximum: 1 MB)".to_string());
        }

        if self.writer_workers == 0 || self.writer_workers > 256 {
            errors.push(format!(
                "Writer workers out of range: {} (valid range: 1-256)",
                self.writer_workers
            ));
        }

        if self.handler_workers == 0 || self.handler_workers > 256 {
            errors.push(format!(
                "Handler workers out of range: {} (valid range: 1-256)",
                self.handler_workers
            ));
        }

        if self.request_queue_size == 0 {
            errors.push("Request queue size must be greater than 0".to_string());
        }

        if self.shutdown_timeout.as_secs() < 1 {
            errors.push("Shutdown timeout too short (minimum: 1s)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Wire format and payload transforms
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Serialization format of outbound payloads
    pub data_type: DataType,

    /// Compression algorithm, `none` to disable
    pub compression: CompressionKind,

    /// Minimum payload size (bytes) before compression is applied, 0 disables compression
    pub compression_threshold_bytes: usize,

    /// Maximum allowed payload size in bytes
    pub max_payload_size: usize,

    /// 64 hex characters; when absent payloads are not encrypted
    pub encryption_key: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            data_type: DataType::Zero,
            compression: CompressionKind::None,
            compression_threshold_bytes: DEFAULT_COMPRESSION_THRESHOLD_BYTES,
            max_payload_size: MAX_PAYLOAD_SIZE,
            encryption_key: None,
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_payload_size == 0 {
            errors.push("Max payload size cannot be 0".to_string());
        } else if self.max_payload_size < 1024 {
            errors.push("Max payload size too small (minimum: 1 KB)".to_string());
        } else if self.max_payload_size > 100 * 1024 * 1024 {
            errors.push(format!(
                "Max payload size too large: {} bytes (maximum recommended: 100 MB)",
                self.max_payload_size
            ));
        }

        if self.compression != CompressionKind::None
            && self.compression_threshold_bytes > self.max_payload_size
        {
            errors.push("Compression threshold cannot be larger than max payload size".to_string());
        }

        if let Some(key) = &self.encryption_key {
            if let Err(e) = ChaChaEncryptor::from_hex(key) {
                errors.push(e.to_string());
            }
        }

        errors
    }

    fn compressor(&self) -> Option<Arc<dyn BinaryPacketCompressor>> {
        self.compression
            .compressor()
            .map(|codec| Arc::new(codec) as Arc<dyn BinaryPacketCompressor>)
    }

    fn encryptor(&self) -> Result<Arc<dyn BinaryPacketEncryptor>> {
        Ok(match &self.encryption_key {
            Some(key) => Arc::new(ChaChaEncryptor::from_hex(key)?),
            None => Arc::new(NoopEncryptor),
        })
    }

    /// Encoder wired with the configured compressor, encryptor and limits
    pub fn encoder(&self) -> Result<BinaryPacketEncoder> {
        let mut encoder = BinaryPacketEncoder::new()
            .with_encryptor(self.encryptor()?)
            .with_compression_threshold(self.compression_threshold_bytes)
            .with_max_payload_size(self.max_payload_size);
        if let Some(compressor) = self.compressor() {
            encoder = encoder.with_compressor(compressor);
        }
        Ok(encoder)
    }

    /// Decoder matching [`TransportConfig::encoder`]
    pub fn decoder(&self) -> Result<BinaryPacketDecoder> {
        let mut decoder = BinaryPacketDecoder::new()
            .with_encryptor(self.encryptor()?)
            .with_max_payload_size(self.max_payload_size);
        if let Some(compressor) = self.compressor() {
            decoder = decoder.with_compressor(compressor);
        }
        Ok(decoder)
    }

    /// Whether outbound packets are encrypted by default
    pub fn encryption_enabled(&self) -> bool {
        self.encryption_key.is_some()
    }
}

/// What to do when a player logs in while already holding a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReconnectionPolicy {
    /// Refuse the new association, the old session stays
    #[default]
    RejectNew,
    /// Close the old session with cause RECONNECTION and keep the new one
    PreemptOld,
}

/// Session lifecycle settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Capacity of each session's outbound queue
    pub packet_queue_size: usize,

    /// Close sessions without traffic for this long, 0 disables
    #[serde(with = "duration_serde")]
    pub max_idle_time: Duration,

    /// 0 means unlimited
    pub max_connections_per_ip: usize,

    /// Close sessions not associated to a player within this time, 0 disables
    #[serde(with = "duration_serde")]
    pub orphan_allowance: Duration,

    /// Period of the idle and orphan sweep
    #[serde(with = "duration_serde")]
    pub idle_check_interval: Duration,

    /// Period of the reliable-UDP update sweep
    #[serde(with = "duration_serde")]
    pub kcp_update_interval: Duration,

    pub reconnection: ReconnectionPolicy,

    /// Period of the statistics log line, 0 disables
    #[serde(with = "duration_serde")]
    pub statistics_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            packet_queue_size: DEFAULT_PACKET_QUEUE_SIZE,
            max_idle_time: Duration::ZERO,
            max_connections_per_ip: 0,
            orphan_allowance: DEFAULT_ORPHAN_ALLOWANCE,
            idle_check_interval: Duration::from_secs(1),
            kcp_update_interval: DEFAULT_KCP_UPDATE_INTERVAL,
            reconnection: ReconnectionPolicy::RejectNew,
            statistics_interval: Duration::from_secs(60),
        }
    }
}

impl SessionConfig {
    /// Validate session configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.packet_queue_size == 0 {
            errors.push("Packet queue size must be greater than 0".to_string());
        } else if self.packet_queue_size > 1_000_000 {
            errors.push(format!(
                "Packet queue size too large: {} (max recommended: 1,000,000)",
                self.packet_queue_size
            ));
        }

        if self.idle_check_interval.as_millis() < 10 {
            errors.push("Idle check interval too short (minimum: 10ms)".to_string());
        }

        if !self.max_idle_time.is_zero() && self.max_idle_time < self.idle_check_interval {
            errors.push("Max idle time must not be shorter than the idle check interval".to_string());
        }

        if self.kcp_update_interval.is_zero() {
            errors.push("KCP update interval must be greater than 0".to_string());
        } else if self.kcp_update_interval.as_millis() > 1000 {
            errors.push("KCP update interval too long (maximum: 1s)".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("gamewire"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = NetworkConfig::default();
        assert!(config.validate().is_empty(), "{:?}", config.validate());
        assert_eq!(config.session.packet_queue_size, 100);
        assert_eq!(config.session.orphan_allowance, Duration::from_secs(3));
        assert_eq!(config.session.kcp_update_interval, Duration::from_millis(10));
        assert_eq!(config.transport.compression_threshold_bytes, 3000);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_toml_parsing_with_partial_sections() {
        let config = NetworkConfig::from_toml(
            r#"
            [server]
            address = "0.0.0.0"
            socket_ports = [9000, 9001]
            datagram_ports = [9002]

            [transport]
            data_type = "msgpack"
            compression = "zstd"

            [session]
            max_idle_time = 15000
            reconnection = "preempt-old"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.socket_ports, vec![9000, 9001]);
        assert_eq!(config.server.datagram_ports, vec![9002]);
        assert_eq!(config.server.max_connections, 10_000);
        assert_eq!(config.transport.data_type, DataType::MsgPack);
        assert_eq!(config.transport.compression, CompressionKind::Zstd);
        assert_eq!(config.session.max_idle_time, Duration::from_secs(15));
        assert_eq!(config.session.reconnection, ReconnectionPolicy::PreemptOld);
        assert_eq!(config.session.packet_queue_size, 100);
    }

    #[test]
    fn test_duplicate_ports_rejected() {
        let config = NetworkConfig::default_with_overrides(|c| {
            c.server.socket_ports = vec![9000];
            c.server.websocket_ports = vec![9000];
            c.server.datagram_ports = vec![9000];
        });
        let errors = config.validate();
        assert_eq!(errors.len(), 1, "{errors:?}");
        assert!(errors[0].contains("TCP port 9000"));
    }

    #[test]
    fn test_bad_encryption_key_reported() {
        let config = NetworkConfig::default_with_overrides(|c| {
            c.transport.encryption_key = Some("beef".into());
        });
        assert!(config.validate_strict().is_err());
    }

    #[test]
    fn test_parse_ports() {
        assert_eq!(parse_ports("X", "1, 2,3").ok(), Some(vec![1, 2, 3]));
        assert!(parse_ports("X", "1,abc").is_err());
    }
}
