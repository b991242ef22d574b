//! # Configuration Management
//!
//! Centralized configuration for the mmtls client.
//!
//! Every constant the transport core depends on (hosts, client version, device
//! type, the route table selecting the AEAD decode variant, the return-code
//! vocabulary) lives here as data. A single `ClientConfig` is built at startup
//! and passed to constructors; nothing reads process-wide globals.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()`

use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

/// Max allowed payload size (e.g. 16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Default client version advertised in every header
pub const DEFAULT_CLIENT_VERSION: u32 = 0x1800_3727;

/// Default device type byte
pub const DEFAULT_DEVICE_TYPE: u8 = 0x0d;

/// CGI id of the synchronization route that uses the AEAD decode variant
pub const NEWSYNC_CGI: u32 = 138;

/// Path of the synchronization route
pub const NEWSYNC_PATH: &str = "/cgi-bin/micromsg-bin/newsync";

/// Server hybrid public key (SEC1 uncompressed P-256)
pub const DEFAULT_HYBRID_SERVER_KEY: &str = "047ebe7604acf072b0ab0177ea551a7b72588f9b5d3801dfd7bb1bca8e33d1c3b8fa6e4e4026eb38d5bb365088a3d3167c83bdd0bbb46255f88a16ede6f7ab43b5";

/// Main client configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Remote endpoints
    #[serde(default)]
    pub endpoints: EndpointConfig,

    /// Version and device constants
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Route table selecting the decode variant per CGI id
    #[serde(default = "default_routes")]
    pub routes: Vec<RouteEntry>,

    /// Server return-code vocabulary
    #[serde(default)]
    pub return_codes: ReturnCodeTable,

    /// HTTP transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Long-link configuration
    #[serde(default)]
    pub long_link: LongLinkConfig,

    /// Session store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoints: EndpointConfig::default(),
            protocol: ProtocolConfig::default(),
            routes: default_routes(),
            return_codes: ReturnCodeTable::default(),
            transport: TransportConfig::default(),
            long_link: LongLinkConfig::default(),
            store: StoreConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ClientConfig {
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

        if let Ok(host) = std::env::var("MMTLS_SHORT_HOST") {
            config.endpoints.short_host = host;
        }

        if let Ok(host) = std::env::var("MMTLS_LONG_HOST") {
            config.endpoints.long_host = host;
        }

        if let Ok(port) = std::env::var("MMTLS_LONG_PORT") {
            config.endpoints.long_port = port
                .parse::<u16>()
                .map_err(|e| ProtocolError::ConfigError(format!("MMTLS_LONG_PORT: {e}")))?;
        }

        if let Ok(version) = std::env::var("MMTLS_CLIENT_VERSION") {
            config.protocol.client_version = parse_version(&version)?;
        }

        if let Ok(timeout) = std::env::var("MMTLS_HTTP_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.transport.http_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(dir) = std::env::var("MMTLS_STORE_DIR") {
            config.store.backend = StoreBackendKind::File;
            config.store.directory = Some(PathBuf::from(dir));
        }

        if let Ok(level) = std::env::var("MMTLS_LOG_LEVEL") {
            config.logging.log_level = level
                .parse::<Level>()
                .map_err(|_| ProtocolError::ConfigError(format!("Invalid log level: {level}")))?;
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

    /// Decode variant for a route. Routes absent from the table are legacy.
    pub fn route_variant(&self, cgi: u32) -> DecodeVariant {
        self.routes
            .iter()
            .find(|entry| entry.cgi == cgi)
            .map(|entry| entry.variant)
            .unwrap_or(DecodeVariant::Legacy)
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        errors.extend(self.endpoints.validate());
        errors.extend(self.protocol.validate());
        errors.extend(validate_routes(&self.routes));
        errors.extend(self.return_codes.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.long_link.validate());
        errors.extend(self.store.validate());
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

fn parse_version(value: &str) -> Result<u32> {
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse::<u32>(),
    };
    parsed.map_err(|e| ProtocolError::ConfigError(format!("Invalid client version {value}: {e}")))
}

/// Remote endpoint configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EndpointConfig {
    /// Host serving handshake and business requests
    pub short_host: String,

    /// Host serving the long-link
    pub long_host: String,

    /// Long-link TCP port
    pub long_port: u16,

    /// URL scheme for short-link requests ("http" or "https")
    pub scheme: String,

    /// Path of the handshake endpoint
    pub handshake_path: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            short_host: String::from("extshort.weixin.qq.com"),
            long_host: String::from("long.weixin.qq.com"),
            long_port: 80,
            scheme: String::from("http"),
            handshake_path: String::from("/mmtls/handshake"),
        }
    }
}

impl EndpointConfig {
    /// Validate endpoint configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.short_host.is_empty() {
            errors.push("Short-link host cannot be empty".to_string());
        }

        if self.long_host.is_empty() {
            errors.push("Long-link host cannot be empty".to_string());
        }

        if self.long_port == 0 {
            errors.push("Long-link port cannot be 0".to_string());
        }

        if self.scheme != "http" && self.scheme != "https" {
            errors.push(format!(
                "Unsupported scheme: '{}' (expected 'http' or 'https')",
                self.scheme
            ));
        }

        if !self.handshake_path.starts_with('/') {
            errors.push(format!(
                "Handshake path must start with '/': '{}'",
                self.handshake_path
            ));
        }

        errors
    }
}

/// Version tables and device constants written into every frame
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProtocolConfig {
    /// Client version written into the server-version header field
    pub client_version: u32,

    /// Device type byte
    pub device_type: u8,

    /// Encode version header field
    pub encode_version: u32,

    /// Hybrid key version header field
    pub hybrid_key_version: u8,

    /// Hex-encoded server hybrid public key
    pub hybrid_server_public_key: String,

    /// User agent sent on short-link requests
    pub user_agent: String,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            client_version: DEFAULT_CLIENT_VERSION,
            device_type: DEFAULT_DEVICE_TYPE,
            encode_version: 0,
            hybrid_key_version: 1,
            hybrid_server_public_key: String::from(DEFAULT_HYBRID_SERVER_KEY),
            user_agent: String::from("MicroMessenger Client"),
        }
    }
}

impl ProtocolConfig {
    /// Decoded server hybrid public key
    pub fn hybrid_server_public_key(&self) -> Result<Vec<u8>> {
        let bytes = hex::decode(&self.hybrid_server_public_key).map_err(|e| {
            ProtocolError::ConfigError(format!("Invalid hybrid server public key: {e}"))
        })?;
        if bytes.len() != 65 || bytes[0] != 0x04 {
            return Err(ProtocolError::ConfigError(
                "Hybrid server public key must be 65-byte uncompressed SEC1".to_string(),
            ));
        }
        Ok(bytes)
    }

    /// Validate protocol configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.client_version == 0 {
            errors.push("Client version cannot be 0".to_string());
        }

        if let Err(e) = self.hybrid_server_public_key() {
            errors.push(e.to_string());
        }

        if self.user_agent.is_empty() {
            errors.push("User agent cannot be empty".to_string());
        }

        errors
    }
}

/// Which key schedule decodes responses for a route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodeVariant {
    /// AES-CBC under the session key
    Legacy,
    /// AES-GCM under the server session key
    Aead,
}

/// One row of the route table
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RouteEntry {
    /// Numeric CGI id written into the route header field
    pub cgi: u32,

    /// Request path on the short-link host
    pub path: String,

    /// Decode variant for responses on this route
    pub variant: DecodeVariant,
}

fn default_routes() -> Vec<RouteEntry> {
    vec![RouteEntry {
        cgi: NEWSYNC_CGI,
        path: String::from(NEWSYNC_PATH),
        variant: DecodeVariant::Aead,
    }]
}

fn validate_routes(routes: &[RouteEntry]) -> Vec<String> {
    let mut errors = Vec::new();
    for (i, entry) in routes.iter().enumerate() {
        if routes[..i].iter().any(|other| other.cgi == entry.cgi) {
            errors.push(format!("Duplicate route table entry for cgi {}", entry.cgi));
        }
        if !entry.path.starts_with('/') {
            errors.push(format!("Route path must start with '/': '{}'", entry.path));
        }
    }
    errors
}

/// A named server status code
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StatusMessage {
    pub code: i32,
    pub message: String,
}

/// Server return-code vocabulary
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReturnCodeTable {
    /// Status meaning the session timed out and must be renegotiated
    pub session_timeout: i32,

    /// Status meaning the account was logged out
    pub logged_out: i32,

    /// Human-readable names for known codes
    #[serde(default)]
    pub messages: Vec<StatusMessage>,
}

impl Default for ReturnCodeTable {
    fn default() -> Self {
        let named = [
            (0, "MM_OK"),
            (-1, "MM_ERR_SYS"),
            (-2, "MM_ERR_ARG"),
            (-3, "MM_ERR_PASSWORD"),
            (-4, "MM_ERR_NOUSER"),
            (-13, "MM_ERR_SESSIONTIMEOUT"),
            (-100, "MM_ERR_LOGOUT"),
        ];
        Self {
            session_timeout: -13,
            logged_out: -100,
            messages: named
                .iter()
                .map(|(code, message)| StatusMessage {
                    code: *code,
                    message: (*message).to_string(),
                })
                .collect(),
        }
    }
}

impl ReturnCodeTable {
    /// Validate return-code configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.session_timeout == 0 || self.logged_out == 0 {
            errors.push("Session-timeout and logged-out codes must be non-zero".to_string());
        }

        if self.session_timeout == self.logged_out {
            errors.push("Session-timeout and logged-out codes must differ".to_string());
        }

        errors
    }
}

/// Short-link transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Maximum allowed payload size in bytes
    pub max_payload_size: usize,

    /// Timeout applied by the HTTP client to each POST
    #[serde(with = "duration_serde")]
    pub http_timeout: Duration,

    /// Timeout for one complete handshake attempt
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// Default bound for one dispatched request when the caller gives none
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,

    /// zlib compression level (0-9)
    pub compression_level: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_payload_size: MAX_PAYLOAD_SIZE,
            http_timeout: timeout::DEFAULT_TIMEOUT,
            handshake_timeout: timeout::HANDSHAKE_TIMEOUT,
            request_timeout: timeout::DEFAULT_TIMEOUT,
            compression_level: 6,
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_payload_size < 1024 {
            errors.push("Max payload size too small (minimum: 1 KB)".to_string());
        } else if self.max_payload_size > 100 * 1024 * 1024 {
            errors.push(format!(
                "Max payload size too large: {} bytes (maximum recommended: 100 MB)",
                self.max_payload_size
            ));
        }

        if self.http_timeout.as_millis() < 100 {
            errors.push("HTTP timeout too short (minimum: 100ms)".to_string());
        }

        if self.handshake_timeout.as_millis() < 100 {
            errors.push("Handshake timeout too short (minimum: 100ms)".to_string());
        }

        if self.request_timeout.as_millis() < 100 {
            errors.push("Request timeout too short (minimum: 100ms)".to_string());
        }

        if self.compression_level > 9 {
            errors.push(format!(
                "Invalid compression level: {} (expected 0-9)",
                self.compression_level
            ));
        }

        errors
    }
}

/// Long-link configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LongLinkConfig {
    /// Timeout for the TCP connect plus link hello
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Timeout waiting for a response to a long-link request
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,

    /// Interval between heartbeat records
    #[serde(with = "duration_serde")]
    pub heartbeat_interval: Duration,

    /// Largest record payload accepted from the socket
    pub max_record_size: usize,
}

impl Default for LongLinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: timeout::CONNECT_TIMEOUT,
            request_timeout: timeout::DEFAULT_TIMEOUT,
            heartbeat_interval: timeout::KEEPALIVE_INTERVAL,
            max_record_size: u16::MAX as usize,
        }
    }
}

impl LongLinkConfig {
    /// Validate long-link configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.connect_timeout.as_millis() < 100 {
            errors.push("Connect timeout too short (minimum: 100ms)".to_string());
        }

        if self.heartbeat_interval.as_millis() < 100 {
            errors.push("Heartbeat interval too short (minimum: 100ms)".to_string());
        } else if self.heartbeat_interval.as_secs() > 3600 {
            errors.push("Heartbeat interval too long (maximum: 1 hour)".to_string());
        }

        if self.max_record_size > u16::MAX as usize {
            errors.push(format!(
                "Max record size {} exceeds the 16-bit record length field",
                self.max_record_size
            ));
        }

        errors
    }
}

/// Which session store backend to construct
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendKind {
    Memory,
    File,
}

/// Session store configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Backend kind
    pub backend: StoreBackendKind,

    /// Directory for the file backend
    pub directory: Option<PathBuf>,

    /// TTL in seconds used when a new account record is stored (0 = permanent)
    pub default_ttl_seconds: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackendKind::Memory,
            directory: None,
            default_ttl_seconds: 0,
        }
    }
}

impl StoreConfig {
    /// Validate store configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.backend == StoreBackendKind::File && self.directory.is_none() {
            errors.push("store.directory must be specified for the file backend".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("mmtls-client"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
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

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
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
