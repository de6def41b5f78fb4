//! # Configuration Management
//!
//! Centralized configuration for the packet channel and handshake layers.
//!
//! This module provides structured configuration for both sides of a
//! connection: transport parameters, authentication mode, certificate
//! refresh cadence, and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-specific overrides via `from_env()`
//!
//! ## Security Considerations
//! - Insecure authentication mode is spoofable by design; permission grants
//!   stay disabled in that mode unless `allow_insecure_permissions` is set
//! - Wire length caps bound allocations before they happen

use crate::error::{NetError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// The 16-byte token both peers must put first on the wire.
///
/// Purely a convention check against mismatched component load order, not a
/// cryptographic measure.
pub const AUTH_MAGIC: &[u8; 16] = b"PHOENIXAUTHSTART";

/// Max allowed length for any single length-prefixed string or byte array.
pub const MAX_WIRE_LEN: usize = 16 * 1024 * 1024;

/// Max nesting depth accepted when decoding tagged values.
pub const MAX_VALUE_DEPTH: usize = 32;

/// Safety margin subtracted from certificate expiry before a refresh is
/// considered due.
pub const CERT_REFRESH_MARGIN: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Main configuration structure containing all configurable settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetConfig {
    /// Connection/transport configuration
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Authentication configuration
    #[serde(default)]
    pub auth: AuthConfig,

    /// Certificate refresh configuration
    #[serde(default)]
    pub refresh: RefreshConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| NetError::Config(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| NetError::Config(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| NetError::Config(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables, on top of defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("PHOENIX_NET_ADDRESS") {
            config.connection.address = addr;
        }

        if let Ok(timeout) = std::env::var("PHOENIX_NET_HANDSHAKE_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.connection.handshake_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(api) = std::env::var("PHOENIX_NET_IDENTITY_API") {
            config.auth.identity_api = api;
        }

        if let Ok(game_id) = std::env::var("PHOENIX_NET_GAME_ID") {
            config.auth.game_id = game_id;
        }

        if let Ok(debug) = std::env::var("PHOENIX_NET_DEBUG_MODE") {
            config.connection.debug_mode = debug == "1" || debug.eq_ignore_ascii_case("true");
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration.
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content.
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Validate the configuration for common misconfigurations.
    ///
    /// Returns a list of validation errors. Empty list means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.connection.validate());
        errors.extend(self.auth.validate());
        errors.extend(self.refresh.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method.
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(NetError::Config(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Connection/transport configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Listen or target address (e.g., "127.0.0.1:7350")
    pub address: String,

    /// Time allowed for the full open sequence (magic + auth handshake)
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// Default timeout for send-and-wait response correlation
    #[serde(with = "duration_serde")]
    pub response_timeout: Duration,

    /// Loopback duplex buffer capacity in bytes
    pub loopback_buffer: usize,

    /// Debug mode: unhandled frames and registry desyncs become hard errors
    pub debug_mode: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:7350"),
            handshake_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(30),
            loopback_buffer: 64 * 1024,
            debug_mode: false,
        }
    }
}

impl ConnectionConfig {
    /// Validate connection configuration.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Connection address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid address format: '{}' (expected format: '0.0.0.0:7350')",
                self.address
            ));
        }

        if self.handshake_timeout.as_millis() < 100 {
            errors.push("Handshake timeout too short (minimum: 100ms)".to_string());
        } else if self.handshake_timeout.as_secs() > 120 {
            errors.push("Handshake timeout too long (maximum: 120s)".to_string());
        }

        if self.response_timeout.as_millis() < 100 {
            errors.push("Response timeout too short (minimum: 100ms)".to_string());
        }

        if self.loopback_buffer < 1024 {
            errors.push("Loopback buffer too small (minimum: 1 KB)".to_string());
        }

        errors
    }
}

/// How a peer picks its handshake variant.
///
/// Mode is decided locally on each side and is never negotiated on the
/// wire; see `auth::handshake` for the consequences of a mismatched pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Use secure mode when a valid, unexpired token for the configured
    /// game is available; fall back to insecure otherwise.
    #[default]
    Auto,
    /// Always run the certificate/token handshake.
    Secure,
    /// Always run the plaintext identity handshake. Spoofable.
    Insecure,
}

/// Authentication configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Handshake mode selection
    pub mode: AuthMode,

    /// Base URL of the identity service
    pub identity_api: String,

    /// Game identifier tokens and certificates must match
    pub game_id: String,

    /// Opt-in: keep permission grants active for insecurely-authenticated
    /// peers. Off by default because insecure identities are spoofable.
    pub allow_insecure_permissions: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::Auto,
            identity_api: String::from("https://identity.example.com"),
            game_id: String::new(),
            allow_insecure_permissions: false,
        }
    }
}

impl AuthConfig {
    /// Validate authentication configuration.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.mode != AuthMode::Insecure {
            if self.identity_api.is_empty() {
                errors.push("Identity API URL cannot be empty in secure/auto mode".to_string());
            } else if !self.identity_api.starts_with("http://")
                && !self.identity_api.starts_with("https://")
            {
                errors.push(format!(
                    "Identity API URL must be http(s): '{}'",
                    self.identity_api
                ));
            }

            if self.game_id.is_empty() {
                errors.push("Game ID cannot be empty in secure/auto mode".to_string());
            }
        }

        if self.mode == AuthMode::Insecure && self.allow_insecure_permissions {
            errors.push(
                "WARNING: permissions enabled for spoofable insecure identities".to_string(),
            );
        }

        errors
    }
}

/// Certificate refresh configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RefreshConfig {
    /// How often the refresh task re-evaluates the certificate
    #[serde(with = "duration_serde")]
    pub interval: Duration,

    /// Addresses the certificate must keep advertising
    pub addresses: Vec<String>,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            addresses: Vec::new(),
        }
    }
}

impl RefreshConfig {
    /// Validate refresh configuration.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.interval.as_secs() < 60 {
            errors.push("Refresh interval too short (minimum: 60s)".to_string());
        }

        errors
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
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
            app_name: String::from("phoenix-net"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration.
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

/// Helper module for Duration serialization/deserialization.
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

/// Helper module for tracing::Level serialization/deserialization.
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
