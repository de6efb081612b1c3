//! Server and client configuration.
//!
//! Loaded from environment variables with the `WOLFCONF` prefix, `__`
//! separating nested keys. A `.env` file is read first when present.
//!
//! - `WOLFCONF__SERVER__PORT=3000` -> `server.port`
//! - `WOLFCONF__ROOMS__MAX_PARTICIPANTS=8` -> `rooms.max_participants`
//! - `WOLFCONF__RECONNECT__DELAY_MS=2000` -> `reconnect.delay_ms` (client side)

use std::net::SocketAddr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration loading failed: {0}")]
    Load(#[from] config::ConfigError),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid port number")]
    InvalidPort,

    #[error("invalid bind address: {0}")]
    InvalidAddress(String),

    #[error("a room must admit at least two participants")]
    RoomTooSmall,

    #[error("reconnect.max_attempts must be at least 1")]
    NoReconnectAttempts,
}

fn load_env<T: DeserializeOwned>() -> Result<T, ConfigError> {
    dotenvy::dotenv().ok();

    let config = config::Config::builder()
        .add_source(
            config::Environment::default()
                .prefix("WOLFCONF")
                .separator("__"),
        )
        .build()?
        .try_deserialize()?;

    Ok(config)
}

/// Server process configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub rooms: RoomSettings,
}

impl AppConfig {
    /// Load and validate.
    pub fn load() -> Result<Self, ConfigError> {
        let config: Self = load_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.server.validate()?;
        self.rooms.validate()?;
        Ok(())
    }
}

/// Configuration of a call client built on [`crate::client`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    /// Load and validate.
    pub fn load() -> Result<Self, ConfigError> {
        let config: Self = load_env()?;
        config.reconnect.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Directory served at `/` for the browser client.
    #[serde(default = "default_static_dir")]
    pub static_dir: String,

    #[serde(default = "default_ws_path")]
    pub ws_path: String,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ValidationError> {
        let raw = format!("{}:{}", self.host, self.port);
        raw.parse()
            .map_err(|_| ValidationError::InvalidAddress(raw))
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        self.socket_addr()?;
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            static_dir: default_static_dir(),
            ws_path: default_ws_path(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info,wolfconf=debug".to_string()
}

fn default_static_dir() -> String {
    "public".to_string()
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

/// Limits enforced by the room registry.
#[derive(Debug, Clone, Deserialize)]
pub struct RoomSettings {
    #[serde(default = "default_max_participants")]
    pub max_participants: usize,

    /// Chat text beyond this many characters is cut off.
    #[serde(default = "default_max_chat_len")]
    pub max_chat_len: usize,
}

impl RoomSettings {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_participants < 2 {
            return Err(ValidationError::RoomTooSmall);
        }
        Ok(())
    }
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            max_participants: default_max_participants(),
            max_chat_len: default_max_chat_len(),
        }
    }
}

fn default_max_participants() -> usize {
    16
}

fn default_max_chat_len() -> usize {
    2000
}

/// Client-side recovery policy for failed peer links.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectPolicy {
    #[serde(default = "default_reconnect_delay_ms")]
    pub delay_ms: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Let guests re-offer too, not only the host.
    #[serde(default)]
    pub non_host_retries: bool,
}

impl ReconnectPolicy {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_attempts == 0 {
            return Err(ValidationError::NoReconnectAttempts);
        }
        Ok(())
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay_ms: default_reconnect_delay_ms(),
            max_attempts: default_max_attempts(),
            non_host_retries: false,
        }
    }
}

fn default_reconnect_delay_ms() -> u64 {
    2000
}

fn default_max_attempts() -> u32 {
    3
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // env vars are process-global
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env() {
        env::remove_var("WOLFCONF__SERVER__PORT");
        env::remove_var("WOLFCONF__SERVER__LOG_FORMAT");
        env::remove_var("WOLFCONF__ROOMS__MAX_PARTICIPANTS");
        env::remove_var("WOLFCONF__RECONNECT__DELAY_MS");
        env::remove_var("WOLFCONF__RECONNECT__MAX_ATTEMPTS");
    }

    #[test]
    fn loads_defaults_without_env() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        let config = AppConfig::load().unwrap();

        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.ws_path, "/ws");
        assert_eq!(config.rooms.max_participants, 16);
        assert!(config.validate().is_ok());

        let client = ClientConfig::load().unwrap();
        assert_eq!(client.reconnect.delay(), Duration::from_secs(2));
        assert!(!client.reconnect.non_host_retries);
    }

    #[test]
    fn env_overrides_nested_values() {
        let _guard = ENV_MUTEX.lock().unwrap();
        env::set_var("WOLFCONF__SERVER__PORT", "4000");
        env::set_var("WOLFCONF__SERVER__LOG_FORMAT", "json");
        env::set_var("WOLFCONF__ROOMS__MAX_PARTICIPANTS", "4");
        env::set_var("WOLFCONF__RECONNECT__DELAY_MS", "500");
        let result = AppConfig::load();
        let client = ClientConfig::load();
        clear_env();

        let config = result.unwrap();
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.server.log_format, LogFormat::Json);
        assert_eq!(config.rooms.max_participants, 4);
        assert_eq!(client.unwrap().reconnect.delay_ms, 500);
    }

    #[test]
    fn load_rejects_invalid_values() {
        let _guard = ENV_MUTEX.lock().unwrap();
        env::set_var("WOLFCONF__ROOMS__MAX_PARTICIPANTS", "1");
        env::set_var("WOLFCONF__RECONNECT__MAX_ATTEMPTS", "0");
        let server = AppConfig::load();
        let client = ClientConfig::load();
        clear_env();

        assert!(matches!(
            server,
            Err(ConfigError::Validation(ValidationError::RoomTooSmall))
        ));
        assert!(matches!(
            client,
            Err(ConfigError::Validation(ValidationError::NoReconnectAttempts))
        ));
    }

    #[test]
    fn socket_addr_parses() {
        let config = ServerConfig {
            host: "0.0.0.0".into(),
            port: 8080,
            ..Default::default()
        };
        assert_eq!(config.socket_addr().unwrap().to_string(), "0.0.0.0:8080");
    }

    #[test]
    fn rejects_bad_values() {
        let server = ServerConfig {
            port: 0,
            ..Default::default()
        };
        assert_eq!(server.validate(), Err(ValidationError::InvalidPort));

        let server = ServerConfig {
            host: "not a host".into(),
            ..Default::default()
        };
        assert!(matches!(
            server.validate(),
            Err(ValidationError::InvalidAddress(_))
        ));

        let rooms = RoomSettings {
            max_participants: 1,
            ..Default::default()
        };
        assert_eq!(rooms.validate(), Err(ValidationError::RoomTooSmall));

        let reconnect = ReconnectPolicy {
            max_attempts: 0,
            ..Default::default()
        };
        assert_eq!(reconnect.validate(), Err(ValidationError::NoReconnectAttempts));
    }
}
