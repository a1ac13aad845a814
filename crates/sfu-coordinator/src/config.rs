//! SFU coordinator configuration.
//!
//! Configuration is loaded from environment variables. Every variable has a
//! default so the coordinator starts with an empty environment.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Default WebSocket signaling bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:3001";

/// Default WebSocket route.
pub const DEFAULT_WS_PATH: &str = "/sfu";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:3002";

/// Default IP the media engine listens on.
pub const DEFAULT_LISTEN_IP: &str = "0.0.0.0";

/// Default IP announced in ICE candidates.
pub const DEFAULT_ANNOUNCED_IP: &str = "127.0.0.1";

/// Default lower bound of the RTC port range.
pub const DEFAULT_RTC_MIN_PORT: u16 = 40000;

/// Default upper bound of the RTC port range.
pub const DEFAULT_RTC_MAX_PORT: u16 = 49999;

/// Default limit of concurrent WebSocket connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1000;

/// Default limit of concurrent sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 100;

/// Default limit of members per session.
pub const DEFAULT_MAX_PARTICIPANTS_PER_SESSION: usize = 50;

/// Default initial outgoing bitrate for new transports (bits per second).
pub const DEFAULT_INITIAL_OUTGOING_BITRATE: u32 = 1_000_000;

/// Default SFU instance ID prefix.
pub const DEFAULT_SFU_ID_PREFIX: &str = "sfu";

/// SFU coordinator configuration.
#[derive(Clone)]
pub struct Config {
    /// WebSocket signaling bind address (default: "0.0.0.0:3001").
    pub bind_address: String,

    /// WebSocket route path (default: "/sfu").
    pub ws_path: String,

    /// Health and metrics bind address (default: "0.0.0.0:3002").
    pub health_bind_address: String,

    /// IP the media engine listens on.
    pub listen_ip: String,

    /// IP announced to clients in ICE candidates.
    pub announced_ip: String,

    /// Lowest RTC port the engine may allocate.
    pub rtc_min_port: u16,

    /// Highest RTC port the engine may allocate.
    pub rtc_max_port: u16,

    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,

    /// Maximum concurrent sessions.
    pub max_sessions: usize,

    /// Maximum members per session.
    pub max_participants_per_session: usize,

    /// Initial outgoing bitrate handed to the engine per transport.
    pub initial_outgoing_bitrate: u32,

    /// Unique identifier for this SFU instance.
    pub sfu_id: String,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("sfu_id", &self.sfu_id)
            .field("bind_address", &self.bind_address)
            .field("ws_path", &self.ws_path)
            .field("health_bind_address", &self.health_bind_address)
            .field("listen_ip", &self.listen_ip)
            .field("announced_ip", &self.announced_ip)
            .field(
                "rtc_ports",
                &format_args!("{}-{}", self.rtc_min_port, self.rtc_max_port),
            )
            .field("max_connections", &self.max_connections)
            .field("max_sessions", &self.max_sessions)
            .field(
                "max_participants_per_session",
                &self.max_participants_per_session,
            )
            .field("initial_outgoing_bitrate", &self.initial_outgoing_bitrate)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

fn string_var(vars: &HashMap<String, String>, name: &str, default: &str) -> String {
    vars.get(name)
        .cloned()
        .unwrap_or_else(|| default.to_string())
}

fn parsed_var<T: FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{name}={raw}"))),
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a numeric variable does not parse
    /// or the RTC port range is empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// See [`Config::from_env`].
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = string_var(vars, "SFU_BIND_ADDRESS", DEFAULT_BIND_ADDRESS);
        let ws_path = string_var(vars, "SFU_WS_PATH", DEFAULT_WS_PATH);
        let health_bind_address =
            string_var(vars, "SFU_HEALTH_BIND_ADDRESS", DEFAULT_HEALTH_BIND_ADDRESS);
        let listen_ip = string_var(vars, "SFU_LISTEN_IP", DEFAULT_LISTEN_IP);
        let announced_ip = string_var(vars, "SFU_ANNOUNCED_IP", DEFAULT_ANNOUNCED_IP);

        if !ws_path.starts_with('/') {
            return Err(ConfigError::InvalidValue(format!(
                "SFU_WS_PATH must start with '/': {ws_path}"
            )));
        }

        let rtc_min_port = parsed_var(vars, "SFU_RTC_MIN_PORT", DEFAULT_RTC_MIN_PORT)?;
        let rtc_max_port = parsed_var(vars, "SFU_RTC_MAX_PORT", DEFAULT_RTC_MAX_PORT)?;
        if rtc_min_port > rtc_max_port {
            return Err(ConfigError::InvalidValue(format!(
                "SFU_RTC_MIN_PORT ({rtc_min_port}) is greater than SFU_RTC_MAX_PORT ({rtc_max_port})"
            )));
        }

        // Capacity limits
        let max_connections = parsed_var(vars, "SFU_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?;
        let max_sessions = parsed_var(vars, "SFU_MAX_SESSIONS", DEFAULT_MAX_SESSIONS)?;
        let max_participants_per_session = parsed_var(
            vars,
            "SFU_MAX_PARTICIPANTS_PER_SESSION",
            DEFAULT_MAX_PARTICIPANTS_PER_SESSION,
        )?;

        let initial_outgoing_bitrate = parsed_var(
            vars,
            "SFU_INITIAL_OUTGOING_BITRATE",
            DEFAULT_INITIAL_OUTGOING_BITRATE,
        )?;

        // Generate SFU instance ID
        let sfu_id = vars.get("SFU_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_SFU_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            bind_address,
            ws_path,
            health_bind_address,
            listen_ip,
            announced_ip,
            rtc_min_port,
            rtc_max_port,
            max_connections,
            max_sessions,
            max_participants_per_session,
            initial_outgoing_bitrate,
            sfu_id,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config =
            Config::from_vars(&HashMap::new()).expect("Config should load successfully");

        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(config.ws_path, "/sfu");
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert_eq!(config.listen_ip, "0.0.0.0");
        assert_eq!(config.announced_ip, "127.0.0.1");
        assert_eq!(config.rtc_min_port, 40000);
        assert_eq!(config.rtc_max_port, 49999);
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.max_sessions, 100);
        assert_eq!(config.max_participants_per_session, 50);
        assert_eq!(config.initial_outgoing_bitrate, 1_000_000);
        // SFU ID should be auto-generated
        assert!(config.sfu_id.starts_with("sfu-"));
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let vars = HashMap::from([
            ("SFU_BIND_ADDRESS".to_string(), "127.0.0.1:4000".to_string()),
            ("SFU_WS_PATH".to_string(), "/signal".to_string()),
            ("SFU_ANNOUNCED_IP".to_string(), "203.0.113.5".to_string()),
            ("SFU_RTC_MIN_PORT".to_string(), "10000".to_string()),
            ("SFU_RTC_MAX_PORT".to_string(), "10100".to_string()),
            ("SFU_MAX_SESSIONS".to_string(), "3".to_string()),
            (
                "SFU_MAX_PARTICIPANTS_PER_SESSION".to_string(),
                "2".to_string(),
            ),
            ("SFU_ID".to_string(), "sfu-custom-001".to_string()),
        ]);

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.bind_address, "127.0.0.1:4000");
        assert_eq!(config.ws_path, "/signal");
        assert_eq!(config.announced_ip, "203.0.113.5");
        assert_eq!(config.rtc_min_port, 10000);
        assert_eq!(config.rtc_max_port, 10100);
        assert_eq!(config.max_sessions, 3);
        assert_eq!(config.max_participants_per_session, 2);
        assert_eq!(config.sfu_id, "sfu-custom-001");
    }

    #[test]
    fn test_non_numeric_value_is_rejected() {
        let vars = HashMap::from([("SFU_MAX_SESSIONS".to_string(), "lots".to_string())]);

        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidValue(v)) if v.contains("SFU_MAX_SESSIONS"))
        );
    }

    #[test]
    fn test_inverted_port_range_is_rejected() {
        let vars = HashMap::from([
            ("SFU_RTC_MIN_PORT".to_string(), "50000".to_string()),
            ("SFU_RTC_MAX_PORT".to_string(), "40000".to_string()),
        ]);

        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_port_out_of_range_is_rejected() {
        let vars = HashMap::from([("SFU_RTC_MAX_PORT".to_string(), "70000".to_string())]);

        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_ws_path_must_be_absolute() {
        let vars = HashMap::from([("SFU_WS_PATH".to_string(), "sfu".to_string())]);

        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_debug_output_lists_port_range() {
        let config = Config::from_vars(&HashMap::new()).unwrap();
        let debug_output = format!("{config:?}");

        assert!(debug_output.contains("40000-49999"));
        assert!(debug_output.contains("max_sessions"));
    }
}
