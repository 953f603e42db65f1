//! Configuration Module
//!
//! TOML configuration for the routing core:
//! - Logging
//! - Session limits, queueing and timers
//! - MQTT feature flags
//! - Environment variable overrides (VIBEMQ__* prefix)

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use crate::broker::BrokerConfig;
use crate::protocol::{QoS, SESSION_EXPIRY_NEVER};
use crate::session::{OverflowPolicy, PacketIdWidth, SessionLimits};

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = match Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") {
        Ok(re) => re,
        Err(_) => return content.to_string(),
    };
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub session: SessionConfig,
    pub mqtt: MqttConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level or filter directive (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Pending queue capacity per session (0 = unbounded)
    pub max_queued_messages: usize,
    /// What to drop when the pending queue is full
    pub overflow_policy: OverflowPolicy,
    /// Queue QoS 0 messages for detached sessions
    pub queue_qos0: bool,
    /// Outbound QoS 1/2 messages awaiting acknowledgement per session (0 = id space only)
    pub max_inflight: usize,
    /// Inbound QoS 2 messages awaiting PUBREL per session
    pub max_awaiting_rel: usize,
    pub packet_id_width: PacketIdWidth,
    /// Delay before closing a taken-over connection
    #[serde(with = "humantime_serde")]
    pub takeover_grace: Duration,
    /// Expiry (seconds) for persistent sessions that request none
    pub default_session_expiry: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let limits = SessionLimits::default();
        Self {
            max_queued_messages: limits.max_queued_messages,
            overflow_policy: limits.overflow_policy,
            queue_qos0: limits.queue_qos0,
            max_inflight: limits.max_inflight,
            max_awaiting_rel: limits.max_awaiting_rel,
            packet_id_width: limits.packet_id_width,
            takeover_grace: Duration::from_millis(100),
            default_session_expiry: SESSION_EXPIRY_NEVER,
        }
    }
}

impl SessionConfig {
    pub fn limits(&self) -> SessionLimits {
        SessionLimits {
            max_queued_messages: self.max_queued_messages,
            overflow_policy: self.overflow_policy,
            queue_qos0: self.queue_qos0,
            max_inflight: self.max_inflight,
            max_awaiting_rel: self.max_awaiting_rel,
            packet_id_width: self.packet_id_width,
        }
    }
}

/// MQTT feature configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Maximum QoS level (0, 1, or 2)
    #[serde(default = "default_max_qos")]
    pub max_qos: u8,
    #[serde(default = "default_true")]
    pub retain_available: bool,
    /// Maximum topic levels (0 = unlimited)
    pub max_topic_levels: usize,
    /// Sweep period for expired retained messages ("0s" disables)
    #[serde(with = "humantime_serde")]
    pub retained_purge_interval: Duration,
}

fn default_max_qos() -> u8 {
    2
}
fn default_true() -> bool {
    true
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            max_qos: default_max_qos(),
            retain_available: true,
            max_topic_levels: 0,
            retained_purge_interval: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Environment variables use the `VIBEMQ__` prefix with `__` as the
    /// nesting separator, e.g. `VIBEMQ__SESSION__MAX_INFLIGHT=64`. A missing
    /// file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("session.max_queued_messages", 1000)?
            .set_default("session.max_inflight", 32)?
            .set_default("session.max_awaiting_rel", 100)?
            .set_default("mqtt.max_qos", 2)?
            .set_default("mqtt.retain_available", true)?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ConfigError::Io(e)),
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("VIBEMQ")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.max_qos > 2 {
            return Err(ConfigError::Validation(
                "max_qos must be 0, 1, or 2".to_string(),
            ));
        }
        if self.session.default_session_expiry == 0 {
            return Err(ConfigError::Validation(
                "default_session_expiry must be greater than 0".to_string(),
            ));
        }
        if EnvFilter::try_new(&self.log.level).is_err() {
            return Err(ConfigError::Validation(format!(
                "invalid log level '{}'",
                self.log.level
            )));
        }
        Ok(())
    }

    /// Broker settings described by this configuration
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            max_qos: QoS::from_u8(self.mqtt.max_qos).unwrap_or(QoS::ExactlyOnce),
            retain_available: self.mqtt.retain_available,
            max_topic_levels: self.mqtt.max_topic_levels,
            session: self.session.limits(),
            takeover_grace: self.session.takeover_grace,
            default_session_expiry: self.session.default_session_expiry,
            retained_purge_interval: self.mqtt.retained_purge_interval,
            ..BrokerConfig::default()
        }
    }
}

/// Install a global `tracing` subscriber
///
/// `RUST_LOG` takes precedence over the configured level. Returns false if
/// a global subscriber was already installed.
pub fn init_logging(log: &LogConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .compact()
        .try_init()
        .is_ok()
}
