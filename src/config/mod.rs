//! Configuration Module
//!
//! TOML-based configuration for the message core with support for:
//! - Node identity (shared-persistence id prefix)
//! - Per-session inflight and queue limits
//! - MQTT feature flags
//! - Environment variable overrides (FLUXMQ__* prefix)

use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
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

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Node identity
    pub node: NodeConfig,
    /// Inflight and queue limits
    pub limits: LimitsConfig,
    /// MQTT feature configuration
    pub mqtt: MqttConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
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

/// Node identity configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct NodeConfig {
    /// 10-bit node id prefixed onto generated message ids so brokers
    /// sharing a persistence database never collide
    #[serde(default)]
    pub id: u16,
}

/// Per-session message limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Default inflight window for QoS 1/2 messages per direction
    /// (0 = unbounded)
    #[serde(default = "default_max_inflight_messages")]
    pub max_inflight_messages: u16,
    /// Maximum bytes of QoS 1/2 payload inflight per direction
    /// (0 = unbounded)
    #[serde(default)]
    pub max_inflight_bytes: u64,
    /// Maximum messages queued beyond the inflight window (0 = unbounded)
    #[serde(default = "default_max_queued_messages")]
    pub max_queued_messages: usize,
    /// Maximum bytes of queued payload (0 = unbounded)
    #[serde(default)]
    pub max_queued_bytes: u64,
}

fn default_max_inflight_messages() -> u16 {
    20
}
fn default_max_queued_messages() -> usize {
    1000
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_inflight_messages: default_max_inflight_messages(),
            max_inflight_bytes: 0,
            max_queued_messages: default_max_queued_messages(),
            max_queued_bytes: 0,
        }
    }
}

/// MQTT feature configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// When false, a message is delivered at most once per client even if
    /// several of its subscriptions overlap (MQTT v3.x only)
    #[serde(default)]
    pub allow_duplicate_messages: bool,
    /// Queue QoS 0 messages for disconnected persistent sessions
    #[serde(default)]
    pub queue_qos0_messages: bool,
    /// Honor the retain flag on published messages
    #[serde(default = "default_retain_available")]
    pub retain_available: bool,
    /// Maximum QoS granted to any session (0, 1 or 2)
    #[serde(default = "default_max_qos")]
    pub max_qos: u8,
}

fn default_retain_available() -> bool {
    true
}
fn default_max_qos() -> u8 {
    2
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            allow_duplicate_messages: false,
            queue_qos0_messages: false,
            retain_available: default_retain_available(),
            max_qos: default_max_qos(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `FLUXMQ__` prefix with double underscores for nesting:
    ///    - `FLUXMQ__NODE__ID=3` overrides `node.id`
    ///    - `FLUXMQ__LIMITS__MAX_QUEUED_MESSAGES=500` overrides `limits.max_queued_messages`
    ///    - `FLUXMQ__MQTT__RETAIN_AVAILABLE=false` overrides `mqtt.retain_available`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = Self::default_builder()?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        Self::finish(builder)
    }

    /// Parse configuration from a TOML string with environment overrides
    pub fn from_str(raw: &str) -> Result<Self, ConfigError> {
        let substituted = substitute_env_vars(raw);
        let builder = Self::default_builder()?
            .add_source(File::from_str(&substituted, FileFormat::Toml));
        Self::finish(builder)
    }

    fn default_builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError>
    {
        Ok(config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("node.id", 0)?
            .set_default("limits.max_inflight_messages", 20)?
            .set_default("limits.max_inflight_bytes", 0)?
            .set_default("limits.max_queued_messages", 1000)?
            .set_default("limits.max_queued_bytes", 0)?
            .set_default("mqtt.allow_duplicate_messages", false)?
            .set_default("mqtt.queue_qos0_messages", false)?
            .set_default("mqtt.retain_available", true)?
            .set_default("mqtt.max_qos", 2)?)
    }

    /// Apply environment overrides, deserialize and validate
    fn finish(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, ConfigError> {
        // Double underscore separates nested keys, single underscore is
        // preserved in field names
        let settings = builder
            .add_source(
                Environment::with_prefix("FLUXMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: Config = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.id >= 1024 {
            return Err(ConfigError::Validation(format!(
                "node.id must fit in 10 bits (0-1023), got {}",
                self.node.id
            )));
        }
        if self.mqtt.max_qos > 2 {
            return Err(ConfigError::Validation(format!(
                "mqtt.max_qos must be 0, 1 or 2, got {}",
                self.mqtt.max_qos
            )));
        }
        match self.log.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => Ok(()),
            other => Err(ConfigError::Validation(format!(
                "log.level must be one of error/warn/info/debug/trace, got {}",
                other
            ))),
        }
    }
}
