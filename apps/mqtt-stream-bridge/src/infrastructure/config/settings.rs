//! Bridge Configuration Settings
//!
//! Configuration types for the bridge, loaded from environment variables or
//! from the host's JSON settings blob plus its decrypted secure fields.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::application::ports::QosLevel;
use crate::application::services::DEFAULT_QUEUE_CAPACITY;

/// Broker connection settings for one datasource instance.
#[derive(Clone, PartialEq, Eq)]
pub struct DatasourceSettings {
    /// Broker URL, e.g. `mqtt://localhost:1883` or `mqtts://broker:8883`.
    pub broker_url: String,
    /// MQTT client identifier.
    pub client_id: String,
    /// Optional user name.
    pub username: Option<String>,
    /// Optional password.
    pub password: Option<String>,
    /// QoS used for every topic subscription.
    pub qos: QosLevel,
}

impl std::fmt::Debug for DatasourceSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasourceSettings")
            .field("broker_url", &self.broker_url)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("qos", &self.qos)
            .finish()
    }
}

/// Settings blob as stored by the host.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawDatasourceSettings {
    broker_url: String,
    client_id: String,
    username: String,
    password: String,
    qos: u8,
}

impl DatasourceSettings {
    /// Load from the host's JSON settings and decrypted secure fields.
    ///
    /// A `password` entry in `secure` overrides any password in the JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for malformed JSON, a missing broker URL or
    /// client id, or a QoS outside 0..=2.
    pub fn from_json(json: &[u8], secure: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut raw: RawDatasourceSettings =
            serde_json::from_slice(json).map_err(|e| ConfigError::InvalidJson(e.to_string()))?;

        if let Some(password) = secure.get("password") {
            raw.password.clone_from(password);
        }

        Self::validated(
            raw.broker_url,
            raw.client_id,
            raw.username,
            raw.password,
            raw.qos.to_string(),
        )
    }

    /// Load from `MQTT_*` variables through a lookup function.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a required variable is missing or invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let broker_url = lookup("MQTT_BROKER_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("MQTT_BROKER_URL".to_string()))?;
        let client_id = lookup("MQTT_CLIENT_ID")
            .ok_or_else(|| ConfigError::MissingEnvVar("MQTT_CLIENT_ID".to_string()))?;

        Self::validated(
            broker_url,
            client_id,
            lookup("MQTT_USERNAME").unwrap_or_default(),
            lookup("MQTT_PASSWORD").unwrap_or_default(),
            lookup("MQTT_QOS").unwrap_or_else(|| "0".to_string()),
        )
    }

    fn validated(
        broker_url: String,
        client_id: String,
        username: String,
        password: String,
        qos: String,
    ) -> Result<Self, ConfigError> {
        if broker_url.trim().is_empty() {
            return Err(ConfigError::EmptyValue("broker url".to_string()));
        }
        if client_id.trim().is_empty() {
            return Err(ConfigError::EmptyValue("client id".to_string()));
        }

        let qos = qos
            .trim()
            .parse::<u8>()
            .ok()
            .and_then(|value| QosLevel::try_from(value).ok())
            .ok_or_else(|| ConfigError::InvalidValue {
                key: "qos".to_string(),
                value: qos.clone(),
                reason: "must be 0, 1 or 2".to_string(),
            })?;

        Ok(Self {
            broker_url,
            client_id,
            username: Some(username).filter(|u| !u.is_empty()),
            password: Some(password).filter(|p| !p.is_empty()),
            qos,
        })
    }
}

/// Automatic reconnection after an established connection drops.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectSettings {
    /// Reconnect automatically.
    pub enabled: bool,
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
    /// Backoff multiplier.
    pub multiplier: f64,
    /// Attempts before giving up until the next explicit connect (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 0,
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Port for the host adapter, health and metrics.
    pub http_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { http_port: 8085 }
    }
}

/// Stream session settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSettings {
    /// UID embedded in channel addresses.
    pub datasource_uid: String,
    /// Bounded queue size per session.
    pub session_queue_capacity: usize,
    /// Grace period for a clean broker disconnect.
    pub disconnect_grace: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            datasource_uid: "mqtt".to_string(),
            session_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            disconnect_grace: Duration::from_millis(100),
        }
    }
}

/// Complete bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Broker connection.
    pub datasource: DatasourceSettings,
    /// Reconnection behaviour.
    pub reconnect: ReconnectSettings,
    /// HTTP server.
    pub server: ServerSettings,
    /// Stream sessions.
    pub stream: StreamSettings,
}

impl BridgeConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if required variables are missing or invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let datasource = DatasourceSettings::from_lookup(&lookup)?;

        let reconnect_defaults = ReconnectSettings::default();
        let reconnect = ReconnectSettings {
            enabled: parse_bool(&lookup, "MQTT_AUTO_RECONNECT", reconnect_defaults.enabled),
            initial_delay: parse_millis(
                &lookup,
                "MQTT_RECONNECT_DELAY_INITIAL_MS",
                reconnect_defaults.initial_delay,
            ),
            max_delay: parse_millis(
                &lookup,
                "MQTT_RECONNECT_DELAY_MAX_MS",
                reconnect_defaults.max_delay,
            ),
            multiplier: parse_or(
                &lookup,
                "MQTT_RECONNECT_DELAY_MULTIPLIER",
                reconnect_defaults.multiplier,
            ),
            max_attempts: parse_or(
                &lookup,
                "MQTT_MAX_RECONNECT_ATTEMPTS",
                reconnect_defaults.max_attempts,
            ),
        };

        let server = ServerSettings {
            http_port: parse_or(&lookup, "BRIDGE_HTTP_PORT", ServerSettings::default().http_port),
        };

        let stream_defaults = StreamSettings::default();
        let stream = StreamSettings {
            datasource_uid: lookup("BRIDGE_DATASOURCE_UID")
                .filter(|uid| !uid.is_empty())
                .unwrap_or(stream_defaults.datasource_uid),
            session_queue_capacity: parse_or(
                &lookup,
                "BRIDGE_SESSION_QUEUE_CAPACITY",
                stream_defaults.session_queue_capacity,
            )
            .max(1),
            disconnect_grace: parse_millis(
                &lookup,
                "MQTT_DISCONNECT_GRACE_MS",
                stream_defaults.disconnect_grace,
            ),
        };

        Ok(Self {
            datasource,
            reconnect,
            server,
            stream,
        })
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Required setting has an empty value.
    #[error("{0} cannot be empty")]
    EmptyValue(String),
    /// Setting has a value outside its domain.
    #[error("invalid {key} {value:?}: {reason}")]
    InvalidValue {
        /// Setting name.
        key: String,
        /// Offending value.
        value: String,
        /// What is allowed.
        reason: String,
    },
    /// Host settings blob is not valid JSON.
    #[error("invalid settings JSON: {0}")]
    InvalidJson(String),
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_millis(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    lookup(key).map_or(default, |v| {
        matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
    })
}
