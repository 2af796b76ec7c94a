use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::broker::mqtt::MqttEndpoint;
use crate::broker::{DEFAULT_PREFETCH, DEFAULT_QUEUE, LinkSettings};
use crate::client::{ClientSettings, ReconnectPolicy};
use crate::credentials::CredentialSigner;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required setting: {0}")]
    Missing(&'static str),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub offline: OfflineConfig,
    pub reconnect: ReconnectConfig,
    pub storage: StorageConfig,
    pub server: ServerConfig,
    pub publisher: PublisherConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&raw)?)
    }

    /// Overrides settings from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let set = |target: &mut String, key: &str| {
            if let Some(value) = lookup(key).filter(|v| !v.is_empty()) {
                *target = value;
            }
        };

        set(&mut self.broker.client_id, "CLIENT_ID");
        set(&mut self.broker.access_key, "ALIYUN_ACCESS_KEY_ID");
        set(&mut self.broker.access_secret, "ALIYUN_ACCESS_KEY_SECRET");
        set(&mut self.broker.consumer_group_id, "CONSUMER_GROUP_ID");
        set(&mut self.broker.instance_id, "IOT_INSTANCE_ID");
        set(&mut self.broker.host, "IOT_AMQP_HOST");
        set(&mut self.publisher.host, "IOT_MQTT_HOST");
        set(&mut self.publisher.product_key, "IOT_PRODUCT_KEY");
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            signer: self.broker.signer(),
            link: self.broker.link(),
            reconnect: self.reconnect.policy(),
            offline_timeout: Duration::from_secs(self.offline.timeout_secs),
            check_interval: Duration::from_secs(self.offline.check_interval_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub client_id: String,
    pub access_key: String,
    pub access_secret: String,
    pub consumer_group_id: String,
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    pub queue: String,
    pub prefetch: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            access_key: String::new(),
            access_secret: String::new(),
            consumer_group_id: String::new(),
            instance_id: String::new(),
            host: String::new(),
            port: 8883,
            use_tls: true,
            keep_alive_secs: 60,
            connect_timeout_secs: 10,
            queue: DEFAULT_QUEUE.to_string(),
            prefetch: DEFAULT_PREFETCH,
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            (&self.client_id, "broker.client_id"),
            (&self.access_key, "broker.access_key"),
            (&self.access_secret, "broker.access_secret"),
            (&self.consumer_group_id, "broker.consumer_group_id"),
            (&self.host, "broker.host"),
        ];
        match required.iter().find(|(value, _)| value.is_empty()) {
            Some((_, name)) => Err(ConfigError::Missing(*name)),
            None => Ok(()),
        }
    }

    pub fn signer(&self) -> CredentialSigner {
        CredentialSigner {
            client_id: self.client_id.clone(),
            access_key: self.access_key.clone(),
            access_secret: self.access_secret.clone(),
            consumer_group_id: self.consumer_group_id.clone(),
            instance_id: self.instance_id.clone(),
        }
    }

    pub fn link(&self) -> LinkSettings {
        LinkSettings {
            queue: self.queue.clone(),
            prefetch: self.prefetch.max(1),
        }
    }

    pub fn endpoint(&self) -> MqttEndpoint {
        MqttEndpoint {
            host: self.host.clone(),
            port: self.port,
            use_tls: self.use_tls,
            keep_alive: Duration::from_secs(self.keep_alive_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    pub timeout_secs: u64,
    pub check_interval_secs: u64,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 5 * 60,
            check_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        let policy = ReconnectPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        let initial_backoff = Duration::from_millis(self.initial_backoff_ms);
        ReconnectPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_backoff,
            max_backoff: Duration::from_millis(self.max_backoff_ms).max(initial_backoff),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    #[default]
    Memory,
    Sqlite {
        path: PathBuf,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

/// Device-side MQTT endpoint used for downlink commands.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub product_key: String,
    pub connect_timeout_secs: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 8883,
            use_tls: true,
            product_key: String::new(),
            connect_timeout_secs: 10,
        }
    }
}

impl PublisherConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::Missing("publisher.host"));
        }
        if self.product_key.is_empty() {
            return Err(ConfigError::Missing("publisher.product_key"));
        }
        Ok(())
    }

    pub fn endpoint(&self) -> MqttEndpoint {
        MqttEndpoint {
            host: self.host.clone(),
            port: self.port,
            use_tls: self.use_tls,
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }
}
