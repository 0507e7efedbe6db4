use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to open config file: {0}")]
    Open(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config value for {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default = "default_evaluation_interval", with = "duration_ms")]
    pub evaluation_interval: Duration,

    #[serde(default = "default_publish_chunk_size")]
    pub publish_chunk_size: usize,

    #[serde(default)]
    pub update_target: UpdateTarget,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_bus_host")]
    pub host: String,

    #[serde(default = "default_bus_port")]
    pub port: u16,

    #[serde(default = "default_group_id")]
    pub group_id: String,

    #[serde(default = "default_true")]
    pub auto_commit: bool,

    #[serde(default = "default_fetch_max_wait", with = "duration_ms")]
    pub fetch_max_wait: Duration,

    #[serde(default = "default_fetch_max_bytes")]
    pub fetch_max_bytes: usize,

    #[serde(default)]
    pub topics: TopicNames,

    #[serde(default)]
    pub partition: i32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: default_bus_host(),
            port: default_bus_port(),
            group_id: default_group_id(),
            auto_commit: default_true(),
            fetch_max_wait: default_fetch_max_wait(),
            fetch_max_bytes: default_fetch_max_bytes(),
            topics: TopicNames::default(),
            partition: 0,
        }
    }
}

impl BusConfig {
    pub fn bootstrap_servers(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicNames {
    #[serde(default = "default_things_topic")]
    pub things: String,
    #[serde(default = "default_properties_topic")]
    pub properties: String,
    #[serde(default = "default_values_topic")]
    pub values: String,
}

impl Default for TopicNames {
    fn default() -> Self {
        Self {
            things: default_things_topic(),
            properties: default_properties_topic(),
            values: default_values_topic(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_url")]
    pub base_url: String,

    // bearer token, redacted in Debug output
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "default_request_timeout", with = "duration_ms")]
    pub request_timeout: Duration,
}

impl std::fmt::Debug for RegistryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryConfig")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: default_registry_url(),
            token: None,
            request_timeout: default_request_timeout(),
        }
    }
}

/// Where evaluator updates are delivered.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::EnumString,
    strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum UpdateTarget {
    /// Publish `[[timestamp, value]]` records on the values topic.
    #[default]
    Bus,
    /// Call the registry's update-values endpoint.
    Registry,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            registry: RegistryConfig::default(),
            evaluation_interval: default_evaluation_interval(),
            publish_chunk_size: default_publish_chunk_size(),
            update_target: UpdateTarget::default(),
            log_level: default_log_level(),
        }
    }
}

impl ProcessorConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        from_file(path)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.evaluation_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "evaluation_interval",
                message: "must be greater than 0".to_string(),
            });
        }
        if self.publish_chunk_size == 0 {
            return Err(ConfigError::Invalid {
                field: "publish_chunk_size",
                message: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> ConfigResult<T> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    Ok(serde_json::from_reader(reader)?)
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> ConfigResult<T> {
    Ok(serde_json::from_str(s)?)
}

fn default_evaluation_interval() -> Duration {
    Duration::from_millis(60_000)
}
fn default_publish_chunk_size() -> usize {
    crate::publisher::DEFAULT_CHUNK_SIZE
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_bus_host() -> String {
    "localhost".to_string()
}
fn default_bus_port() -> u16 {
    9092
}
fn default_group_id() -> String {
    "dcd-processor".to_string()
}
fn default_true() -> bool {
    true
}
fn default_fetch_max_wait() -> Duration {
    Duration::from_millis(1000)
}
fn default_fetch_max_bytes() -> usize {
    1024 * 1024
}
fn default_things_topic() -> String {
    "things".to_string()
}
fn default_properties_topic() -> String {
    "properties".to_string()
}
fn default_values_topic() -> String {
    "values".to_string()
}
fn default_registry_url() -> String {
    "http://localhost:8080/api".to_string()
}
fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
