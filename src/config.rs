use crate::{Error, Result};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Names the envelope reserves for itself; measurement columns may not use them.
pub const RESERVED_FIELDS: [&str; 2] = ["message_id", "timestamp"];

const ENV_PREFIX: &str = "TELEMETRY_RELAY";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub postgres: PostgresConfig,
    #[serde(default)]
    pub store: StoreConfig,
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Where the telemetry rows live and how they are addressed.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_timestamp_column")]
    pub timestamp_column: String,
    #[serde(default = "default_sent_column")]
    pub sent_column: String,
    /// Integer primary key used by mark-sent instead of the timestamp.
    #[serde(default)]
    pub identity_column: Option<String>,
    /// Measurement columns copied into every envelope.
    #[serde(default)]
    pub columns: Vec<String>,
    /// IANA zone that naive `timestamp` columns are recorded in.
    #[serde(default = "default_source_timezone")]
    pub source_timezone: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    pub topic: String,
    #[serde(default = "default_acks")]
    pub acks: String,
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u32,
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
    #[serde(default = "default_partitioner")]
    pub partitioner: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    #[serde(default = "default_store_backoff_ms")]
    pub store_backoff_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load(path, None)
    }

    /// Loads `path`, then `<stem>.<profile>.<ext>` next to it if present, then
    /// `TELEMETRY_RELAY_*` environment overrides (`__` separates sections).
    pub fn load<P: AsRef<Path>>(path: P, profile: Option<&str>) -> Result<Self> {
        let path = path.as_ref();
        let mut builder =
            config::Config::builder().add_source(config::File::from(path).required(true));

        if let Some(profile) = profile {
            builder = builder
                .add_source(config::File::from(profile_path(path, profile)).required(false));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("kafka.brokers")
                    .with_list_parse_key("store.columns"),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(content, config::FileFormat::Toml))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kafka.brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(Error::Config("kafka.brokers must not be empty".to_string()));
        }
        if self.kafka.topic.trim().is_empty() {
            return Err(Error::Config("kafka.topic must not be empty".to_string()));
        }
        if self.store.table.trim().is_empty() {
            return Err(Error::Config("store.table must not be empty".to_string()));
        }
        if self.relay.batch_size == 0 {
            return Err(Error::Config("relay.batch_size must be at least 1".to_string()));
        }
        if self.relay.max_in_flight == 0 {
            return Err(Error::Config(
                "relay.max_in_flight must be at least 1".to_string(),
            ));
        }
        if self.relay.retry.max_attempts == 0 {
            return Err(Error::Config(
                "relay.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.postgres.pool_size == 0 {
            return Err(Error::Config("postgres.pool_size must be at least 1".to_string()));
        }

        self.store.source_tz()?;

        for column in &self.store.columns {
            if RESERVED_FIELDS.contains(&column.as_str()) {
                return Err(Error::Config(format!(
                    "store.columns: '{}' is reserved for the envelope",
                    column
                )));
            }
            if column == &self.store.timestamp_column || column == &self.store.sent_column {
                return Err(Error::Config(format!(
                    "store.columns: '{}' is already used as the timestamp or sent column",
                    column
                )));
            }
        }

        Ok(())
    }

    pub fn postgres_url(&self) -> String {
        format!(
            "postgres://{}@{}:{}/{}",
            self.postgres.username, self.postgres.host, self.postgres.port, self.postgres.database
        )
    }
}

impl StoreConfig {
    pub fn source_tz(&self) -> Result<Tz> {
        self.source_timezone.parse::<Tz>().map_err(|e| {
            Error::Config(format!(
                "store.source_timezone '{}': {}",
                self.source_timezone, e
            ))
        })
    }
}

impl RelayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn store_backoff(&self) -> Duration {
        Duration::from_millis(self.store_backoff_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            table: default_table(),
            timestamp_column: default_timestamp_column(),
            sent_column: default_sent_column(),
            identity_column: None,
            columns: Vec::new(),
            source_timezone: default_source_timezone(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            max_in_flight: default_max_in_flight(),
            drain_timeout_secs: default_drain_timeout_secs(),
            store_backoff_ms: default_store_backoff_ms(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

fn profile_path(path: &Path, profile: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}.{}.{}", stem, profile, ext.to_string_lossy()),
        None => format!("{}.{}", stem, profile),
    };
    path.with_file_name(name)
}

fn default_port() -> u16 {
    5432
}

fn default_pool_size() -> usize {
    16
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_table() -> String {
    "iot_data".to_string()
}

fn default_timestamp_column() -> String {
    "timestamp".to_string()
}

fn default_sent_column() -> String {
    "is_sent".to_string()
}

fn default_source_timezone() -> String {
    "UTC".to_string()
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_compression() -> String {
    "none".to_string()
}

fn default_linger_ms() -> u32 {
    5
}

fn default_message_timeout_ms() -> u64 {
    30_000
}

fn default_partitioner() -> String {
    "consistent_random".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_batch_size() -> usize {
    10
}

fn default_max_in_flight() -> usize {
    16
}

fn default_drain_timeout_secs() -> u64 {
    2
}

fn default_store_backoff_ms() -> u64 {
    5000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_multiplier() -> u32 {
    2
}
