use std::time::Duration;

use serde::Deserialize;

use crate::error::{CanalError, Result};

/// Which change-stream transport to consume from.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Kafka,
    Redis,
}

/// Service configuration, read from `CANAL_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct CanalConfig {
    #[serde(default = "default_transport")]
    pub transport: TransportKind,
    /// Kafka topics or Redis stream names, comma separated.
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default = "default_group_id")]
    pub group_id: String,
    #[serde(default = "default_consumer_name")]
    pub consumer_name: String,

    #[serde(default = "default_kafka_brokers")]
    pub kafka_brokers: String,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    pub database_url: String,
    #[serde(default = "default_database_max_connections")]
    pub database_max_connections: u32,

    /// Search indexer endpoint. Search notifications are dropped when unset.
    #[serde(default)]
    pub search_url: Option<String>,
    #[serde(default)]
    pub search_key: Option<String>,
    #[serde(default = "default_search_timeout_ms")]
    pub search_timeout_ms: u64,

    /// Enables avatar cache cleanup in object storage.
    #[serde(default)]
    pub s3_enabled: bool,
    #[serde(default = "default_image_resize_bucket")]
    pub s3_image_resize_bucket: String,

    #[serde(default = "default_http_host")]
    pub http_host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    #[serde(default = "default_read_count")]
    pub read_count: usize,
    /// Negative values make Redis reads non-blocking.
    #[serde(default = "default_read_block_ms")]
    pub read_block_ms: i64,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

fn default_transport() -> TransportKind {
    TransportKind::Kafka
}

fn default_group_id() -> String {
    "canal".to_string()
}

fn default_consumer_name() -> String {
    "canal".to_string()
}

fn default_kafka_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_database_max_connections() -> u32 {
    5
}

fn default_search_timeout_ms() -> u64 {
    5000
}

fn default_image_resize_bucket() -> String {
    "img-resize".to_string()
}

fn default_http_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    9090
}

fn default_read_count() -> usize {
    10
}

fn default_read_block_ms() -> i64 {
    2000
}

fn default_retry_interval_ms() -> u64 {
    1000
}

impl CanalConfig {
    pub fn from_env() -> Result<Self> {
        let config: Self = envy::prefixed("CANAL_")
            .from_env()
            .map_err(|e| CanalError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.topics.iter().all(|t| t.trim().is_empty()) {
            return Err(CanalError::Config(
                "missing change stream topics (CANAL_TOPICS)".to_string(),
            ));
        }
        if self.group_id.trim().is_empty() {
            return Err(CanalError::Config("CANAL_GROUP_ID is empty".to_string()));
        }
        Ok(())
    }

    /// Topic names with blanks removed.
    pub fn topics(&self) -> Vec<String> {
        self.topics
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn read_block(&self) -> Option<Duration> {
        u64::try_from(self.read_block_ms)
            .ok()
            .map(Duration::from_millis)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_millis(self.search_timeout_ms)
    }
}
