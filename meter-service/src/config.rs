use serde::Deserialize;
use std::fs;

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    pub http_bind_addr: String,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Local time offset used for day/week/month boundaries.
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,
    #[serde(default = "default_notify_timeout_secs")]
    pub notify_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: default_utc_offset_minutes(),
            notify_timeout_secs: default_notify_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub ingest: IngestConfig,
    pub sink: SinkConfig,
    pub api: ApiConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    pub metrics: Option<MetricsConfig>,
}

fn default_max_connections() -> u32 {
    4
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_utc_offset_minutes() -> i32 {
    8 * 60
}

fn default_notify_timeout_secs() -> u64 {
    10
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("METER_CONFIG").unwrap_or_else(|_| "meter-config.toml".to_string());
        let contents = fs::read_to_string(&path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        let cfg: AppConfig = toml::from_str(contents)?;
        Ok(cfg)
    }
}
