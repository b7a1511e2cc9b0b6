use std::{fs, time::Duration};

use energy_client::domain::Resolution;
use serde::Deserialize;
use time::{macros::format_description, UtcOffset};

/// Invalid or unreadable configuration. Only ever raised at startup.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("configuration error: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub uri: String,
    pub max_connections: u32,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RollupConfig {
    #[serde(default = "default_resolutions")]
    pub resolutions: Vec<Resolution>,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub deadline_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    /// `"+HH:MM"`, `"-HH:MM"` or `"UTC"`.
    #[serde(default = "default_serving_offset")]
    pub serving_utc_offset: String,
    pub deadline_ms: u64,
    pub daily_history_limit: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    pub http_bind_addr: String,
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub rollup: RollupConfig,
    pub query: QueryConfig,
    pub ingest: Option<IngestConfig>,
    pub metrics: Option<MetricsConfig>,
}

fn default_connect_attempts() -> u32 {
    5
}

fn default_connect_backoff_ms() -> u64 {
    2_000
}

fn default_resolutions() -> Vec<Resolution> {
    Resolution::ALL.to_vec()
}

fn default_serving_offset() -> String {
    "UTC".to_string()
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        use std::env;

        let path = env::var("ROLLUP_CONFIG").unwrap_or_else(|_| "rollup-config.toml".to_string());
        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let cfg: AppConfig = toml::from_str(contents)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.max_connections == 0 {
            return Err(ConfigError::Invalid("database.max_connections must be > 0".to_string()));
        }
        if self.database.connect_attempts == 0 {
            return Err(ConfigError::Invalid("database.connect_attempts must be > 0".to_string()));
        }
        if self.rollup.resolutions.is_empty() {
            return Err(ConfigError::Invalid("rollup.resolutions must not be empty".to_string()));
        }
        if self.rollup.deadline_ms == 0 || self.query.deadline_ms == 0 {
            return Err(ConfigError::Invalid("deadlines must be > 0 ms".to_string()));
        }
        if self.query.daily_history_limit == 0 {
            return Err(ConfigError::Invalid("query.daily_history_limit must be > 0".to_string()));
        }
        self.query.serving_offset()?;
        if let Some(ingest) = &self.ingest {
            if ingest.channel_capacity == 0 {
                return Err(ConfigError::Invalid("ingest.channel_capacity must be > 0".to_string()));
            }
        }
        Ok(())
    }
}

impl RollupConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

impl QueryConfig {
    pub fn serving_offset(&self) -> Result<UtcOffset, ConfigError> {
        parse_utc_offset(&self.serving_utc_offset)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

pub fn parse_utc_offset(s: &str) -> Result<UtcOffset, ConfigError> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("utc") || s == "Z" {
        return Ok(UtcOffset::UTC);
    }
    UtcOffset::parse(s, format_description!("[offset_hour sign:mandatory]:[offset_minute]"))
        .map_err(|e| ConfigError::Invalid(format!("invalid serving_utc_offset '{s}': {e}")))
}
