//! Typed configuration, loaded once from the environment at startup.

use std::fmt;
use std::time::Duration;

/// Wire encoding used for the sink push.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushMode {
    /// Protobuf `PushRequest`, snappy-compressed.
    Protobuf,
    /// Gzip-compressed JSON.
    Gzip,
    /// Uncompressed JSON.
    Json,
}

impl PushMode {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw {
            "pb" => Ok(PushMode::Protobuf),
            "gzip" => Ok(PushMode::Gzip),
            "json" => Ok(PushMode::Json),
            other => Err(ConfigError::invalid("LOKI_PUSH_MODE", other)),
        }
    }
}

/// How checkpoints are persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateMode {
    Database,
    None,
}

impl StateMode {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw {
            "db" => Ok(StateMode::Database),
            "none" => Ok(StateMode::None),
            other => Err(ConfigError::invalid("STATE_MODE", other)),
        }
    }
}

/// A required or malformed environment variable. Fatal; surfaced before any
/// network I/O begins.
#[derive(Debug)]
pub struct ConfigError {
    pub variable: &'static str,
    pub detail: String,
}

impl ConfigError {
    fn missing(variable: &'static str) -> Self {
        Self {
            variable,
            detail: "required but not set".to_string(),
        }
    }

    fn invalid(variable: &'static str, value: &str) -> Self {
        Self {
            variable,
            detail: format!("invalid value {value:?}"),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.variable, self.detail)
    }
}

impl std::error::Error for ConfigError {}

/// Elasticsearch-style source index configuration.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    pub hosts: Vec<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub index: String,
    pub batch_size: u64,
    pub timeout: Duration,
    pub max_date: Option<String>,
    pub timestamp_field: String,
}

/// Loki-style sink configuration.
#[derive(Clone, Debug)]
pub struct SinkConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tenant_id: Option<String>,
    pub batch_bytes: usize,
    pub pool_load_factor: usize,
    pub push_mode: PushMode,
    pub wait_timeout: Duration,
}

/// Checkpoint store configuration.
#[derive(Clone, Debug)]
pub struct CheckpointConfig {
    pub mode: StateMode,
    pub db_url: Option<String>,
    pub start_over: bool,
}

/// Everything read from the environment, parsed once.
#[derive(Clone, Debug)]
pub struct Config {
    pub dry_run: bool,
    pub source: SourceConfig,
    pub sink: SinkConfig,
    pub checkpoint: CheckpointConfig,
    pub execute_timeout: Option<Duration>,
}

fn env_var(name: &'static str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env_var(name).ok_or_else(|| ConfigError::missing(name))
}

fn parse_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env_var(name) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ConfigError::invalid(name, &raw)),
    }
}

fn parse_usize(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    match env_var(name) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ConfigError::invalid(name, &raw)),
    }
}

fn parse_seconds(name: &'static str, default_secs: u64) -> Result<Duration, ConfigError> {
    match env_var(name) {
        None => Ok(Duration::from_secs(default_secs)),
        Some(raw) => raw
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::invalid(name, &raw)),
    }
}

fn is_truthy(raw: &str) -> bool {
    raw == "1"
}

impl Config {
    /// Load, parse, and validate every environment variable this crate
    /// consumes. Fails fast with the offending variable name rather than
    /// panicking deep inside a component.
    pub fn from_env() -> Result<Self, ConfigError> {
        let dry_run = env_var("DRY_RUN").as_deref().is_some_and(is_truthy);

        let hosts = required("ELASTIC_HOSTS")?
            .split(',')
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .collect();

        let source = SourceConfig {
            hosts,
            user: env_var("ELASTIC_USER"),
            password: env_var("ELASTIC_PASSWORD"),
            index: required("ELASTIC_INDEX")?,
            batch_size: parse_u64("ELASTIC_BATCH_SIZE", 3000)?,
            timeout: parse_seconds("ELASTIC_TIMEOUT", 120)?,
            max_date: env_var("ELASTIC_MAX_DATE"),
            timestamp_field: env_var("ELASTIC_TIMESTAMP_FIELD")
                .unwrap_or_else(|| "@timestamp".to_string()),
        };

        let push_mode = match env_var("LOKI_PUSH_MODE") {
            Some(raw) => PushMode::parse(&raw)?,
            None => PushMode::Protobuf,
        };

        let sink = SinkConfig {
            url: required("LOKI_URL")?,
            username: env_var("LOKI_USERNAME"),
            password: env_var("LOKI_PASSWORD"),
            tenant_id: env_var("LOKI_TENANT_ID"),
            batch_bytes: parse_usize("LOKI_BATCH_SIZE", 1024 * 1024)?,
            pool_load_factor: parse_usize("LOKI_POOL_LOAD_FACTOR", 10)?,
            push_mode,
            wait_timeout: parse_seconds("LOKI_WAIT_TIMEOUT", 0)?,
        };

        let mode = match env_var("STATE_MODE") {
            Some(raw) => StateMode::parse(&raw)?,
            None => StateMode::None,
        };

        let checkpoint = CheckpointConfig {
            mode,
            db_url: env_var("STATE_DB_URL"),
            start_over: env_var("STATE_START_OVER").as_deref().is_some_and(is_truthy),
        };

        let execute_timeout = match env_var("EXECUTE_TIMEOUT_SECS") {
            None => None,
            Some(raw) => Some(
                raw.parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|_| ConfigError::invalid("EXECUTE_TIMEOUT_SECS", &raw))?,
            ),
        };

        if checkpoint.mode == StateMode::Database && checkpoint.db_url.is_none() {
            return Err(ConfigError::missing("STATE_DB_URL"));
        }

        Ok(Config {
            dry_run,
            source,
            sink,
            checkpoint,
            execute_timeout,
        })
    }
}
