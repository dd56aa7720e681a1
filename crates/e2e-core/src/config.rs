use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Highest accepted target rate, requests per second.
pub const MAX_RATE: f64 = 100_000.0;
/// Longest accepted fire or warm-up phase, in seconds.
pub const MAX_PHASE_S: f64 = 86_400.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub run: RunConfig,
    pub target: TargetConfig,
    #[serde(default)]
    pub payload: PayloadConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Check everything that must hold before any phase starts.
    ///
    /// `require_dsn` is set when the postgres store is in use.
    pub fn validate(&self, require_dsn: bool) -> Result<(), ConfigError> {
        check_positive("run.rate", self.run.rate)?;
        check_at_most("run.rate", self.run.rate, MAX_RATE)?;
        check_positive("run.duration_s", self.run.duration_s)?;
        check_at_most("run.duration_s", self.run.duration_s, MAX_PHASE_S)?;
        if !self.run.warmup_s.is_finite() || self.run.warmup_s < 0.0 {
            return Err(ConfigError::Negative {
                field: "run.warmup_s",
                value: self.run.warmup_s,
            });
        }
        check_at_most("run.warmup_s", self.run.warmup_s, MAX_PHASE_S)?;
        for rate in &self.run.sweep_rates {
            check_positive("run.sweep_rates", *rate)?;
            check_at_most("run.sweep_rates", *rate, MAX_RATE)?;
        }

        if self.target.urls.is_empty() {
            return Err(ConfigError::Missing("target.urls"));
        }
        for raw in &self.target.urls {
            let parsed = url::Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
                url: raw.clone(),
                reason: e.to_string(),
            })?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err(ConfigError::InvalidUrl {
                    url: raw.clone(),
                    reason: format!("unsupported scheme {}", parsed.scheme()),
                });
            }
        }
        if self.target.max_in_flight == 0 {
            return Err(ConfigError::Zero("target.max_in_flight"));
        }
        if self.target.timeout_ms == 0 {
            return Err(ConfigError::Zero("target.timeout_ms"));
        }
        if self.target.ok_status_min > self.target.ok_status_max {
            return Err(ConfigError::StatusRange {
                min: self.target.ok_status_min,
                max: self.target.ok_status_max,
            });
        }

        if !self.payload.template.is_object() {
            return Err(ConfigError::TemplateNotObject);
        }
        if self.payload.correlation_field.is_empty() {
            return Err(ConfigError::Missing("payload.correlation_field"));
        }
        if self.payload.response_id_fields.is_empty() {
            return Err(ConfigError::Missing("payload.response_id_fields"));
        }

        if require_dsn && self.store.dsn.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::Missing("store.dsn"));
        }
        check_identifier("store.table", &self.store.table)?;
        check_identifier("store.id_column", &self.store.id_column)?;
        if let Some(id_type) = self.store.id_type() {
            check_identifier("store.id_type", id_type)?;
        }
        if let Some(ts) = self.store.ts_column() {
            check_identifier("store.ts_column", ts)?;
        }
        if self.store.db_timeout_ms == 0 {
            return Err(ConfigError::Zero("store.db_timeout_ms"));
        }
        if self.store.batch_size == 0 {
            return Err(ConfigError::Zero("store.batch_size"));
        }
        if self.store.max_connections == 0 {
            return Err(ConfigError::Zero("store.max_connections"));
        }
        Ok(())
    }

    /// Rates to run, in order. A single-rate run yields just `run.rate`.
    pub fn rates(&self) -> Vec<f64> {
        if self.run.sweep_rates.is_empty() {
            vec![self.run.rate]
        } else {
            self.run.sweep_rates.clone()
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be a positive finite number (got {value})")]
    NotPositive {
        field: &'static str,
        value: f64,
    },
    #[error("{field} must be at most {max} (got {value})")]
    TooLarge {
        field: &'static str,
        value: f64,
        max: f64,
    },
    #[error("{field} must not be negative (got {value})")]
    Negative {
        field: &'static str,
        value: f64,
    },
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("{0} must be non-zero")]
    Zero(&'static str),
    #[error("invalid target url {url}: {reason}")]
    InvalidUrl {
        url: String,
        reason: String,
    },
    #[error("ok status range is inverted ({min} > {max})")]
    StatusRange { min: u16, max: u16 },
    #[error("payload.template must be a JSON object")]
    TemplateNotObject,
    #[error("{field} is not a plain SQL identifier: {value:?}")]
    BadIdentifier {
        field: &'static str,
        value: String,
    },
}

fn check_positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NotPositive { field, value })
    }
}

fn check_at_most(field: &'static str, value: f64, max: f64) -> Result<(), ConfigError> {
    if value <= max {
        Ok(())
    } else {
        Err(ConfigError::TooLarge { field, value, max })
    }
}

fn check_identifier(field: &'static str, value: &str) -> Result<(), ConfigError> {
    let ok = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if ok {
        Ok(())
    } else {
        Err(ConfigError::BadIdentifier {
            field,
            value: value.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pacing {
    /// Tick `n` fires at `T0 + n/R`.
    #[default]
    Smooth,
    /// Each second's ticks fire together at the start of that second.
    PerSecond,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Target requests per second
    pub rate: f64,
    /// Fire phase length in seconds
    pub duration_s: f64,
    /// Uncounted warm-up before the fire phase, in seconds
    #[serde(default)]
    pub warmup_s: f64,
    #[serde(default)]
    pub pacing: Pacing,
    /// Non-empty turns the run into a rate sweep
    #[serde(default)]
    pub sweep_rates: Vec<f64>,
    /// How long in-flight requests may finish after an abort
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,
}

impl RunConfig {
    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Endpoints to POST to (round-robin)
    pub urls: Vec<String>,
    /// Request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Maximum concurrent pending requests
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: u32,
    #[serde(default = "default_ok_min")]
    pub ok_status_min: u16,
    #[serde(default = "default_ok_max")]
    pub ok_status_max: u16,
    /// Header that repeats the correlation token, if any
    #[serde(default)]
    pub idempotency_header: Option<String>,
}

impl TargetConfig {
    pub fn is_ok_status(&self, status: u16) -> bool {
        (self.ok_status_min..=self.ok_status_max).contains(&status)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadConfig {
    #[serde(default = "default_template")]
    pub template: serde_json::Value,
    /// Body field that receives the client-generated correlation token
    #[serde(default = "default_correlation_field")]
    pub correlation_field: String,
    /// Response body fields searched for a store-side id, in priority order
    #[serde(default = "default_response_id_fields")]
    pub response_id_fields: Vec<String>,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            template: default_template(),
            correlation_field: default_correlation_field(),
            response_id_fields: default_response_id_fields(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Postgres connection string
    #[serde(default)]
    pub dsn: Option<String>,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    /// Postgres type of `id_column` when it is not text (e.g. `uuid`, `bigint`).
    /// The id batch is cast to this type so the column's index stays usable.
    #[serde(default)]
    pub id_type: Option<String>,
    #[serde(default = "default_ts_column")]
    pub ts_column: Option<String>,
    #[serde(default = "default_db_timeout_ms")]
    pub db_timeout_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl StoreConfig {
    pub fn db_timeout(&self) -> Duration {
        Duration::from_millis(self.db_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Cast target for the id batch, if any. An empty string means text.
    pub fn id_type(&self) -> Option<&str> {
        self.id_type.as_deref().filter(|t| !t.is_empty())
    }

    /// Timestamp column to read back, if any. An empty string disables it.
    pub fn ts_column(&self) -> Option<&str> {
        self.ts_column.as_deref().filter(|c| !c.is_empty())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dsn: None,
            table: default_table(),
            id_column: default_id_column(),
            id_type: None,
            ts_column: default_ts_column(),
            db_timeout_ms: default_db_timeout_ms(),
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: String,
    #[serde(default = "default_output_prefix")]
    pub prefix: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            prefix: default_output_prefix(),
        }
    }
}

fn default_drain_grace_ms() -> u64 {
    5_000
}
fn default_timeout_ms() -> u64 {
    5_000
}
fn default_max_in_flight() -> u32 {
    400
}
fn default_ok_min() -> u16 {
    200
}
fn default_ok_max() -> u16 {
    299
}
fn default_correlation_field() -> String {
    "clientTxId".to_string()
}
fn default_response_id_fields() -> Vec<String> {
    vec!["txId".into(), "id".into(), "phastOrderId".into()]
}
fn default_table() -> String {
    "payment_entity".to_string()
}
fn default_id_column() -> String {
    "tx_id".to_string()
}
fn default_ts_column() -> Option<String> {
    Some("created_at".to_string())
}
fn default_db_timeout_ms() -> u64 {
    60_000
}
fn default_batch_size() -> usize {
    500
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_max_connections() -> u32 {
    10
}
fn default_output_dir() -> String {
    "results".to_string()
}
fn default_output_prefix() -> String {
    "e2e".to_string()
}

fn default_template() -> serde_json::Value {
    serde_json::json!({
        "merchantId": "MERCH-001",
        "customerId": "CUST-123456",
        "terminalId": "TERM-0001",
        "amount": 1050,
        "currency": "BRL",
        "method": "CREDIT",
        "entryMode": "CHIP",
        "cardHash": "3f6d9a0c1e2b4d5f6a7b8c9d0e1f2345"
    })
}
