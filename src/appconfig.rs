use crate::error::{AppError, AppResult};
use serde::Deserialize;
use std::{env, fs};

/// Configuration for one Table Reader worker instance (spec §6).
///
/// One instance of this config exists per active backfill; `backfill_id` and
/// `table_oid` identify which one.
#[derive(Debug, Clone, Deserialize)]
pub struct TableReaderConfig {
    pub backfill_id: String,
    pub table_oid: String,
    pub consumer_id: String,

    #[serde(default = "default_max_pending_messages")]
    pub max_pending_messages: u64,

    #[serde(default = "default_initial_page_size")]
    pub initial_page_size: usize,

    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,

    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,

    #[serde(default = "default_check_state_timeout_ms")]
    pub check_state_timeout_ms: u64,

    #[serde(default = "default_check_sms_timeout_ms")]
    pub check_sms_timeout_ms: u64,

    #[serde(default = "default_max_batches_in_memory")]
    pub max_batches_in_memory: usize,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_max_backoff_time_ms")]
    pub max_backoff_time_ms: u64,

    pub database: DatabaseConfig,
    pub sms: SmsConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Name of the environment variable holding the source DB's DSN.
    pub source_dsn_env: String,
    /// Name of the environment variable holding the backfill registry DB's
    /// DSN (often the same database as the source, sometimes a dedicated
    /// metadata store).
    pub registry_dsn_env: String,
    pub pool_min: u32,
    pub pool_max: u32,
    pub connect_timeout_ms: u64,
    pub idle_timeout_sec: u64,
    pub slot_name: String,

    /// Keyset sort column(s), leading-key first.
    #[serde(default = "default_sort_columns")]
    pub sort_columns: Vec<String>,
    /// Primary-key column(s) returned by the Stage-1 PK scan.
    #[serde(default = "default_pk_columns")]
    pub pk_columns: Vec<String>,
}

fn default_sort_columns() -> Vec<String> {
    vec!["id".to_string()]
}
fn default_pk_columns() -> Vec<String> {
    vec!["id".to_string()]
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmsConfig {
    pub consumer_id: String,
    pub endpoint_env: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    #[serde(default = "default_metrics_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
}

fn default_max_pending_messages() -> u64 {
    1_000_000
}
fn default_initial_page_size() -> usize {
    1_000
}
fn default_max_timeout_ms() -> u64 {
    5_000
}
fn default_max_page_size() -> usize {
    40_000
}
fn default_check_state_timeout_ms() -> u64 {
    30_000
}
fn default_check_sms_timeout_ms() -> u64 {
    5_000
}
fn default_max_batches_in_memory() -> usize {
    3
}
fn default_max_backoff_ms() -> u64 {
    1_000
}
fn default_max_backoff_time_ms() -> u64 {
    60_000
}
fn default_metrics_bind_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_metrics_port() -> u16 {
    9464
}
fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn validate_config(cfg: &TableReaderConfig) -> AppResult<()> {
    if cfg.backfill_id.trim().is_empty() {
        return Err(AppError::MissingConfig("backfill_id"));
    }
    if cfg.table_oid.trim().is_empty() {
        return Err(AppError::MissingConfig("table_oid"));
    }
    if cfg.consumer_id.trim().is_empty() {
        return Err(AppError::MissingConfig("consumer_id"));
    }

    if cfg.initial_page_size == 0 {
        return Err(AppError::InvalidConfig(
            "initial_page_size must be > 0".into(),
        ));
    }
    if cfg.max_page_size == 0 || cfg.max_page_size < cfg.initial_page_size {
        return Err(AppError::InvalidConfig(
            "max_page_size must be >= initial_page_size".into(),
        ));
    }
    if cfg.max_page_size > 40_000 {
        return Err(AppError::InvalidConfig(
            "max_page_size must be <= 40000 rows".into(),
        ));
    }
    if cfg.max_timeout_ms == 0 {
        return Err(AppError::InvalidConfig("max_timeout_ms must be > 0".into()));
    }
    if cfg.max_batches_in_memory == 0 {
        return Err(AppError::InvalidConfig(
            "max_batches_in_memory must be > 0".into(),
        ));
    }
    if cfg.max_backoff_ms == 0 || cfg.max_backoff_time_ms < cfg.max_backoff_ms {
        return Err(AppError::InvalidConfig(
            "max_backoff_time_ms must be >= max_backoff_ms > 0".into(),
        ));
    }

    let db = &cfg.database;
    if db.source_dsn_env.trim().is_empty() || db.registry_dsn_env.trim().is_empty() {
        return Err(AppError::InvalidConfig(
            "database.source_dsn_env and database.registry_dsn_env must not be empty".into(),
        ));
    }
    if db.pool_min > db.pool_max {
        return Err(AppError::InvalidConfig(
            "database.pool_min must be <= database.pool_max".into(),
        ));
    }
    if db.pool_max == 0 {
        return Err(AppError::InvalidConfig(
            "database.pool_max must be >= 1".into(),
        ));
    }
    if db.slot_name.trim().is_empty() {
        return Err(AppError::InvalidConfig(
            "database.slot_name must not be empty".into(),
        ));
    }
    for (prefix, dsn_env) in [
        ("database.source_dsn_env", &db.source_dsn_env),
        ("database.registry_dsn_env", &db.registry_dsn_env),
    ] {
        let dsn = env::var(dsn_env).map_err(|_| {
            AppError::InvalidConfig(format!(
                "{prefix}: environment variable '{dsn_env}' is not set"
            ))
        })?;
        if !dsn.starts_with("postgres://") && !dsn.starts_with("postgresql://") {
            return Err(AppError::InvalidConfig(format!(
                "{prefix}: DSN from env var '{dsn_env}' must start with postgres:// or postgresql://"
            )));
        }
    }

    if cfg.sms.consumer_id.trim().is_empty() {
        return Err(AppError::InvalidConfig(
            "sms.consumer_id must not be empty".into(),
        ));
    }
    if env::var(&cfg.sms.endpoint_env).is_err() {
        return Err(AppError::InvalidConfig(format!(
            "sms.endpoint_env: environment variable '{}' is not set",
            cfg.sms.endpoint_env
        )));
    }

    Ok(())
}

const TABLE_READER_CONFIG_PATH: &str = "config/table_reader.toml";

impl TableReaderConfig {
    /// Load from the path in `TABLE_READER_CONFIG` if set, else the default
    /// location, validating eagerly so misconfiguration fails at startup
    /// rather than mid-backfill.
    pub fn load() -> AppResult<Self> {
        let path = env::var("TABLE_READER_CONFIG")
            .unwrap_or_else(|_| TABLE_READER_CONFIG_PATH.to_string());
        let raw = fs::read_to_string(&path)?;
        let cfg: Self = toml::from_str(&raw)?;
        validate_config(&cfg)?;
        Ok(cfg)
    }

    pub fn from_toml_str(raw: &str) -> AppResult<Self> {
        let cfg: Self = toml::from_str(raw)?;
        validate_config(&cfg)?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        backfill_id = "bf_1"
        table_oid = "16420"
        consumer_id = "consumer_1"

        [database]
        source_dsn_env = "TEST_SOURCE_DSN"
        registry_dsn_env = "TEST_REGISTRY_DSN"
        pool_min = 1
        pool_max = 4
        connect_timeout_ms = 1000
        idle_timeout_sec = 60
        slot_name = "slot_1"

        [sms]
        consumer_id = "consumer_1"
        endpoint_env = "TEST_SMS_ENDPOINT"

        [logging]
        level = "info"

        [metrics]
        enabled = true
    "#;

    fn with_env<F: FnOnce()>(f: F) {
        unsafe {
            std::env::set_var("TEST_SOURCE_DSN", "postgres://localhost/src");
            std::env::set_var("TEST_REGISTRY_DSN", "postgres://localhost/reg");
            std::env::set_var("TEST_SMS_ENDPOINT", "http://localhost:9000");
        }
        f();
    }

    #[test]
    fn loads_defaults() {
        with_env(|| {
            let cfg = TableReaderConfig::from_toml_str(SAMPLE).unwrap();
            assert_eq!(cfg.max_pending_messages, 1_000_000);
            assert_eq!(cfg.initial_page_size, 1_000);
            assert_eq!(cfg.max_page_size, 40_000);
            assert_eq!(cfg.max_batches_in_memory, 3);
            assert_eq!(cfg.max_backoff_ms, 1_000);
            assert_eq!(cfg.max_backoff_time_ms, 60_000);
        });
    }

    #[test]
    fn rejects_missing_backfill_id() {
        with_env(|| {
            let bad = SAMPLE.replacen("bf_1", "", 1);
            let err = TableReaderConfig::from_toml_str(&bad).unwrap_err();
            assert!(matches!(err, AppError::MissingConfig("backfill_id")));
        });
    }

    #[test]
    fn rejects_page_size_over_cap() {
        with_env(|| {
            let bad = format!("{SAMPLE}\nmax_page_size = 50000\n");
            let err = TableReaderConfig::from_toml_str(&bad).unwrap_err();
            assert!(matches!(err, AppError::InvalidConfig(_)));
        });
    }
}
