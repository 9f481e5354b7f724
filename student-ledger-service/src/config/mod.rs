//! Configuration module for student-ledger-service.

use crate::services::LedgerSettings;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub ledger: LedgerSettings,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl LedgerConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let defaults = LedgerSettings::default();

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "student-ledger-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: env_or("DATABASE_MIN_CONNECTIONS", 2),
            },
            ledger: LedgerSettings {
                max_retries: env_or("LEDGER_MAX_RETRIES", defaults.max_retries),
                retry_backoff: Duration::from_millis(env_or(
                    "LEDGER_RETRY_BACKOFF_MS",
                    defaults.retry_backoff.as_millis() as u64,
                )),
                operation_timeout: Duration::from_millis(env_or(
                    "LEDGER_OPERATION_TIMEOUT_MS",
                    defaults.operation_timeout.as_millis() as u64,
                )),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_env_or_falls_back_on_missing_or_malformed_values() {
        env::remove_var("LEDGER_TEST_KNOB");
        assert_eq!(env_or("LEDGER_TEST_KNOB", 7u32), 7);

        env::set_var("LEDGER_TEST_KNOB", "not-a-number");
        assert_eq!(env_or("LEDGER_TEST_KNOB", 7u32), 7);

        env::set_var("LEDGER_TEST_KNOB", "12");
        assert_eq!(env_or("LEDGER_TEST_KNOB", 7u32), 12);
        env::remove_var("LEDGER_TEST_KNOB");
    }

    #[test]
    #[serial]
    fn test_from_env_requires_database_url() {
        env::remove_var("DATABASE_URL");
        let err = LedgerConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }

    #[test]
    #[serial]
    fn test_from_env_reads_ledger_tuning() {
        env::set_var("DATABASE_URL", "postgres://localhost/ledger");
        env::set_var("LEDGER_MAX_RETRIES", "5");
        env::set_var("LEDGER_RETRY_BACKOFF_MS", "10");
        env::remove_var("LEDGER_OPERATION_TIMEOUT_MS");

        let config = LedgerConfig::from_env().unwrap();
        assert_eq!(config.database.url, "postgres://localhost/ledger");
        assert_eq!(config.ledger.max_retries, 5);
        assert_eq!(config.ledger.retry_backoff, Duration::from_millis(10));
        assert_eq!(config.ledger.operation_timeout, Duration::from_secs(5));

        env::remove_var("DATABASE_URL");
        env::remove_var("LEDGER_MAX_RETRIES");
        env::remove_var("LEDGER_RETRY_BACKOFF_MS");
    }
}
