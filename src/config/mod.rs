//! Typed configuration from environment variables or a TOML file.
//!
//! Loads once at startup and fails fast on values that do not parse or
//! describe an unusable pool.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dispatcher::DispatchConfig;
use crate::error::{Error, Result};
use crate::telemetry::TelemetryConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Fixed worker count.
    pub workers: usize,
    /// Upper bound on concurrent producers; each worker queue holds this many.
    pub max_producers: usize,
    pub submission_capacity: usize,
    /// Default producer wait limit in milliseconds. Unset waits forever.
    pub submit_timeout_ms: Option<u64>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        let dispatch = DispatchConfig::default();
        Self {
            workers: dispatch.workers,
            max_producers: dispatch.max_producers,
            submission_capacity: dispatch.submission_capacity,
            submit_timeout_ms: None,
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, defaulting anything
    /// that is unset.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            workers: parse_var("DISPATCHQ_WORKERS")?.unwrap_or(defaults.workers),
            max_producers: parse_var("DISPATCHQ_MAX_PRODUCERS")?
                .unwrap_or(defaults.max_producers),
            submission_capacity: parse_var("DISPATCHQ_SUBMISSION_CAPACITY")?
                .unwrap_or(defaults.submission_capacity),
            submit_timeout_ms: parse_var("DISPATCHQ_SUBMIT_TIMEOUT_MS")?,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
        };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file. Missing keys take defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("bad config {}: {e}", path.display())))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::Config(e.message().to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".to_string()));
        }
        if self.max_producers == 0 {
            return Err(Error::Config("max_producers must be at least 1".to_string()));
        }
        if self.submission_capacity == 0 {
            return Err(Error::Config(
                "submission_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn submit_timeout(&self) -> Option<Duration> {
        self.submit_timeout_ms.map(Duration::from_millis)
    }

    pub fn dispatch(&self) -> DispatchConfig {
        DispatchConfig {
            workers: self.workers,
            max_producers: self.max_producers,
            submission_capacity: self.submission_capacity,
            submit_timeout: self.submit_timeout(),
        }
    }

    pub fn telemetry(&self, service_name: &str) -> TelemetryConfig {
        TelemetryConfig {
            endpoint: self.otel_endpoint.clone(),
            service_name: service_name.to_string(),
            default_filter: self.log_level.clone(),
        }
    }
}

fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid value for {name} ({raw:?}): {e}"))),
        Err(_) => Ok(None),
    }
}
