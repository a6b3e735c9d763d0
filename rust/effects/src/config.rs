//! Runtime configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How closed spans leave the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportMode {
    /// Hand each span to the exporter as soon as it closes.
    Simple,
    /// Buffer spans and export them in batches.
    Batch,
    /// Emit every span as a `tracing` event.
    #[default]
    Log,
    /// Drop spans.
    Off,
}

impl ExportMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ExportMode::Simple => "simple",
            ExportMode::Batch => "batch",
            ExportMode::Log => "log",
            ExportMode::Off => "off",
        }
    }
}

impl fmt::Display for ExportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "simple" => Ok(ExportMode::Simple),
            "batch" => Ok(ExportMode::Batch),
            "log" => Ok(ExportMode::Log),
            "off" | "none" => Ok(ExportMode::Off),
            _ => Err(ConfigError::InvalidExportMode {
                value: value.to_string(),
            }),
        }
    }
}

/// Invalid configuration values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unknown span export mode `{value}` (expected simple, batch, log or off)")]
    InvalidExportMode { value: String },

    #[error("`{var}` must be a positive integer, got `{value}`")]
    InvalidNumber { var: &'static str, value: String },
}

/// Settings for building a [`Runtime`](crate::Runtime).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Service name stamped on every exported span.
    pub service_name: String,
    /// Span export strategy.
    pub export: ExportMode,
    /// Spans per batch in [`ExportMode::Batch`].
    pub batch_size: usize,
    /// Deadline applied to runs that do not set their own.
    pub default_timeout: Option<Duration>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            service_name: "weft".to_string(),
            export: ExportMode::default(),
            batch_size: 64,
            default_timeout: None,
        }
    }
}

impl RuntimeConfig {
    pub const SERVICE_NAME_VAR: &'static str = "WEFT_SERVICE_NAME";
    pub const EXPORT_VAR: &'static str = "WEFT_SPAN_EXPORT";
    pub const BATCH_SIZE_VAR: &'static str = "WEFT_SPAN_BATCH_SIZE";
    pub const TIMEOUT_VAR: &'static str = "WEFT_TIMEOUT_MS";

    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_export(mut self, export: ExportMode) -> Self {
        self.export = export;
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Read the configuration from the process environment.
    ///
    /// Expected variables, all optional:
    /// - `WEFT_SERVICE_NAME`: service name (default `weft`)
    /// - `WEFT_SPAN_EXPORT`: `simple`, `batch`, `log` or `off` (default `log`)
    /// - `WEFT_SPAN_BATCH_SIZE`: spans per batch (default 64)
    /// - `WEFT_TIMEOUT_MS`: default run deadline in milliseconds
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`RuntimeConfig::from_env`], reading variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to an invalid value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(name) = lookup(Self::SERVICE_NAME_VAR).filter(|n| !n.trim().is_empty()) {
            config.service_name = name;
        }
        if let Some(mode) = lookup(Self::EXPORT_VAR) {
            config.export = mode.parse()?;
        }
        if let Some(size) = lookup(Self::BATCH_SIZE_VAR) {
            config.batch_size = positive(Self::BATCH_SIZE_VAR, &size)?;
        }
        if let Some(ms) = lookup(Self::TIMEOUT_VAR) {
            config.default_timeout = Some(Duration::from_millis(positive(Self::TIMEOUT_VAR, &ms)?));
        }
        Ok(config)
    }
}

fn positive<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
{
    match value.trim().parse::<T>() {
        Ok(parsed) if parsed > T::default() => Ok(parsed),
        _ => Err(ConfigError::InvalidNumber {
            var,
            value: value.to_string(),
        }),
    }
}
