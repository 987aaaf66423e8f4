//! Service configuration, read from the environment.

use std::net::SocketAddr;
use std::num::NonZeroUsize;

use tracing::level_filters::LevelFilter;

use crate::errors::{HeadError, HeadResult};
use crate::registry::RetentionPolicy;
use crate::tracing::{parse_log_level, OtlpTracingConfig, TracingConfig};

pub const ENV_PORT: &str = "DATA_HEAD_PORT";
pub const ENV_MAX_DATASETS_PER_JOB: &str = "DATA_HEAD_MAX_DATASETS_PER_JOB";
pub const ENV_LOG_LEVEL: &str = "DATA_HEAD_LOG_LEVEL";
pub const ENV_OTLP_URL: &str = "DATA_HEAD_OTLP_URL";
pub const ENV_SERVICE_NAME: &str = "DATA_HEAD_SERVICE_NAME";

const DEFAULT_PORT: u16 = 8265;
const DEFAULT_SERVICE_NAME: &str = "data-head";

#[derive(Debug, Clone, PartialEq)]
pub struct HeadConfig {
    /// Port of the HTTP query surface.
    pub port: u16,
    /// Finished datasets kept per job. `None` keeps everything.
    pub max_datasets_per_job: Option<NonZeroUsize>,
    pub log_level: LevelFilter,
    /// OTLP collector to export traces to. Traces are not exported
    /// when unset.
    pub otlp_url: Option<String>,
    pub service_name: String,
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_datasets_per_job: None,
            log_level: LevelFilter::INFO,
            otlp_url: None,
            service_name: DEFAULT_SERVICE_NAME.to_owned(),
        }
    }
}

impl HeadConfig {
    /// Load from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`HeadError::Config`] when a variable is set but can't
    /// be parsed.
    pub fn from_env() -> HeadResult<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Load with a custom variable lookup.
    pub fn from_env_with<F>(get_env: F) -> HeadResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| {
            get_env(key)
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
        };

        let port = match get(ENV_PORT) {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|err| HeadError::Config(format!("{ENV_PORT}={raw:?}: {err}")))?,
            None => defaults.port,
        };

        let max_datasets_per_job = match get(ENV_MAX_DATASETS_PER_JOB) {
            Some(raw) => Some(raw.parse::<NonZeroUsize>().map_err(|err| {
                HeadError::Config(format!(
                    "{ENV_MAX_DATASETS_PER_JOB}={raw:?}: expected a positive integer ({err})"
                ))
            })?),
            None => defaults.max_datasets_per_job,
        };

        let log_level = match get(ENV_LOG_LEVEL) {
            Some(raw) => parse_log_level(&raw)
                .map_err(|err| HeadError::Config(format!("{ENV_LOG_LEVEL}: {err}")))?,
            None => defaults.log_level,
        };

        Ok(Self {
            port,
            max_datasets_per_job,
            log_level,
            otlp_url: get(ENV_OTLP_URL),
            service_name: get(ENV_SERVICE_NAME).unwrap_or(defaults.service_name),
        })
    }

    pub fn retention(&self) -> RetentionPolicy {
        match self.max_datasets_per_job {
            Some(max) => RetentionPolicy::max_datasets_per_job(max),
            None => RetentionPolicy::unbounded(),
        }
    }

    /// Listen on every interface.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }

    pub fn tracing_config(&self) -> TracingConfig {
        TracingConfig {
            log_level: self.log_level,
            otlp: self.otlp_url.as_ref().map(|url| OtlpTracingConfig {
                service_name: self.service_name.clone(),
                url: Some(url.clone()),
                sampling_ratio: 1.0,
            }),
        }
    }
}
