use std::path::Path;

use serde::Deserialize;

use crate::validation::{validate, ConfigReport};
use crate::{LimitsConfig, TimeoutsConfig, UpstreamConfig};

/// Scrape endpoint address used when `metrics_listen` is not set.
pub const DEFAULT_METRICS_LISTEN: &str = "0.0.0.0:9100";

// =======================================================
// PYLON CONFIG — main config
// =======================================================
//
// The whole file is loaded once at startup and then shared
// immutably (`Arc<PylonConfig>`) across workers and handlers.
#[derive(Debug, Deserialize)]
pub struct PylonConfig {
    /// "host:port" the proxy listens on.
    pub listen: String,

    /// Number of accept-loop workers sharing the listener.
    pub workers: usize,

    /// Origin servers requests are forwarded to.
    pub upstreams: Vec<UpstreamConfig>,

    pub timeouts: TimeoutsConfig,

    pub limits: LimitsConfig,

    /// Optional "host:port" for the Prometheus scrape endpoint.
    #[serde(default)]
    pub metrics_listen: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Read(#[from] config::ConfigError),

    #[error("invalid configuration:\n{0}")]
    Invalid(String),
}

impl PylonConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let built = config::Config::builder()
            .add_source(config::File::from(path.to_path_buf()).format(config::FileFormat::Yaml))
            .build()?;

        let cfg: PylonConfig = built.try_deserialize()?;
        cfg.check()?;
        Ok(cfg)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let built = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Yaml))
            .build()?;

        let cfg: PylonConfig = built.try_deserialize()?;
        cfg.check()?;
        Ok(cfg)
    }

    /// Validate the configuration and return a report of warnings and errors.
    pub fn validate(&self) -> ConfigReport {
        validate(self)
    }

    pub fn metrics_listen(&self) -> &str {
        self.metrics_listen
            .as_deref()
            .unwrap_or(DEFAULT_METRICS_LISTEN)
    }

    fn check(&self) -> Result<(), ConfigError> {
        let report = self.validate();
        if report.has_errors() {
            return Err(ConfigError::Invalid(report.format()));
        }
        Ok(())
    }
}
