//! # Configuration module
//!
//! This module provide utilities and helpers to interact with the
//! configuration

use std::{
    convert::TryFrom,
    env::{self, VarError},
    fmt::{self, Display, Formatter},
    path::PathBuf,
    time::Duration,
};

use config::{
    builder::{ConfigBuilder, DefaultState},
    Config, ConfigError, Environment, File,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

// -----------------------------------------------------------------------------
// Constants

pub const OPERATOR_LISTEN: &str = "0.0.0.0:8000";

// -----------------------------------------------------------------------------
// Operator structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Operator {
    #[serde(rename = "listen")]
    pub listen: String,
}

// -----------------------------------------------------------------------------
// Mode enumeration

/// selects where definitions come from, custom resources watched on the
/// cluster or a static configuration path
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug, Default)]
pub enum Mode {
    #[default]
    #[serde(rename = "crd")]
    Crd,
    #[serde(rename = "config")]
    Config,
}

impl Display for Mode {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Crd => write!(f, "crd"),
            Self::Config => write!(f, "config"),
        }
    }
}

// -----------------------------------------------------------------------------
// Controllers structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Controllers {
    #[serde(rename = "mode")]
    pub mode: Mode,
    /// path to the static definitions, required by the 'config' mode
    #[serde(rename = "definitions")]
    pub definitions: Option<PathBuf>,
    /// number of reconciliation workers per watch controller
    #[serde(rename = "workers")]
    pub workers: usize,
    #[serde(rename = "cacheSyncTimeoutSeconds")]
    pub cache_sync_timeout_seconds: u64,
    #[serde(rename = "waitIntervalSeconds")]
    pub wait_interval_seconds: u64,
    #[serde(rename = "waitTimeoutSeconds")]
    pub wait_timeout_seconds: u64,
    #[serde(rename = "hookTimeoutSeconds")]
    pub hook_timeout_seconds: u64,
}

impl Controllers {
    pub fn cache_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_sync_timeout_seconds)
    }

    pub fn wait_interval(&self) -> Duration {
        Duration::from_secs(self.wait_interval_seconds)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_seconds)
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.hook_timeout_seconds)
    }
}

// -----------------------------------------------------------------------------
// ConfigurationError enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to load configuration, {0}")]
    Build(ConfigError),
    #[error("failed to deserialize configuration, {0}")]
    Deserialize(ConfigError),
    #[error("failed to set default for key '{0}', {1}")]
    Default(String, ConfigError),
    #[error("failed to retrieve environment variable '{0}', {1}")]
    EnvironmentVariable(&'static str, VarError),
}

// -----------------------------------------------------------------------------
// Configuration structures

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Configuration {
    #[serde(rename = "operator")]
    pub operator: Operator,
    #[serde(rename = "controllers")]
    pub controllers: Controllers,
}

fn defaults(builder: ConfigBuilder<DefaultState>) -> Result<ConfigBuilder<DefaultState>, Error> {
    builder
        .set_default("operator.listen", OPERATOR_LISTEN)
        .map_err(|err| Error::Default("operator.listen".into(), err))?
        .set_default("controllers.mode", "crd")
        .map_err(|err| Error::Default("controllers.mode".into(), err))?
        .set_default("controllers.workers", 5_i64)
        .map_err(|err| Error::Default("controllers.workers".into(), err))?
        .set_default("controllers.cacheSyncTimeoutSeconds", 120_i64)
        .map_err(|err| Error::Default("controllers.cacheSyncTimeoutSeconds".into(), err))?
        .set_default("controllers.waitIntervalSeconds", 1_i64)
        .map_err(|err| Error::Default("controllers.waitIntervalSeconds".into(), err))?
        .set_default("controllers.waitTimeoutSeconds", 1800_i64)
        .map_err(|err| Error::Default("controllers.waitTimeoutSeconds".into(), err))?
        .set_default("controllers.hookTimeoutSeconds", 30_i64)
        .map_err(|err| Error::Default("controllers.hookTimeoutSeconds".into(), err))
}

impl TryFrom<PathBuf> for Configuration {
    type Error = Error;

    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        defaults(Config::builder())?
            .add_source(Environment::with_prefix(
                &env!("CARGO_PKG_NAME").replace('-', "_"),
            ))
            .add_source(File::from(path).required(true))
            .build()
            .map_err(Error::Build)?
            .try_deserialize()
            .map_err(Error::Deserialize)
    }
}

impl Configuration {
    pub fn try_default() -> Result<Self, Error> {
        defaults(Config::builder())?
            .add_source(Environment::with_prefix(
                &env!("CARGO_PKG_NAME").replace('-', "_"),
            ))
            .add_source(
                File::from(PathBuf::from(format!(
                    "/usr/share/{}/config",
                    env!("CARGO_PKG_NAME")
                )))
                .required(false),
            )
            .add_source(
                File::from(PathBuf::from(format!(
                    "/etc/{}/config",
                    env!("CARGO_PKG_NAME")
                )))
                .required(false),
            )
            .add_source(
                File::from(PathBuf::from(format!(
                    "{}/.config/{}/config",
                    env::var("HOME").map_err(|err| Error::EnvironmentVariable("HOME", err))?,
                    env!("CARGO_PKG_NAME")
                )))
                .required(false),
            )
            .add_source(File::from(PathBuf::from("config")).required(false))
            .build()
            .map_err(Error::Build)?
            .try_deserialize()
            .map_err(Error::Deserialize)
    }

    /// Prints a message about suspicious combinations of configuration keys
    pub fn help(&self) {
        #[cfg(feature = "metrics")]
        tracing::info!("Build with 'metrics' feature flag");

        if self.controllers.mode == Mode::Config && self.controllers.definitions.is_none() {
            warn!(
                "Configuration key 'controllers.mode' is set to 'config' but 'controllers.definitions' has no value"
            );
        }

        if self.controllers.mode == Mode::Crd && self.controllers.definitions.is_some() {
            warn!(
                "Configuration key 'controllers.definitions' is ignored while 'controllers.mode' is set to 'crd'"
            );
        }
    }
}

// -----------------------------------------------------------------------------
// Unit tests

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn configuration_from_file_keeps_defaults_for_missing_keys() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .expect("a temporary file");

        write!(
            file,
            "controllers:\n  mode: config\n  definitions: /etc/metac/definitions\n"
        )
        .expect("configuration written");

        let config =
            Configuration::try_from(file.path().to_path_buf()).expect("a valid configuration");

        assert_eq!(config.operator.listen, OPERATOR_LISTEN);
        assert_eq!(config.controllers.mode, Mode::Config);
        assert_eq!(
            config.controllers.definitions,
            Some(PathBuf::from("/etc/metac/definitions"))
        );
        assert_eq!(config.controllers.workers, 5);
        assert_eq!(config.controllers.wait_interval(), Duration::from_secs(1));
        assert_eq!(config.controllers.wait_timeout(), Duration::from_secs(1800));
        assert_eq!(config.controllers.hook_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn configuration_overrides_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .expect("a temporary file");

        write!(
            file,
            "operator:\n  listen: 127.0.0.1:9000\ncontrollers:\n  workers: 2\n  hookTimeoutSeconds: 5\n"
        )
        .expect("configuration written");

        let config =
            Configuration::try_from(file.path().to_path_buf()).expect("a valid configuration");

        assert_eq!(config.operator.listen, "127.0.0.1:9000");
        assert_eq!(config.controllers.mode, Mode::Crd);
        assert_eq!(config.controllers.workers, 2);
        assert_eq!(config.controllers.hook_timeout(), Duration::from_secs(5));
    }
}
