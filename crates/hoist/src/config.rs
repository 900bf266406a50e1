use std::{collections::BTreeMap, io, path::Path};

use derive_more::{Display, Error, From};
use figment::{
    providers::{Format, Toml},
    Figment,
};
use serde::Deserialize;

/// Project configuration file name, looked up in the project root.
pub(crate) const MANIFEST_FILE_NAME: &str = "hoist.toml";

/// Environment used when the requested one is not present in the project configuration.
pub(crate) const DEFAULT_ENVIRONMENT_NAME: &str = "default";

/// Environment variable used to select an environment without the command-line flag.
pub(crate) const ENVIRONMENT_ENV_VAR: &str = "HOIST_ENV";

/// Project configuration errors.
#[derive(Debug, Display, From, Error)]
pub(crate) enum ConfigError {
    /// Unable to parse the project configuration with [`figment`].
    #[display(fmt = "invalid project configuration: {}", _0)]
    Figment(figment::Error),

    /// Source directory cannot be resolved.
    #[display(fmt = "unable to resolve source directory {}: {}", path, source)]
    #[from(ignore)]
    SourceDir {
        /// Provided source directory.
        path: String,

        /// Underlying IO error.
        source: io::Error,
    },

    /// Project configuration file is absent.
    #[display(fmt = "project configuration {} not found", _0)]
    #[from(ignore)]
    MissingManifest(#[error(not(source))] String),

    /// Neither the requested nor the default environment is configured.
    #[display(
        fmt = "environment {:?} not found, and no {:?} environment to fall back to",
        requested,
        fallback
    )]
    #[from(ignore)]
    EnvironmentNotFound {
        /// Requested environment name.
        requested: String,

        /// Fallback environment name.
        fallback: String,
    },

    /// Watch delay is negative or not a finite number.
    #[display(fmt = "invalid watch delay {} in environment {:?}", value, environment)]
    #[from(ignore)]
    InvalidWatchDelay {
        /// Environment name.
        environment: String,

        /// Configured value.
        value: f64,
    },
}

/// Settings of a single environment, as written in the project configuration.
#[derive(Deserialize, Clone, Debug, Default)]
pub(crate) struct EnvironmentConfig {
    /// Application name passed to the remote, defaults to the project directory name.
    #[serde(default)]
    pub app: Option<String>,

    /// Variables passed to the remote build.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,

    /// Upload automatically whenever project files change.
    #[serde(default)]
    pub watch: bool,

    /// Delay after the last change before an automatic upload starts, in seconds.
    #[serde(default)]
    pub watch_delay: Option<f64>,
}

/// Project configuration.
#[derive(Deserialize)]
pub(crate) struct ProjectConfig {
    /// Configured environments, keyed by name.
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentConfig>,
}

impl ProjectConfig {
    /// Load the project configuration from the provided project root.
    ///
    /// Configuration file is read on every call.
    pub(crate) fn load(source_dir: &Path) -> Result<Self, ConfigError> {
        let path = source_dir.join(MANIFEST_FILE_NAME);

        if !path.is_file() {
            return Err(ConfigError::MissingManifest(path.display().to_string()));
        }

        Ok(Figment::new().merge(Toml::file(path)).extract()?)
    }
}
