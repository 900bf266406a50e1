use std::path::PathBuf;

use byte_unit::n_kib_bytes;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

#[cfg(feature = "logging")]
use tracing_subscriber::filter::LevelFilter;

/// Remote build service configuration.
#[derive(Deserialize)]
pub struct Remote {
    /// Base WebSocket URL of the remote build service.
    #[serde(default = "default_remote_url")]
    pub url: String,

    /// Bearer token sent with every upload, if the service requires one.
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for Remote {
    fn default() -> Self {
        Self {
            url: default_remote_url(),
            token: None,
        }
    }
}

/// Default remote URL, pointing to a locally running build service.
pub fn default_remote_url() -> String {
    String::from("ws://127.0.0.1:20600")
}

/// Upload tuning.
#[derive(Deserialize)]
pub struct Upload {
    /// Size of a single archive chunk sent to the remote, in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Amount of remote results buffered between the upload and the display.
    #[serde(default = "default_results_buffer")]
    pub results_buffer: usize,

    /// Archive contents of symbolic link targets instead of the links themselves.
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for Upload {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            results_buffer: default_results_buffer(),
            follow_symlinks: false,
        }
    }
}

fn default_chunk_size() -> usize {
    n_kib_bytes!(64) as usize
}

fn default_results_buffer() -> usize {
    64
}

/// Implementation of [`serde`]'s deserializer for [`FromStr`] types.
#[cfg(feature = "logging")]
fn deserialize_from_str<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    T: std::str::FromStr,
    T::Err: std::error::Error,
    D: serde::de::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    std::str::FromStr::from_str(&s).map_err(serde::de::Error::custom)
}

/// Logging configuration.
#[cfg(feature = "logging")]
#[derive(Deserialize)]
pub struct Logging {
    /// Log level.
    #[serde(deserialize_with = "deserialize_from_str")]
    pub level: LevelFilter,
}

#[cfg(feature = "logging")]
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::WARN,
        }
    }
}

/// General client configuration.
#[derive(Deserialize, Default)]
pub struct Config {
    /// Remote build service configuration.
    #[serde(default)]
    pub remote: Remote,

    /// Upload tuning.
    #[serde(default)]
    pub upload: Upload,

    /// Logging configuration.
    #[cfg(feature = "logging")]
    #[serde(default)]
    pub logging: Logging,
}

impl Config {
    /// Create new config using the provided (or default) configuration file and environment variables.
    ///
    /// Environment variables are prefixed with `HOIST_` and nested with a double underscore,
    /// for example `HOIST_REMOTE__URL` or `HOIST_UPLOAD__CHUNK_SIZE`.
    ///
    /// See [`Env`] for more details on how to use environment variables configuration.
    ///
    /// [`Env`]: figment::providers::Env
    pub fn new(path: Option<PathBuf>) -> Result<Self, figment::Error> {
        let mut figment = Figment::new();

        if let Some(path) = path.or_else(Self::default_path) {
            figment = figment.merge(Toml::file(path));
        }

        figment.merge(Env::prefixed("HOIST_").split("__")).extract()
    }

    /// Default configuration file location, `~/.hoist/config.toml`.
    ///
    /// Returns [`None`] if home directory cannot be determined.
    pub fn default_path() -> Option<PathBuf> {
        let mut home_dir = home::home_dir()?;
        home_dir.push(".hoist/config.toml");
        Some(home_dir)
    }

    /// Create new config suitable for running unit tests.
    #[cfg(feature = "test-utils")]
    pub fn for_tests(remote_url: &str) -> Self {
        Self {
            remote: Remote {
                url: remote_url.to_string(),
                token: None,
            },
            upload: Upload {
                chunk_size: 1024,
                results_buffer: 4,
                follow_symlinks: false,
            },
            #[cfg(feature = "logging")]
            logging: Logging::default(),
        }
    }
}
