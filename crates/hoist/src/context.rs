//! # Build context
//!
//! Every upload is driven by a [`BuildContext`], which combines an absolute project
//! directory with the settings of a single resolved [`Environment`].
//!
//! Contexts are never modified after creation. Watch mode resolves a new context for
//! every triggered upload, since the project configuration may change in between.

use std::{
    collections::BTreeMap,
    ffi::OsStr,
    path::{Path, PathBuf},
    time::Duration,
};

use tracing::debug;

use crate::config::{ConfigError, ProjectConfig, DEFAULT_ENVIRONMENT_NAME};

/// Delay used when the environment doesn't configure one.
pub(crate) const DEFAULT_WATCH_DELAY: Duration = Duration::from_secs(2);

/// Resolved environment settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Environment {
    /// Environment name.
    pub name: String,

    /// Application name.
    pub app: String,

    /// Variables passed to the remote build.
    pub variables: BTreeMap<String, String>,

    /// Upload automatically whenever project files change.
    pub watch: bool,

    /// Delay after the last change before an automatic upload starts.
    pub watch_delay: Duration,
}

/// Settings that govern a single upload.
#[derive(Clone, Debug)]
pub(crate) struct BuildContext {
    /// Absolute project directory.
    source_dir: PathBuf,

    /// Resolved environment.
    environment: Environment,
}

impl BuildContext {
    /// Load the project configuration from `source_dir` and resolve `environment_name` against it.
    ///
    /// If the requested environment is not configured, the [default](DEFAULT_ENVIRONMENT_NAME)
    /// one is used instead.
    pub(crate) fn load_with_environment(
        source_dir: &Path,
        environment_name: &str,
    ) -> Result<Self, ConfigError> {
        let source_dir = source_dir
            .canonicalize()
            .map_err(|source| ConfigError::SourceDir {
                path: source_dir.display().to_string(),
                source,
            })?;

        let mut config = ProjectConfig::load(&source_dir)?;

        let (name, settings) = match config.environments.remove_entry(environment_name) {
            Some(entry) => entry,
            None => {
                let entry = config
                    .environments
                    .remove_entry(DEFAULT_ENVIRONMENT_NAME)
                    .ok_or_else(|| ConfigError::EnvironmentNotFound {
                        requested: environment_name.to_string(),
                        fallback: DEFAULT_ENVIRONMENT_NAME.to_string(),
                    })?;

                debug!(
                    requested = environment_name,
                    "environment not found, using the default one"
                );

                entry
            }
        };

        let watch_delay = match settings.watch_delay {
            Some(value) => Duration::try_from_secs_f64(value).map_err(|_| {
                ConfigError::InvalidWatchDelay {
                    environment: name.clone(),
                    value,
                }
            })?,
            None => DEFAULT_WATCH_DELAY,
        };

        let app = settings.app.unwrap_or_else(|| {
            source_dir
                .file_name()
                .and_then(OsStr::to_str)
                .unwrap_or("app")
                .to_string()
        });

        Ok(Self {
            environment: Environment {
                name,
                app,
                variables: settings.variables,
                watch: settings.watch,
                watch_delay,
            },
            source_dir,
        })
    }

    /// Absolute project directory.
    pub(crate) fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    /// Resolved environment.
    pub(crate) fn environment(&self) -> &Environment {
        &self.environment
    }
}

/// Pick the environment name to run under.
///
/// Explicit command-line `flag` takes precedence over the `env_var` value,
/// which in turn takes precedence over the `fallback`. Empty values are treated as absent.
pub(crate) fn resolve_environment_name(
    flag: Option<&str>,
    env_var: Option<&str>,
    fallback: &str,
) -> String {
    flag.filter(|name| !name.is_empty())
        .or(env_var.filter(|name| !name.is_empty()))
        .unwrap_or(fallback)
        .to_string()
}

#[cfg(test)]
mod tests {
    use std::{fs, time::Duration};

    use super::{resolve_environment_name, BuildContext, DEFAULT_WATCH_DELAY};
    use crate::config::{ConfigError, MANIFEST_FILE_NAME};

    fn project(manifest: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(MANIFEST_FILE_NAME), manifest).unwrap();
        dir
    }

    #[test]
    fn requested_environment_is_resolved() {
        let dir = project(
            r#"
            [environments.default]
            app = "fallback"

            [environments.staging]
            app = "shop"
            watch = true
            watch_delay = 5

            [environments.staging.variables]
            LOG_LEVEL = "debug"
            "#,
        );

        let context = BuildContext::load_with_environment(dir.path(), "staging").unwrap();
        let env = context.environment();

        assert_eq!(env.name, "staging");
        assert_eq!(env.app, "shop");
        assert!(env.watch);
        assert_eq!(env.watch_delay, Duration::from_secs(5));
        assert_eq!(env.variables.get("LOG_LEVEL").map(String::as_str), Some("debug"));
        assert_eq!(context.source_dir(), dir.path().canonicalize().unwrap());
    }

    #[test]
    fn missing_environment_falls_back_to_default() {
        let dir = project(
            r#"
            [environments.default]
            watch = true
            "#,
        );

        let context = BuildContext::load_with_environment(dir.path(), "development").unwrap();
        let env = context.environment();

        assert_eq!(env.name, "default");
        assert!(env.watch);
        assert_eq!(env.watch_delay, DEFAULT_WATCH_DELAY);
        assert_eq!(
            env.app,
            dir.path().canonicalize().unwrap().file_name().unwrap().to_str().unwrap()
        );
    }

    #[test]
    fn environment_lookup_is_case_sensitive() {
        let dir = project(
            r#"
            [environments.Staging]
            watch = true
            "#,
        );

        let result = BuildContext::load_with_environment(dir.path(), "staging");

        assert!(matches!(
            result,
            Err(ConfigError::EnvironmentNotFound { requested, fallback })
                if requested == "staging" && fallback == "default"
        ));
    }

    #[test]
    fn fractional_watch_delay_is_supported() {
        let dir = project("[environments.default]\nwatch_delay = 0.25\n");

        let context = BuildContext::load_with_environment(dir.path(), "default").unwrap();

        assert_eq!(context.environment().watch_delay, Duration::from_millis(250));
    }

    #[test]
    fn negative_watch_delay_is_rejected() {
        let dir = project("[environments.default]\nwatch_delay = -1\n");

        let result = BuildContext::load_with_environment(dir.path(), "default");

        assert!(matches!(result, Err(ConfigError::InvalidWatchDelay { .. })));
    }

    #[test]
    fn missing_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();

        let result = BuildContext::load_with_environment(dir.path(), "default");

        assert!(matches!(result, Err(ConfigError::MissingManifest(_))));
    }

    #[test]
    fn malformed_manifest_is_an_error() {
        let dir = project("[environments.default]\nwatch = \"sometimes\"\n");

        let result = BuildContext::load_with_environment(dir.path(), "default");

        assert!(matches!(result, Err(ConfigError::Figment(_))));
    }

    #[test]
    fn configuration_is_reloaded_on_every_call() {
        let dir = project("[environments.default]\nwatch_delay = 1\n");

        let first = BuildContext::load_with_environment(dir.path(), "default").unwrap();

        fs::write(
            dir.path().join(MANIFEST_FILE_NAME),
            "[environments.default]\nwatch_delay = 3\n",
        )
        .unwrap();

        let second = BuildContext::load_with_environment(dir.path(), "default").unwrap();

        assert_eq!(first.environment().watch_delay, Duration::from_secs(1));
        assert_eq!(second.environment().watch_delay, Duration::from_secs(3));
    }

    #[test]
    fn flag_takes_precedence_over_env_var() {
        assert_eq!(
            resolve_environment_name(Some("qa"), Some("staging"), "default"),
            "qa"
        );
        assert_eq!(
            resolve_environment_name(None, Some("staging"), "default"),
            "staging"
        );
        assert_eq!(resolve_environment_name(None, None, "default"), "default");
        assert_eq!(resolve_environment_name(Some(""), Some(""), "default"), "default");
    }
}
