use std::{
    env::{self, current_dir},
    io,
    path::PathBuf,
    sync::Arc,
};

use common::config::Config;
use derive_more::{Display, Error, From};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    commands::Up,
    config::{ConfigError, DEFAULT_ENVIRONMENT_NAME, ENVIRONMENT_ENV_VAR},
    context::{resolve_environment_name, BuildContext},
    display::ProgressDisplay,
    ignore_file::IgnoreMatcher,
    remote::WebSocketRemote,
    session::{SessionError, SessionOptions, SessionOutcome, UploadSession},
    watcher::{spawn_fs_watcher, WatchLoop},
};

/// `up` subcommand errors.
#[derive(Debug, Display, From, Error)]
pub(crate) enum UpError {
    /// IO-related error.
    Io(io::Error),

    /// Project configuration could not be resolved.
    Config(ConfigError),

    /// Upload could not be completed.
    Session(SessionError),

    /// Error while communicating with the [`notify`] crate.
    #[display(fmt = "unable to watch for changes: {}", _0)]
    Notify(notify::Error),

    /// Remote build service reported a failure.
    #[display(fmt = "remote build failed")]
    RemoteBuildFailed,
}

/// Upload the project, once or continuously, depending on the selected environment.
pub(crate) async fn up(
    Up {
        path,
        environment,
        remote,
    }: Up,
    config: Config,
) -> Result<(), UpError> {
    let source_dir = match path {
        Some(path) => path,
        None => current_dir()?,
    };

    let env_var = env::var(ENVIRONMENT_ENV_VAR).ok();
    let environment_name = resolve_environment_name(
        environment.as_deref(),
        env_var.as_deref(),
        DEFAULT_ENVIRONMENT_NAME,
    );

    let remote = WebSocketRemote::new(
        remote.unwrap_or(config.remote.url),
        config.remote.token,
    );

    let uploader = Uploader {
        source_dir,
        session: UploadSession::new(Arc::new(remote), SessionOptions::from(&config.upload)),
    };

    uploader.run(&environment_name).await
}

/// Uploads a single project directory.
struct Uploader {
    /// Project directory.
    source_dir: PathBuf,

    /// Upload pipeline.
    session: UploadSession,
}

impl Uploader {
    /// Resolve `environment_name` and upload the project.
    ///
    /// If the resolved environment enables watch mode, this function returns only after
    /// Ctrl-C is pressed. Otherwise a single upload is performed, and Ctrl-C cancels it.
    async fn run(&self, environment_name: &str) -> Result<(), UpError> {
        let context = BuildContext::load_with_environment(&self.source_dir, environment_name)?;

        let stop = CancellationToken::new();
        let _stop_guard = stop.clone().drop_guard();

        tokio::spawn(cancel_on_ctrl_c(stop.clone()));

        if context.environment().watch {
            self.watch(environment_name, context, stop).await
        } else {
            self.once(context, stop).await
        }
    }

    /// Perform a single upload.
    async fn once(&self, context: BuildContext, stop: CancellationToken) -> Result<(), UpError> {
        let display = ProgressDisplay::new();

        let outcome = self
            .session
            .run_displayed(&stop, &context, display.clone())
            .await;

        match outcome {
            Ok(SessionOutcome::Completed) => {
                display.finish("Deployed.");
                Ok(())
            }
            Ok(SessionOutcome::Failed) => {
                display.finish("Build failed.");
                Err(UpError::RemoteBuildFailed)
            }
            Ok(SessionOutcome::Cancelled) => {
                display.finish("Cancelled.");
                Ok(())
            }
            Err(err) => {
                display.finish("Upload failed.");
                Err(err.into())
            }
        }
    }

    /// Upload the project now and again on every change, until `stop` is cancelled.
    async fn watch(
        &self,
        environment_name: &str,
        context: BuildContext,
        stop: CancellationToken,
    ) -> Result<(), UpError> {
        let source_dir = context.source_dir().to_path_buf();

        let matcher = IgnoreMatcher::from_root(&source_dir)?;
        debug!(rules = matcher.len(), "ignore rules loaded");

        // Watcher stops once dropped, so keep it alive for the whole loop.
        let (_watcher, events) = spawn_fs_watcher(&source_dir, matcher)?;

        info!(source = %source_dir.display(), "watching for changes");

        let display = ProgressDisplay::new();

        WatchLoop::new(
            source_dir,
            environment_name.to_string(),
            self.session.clone(),
            display.clone(),
        )
        .upload_on_start(true)
        .run(stop, events, context.environment().watch_delay)
        .await;

        display.finish("Stopped.");

        Ok(())
    }
}

/// Cancel the `stop` token once Ctrl-C is pressed.
async fn cancel_on_ctrl_c(stop: CancellationToken) {
    tokio::select! {
        _ = stop.cancelled() => {}
        res = tokio::signal::ctrl_c() => {
            if res.is_ok() {
                debug!("interrupted, stopping");
                stop.cancel();
            }
        }
    }
}
