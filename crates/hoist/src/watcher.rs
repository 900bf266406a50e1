//! # Watch mode
//!
//! Filesystem events are debounced: every event (re)starts a timer, and an upload is
//! triggered only after the configured delay passes without any new events.
//!
//! At most one upload is active at a time. When a new upload is triggered while the
//! previous one is still running, the previous upload is cancelled and awaited, together
//! with its result rendering, before the new one starts. Thus results of a superseded
//! upload are never rendered after results of a newer one.
//!
//! Project configuration is re-read on every trigger, which also updates the debounce delay.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    context::BuildContext,
    display::ResultSink,
    ignore_file::{IgnoreMatcher, IGNORE_FILE_NAME},
    session::{SessionError, SessionOutcome, UploadSession},
};

/// Upload that is currently running in background.
struct ActiveSession {
    /// Sequential session identifier.
    id: u64,

    /// Session-specific cancellation token.
    cancel: CancellationToken,

    /// Task driving both the upload and its result rendering.
    task: JoinHandle<()>,
}

impl ActiveSession {
    /// Wait for the session task to finish.
    async fn wait(self) {
        if let Err(err) = self.task.await {
            error!(id = self.id, %err, "upload task failed");
        }
    }

    /// Cancel the session and wait for it to wind down.
    async fn cancel_and_wait(self) {
        self.cancel.cancel();
        self.wait().await;
    }
}

/// Debounced upload loop.
pub(crate) struct WatchLoop<S> {
    /// Project directory.
    source_dir: PathBuf,

    /// Requested environment name, resolved again on every trigger.
    environment_name: String,

    /// Upload pipeline.
    session: UploadSession,

    /// Destination of rendered results.
    sink: S,

    /// Trigger an upload right after start, without waiting for changes.
    upload_on_start: bool,
}

impl<S: ResultSink + Clone + 'static> WatchLoop<S> {
    /// Create new watch loop.
    pub(crate) fn new(
        source_dir: PathBuf,
        environment_name: String,
        session: UploadSession,
        sink: S,
    ) -> Self {
        Self {
            source_dir,
            environment_name,
            session,
            sink,
            upload_on_start: false,
        }
    }

    /// Trigger an upload right after start.
    pub(crate) fn upload_on_start(mut self, value: bool) -> Self {
        self.upload_on_start = value;
        self
    }

    /// Run the loop until `stop` is cancelled or the `events` channel is closed.
    ///
    /// `delay` is used for debouncing until the first environment is resolved.
    pub(crate) async fn run(
        mut self,
        stop: CancellationToken,
        mut events: mpsc::Receiver<Event>,
        mut delay: Duration,
    ) {
        let (done_sender, mut done_receiver) = mpsc::unbounded_channel();

        let mut deadline = self.upload_on_start.then(Instant::now);
        let mut active: Option<ActiveSession> = None;
        let mut next_id = 0;

        if deadline.is_none() {
            self.sink.idle();
        }

        loop {
            tokio::select! {
                biased;

                _ = stop.cancelled() => break,

                Some(id) = done_receiver.recv() => {
                    if active.as_ref().map(|session| session.id) == Some(id) {
                        if let Some(session) = active.take() {
                            session.wait().await;
                        }

                        if deadline.is_none() {
                            self.sink.idle();
                        }
                    }
                }

                event = events.recv() => match event {
                    Some(event) => {
                        debug!(paths = ?event.paths, "change detected");
                        deadline = Some(Instant::now() + delay);
                    }
                    None => {
                        debug!("filesystem watcher stopped");
                        break;
                    }
                },

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    deadline = None;

                    if let Some(previous) = active.take() {
                        debug!(id = previous.id, "superseding active upload");
                        previous.cancel_and_wait().await;
                    }

                    let context = match BuildContext::load_with_environment(
                        &self.source_dir,
                        &self.environment_name,
                    ) {
                        Ok(context) => context,
                        Err(err) => {
                            error!(%err, "unable to resolve build context");
                            self.sink.idle();
                            continue;
                        }
                    };

                    delay = context.environment().watch_delay;
                    next_id += 1;

                    active = Some(self.start(next_id, &stop, context, done_sender.clone()));
                }
            }
        }

        if let Some(session) = active.take() {
            session.cancel_and_wait().await;
        }
    }

    /// Spawn a new upload together with its result rendering.
    fn start(
        &self,
        id: u64,
        stop: &CancellationToken,
        context: BuildContext,
        done: mpsc::UnboundedSender<u64>,
    ) -> ActiveSession {
        let cancel = stop.child_token();
        let session = self.session.clone();
        let sink = self.sink.clone();

        let task = tokio::spawn({
            let cancel = cancel.clone();

            async move {
                let outcome = session.run_displayed(&cancel, &context, sink).await;
                report(id, &context, outcome);

                let _ = done.send(id);
            }
        });

        ActiveSession { id, cancel, task }
    }
}

/// Log how a background upload has ended.
fn report(id: u64, context: &BuildContext, outcome: Result<SessionOutcome, SessionError>) {
    let environment = &context.environment().name;

    match outcome {
        Ok(SessionOutcome::Completed) => info!(id, %environment, "upload completed"),
        Ok(SessionOutcome::Failed) => warn!(id, %environment, "remote build failed"),
        Ok(SessionOutcome::Cancelled) => debug!(id, %environment, "upload cancelled"),
        Err(err) => error!(id, %environment, %err, "upload failed"),
    }
}

/// Start watching the `source_dir` recursively.
///
/// Only eligible events are forwarded to the returned channel. The channel holds a
/// single event: if it is full, an upload is already pending and the event is dropped.
///
/// Dropping the returned watcher stops the watch and closes the channel.
pub(crate) fn spawn_fs_watcher(
    source_dir: &Path,
    matcher: IgnoreMatcher,
) -> Result<(RecommendedWatcher, mpsc::Receiver<Event>), notify::Error> {
    let (sender, receiver) = mpsc::channel(1);
    let mut filter = EventFilter::new(source_dir.to_path_buf(), matcher);

    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| match res {
            Ok(event) if filter.accept(&event) => {
                let _ = sender.try_send(event);
            }
            Ok(_) => {}
            Err(err) => warn!(%err, "filesystem watcher error"),
        },
        Config::default(),
    )?;
    watcher.watch(source_dir, RecursiveMode::Recursive)?;

    Ok((watcher, receiver))
}

/// Filesystem event filter that follows changes of the ignore file.
struct EventFilter {
    /// Watched directory.
    root: PathBuf,

    /// Current ignore rules.
    matcher: IgnoreMatcher,
}

impl EventFilter {
    /// Create new filter with the initially loaded `matcher`.
    fn new(root: PathBuf, matcher: IgnoreMatcher) -> Self {
        Self { root, matcher }
    }

    /// Check if the `event` should trigger an upload.
    ///
    /// Changes of the ignore file itself always trigger an upload, since they change the
    /// archive contents, and reload the rules used for the following events.
    fn accept(&mut self, event: &Event) -> bool {
        if matches!(event.kind, EventKind::Access(_)) {
            return false;
        }

        let touches_ignore_file = event.paths.iter().any(|path| {
            relative_path(path, &self.root)
                .map_or(false, |relative| relative == Path::new(IGNORE_FILE_NAME))
        });

        if touches_ignore_file {
            match IgnoreMatcher::from_root(&self.root) {
                Ok(matcher) => {
                    debug!(rules = matcher.len(), "ignore rules reloaded");
                    self.matcher = matcher;
                }
                Err(err) => warn!(%err, "unable to reload ignore rules, keeping previous ones"),
            }

            return true;
        }

        is_eligible_event(event, &self.root, &self.matcher)
    }
}

/// Check if the provided [`Event`] is eligible to be used as an upload trigger.
///
/// Access events are never eligible. Other events are eligible if at least one of their
/// paths lies inside of the `root` directory and is not excluded by the ignore rules.
fn is_eligible_event(event: &Event, root: &Path, matcher: &IgnoreMatcher) -> bool {
    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }

    event.paths.iter().any(|path| match relative_path(path, root) {
        Some(relative) => {
            !relative.as_os_str().is_empty() && !matcher.is_excluded(&relative, path.is_dir())
        }
        None => false,
    })
}

/// Path relative to the `root` directory, or [`None`] if the `path` lies outside of it.
fn relative_path(path: &Path, root: &Path) -> Option<PathBuf> {
    match path.strip_prefix(root) {
        Ok(relative) => Some(relative.to_path_buf()),
        Err(_) => path
            .canonicalize()
            .ok()
            .and_then(|path| path.strip_prefix(root).map(Path::to_path_buf).ok()),
    }
}
