use std::time::Duration;

use indicatif::ProgressBar;
use tokio::sync::mpsc::Receiver;
use tokio_util::sync::CancellationToken;

use crate::remote::{ResultStatus, UploadResult};

/// Destination of rendered upload results.
pub(crate) trait ResultSink: Send {
    /// Render a single result of an upload running under `environment`.
    fn render(&mut self, environment: &str, result: &UploadResult);

    /// Notify that no upload is running and new changes are awaited.
    fn idle(&mut self) {}
}

/// Drain upload results in arrival order, rendering each into the `sink`.
///
/// Returns when the results channel is closed and every buffered result was rendered,
/// or as soon as `cancel` is triggered while no result is immediately available.
///
/// Returns the status of the last rendered result.
pub(crate) async fn drain<S: ResultSink + ?Sized>(
    cancel: &CancellationToken,
    environment: &str,
    mut results: Receiver<UploadResult>,
    sink: &mut S,
) -> Option<ResultStatus> {
    let mut last_status = None;

    loop {
        let result = tokio::select! {
            biased;

            result = results.recv() => result,
            _ = cancel.cancelled() => None,
        };

        let Some(result) = result else {
            break;
        };

        sink.render(environment, &result);
        last_status = Some(result.status);
    }

    last_status
}

/// Terminal spinner that prints upload results above itself.
#[derive(Clone)]
pub(crate) struct ProgressDisplay {
    /// Underlying spinner.
    progress: ProgressBar,
}

impl ProgressDisplay {
    /// Create and start a new spinner.
    pub(crate) fn new() -> Self {
        let progress = ProgressBar::new_spinner();
        progress.enable_steady_tick(Duration::from_millis(150));
        progress.set_message("Uploading...");

        Self { progress }
    }

    /// Stop the spinner, leaving the final `message` on the screen.
    pub(crate) fn finish(&self, message: &'static str) {
        self.progress.finish_with_message(message);
    }
}

impl ResultSink for ProgressDisplay {
    fn render(&mut self, environment: &str, result: &UploadResult) {
        let mut line = match result.status {
            ResultStatus::Progress => format!("{environment} | {}", result.message),
            ResultStatus::Completed => format!("{environment} | completed: {}", result.message),
            ResultStatus::Failed => format!("{environment} | failed: {}", result.message),
        };

        if let Some(payload) = &result.payload {
            line.push(' ');
            line.push_str(&payload.to_string());
        }

        self.progress.println(line);

        match result.status {
            ResultStatus::Progress => self.progress.set_message("Building..."),
            ResultStatus::Completed => self.progress.set_message("Deployed."),
            ResultStatus::Failed => self.progress.set_message("Build failed."),
        }
    }

    fn idle(&mut self) {
        self.progress.set_message("Watching for changes...");
    }
}
