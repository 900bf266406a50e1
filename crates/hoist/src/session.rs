//! # Upload session
//!
//! A single upload goes through three phases:
//!
//! 1. The project directory is archived into a temporary file on the blocking thread pool.
//!    Nothing is sent to the remote until the archive is complete, so a failed walk
//!    never results in a partial upload.
//! 2. A connection to the remote is opened and the archive is streamed in fixed-size chunks.
//! 3. Remote frames are forwarded, in order, to the results channel until a terminal frame.
//!
//! The remote may reject an upload midway, sending a terminal frame and closing the
//! connection. Frames it sent before closing are still forwarded, so such a rejection is
//! reported as [`SessionOutcome::Failed`] rather than as a connection error.
//!
//! Each phase observes the session's [`CancellationToken`] at every suspension point:
//! before each archived entry, on each file read, before each sent chunk and while
//! waiting for each frame. Cancelled sessions stop within a single chunk send or file read.
//!
//! The results channel sender is owned by [`UploadSession::run`], so the channel is closed
//! whenever the session ends, regardless of the reason.

use std::{future::Future, sync::Arc, time::Duration};

use derive_more::{Display, Error, From};
use futures_util::{SinkExt, StreamExt};
use itertools::Itertools;
use tokio::sync::mpsc;
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use tracing::{debug, info};

use crate::{
    archiver::{build_archive_file, ArchiveError, ArchiveOptions, SymlinkPolicy},
    context::BuildContext,
    display::{self, ResultSink},
    ignore_file::IgnoreMatcher,
    remote::{
        Connection, ConnectionError, FrameStream, Remote, ResultStatus, UploadRequest, UploadResult,
        Uplink,
    },
};

/// How long to wait for remote frames after the remote stopped accepting the archive.
const REJECTION_FRAMES_TIMEOUT: Duration = Duration::from_secs(5);

/// Upload session errors.
#[derive(Debug, Display, From, Error)]
pub(crate) enum SessionError {
    /// Archive could not be created.
    #[display(fmt = "unable to create archive: {}", _0)]
    Archive(ArchiveError),

    /// Remote could not be reached or the transmission was interrupted.
    #[display(fmt = "connection error: {}", _0)]
    Connection(ConnectionError),

    /// Archiving task panicked.
    #[display(fmt = "archiving task failed: {}", _0)]
    Join(tokio::task::JoinError),
}

/// How a session that didn't fail mechanically has ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SessionOutcome {
    /// Remote reported a successful build and deployment.
    Completed,

    /// Remote reported a failed build or deployment.
    Failed,

    /// Session was cancelled before reaching a terminal state.
    Cancelled,
}

/// Session tuning.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SessionOptions {
    /// Size of a single archive chunk, in bytes.
    pub chunk_size: usize,

    /// Capacity of the results channel.
    pub results_buffer: usize,

    /// Archive creation options.
    pub archive: ArchiveOptions,
}

impl From<&common::config::Upload> for SessionOptions {
    fn from(config: &common::config::Upload) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            results_buffer: config.results_buffer.max(1),
            archive: ArchiveOptions {
                symlinks: if config.follow_symlinks {
                    SymlinkPolicy::Follow
                } else {
                    SymlinkPolicy::Preserve
                },
            },
        }
    }
}

/// Upload pipeline bound to a particular remote.
#[derive(Clone)]
pub(crate) struct UploadSession {
    /// Remote build service.
    remote: Arc<dyn Remote>,

    /// Session tuning.
    options: SessionOptions,
}

impl UploadSession {
    /// Create new upload session factory.
    pub(crate) fn new(remote: Arc<dyn Remote>, options: SessionOptions) -> Self {
        Self { remote, options }
    }

    /// Run a single upload, forwarding remote frames into `results`.
    ///
    /// Remote build failures are not errors: the failing frame is forwarded as a terminal
    /// result and [`SessionOutcome::Failed`] is returned.
    pub(crate) async fn run(
        &self,
        cancel: &CancellationToken,
        context: &BuildContext,
        results: mpsc::Sender<UploadResult>,
    ) -> Result<SessionOutcome, SessionError> {
        let environment = context.environment();

        info!(
            environment = %environment.name,
            source = %context.source_dir().display(),
            variables = %environment.variables.keys().join(","),
            "starting upload"
        );

        let root = context.source_dir().to_path_buf();
        let archive_cancel = cancel.clone();
        let archive_options = self.options.archive;

        let archive = tokio::task::spawn_blocking(move || {
            let matcher = IgnoreMatcher::from_root(&root)?;
            build_archive_file(&root, &matcher, archive_options, &archive_cancel)
        })
        .await?;

        let archive = match archive {
            Ok(archive) => archive,
            Err(ArchiveError::Cancelled) => return Ok(SessionOutcome::Cancelled),
            Err(err) => return Err(err.into()),
        };

        debug!(
            entries = archive.summary.entries,
            size = archive.summary.size,
            hash = %archive.hash,
            "archive created"
        );

        let request = UploadRequest {
            app: environment.app.clone(),
            environment: environment.name.clone(),
            variables: environment.variables.clone(),
            archive_size: archive.summary.size,
            archive_hash: archive.hash.clone(),
        };

        let Some(connection) = or_cancelled(cancel, self.remote.open(&request)).await else {
            return Ok(SessionOutcome::Cancelled);
        };

        let Connection {
            mut uplink,
            mut frames,
        } = connection?;

        let file = tokio::fs::File::from_std(archive.file.reopen().map_err(ArchiveError::from)?);
        let mut chunks = ReaderStream::with_capacity(file, self.options.chunk_size);

        loop {
            let Some(chunk) = or_cancelled(cancel, chunks.next()).await else {
                return Ok(SessionOutcome::Cancelled);
            };

            let uplink_item = match chunk {
                Some(chunk) => Uplink::Chunk(chunk.map_err(ArchiveError::from)?),
                None => Uplink::End,
            };

            let is_end = uplink_item == Uplink::End;

            let Some(sent) = or_cancelled(cancel, uplink.send(uplink_item)).await else {
                return Ok(SessionOutcome::Cancelled);
            };

            if let Err(err) = sent {
                // Remote may have rejected the upload with a terminal frame before closing.
                debug!(%err, "uplink failed, collecting frames already sent by the remote");

                let collected = tokio::time::timeout(
                    REJECTION_FRAMES_TIMEOUT,
                    forward_frames(cancel, &mut frames, &results),
                )
                .await;

                return match collected {
                    Ok(Ok(outcome)) => Ok(outcome),
                    Ok(Err(_)) | Err(_) => Err(err.into()),
                };
            }

            if is_end {
                break;
            }
        }

        debug!("archive sent, awaiting remote results");

        Ok(forward_frames(cancel, &mut frames, &results).await?)
    }

    /// Run a single upload while rendering its results into `sink`.
    ///
    /// Upload and rendering run concurrently, connected by a bounded channel. This method
    /// returns only after both have finished, so no result can be rendered afterwards.
    pub(crate) async fn run_displayed<S: ResultSink>(
        &self,
        cancel: &CancellationToken,
        context: &BuildContext,
        mut sink: S,
    ) -> Result<SessionOutcome, SessionError> {
        let (sender, receiver) = mpsc::channel(self.options.results_buffer);

        let (outcome, _) = tokio::join!(
            self.run(cancel, context, sender),
            display::drain(cancel, &context.environment().name, receiver, &mut sink),
        );

        outcome
    }
}

/// Forward remote `frames` into `results` until a terminal frame.
///
/// A frame stream that ends before the terminal frame is a [`ConnectionError::ClosedEarly`].
async fn forward_frames(
    cancel: &CancellationToken,
    frames: &mut FrameStream,
    results: &mpsc::Sender<UploadResult>,
) -> Result<SessionOutcome, ConnectionError> {
    loop {
        let Some(frame) = or_cancelled(cancel, frames.next()).await else {
            return Ok(SessionOutcome::Cancelled);
        };

        let frame = frame.ok_or(ConnectionError::ClosedEarly)??;
        let status = frame.status;

        match or_cancelled(cancel, results.send(frame)).await {
            Some(Ok(())) => {}
            Some(Err(_)) => {
                debug!("results receiver is gone, abandoning upload");
                return Ok(SessionOutcome::Cancelled);
            }
            None => return Ok(SessionOutcome::Cancelled),
        }

        if status.is_terminal() {
            return Ok(match status {
                ResultStatus::Failed => SessionOutcome::Failed,
                _ => SessionOutcome::Completed,
            });
        }
    }
}

/// Await the `future` unless `cancel` is triggered first.
///
/// Returns [`None`] if the cancellation happened first.
async fn or_cancelled<F: Future>(cancel: &CancellationToken, future: F) -> Option<F::Output> {
    tokio::select! {
        biased;

        _ = cancel.cancelled() => None,
        output = future => Some(output),
    }
}
