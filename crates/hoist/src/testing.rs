//! Test doubles for the remote build service and result rendering.

use std::{
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::{future, sink, stream};
use tokio::sync::Notify;

use crate::{
    display::ResultSink,
    remote::{
        Connection, ConnectionError, FrameStream, Remote, UploadRequest, UploadResult, Uplink,
        UplinkSink,
    },
};

/// Scripted remote behaviour for a single connection.
pub(crate) enum Reply {
    /// Send the provided frames after the archive, then close the connection.
    Frames(Vec<UploadResult>),

    /// Keep sending progress frames with the provided interval, never finishing.
    Endless {
        /// Delay between two frames.
        interval: Duration,
    },

    /// Accept the archive, then never respond.
    Silent,

    /// Refuse the connection.
    Refuse,

    /// Fail every archive chunk, with the provided frames already sent by the remote.
    Rejecting(Vec<UploadResult>),

    /// Accept the connection, but never finish sending any archive chunk.
    StalledUplink,
}

/// Received upload request together with the archive bytes.
pub(crate) type Upload = (UploadRequest, Vec<u8>);

/// In-memory remote that responds according to a script.
pub(crate) struct ScriptedRemote {
    /// Reply for the n-th (starting from 1) connection.
    script: Box<dyn Fn(usize) -> Reply + Send + Sync>,

    /// Amount of connection attempts.
    opens: AtomicUsize,

    /// Fully received uploads.
    uploads: Arc<Mutex<Vec<Upload>>>,

    /// Notified whenever an upload is fully received.
    received: Arc<Notify>,
}

impl ScriptedRemote {
    /// Create new remote, where `script` decides how to respond to the n-th connection.
    pub(crate) fn new<F>(script: F) -> Self
    where
        F: Fn(usize) -> Reply + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            opens: AtomicUsize::new(0),
            uploads: Arc::new(Mutex::new(Vec::new())),
            received: Arc::new(Notify::new()),
        }
    }

    /// Amount of connection attempts so far.
    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Fully received uploads so far.
    pub(crate) fn uploads(&self) -> Vec<Upload> {
        self.uploads.lock().unwrap().clone()
    }

    /// Wait until at least `count` uploads are fully received.
    pub(crate) async fn wait_for_archive(&self, count: usize) {
        loop {
            let notified = self.received.notified();

            if self.uploads.lock().unwrap().len() >= count {
                return;
            }

            notified.await;
        }
    }
}

#[async_trait]
impl Remote for ScriptedRemote {
    async fn open(&self, request: &UploadRequest) -> Result<Connection, ConnectionError> {
        let session = self.opens.fetch_add(1, Ordering::SeqCst) + 1;

        let (uplink, frames): (UplinkSink, FrameStream) = match (self.script)(session) {
            Reply::Refuse => {
                return Err(ConnectionError::Io(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "connection refused",
                )))
            }
            Reply::Frames(frames) => (self.recording_uplink(request), frames_of(frames)),
            Reply::Endless { interval } => (
                self.recording_uplink(request),
                endless_frames(session, interval),
            ),
            Reply::Silent => (self.recording_uplink(request), no_frames()),
            Reply::Rejecting(frames) => (rejecting_uplink(), frames_of(frames)),
            Reply::StalledUplink => (stalled_uplink(), no_frames()),
        };

        Ok(Connection { uplink, frames })
    }
}

/// Frame stream yielding `frames`, then ending.
fn frames_of(frames: Vec<UploadResult>) -> FrameStream {
    Box::pin(stream::iter(frames.into_iter().map(Ok::<_, ConnectionError>)))
}

/// Progress frames of the `session`, one per `interval`, never ending.
fn endless_frames(session: usize, interval: Duration) -> FrameStream {
    Box::pin(stream::unfold(1usize, move |frame| async move {
        tokio::time::sleep(interval).await;

        let result = UploadResult::progress(format!("session {session} frame {frame}"));
        Some((Ok::<_, ConnectionError>(result), frame + 1))
    }))
}

/// Frame stream that never yields.
fn no_frames() -> FrameStream {
    Box::pin(stream::pending::<Result<UploadResult, ConnectionError>>())
}

/// Uplink failing on every chunk, as if the remote has closed the connection.
fn rejecting_uplink() -> UplinkSink {
    Box::pin(sink::unfold((), |(), _: Uplink| {
        future::ready(Err::<(), _>(ConnectionError::ClosedEarly))
    }))
}

/// Uplink that never finishes sending the first chunk.
fn stalled_uplink() -> UplinkSink {
    Box::pin(sink::unfold((), |(), _: Uplink| {
        future::pending::<Result<(), ConnectionError>>()
    }))
}

impl ScriptedRemote {
    /// Uplink that stores the received archive once it is complete.
    fn recording_uplink(&self, request: &UploadRequest) -> UplinkSink {
        let state = (
            request.clone(),
            Vec::new(),
            self.uploads.clone(),
            self.received.clone(),
        );

        Box::pin(sink::unfold(
            state,
            |(request, mut archive, uploads, received), item| async move {
                match item {
                    Uplink::Chunk(bytes) => archive.extend_from_slice(&bytes),
                    Uplink::End => {
                        uploads
                            .lock()
                            .unwrap()
                            .push((request.clone(), std::mem::take(&mut archive)));
                        received.notify_waiters();
                    }
                }

                Ok::<_, ConnectionError>((request, archive, uploads, received))
            },
        ))
    }
}

/// Result sink that records everything it renders.
#[derive(Clone, Default)]
pub(crate) struct RecordingSink {
    /// Rendered results together with their environment names.
    results: Arc<Mutex<Vec<(String, UploadResult)>>>,

    /// Amount of idle notifications.
    idles: Arc<AtomicUsize>,
}

impl RecordingSink {
    /// Messages of rendered results, in rendering order.
    pub(crate) fn messages(&self) -> Vec<String> {
        self.results
            .lock()
            .unwrap()
            .iter()
            .map(|(_, result)| result.message.clone())
            .collect()
    }

    /// Environment names of rendered results, in rendering order.
    pub(crate) fn environments(&self) -> Vec<String> {
        self.results
            .lock()
            .unwrap()
            .iter()
            .map(|(environment, _)| environment.clone())
            .collect()
    }

    /// Amount of idle notifications.
    pub(crate) fn idles(&self) -> usize {
        self.idles.load(Ordering::SeqCst)
    }
}

impl ResultSink for RecordingSink {
    fn render(&mut self, environment: &str, result: &UploadResult) {
        self.results
            .lock()
            .unwrap()
            .push((environment.to_string(), result.clone()));
    }

    fn idle(&mut self) {
        self.idles.fetch_add(1, Ordering::SeqCst);
    }
}
