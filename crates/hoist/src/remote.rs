//! # Remote build service
//!
//! Remote build service accepts a project archive together with environment metadata,
//! and responds with an ordered sequence of progress frames, the last of which is terminal.
//!
//! The service is accessed through the [`Remote`] trait, which opens a [`Connection`]
//! per upload. Each connection is split into two halves, an [`Uplink`] sink used to send
//! the archive, and a stream of [`UploadResult`] frames, so that both can be driven
//! independently.

/// WebSocket remote implementation.
pub(crate) mod websocket;

use std::{collections::BTreeMap, io, pin::Pin};

use async_trait::async_trait;
use bytes::Bytes;
use derive_more::{Display, Error, From};
use futures_util::{Sink, Stream};
use serde::{Deserialize, Serialize};

pub(crate) use websocket::WebSocketRemote;

/// Transport-level errors.
#[derive(Debug, Display, From, Error)]
pub(crate) enum ConnectionError {
    /// IO-related error.
    Io(io::Error),

    /// WebSocket error.
    #[display(fmt = "websocket error: {}", _0)]
    WebSocket(tokio_tungstenite::tungstenite::Error),

    /// Frame could not be encoded or decoded.
    #[display(fmt = "malformed frame: {}", _0)]
    Json(serde_json::Error),

    /// Remote URL or credentials are not valid.
    #[display(fmt = "invalid remote configuration: {}", _0)]
    #[from(ignore)]
    InvalidRemote(#[error(not(source))] String),

    /// Remote closed the connection before sending a terminal frame.
    #[display(fmt = "remote closed the connection before the upload finished")]
    ClosedEarly,
}

/// Upload metadata sent before the archive.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub(crate) struct UploadRequest {
    /// Application name.
    pub app: String,

    /// Environment name.
    pub environment: String,

    /// Environment variables.
    pub variables: BTreeMap<String, String>,

    /// Archive size, in bytes.
    pub archive_size: u64,

    /// Hex-encoded blake2 hash of the archive.
    pub archive_hash: String,
}

/// Outgoing part of the upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Uplink {
    /// Archive bytes.
    Chunk(Bytes),

    /// The whole archive was sent.
    End,
}

/// Status carried by a single [`UploadResult`].
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub(crate) enum ResultStatus {
    /// Intermediate progress report.
    Progress,

    /// Build and deployment finished successfully.
    Completed,

    /// Remote build or deployment failed.
    Failed,
}

impl ResultStatus {
    /// Whether no more frames follow a frame with this status.
    pub(crate) fn is_terminal(self) -> bool {
        !matches!(self, ResultStatus::Progress)
    }
}

/// A single unit of remote progress.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub(crate) struct UploadResult {
    /// Result status.
    pub status: ResultStatus,

    /// Human-readable message.
    #[serde(default)]
    pub message: String,

    /// Optional structured payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

#[cfg(test)]
impl UploadResult {
    /// Create a progress result with the provided message.
    pub(crate) fn progress(message: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Progress,
            message: message.into(),
            payload: None,
        }
    }

    /// Create a terminal result with the provided status.
    pub(crate) fn terminal(status: ResultStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            payload: None,
        }
    }
}

/// Archive sink half of a [`Connection`].
pub(crate) type UplinkSink = Pin<Box<dyn Sink<Uplink, Error = ConnectionError> + Send>>;

/// Frame stream half of a [`Connection`].
pub(crate) type FrameStream =
    Pin<Box<dyn Stream<Item = Result<UploadResult, ConnectionError>> + Send>>;

/// Single upload connection.
pub(crate) struct Connection {
    /// Archive sink.
    pub uplink: UplinkSink,

    /// Ordered remote frames.
    pub frames: FrameStream,
}

/// Remote build service.
#[async_trait]
pub(crate) trait Remote: Send + Sync {
    /// Open a new upload connection, announcing the upcoming archive with `request`.
    async fn open(&self, request: &UploadRequest) -> Result<Connection, ConnectionError>;
}
