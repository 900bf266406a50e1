use async_trait::async_trait;
use futures_util::{future, SinkExt, StreamExt};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
};
use tracing::debug;

use super::{Connection, ConnectionError, Remote, UploadRequest, UploadResult, Uplink};

/// Text frame that marks the end of the archive.
const ARCHIVE_END_FRAME: &str = r#"{"type":"archive_end"}"#;

/// Remote build service reachable over WebSocket.
///
/// The upload request is sent as the first text frame, followed by binary frames
/// with the archive contents and a single end-of-archive text frame. Every text frame
/// received from the service is parsed as an [`UploadResult`].
pub(crate) struct WebSocketRemote {
    /// Base service URL.
    url: String,

    /// Optional bearer token.
    token: Option<String>,
}

impl WebSocketRemote {
    /// Create new remote from a base URL, such as `wss://builds.example.com`.
    pub(crate) fn new(url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            url: url.into(),
            token,
        }
    }

    /// Upload endpoint URL.
    fn endpoint(&self) -> String {
        format!("{}/up", self.url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Remote for WebSocketRemote {
    async fn open(&self, request: &UploadRequest) -> Result<Connection, ConnectionError> {
        let endpoint = self.endpoint();

        let mut ws_request = endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectionError::InvalidRemote(format!("{endpoint}: {e}")))?;

        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| ConnectionError::InvalidRemote(String::from("malformed token")))?;

            ws_request.headers_mut().insert(AUTHORIZATION, value);
        }

        debug!(%endpoint, "connecting to remote");

        let (ws_stream, _) = connect_async(ws_request).await?;
        let (mut sink, stream) = ws_stream.split();

        sink.send(Message::Text(serde_json::to_string(request)?))
            .await?;

        let uplink = sink
            .sink_map_err(ConnectionError::from)
            .with(|item: Uplink| {
                future::ready(Ok::<_, ConnectionError>(match item {
                    Uplink::Chunk(bytes) => Message::Binary(bytes.to_vec()),
                    Uplink::End => Message::Text(String::from(ARCHIVE_END_FRAME)),
                }))
            });

        let frames = stream.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => {
                    Some(serde_json::from_str::<UploadResult>(&text).map_err(Into::into))
                }
                Ok(_) => None,
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    Some(Err(ConnectionError::ClosedEarly))
                }
                Err(err) => Some(Err(err.into())),
            })
        });

        Ok(Connection {
            uplink: Box::pin(uplink),
            frames: Box::pin(frames),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use bytes::Bytes;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    use super::{WebSocketRemote, ARCHIVE_END_FRAME};
    use crate::remote::{
        ConnectionError, Remote, ResultStatus, UploadRequest, UploadResult, Uplink,
    };

    fn request() -> UploadRequest {
        UploadRequest {
            app: String::from("shop"),
            environment: String::from("staging"),
            variables: BTreeMap::from([(String::from("KEY"), String::from("value"))]),
            archive_size: 6,
            archive_hash: String::from("00"),
        }
    }

    /// Accept a single connection, receive an upload and reply with `replies`.
    async fn serve_once(
        listener: TcpListener,
        replies: Vec<String>,
    ) -> (UploadRequest, Vec<u8>) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws_stream = tokio_tungstenite::accept_async(stream).await.unwrap();

        let request = match ws_stream.next().await.unwrap().unwrap() {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected message {other:?}"),
        };

        let mut archive = Vec::new();

        loop {
            match ws_stream.next().await.unwrap().unwrap() {
                Message::Binary(bytes) => archive.extend(bytes),
                Message::Text(text) if text == ARCHIVE_END_FRAME => break,
                other => panic!("unexpected message {other:?}"),
            }
        }

        for reply in replies {
            ws_stream.send(Message::Text(reply)).await.unwrap();
        }

        ws_stream.close(None).await.unwrap();

        (request, archive)
    }

    #[tokio::test]
    async fn upload_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let server = tokio::spawn(serve_once(
            listener,
            vec![
                String::from(r#"{"status":"progress","message":"Building"}"#),
                String::from(r#"{"status":"completed","message":"Deployed"}"#),
            ],
        ));

        let remote = WebSocketRemote::new(format!("ws://{address}/"), Some(String::from("t")));
        let mut connection = remote.open(&request()).await.unwrap();

        connection
            .uplink
            .send(Uplink::Chunk(Bytes::from_static(b"abc")))
            .await
            .unwrap();
        connection
            .uplink
            .send(Uplink::Chunk(Bytes::from_static(b"def")))
            .await
            .unwrap();
        connection.uplink.send(Uplink::End).await.unwrap();

        let mut frames = Vec::new();

        while let Some(frame) = connection.frames.next().await {
            let frame = frame.unwrap();
            let terminal = frame.status.is_terminal();
            frames.push(frame);

            if terminal {
                break;
            }
        }

        assert_eq!(
            frames,
            vec![
                UploadResult::progress("Building"),
                UploadResult::terminal(ResultStatus::Completed, "Deployed"),
            ]
        );

        let (received_request, archive) = server.await.unwrap();

        assert_eq!(received_request, request());
        assert_eq!(archive, b"abcdef");
    }

    #[tokio::test]
    async fn unreachable_remote_is_a_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let remote = WebSocketRemote::new(format!("ws://{address}"), None);

        assert!(matches!(
            remote.open(&request()).await,
            Err(ConnectionError::WebSocket(_))
        ));
    }
}
