//! Operator socket client.
//!
//! Speaks the daemon's operator protocol: one JSON [`IpcRequest`] per frame,
//! answered by one JSON [`IpcResponse`]. Frames carry a 4-byte big-endian
//! length prefix and are capped at [`MAX_FRAME_SIZE`].

use std::fmt;
use std::io;
use std::path::Path;
use std::time::Duration;

use adnode_core::ipc::{ErrorCode, IpcError, IpcRequest, IpcResponse, MAX_FRAME_SIZE};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// An update check may drain and hand over before it answers.
pub const UPDATE_CHECK_TIMEOUT_SECS: u64 = 600;

/// Error type for operator client calls.
#[derive(Debug)]
pub enum ClientError {
    /// Transport or framing failure.
    Ipc(IpcError),
    /// The daemon answered with an error response.
    Node {
        /// Error code from the daemon.
        code: ErrorCode,
        /// Message from the daemon.
        message: String,
    },
    /// The daemon answered with a response of the wrong kind.
    UnexpectedResponse(String),
}

impl ClientError {
    /// Error code reported by the daemon, if the call got that far.
    pub const fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Node { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipc(e) => write!(f, "{e}"),
            Self::Node { code, message } => write!(f, "node error ({code:?}): {message}"),
            Self::UnexpectedResponse(kind) => write!(f, "unexpected response: {kind}"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Ipc(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IpcError> for ClientError {
    fn from(err: IpcError) -> Self {
        Self::Ipc(err)
    }
}

/// Codec matching the daemon's operator framing.
fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_SIZE)
        .big_endian()
        .new_codec()
}

/// Connection to a running node's operator socket.
pub struct OperatorClient {
    framed: Framed<UnixStream, LengthDelimitedCodec>,
    timeout: Duration,
}

impl OperatorClient {
    /// Connects with the default timeout.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::NodeNotRunning`] if the socket is absent or
    /// refuses the connection.
    pub async fn connect(socket_path: &Path) -> Result<Self, ClientError> {
        Self::connect_with_timeout(socket_path, Duration::from_secs(DEFAULT_TIMEOUT_SECS)).await
    }

    /// Connects with a custom timeout, applied to the connect and to each
    /// request.
    pub async fn connect_with_timeout(
        socket_path: &Path,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let not_running = || IpcError::NodeNotRunning(socket_path.display().to_string());
        if !socket_path.exists() {
            return Err(not_running().into());
        }

        let stream = tokio::time::timeout(timeout, UnixStream::connect(socket_path))
            .await
            .map_err(|_| IpcError::Timeout)?
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => not_running(),
                _ => IpcError::Io(e),
            })?;
        debug!(socket = %socket_path.display(), "connected to operator socket");

        Ok(Self {
            framed: Framed::new(stream, codec()),
            timeout,
        })
    }

    /// Overrides the per-request timeout.
    pub const fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Sends one request and waits for its response. Error responses are
    /// returned as [`ClientError::Node`].
    pub async fn call(&mut self, request: &IpcRequest) -> Result<IpcResponse, ClientError> {
        let body = serde_json::to_vec(request).map_err(IpcError::from)?;
        if body.len() > MAX_FRAME_SIZE {
            return Err(IpcError::FrameTooLarge(body.len()).into());
        }

        tokio::time::timeout(self.timeout, self.framed.send(Bytes::from(body)))
            .await
            .map_err(|_| IpcError::Timeout)?
            .map_err(IpcError::Io)?;

        let frame = tokio::time::timeout(self.timeout, self.framed.next())
            .await
            .map_err(|_| IpcError::Timeout)?
            .ok_or_else(|| IpcError::Protocol("connection closed".to_string()))?
            .map_err(IpcError::Io)?;

        match serde_json::from_slice(&frame).map_err(IpcError::from)? {
            IpcResponse::Error { code, message } => Err(ClientError::Node { code, message }),
            response => Ok(response),
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    use super::*;

    /// Answers each request on one connection using `reply`.
    fn serve_once(
        listener: UnixListener,
        reply: impl Fn(IpcRequest) -> IpcResponse + Send + 'static,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, codec());
            while let Some(Ok(frame)) = framed.next().await {
                let request: IpcRequest = serde_json::from_slice(&frame).unwrap();
                let response = serde_json::to_vec(&reply(request)).unwrap();
                framed.send(Bytes::from(response)).await.unwrap();
            }
        })
    }

    #[tokio::test]
    async fn missing_socket_reports_node_not_running() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("operator.sock");
        let err = OperatorClient::connect(&path).await.err().unwrap();
        assert!(matches!(err, ClientError::Ipc(IpcError::NodeNotRunning(_))));
        assert!(err.to_string().contains("not running"));
    }

    #[tokio::test]
    async fn stale_socket_file_reports_node_not_running() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("operator.sock");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());

        let err = OperatorClient::connect(&path).await.err().unwrap();
        assert!(matches!(err, ClientError::Ipc(IpcError::NodeNotRunning(_))));
    }

    #[tokio::test]
    async fn error_responses_surface_their_code() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("operator.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = serve_once(listener, |request| match request {
            IpcRequest::Ping => IpcResponse::Pong {
                version: "1.2.3".into(),
                uptime_secs: 5,
            },
            _ => IpcResponse::error(ErrorCode::NotFound, "no such code"),
        });

        let mut client = OperatorClient::connect(&path).await.unwrap();
        assert_eq!(
            client.call(&IpcRequest::Ping).await.unwrap(),
            IpcResponse::Pong {
                version: "1.2.3".into(),
                uptime_secs: 5
            }
        );
        let err = client
            .call(&IpcRequest::ConsumeCode {
                code: "000000".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::NotFound));

        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn silent_node_times_out() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("operator.sock");
        let _listener = UnixListener::bind(&path).unwrap();

        let mut client = OperatorClient::connect_with_timeout(&path, Duration::from_millis(100))
            .await
            .unwrap();
        let err = client.call(&IpcRequest::Status).await.unwrap_err();
        assert!(matches!(err, ClientError::Ipc(IpcError::Timeout)));
    }
}
