//! Operator socket server.
//!
//! The operator CLI talks to the node over a Unix socket (mode 0600) using
//! length-prefixed JSON frames: a 4-byte big-endian body length followed by
//! one serialized [`IpcRequest`]. Each request gets exactly one
//! [`IpcResponse`] frame back; a connection may carry any number of
//! requests.
//!
//! # Handover
//!
//! During a self-update the successor binds the same path after it has been
//! committed, replacing the socket file. The predecessor must then not
//! remove the file on its way out, so [`OperatorSocket::cleanup`] only
//! unlinks the path while it still refers to the socket this instance
//! bound.

use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use adnode_core::ipc::{ErrorCode, FRAME_HEADER_LEN, IpcRequest, IpcResponse, MAX_FRAME_SIZE};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use crate::handlers::dispatch;
use crate::state::SharedState;

/// Operator socket mode.
const OPERATOR_SOCKET_MODE: u32 = 0o600;

/// Mode for socket directories this process creates.
const DIRECTORY_MODE: u32 = 0o700;

/// Codec for operator frames.
#[must_use]
pub fn operator_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(FRAME_HEADER_LEN)
        .max_frame_length(MAX_FRAME_SIZE)
        .big_endian()
        .new_codec()
}

/// Bound operator socket.
pub struct OperatorSocket {
    listener: UnixListener,
    path: PathBuf,
    identity: (u64, u64),
}

impl OperatorSocket {
    /// Binds the socket at `path`, replacing a stale socket file.
    ///
    /// # Errors
    ///
    /// Fails if the parent is a symlink or not a directory, if `path` exists
    /// and is not a socket, or if binding fails.
    pub fn bind(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            ensure_directory(parent)?;
        }
        cleanup_socket(path)?;

        let listener = UnixListener::bind(path).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("failed to bind operator socket to {}: {e}", path.display()),
            )
        })?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(OPERATOR_SOCKET_MODE))
            .map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!("failed to set socket permissions on {}: {e}", path.display()),
                )
            })?;
        let metadata = std::fs::symlink_metadata(path)?;

        info!(socket_path = %path.display(), "operator socket bound");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            identity: (metadata.dev(), metadata.ino()),
        })
    }

    /// Socket path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accepts connections until `shutdown` flips to `true`.
    pub async fn serve(&self, state: SharedState, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        tokio::spawn(handle_connection(stream, state.clone()));
                    },
                    Err(e) => warn!(error = %e, "operator accept failed"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                },
            }
        }
        debug!("operator socket stopped accepting");
    }

    /// Removes the socket file if it is still ours.
    pub fn cleanup(&self) {
        match std::fs::symlink_metadata(&self.path) {
            Ok(metadata) if (metadata.dev(), metadata.ino()) == self.identity => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    warn!(
                        socket_path = %self.path.display(),
                        error = %e,
                        "failed to remove operator socket"
                    );
                } else {
                    info!(socket_path = %self.path.display(), "removed operator socket file");
                }
            },
            Ok(_) => debug!(
                socket_path = %self.path.display(),
                "operator socket now belongs to a successor, leaving it"
            ),
            Err(_) => {},
        }
    }
}

impl Drop for OperatorSocket {
    fn drop(&mut self) {
        self.cleanup();
    }
}

async fn handle_connection(stream: UnixStream, state: SharedState) {
    let mut framed = Framed::new(stream, operator_codec());
    while let Some(frame) = framed.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "operator connection closed on bad frame");
                return;
            },
        };

        let (endpoint, response) = match serde_json::from_slice::<IpcRequest>(&frame) {
            Ok(request) => {
                let endpoint = request.endpoint();
                (endpoint, dispatch(request, &state).await)
            },
            Err(e) => (
                "invalid",
                IpcResponse::error(ErrorCode::InvalidRequest, format!("malformed request: {e}")),
            ),
        };
        let status = if matches!(response, IpcResponse::Error { .. }) {
            "error"
        } else {
            "ok"
        };
        state.metrics.operator_request(endpoint, status);

        let body = match serde_json::to_vec(&response) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "failed to encode operator response");
                return;
            },
        };
        if let Err(e) = framed.send(Bytes::from(body)).await {
            debug!(error = %e, "operator client went away");
            return;
        }
    }
}

fn ensure_directory(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(metadata) => {
            if metadata.file_type().is_symlink() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "{} is a symlink, refusing to use as socket directory",
                        path.display()
                    ),
                ));
            }
            if !metadata.is_dir() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists but is not a directory", path.display()),
                ));
            }
            // Existing directories keep their mode.
            Ok(())
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            std::fs::create_dir_all(path).map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!("failed to create directory {}: {e}", path.display()),
                )
            })?;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(DIRECTORY_MODE))
        },
        Err(e) => Err(io::Error::new(
            e.kind(),
            format!("failed to stat {}: {e}", path.display()),
        )),
    }
}

fn cleanup_socket(path: &Path) -> io::Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if !metadata.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("path {} exists but is not a socket", path.display()),
        ));
    }
    std::fs::remove_file(path)?;
    debug!(path = %path.display(), "removed stale socket file");
    Ok(())
}
