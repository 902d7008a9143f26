//! In-place process handover.
//!
//! A self-update never drops the public port. The running node (the
//! predecessor) starts the staged binary with two descriptors left open
//! across `exec`: the bound TLS listener and the instance lock. Their
//! numbers travel in environment variables. The successor connects back
//! over a private Unix socket and reports readiness once it has loaded its
//! configuration, state and certificate; it does not accept a single
//! connection until the predecessor answers `commit`.
//!
//! ```text
//! predecessor                         successor
//!     | spawn (fds + env) ------------------> |
//!     |                                       | load config, store, TLS
//!     | <------------------ {"type":"ready"}  |
//!     | {"type":"commit"} ------------------> |
//!     | <-------------- {"type":"committed"}  |
//!     | exit without unlocking                | serve
//! ```
//!
//! If readiness does not arrive within the health timeout the predecessor
//! sends `abort`, kills the successor and resumes serving.

use std::ffi::OsString;
use std::net::TcpListener;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use adnode_core::lock::{LockError, NodeInstanceLock, set_inheritable};
use adnode_core::update::{LaunchedInstance, Launcher, UpdateError, Version};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use nix::fcntl::{FcntlArg, fcntl};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio::process::{Child, Command};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};

/// Descriptor number of the inherited TLS listener.
pub const ENV_LISTEN_FD: &str = "ADNODE_HANDOVER_LISTEN_FD";
/// Descriptor number of the inherited instance lock.
pub const ENV_LOCK_FD: &str = "ADNODE_HANDOVER_LOCK_FD";
/// Path of the readiness socket.
pub const ENV_HANDOVER_SOCKET: &str = "ADNODE_HANDOVER_SOCKET";

const MAX_MESSAGE_LEN: usize = 4096;

/// How long either side waits for the other's next message once connected.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Messages on the readiness socket, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandoverMessage {
    /// Successor loaded everything and waits for the decision.
    Ready {
        /// Successor PID.
        pid: u32,
        /// Successor version.
        version: String,
    },
    /// Successor may start serving.
    Commit,
    /// Successor must exit without serving.
    Abort,
    /// Successor acknowledges the commit.
    Committed,
}

/// Handover failures.
#[derive(Debug, Error)]
pub enum HandoverError {
    /// Socket or descriptor error.
    #[error("handover I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A handover variable is set but unusable.
    #[error("invalid handover descriptor {name}: {reason}")]
    Descriptor {
        /// Variable name.
        name: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// The inherited lock does not hold the lock.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The peer sent something unexpected or went away.
    #[error("handover protocol error: {0}")]
    Protocol(String),

    /// The peer did not answer in time.
    #[error("handover peer did not answer within {0:?}")]
    Timeout(Duration),
}

// =============================================================================
// Predecessor side
// =============================================================================

/// Launches staged binaries with the listener and lock inherited.
pub struct ProcessLauncher {
    args: Vec<OsString>,
    listen_fd: RawFd,
    lock_fd: RawFd,
    socket_path: PathBuf,
}

impl ProcessLauncher {
    /// Creates a launcher that starts successors with `args`.
    ///
    /// `listen_fd` and `lock_fd` must stay open for the life of the
    /// launcher.
    #[must_use]
    pub const fn new(
        args: Vec<OsString>,
        listen_fd: RawFd,
        lock_fd: RawFd,
        socket_path: PathBuf,
    ) -> Self {
        Self {
            args,
            listen_fd,
            lock_fd,
            socket_path,
        }
    }

    fn spawn(&self, artifact: &Path) -> std::io::Result<Child> {
        set_inheritable(self.listen_fd, true)?;
        set_inheritable(self.lock_fd, true)?;
        let spawned = Command::new(artifact)
            .args(&self.args)
            .env(ENV_LISTEN_FD, self.listen_fd.to_string())
            .env(ENV_LOCK_FD, self.lock_fd.to_string())
            .env(ENV_HANDOVER_SOCKET, &self.socket_path)
            .stdin(Stdio::null())
            .spawn();
        let restored = set_inheritable(self.listen_fd, false)
            .and_then(|()| set_inheritable(self.lock_fd, false));
        let child = spawned?;
        restored?;
        Ok(child)
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(
        &self,
        artifact: &Path,
        version: &Version,
    ) -> Result<Box<dyn LaunchedInstance>, UpdateError> {
        let listener = bind_handover_socket(&self.socket_path)
            .map_err(|e| UpdateError::LaunchFailed(e.to_string()))?;
        let child = self
            .spawn(artifact)
            .map_err(|e| UpdateError::LaunchFailed(format!("{}: {e}", artifact.display())))?;
        info!(
            version = %version,
            pid = child.id(),
            path = %artifact.display(),
            "successor launched"
        );
        Ok(Box::new(SuccessorProcess {
            child,
            listener,
            socket_path: self.socket_path.clone(),
            channel: None,
        }))
    }
}

fn bind_handover_socket(path: &Path) -> std::io::Result<UnixListener> {
    match std::fs::symlink_metadata(path) {
        Ok(metadata) if metadata.file_type().is_socket() => std::fs::remove_file(path)?,
        Ok(_) => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("path {} exists but is not a socket", path.display()),
            ));
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => return Err(e),
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    UnixListener::bind(path)
}

struct SuccessorProcess {
    child: Child,
    listener: UnixListener,
    socket_path: PathBuf,
    channel: Option<Framed<UnixStream, LinesCodec>>,
}

impl SuccessorProcess {
    async fn stop(&mut self) {
        if let Some(channel) = self.channel.as_mut() {
            let _ = send(channel, &HandoverMessage::Abort).await;
        }
        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "successor already gone");
        }
        let _ = self.child.wait().await;
    }
}

impl Drop for SuccessorProcess {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

#[async_trait]
impl LaunchedInstance for SuccessorProcess {
    async fn await_ready(&mut self) -> Result<(), UpdateError> {
        let stream = tokio::select! {
            accepted = self.listener.accept() => accepted
                .map(|(stream, _)| stream)
                .map_err(|e| UpdateError::HealthCheckFailed(e.to_string()))?,
            status = self.child.wait() => {
                let reason = status.map_or_else(|e| e.to_string(), |s| s.to_string());
                return Err(UpdateError::HealthCheckFailed(format!(
                    "successor exited before reporting readiness ({reason})"
                )));
            },
        };
        let channel = self
            .channel
            .insert(Framed::new(stream, LinesCodec::new_with_max_length(MAX_MESSAGE_LEN)));
        match recv(channel).await {
            Ok(HandoverMessage::Ready { pid, version }) => {
                info!(pid, version = %version, "successor reported ready");
                Ok(())
            },
            Ok(other) => Err(UpdateError::HealthCheckFailed(format!(
                "unexpected message {other:?}"
            ))),
            Err(e) => Err(UpdateError::HealthCheckFailed(e.to_string())),
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), UpdateError> {
        let mut this = self;
        let result = match this.channel.as_mut() {
            None => Err(HandoverError::Protocol("commit before readiness".into())),
            Some(channel) => match send(channel, &HandoverMessage::Commit).await {
                Ok(()) => recv(channel).await.and_then(|reply| match reply {
                    HandoverMessage::Committed => Ok(()),
                    other => Err(HandoverError::Protocol(format!(
                        "expected committed, got {other:?}"
                    ))),
                }),
                Err(e) => Err(e),
            },
        };
        if let Err(e) = result {
            this.stop().await;
            return Err(UpdateError::Commit(e.to_string()));
        }
        // The successor now owns the port; it is not our child to reap.
        Ok(())
    }

    async fn abort(self: Box<Self>) {
        let mut this = self;
        warn!(pid = this.child.id(), "aborting successor");
        this.stop().await;
    }
}

// =============================================================================
// Successor side
// =============================================================================

/// Resources inherited from a predecessor.
pub struct Inherited {
    /// The bound TLS listener.
    pub listener: TcpListener,
    /// The instance lock.
    pub lock: NodeInstanceLock,
    /// Readiness channel back to the predecessor.
    pub channel: ReadinessChannel,
}

/// Decision the predecessor sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Take over serving.
    Commit,
    /// Exit without serving.
    Abort,
}

impl Inherited {
    /// Picks up inherited resources if this process was started by a
    /// predecessor. Returns `None` for an ordinary start.
    ///
    /// # Errors
    ///
    /// Fails if the handover variables are set but the descriptors are
    /// closed, or if the lock descriptor does not hold the lock.
    pub async fn from_env(lock_path: &Path) -> Result<Option<Self>, HandoverError> {
        let Some(socket_path) = std::env::var_os(ENV_HANDOVER_SOCKET) else {
            return Ok(None);
        };
        let listen_fd = inherited_fd(ENV_LISTEN_FD)?;
        let lock_fd = inherited_fd(ENV_LOCK_FD)?;

        let listener = TcpListener::from(listen_fd);
        set_inheritable(std::os::fd::AsRawFd::as_raw_fd(&listener), false)?;
        let lock = NodeInstanceLock::adopt_inherited(lock_fd, lock_path)?;
        let stream = UnixStream::connect(PathBuf::from(socket_path)).await?;

        Ok(Some(Self {
            listener,
            lock,
            channel: ReadinessChannel {
                framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_MESSAGE_LEN)),
            },
        }))
    }
}

fn inherited_fd(name: &'static str) -> Result<OwnedFd, HandoverError> {
    let descriptor = |reason: String| HandoverError::Descriptor { name, reason };
    let value = std::env::var(name).map_err(|_| descriptor("not set".into()))?;
    let fd: RawFd = value
        .parse()
        .map_err(|_| descriptor(format!("'{value}' is not a descriptor number")))?;
    if fd < 3 {
        return Err(descriptor(format!("{fd} is a standard stream")));
    }
    fcntl(fd, FcntlArg::F_GETFD).map_err(|e| descriptor(format!("{fd} is not open: {e}")))?;
    #[allow(unsafe_code)]
    // SAFETY: the predecessor left `fd` open for us, F_GETFD confirmed it is
    // a live descriptor, and nothing else in this process refers to it.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    Ok(owned)
}

/// Successor end of the readiness socket.
pub struct ReadinessChannel {
    framed: Framed<UnixStream, LinesCodec>,
}

impl ReadinessChannel {
    /// Reports readiness and waits for the predecessor's decision.
    ///
    /// # Errors
    ///
    /// Fails if the predecessor goes away or answers out of protocol.
    pub async fn report_ready(&mut self, version: &Version) -> Result<Decision, HandoverError> {
        send(
            &mut self.framed,
            &HandoverMessage::Ready {
                pid: std::process::id(),
                version: version.to_string(),
            },
        )
        .await?;
        match recv(&mut self.framed).await? {
            HandoverMessage::Commit => Ok(Decision::Commit),
            HandoverMessage::Abort => Ok(Decision::Abort),
            other => Err(HandoverError::Protocol(format!(
                "expected a decision, got {other:?}"
            ))),
        }
    }

    /// Acknowledges a commit.
    ///
    /// # Errors
    ///
    /// Fails if the predecessor has gone away.
    pub async fn confirm(mut self) -> Result<(), HandoverError> {
        send(&mut self.framed, &HandoverMessage::Committed).await
    }
}

async fn send(
    framed: &mut Framed<UnixStream, LinesCodec>,
    message: &HandoverMessage,
) -> Result<(), HandoverError> {
    let line = serde_json::to_string(message)
        .map_err(|e| HandoverError::Protocol(e.to_string()))?;
    framed
        .send(line)
        .await
        .map_err(|e| HandoverError::Protocol(e.to_string()))
}

async fn recv(
    framed: &mut Framed<UnixStream, LinesCodec>,
) -> Result<HandoverMessage, HandoverError> {
    let line = tokio::time::timeout(EXCHANGE_TIMEOUT, framed.next())
        .await
        .map_err(|_| HandoverError::Timeout(EXCHANGE_TIMEOUT))?
        .ok_or_else(|| HandoverError::Protocol("peer closed the channel".into()))?
        .map_err(|e| HandoverError::Protocol(e.to_string()))?;
    serde_json::from_str(&line).map_err(|e| HandoverError::Protocol(format!("{e}: {line}")))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn messages_are_tagged_json() {
        let ready = HandoverMessage::Ready {
            pid: 42,
            version: "1.2.0".into(),
        };
        let json = serde_json::to_string(&ready).unwrap();
        assert_eq!(json, r#"{"type":"ready","pid":42,"version":"1.2.0"}"#);
        assert_eq!(
            serde_json::from_str::<HandoverMessage>(r#"{"type":"commit"}"#).unwrap(),
            HandoverMessage::Commit
        );
    }

    #[tokio::test]
    async fn readiness_exchange_commits() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("handover.sock");
        let listener = bind_handover_socket(&path).unwrap();

        let successor = tokio::spawn({
            let path = path.clone();
            async move {
                let stream = UnixStream::connect(&path).await.unwrap();
                let mut channel = ReadinessChannel {
                    framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_MESSAGE_LEN)),
                };
                let decision = channel
                    .report_ready(&Version::parse("2.0.0").unwrap())
                    .await
                    .unwrap();
                channel.confirm().await.unwrap();
                decision
            }
        });

        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_MESSAGE_LEN));
        match recv(&mut framed).await.unwrap() {
            HandoverMessage::Ready { version, .. } => assert_eq!(version, "2.0.0"),
            other => panic!("unexpected {other:?}"),
        }
        send(&mut framed, &HandoverMessage::Commit).await.unwrap();
        assert_eq!(recv(&mut framed).await.unwrap(), HandoverMessage::Committed);
        assert_eq!(successor.await.unwrap(), Decision::Commit);
    }

    #[tokio::test]
    async fn successor_that_never_reports_fails_health_check() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("handover.sock");

        // `true` exits at once without connecting back.
        let child = Command::new("true").spawn().unwrap();
        let mut successor = SuccessorProcess {
            child,
            listener: bind_handover_socket(&path).unwrap(),
            socket_path: path.clone(),
            channel: None,
        };
        let err = successor.await_ready().await.unwrap_err();
        assert!(matches!(err, UpdateError::HealthCheckFailed(_)), "{err}");
        Box::new(successor).abort().await;
    }
}
