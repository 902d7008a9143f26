//! TLS accept loop with pause, drain and abort.
//!
//! Each accepted connection runs in its own task on the current
//! *generation*: a [`TaskTracker`] plus a drain token and an abort token.
//! Draining closes the generation, asks every connection for a graceful
//! HTTP shutdown and waits up to the grace period; whatever is left is
//! aborted. Resuming starts a fresh generation.
//!
//! Pausing stops calling `accept` but keeps the socket bound, so clients
//! arriving meanwhile wait in the kernel backlog instead of being refused.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use adnode_core::update::DrainReport;
use axum::Router;
use axum::extract::ConnectInfo;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, watch};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::EndpointError;

#[derive(Clone)]
struct Generation {
    tracker: TaskTracker,
    drain: CancellationToken,
    abort: CancellationToken,
}

impl Generation {
    fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
            drain: CancellationToken::new(),
            abort: CancellationToken::new(),
        }
    }
}

/// Accept switch and in-flight tracking for the HTTPS listener.
pub struct EndpointControl {
    accepting: watch::Sender<bool>,
    generation: Mutex<Generation>,
}

impl EndpointControl {
    /// Creates a control; `accepting` is the initial state.
    #[must_use]
    pub fn new(accepting: bool) -> Arc<Self> {
        let (tx, _) = watch::channel(accepting);
        Arc::new(Self {
            accepting: tx,
            generation: Mutex::new(Generation::new()),
        })
    }

    /// Whether the accept loop is taking connections.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        *self.accepting.borrow()
    }

    /// Stops accepting.
    pub fn pause(&self) {
        if self.accepting.send_replace(false) {
            info!("HTTPS accept paused");
        }
    }

    /// Starts or resumes accepting on a fresh generation.
    pub fn resume(&self) {
        {
            let mut generation = self
                .generation
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if generation.tracker.is_closed() {
                *generation = Generation::new();
            }
        }
        if !self.accepting.send_replace(true) {
            info!("HTTPS accept resumed");
        }
    }

    /// Connections currently being served.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.current().tracker.len()
    }

    /// Waits up to `grace` for connections to finish, then aborts the rest.
    pub async fn drain(&self, grace: Duration) -> DrainReport {
        let generation = self.current();
        let before = generation.tracker.len();
        generation.tracker.close();
        generation.drain.cancel();

        if tokio::time::timeout(grace, generation.tracker.wait())
            .await
            .is_ok()
        {
            debug!(completed = before, "drain finished within grace");
            return DrainReport {
                completed: before,
                aborted: 0,
            };
        }

        let remaining = generation.tracker.len();
        generation.abort.cancel();
        generation.tracker.wait().await;
        DrainReport {
            completed: before.saturating_sub(remaining),
            aborted: remaining,
        }
    }

    fn current(&self) -> Generation {
        self.generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.accepting.subscribe()
    }
}

/// Connection limits.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    /// Concurrent connections.
    pub max_connections: usize,
    /// Time allowed for the TLS handshake.
    pub handshake_timeout: Duration,
}

/// Binds the listening socket, mapping "address in use" to
/// [`EndpointError::PortInUse`].
///
/// # Errors
///
/// Returns an error if the address cannot be bound.
pub fn bind_listener(addr: SocketAddr) -> Result<std::net::TcpListener, EndpointError> {
    std::net::TcpListener::bind(addr).map_err(|source| {
        if source.kind() == std::io::ErrorKind::AddrInUse {
            EndpointError::PortInUse { addr }
        } else {
            EndpointError::Bind { addr, source }
        }
    })
}

/// The HTTPS endpoint.
pub struct SecureEndpoint {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    app: Router,
    control: Arc<EndpointControl>,
    limits: ConnectionLimits,
}

impl SecureEndpoint {
    /// Wraps a bound listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be registered with the
    /// runtime.
    pub fn new(
        listener: std::net::TcpListener,
        acceptor: TlsAcceptor,
        app: Router,
        control: Arc<EndpointControl>,
        limits: ConnectionLimits,
    ) -> Result<Self, EndpointError> {
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener: TcpListener::from_std(listener)?,
            acceptor,
            app,
            control,
            limits,
        })
    }

    /// Bound address.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, EndpointError> {
        Ok(self.listener.local_addr()?)
    }

    /// Listening socket descriptor.
    #[must_use]
    pub fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    /// Accepts connections until `shutdown` flips to `true`.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) {
        let mut accepting = self.control.subscribe();
        let permits = Arc::new(Semaphore::new(self.limits.max_connections.max(1)));
        info!(
            addr = ?self.listener.local_addr().ok(),
            accepting = *accepting.borrow(),
            "HTTPS endpoint serving"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            if !*accepting.borrow_and_update() {
                tokio::select! {
                    changed = accepting.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.spawn_connection(stream, peer, permit),
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        },
                    }
                }
                _ = accepting.changed() => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("HTTPS accept loop stopped");
    }

    fn spawn_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        let generation = self.control.current();
        let acceptor = self.acceptor.clone();
        let app = self.app.clone();
        let handshake_timeout = self.limits.handshake_timeout;

        generation.tracker.spawn(async move {
            let _permit = permit;
            let tls = match tokio::time::timeout(handshake_timeout, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => tls,
                Ok(Err(e)) => {
                    debug!(%peer, error = %e, "TLS handshake failed");
                    return;
                },
                Err(_) => {
                    debug!(%peer, "TLS handshake timed out");
                    return;
                },
            };

            let service = TowerToHyperService::new(app.layer(axum::Extension(ConnectInfo(peer))));
            let builder = auto::Builder::new(TokioExecutor::new());
            let conn = builder.serve_connection(TokioIo::new(tls), service);
            tokio::pin!(conn);

            tokio::select! {
                result = conn.as_mut() => {
                    if let Err(e) = result {
                        debug!(%peer, error = %e, "connection error");
                    }
                }
                () = generation.drain.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    tokio::select! {
                        result = conn.as_mut() => {
                            if let Err(e) = result {
                                debug!(%peer, error = %e, "connection error while draining");
                            }
                        }
                        () = generation.abort.cancelled() => {
                            debug!(%peer, "connection aborted past drain grace");
                        }
                    }
                }
            }
        });
    }
}
