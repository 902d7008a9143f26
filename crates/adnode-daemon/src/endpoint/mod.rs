//! The public HTTPS surface.
//!
//! One TLS listener on a fixed port. [`server`] owns accepting, pausing and
//! draining; [`routes`] maps requests to the attribution engine and the
//! two-factor book; [`tls`] loads the provisioned certificate.

pub mod routes;
pub mod server;
pub mod tls;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use adnode_core::store::NodeStore;
use adnode_core::update::{DrainReport, ServingControl, UpdateError};
use async_trait::async_trait;
use thiserror::Error;

pub use self::routes::{AppState, RedirectPolicy, router};
pub use self::server::{ConnectionLimits, EndpointControl, SecureEndpoint, bind_listener};
pub use self::tls::{TlsError, load_acceptor, load_certificates};

/// Endpoint failures.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// Another process holds the port.
    #[error("port {addr} is already bound by another process")]
    PortInUse {
        /// Requested address.
        addr: SocketAddr,
    },

    /// Binding failed for another reason.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// TLS setup failed.
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// Socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The serving stack as the update supervisor drives it.
pub struct EndpointServing {
    control: Arc<EndpointControl>,
    store: Arc<NodeStore>,
}

impl EndpointServing {
    /// Creates the adapter.
    #[must_use]
    pub const fn new(control: Arc<EndpointControl>, store: Arc<NodeStore>) -> Self {
        Self { control, store }
    }
}

#[async_trait]
impl ServingControl for EndpointServing {
    fn pause_accepting(&self) {
        self.control.pause();
    }

    fn resume_accepting(&self) {
        self.control.resume();
    }

    async fn drain(&self, grace: Duration) -> DrainReport {
        self.control.drain(grace).await
    }

    async fn flush(&self) -> Result<(), UpdateError> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.flush())
            .await
            .map_err(|e| UpdateError::Flush(e.to_string()))?
            .map_err(|e| UpdateError::Flush(e.to_string()))
    }
}
