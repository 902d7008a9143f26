//! Shared node state.

use std::sync::Arc;

use adnode_core::attribution::AttributionEngine;
use adnode_core::config::NodeConfig;
use adnode_core::forward::Forwarder;
use adnode_core::link::LinkRegistry;
use adnode_core::operator::OperatorChannel;
use adnode_core::store::NodeStore;
use adnode_core::update::UpdateSupervisor;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::endpoint::EndpointControl;
use crate::metrics::NodeMetrics;

/// Shared handle to the node.
pub type SharedState = Arc<NodeState>;

/// Everything the operator socket and the background loops reach into.
pub struct NodeState {
    /// Loaded configuration.
    pub config: Arc<NodeConfig>,
    /// Durable store.
    pub store: Arc<NodeStore>,
    /// Link registry.
    pub registry: Arc<LinkRegistry>,
    /// Attribution engine.
    pub engine: Arc<AttributionEngine>,
    /// Operator command surface.
    pub operator: OperatorChannel,
    /// Credit forwarder.
    pub forwarder: Arc<Forwarder>,
    /// Update supervisor, absent when updates are disabled.
    pub supervisor: Option<Arc<UpdateSupervisor>>,
    /// HTTPS accept control.
    pub endpoint: Arc<EndpointControl>,
    /// Metrics.
    pub metrics: NodeMetrics,
    shutdown: watch::Sender<bool>,
    started_at: DateTime<Utc>,
}

/// Components [`NodeState::new`] assembles.
pub struct NodeParts {
    /// Loaded configuration.
    pub config: Arc<NodeConfig>,
    /// Durable store.
    pub store: Arc<NodeStore>,
    /// Link registry.
    pub registry: Arc<LinkRegistry>,
    /// Attribution engine.
    pub engine: Arc<AttributionEngine>,
    /// Operator command surface.
    pub operator: OperatorChannel,
    /// Credit forwarder.
    pub forwarder: Arc<Forwarder>,
    /// Update supervisor.
    pub supervisor: Option<Arc<UpdateSupervisor>>,
    /// HTTPS accept control.
    pub endpoint: Arc<EndpointControl>,
    /// Metrics.
    pub metrics: NodeMetrics,
}

impl NodeState {
    /// Wraps the assembled parts.
    #[must_use]
    pub fn new(parts: NodeParts) -> SharedState {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config: parts.config,
            store: parts.store,
            registry: parts.registry,
            engine: parts.engine,
            operator: parts.operator,
            forwarder: parts.forwarder,
            supervisor: parts.supervisor,
            endpoint: parts.endpoint,
            metrics: parts.metrics,
            shutdown,
            started_at: Utc::now(),
        })
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Requests shutdown of every loop watching [`Self::shutdown_signal`].
    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Flips to `true` on shutdown.
    #[must_use]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Seconds since start.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn uptime_secs(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }
}
