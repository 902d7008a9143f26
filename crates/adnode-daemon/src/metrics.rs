//! Prometheus metrics for the node.
//!
//! # Metrics Families
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `adnode_attribution_total` | Counter | `outcome` |
//! | `adnode_forward_total` | Counter | `status` |
//! | `adnode_links_active` | Gauge | |
//! | `adnode_campaigns_rejected_total` | Counter | |
//! | `adnode_update_checks_total` | Counter | `result` |
//! | `adnode_operator_requests_total` | Counter | `endpoint`, `status` |
//! | `adnode_requests_in_flight` | Gauge | |
//!
//! Served as text on `127.0.0.1:<metrics_port>/metrics`; never on the public
//! HTTPS listener.

use std::net::SocketAddr;
use std::sync::Arc;

use adnode_core::attribution::ForwardState;
use adnode_core::forward::ForwardObserver;
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use thiserror::Error;
use tracing::{error, info};

/// Longest label value kept.
pub const MAX_LABEL_VALUE_LEN: usize = 64;

/// Default metrics port.
pub const DEFAULT_METRICS_PORT: u16 = 9105;

/// Metrics failures.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Registration failed.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Encoding failed.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Result type for metrics operations.
pub type MetricsResult<T> = Result<T, MetricsError>;

/// Node metrics. Cheap to clone; all handles share the same series.
#[derive(Clone)]
pub struct NodeMetrics {
    attribution_total: CounterVec,
    forward_total: CounterVec,
    links_active: Gauge,
    campaigns_rejected_total: Counter,
    update_checks_total: CounterVec,
    operator_requests_total: CounterVec,
    requests_in_flight: Gauge,
}

impl NodeMetrics {
    /// Registers the node metrics with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error on duplicate registration.
    pub fn new(registry: &Registry) -> MetricsResult<Self> {
        let attribution_total = CounterVec::new(
            Opts::new("adnode_attribution_total", "Visits handled by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(attribution_total.clone()))?;

        let forward_total = CounterVec::new(
            Opts::new(
                "adnode_forward_total",
                "Credit deliveries by final forward state",
            ),
            &["status"],
        )?;
        registry.register(Box::new(forward_total.clone()))?;

        let links_active = Gauge::new("adnode_links_active", "Active campaign links")?;
        registry.register(Box::new(links_active.clone()))?;

        let campaigns_rejected_total = Counter::new(
            "adnode_campaigns_rejected_total",
            "Backend campaigns skipped for an unusable landing page",
        )?;
        registry.register(Box::new(campaigns_rejected_total.clone()))?;

        let update_checks_total = CounterVec::new(
            Opts::new("adnode_update_checks_total", "Update checks by result"),
            &["result"],
        )?;
        registry.register(Box::new(update_checks_total.clone()))?;

        let operator_requests_total = CounterVec::new(
            Opts::new(
                "adnode_operator_requests_total",
                "Operator socket requests",
            ),
            &["endpoint", "status"],
        )?;
        registry.register(Box::new(operator_requests_total.clone()))?;

        let requests_in_flight = Gauge::new(
            "adnode_requests_in_flight",
            "HTTPS requests currently being served",
        )?;
        registry.register(Box::new(requests_in_flight.clone()))?;

        Ok(Self {
            attribution_total,
            forward_total,
            links_active,
            campaigns_rejected_total,
            update_checks_total,
            operator_requests_total,
            requests_in_flight,
        })
    }

    /// Counts one handled visit.
    pub fn attribution(&self, outcome: &str) {
        self.attribution_total
            .with_label_values(&[truncate_label(outcome)])
            .inc();
    }

    /// Visits counted with `outcome`.
    #[must_use]
    pub fn attribution_count(&self, outcome: &str) -> f64 {
        self.attribution_total
            .with_label_values(&[truncate_label(outcome)])
            .get()
    }

    /// Sets the active link gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_links_active(&self, count: usize) {
        self.links_active.set(count as f64);
    }

    /// Counts campaigns skipped by a sync pass.
    #[allow(clippy::cast_precision_loss)]
    pub fn campaigns_rejected(&self, count: usize) {
        if count > 0 {
            self.campaigns_rejected_total.inc_by(count as f64);
        }
    }

    /// Campaigns skipped so far.
    #[must_use]
    pub fn campaigns_rejected_count(&self) -> f64 {
        self.campaigns_rejected_total.get()
    }

    /// Counts one update check.
    pub fn update_check(&self, result: &str) {
        self.update_checks_total
            .with_label_values(&[truncate_label(result)])
            .inc();
    }

    /// Counts one operator request.
    pub fn operator_request(&self, endpoint: &str, status: &str) {
        self.operator_requests_total
            .with_label_values(&[truncate_label(endpoint), truncate_label(status)])
            .inc();
    }

    /// Operator requests counted for `endpoint` and `status`.
    #[must_use]
    pub fn operator_request_count(&self, endpoint: &str, status: &str) -> f64 {
        self.operator_requests_total
            .with_label_values(&[truncate_label(endpoint), truncate_label(status)])
            .get()
    }

    /// Marks a request as started; the gauge drops when the guard does.
    #[must_use]
    pub fn request_started(&self) -> InFlightGuard {
        self.requests_in_flight.inc();
        InFlightGuard {
            gauge: self.requests_in_flight.clone(),
        }
    }

    /// Requests currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> f64 {
        self.requests_in_flight.get()
    }
}

impl ForwardObserver for NodeMetrics {
    fn delivered(&self, state: ForwardState) {
        self.forward_total
            .with_label_values(&[state.as_str()])
            .inc();
    }
}

/// Decrements `adnode_requests_in_flight` on drop.
pub struct InFlightGuard {
    gauge: Gauge,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

/// Registry plus the node metrics registered in it.
pub struct MetricsRegistry {
    registry: Registry,
    node_metrics: NodeMetrics,
}

impl MetricsRegistry {
    /// Creates a registry with all node metrics.
    ///
    /// # Errors
    ///
    /// Returns an error if registration fails.
    pub fn new() -> MetricsResult<Self> {
        let registry = Registry::new();
        let node_metrics = NodeMetrics::new(&registry)?;
        Ok(Self {
            registry,
            node_metrics,
        })
    }

    /// The node metrics.
    #[must_use]
    pub const fn node_metrics(&self) -> &NodeMetrics {
        &self.node_metrics
    }

    /// Encodes all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_text(&self) -> MetricsResult<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

/// Shared metrics registry.
pub type SharedMetricsRegistry = Arc<MetricsRegistry>;

/// Creates a shared registry.
///
/// # Errors
///
/// Returns an error if registration fails.
pub fn new_shared_registry() -> MetricsResult<SharedMetricsRegistry> {
    Ok(Arc::new(MetricsRegistry::new()?))
}

/// Serves `/metrics` until the task is dropped.
///
/// # Errors
///
/// Returns an error if the address cannot be bound.
pub async fn serve_metrics(
    registry: SharedMetricsRegistry,
    addr: SocketAddr,
) -> anyhow::Result<()> {
    let handler = move || {
        let registry = Arc::clone(&registry);
        async move {
            match registry.encode_text() {
                Ok(body) => (
                    StatusCode::OK,
                    [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                    body,
                )
                    .into_response(),
                Err(e) => {
                    error!(error = %e, "failed to encode metrics");
                    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
                },
            }
        }
    };

    let app = Router::new().route("/metrics", get(handler));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "metrics server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn truncate_label(value: &str) -> &str {
    if value.len() <= MAX_LABEL_VALUE_LEN {
        return value;
    }
    let end = value
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= MAX_LABEL_VALUE_LEN)
        .last()
        .unwrap_or(0);
    &value[..end]
}
