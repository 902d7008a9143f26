//! Background loops: campaign sync and forward reconciliation.

use std::sync::Arc;
use std::time::Duration;

use adnode_core::forward::{CampaignDirectory, Forwarder};
use adnode_core::link::{LinkRegistry, SyncReport};
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::metrics::NodeMetrics;

/// Pulls the active campaign list and reconciles links against it, then
/// regenerates links whose TTL has passed. Skipped campaigns are counted in
/// `metrics`.
///
/// # Errors
///
/// Returns an error if the backend is unreachable or the store fails.
pub async fn sync_links_once(
    registry: &Arc<LinkRegistry>,
    directory: &dyn CampaignDirectory,
    metrics: &NodeMetrics,
) -> anyhow::Result<SyncReport> {
    let campaigns = directory.active_campaigns().await?;
    let registry = Arc::clone(registry);
    let report = tokio::task::spawn_blocking(move || {
        let report = registry.sync_campaigns(&campaigns)?;
        let refreshed = registry.refresh_due(Utc::now())?;
        if !refreshed.is_empty() {
            info!(count = refreshed.len(), "regenerated expired links");
        }
        Ok::<_, adnode_core::link::LinkError>(report)
    })
    .await??;
    metrics.campaigns_rejected(report.rejected);
    Ok(report)
}

/// Runs [`sync_links_once`] every `interval` until shutdown.
pub async fn run_link_sync(
    registry: Arc<LinkRegistry>,
    directory: Arc<dyn CampaignDirectory>,
    metrics: NodeMetrics,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match sync_links_once(&registry, directory.as_ref(), &metrics).await {
                    Ok(report) => debug!(
                        issued = report.issued,
                        revoked = report.revoked,
                        unchanged = report.unchanged,
                        rejected = report.rejected,
                        "campaign sync complete"
                    ),
                    Err(e) => warn!(error = %e, "campaign sync failed, keeping current links"),
                }
                metrics.set_links_active(registry.active_count());
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Retries parked credit requests every `interval` until shutdown.
pub async fn run_reconcile(
    forwarder: Arc<Forwarder>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = forwarder.reconcile_once().await {
                    warn!(error = %e, "reconcile pass failed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
