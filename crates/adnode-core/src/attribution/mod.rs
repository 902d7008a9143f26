//! Attribution of inbound visits to campaign links.
//!
//! [`AttributionEngine::handle`] is the whole business path behind a
//! tracking URL:
//!
//! 1. Resolve the token against the [`LinkRegistry`]. Unknown or expired
//!    tokens are rejected and only counted.
//! 2. Fingerprint the visitor and consult the dedup window. A repeat inside
//!    the window is recorded as `duplicate` and not forwarded.
//! 3. Otherwise append an `accepted` event and queue it for crediting. The
//!    caller answers the visitor right away; forwarding never blocks it.
//!
//! Fingerprinting and dedup are synchronous and bounded. The only
//! suspension-free blocking work is the append to the store.

mod dedup;
mod fingerprint;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

pub use self::dedup::{DedupConfig, DedupDecision, DedupWindow};
pub use self::fingerprint::{MAX_FIELD_LEN, RequestMetadata, SourceFingerprint};
use crate::clock::MonotonicClock;
use crate::config::AttributionConfig;
use crate::forward::{CreditRequest, ForwardQueue};
use crate::link::{CampaignLink, LinkRegistry, LinkToken, TokenError};
use crate::store::{NodeStore, StoreError};

/// Recorded outcome of a visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    /// Credited visit.
    Accepted,
    /// Repeat inside the dedup window.
    Duplicate,
    /// Refused visit.
    Rejected,
}

impl EventOutcome {
    /// Storage and label representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Duplicate => "duplicate",
            Self::Rejected => "rejected",
        }
    }

    /// Parses the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "accepted" => Some(Self::Accepted),
            "duplicate" => Some(Self::Duplicate),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// Forwarding progress of a recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardState {
    /// Queued or in flight.
    Pending,
    /// Credited by the backend.
    Forwarded,
    /// Retry budget exhausted; picked up by reconciliation.
    Reconcile,
    /// Backend refused the event permanently.
    Refused,
    /// Not forwarded (duplicates).
    Skipped,
}

impl ForwardState {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Forwarded => "forwarded",
            Self::Reconcile => "reconcile",
            Self::Refused => "refused",
            Self::Skipped => "skipped",
        }
    }

    /// Parses the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "forwarded" => Some(Self::Forwarded),
            "reconcile" => Some(Self::Reconcile),
            "refused" => Some(Self::Refused),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// One recorded visit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributionEvent {
    /// Visit id, also handed to the visitor's landing page.
    pub event_id: Uuid,
    /// Token the visitor presented.
    pub link_token: LinkToken,
    /// Campaign of the link.
    pub campaign_id: String,
    /// Visitor fingerprint.
    pub source_fingerprint: SourceFingerprint,
    /// Wall-clock record time.
    pub timestamp: DateTime<Utc>,
    /// Outcome.
    pub outcome: EventOutcome,
}

/// Visitor details kept alongside an event for crediting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitContext {
    /// Client address.
    pub ip: std::net::IpAddr,
    /// User agent.
    pub user_agent: String,
    /// Referer.
    pub referer: Option<String>,
}

impl From<&RequestMetadata> for VisitContext {
    fn from(meta: &RequestMetadata) -> Self {
        Self {
            ip: meta.ip,
            user_agent: meta.user_agent.clone(),
            referer: meta.referer.clone(),
        }
    }
}

/// An event together with the link it was attributed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attributed {
    /// Recorded event.
    pub event: AttributionEvent,
    /// Link the token resolved to.
    pub link: CampaignLink,
}

/// Why a visit was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Token unknown, expired, or presented under another campaign.
    Token(TokenError),
    /// Dedup window is full; accepting would risk double counting.
    CapacityExhausted,
}

/// Result of handling one visit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributionOutcome {
    /// New visit, recorded and queued for crediting.
    Accepted(Attributed),
    /// Repeat inside the dedup window, recorded only.
    Duplicate(Attributed),
    /// Refused; nothing recorded.
    Rejected(RejectReason),
}

impl AttributionOutcome {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Accepted(_) => "accepted",
            Self::Duplicate(_) => "duplicate",
            Self::Rejected(RejectReason::Token(TokenError::NotFound)) => "rejected_not_found",
            Self::Rejected(RejectReason::Token(TokenError::Expired)) => "rejected_expired",
            Self::Rejected(RejectReason::CapacityExhausted) => "rejected_capacity",
        }
    }
}

/// Attribution failure that is not the visitor's fault.
#[derive(Debug, thiserror::Error)]
pub enum AttributionError {
    /// The event could not be persisted.
    #[error("failed to record attribution event: {0}")]
    Store(#[from] StoreError),
}

/// Counters over handled visits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributionStats {
    /// Accepted visits.
    pub accepted: u64,
    /// Duplicates.
    pub duplicate: u64,
    /// Rejected visits (all reasons).
    pub rejected: u64,
    /// Accepted visits that could not be queued and went straight to
    /// reconciliation.
    pub queue_overflow: u64,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    duplicate: AtomicU64,
    rejected: AtomicU64,
    queue_overflow: AtomicU64,
}

/// Validates, deduplicates, records and forwards visits.
pub struct AttributionEngine {
    registry: Arc<LinkRegistry>,
    store: Arc<NodeStore>,
    dedup: DedupWindow,
    forward: ForwardQueue,
    counters: Counters,
}

impl AttributionEngine {
    /// Creates an engine.
    #[must_use]
    pub fn new(
        registry: Arc<LinkRegistry>,
        store: Arc<NodeStore>,
        config: &AttributionConfig,
        clock: Arc<dyn MonotonicClock>,
        forward: ForwardQueue,
    ) -> Self {
        let dedup = DedupWindow::new(
            DedupConfig {
                window: config.dedup_window,
                max_tracked_keys: config.max_tracked_keys,
                cleanup_interval: config.cleanup_interval,
            },
            clock,
        );
        Self {
            registry,
            store,
            dedup,
            forward,
            counters: Counters::default(),
        }
    }

    /// Re-seeds the dedup window from accepted events still inside it, so a
    /// restart never re-accepts a pair.
    ///
    /// Returns the number of pairs seeded.
    ///
    /// # Errors
    ///
    /// Returns an error if the event log cannot be read.
    pub fn seed_from_store(&self) -> Result<usize, AttributionError> {
        let now = Utc::now();
        let window = chrono::Duration::from_std(self.dedup.window())
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let mut seeded = 0usize;
        for (token, fingerprint, at) in self.store.accepted_since(now - window)? {
            // Wall-clock age is converted to a monotonic offset once, here.
            let age = (now - at).to_std().unwrap_or(Duration::ZERO);
            if self.dedup.seed(&token, &fingerprint, age) {
                seeded += 1;
            }
        }
        debug!(seeded, "dedup window seeded from event log");
        Ok(seeded)
    }

    /// Handles one visit to `link_token`.
    ///
    /// # Errors
    ///
    /// Returns an error only if the event cannot be persisted. Visitor
    /// mistakes are [`AttributionOutcome::Rejected`], not errors.
    pub fn handle(
        &self,
        link_token: &str,
        meta: &RequestMetadata,
    ) -> Result<AttributionOutcome, AttributionError> {
        let outcome = self.attribute(link_token, meta)?;
        let counter = match &outcome {
            AttributionOutcome::Accepted(_) => &self.counters.accepted,
            AttributionOutcome::Duplicate(_) => &self.counters.duplicate,
            AttributionOutcome::Rejected(_) => &self.counters.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(outcome)
    }

    fn attribute(
        &self,
        link_token: &str,
        meta: &RequestMetadata,
    ) -> Result<AttributionOutcome, AttributionError> {
        let Some(token) = LinkToken::parse(link_token) else {
            return Ok(AttributionOutcome::Rejected(RejectReason::Token(
                TokenError::NotFound,
            )));
        };
        let link = match self.registry.lookup(&token) {
            Ok(link) => link,
            Err(e) => return Ok(AttributionOutcome::Rejected(RejectReason::Token(e))),
        };
        if meta
            .campaign_hint
            .as_deref()
            .is_some_and(|hint| hint != link.campaign_id)
        {
            return Ok(AttributionOutcome::Rejected(RejectReason::Token(
                TokenError::NotFound,
            )));
        }

        let fingerprint = meta.fingerprint();
        let decision = self
            .dedup
            .check_and_record(token.as_str(), fingerprint.as_str());
        let outcome = match decision {
            DedupDecision::Full => {
                return Ok(AttributionOutcome::Rejected(
                    RejectReason::CapacityExhausted,
                ));
            },
            DedupDecision::First => EventOutcome::Accepted,
            DedupDecision::Duplicate => EventOutcome::Duplicate,
        };

        let event = AttributionEvent {
            event_id: Uuid::new_v4(),
            link_token: token,
            campaign_id: link.campaign_id.clone(),
            source_fingerprint: fingerprint,
            timestamp: Utc::now(),
            outcome,
        };
        let visit = VisitContext::from(meta);

        if outcome == EventOutcome::Duplicate {
            self.store
                .append_event(&event, &visit, ForwardState::Skipped)?;
            return Ok(AttributionOutcome::Duplicate(Attributed { event, link }));
        }

        if let Err(e) = self
            .store
            .append_event(&event, &visit, ForwardState::Pending)
        {
            self.dedup
                .forget(event.link_token.as_str(), event.source_fingerprint.as_str());
            return Err(e.into());
        }

        if let Err(request) = self.forward.try_enqueue(CreditRequest::new(&event, &visit)) {
            self.counters.queue_overflow.fetch_add(1, Ordering::Relaxed);
            warn!(
                event_id = %request.event_id,
                "forward queue full, parking event for reconciliation"
            );
            if let Err(e) = self
                .store
                .set_forward_state(&request.event_id, ForwardState::Reconcile)
            {
                // Still pending in the store; the startup reconcile pass
                // picks it up.
                warn!(event_id = %request.event_id, error = %e, "failed to park event");
            }
        }

        Ok(AttributionOutcome::Accepted(Attributed { event, link }))
    }

    /// Snapshot of the visit counters.
    #[must_use]
    pub fn stats(&self) -> AttributionStats {
        AttributionStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            duplicate: self.counters.duplicate.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            queue_overflow: self.counters.queue_overflow.load(Ordering::Relaxed),
        }
    }

    /// Number of pairs held by the dedup window.
    #[must_use]
    pub fn tracked_pairs(&self) -> usize {
        self.dedup.len()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::clock::ManualClock;

    struct Fixture {
        store: Arc<NodeStore>,
        registry: Arc<LinkRegistry>,
        engine: AttributionEngine,
        queue: tokio::sync::mpsc::Receiver<CreditRequest>,
        clock: ManualClock,
    }

    fn fixture(capacity: usize) -> Fixture {
        let store = Arc::new(NodeStore::open_in_memory().unwrap());
        let registry = Arc::new(LinkRegistry::load(Arc::clone(&store), None).unwrap());
        let clock = ManualClock::new();
        let (forward, queue) = ForwardQueue::channel(capacity);
        let config = AttributionConfig {
            dedup_window: Duration::from_secs(3600),
            ..AttributionConfig::default()
        };
        let engine = AttributionEngine::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            &config,
            Arc::new(clock.clone()),
            forward,
        );
        Fixture {
            store,
            registry,
            engine,
            queue,
            clock,
        }
    }

    fn visitor(last_octet: u8) -> RequestMetadata {
        RequestMetadata {
            user_agent: "Mozilla/5.0".into(),
            ..RequestMetadata::from_ip(IpAddr::V4(Ipv4Addr::new(203, 0, 113, last_octet)))
        }
    }

    #[test]
    fn accepted_then_duplicate_then_new_visitor() {
        let mut fx = fixture(16);
        let link = fx.registry.issue_or_refresh("C1").unwrap();
        let token = link.link_token.as_str();

        let first = fx.engine.handle(token, &visitor(1)).unwrap();
        let AttributionOutcome::Accepted(accepted) = first else {
            panic!("first visit must be accepted");
        };
        assert_eq!(accepted.link, link);

        let repeat = fx.engine.handle(token, &visitor(1)).unwrap();
        assert!(matches!(repeat, AttributionOutcome::Duplicate(_)));

        let other = fx.engine.handle(token, &visitor(2)).unwrap();
        assert!(matches!(other, AttributionOutcome::Accepted(_)));

        // only accepted visits are queued
        let queued = fx.queue.try_recv().unwrap();
        assert_eq!(queued.event_id, accepted.event.event_id);
        assert!(fx.queue.try_recv().is_ok());
        assert!(fx.queue.try_recv().is_err());

        let counts = fx.store.event_counts().unwrap();
        assert_eq!(counts.accepted, 2);
        assert_eq!(counts.duplicate, 1);
        assert_eq!(
            fx.engine.stats(),
            AttributionStats {
                accepted: 2,
                duplicate: 1,
                rejected: 0,
                queue_overflow: 0
            }
        );
    }

    #[test]
    fn rejections_record_nothing() {
        let fx = fixture(16);
        let link = fx.registry.issue_or_refresh("C1").unwrap();

        let bogus = fx.engine.handle("not-a-token", &visitor(1)).unwrap();
        assert_eq!(
            bogus,
            AttributionOutcome::Rejected(RejectReason::Token(TokenError::NotFound))
        );
        let unknown = fx
            .engine
            .handle(LinkToken::generate().as_str(), &visitor(1))
            .unwrap();
        assert_eq!(
            unknown,
            AttributionOutcome::Rejected(RejectReason::Token(TokenError::NotFound))
        );

        fx.registry.refresh("C1").unwrap();
        let expired = fx.engine.handle(link.link_token.as_str(), &visitor(1)).unwrap();
        assert_eq!(
            expired,
            AttributionOutcome::Rejected(RejectReason::Token(TokenError::Expired))
        );

        let counts = fx.store.event_counts().unwrap();
        assert_eq!(counts.accepted + counts.duplicate, 0);
        assert_eq!(fx.engine.stats().rejected, 3);
    }

    #[test]
    fn campaign_hint_must_match_link() {
        let fx = fixture(16);
        let link = fx.registry.issue_or_refresh("C1").unwrap();
        let mut meta = visitor(1);
        meta.campaign_hint = Some("C2".into());
        assert_eq!(
            fx.engine.handle(link.link_token.as_str(), &meta).unwrap(),
            AttributionOutcome::Rejected(RejectReason::Token(TokenError::NotFound))
        );
        meta.campaign_hint = Some("C1".into());
        assert!(matches!(
            fx.engine.handle(link.link_token.as_str(), &meta).unwrap(),
            AttributionOutcome::Accepted(_)
        ));
    }

    #[test]
    fn full_queue_parks_event_for_reconciliation() {
        let fx = fixture(1);
        let link = fx.registry.issue_or_refresh("C1").unwrap();
        let token = link.link_token.as_str();

        fx.engine.handle(token, &visitor(1)).unwrap();
        let second = fx.engine.handle(token, &visitor(2)).unwrap();
        let AttributionOutcome::Accepted(second) = second else {
            panic!("visitor must still be accepted");
        };

        let (_, state) = fx.store.event(&second.event.event_id).unwrap().unwrap();
        assert_eq!(state, ForwardState::Reconcile);
        assert_eq!(fx.engine.stats().queue_overflow, 1);
        assert_eq!(fx.store.event_counts().unwrap().awaiting_reconcile, 1);
    }

    #[test]
    fn dedup_survives_restart_via_seed() {
        let fx = fixture(16);
        let link = fx.registry.issue_or_refresh("C1").unwrap();
        let token = link.link_token.as_str();
        fx.engine.handle(token, &visitor(1)).unwrap();

        // New engine over the same store, as after a handover.
        let (forward, _queue) = ForwardQueue::channel(16);
        let restarted = AttributionEngine::new(
            Arc::clone(&fx.registry),
            Arc::clone(&fx.store),
            &AttributionConfig {
                dedup_window: Duration::from_secs(3600),
                ..AttributionConfig::default()
            },
            Arc::new(fx.clock.clone()),
            forward,
        );
        assert_eq!(restarted.seed_from_store().unwrap(), 1);
        assert!(matches!(
            restarted.handle(token, &visitor(1)).unwrap(),
            AttributionOutcome::Duplicate(_)
        ));
        assert!(matches!(
            restarted.handle(token, &visitor(2)).unwrap(),
            AttributionOutcome::Accepted(_)
        ));
    }

    #[test]
    fn window_expiry_allows_reacceptance() {
        let fx = fixture(16);
        let link = fx.registry.issue_or_refresh("C1").unwrap();
        let token = link.link_token.as_str();
        fx.engine.handle(token, &visitor(1)).unwrap();
        fx.clock.advance(Duration::from_secs(3600));
        assert!(matches!(
            fx.engine.handle(token, &visitor(1)).unwrap(),
            AttributionOutcome::Accepted(_)
        ));
    }
}
