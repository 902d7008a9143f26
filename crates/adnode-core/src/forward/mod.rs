//! Crediting accepted visits with the campaign backend.
//!
//! Accepted events are queued on a bounded channel by the attribution engine
//! and drained by the [`Forwarder`]. Each credit call carries a per-attempt
//! timeout and a fixed attempt budget with backoff between attempts. An
//! event that exhausts its budget is parked in the store as
//! [`ForwardState::Reconcile`] and retried by [`Forwarder::reconcile_once`]
//! on a slower cadence. None of this is visible to the visitor, who was
//! answered before the event reached the queue.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::attribution::{AttributionEvent, ForwardState, VisitContext};
use crate::backoff::BackoffConfig;
use crate::config::ForwardConfig;
use crate::link::ActiveCampaign;
use crate::store::NodeStore;

/// Events loaded per reconciliation pass.
pub const RECONCILE_BATCH: usize = 256;

/// Body of a credit call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditRequest {
    /// Visit id.
    pub event_id: Uuid,
    /// Campaign.
    pub campaign_id: String,
    /// Link token.
    pub link_token: String,
    /// Visitor fingerprint.
    pub fingerprint: String,
    /// Record time.
    pub timestamp: DateTime<Utc>,
    /// Client address.
    pub ip: IpAddr,
    /// User agent.
    pub user_agent: String,
    /// Referer.
    pub referer: Option<String>,
}

impl CreditRequest {
    /// Builds the credit body for a recorded event.
    #[must_use]
    pub fn new(event: &AttributionEvent, visit: &VisitContext) -> Self {
        Self {
            event_id: event.event_id,
            campaign_id: event.campaign_id.clone(),
            link_token: event.link_token.to_string(),
            fingerprint: event.source_fingerprint.to_string(),
            timestamp: event.timestamp,
            ip: visit.ip,
            user_agent: visit.user_agent.clone(),
            referer: visit.referer.clone(),
        }
    }
}

/// Upstream forwarding failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ForwardError {
    /// The attempt exceeded its timeout.
    #[error("credit call timed out")]
    Timeout,

    /// Transport failure or 5xx/429 response.
    #[error("campaign backend unavailable: {0}")]
    Unavailable(String),

    /// 4xx response other than 429; retrying will not help.
    #[error("campaign backend refused event with status {status}")]
    Refused {
        /// HTTP status.
        status: u16,
    },
}

impl ForwardError {
    /// Whether another attempt may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Refused { .. })
    }
}

/// The external campaign backend.
#[async_trait]
pub trait CampaignBackend: Send + Sync {
    /// Credits one visit.
    async fn credit(&self, request: &CreditRequest) -> Result<(), ForwardError>;
}

/// The backend's view of which campaigns are running.
#[async_trait]
pub trait CampaignDirectory: Send + Sync {
    /// Campaigns currently active for this node.
    async fn active_campaigns(&self) -> Result<Vec<ActiveCampaign>, ForwardError>;
}

/// Receives the final state of every delivery.
pub trait ForwardObserver: Send + Sync {
    /// Called once per delivered or parked event.
    fn delivered(&self, state: ForwardState);
}

/// Sending half of the forward queue, held by the attribution engine.
#[derive(Debug, Clone)]
pub struct ForwardQueue {
    tx: mpsc::Sender<CreditRequest>,
}

impl ForwardQueue {
    /// Creates a bounded queue.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<CreditRequest>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queues a request without waiting. Gives the request back when the
    /// queue is full or the forwarder has stopped.
    pub fn try_enqueue(&self, request: CreditRequest) -> Result<(), CreditRequest> {
        self.tx.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(r) | mpsc::error::TrySendError::Closed(r) => r,
        })
    }
}

/// Retry policy for one event.
#[derive(Debug, Clone)]
pub struct ForwardPolicy {
    /// Per-attempt timeout.
    pub request_timeout: Duration,
    /// Attempts per event.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub backoff: BackoffConfig,
    /// Concurrent credit calls.
    pub concurrency: usize,
}

impl From<&ForwardConfig> for ForwardPolicy {
    fn from(config: &ForwardConfig) -> Self {
        Self {
            request_timeout: config.request_timeout,
            max_attempts: config.max_attempts,
            backoff: config.backoff.clone(),
            concurrency: config.concurrency,
        }
    }
}

/// Counters over forwarding results.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardStats {
    /// Credited events.
    pub forwarded: u64,
    /// Events parked for reconciliation.
    pub parked: u64,
    /// Events the backend refused.
    pub refused: u64,
}

/// Result of a reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Events attempted.
    pub attempted: usize,
    /// Events credited.
    pub forwarded: usize,
}

#[derive(Default)]
struct Counters {
    forwarded: AtomicU64,
    parked: AtomicU64,
    refused: AtomicU64,
}

/// Drains the forward queue into the campaign backend.
pub struct Forwarder {
    backend: Arc<dyn CampaignBackend>,
    store: Arc<NodeStore>,
    policy: ForwardPolicy,
    counters: Counters,
    observer: Option<Arc<dyn ForwardObserver>>,
}

impl Forwarder {
    /// Creates a forwarder.
    #[must_use]
    pub fn new(
        backend: Arc<dyn CampaignBackend>,
        store: Arc<NodeStore>,
        policy: ForwardPolicy,
    ) -> Self {
        Self {
            backend,
            store,
            policy,
            counters: Counters::default(),
            observer: None,
        }
    }

    /// Reports every delivery outcome to `observer`.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ForwardObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Runs until `shutdown` flips to `true` or every queue sender is gone.
    ///
    /// On shutdown, requests still queued are parked for reconciliation
    /// instead of being sent.
    pub async fn run(
        self: Arc<Self>,
        mut queue: mpsc::Receiver<CreditRequest>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let permits = Arc::new(Semaphore::new(self.policy.concurrency.max(1)));
        info!(
            concurrency = self.policy.concurrency,
            "forwarder started"
        );

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                request = queue.recv() => {
                    let Some(request) = request else { break };
                    let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                        break;
                    };
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        this.deliver(&request).await;
                        drop(permit);
                    });
                }
            }
        }

        queue.close();
        let mut parked = 0usize;
        while let Ok(request) = queue.try_recv() {
            self.park(&request.event_id);
            parked += 1;
        }
        info!(parked, "forwarder stopped");
    }

    /// Sends one request with the full retry budget and records the result.
    pub async fn deliver(&self, request: &CreditRequest) -> ForwardState {
        let state = self.attempt_all(request).await;
        match state {
            ForwardState::Forwarded => {
                self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
            },
            ForwardState::Refused => {
                self.counters.refused.fetch_add(1, Ordering::Relaxed);
            },
            _ => {
                self.counters.parked.fetch_add(1, Ordering::Relaxed);
            },
        }
        if let Err(e) = self.store.set_forward_state(&request.event_id, state) {
            warn!(event_id = %request.event_id, error = %e, "failed to record forward state");
        }
        if let Some(observer) = &self.observer {
            observer.delivered(state);
        }
        state
    }

    async fn attempt_all(&self, request: &CreditRequest) -> ForwardState {
        let max_attempts = self.policy.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let credit = self.backend.credit(request);
            let result = match tokio::time::timeout(self.policy.request_timeout, credit).await {
                Ok(result) => result,
                Err(_) => Err(ForwardError::Timeout),
            };

            match result {
                Ok(()) => {
                    debug!(event_id = %request.event_id, attempt, "event credited");
                    return ForwardState::Forwarded;
                },
                Err(e) if !e.is_retryable() => {
                    warn!(event_id = %request.event_id, error = %e, "backend refused event");
                    return ForwardState::Refused;
                },
                Err(e) => {
                    if attempt == max_attempts {
                        warn!(
                            event_id = %request.event_id,
                            attempts = attempt,
                            error = %e,
                            "forward retry budget exhausted, parking for reconciliation"
                        );
                        break;
                    }
                    let delay = self.policy.backoff.delay_for_attempt(attempt);
                    debug!(
                        event_id = %request.event_id,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "credit attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                },
            }
        }
        ForwardState::Reconcile
    }

    fn park(&self, event_id: &Uuid) {
        self.counters.parked.fetch_add(1, Ordering::Relaxed);
        if let Some(observer) = &self.observer {
            observer.delivered(ForwardState::Reconcile);
        }
        if let Err(e) = self.store.set_forward_state(event_id, ForwardState::Reconcile) {
            warn!(%event_id, error = %e, "failed to park event");
        }
    }

    /// Parks events a previous process left `pending`, so the next
    /// [`Self::reconcile_once`] picks them up. Call before the queue starts;
    /// afterwards `pending` rows belong to live deliveries.
    ///
    /// # Errors
    ///
    /// Returns an error if the store update fails.
    pub fn park_leftovers(&self) -> Result<usize, crate::store::StoreError> {
        let parked = self.store.park_pending_events()?;
        if parked > 0 {
            info!(parked, "parked credits left pending by a previous run");
        }
        Ok(parked)
    }

    /// Retries parked events.
    ///
    /// # Errors
    ///
    /// Returns an error if parked events cannot be loaded.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport, crate::store::StoreError> {
        let parked = self
            .store
            .events_awaiting_forward(&[ForwardState::Reconcile], RECONCILE_BATCH)?;
        let mut report = ReconcileReport {
            attempted: parked.len(),
            forwarded: 0,
        };
        for (event, visit) in parked {
            let request = CreditRequest::new(&event, &visit);
            if self.deliver(&request).await == ForwardState::Forwarded {
                report.forwarded += 1;
            }
        }
        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                forwarded = report.forwarded,
                "reconciliation pass complete"
            );
        }
        Ok(report)
    }

    /// Snapshot of the forwarding counters.
    #[must_use]
    pub fn stats(&self) -> ForwardStats {
        ForwardStats {
            forwarded: self.counters.forwarded.load(Ordering::Relaxed),
            parked: self.counters.parked.load(Ordering::Relaxed),
            refused: self.counters.refused.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    use super::*;
    use crate::attribution::{EventOutcome, SourceFingerprint};
    use crate::link::LinkToken;

    /// Backend that answers from a script, then succeeds.
    struct ScriptedBackend {
        script: Mutex<Vec<Result<(), ForwardError>>>,
        calls: AtomicU64,
        stall: bool,
    }

    impl ScriptedBackend {
        fn new(script: Vec<Result<(), ForwardError>>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: AtomicU64::new(0),
                stall: false,
            }
        }
    }

    #[async_trait]
    impl CampaignBackend for ScriptedBackend {
        async fn credit(&self, _request: &CreditRequest) -> Result<(), ForwardError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.stall {
                std::future::pending::<()>().await;
            }
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                Ok(())
            } else {
                script.remove(0)
            }
        }
    }

    fn policy(max_attempts: u32) -> ForwardPolicy {
        ForwardPolicy {
            request_timeout: Duration::from_millis(50),
            max_attempts,
            backoff: BackoffConfig::Fixed {
                delay: Duration::from_millis(1),
            },
            concurrency: 2,
        }
    }

    fn recorded(store: &NodeStore) -> CreditRequest {
        let event = AttributionEvent {
            event_id: Uuid::new_v4(),
            link_token: LinkToken::generate(),
            campaign_id: "C1".into(),
            source_fingerprint: SourceFingerprint::from("f".repeat(64)),
            timestamp: Utc::now(),
            outcome: EventOutcome::Accepted,
        };
        let visit = VisitContext {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            user_agent: "ua".into(),
            referer: None,
        };
        store
            .append_event(&event, &visit, ForwardState::Pending)
            .unwrap();
        CreditRequest::new(&event, &visit)
    }

    fn state_of(store: &NodeStore, request: &CreditRequest) -> ForwardState {
        store.event(&request.event_id).unwrap().unwrap().1
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let store = Arc::new(NodeStore::open_in_memory().unwrap());
        let backend = Arc::new(ScriptedBackend::new(vec![
            Err(ForwardError::Unavailable("503".into())),
            Err(ForwardError::Timeout),
        ]));
        let forwarder = Forwarder::new(backend.clone(), Arc::clone(&store), policy(3));

        let request = recorded(&store);
        assert_eq!(forwarder.deliver(&request).await, ForwardState::Forwarded);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert_eq!(state_of(&store, &request), ForwardState::Forwarded);
    }

    #[tokio::test]
    async fn exhausted_budget_parks_then_reconciles() {
        let store = Arc::new(NodeStore::open_in_memory().unwrap());
        let backend = Arc::new(ScriptedBackend::new(vec![
            Err(ForwardError::Unavailable("down".into())),
            Err(ForwardError::Unavailable("down".into())),
        ]));
        let forwarder = Forwarder::new(backend.clone(), Arc::clone(&store), policy(2));

        let request = recorded(&store);
        assert_eq!(forwarder.deliver(&request).await, ForwardState::Reconcile);
        assert_eq!(state_of(&store, &request), ForwardState::Reconcile);

        let report = forwarder.reconcile_once().await.unwrap();
        assert_eq!(
            report,
            ReconcileReport {
                attempted: 1,
                forwarded: 1
            }
        );
        assert_eq!(state_of(&store, &request), ForwardState::Forwarded);
        assert_eq!(forwarder.stats().forwarded, 1);
        assert_eq!(forwarder.stats().parked, 1);
    }

    #[tokio::test]
    async fn refusal_is_not_retried() {
        let store = Arc::new(NodeStore::open_in_memory().unwrap());
        let backend = Arc::new(ScriptedBackend::new(vec![Err(ForwardError::Refused {
            status: 400,
        })]));
        let forwarder = Forwarder::new(backend.clone(), Arc::clone(&store), policy(5));

        let request = recorded(&store);
        assert_eq!(forwarder.deliver(&request).await, ForwardState::Refused);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stalled_backend_hits_timeout() {
        let store = Arc::new(NodeStore::open_in_memory().unwrap());
        let backend = Arc::new(ScriptedBackend {
            stall: true,
            ..ScriptedBackend::new(Vec::new())
        });
        let forwarder = Forwarder::new(backend.clone(), Arc::clone(&store), policy(2));

        let request = recorded(&store);
        assert_eq!(forwarder.deliver(&request).await, ForwardState::Reconcile);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn run_forwards_queue_and_parks_on_shutdown() {
        let store = Arc::new(NodeStore::open_in_memory().unwrap());
        let backend = Arc::new(ScriptedBackend::new(Vec::new()));
        let forwarder = Arc::new(Forwarder::new(backend, Arc::clone(&store), policy(1)));
        let (queue, rx) = ForwardQueue::channel(8);
        let (stop_tx, stop_rx) = watch::channel(false);

        let request = recorded(&store);
        queue.try_enqueue(request.clone()).unwrap();
        let task = tokio::spawn(Arc::clone(&forwarder).run(rx, stop_rx));

        for _ in 0..100 {
            if state_of(&store, &request) == ForwardState::Forwarded {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(state_of(&store, &request), ForwardState::Forwarded);

        stop_tx.send(true).unwrap();
        task.await.unwrap();

        let late = recorded(&store);
        assert!(queue.try_enqueue(late).is_err());
    }

    #[tokio::test]
    async fn leftovers_are_parked_then_reconciled() {
        let store = Arc::new(NodeStore::open_in_memory().unwrap());
        let backend = Arc::new(ScriptedBackend::new(Vec::new()));
        let forwarder = Forwarder::new(backend, Arc::clone(&store), policy(1));

        let request = recorded(&store);
        assert_eq!(forwarder.reconcile_once().await.unwrap().attempted, 0);
        assert_eq!(forwarder.park_leftovers().unwrap(), 1);
        assert_eq!(forwarder.reconcile_once().await.unwrap().forwarded, 1);
        assert_eq!(state_of(&store, &request), ForwardState::Forwarded);
    }
}
