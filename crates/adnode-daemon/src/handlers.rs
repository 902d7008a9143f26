//! Operator request handlers.
//!
//! Handlers that touch SQLite run on the blocking pool so a slow disk never
//! stalls the runtime threads serving HTTPS.

use std::sync::Arc;

use adnode_core::NODE_VERSION;
use adnode_core::ipc::{ErrorCode, IpcRequest, IpcResponse, NodeStatus};
use adnode_core::link::LinkError;
use adnode_core::twofactor::TwoFactorError;
use adnode_core::update::{CheckOutcome, UpdateState};
use tracing::{info, warn};

use crate::state::{NodeState, SharedState};

/// Routes one request to its handler.
pub async fn dispatch(request: IpcRequest, state: &SharedState) -> IpcResponse {
    match request {
        IpcRequest::Ping => IpcResponse::Pong {
            version: NODE_VERSION.to_string(),
            uptime_secs: state.uptime_secs(),
        },
        IpcRequest::Status => on_blocking_pool(state, handle_status).await,
        IpcRequest::ListLinks => IpcResponse::LinkList {
            links: state.operator.list_links(),
        },
        IpcRequest::ListPendingCodes => on_blocking_pool(state, handle_list_codes).await,
        IpcRequest::ConsumeCode { code } => {
            on_blocking_pool(state, move |state| handle_consume_code(state, &code)).await
        },
        IpcRequest::RefreshLink { campaign_id } => {
            on_blocking_pool(state, move |state| handle_refresh_link(state, &campaign_id)).await
        },
        IpcRequest::CheckForUpdate => handle_check_for_update(state).await,
        IpcRequest::Shutdown => {
            info!("shutdown requested over operator socket");
            state.request_shutdown();
            IpcResponse::Ok {
                message: Some("shutting down".into()),
            }
        },
    }
}

async fn on_blocking_pool<F>(state: &SharedState, handler: F) -> IpcResponse
where
    F: FnOnce(&NodeState) -> IpcResponse + Send + 'static,
{
    let state = Arc::clone(state);
    tokio::task::spawn_blocking(move || handler(&state))
        .await
        .unwrap_or_else(|e| {
            IpcResponse::error(ErrorCode::InternalError, format!("handler task failed: {e}"))
        })
}

fn handle_status(state: &NodeState) -> IpcResponse {
    let counts = match state.store.event_counts() {
        Ok(counts) => counts,
        Err(e) => return IpcResponse::error(ErrorCode::InternalError, e.to_string()),
    };
    let pending_codes = state
        .operator
        .list_pending_codes()
        .map_or(0, |codes| codes.len());
    let stats = state.engine.stats();
    let update_state = state
        .supervisor
        .as_ref()
        .map_or(UpdateState::Running, |s| s.state());

    IpcResponse::Status(NodeStatus {
        version: NODE_VERSION.to_string(),
        pid: std::process::id(),
        uptime_secs: state.uptime_secs(),
        update_state: update_state.as_str().to_string(),
        accepting: state.endpoint.is_accepting(),
        active_links: state.registry.active_count(),
        tracked_pairs: state.engine.tracked_pairs(),
        accepted: stats.accepted,
        duplicate: stats.duplicate,
        rejected: stats.rejected,
        awaiting_reconcile: counts.awaiting_reconcile,
        pending_codes,
    })
}

fn handle_list_codes(state: &NodeState) -> IpcResponse {
    match state.operator.list_pending_codes() {
        Ok(codes) => IpcResponse::CodeList { codes },
        Err(e) => IpcResponse::error(ErrorCode::InternalError, e.to_string()),
    }
}

fn handle_consume_code(state: &NodeState, code: &str) -> IpcResponse {
    match state.operator.consume_code(code) {
        Ok(()) => IpcResponse::Ok {
            message: Some("code consumed".into()),
        },
        Err(TwoFactorError::NotFound) => {
            IpcResponse::error(ErrorCode::NotFound, "no pending code matches")
        },
        Err(TwoFactorError::InvalidCode(reason)) => {
            IpcResponse::error(ErrorCode::InvalidRequest, reason)
        },
        Err(e) => IpcResponse::error(ErrorCode::InternalError, e.to_string()),
    }
}

fn handle_refresh_link(state: &NodeState, campaign_id: &str) -> IpcResponse {
    match state.registry.refresh(campaign_id) {
        Ok(link) => {
            state.metrics.set_links_active(state.registry.active_count());
            IpcResponse::Link { link }
        },
        Err(e @ LinkError::InvalidCampaignId(_)) => {
            IpcResponse::error(ErrorCode::InvalidRequest, e.to_string())
        },
        Err(e) => IpcResponse::error(ErrorCode::InternalError, e.to_string()),
    }
}

async fn handle_check_for_update(state: &NodeState) -> IpcResponse {
    let Some(supervisor) = &state.supervisor else {
        return IpcResponse::error(ErrorCode::NotSupported, "updates are disabled");
    };
    match supervisor.check_once().await {
        Ok(outcome) => {
            state.metrics.update_check(outcome.label());
            let message = match &outcome {
                CheckOutcome::NoUpdate => None,
                CheckOutcome::Unreachable(reason) => Some(reason.clone()),
                CheckOutcome::Skipped(version) => {
                    Some(format!("version {version} failed before and is skipped"))
                },
                CheckOutcome::HandedOver(version) => {
                    Some(format!("version {version} has taken over"))
                },
                CheckOutcome::AlreadyInProgress => Some("an update is already running".into()),
            };
            IpcResponse::UpdateCheck {
                outcome: outcome.label().to_string(),
                message,
            }
        },
        Err(e) => {
            warn!(error = %e, "operator-triggered update failed");
            state.metrics.update_check(e.label());
            IpcResponse::UpdateCheck {
                outcome: e.label().to_string(),
                message: Some(e.to_string()),
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use adnode_core::attribution::AttributionEngine;
    use adnode_core::clock::SystemClock;
    use adnode_core::config::NodeConfig;
    use adnode_core::forward::{
        CampaignBackend, CreditRequest, ForwardError, ForwardPolicy, ForwardQueue, Forwarder,
    };
    use adnode_core::link::LinkRegistry;
    use adnode_core::operator::OperatorChannel;
    use adnode_core::store::NodeStore;
    use adnode_core::twofactor::TwoFactorBook;
    use async_trait::async_trait;

    use super::*;
    use crate::endpoint::EndpointControl;
    use crate::metrics::MetricsRegistry;
    use crate::state::NodeParts;

    struct NullBackend;

    #[async_trait]
    impl CampaignBackend for NullBackend {
        async fn credit(&self, _request: &CreditRequest) -> Result<(), ForwardError> {
            Ok(())
        }
    }

    fn state() -> SharedState {
        let config = NodeConfig::default();
        let store = Arc::new(NodeStore::open_in_memory().unwrap());
        let registry = Arc::new(LinkRegistry::load(Arc::clone(&store), None).unwrap());
        registry.issue_or_refresh("C1").unwrap();
        let (queue, _credits) = ForwardQueue::channel(4);
        let engine = Arc::new(AttributionEngine::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            &config.attribution,
            Arc::new(SystemClock),
            queue,
        ));
        let forwarder = Arc::new(Forwarder::new(
            Arc::new(NullBackend),
            Arc::clone(&store),
            ForwardPolicy::from(&config.forward),
        ));
        let codes = Arc::new(TwoFactorBook::new(
            Arc::clone(&store),
            Duration::from_secs(600),
        ));
        codes.deliver("135790").unwrap();

        NodeState::new(NodeParts {
            config: Arc::new(config),
            store,
            registry: Arc::clone(&registry),
            engine,
            operator: OperatorChannel::new(registry, codes),
            forwarder,
            supervisor: None,
            endpoint: EndpointControl::new(true),
            metrics: MetricsRegistry::new().unwrap().node_metrics().clone(),
        })
    }

    #[tokio::test]
    async fn store_backed_requests_answer_from_the_blocking_pool() {
        let state = state();

        match dispatch(IpcRequest::Status, &state).await {
            IpcResponse::Status(status) => {
                assert_eq!(status.active_links, 1);
                assert_eq!(status.pending_codes, 1);
            },
            other => panic!("unexpected {other:?}"),
        }

        let before = state.operator.list_links()[0].link_token.clone();
        match dispatch(
            IpcRequest::RefreshLink {
                campaign_id: "C1".into(),
            },
            &state,
        )
        .await
        {
            IpcResponse::Link { link } => assert_ne!(link.link_token, before),
            other => panic!("unexpected {other:?}"),
        }

        assert!(matches!(
            dispatch(
                IpcRequest::RefreshLink {
                    campaign_id: "../x".into(),
                },
                &state,
            )
            .await,
            IpcResponse::Error {
                code: ErrorCode::InvalidRequest,
                ..
            }
        ));
        assert!(matches!(
            dispatch(
                IpcRequest::ConsumeCode {
                    code: "135790".into(),
                },
                &state,
            )
            .await,
            IpcResponse::Ok { .. }
        ));
        match dispatch(IpcRequest::ListPendingCodes, &state).await {
            IpcResponse::CodeList { codes } => assert!(codes.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn update_check_without_supervisor_is_not_supported() {
        assert!(matches!(
            dispatch(IpcRequest::CheckForUpdate, &state()).await,
            IpcResponse::Error {
                code: ErrorCode::NotSupported,
                ..
            }
        ));
    }
}
