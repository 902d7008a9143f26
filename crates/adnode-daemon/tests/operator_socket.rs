//! Operator protocol over a real Unix socket.

use std::sync::Arc;
use std::time::Duration;

use adnode_core::attribution::AttributionEngine;
use adnode_core::clock::SystemClock;
use adnode_core::config::NodeConfig;
use adnode_core::forward::{
    CampaignBackend, CreditRequest, ForwardError, ForwardPolicy, ForwardQueue, Forwarder,
};
use adnode_core::ipc::{ErrorCode, IpcRequest, IpcResponse};
use adnode_core::link::LinkRegistry;
use adnode_core::operator::OperatorChannel;
use adnode_core::store::NodeStore;
use adnode_core::twofactor::TwoFactorBook;
use adnode_daemon::endpoint::EndpointControl;
use adnode_daemon::metrics::MetricsRegistry;
use adnode_daemon::operator::{OperatorSocket, operator_codec};
use adnode_daemon::state::{NodeParts, NodeState, SharedState};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tempfile::TempDir;
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

struct NullBackend;

#[async_trait]
impl CampaignBackend for NullBackend {
    async fn credit(&self, _request: &CreditRequest) -> Result<(), ForwardError> {
        Ok(())
    }
}

fn node_state() -> (SharedState, Arc<TwoFactorBook>) {
    let config = NodeConfig::default();
    let store = Arc::new(NodeStore::open_in_memory().unwrap());
    let registry = Arc::new(LinkRegistry::load(Arc::clone(&store), None).unwrap());
    registry.issue_or_refresh("C1").unwrap();
    registry.issue_or_refresh("C2").unwrap();

    let (queue, _credits) = ForwardQueue::channel(16);
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
    let metrics = MetricsRegistry::new().unwrap().node_metrics().clone();

    let state = NodeState::new(NodeParts {
        config: Arc::new(config),
        store,
        registry: Arc::clone(&registry),
        engine,
        operator: OperatorChannel::new(registry, Arc::clone(&codes)),
        forwarder,
        supervisor: None,
        endpoint: EndpointControl::new(true),
        metrics,
    });
    (state, codes)
}

async fn call(
    framed: &mut Framed<UnixStream, LengthDelimitedCodec>,
    request: &IpcRequest,
) -> IpcResponse {
    framed
        .send(Bytes::from(serde_json::to_vec(request).unwrap()))
        .await
        .unwrap();
    let frame = framed.next().await.unwrap().unwrap();
    serde_json::from_slice(&frame).unwrap()
}

#[tokio::test]
async fn operator_commands_round_trip() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("operator.sock");
    let (state, codes) = node_state();
    codes.deliver("482913").unwrap();

    let socket = OperatorSocket::bind(&path).unwrap();
    let server = tokio::spawn({
        let state = Arc::clone(&state);
        let shutdown = state.shutdown_signal();
        async move { socket.serve(state, shutdown).await }
    });

    let stream = UnixStream::connect(&path).await.unwrap();
    let mut framed = Framed::new(stream, operator_codec());

    match call(&mut framed, &IpcRequest::Ping).await {
        IpcResponse::Pong { version, .. } => assert_eq!(version, adnode_core::NODE_VERSION),
        other => panic!("unexpected {other:?}"),
    }

    match call(&mut framed, &IpcRequest::ListLinks).await {
        IpcResponse::LinkList { links } => {
            let mut campaigns: Vec<_> = links.iter().map(|l| l.campaign_id.as_str()).collect();
            campaigns.sort_unstable();
            assert_eq!(campaigns, ["C1", "C2"]);
        },
        other => panic!("unexpected {other:?}"),
    }

    match call(&mut framed, &IpcRequest::ListPendingCodes).await {
        IpcResponse::CodeList { codes } => assert_eq!(codes.len(), 1),
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        call(&mut framed, &IpcRequest::ConsumeCode { code: "482913".into() }).await,
        IpcResponse::Ok { .. }
    ));
    match call(&mut framed, &IpcRequest::ConsumeCode { code: "482913".into() }).await {
        IpcResponse::Error { code, .. } => assert_eq!(code, ErrorCode::NotFound),
        other => panic!("unexpected {other:?}"),
    }

    match call(&mut framed, &IpcRequest::RefreshLink { campaign_id: "C1".into() }).await {
        IpcResponse::Link { link } => assert_eq!(link.campaign_id, "C1"),
        other => panic!("unexpected {other:?}"),
    }

    match call(&mut framed, &IpcRequest::Status).await {
        IpcResponse::Status(status) => {
            assert_eq!(status.active_links, 2);
            assert_eq!(status.pending_codes, 0);
            assert_eq!(status.update_state, "running");
            assert!(status.accepting);
        },
        other => panic!("unexpected {other:?}"),
    }

    match call(&mut framed, &IpcRequest::CheckForUpdate).await {
        IpcResponse::Error { code, .. } => assert_eq!(code, ErrorCode::NotSupported),
        other => panic!("unexpected {other:?}"),
    }

    assert!(matches!(
        call(&mut framed, &IpcRequest::Shutdown).await,
        IpcResponse::Ok { .. }
    ));
    assert!(state.is_shutdown_requested());
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.metrics.operator_request_count("ping", "ok"), 1.0);
}

#[tokio::test]
async fn malformed_frame_gets_error_response() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("operator.sock");
    let (state, _) = node_state();
    let socket = OperatorSocket::bind(&path).unwrap();
    tokio::spawn({
        let state = Arc::clone(&state);
        let shutdown = state.shutdown_signal();
        async move { socket.serve(state, shutdown).await }
    });

    let stream = UnixStream::connect(&path).await.unwrap();
    let mut framed = Framed::new(stream, operator_codec());
    framed.send(Bytes::from_static(b"{\"type\":\"reboot\"}")).await.unwrap();
    let frame = framed.next().await.unwrap().unwrap();
    match serde_json::from_slice::<IpcResponse>(&frame).unwrap() {
        IpcResponse::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidRequest),
        other => panic!("unexpected {other:?}"),
    }
    state.request_shutdown();
}
