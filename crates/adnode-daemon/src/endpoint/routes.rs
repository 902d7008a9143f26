//! HTTPS routes.
//!
//! Routing is pure dispatch: visits go to the attribution engine and always
//! end in a redirect, code deliveries go to the two-factor book.
//!
//! | Route | Handler |
//! |-------|---------|
//! | `GET /health` | liveness and version |
//! | `GET /version` | version |
//! | `POST /2fa` | two-factor code delivery (`X-Registration-Secret`) |
//! | `GET /{link_token}` | visit |
//! | `GET /{campaign_id}/{link_token}` | visit with campaign check |

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use adnode_core::NODE_VERSION;
use adnode_core::attribution::{Attributed, AttributionEngine, AttributionOutcome, RequestMetadata};
use adnode_core::config::AttributionConfig;
use adnode_core::link::is_redirect_url;
use adnode_core::twofactor::{TwoFactorBook, TwoFactorError};
use axum::Json;
use axum::Router;
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use subtle::ConstantTimeEq;
use tracing::{debug, error, info, warn};

use crate::metrics::NodeMetrics;

/// Header carrying the registration secret on `POST /2fa`.
pub const REGISTRATION_SECRET_HEADER: &str = "x-registration-secret";

/// Header carrying the optional device signal.
pub const DEVICE_ID_HEADER: &str = "x-device-id";

/// Where visitors are sent.
#[derive(Debug, Clone)]
pub struct RedirectPolicy {
    template: String,
    not_found_url: String,
}

impl RedirectPolicy {
    /// Builds the policy from the attribution config.
    #[must_use]
    pub fn from_config(config: &AttributionConfig) -> Self {
        Self {
            template: config.redirect_template.clone(),
            not_found_url: config.not_found_url.clone(),
        }
    }

    /// Redirect target for a recorded visit.
    ///
    /// Links with a landing page get the visit id appended as `visit_hash`;
    /// the rest go through the template. A stored landing page that is not
    /// a usable redirect target also falls back to the template.
    #[must_use]
    pub fn target(&self, attributed: &Attributed) -> String {
        let event_id = attributed.event.event_id.to_string();
        match attributed.link.landing_url.as_deref() {
            Some(landing) if is_redirect_url(landing) => {
                let separator = if landing.contains('?') { '&' } else { '?' };
                format!("{landing}{separator}visit_hash={event_id}")
            },
            _ => self
                .template
                .replace("{campaign_id}", &attributed.link.campaign_id)
                .replace("{event_id}", &event_id),
        }
    }

    /// Redirect target for refused visits.
    #[must_use]
    pub fn not_found(&self) -> &str {
        &self.not_found_url
    }
}

/// State shared by all routes.
#[derive(Clone)]
pub struct AppState {
    /// Attribution engine.
    pub engine: Arc<AttributionEngine>,
    /// Two-factor code book.
    pub codes: Arc<TwoFactorBook>,
    /// Redirect targets.
    pub redirects: Arc<RedirectPolicy>,
    /// Secret required on `POST /2fa`; delivery is disabled without one.
    pub registration_secret: Option<Arc<SecretString>>,
    /// Metrics.
    pub metrics: NodeMetrics,
}

/// Builds the router.
pub fn router(state: AppState) -> Router {
    let metrics = state.metrics.clone();
    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/2fa", post(deliver_code))
        .route("/{link_token}", get(visit))
        .route("/{campaign_id}/{link_token}", get(campaign_visit))
        .layer(middleware::from_fn_with_state(metrics, track_in_flight))
        .with_state(state)
}

async fn track_in_flight(
    State(metrics): State<NodeMetrics>,
    request: Request,
    next: Next,
) -> Response {
    let _guard = metrics.request_started();
    next.run(request).await
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": NODE_VERSION }))
}

async fn version() -> impl IntoResponse {
    Json(json!({ "version": NODE_VERSION }))
}

async fn visit(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(link_token): Path<String>,
    headers: HeaderMap,
) -> Response {
    let meta = request_metadata(peer, &headers, None);
    attribute(state, link_token, meta).await
}

async fn campaign_visit(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path((campaign_id, link_token)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let meta = request_metadata(peer, &headers, Some(campaign_id));
    attribute(state, link_token, meta).await
}

async fn attribute(state: AppState, link_token: String, meta: RequestMetadata) -> Response {
    let engine = Arc::clone(&state.engine);
    let handled = tokio::task::spawn_blocking(move || engine.handle(&link_token, &meta)).await;

    let outcome = match handled {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            error!(error = %e, "failed to record visit");
            state.metrics.attribution("error");
            return Redirect::temporary(state.redirects.not_found()).into_response();
        },
        Err(e) => {
            error!(error = %e, "attribution task failed");
            state.metrics.attribution("error");
            return Redirect::temporary(state.redirects.not_found()).into_response();
        },
    };

    state.metrics.attribution(outcome.label());
    match &outcome {
        AttributionOutcome::Accepted(attributed) | AttributionOutcome::Duplicate(attributed) => {
            debug!(
                event_id = %attributed.event.event_id,
                campaign_id = %attributed.link.campaign_id,
                outcome = outcome.label(),
                "visit attributed"
            );
            Redirect::temporary(&state.redirects.target(attributed)).into_response()
        },
        AttributionOutcome::Rejected(reason) => {
            debug!(?reason, "visit rejected");
            Redirect::temporary(state.redirects.not_found()).into_response()
        },
    }
}

#[derive(Debug, Deserialize)]
struct CodeDelivery {
    code: String,
}

async fn deliver_code(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CodeDelivery>,
) -> Response {
    let Some(secret) = state.registration_secret.as_deref() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let presented = headers
        .get(REGISTRATION_SECRET_HEADER)
        .map(|v| v.as_bytes())
        .unwrap_or_default();
    if !bool::from(presented.ct_eq(secret.expose_secret().as_bytes())) {
        warn!("two-factor delivery with bad registration secret");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let codes = Arc::clone(&state.codes);
    match tokio::task::spawn_blocking(move || codes.deliver(&body.code)).await {
        Ok(Ok(_)) => {
            info!("two-factor code stored");
            (StatusCode::OK, Json(json!({ "status": "accepted" }))).into_response()
        },
        Ok(Err(TwoFactorError::InvalidCode(reason))) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": reason }))).into_response()
        },
        Ok(Err(e)) => {
            error!(error = %e, "failed to store two-factor code");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        },
        Err(e) => {
            error!(error = %e, "two-factor task failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        },
    }
}

/// Extracts what the attribution engine needs from a request.
///
/// The client address is the first `X-Forwarded-For` entry when it parses,
/// otherwise the TCP peer.
#[must_use]
pub fn request_metadata(
    peer: SocketAddr,
    headers: &HeaderMap,
    campaign_hint: Option<String>,
) -> RequestMetadata {
    let ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|first| first.trim().parse::<IpAddr>().ok())
        .unwrap_or_else(|| peer.ip());
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    RequestMetadata {
        ip,
        user_agent: header("user-agent").unwrap_or_default(),
        device_signal: header(DEVICE_ID_HEADER),
        referer: header("referer"),
        campaign_hint,
    }
}

#[cfg(test)]
mod tests {
    use adnode_core::attribution::{AttributionEvent, EventOutcome, SourceFingerprint};
    use adnode_core::link::{CampaignLink, LinkStatus, LinkToken};
    use axum::http::HeaderValue;
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;

    fn attributed(landing_url: Option<&str>) -> Attributed {
        let token = LinkToken::generate();
        Attributed {
            event: AttributionEvent {
                event_id: Uuid::nil(),
                link_token: token.clone(),
                campaign_id: "C1".into(),
                source_fingerprint: SourceFingerprint::from(String::from("ab")),
                timestamp: Utc::now(),
                outcome: EventOutcome::Accepted,
            },
            link: CampaignLink {
                campaign_id: "C1".into(),
                link_token: token,
                created_at: Utc::now(),
                expires_at: None,
                status: LinkStatus::Active,
                landing_url: landing_url.map(str::to_string),
            },
        }
    }

    #[test]
    fn redirect_targets() {
        let policy = RedirectPolicy::from_config(&AttributionConfig::default());
        let nil = Uuid::nil().to_string();

        assert_eq!(
            policy.target(&attributed(None)),
            format!("https://v.bitads.ai/campaigns/C1?id={nil}")
        );
        assert_eq!(
            policy.target(&attributed(Some("https://shop.example/p"))),
            format!("https://shop.example/p?visit_hash={nil}")
        );
        assert_eq!(
            policy.target(&attributed(Some("https://shop.example/p?ref=1"))),
            format!("https://shop.example/p?ref=1&visit_hash={nil}")
        );
    }

    #[test]
    fn unusable_landing_page_uses_template() {
        let policy = RedirectPolicy::from_config(&AttributionConfig::default());
        let nil = Uuid::nil().to_string();

        let target = policy.target(&attributed(Some("https://shop.example/p\n")));
        assert_eq!(target, format!("https://v.bitads.ai/campaigns/C1?id={nil}"));
        assert!(HeaderValue::from_str(&target).is_ok());
    }

    #[test]
    fn forwarded_for_wins_over_peer() {
        let peer: SocketAddr = "10.0.0.9:55000".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        headers.insert("user-agent", HeaderValue::from_static("curl/8"));
        headers.insert(DEVICE_ID_HEADER, HeaderValue::from_static("dev-1"));

        let meta = request_metadata(peer, &headers, Some("C1".into()));
        assert_eq!(meta.ip, "203.0.113.7".parse::<IpAddr>().unwrap());
        assert_eq!(meta.user_agent, "curl/8");
        assert_eq!(meta.device_signal.as_deref(), Some("dev-1"));
        assert_eq!(meta.campaign_hint.as_deref(), Some("C1"));
    }

    #[test]
    fn unparsable_forwarded_for_falls_back_to_peer() {
        let peer: SocketAddr = "10.0.0.9:55000".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("unknown"));
        assert_eq!(request_metadata(peer, &headers, None).ip, peer.ip());
    }
}
