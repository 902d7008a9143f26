//! HTTP client for the campaign backend and the update server.
//!
//! Two pooled hyper clients share the request plumbing. The backend client
//! (rustls, webpki roots) makes credit calls and pulls the active campaign
//! list. The update client fetches the manifest and the artifact; it speaks
//! HTTPS only and trusts either the web PKI or the roots pinned with
//! `update.ca_cert`, since the manifest carries the checksum the artifact is
//! verified against.

use std::time::Duration;

use adnode_core::forward::{CampaignBackend, CampaignDirectory, CreditRequest, ForwardError};
use adnode_core::link::ActiveCampaign;
use adnode_core::update::{ArtifactFetcher, ManifestSource, UpdateError, UpdateManifest};
use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full, Limited};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use rustls::pki_types::CertificateDer;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, warn};

/// Largest update artifact accepted.
pub const MAX_ARTIFACT_BYTES: usize = 256 * 1024 * 1024;

/// Largest JSON body accepted from the backend.
pub const MAX_JSON_BYTES: usize = 4 * 1024 * 1024;

const USER_AGENT: &str = concat!("adnode/", env!("CARGO_PKG_VERSION"));

/// Header naming this miner to the backend.
pub const HOTKEY_HEADER: &str = "x-miner-hotkey";

/// Failure of a single HTTP exchange.
#[derive(Debug)]
enum FetchError {
    Transport(String),
    Status(StatusCode, String),
    TooLarge,
    Timeout,
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Status(status, body) => write!(f, "HTTP {status}: {body}"),
            Self::TooLarge => f.write_str("response body too large"),
            Self::Timeout => f.write_str("request timed out"),
        }
    }
}

/// Settings for [`HttpBackend`].
#[derive(Clone)]
pub struct BackendSettings {
    /// Campaign backend base URL.
    pub base_url: String,
    /// Bearer token for the backend.
    pub api_key: Option<SecretString>,
    /// This miner's hotkey.
    pub hotkey: String,
    /// Update manifest URL.
    pub manifest_url: Option<String>,
    /// Timeout for non-credit calls.
    pub request_timeout: Duration,
    /// Roots trusted for the update server; empty means the web PKI.
    pub update_roots: Vec<CertificateDer<'static>>,
}

type HttpClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// hyper-based backend client.
pub struct HttpBackend {
    client: HttpClient,
    update_client: HttpClient,
    settings: BackendSettings,
}

impl HttpBackend {
    /// Creates the clients.
    #[must_use]
    pub fn new(settings: BackendSettings) -> Self {
        let https = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(https);
        let update_client =
            Client::builder(TokioExecutor::new()).build(update_connector(&settings.update_roots));
        Self {
            client,
            update_client,
            settings,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.settings.base_url.trim_end_matches('/'))
    }

    async fn send(
        &self,
        client: &HttpClient,
        method: Method,
        url: &str,
        body: Option<Vec<u8>>,
        limit: usize,
        authenticated: bool,
    ) -> Result<Bytes, FetchError> {
        let mut request = Request::builder()
            .method(method)
            .uri(url)
            .header("User-Agent", USER_AGENT)
            .header(HOTKEY_HEADER, &self.settings.hotkey);
        if body.is_some() {
            request = request.header("Content-Type", "application/json");
        }
        if authenticated {
            if let Some(key) = &self.settings.api_key {
                request =
                    request.header("Authorization", format!("Bearer {}", key.expose_secret()));
            }
        }
        let request = request
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let response = client
            .request(request)
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        let status = response.status();

        let collected = Limited::new(response.into_body(), limit)
            .collect()
            .await
            .map_err(|e| {
                if e.is::<http_body_util::LengthLimitError>() {
                    FetchError::TooLarge
                } else {
                    FetchError::Transport(e.to_string())
                }
            })?
            .to_bytes();

        if !status.is_success() {
            let snippet =
                String::from_utf8_lossy(&collected[..collected.len().min(256)]).into_owned();
            return Err(FetchError::Status(status, snippet));
        }
        Ok(collected)
    }

    async fn get_with_timeout(
        &self,
        client: &HttpClient,
        url: &str,
        limit: usize,
        authenticated: bool,
    ) -> Result<Bytes, FetchError> {
        tokio::time::timeout(
            self.settings.request_timeout,
            self.send(client, Method::GET, url, None, limit, authenticated),
        )
        .await
        .unwrap_or(Err(FetchError::Timeout))
    }
}

fn update_connector(roots: &[CertificateDer<'static>]) -> HttpsConnector<HttpConnector> {
    let builder = HttpsConnectorBuilder::new();
    let builder = if roots.is_empty() {
        builder.with_webpki_roots()
    } else {
        let mut store = rustls::RootCertStore::empty();
        let (added, ignored) = store.add_parsable_certificates(roots.iter().cloned());
        if ignored > 0 {
            warn!(added, ignored, "some pinned update roots were not usable");
        }
        builder.with_tls_config(
            rustls::ClientConfig::builder()
                .with_root_certificates(store)
                .with_no_client_auth(),
        )
    };
    builder.https_only().enable_http1().enable_http2().build()
}

fn forward_error(e: FetchError) -> ForwardError {
    match e {
        FetchError::Status(status, _)
            if status.is_client_error()
                && status != StatusCode::TOO_MANY_REQUESTS
                && status != StatusCode::REQUEST_TIMEOUT =>
        {
            ForwardError::Refused {
                status: status.as_u16(),
            }
        },
        FetchError::Timeout => ForwardError::Timeout,
        other => ForwardError::Unavailable(other.to_string()),
    }
}

#[async_trait]
impl CampaignBackend for HttpBackend {
    async fn credit(&self, request: &CreditRequest) -> Result<(), ForwardError> {
        let body =
            serde_json::to_vec(request).map_err(|e| ForwardError::Unavailable(e.to_string()))?;
        self.send(
            &self.client,
            Method::POST,
            &self.url("/visits"),
            Some(body),
            MAX_JSON_BYTES,
            true,
        )
        .await
            .map_err(forward_error)?;
        debug!(event_id = %request.event_id, "credit accepted by backend");
        Ok(())
    }
}

#[async_trait]
impl CampaignDirectory for HttpBackend {
    async fn active_campaigns(&self) -> Result<Vec<ActiveCampaign>, ForwardError> {
        let body = self
            .get_with_timeout(
                &self.client,
                &self.url("/campaigns/active"),
                MAX_JSON_BYTES,
                true,
            )
            .await
            .map_err(forward_error)?;
        serde_json::from_slice(&body)
            .map_err(|e| ForwardError::Unavailable(format!("invalid campaign list: {e}")))
    }
}

#[async_trait]
impl ManifestSource for HttpBackend {
    async fn fetch_manifest(&self) -> Result<UpdateManifest, UpdateError> {
        let Some(url) = self.settings.manifest_url.as_deref() else {
            return Err(UpdateError::ManifestUnavailable(
                "no manifest_url configured".into(),
            ));
        };
        let body = self
            .get_with_timeout(&self.update_client, url, MAX_JSON_BYTES, false)
            .await
            .map_err(|e| UpdateError::ManifestUnavailable(e.to_string()))?;
        serde_json::from_slice(&body).map_err(|e| UpdateError::InvalidManifest(e.to_string()))
    }
}

#[async_trait]
impl ArtifactFetcher for HttpBackend {
    async fn fetch_artifact(&self, reference: &str) -> Result<Vec<u8>, UpdateError> {
        let body = self
            .send(
                &self.update_client,
                Method::GET,
                reference,
                None,
                MAX_ARTIFACT_BYTES,
                false,
            )
            .await
            .map_err(|e| UpdateError::ArtifactUnavailable(e.to_string()))?;
        Ok(body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        let refused = forward_error(FetchError::Status(StatusCode::BAD_REQUEST, String::new()));
        assert!(matches!(refused, ForwardError::Refused { status: 400 }));
        assert!(!refused.is_retryable());

        for status in [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::BAD_GATEWAY,
        ] {
            assert!(forward_error(FetchError::Status(status, String::new())).is_retryable());
        }
        assert!(matches!(
            forward_error(FetchError::Timeout),
            ForwardError::Timeout
        ));
    }

    #[test]
    fn urls_join_without_double_slash() {
        let backend = HttpBackend::new(BackendSettings {
            base_url: "https://api.example/".into(),
            api_key: None,
            hotkey: "5Hot".into(),
            manifest_url: None,
            request_timeout: Duration::from_secs(1),
            update_roots: Vec::new(),
        });
        assert_eq!(backend.url("/campaigns/active"), "https://api.example/campaigns/active");
    }

    #[tokio::test]
    async fn manifest_requires_url() {
        let backend = HttpBackend::new(BackendSettings {
            base_url: "https://api.example".into(),
            api_key: None,
            hotkey: "5Hot".into(),
            manifest_url: None,
            request_timeout: Duration::from_secs(1),
            update_roots: Vec::new(),
        });
        assert!(matches!(
            backend.fetch_manifest().await,
            Err(UpdateError::ManifestUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn update_client_refuses_plain_http() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            tokio::io::AsyncWriteExt::write_all(
                &mut stream,
                b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok",
            )
            .await
            .unwrap();
        });

        let backend = HttpBackend::new(BackendSettings {
            base_url: format!("http://{addr}"),
            api_key: None,
            hotkey: "5Hot".into(),
            manifest_url: Some(format!("http://{addr}/manifest.json")),
            request_timeout: Duration::from_secs(1),
            update_roots: Vec::new(),
        });
        assert!(matches!(
            backend.fetch_artifact(&format!("http://{addr}/adnode")).await,
            Err(UpdateError::ArtifactUnavailable(_))
        ));
        assert!(matches!(
            backend.fetch_manifest().await,
            Err(UpdateError::ManifestUnavailable(_))
        ));
        assert!(!server.is_finished());
        server.abort();
    }
}
