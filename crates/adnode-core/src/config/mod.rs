//! Configuration parsing and management.
//!
//! The node is configured from a single `adnode.toml` file. Identity values
//! (wallet, hotkey, network, chain endpoint, neuron role) may also come from
//! the environment the external process manager starts us with; environment
//! values win over the file.
//!
//! Durations are human-readable strings (`"30m"`, `"24h"`).
//!
//! # Validation
//!
//! [`NodeConfig::validate`] must pass before the node serves anything. A
//! failure is a [`ConfigError::Validation`] and aborts startup.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffConfig;
use crate::link::is_redirect_url;
use crate::update::is_https_url;

/// Upper bound on the link refresh period.
pub const MAX_LINK_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Environment variable overriding `identity.wallet_name`.
pub const ENV_WALLET_NAME: &str = "ADNODE_WALLET_NAME";
/// Environment variable overriding `identity.hotkey`.
pub const ENV_WALLET_HOTKEY: &str = "ADNODE_WALLET_HOTKEY";
/// Environment variable overriding `identity.network`.
pub const ENV_SUBTENSOR_NETWORK: &str = "ADNODE_SUBTENSOR_NETWORK";
/// Environment variable overriding `identity.chain_endpoint`.
pub const ENV_CHAIN_ENDPOINT: &str = "ADNODE_CHAIN_ENDPOINT";
/// Environment variable overriding `identity.neuron_type`.
pub const ENV_NEURON_TYPE: &str = "ADNODE_NEURON_TYPE";

/// Top-level node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Network identity of this node.
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Daemon paths.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Public HTTPS endpoint.
    #[serde(default)]
    pub endpoint: EndpointConfig,

    /// Link issuance.
    #[serde(default)]
    pub links: LinkConfig,

    /// Attribution and dedup.
    #[serde(default)]
    pub attribution: AttributionConfig,

    /// Campaign backend forwarding.
    #[serde(default)]
    pub forward: ForwardConfig,

    /// Two-factor code book.
    #[serde(default)]
    pub two_factor: TwoFactorConfig,

    /// Self-update.
    #[serde(default)]
    pub update: UpdateConfig,
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or contains unknown keys.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Apply identity overrides from the process environment.
    pub fn apply_process_env(&mut self) {
        self.apply_env(|key| std::env::var(key).ok());
    }

    /// Apply identity overrides from an arbitrary lookup.
    ///
    /// Empty values are ignored so an exported-but-blank variable does not
    /// wipe a value from the file.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get(ENV_WALLET_NAME) {
            self.identity.wallet_name = v;
        }
        if let Some(v) = get(ENV_WALLET_HOTKEY) {
            self.identity.hotkey = v;
        }
        if let Some(v) = get(ENV_SUBTENSOR_NETWORK) {
            self.identity.network = v;
        }
        if let Some(v) = get(ENV_CHAIN_ENDPOINT) {
            self.identity.chain_endpoint = Some(v);
        }
        if let Some(v) = get(ENV_NEURON_TYPE) {
            self.identity.neuron_type = v;
        }
    }

    /// Check every section for values the node cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.identity.validate()?;
        self.endpoint.validate()?;
        self.links.validate()?;
        self.attribution.validate()?;
        self.forward.validate()?;
        self.update.validate()?;
        if self.two_factor.code_ttl.is_zero() {
            return Err(invalid("two_factor.code_ttl must be greater than zero"));
        }
        Ok(())
    }

    /// Path of the `SQLite` state database.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.daemon.state_dir.join("node.db")
    }

    /// Directory where verified update artifacts are staged.
    #[must_use]
    pub fn artifact_dir(&self) -> PathBuf {
        self.update
            .artifact_dir
            .clone()
            .unwrap_or_else(|| self.daemon.state_dir.join("artifacts"))
    }

    /// Path of the Unix socket used for the handover readiness exchange.
    #[must_use]
    pub fn handover_socket(&self) -> PathBuf {
        self.daemon.state_dir.join("handover.sock")
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation(message.into())
}

// =============================================================================
// Identity
// =============================================================================

/// Network identity of the node.
///
/// Registration itself happens outside the node; these values only have to
/// be present and well formed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityConfig {
    /// Wallet (coldkey) name.
    #[serde(default)]
    pub wallet_name: String,

    /// Hotkey name.
    #[serde(default)]
    pub hotkey: String,

    /// Subtensor network (`finney`, `test`, `local`, ...).
    #[serde(default = "default_network")]
    pub network: String,

    /// Chain endpoint override (`ws://` or `wss://`).
    #[serde(default)]
    pub chain_endpoint: Option<String>,

    /// Neuron role. Only `miner` is served by this binary.
    #[serde(default = "default_neuron_type")]
    pub neuron_type: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            wallet_name: String::new(),
            hotkey: String::new(),
            network: default_network(),
            chain_endpoint: None,
            neuron_type: default_neuron_type(),
        }
    }
}

impl IdentityConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.wallet_name.trim().is_empty() {
            return Err(invalid(format!(
                "identity.wallet_name is required (or set {ENV_WALLET_NAME})"
            )));
        }
        if self.hotkey.trim().is_empty() {
            return Err(invalid(format!(
                "identity.hotkey is required (or set {ENV_WALLET_HOTKEY})"
            )));
        }
        if self.network.trim().is_empty() {
            return Err(invalid("identity.network must not be empty"));
        }
        if let Some(endpoint) = &self.chain_endpoint {
            if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
                return Err(invalid(format!(
                    "identity.chain_endpoint must be a ws:// or wss:// URL, got '{endpoint}'"
                )));
            }
        }
        if self.neuron_type != "miner" {
            return Err(invalid(format!(
                "identity.neuron_type must be 'miner', got '{}'",
                self.neuron_type
            )));
        }
        Ok(())
    }
}

fn default_network() -> String {
    "finney".to_string()
}

fn default_neuron_type() -> String {
    "miner".to_string()
}

// =============================================================================
// Daemon paths
// =============================================================================

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Path to the PID file read by the external process manager.
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,

    /// Path to the single-instance lock file.
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,

    /// Path to the operator socket (mode 0600).
    #[serde(default = "default_operator_socket")]
    pub operator_socket: PathBuf,

    /// Directory holding the state database and staged artifacts.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
            lock_file: default_lock_file(),
            operator_socket: default_operator_socket(),
            state_dir: default_state_dir(),
        }
    }
}

fn runtime_dir() -> PathBuf {
    // ${XDG_RUNTIME_DIR}/adnode, falling back to /tmp/adnode
    std::env::var("XDG_RUNTIME_DIR").map_or_else(
        |_| PathBuf::from("/tmp/adnode"),
        |runtime_dir| PathBuf::from(runtime_dir).join("adnode"),
    )
}

fn default_pid_file() -> PathBuf {
    runtime_dir().join("adnode.pid")
}

fn default_lock_file() -> PathBuf {
    runtime_dir().join("adnode.lock")
}

/// Default operator socket path, shared with the CLI.
#[must_use]
pub fn default_operator_socket() -> PathBuf {
    runtime_dir().join("operator.sock")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/adnode")
}

// =============================================================================
// Endpoint
// =============================================================================

/// Public HTTPS endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Address to bind.
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// The fixed secure port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// PEM certificate chain.
    #[serde(default = "default_cert_path")]
    pub cert_path: PathBuf,

    /// PEM private key.
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,

    /// Environment variable holding the shared secret the registration flow
    /// presents when delivering two-factor codes. Delivery is refused when
    /// the variable is unset.
    #[serde(default = "default_registration_secret_env")]
    pub registration_secret_env: String,

    /// Maximum concurrent TLS connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Timeout for the TLS handshake of a single connection.
    #[serde(default = "default_handshake_timeout")]
    #[serde(with = "crate::humantime_serde")]
    pub handshake_timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            cert_path: default_cert_path(),
            key_path: default_key_path(),
            registration_secret_env: default_registration_secret_env(),
            max_connections: default_max_connections(),
            handshake_timeout: default_handshake_timeout(),
        }
    }
}

impl EndpointConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(invalid("endpoint.port must be a fixed, non-zero port"));
        }
        if self.max_connections == 0 {
            return Err(invalid("endpoint.max_connections must be greater than zero"));
        }
        Ok(())
    }
}

const fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

const fn default_port() -> u16 {
    443
}

fn default_cert_path() -> PathBuf {
    PathBuf::from("cert.pem")
}

fn default_key_path() -> PathBuf {
    PathBuf::from("key.pem")
}

fn default_registration_secret_env() -> String {
    "ADNODE_REGISTRATION_SECRET".to_string()
}

const fn default_max_connections() -> usize {
    1024
}

const fn default_handshake_timeout() -> Duration {
    Duration::from_secs(10)
}

// =============================================================================
// Links
// =============================================================================

/// Link issuance configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// How often active campaigns are synced and due links regenerated.
    #[serde(default = "default_refresh_interval")]
    #[serde(with = "crate::humantime_serde")]
    pub refresh_interval: Duration,

    /// Lifetime of an issued link. Links never expire when unset.
    #[serde(default)]
    #[serde(with = "crate::humantime_serde::option")]
    pub ttl: Option<Duration>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            refresh_interval: default_refresh_interval(),
            ttl: None,
        }
    }
}

impl LinkConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.refresh_interval.is_zero() || self.refresh_interval > MAX_LINK_REFRESH_INTERVAL {
            return Err(invalid(format!(
                "links.refresh_interval must be between 1s and {}",
                humantime::format_duration(MAX_LINK_REFRESH_INTERVAL)
            )));
        }
        if self.ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(invalid("links.ttl must be greater than zero when set"));
        }
        Ok(())
    }
}

const fn default_refresh_interval() -> Duration {
    MAX_LINK_REFRESH_INTERVAL
}

// =============================================================================
// Attribution
// =============================================================================

/// Attribution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributionConfig {
    /// Window within which a repeated (link, fingerprint) pair is a duplicate.
    #[serde(default = "default_dedup_window")]
    #[serde(with = "crate::humantime_serde")]
    pub dedup_window: Duration,

    /// Hard cap on tracked (link, fingerprint) pairs.
    #[serde(default = "default_max_tracked_keys")]
    pub max_tracked_keys: usize,

    /// Run expiry cleanup every N requests.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,

    /// Redirect target for attributed visits to links without a landing
    /// page. `{campaign_id}` and `{event_id}` are substituted.
    #[serde(default = "default_redirect_template")]
    pub redirect_template: String,

    /// Redirect target for rejected visits.
    #[serde(default = "default_not_found_url")]
    pub not_found_url: String,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            dedup_window: default_dedup_window(),
            max_tracked_keys: default_max_tracked_keys(),
            cleanup_interval: default_cleanup_interval(),
            redirect_template: default_redirect_template(),
            not_found_url: default_not_found_url(),
        }
    }
}

impl AttributionConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.dedup_window.is_zero() {
            return Err(invalid("attribution.dedup_window must be greater than zero"));
        }
        if self.max_tracked_keys == 0 {
            return Err(invalid(
                "attribution.max_tracked_keys must be greater than zero",
            ));
        }
        if self.cleanup_interval == 0 {
            return Err(invalid(
                "attribution.cleanup_interval must be greater than zero",
            ));
        }
        if !self.redirect_template.contains("{event_id}") {
            return Err(invalid(
                "attribution.redirect_template must contain '{event_id}'",
            ));
        }
        let sample = self
            .redirect_template
            .replace("{campaign_id}", "campaign")
            .replace("{event_id}", "00000000-0000-0000-0000-000000000000");
        if !is_redirect_url(&sample) {
            return Err(invalid(
                "attribution.redirect_template must be an absolute http(s) URL",
            ));
        }
        if !is_redirect_url(&self.not_found_url) {
            return Err(invalid(
                "attribution.not_found_url must be an absolute http(s) URL",
            ));
        }
        Ok(())
    }
}

const fn default_dedup_window() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

const fn default_max_tracked_keys() -> usize {
    100_000
}

const fn default_cleanup_interval() -> u64 {
    1000
}

fn default_redirect_template() -> String {
    "https://v.bitads.ai/campaigns/{campaign_id}?id={event_id}".to_string()
}

fn default_not_found_url() -> String {
    "https://v.bitads.ai/404".to_string()
}

// =============================================================================
// Forwarding
// =============================================================================

/// Campaign backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardConfig {
    /// Base URL of the campaign backend.
    #[serde(default = "default_backend_url")]
    pub backend_url: String,

    /// Environment variable holding the backend API key, if any.
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Per-attempt timeout.
    #[serde(default = "default_request_timeout")]
    #[serde(with = "crate::humantime_serde")]
    pub request_timeout: Duration,

    /// Attempts before an event is parked for reconciliation.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay between attempts.
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Capacity of the in-memory forward queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Concurrent credit calls.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// How often parked events are retried.
    #[serde(default = "default_reconcile_interval")]
    #[serde(with = "crate::humantime_serde")]
    pub reconcile_interval: Duration,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
            api_key_env: None,
            request_timeout: default_request_timeout(),
            max_attempts: default_max_attempts(),
            backoff: BackoffConfig::default(),
            queue_capacity: default_queue_capacity(),
            concurrency: default_concurrency(),
            reconcile_interval: default_reconcile_interval(),
        }
    }
}

impl ForwardConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.backend_url.starts_with("https://") || self.backend_url.starts_with("http://"))
        {
            return Err(invalid(format!(
                "forward.backend_url must be an http(s) URL, got '{}'",
                self.backend_url
            )));
        }
        if self.max_attempts == 0 {
            return Err(invalid("forward.max_attempts must be at least 1"));
        }
        if self.queue_capacity == 0 || self.concurrency == 0 {
            return Err(invalid(
                "forward.queue_capacity and forward.concurrency must be greater than zero",
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(invalid("forward.request_timeout must be greater than zero"));
        }
        Ok(())
    }
}

fn default_backend_url() -> String {
    "https://api.bitads.ai".to_string()
}

const fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_queue_capacity() -> usize {
    4096
}

const fn default_concurrency() -> usize {
    8
}

const fn default_reconcile_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

// =============================================================================
// Two-factor
// =============================================================================

/// Two-factor code configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwoFactorConfig {
    /// How long a delivered code stays retrievable.
    #[serde(default = "default_code_ttl")]
    #[serde(with = "crate::humantime_serde")]
    pub code_ttl: Duration,
}

impl Default for TwoFactorConfig {
    fn default() -> Self {
        Self {
            code_ttl: default_code_ttl(),
        }
    }
}

const fn default_code_ttl() -> Duration {
    Duration::from_secs(10 * 60)
}

// =============================================================================
// Update
// =============================================================================

/// Self-update configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Whether the periodic update check runs.
    #[serde(default)]
    pub enabled: bool,

    /// URL of the JSON update manifest.
    #[serde(default)]
    pub manifest_url: Option<String>,

    /// Period between checks.
    #[serde(default = "default_check_interval")]
    #[serde(with = "crate::humantime_serde")]
    pub check_interval: Duration,

    /// Grace period for in-flight requests while draining.
    #[serde(default = "default_drain_grace")]
    #[serde(with = "crate::humantime_serde")]
    pub drain_grace: Duration,

    /// Time the artifact download may take.
    #[serde(default = "default_fetch_timeout")]
    #[serde(with = "crate::humantime_serde")]
    pub fetch_timeout: Duration,

    /// Time the new process has to report ready.
    #[serde(default = "default_health_timeout")]
    #[serde(with = "crate::humantime_serde")]
    pub health_timeout: Duration,

    /// Where verified artifacts are staged (default: `<state_dir>/artifacts`).
    #[serde(default)]
    pub artifact_dir: Option<PathBuf>,

    /// PEM bundle of root certificates for the release server. When set,
    /// only these roots are trusted for the manifest and the artifact;
    /// otherwise the public web PKI is.
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            manifest_url: None,
            check_interval: default_check_interval(),
            drain_grace: default_drain_grace(),
            fetch_timeout: default_fetch_timeout(),
            health_timeout: default_health_timeout(),
            artifact_dir: None,
            ca_cert: None,
        }
    }
}

impl UpdateConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.manifest_url.is_none() {
            return Err(invalid("update.manifest_url is required when update.enabled = true"));
        }
        if self
            .manifest_url
            .as_deref()
            .is_some_and(|url| !is_https_url(url))
        {
            return Err(invalid("update.manifest_url must be an https:// URL"));
        }
        if self.check_interval.is_zero() {
            return Err(invalid("update.check_interval must be greater than zero"));
        }
        if self.fetch_timeout.is_zero() {
            return Err(invalid("update.fetch_timeout must be greater than zero"));
        }
        if self.health_timeout.is_zero() {
            return Err(invalid("update.health_timeout must be greater than zero"));
        }
        Ok(())
    }
}

const fn default_check_interval() -> Duration {
    Duration::from_secs(15 * 60)
}

const fn default_drain_grace() -> Duration {
    Duration::from_secs(30)
}

const fn default_fetch_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

const fn default_health_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const MINIMAL: &str = r#"
        [identity]
        wallet_name = "miner"
        hotkey = "default"
    "#;

    #[test]
    fn test_parse_minimal_config() {
        let config = NodeConfig::from_toml(MINIMAL).unwrap();
        config.validate().unwrap();

        assert_eq!(config.identity.network, "finney");
        assert_eq!(config.identity.neuron_type, "miner");
        assert_eq!(config.endpoint.port, 443);
        assert_eq!(config.links.refresh_interval, Duration::from_secs(1800));
        assert_eq!(
            config.attribution.dedup_window,
            Duration::from_secs(24 * 60 * 60)
        );
        assert!(!config.update.enabled);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [identity]
            wallet_name = "miner"
            hotkey = "hk1"
            network = "test"
            chain_endpoint = "wss://entrypoint.example:443"

            [daemon]
            pid_file = "/tmp/adnode.pid"
            lock_file = "/tmp/adnode.lock"
            operator_socket = "/tmp/adnode/operator.sock"
            state_dir = "/tmp/adnode/state"

            [endpoint]
            bind_address = "127.0.0.1"
            port = 8443
            cert_path = "/etc/adnode/cert.pem"
            key_path = "/etc/adnode/key.pem"

            [links]
            refresh_interval = "10m"
            ttl = "7days"

            [attribution]
            dedup_window = "1h"
            max_tracked_keys = 500

            [forward]
            backend_url = "https://backend.example"
            max_attempts = 3

            [forward.backoff]
            type = "fixed"
            delay = "1s"

            [update]
            enabled = true
            manifest_url = "https://releases.example/manifest.json"
            drain_grace = "5s"
        "#;

        let config = NodeConfig::from_toml(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.endpoint.port, 8443);
        assert_eq!(config.links.ttl, Some(Duration::from_secs(7 * 24 * 60 * 60)));
        assert_eq!(config.attribution.max_tracked_keys, 500);
        assert_eq!(
            config.forward.backoff.delay_for_attempt(3),
            Duration::from_secs(1)
        );
        assert_eq!(config.update.drain_grace, Duration::from_secs(5));
        assert_eq!(
            config.database_path(),
            PathBuf::from("/tmp/adnode/state/node.db")
        );
        assert_eq!(
            config.artifact_dir(),
            PathBuf::from("/tmp/adnode/state/artifacts")
        );
    }

    #[test]
    fn missing_identity_is_a_validation_error() {
        let config = NodeConfig::from_toml("").unwrap();
        match config.validate() {
            Err(ConfigError::Validation(msg)) => assert!(msg.contains("wallet_name"), "{msg}"),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn environment_overrides_identity() {
        let mut config = NodeConfig::from_toml(MINIMAL).unwrap();
        let env: HashMap<&str, &str> = [
            (ENV_WALLET_NAME, "from-env"),
            (ENV_WALLET_HOTKEY, ""),
            (ENV_SUBTENSOR_NETWORK, "local"),
            (ENV_CHAIN_ENDPOINT, "ws://127.0.0.1:9944"),
        ]
        .into_iter()
        .collect();

        config.apply_env(|key| env.get(key).map(ToString::to_string));

        assert_eq!(config.identity.wallet_name, "from-env");
        // blank values do not clobber the file
        assert_eq!(config.identity.hotkey, "default");
        assert_eq!(config.identity.network, "local");
        assert_eq!(
            config.identity.chain_endpoint.as_deref(),
            Some("ws://127.0.0.1:9944")
        );
        config.validate().unwrap();
    }

    #[test]
    fn rejects_validator_role() {
        let mut config = NodeConfig::from_toml(MINIMAL).unwrap();
        config.identity.neuron_type = "validator".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn rejects_refresh_interval_above_thirty_minutes() {
        let toml = format!("{MINIMAL}\n[links]\nrefresh_interval = \"45m\"\n");
        let config = NodeConfig::from_toml(&toml).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn rejects_non_websocket_chain_endpoint() {
        let mut config = NodeConfig::from_toml(MINIMAL).unwrap();
        config.identity.chain_endpoint = Some("http://node".to_string());
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn update_requires_manifest_url() {
        let toml = format!("{MINIMAL}\n[update]\nenabled = true\n");
        let config = NodeConfig::from_toml(&toml).unwrap();
        match config.validate() {
            Err(ConfigError::Validation(msg)) => assert!(msg.contains("manifest_url"), "{msg}"),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn update_manifest_must_be_https() {
        let toml = format!(
            "{MINIMAL}\n[update]\nenabled = true\n{}",
            "manifest_url = \"http://releases.example/m.json\"\n"
        );
        let config = NodeConfig::from_toml(&toml).unwrap();
        match config.validate() {
            Err(ConfigError::Validation(msg)) => assert!(msg.contains("https"), "{msg}"),
            other => panic!("expected validation error, got {other:?}"),
        }

        let toml = format!("{MINIMAL}\n[update]\nfetch_timeout = \"90s\"\n");
        let config = NodeConfig::from_toml(&toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.update.fetch_timeout, Duration::from_secs(90));
    }

    #[test]
    fn redirect_targets_must_be_absolute_urls() {
        let mut config = NodeConfig::from_toml(MINIMAL).unwrap();
        config.attribution.not_found_url = "/404".to_string();
        match config.validate() {
            Err(ConfigError::Validation(msg)) => assert!(msg.contains("not_found_url"), "{msg}"),
            other => panic!("expected validation error, got {other:?}"),
        }

        let mut config = NodeConfig::from_toml(MINIMAL).unwrap();
        config.attribution.redirect_template = "https://v.example/c?id={event_id}\n".to_string();
        match config.validate() {
            Err(ConfigError::Validation(msg)) => {
                assert!(msg.contains("redirect_template"), "{msg}");
            },
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_section() {
        let toml = format!("{MINIMAL}\n[processes]\nname = \"x\"\n");
        assert!(matches!(
            NodeConfig::from_toml(&toml),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = NodeConfig::from_toml(MINIMAL).unwrap();
        let text = config.to_toml().unwrap();
        let reparsed = NodeConfig::from_toml(&text).unwrap();
        assert_eq!(reparsed.identity, config.identity);
    }
}
