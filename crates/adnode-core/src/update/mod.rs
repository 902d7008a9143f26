//! Self-update supervision.
//!
//! The supervisor owns the upgrade state machine:
//!
//! ```text
//! Running -> CheckingForUpdate -> Running                     (no update)
//!                              -> Draining -> Upgrading -> Restarting
//! ```
//!
//! Draining pauses accepting on the HTTPS listener (the socket stays bound so
//! new clients wait in the kernel backlog), waits for in-flight requests up
//! to the grace period and flushes the store. Upgrading fetches the
//! artifact and verifies its SHA-256. Restarting launches the new binary
//! with the listener and the instance lock inherited and waits for it to
//! report ready. Only a ready child is committed; every failure on the way
//! resumes serving on the current version.
//!
//! The host-specific pieces (HTTP, the serving stack, process launch) sit
//! behind traits so the state machine can be driven by fakes in tests.

mod version;

use std::collections::HashSet;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub use self::version::{Version, VersionParseError};

/// Published release description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateManifest {
    /// Release version.
    pub version: Version,
    /// Where to fetch the artifact.
    pub artifact_reference: String,
    /// Hex SHA-256 of the artifact.
    pub checksum: String,
}

impl UpdateManifest {
    /// Checks the manifest is usable.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::InvalidManifest`] for a reference that is not
    /// an `https://` URL or a checksum that is not 64 hex characters.
    pub fn validate(&self) -> Result<(), UpdateError> {
        if self.artifact_reference.trim().is_empty() {
            return Err(UpdateError::InvalidManifest(
                "artifact_reference is empty".into(),
            ));
        }
        if !is_https_url(&self.artifact_reference) {
            return Err(UpdateError::InvalidManifest(
                "artifact_reference must be an https:// URL".into(),
            ));
        }
        if self.checksum.len() != 64 || hex::decode(&self.checksum).is_err() {
            return Err(UpdateError::InvalidManifest(
                "checksum must be 64 hex characters".into(),
            ));
        }
        Ok(())
    }
}

/// Whether `url` is an absolute `https://` URL with a host.
#[must_use]
pub fn is_https_url(url: &str) -> bool {
    url.parse::<http::Uri>().is_ok_and(|uri| {
        uri.scheme() == Some(&http::uri::Scheme::HTTPS)
            && uri.host().is_some_and(|host| !host.is_empty())
    })
}

/// Supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    /// Serving on the current version.
    Running,
    /// Fetching the manifest.
    CheckingForUpdate,
    /// Accept paused, waiting for in-flight requests.
    Draining,
    /// Fetching and verifying the artifact.
    Upgrading,
    /// Launching the new process and handing over.
    Restarting,
}

impl UpdateState {
    /// Lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::CheckingForUpdate => "checking_for_update",
            Self::Draining => "draining",
            Self::Upgrading => "upgrading",
            Self::Restarting => "restarting",
        }
    }
}

/// Result of one update check that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Already on the newest version.
    NoUpdate,
    /// The manifest could not be fetched; try again next interval.
    Unreachable(String),
    /// The advertised version failed before and is not retried.
    Skipped(Version),
    /// The new process is live; this process should exit.
    HandedOver(Version),
    /// Another check is running.
    AlreadyInProgress,
}

impl CheckOutcome {
    /// Stable label for metrics and the operator.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::NoUpdate => "no_update",
            Self::Unreachable(_) => "unreachable",
            Self::Skipped(_) => "skipped",
            Self::HandedOver(_) => "handed_over",
            Self::AlreadyInProgress => "already_in_progress",
        }
    }
}

/// Upgrade failures. Each one leaves the node serving on its current
/// version.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    /// Manifest fetch failed.
    #[error("update manifest unavailable: {0}")]
    ManifestUnavailable(String),

    /// Manifest is malformed.
    #[error("invalid update manifest: {0}")]
    InvalidManifest(String),

    /// Artifact fetch failed.
    #[error("update artifact unavailable: {0}")]
    ArtifactUnavailable(String),

    /// The artifact download did not finish in time.
    #[error("update artifact download timed out after {0}")]
    ArtifactTimeout(String),

    /// Artifact does not match the manifest checksum.
    #[error("artifact checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Checksum from the manifest.
        expected: String,
        /// Checksum of the fetched bytes.
        actual: String,
    },

    /// The artifact could not be written.
    #[error("failed to stage artifact: {0}")]
    Stage(#[from] std::io::Error),

    /// Flushing state before handover failed.
    #[error("failed to flush state: {0}")]
    Flush(String),

    /// The new process could not be started.
    #[error("failed to launch new version: {0}")]
    LaunchFailed(String),

    /// The new process did not report ready in time.
    #[error("new version failed its health check: {0}")]
    HealthCheckFailed(String),

    /// The commit message could not be delivered.
    #[error("handover commit failed: {0}")]
    Commit(String),
}

impl UpdateError {
    /// Stable label for metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::ManifestUnavailable(_) => "manifest_unavailable",
            Self::InvalidManifest(_) => "invalid_manifest",
            Self::ArtifactUnavailable(_) => "artifact_unavailable",
            Self::ArtifactTimeout(_) => "artifact_timeout",
            Self::ChecksumMismatch { .. } => "checksum_mismatch",
            Self::Stage(_) => "stage_failed",
            Self::Flush(_) => "flush_failed",
            Self::LaunchFailed(_) => "launch_failed",
            Self::HealthCheckFailed(_) => "health_check_failed",
            Self::Commit(_) => "commit_failed",
        }
    }

    /// Whether the version itself is bad, as opposed to a transient fault.
    ///
    /// A stalled download counts as bad: retrying it would pause serving for
    /// the full fetch timeout on every check.
    #[must_use]
    pub const fn condemns_version(&self) -> bool {
        matches!(
            self,
            Self::InvalidManifest(_)
                | Self::ArtifactTimeout(_)
                | Self::ChecksumMismatch { .. }
                | Self::LaunchFailed(_)
                | Self::HealthCheckFailed(_)
        )
    }
}

/// Verifies `bytes` against a hex SHA-256 in constant time.
///
/// # Errors
///
/// Returns [`UpdateError::ChecksumMismatch`] when the digests differ or the
/// expected value is not valid hex.
pub fn verify_checksum(bytes: &[u8], expected_hex: &str) -> Result<(), UpdateError> {
    let actual = Sha256::digest(bytes);
    let matches = hex::decode(expected_hex.trim())
        .map(|expected| bool::from(expected.as_slice().ct_eq(actual.as_slice())))
        .unwrap_or(false);
    if matches {
        Ok(())
    } else {
        Err(UpdateError::ChecksumMismatch {
            expected: expected_hex.to_string(),
            actual: hex::encode(actual),
        })
    }
}

/// Writes a verified artifact into `dir` as an executable and returns its
/// path. The file appears under its final name only once fully written.
///
/// # Errors
///
/// Returns an error if the directory or file cannot be written.
pub fn stage_artifact(dir: &Path, version: &Version, bytes: &[u8]) -> Result<PathBuf, UpdateError> {
    std::fs::create_dir_all(dir)?;
    let target = dir.join(format!("adnode-daemon-{version}"));
    let partial = dir.join(format!(".adnode-daemon-{version}.partial"));

    let mut file = std::fs::File::create(&partial)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    file.set_permissions(std::fs::Permissions::from_mode(0o755))?;
    drop(file);
    std::fs::rename(&partial, &target)?;
    Ok(target)
}

// =============================================================================
// Collaborators
// =============================================================================

/// Source of the update manifest.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Fetches the current manifest.
    async fn fetch_manifest(&self) -> Result<UpdateManifest, UpdateError>;
}

/// Fetches artifact bytes by reference.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Downloads the artifact.
    async fn fetch_artifact(&self, reference: &str) -> Result<Vec<u8>, UpdateError>;
}

/// Outcome of draining in-flight requests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Requests that finished within the grace period.
    pub completed: usize,
    /// Requests aborted after it.
    pub aborted: usize,
}

/// The serving stack as seen by the supervisor.
#[async_trait]
pub trait ServingControl: Send + Sync {
    /// Stops accepting new connections while keeping the socket bound.
    fn pause_accepting(&self);

    /// Resumes accepting.
    fn resume_accepting(&self);

    /// Waits up to `grace` for in-flight requests, then aborts the rest.
    async fn drain(&self, grace: Duration) -> DrainReport;

    /// Makes all state durable.
    async fn flush(&self) -> Result<(), UpdateError>;
}

/// Starts a new node process with the shared resources inherited.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Spawns the staged binary.
    async fn launch(
        &self,
        artifact: &Path,
        version: &Version,
    ) -> Result<Box<dyn LaunchedInstance>, UpdateError>;
}

/// A launched but uncommitted process.
#[async_trait]
pub trait LaunchedInstance: Send {
    /// Waits for the readiness report.
    async fn await_ready(&mut self) -> Result<(), UpdateError>;

    /// Tells the process to take over.
    async fn commit(self: Box<Self>) -> Result<(), UpdateError>;

    /// Stops the process.
    async fn abort(self: Box<Self>);
}

// =============================================================================
// Supervisor
// =============================================================================

/// Timing for an upgrade.
#[derive(Debug, Clone)]
pub struct UpdateTimings {
    /// Grace for in-flight requests.
    pub drain_grace: Duration,
    /// Time the artifact download may take.
    pub fetch_timeout: Duration,
    /// Time the child has to report ready.
    pub health_timeout: Duration,
}

/// Drives update checks and handovers.
pub struct UpdateSupervisor {
    current: Version,
    manifests: Arc<dyn ManifestSource>,
    artifacts: Arc<dyn ArtifactFetcher>,
    serving: Arc<dyn ServingControl>,
    launcher: Arc<dyn Launcher>,
    artifact_dir: PathBuf,
    timings: UpdateTimings,
    state: watch::Sender<UpdateState>,
    handed_over: watch::Sender<Option<Version>>,
    failed_versions: Mutex<HashSet<Version>>,
    check_lock: tokio::sync::Mutex<()>,
}

impl UpdateSupervisor {
    /// Creates a supervisor for the running `current` version.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        current: Version,
        manifests: Arc<dyn ManifestSource>,
        artifacts: Arc<dyn ArtifactFetcher>,
        serving: Arc<dyn ServingControl>,
        launcher: Arc<dyn Launcher>,
        artifact_dir: PathBuf,
        timings: UpdateTimings,
    ) -> Self {
        let (state, _) = watch::channel(UpdateState::Running);
        let (handed_over, _) = watch::channel(None);
        Self {
            current,
            manifests,
            artifacts,
            serving,
            launcher,
            artifact_dir,
            timings,
            state,
            handed_over,
            failed_versions: Mutex::new(HashSet::new()),
            check_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> UpdateState {
        *self.state.borrow()
    }

    /// State changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<UpdateState> {
        self.state.subscribe()
    }

    /// Becomes `Some(version)` once a new process has taken over.
    #[must_use]
    pub fn handover_signal(&self) -> watch::Receiver<Option<Version>> {
        self.handed_over.subscribe()
    }

    /// Versions that failed verification or health checks.
    #[must_use]
    pub fn failed_versions(&self) -> Vec<Version> {
        let mut versions: Vec<_> = self
            .failed_versions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        versions.sort();
        versions
    }

    /// Runs one check and, if a newer healthy release exists, the full
    /// upgrade.
    ///
    /// # Errors
    ///
    /// Returns the upgrade failure after serving has been resumed on the
    /// current version.
    pub async fn check_once(&self) -> Result<CheckOutcome, UpdateError> {
        let Ok(_guard) = self.check_lock.try_lock() else {
            return Ok(CheckOutcome::AlreadyInProgress);
        };
        if self.handed_over.borrow().is_some() {
            return Ok(CheckOutcome::AlreadyInProgress);
        }

        self.set_state(UpdateState::CheckingForUpdate);
        let manifest = match self.manifests.fetch_manifest().await {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(error = %e, "update check failed");
                self.set_state(UpdateState::Running);
                return Ok(CheckOutcome::Unreachable(e.to_string()));
            },
        };

        if manifest.version <= self.current {
            debug!(current = %self.current, advertised = %manifest.version, "no update available");
            self.set_state(UpdateState::Running);
            return Ok(CheckOutcome::NoUpdate);
        }
        if self.is_failed(&manifest.version) {
            debug!(version = %manifest.version, "skipping previously failed version");
            self.set_state(UpdateState::Running);
            return Ok(CheckOutcome::Skipped(manifest.version));
        }

        info!(current = %self.current, target = %manifest.version, "update available");
        match self.upgrade(&manifest).await {
            Ok(()) => {
                info!(version = %manifest.version, "handover committed");
                self.handed_over.send_replace(Some(manifest.version.clone()));
                Ok(CheckOutcome::HandedOver(manifest.version))
            },
            Err(e) => {
                error!(
                    version = %manifest.version,
                    error = %e,
                    "upgrade failed, staying on current version"
                );
                if e.condemns_version() {
                    self.failed_versions
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(manifest.version.clone());
                }
                self.serving.resume_accepting();
                self.set_state(UpdateState::Running);
                Err(e)
            },
        }
    }

    async fn upgrade(&self, manifest: &UpdateManifest) -> Result<(), UpdateError> {
        manifest.validate()?;

        self.set_state(UpdateState::Draining);
        self.serving.pause_accepting();
        let drained = self.serving.drain(self.timings.drain_grace).await;
        if drained.aborted > 0 {
            warn!(
                aborted = drained.aborted,
                completed = drained.completed,
                "aborted requests past drain grace"
            );
        }
        self.serving.flush().await?;

        self.set_state(UpdateState::Upgrading);
        let fetch = self.artifacts.fetch_artifact(&manifest.artifact_reference);
        let bytes = tokio::time::timeout(self.timings.fetch_timeout, fetch)
            .await
            .map_err(|_| {
                UpdateError::ArtifactTimeout(
                    humantime::format_duration(self.timings.fetch_timeout).to_string(),
                )
            })??;

        let dir = self.artifact_dir.clone();
        let version = manifest.version.clone();
        let checksum = manifest.checksum.clone();
        let staged = tokio::task::spawn_blocking(move || {
            verify_checksum(&bytes, &checksum)?;
            stage_artifact(&dir, &version, &bytes)
        })
        .await
        .map_err(|e| UpdateError::Stage(std::io::Error::other(e)))??;
        info!(path = %staged.display(), "artifact verified and staged");

        self.set_state(UpdateState::Restarting);
        let mut child = self.launcher.launch(&staged, &manifest.version).await?;
        let health_timeout = self.timings.health_timeout;
        let ready = match tokio::time::timeout(health_timeout, child.await_ready()).await {
            Ok(result) => result,
            Err(_) => Err(UpdateError::HealthCheckFailed(format!(
                "no readiness report within {}",
                humantime::format_duration(self.timings.health_timeout)
            ))),
        };
        if let Err(e) = ready {
            child.abort().await;
            return Err(e);
        }
        child.commit().await
    }

    /// Checks every `interval` until `shutdown` flips or a handover commits.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
        mut on_check: impl FnMut(&Result<CheckOutcome, UpdateError>) + Send,
    ) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let result = self.check_once().await;
                    on_check(&result);
                    if matches!(result, Ok(CheckOutcome::HandedOver(_))) {
                        break;
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

    fn is_failed(&self, version: &Version) -> bool {
        self.failed_versions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(version)
    }

    fn set_state(&self, state: UpdateState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = previous.as_str(), to = state.as_str(), "update state");
        }
    }
}
