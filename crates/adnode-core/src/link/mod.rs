//! Campaign links.
//!
//! The [`LinkRegistry`] maps each campaign to the one tracking link this node
//! currently serves for it. Links are issued when the backend reports a
//! campaign as activated, regenerated when their TTL passes or an operator
//! asks, and revoked when the campaign ends.
//!
//! # Invariants
//!
//! - At most one `active` link per campaign. The store enforces this with a
//!   partial unique index as well.
//! - A token is never reused; collisions against the store are re-rolled.
//! - A link is persisted before any operation that returns it, so a restart
//!   (including an upgrade handover) keeps every distributed URL working.
//! - Mutations for the same campaign are serialized. Lookups take no
//!   mutation lock.

mod token;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use self::token::{LinkToken, TOKEN_BYTES, TOKEN_LEN};
use crate::store::{NodeStore, StoreError};

/// Maximum accepted campaign identifier length.
pub const MAX_CAMPAIGN_ID_LEN: usize = 64;

/// Re-rolls allowed when a generated token already exists.
const MAX_TOKEN_ATTEMPTS: u32 = 8;

/// Lifecycle state of a campaign link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    /// Served.
    Active,
    /// Regenerated or past its TTL.
    Expired,
    /// Campaign ended.
    Revoked,
}

impl LinkStatus {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
        }
    }

    /// Parses the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "expired" => Some(Self::Expired),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }
}

/// A node-specific tracking link for one campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignLink {
    /// Campaign identifier assigned by the backend.
    pub campaign_id: String,
    /// Token embedded in the tracking URL.
    pub link_token: LinkToken,
    /// Issue time.
    pub created_at: DateTime<Utc>,
    /// Expiry time, if links have a TTL.
    pub expires_at: Option<DateTime<Utc>>,
    /// Lifecycle state.
    pub status: LinkStatus,
    /// Product page visitors are sent to, when the campaign has one.
    pub landing_url: Option<String>,
}

impl CampaignLink {
    /// Whether the link is served at `now`.
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.status == LinkStatus::Active && self.expires_at.is_none_or(|exp| now < exp)
    }
}

/// A campaign the backend reports as currently activated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveCampaign {
    /// Campaign identifier.
    pub campaign_id: String,
    /// Product page for cost-per-action campaigns.
    #[serde(default)]
    pub landing_url: Option<String>,
}

/// Result of a campaign sync pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Campaigns that received a new link.
    pub issued: usize,
    /// Campaigns whose links were revoked.
    pub revoked: usize,
    /// Campaigns whose existing link was kept.
    pub unchanged: usize,
    /// Campaigns skipped because the backend sent an unusable landing page.
    pub rejected: usize,
}

/// Whether `url` can be sent to a browser as a redirect target: an absolute
/// `http(s)://` URL with a host that is also a valid header value.
#[must_use]
pub fn is_redirect_url(url: &str) -> bool {
    if http::HeaderValue::from_str(url).is_err() {
        return false;
    }
    url.parse::<http::Uri>().is_ok_and(|uri| {
        matches!(uri.scheme_str(), Some("http" | "https"))
            && uri.host().is_some_and(|host| !host.is_empty())
    })
}

/// Client-facing token lookup failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenError {
    /// No link was ever issued with this token.
    #[error("link token not found")]
    NotFound,
    /// The link was regenerated, revoked or passed its TTL.
    #[error("link token expired")]
    Expired,
}

/// Registry operation failure.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// Persistence failed; nothing was changed in memory.
    #[error("link store error: {0}")]
    Store(#[from] StoreError),

    /// Campaign identifier is empty, too long or has unsafe characters.
    #[error("invalid campaign id: {0:?}")]
    InvalidCampaignId(String),

    /// No active link exists for the campaign.
    #[error("no active link for campaign {0}")]
    NoActiveLink(String),

    /// Could not draw an unused token.
    #[error("could not generate a unique link token after {MAX_TOKEN_ATTEMPTS} attempts")]
    TokenSpaceExhausted,
}

/// Validates a campaign identifier from the backend or a request path.
///
/// # Errors
///
/// Returns [`LinkError::InvalidCampaignId`] for empty, overlong or
/// non `[A-Za-z0-9_-]` identifiers.
pub fn validate_campaign_id(campaign_id: &str) -> Result<(), LinkError> {
    let ok = !campaign_id.is_empty()
        && campaign_id.len() <= MAX_CAMPAIGN_ID_LEN
        && campaign_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if ok {
        Ok(())
    } else {
        Err(LinkError::InvalidCampaignId(campaign_id.to_string()))
    }
}

/// Maps campaigns to their unique tracking links.
pub struct LinkRegistry {
    store: Arc<NodeStore>,
    ttl: Option<Duration>,
    // Every link this node ever issued, keyed by token.
    by_token: RwLock<HashMap<LinkToken, CampaignLink>>,
    // Token of the active link per campaign.
    active: RwLock<HashMap<String, LinkToken>>,
    // Per-campaign mutation locks.
    campaign_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LinkRegistry {
    /// Loads all persisted links and builds the registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn load(store: Arc<NodeStore>, ttl: Option<Duration>) -> Result<Self, LinkError> {
        let links = store.load_links()?;
        let mut by_token = HashMap::with_capacity(links.len());
        let mut active = HashMap::new();
        for link in links {
            if link.status == LinkStatus::Active {
                active.insert(link.campaign_id.clone(), link.link_token.clone());
            }
            by_token.insert(link.link_token.clone(), link);
        }
        info!(
            links = by_token.len(),
            active = active.len(),
            "link registry loaded"
        );
        Ok(Self {
            store,
            ttl,
            by_token: RwLock::new(by_token),
            active: RwLock::new(active),
            campaign_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the current link for `campaign_id`, issuing one if there is
    /// no valid active link.
    ///
    /// A still-valid token is never reissued.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid campaign ids or store failures.
    pub fn issue_or_refresh(&self, campaign_id: &str) -> Result<CampaignLink, LinkError> {
        self.issue_or_refresh_at(campaign_id, Utc::now())
    }

    /// [`Self::issue_or_refresh`] evaluated at `now`.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid campaign ids or store failures.
    pub fn issue_or_refresh_at(
        &self,
        campaign_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CampaignLink, LinkError> {
        validate_campaign_id(campaign_id)?;
        let lock = self.campaign_lock(campaign_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        match self.current(campaign_id) {
            Some(link) if link.is_valid_at(now) => Ok(link),
            current => {
                let landing_url = current.as_ref().and_then(|l| l.landing_url.clone());
                self.replace(campaign_id, current, landing_url, now)
            },
        }
    }

    /// Forces a new token for `campaign_id`, expiring the previous one.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid campaign ids or store failures.
    pub fn refresh(&self, campaign_id: &str) -> Result<CampaignLink, LinkError> {
        validate_campaign_id(campaign_id)?;
        let lock = self.campaign_lock(campaign_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let current = self.current(campaign_id);
        let landing_url = current.as_ref().and_then(|l| l.landing_url.clone());
        self.replace(campaign_id, current, landing_url, Utc::now())
    }

    /// Revokes the active link of an ended campaign.
    ///
    /// Returns the revoked link, or `None` if the campaign had none.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub fn revoke(&self, campaign_id: &str) -> Result<Option<CampaignLink>, LinkError> {
        let lock = self.campaign_lock(campaign_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(mut link) = self.current(campaign_id) else {
            return Ok(None);
        };
        self.store
            .set_link_status(&link.link_token, LinkStatus::Revoked)?;
        link.status = LinkStatus::Revoked;

        self.write_active().remove(campaign_id);
        self.write_tokens()
            .insert(link.link_token.clone(), link.clone());
        info!(campaign_id, token = %link.link_token, "campaign link revoked");
        Ok(Some(link))
    }

    /// Resolves a token presented by a visitor.
    ///
    /// # Errors
    ///
    /// [`TokenError::NotFound`] if the token was never issued here,
    /// [`TokenError::Expired`] if it is no longer served.
    pub fn lookup(&self, token: &LinkToken) -> Result<CampaignLink, TokenError> {
        self.lookup_at(token, Utc::now())
    }

    /// [`Self::lookup`] evaluated at `now`.
    ///
    /// # Errors
    ///
    /// See [`Self::lookup`].
    pub fn lookup_at(
        &self,
        token: &LinkToken,
        now: DateTime<Utc>,
    ) -> Result<CampaignLink, TokenError> {
        let tokens = self.by_token.read().unwrap_or_else(PoisonError::into_inner);
        match tokens.get(token) {
            None => Err(TokenError::NotFound),
            Some(link) if link.is_valid_at(now) => Ok(link.clone()),
            Some(_) => Err(TokenError::Expired),
        }
    }

    /// All links currently served, ordered by campaign.
    #[must_use]
    pub fn list_active(&self) -> Vec<CampaignLink> {
        let now = Utc::now();
        let active = self.active.read().unwrap_or_else(PoisonError::into_inner);
        let tokens = self.by_token.read().unwrap_or_else(PoisonError::into_inner);
        let mut links: Vec<CampaignLink> = active
            .values()
            .filter_map(|token| tokens.get(token))
            .filter(|link| link.is_valid_at(now))
            .cloned()
            .collect();
        links.sort_by(|a, b| a.campaign_id.cmp(&b.campaign_id));
        links
    }

    /// Number of campaigns with an active link.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Reconciles links with the backend's set of activated campaigns.
    ///
    /// Newly activated campaigns get a link, ended campaigns are revoked,
    /// and campaigns whose landing page changed keep their token.
    ///
    /// # Errors
    ///
    /// Stops at the first store failure. Invalid campaign ids from the
    /// backend are skipped with a warning. So are campaigns whose landing
    /// page is not a usable redirect target; such a campaign keeps whatever
    /// link it already had and is counted in [`SyncReport::rejected`].
    pub fn sync_campaigns(&self, campaigns: &[ActiveCampaign]) -> Result<SyncReport, LinkError> {
        let mut report = SyncReport::default();
        let now = Utc::now();

        for campaign in campaigns {
            if let Err(e) = validate_campaign_id(&campaign.campaign_id) {
                warn!(error = %e, "skipping campaign from backend");
                continue;
            }
            if campaign
                .landing_url
                .as_deref()
                .is_some_and(|landing| !is_redirect_url(landing))
            {
                warn!(
                    campaign_id = %campaign.campaign_id,
                    landing_url = ?campaign.landing_url,
                    "skipping campaign with unusable landing page"
                );
                report.rejected += 1;
                continue;
            }
            let lock = self.campaign_lock(&campaign.campaign_id);
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

            match self.current(&campaign.campaign_id) {
                Some(link) if link.is_valid_at(now) => {
                    if link.landing_url != campaign.landing_url {
                        self.update_landing_url(link, campaign.landing_url.clone())?;
                    }
                    report.unchanged += 1;
                },
                current => {
                    self.replace(
                        &campaign.campaign_id,
                        current,
                        campaign.landing_url.clone(),
                        now,
                    )?;
                    report.issued += 1;
                },
            }
        }

        let ended: Vec<String> = {
            let active = self.active.read().unwrap_or_else(PoisonError::into_inner);
            active
                .keys()
                .filter(|id| !campaigns.iter().any(|c| &c.campaign_id == *id))
                .cloned()
                .collect()
        };
        for campaign_id in ended {
            if self.revoke(&campaign_id)?.is_some() {
                report.revoked += 1;
            }
        }

        if report.issued > 0 || report.revoked > 0 || report.rejected > 0 {
            info!(
                issued = report.issued,
                revoked = report.revoked,
                unchanged = report.unchanged,
                rejected = report.rejected,
                "campaign links synced"
            );
        }
        Ok(report)
    }

    /// Regenerates every active link whose TTL has passed at `now`.
    ///
    /// # Errors
    ///
    /// Stops at the first store failure.
    pub fn refresh_due(&self, now: DateTime<Utc>) -> Result<Vec<CampaignLink>, LinkError> {
        let due: Vec<String> = {
            let active = self.active.read().unwrap_or_else(PoisonError::into_inner);
            let tokens = self.by_token.read().unwrap_or_else(PoisonError::into_inner);
            active
                .iter()
                .filter(|(_, token)| {
                    tokens
                        .get(*token)
                        .is_some_and(|link| link.expires_at.is_some_and(|exp| exp <= now))
                })
                .map(|(campaign_id, _)| campaign_id.clone())
                .collect()
        };

        let mut refreshed = Vec::with_capacity(due.len());
        for campaign_id in due {
            refreshed.push(self.issue_or_refresh_at(&campaign_id, now)?);
        }
        Ok(refreshed)
    }

    fn campaign_lock(&self, campaign_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .campaign_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(campaign_id.to_string()).or_default())
    }

    fn current(&self, campaign_id: &str) -> Option<CampaignLink> {
        let active = self.active.read().unwrap_or_else(PoisonError::into_inner);
        let token = active.get(campaign_id)?;
        self.by_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
            .cloned()
    }

    /// Issues a new link, expiring `previous` in the same store transaction.
    /// Caller holds the campaign lock.
    fn replace(
        &self,
        campaign_id: &str,
        previous: Option<CampaignLink>,
        landing_url: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<CampaignLink, LinkError> {
        let link_token = self.unused_token()?;
        let expires_at = self
            .ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| now + ttl);
        let link = CampaignLink {
            campaign_id: campaign_id.to_string(),
            link_token,
            created_at: now,
            expires_at,
            status: LinkStatus::Active,
            landing_url,
        };

        let previous_token = previous.as_ref().map(|l| &l.link_token);
        self.store.replace_active_link(previous_token, &link)?;

        {
            let mut tokens = self.write_tokens();
            if let Some(mut old) = previous {
                old.status = LinkStatus::Expired;
                tokens.insert(old.link_token.clone(), old);
            }
            tokens.insert(link.link_token.clone(), link.clone());
        }
        self.write_active()
            .insert(campaign_id.to_string(), link.link_token.clone());

        info!(campaign_id, token = %link.link_token, "campaign link issued");
        Ok(link)
    }

    fn update_landing_url(
        &self,
        mut link: CampaignLink,
        landing_url: Option<String>,
    ) -> Result<(), LinkError> {
        self.store
            .set_link_landing_url(&link.link_token, landing_url.as_deref())?;
        debug!(campaign_id = %link.campaign_id, "campaign landing page updated");
        link.landing_url = landing_url;
        self.write_tokens().insert(link.link_token.clone(), link);
        Ok(())
    }

    fn unused_token(&self) -> Result<LinkToken, LinkError> {
        for _ in 0..MAX_TOKEN_ATTEMPTS {
            let token = LinkToken::generate();
            let known = self
                .by_token
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains_key(&token);
            if !known && !self.store.link_token_exists(&token)? {
                return Ok(token);
            }
            warn!("link token collision, drawing again");
        }
        Err(LinkError::TokenSpaceExhausted)
    }

    fn write_tokens(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<LinkToken, CampaignLink>> {
        self.by_token.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_active(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, LinkToken>> {
        self.active.write().unwrap_or_else(PoisonError::into_inner)
    }
}
