//! The operator command surface.
//!
//! Read access to the active links and pending two-factor codes, plus the
//! single mutating operation: consuming a code. Transport lives in the
//! daemon; this type is what the socket handlers call into.

use std::sync::Arc;

use crate::link::{CampaignLink, LinkRegistry};
use crate::twofactor::{TwoFactorBook, TwoFactorCode, TwoFactorError};

/// Operator-facing view of the node.
#[derive(Clone)]
pub struct OperatorChannel {
    registry: Arc<LinkRegistry>,
    codes: Arc<TwoFactorBook>,
}

impl OperatorChannel {
    /// Creates the channel.
    #[must_use]
    pub const fn new(registry: Arc<LinkRegistry>, codes: Arc<TwoFactorBook>) -> Self {
        Self { registry, codes }
    }

    /// Active campaign links, sorted by campaign.
    #[must_use]
    pub fn list_links(&self) -> Vec<CampaignLink> {
        self.registry.list_active()
    }

    /// Codes not yet consumed or expired.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn list_pending_codes(&self) -> Result<Vec<TwoFactorCode>, TwoFactorError> {
        self.codes.list_pending()
    }

    /// Consumes a code exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`TwoFactorError::NotFound`] when no pending code matches.
    pub fn consume_code(&self, code: &str) -> Result<(), TwoFactorError> {
        self.codes.consume(code)
    }

    /// The link registry behind this channel.
    #[must_use]
    pub fn registry(&self) -> &Arc<LinkRegistry> {
        &self.registry
    }
}
