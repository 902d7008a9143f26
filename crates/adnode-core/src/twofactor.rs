//! Two-factor codes handed over by the registration flow.
//!
//! Codes arrive over the HTTPS surface and are read by the operator over the
//! local channel. A code is retrievable until it is consumed or its TTL
//! passes; consumption happens at most once.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::store::{NodeStore, StoreError};

/// Longest accepted code.
pub const MAX_CODE_LEN: usize = 64;

/// A delivered code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwoFactorCode {
    /// The code itself.
    pub code: String,
    /// Delivery time.
    pub issued_at: DateTime<Utc>,
    /// End of retrievability.
    pub expires_at: DateTime<Utc>,
    /// Whether the operator has consumed it.
    pub consumed: bool,
}

/// Two-factor failures.
#[derive(Debug, thiserror::Error)]
pub enum TwoFactorError {
    /// The code is malformed.
    #[error("invalid two-factor code: {0}")]
    InvalidCode(&'static str),

    /// No pending code matches.
    #[error("two-factor code not found")]
    NotFound,

    /// Persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Pending two-factor codes.
pub struct TwoFactorBook {
    store: Arc<NodeStore>,
    ttl: Duration,
}

impl TwoFactorBook {
    /// Creates a book whose codes live for `ttl`.
    #[must_use]
    pub const fn new(store: Arc<NodeStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Stores a delivered code and returns the record now held for it.
    ///
    /// Re-delivering a code that is still pending is a no-op and returns the
    /// pending record. A code that was consumed or has expired is accepted
    /// again as a fresh delivery.
    ///
    /// # Errors
    ///
    /// Returns [`TwoFactorError::InvalidCode`] for empty, oversized or
    /// non-alphanumeric codes.
    pub fn deliver(&self, code: &str) -> Result<TwoFactorCode, TwoFactorError> {
        self.deliver_at(code, Utc::now())
    }

    /// [`Self::deliver`] at an explicit time.
    ///
    /// # Errors
    ///
    /// See [`Self::deliver`].
    pub fn deliver_at(
        &self,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<TwoFactorCode, TwoFactorError> {
        validate_code(code)?;
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        let record = TwoFactorCode {
            code: code.to_string(),
            issued_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            consumed: false,
        };
        if self.store.insert_code(&record)? {
            info!("two-factor code delivered");
            return Ok(record);
        }
        Ok(self.store.code(code)?.unwrap_or(record))
    }

    /// Codes currently retrievable.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn list_pending(&self) -> Result<Vec<TwoFactorCode>, TwoFactorError> {
        self.list_pending_at(Utc::now())
    }

    /// [`Self::list_pending`] at an explicit time.
    ///
    /// # Errors
    ///
    /// See [`Self::list_pending`].
    pub fn list_pending_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<TwoFactorCode>, TwoFactorError> {
        Ok(self.store.pending_codes(now)?)
    }

    /// Consumes a pending code.
    ///
    /// # Errors
    ///
    /// Returns [`TwoFactorError::NotFound`] if the code is unknown, expired
    /// or already consumed.
    pub fn consume(&self, code: &str) -> Result<(), TwoFactorError> {
        self.consume_at(code, Utc::now())
    }

    /// [`Self::consume`] at an explicit time.
    ///
    /// # Errors
    ///
    /// See [`Self::consume`].
    pub fn consume_at(&self, code: &str, now: DateTime<Utc>) -> Result<(), TwoFactorError> {
        if self.store.consume_code(code, now)? {
            info!("two-factor code consumed");
            Ok(())
        } else {
            Err(TwoFactorError::NotFound)
        }
    }
}

fn validate_code(code: &str) -> Result<(), TwoFactorError> {
    if code.is_empty() {
        return Err(TwoFactorError::InvalidCode("empty"));
    }
    if code.len() > MAX_CODE_LEN {
        return Err(TwoFactorError::InvalidCode("too long"));
    }
    if !code.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(TwoFactorError::InvalidCode("must be alphanumeric"));
    }
    Ok(())
}
