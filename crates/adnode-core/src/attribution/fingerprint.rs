//! Source fingerprints.
//!
//! A fingerprint identifies "the same visitor" for dedup purposes without
//! storing raw request metadata in the dedup map: it is the SHA-256 of the
//! client IP, user agent and optional device signal, each separated by a
//! unit-separator byte so that field boundaries cannot be shifted.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const FIELD_SEPARATOR: u8 = 0x1f;

/// Maximum bytes of any single header value that enter the fingerprint.
pub const MAX_FIELD_LEN: usize = 512;

/// Request metadata the attribution engine needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMetadata {
    /// Client address (first `X-Forwarded-For` hop, else the peer).
    pub ip: IpAddr,
    /// `User-Agent` header, empty if absent.
    pub user_agent: String,
    /// Optional device signal (`X-Device-Id`).
    pub device_signal: Option<String>,
    /// `Referer` header.
    pub referer: Option<String>,
    /// Campaign named in the request path, when the URL carries one.
    pub campaign_hint: Option<String>,
}

impl RequestMetadata {
    /// Metadata with only an address, as seen from a bare client.
    #[must_use]
    pub const fn from_ip(ip: IpAddr) -> Self {
        Self {
            ip,
            user_agent: String::new(),
            device_signal: None,
            referer: None,
            campaign_hint: None,
        }
    }

    /// Computes the source fingerprint.
    #[must_use]
    pub fn fingerprint(&self) -> SourceFingerprint {
        let mut hasher = Sha256::new();
        hasher.update(self.ip.to_string().as_bytes());
        hasher.update([FIELD_SEPARATOR]);
        hasher.update(clip(&self.user_agent).as_bytes());
        hasher.update([FIELD_SEPARATOR]);
        if let Some(device) = &self.device_signal {
            hasher.update(clip(device).as_bytes());
        }
        SourceFingerprint(hex::encode(hasher.finalize()))
    }
}

fn clip(value: &str) -> &str {
    if value.len() <= MAX_FIELD_LEN {
        return value;
    }
    let mut end = MAX_FIELD_LEN;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

/// Hex SHA-256 digest identifying a visitor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceFingerprint(String);

impl SourceFingerprint {
    /// Digest text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SourceFingerprint {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for SourceFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
