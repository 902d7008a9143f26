//! Operator IPC messages and framing.
//!
//! The daemon serves these over a Unix domain socket; the `adnode` CLI is
//! the only client. Each message is a 4-byte big-endian length prefix
//! followed by a JSON body of at most [`MAX_FRAME_SIZE`] bytes.

use serde::{Deserialize, Serialize};

use crate::link::CampaignLink;
use crate::twofactor::TwoFactorCode;

/// Largest accepted frame body.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Length prefix size.
pub const FRAME_HEADER_LEN: usize = 4;

/// Request from the CLI to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcRequest {
    /// Liveness check.
    Ping,

    /// Node status.
    Status,

    /// Active campaign links.
    ListLinks,

    /// Pending two-factor codes.
    ListPendingCodes,

    /// Consume a two-factor code.
    ConsumeCode {
        /// The code.
        code: String,
    },

    /// Force a new link for a campaign.
    RefreshLink {
        /// Campaign to refresh.
        campaign_id: String,
    },

    /// Run an update check now.
    CheckForUpdate,

    /// Stop the node.
    Shutdown,
}

impl IpcRequest {
    /// Stable label for metrics.
    #[must_use]
    pub const fn endpoint(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Status => "status",
            Self::ListLinks => "list_links",
            Self::ListPendingCodes => "list_pending_codes",
            Self::ConsumeCode { .. } => "consume_code",
            Self::RefreshLink { .. } => "refresh_link",
            Self::CheckForUpdate => "check_for_update",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Response from the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcResponse {
    /// Reply to [`IpcRequest::Ping`].
    Pong {
        /// Node version.
        version: String,
        /// Seconds since start.
        uptime_secs: u64,
    },

    /// Node status.
    Status(NodeStatus),

    /// Active links.
    LinkList {
        /// Links sorted by campaign.
        links: Vec<CampaignLink>,
    },

    /// Pending codes.
    CodeList {
        /// Codes, oldest first.
        codes: Vec<TwoFactorCode>,
    },

    /// A single link.
    Link {
        /// The link.
        link: CampaignLink,
    },

    /// Result of an update check.
    UpdateCheck {
        /// Outcome label (`no_update`, `handed_over`, ...).
        outcome: String,
        /// Detail for the operator.
        message: Option<String>,
    },

    /// Success without payload.
    Ok {
        /// Optional message.
        message: Option<String>,
    },

    /// Failure.
    Error {
        /// Error code.
        code: ErrorCode,
        /// Error message.
        message: String,
    },
}

impl IpcResponse {
    /// Builds an error response.
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }
}

/// Snapshot returned by [`IpcRequest::Status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Node version.
    pub version: String,
    /// Process id.
    pub pid: u32,
    /// Seconds since start.
    pub uptime_secs: u64,
    /// Update supervisor state.
    pub update_state: String,
    /// Whether the HTTPS listener is accepting.
    pub accepting: bool,
    /// Active campaign links.
    pub active_links: usize,
    /// Pairs held in the dedup window.
    pub tracked_pairs: usize,
    /// Accepted visits since start.
    pub accepted: u64,
    /// Duplicate visits since start.
    pub duplicate: u64,
    /// Rejected visits since start.
    pub rejected: u64,
    /// Events waiting for reconciliation.
    pub awaiting_reconcile: u64,
    /// Retrievable two-factor codes.
    pub pending_codes: usize,
}

/// Error codes for IPC responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// No such code, link or campaign.
    NotFound,
    /// Malformed request.
    InvalidRequest,
    /// Another operation holds the resource.
    Busy,
    /// Internal error.
    InternalError,
    /// Operation disabled by configuration.
    NotSupported,
}

/// Frames a message body.
///
/// # Errors
///
/// Returns [`IpcError::FrameTooLarge`] if the body exceeds
/// [`MAX_FRAME_SIZE`].
pub fn frame_message(message: &[u8]) -> Result<Vec<u8>, IpcError> {
    if message.len() > MAX_FRAME_SIZE {
        return Err(IpcError::FrameTooLarge(message.len()));
    }
    let len = u32::try_from(message.len()).map_err(|_| IpcError::FrameTooLarge(message.len()))?;
    let mut framed = Vec::with_capacity(FRAME_HEADER_LEN + message.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(message);
    Ok(framed)
}

/// Reads the body length from a frame prefix, if complete.
#[must_use]
pub fn parse_frame_length(buffer: &[u8]) -> Option<usize> {
    let prefix: [u8; FRAME_HEADER_LEN] = buffer.get(..FRAME_HEADER_LEN)?.try_into().ok()?;
    Some(u32::from_be_bytes(prefix) as usize)
}

/// Decodes one request frame from the start of `buffer`.
///
/// Returns `Ok(None)` while the frame is incomplete, otherwise the request
/// and the number of bytes consumed.
///
/// # Errors
///
/// Returns an error for oversized frames or bodies that are not a valid
/// request.
pub fn decode_request(buffer: &[u8]) -> Result<Option<(IpcRequest, usize)>, IpcError> {
    let Some(len) = parse_frame_length(buffer) else {
        return Ok(None);
    };
    if len > MAX_FRAME_SIZE {
        return Err(IpcError::FrameTooLarge(len));
    }
    let end = FRAME_HEADER_LEN + len;
    let Some(body) = buffer.get(FRAME_HEADER_LEN..end) else {
        return Ok(None);
    };
    let request = serde_json::from_slice(body)?;
    Ok(Some((request, end)))
}

/// IPC errors.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// The daemon socket is absent or refused the connection.
    #[error("node is not running (socket {0})")]
    NodeNotRunning(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Frame exceeds [`MAX_FRAME_SIZE`].
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    /// Connection closed or unexpected reply.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Timeout.
    #[error("operation timed out")]
    Timeout,
}
