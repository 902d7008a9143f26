//! Persistent node state using `SQLite`.
//!
//! # Schema
//!
//! - `links`: every link ever issued, keyed by `link_token`. A partial
//!   unique index allows at most one `active` row per `campaign_id`.
//! - `events`: the attribution log, keyed by `event_id`. Rows are appended
//!   and never rewritten; only the `forward_state` bookkeeping column moves
//!   as the forwarder makes progress.
//! - `two_factor_codes`: delivered codes and their consumption flag.
//!
//! The database runs in WAL mode. [`NodeStore::flush`] checkpoints the WAL
//! so a handover leaves a self-contained database file behind.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;

use crate::attribution::{AttributionEvent, EventOutcome, ForwardState, VisitContext};
use crate::link::{CampaignLink, LinkStatus, LinkToken};
use crate::twofactor::TwoFactorCode;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS links (
        link_token   TEXT PRIMARY KEY,
        campaign_id  TEXT NOT NULL,
        created_at   INTEGER NOT NULL,
        expires_at   INTEGER,
        status       TEXT NOT NULL,
        landing_url  TEXT
    );
    CREATE UNIQUE INDEX IF NOT EXISTS links_one_active_per_campaign
        ON links (campaign_id) WHERE status = 'active';

    CREATE TABLE IF NOT EXISTS events (
        event_id      TEXT PRIMARY KEY,
        link_token    TEXT NOT NULL,
        campaign_id   TEXT NOT NULL,
        fingerprint   TEXT NOT NULL,
        recorded_at   INTEGER NOT NULL,
        outcome       TEXT NOT NULL,
        forward_state TEXT NOT NULL,
        ip            TEXT NOT NULL,
        user_agent    TEXT NOT NULL,
        referer       TEXT
    );
    CREATE INDEX IF NOT EXISTS events_forward_state ON events (forward_state);
    CREATE INDEX IF NOT EXISTS events_recorded_at ON events (recorded_at);

    CREATE TABLE IF NOT EXISTS two_factor_codes (
        code       TEXT PRIMARY KEY,
        issued_at  INTEGER NOT NULL,
        expires_at INTEGER NOT NULL,
        consumed   INTEGER NOT NULL DEFAULT 0
    );
";

/// Store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Could not create the database directory.
    #[error("failed to prepare database directory: {0}")]
    Io(#[from] std::io::Error),

    /// A row holds a value this version does not understand.
    #[error("corrupt row in {table}: {detail}")]
    Corrupt {
        /// Table name.
        table: &'static str,
        /// What was wrong.
        detail: String,
    },
}

/// Counts of recorded attribution events by outcome.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EventCounts {
    /// Accepted events.
    pub accepted: u64,
    /// Duplicate events.
    pub duplicate: u64,
    /// Accepted events parked for reconciliation.
    pub awaiting_reconcile: u64,
}

/// Durable state of the node.
pub struct NodeStore {
    conn: Mutex<Connection>,
}

impl NodeStore {
    /// Opens (creating if needed) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or database cannot be created or
    /// the schema cannot be applied.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init(conn)
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Checkpoints the WAL into the main database file.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint fails.
    pub fn flush(&self) -> Result<(), StoreError> {
        let conn = self.conn();
        // In-memory databases report journal_mode=memory and ignore this.
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
            .optional()?;
        debug!("store flushed");
        Ok(())
    }

    // =========================================================================
    // Links
    // =========================================================================

    /// Loads every link row.
    ///
    /// # Errors
    ///
    /// Returns an error on query failure or unreadable rows.
    pub fn load_links(&self) -> Result<Vec<CampaignLink>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT link_token, campaign_id, created_at, expires_at, status, landing_url
             FROM links",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<i64>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;

        let mut links = Vec::new();
        for row in rows {
            let (token, campaign_id, created_at, expires_at, status, landing_url) = row?;
            let link_token = LinkToken::parse(&token).ok_or_else(|| corrupt("links", &token))?;
            let status = LinkStatus::parse(&status).ok_or_else(|| corrupt("links", &status))?;
            links.push(CampaignLink {
                campaign_id,
                link_token,
                created_at: from_millis("links", created_at)?,
                expires_at: expires_at.map(|ms| from_millis("links", ms)).transpose()?,
                status,
                landing_url,
            });
        }
        Ok(links)
    }

    /// Whether a token was ever issued.
    ///
    /// # Errors
    ///
    /// Returns an error on query failure.
    pub fn link_token_exists(&self, token: &LinkToken) -> Result<bool, StoreError> {
        let conn = self.conn();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM links WHERE link_token = ?1",
                params![token.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Expires `previous` (if any) and inserts `link` atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails; nothing is changed then.
    pub fn replace_active_link(
        &self,
        previous: Option<&LinkToken>,
        link: &CampaignLink,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        if let Some(previous) = previous {
            tx.execute(
                "UPDATE links SET status = ?1 WHERE link_token = ?2",
                params![LinkStatus::Expired.as_str(), previous.as_str()],
            )?;
        }
        tx.execute(
            "INSERT INTO links (link_token, campaign_id, created_at, expires_at, status, landing_url)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                link.link_token.as_str(),
                link.campaign_id,
                link.created_at.timestamp_millis(),
                link.expires_at.map(|t| t.timestamp_millis()),
                link.status.as_str(),
                link.landing_url,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Sets the status of one link.
    ///
    /// # Errors
    ///
    /// Returns an error on update failure.
    pub fn set_link_status(&self, token: &LinkToken, status: LinkStatus) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE links SET status = ?1 WHERE link_token = ?2",
            params![status.as_str(), token.as_str()],
        )?;
        Ok(())
    }

    /// Replaces the landing page of one link.
    ///
    /// # Errors
    ///
    /// Returns an error on update failure.
    pub fn set_link_landing_url(
        &self,
        token: &LinkToken,
        landing_url: Option<&str>,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE links SET landing_url = ?1 WHERE link_token = ?2",
            params![landing_url, token.as_str()],
        )?;
        Ok(())
    }

    // =========================================================================
    // Attribution events
    // =========================================================================

    /// Appends an attribution event.
    ///
    /// # Errors
    ///
    /// Returns an error on insert failure, including a reused event id.
    pub fn append_event(
        &self,
        event: &AttributionEvent,
        visit: &VisitContext,
        forward_state: ForwardState,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO events (event_id, link_token, campaign_id, fingerprint, recorded_at,
                                 outcome, forward_state, ip, user_agent, referer)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                event.event_id.to_string(),
                event.link_token.as_str(),
                event.campaign_id,
                event.source_fingerprint.as_str(),
                event.timestamp.timestamp_millis(),
                event.outcome.as_str(),
                forward_state.as_str(),
                visit.ip.to_string(),
                visit.user_agent,
                visit.referer,
            ],
        )?;
        Ok(())
    }

    /// Moves an event's forwarding bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns an error on update failure.
    pub fn set_forward_state(
        &self,
        event_id: &uuid::Uuid,
        state: ForwardState,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE events SET forward_state = ?1 WHERE event_id = ?2",
            params![state.as_str(), event_id.to_string()],
        )?;
        Ok(())
    }

    /// Moves every accepted `pending` event to `reconcile`.
    ///
    /// # Errors
    ///
    /// Returns an error on update failure.
    pub fn park_pending_events(&self) -> Result<usize, StoreError> {
        let changed = self.conn().execute(
            "UPDATE events SET forward_state = ?1
             WHERE outcome = 'accepted' AND forward_state = ?2",
            params![
                ForwardState::Reconcile.as_str(),
                ForwardState::Pending.as_str()
            ],
        )?;
        Ok(changed)
    }

    /// Oldest accepted events in one of `states`, up to `limit`.
    ///
    /// # Errors
    ///
    /// Returns an error on query failure or unreadable rows.
    pub fn events_awaiting_forward(
        &self,
        states: &[ForwardState],
        limit: usize,
    ) -> Result<Vec<(AttributionEvent, VisitContext)>, StoreError> {
        let conn = self.conn();
        let placeholders = (0..states.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT event_id, link_token, campaign_id, fingerprint, recorded_at, outcome,
                    ip, user_agent, referer
             FROM events
             WHERE outcome = 'accepted' AND forward_state IN ({placeholders})
             ORDER BY recorded_at
             LIMIT ?1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut values: Vec<rusqlite::types::Value> = vec![limit.into()];
        values.extend(states.iter().map(|s| s.as_str().to_string().into()));

        let rows = stmt.query_map(rusqlite::params_from_iter(values), read_event_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(decode_event(row?)?);
        }
        Ok(out)
    }

    /// `(link_token, fingerprint, recorded_at)` of accepted events recorded
    /// at or after `since`.
    ///
    /// # Errors
    ///
    /// Returns an error on query failure.
    pub fn accepted_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<(String, String, DateTime<Utc>)>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT link_token, fingerprint, recorded_at FROM events
             WHERE outcome = 'accepted' AND recorded_at >= ?1",
        )?;
        let rows = stmt.query_map(params![since.timestamp_millis()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (token, fingerprint, at) = row?;
            out.push((token, fingerprint, from_millis("events", at)?));
        }
        Ok(out)
    }

    /// Counts events by outcome.
    ///
    /// # Errors
    ///
    /// Returns an error on query failure.
    pub fn event_counts(&self) -> Result<EventCounts, StoreError> {
        let conn = self.conn();
        let (accepted, duplicate, awaiting_reconcile): (i64, i64, i64) = conn.query_row(
            "SELECT
                COALESCE(SUM(outcome = 'accepted'), 0),
                COALESCE(SUM(outcome = 'duplicate'), 0),
                COALESCE(SUM(outcome = 'accepted' AND forward_state = 'reconcile'), 0)
             FROM events",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(EventCounts {
            accepted: u64::try_from(accepted).unwrap_or(0),
            duplicate: u64::try_from(duplicate).unwrap_or(0),
            awaiting_reconcile: u64::try_from(awaiting_reconcile).unwrap_or(0),
        })
    }

    /// Loads one event by id.
    ///
    /// # Errors
    ///
    /// Returns an error on query failure or an unreadable row.
    pub fn event(
        &self,
        event_id: &uuid::Uuid,
    ) -> Result<Option<(AttributionEvent, ForwardState)>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT event_id, link_token, campaign_id, fingerprint, recorded_at, outcome,
                        ip, user_agent, referer, forward_state
                 FROM events WHERE event_id = ?1",
                params![event_id.to_string()],
                |row| Ok((read_event_row(row)?, row.get::<_, String>(9)?)),
            )
            .optional()?;
        let Some((raw, state)) = row else {
            return Ok(None);
        };
        let (event, _) = decode_event(raw)?;
        let state = ForwardState::parse(&state).ok_or_else(|| corrupt("events", &state))?;
        Ok(Some((event, state)))
    }

    // =========================================================================
    // Two-factor codes
    // =========================================================================

    /// Stores a delivered code.
    ///
    /// A code that is already pending stays untouched. A code whose earlier
    /// copy was consumed or has expired by `code.issued_at` is replaced by the
    /// new delivery.
    ///
    /// Returns `true` if a row was written.
    ///
    /// # Errors
    ///
    /// Returns an error on insert failure.
    pub fn insert_code(&self, code: &TwoFactorCode) -> Result<bool, StoreError> {
        let changed = self.conn().execute(
            "INSERT INTO two_factor_codes (code, issued_at, expires_at, consumed)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(code) DO UPDATE SET
                issued_at = excluded.issued_at,
                expires_at = excluded.expires_at,
                consumed = excluded.consumed
             WHERE two_factor_codes.consumed = 1
                OR two_factor_codes.expires_at <= excluded.issued_at",
            params![
                code.code,
                code.issued_at.timestamp_millis(),
                code.expires_at.timestamp_millis(),
                code.consumed,
            ],
        )?;
        Ok(changed == 1)
    }

    /// Loads one code regardless of its state.
    ///
    /// # Errors
    ///
    /// Returns an error on query failure or an unreadable row.
    pub fn code(&self, code: &str) -> Result<Option<TwoFactorCode>, StoreError> {
        let row = self
            .conn()
            .query_row(
                "SELECT code, issued_at, expires_at, consumed FROM two_factor_codes
                 WHERE code = ?1",
                params![code],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, bool>(3)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(code, issued_at, expires_at, consumed)| {
            Ok(TwoFactorCode {
                code,
                issued_at: from_millis("two_factor_codes", issued_at)?,
                expires_at: from_millis("two_factor_codes", expires_at)?,
                consumed,
            })
        })
        .transpose()
    }

    /// Codes that are neither consumed nor expired at `now`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error on query failure.
    pub fn pending_codes(&self, now: DateTime<Utc>) -> Result<Vec<TwoFactorCode>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT code, issued_at, expires_at FROM two_factor_codes
             WHERE consumed = 0 AND expires_at > ?1
             ORDER BY issued_at",
        )?;
        let rows = stmt.query_map(params![now.timestamp_millis()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        let mut codes = Vec::new();
        for row in rows {
            let (code, issued_at, expires_at) = row?;
            codes.push(TwoFactorCode {
                code,
                issued_at: from_millis("two_factor_codes", issued_at)?,
                expires_at: from_millis("two_factor_codes", expires_at)?,
                consumed: false,
            });
        }
        Ok(codes)
    }

    /// Marks a pending code consumed.
    ///
    /// Returns `true` only for the single call that flipped the flag; the
    /// conditional update makes consumption exactly-once.
    ///
    /// # Errors
    ///
    /// Returns an error on update failure.
    pub fn consume_code(&self, code: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let changed = self.conn().execute(
            "UPDATE two_factor_codes SET consumed = 1
             WHERE code = ?1 AND consumed = 0 AND expires_at > ?2",
            params![code, now.timestamp_millis()],
        )?;
        Ok(changed == 1)
    }
}

type RawEvent = (
    String,
    String,
    String,
    String,
    i64,
    String,
    String,
    String,
    Option<String>,
);

fn read_event_row(row: &Row<'_>) -> rusqlite::Result<RawEvent> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn decode_event(raw: RawEvent) -> Result<(AttributionEvent, VisitContext), StoreError> {
    let (event_id, token, campaign_id, fingerprint, recorded_at, outcome, ip, user_agent, referer) =
        raw;
    let event = AttributionEvent {
        event_id: uuid::Uuid::parse_str(&event_id).map_err(|e| corrupt("events", &e))?,
        link_token: LinkToken::parse(&token).ok_or_else(|| corrupt("events", &token))?,
        campaign_id,
        source_fingerprint: fingerprint.into(),
        timestamp: from_millis("events", recorded_at)?,
        outcome: EventOutcome::parse(&outcome).ok_or_else(|| corrupt("events", &outcome))?,
    };
    let visit = VisitContext {
        ip: ip.parse().map_err(|e| corrupt("events", &e))?,
        user_agent,
        referer,
    };
    Ok((event, visit))
}

fn from_millis(table: &'static str, ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| StoreError::Corrupt {
        table,
        detail: format!("timestamp out of range: {ms}"),
    })
}

fn corrupt(table: &'static str, detail: &dyn std::fmt::Display) -> StoreError {
    StoreError::Corrupt {
        table,
        detail: detail.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_active_link_per_campaign_is_enforced() {
        let store = NodeStore::open_in_memory().unwrap();
        let now = Utc::now();
        let link = |token: LinkToken| CampaignLink {
            campaign_id: "C1".into(),
            link_token: token,
            created_at: now,
            expires_at: None,
            status: LinkStatus::Active,
            landing_url: None,
        };

        let first = link(LinkToken::generate());
        store.replace_active_link(None, &first).unwrap();
        // A second active row without expiring the first violates the index.
        assert!(store.replace_active_link(None, &link(LinkToken::generate())).is_err());

        let second = link(LinkToken::generate());
        store
            .replace_active_link(Some(&first.link_token), &second)
            .unwrap();

        let links = store.load_links().unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(
            links
                .iter()
                .filter(|l| l.status == LinkStatus::Active)
                .count(),
            1
        );
    }

    #[test]
    fn codes_consume_exactly_once() {
        let store = NodeStore::open_in_memory().unwrap();
        let now = Utc::now();
        let code = TwoFactorCode {
            code: "123456".into(),
            issued_at: now,
            expires_at: now + chrono::Duration::minutes(10),
            consumed: false,
        };
        assert!(store.insert_code(&code).unwrap());
        assert!(!store.insert_code(&code).unwrap());
        assert_eq!(store.pending_codes(now).unwrap().len(), 1);

        assert!(store.consume_code("123456", now).unwrap());
        assert!(!store.consume_code("123456", now).unwrap());
        assert!(store.pending_codes(now).unwrap().is_empty());
    }

    #[test]
    fn spent_code_row_is_replaced_by_redelivery() {
        let store = NodeStore::open_in_memory().unwrap();
        // Rows keep millisecond precision.
        let now = DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap();
        let earlier = now - chrono::Duration::minutes(30);
        let stale = TwoFactorCode {
            code: "246810".into(),
            issued_at: earlier,
            expires_at: earlier + chrono::Duration::minutes(10),
            consumed: false,
        };
        assert!(store.insert_code(&stale).unwrap());

        let fresh = TwoFactorCode {
            code: "246810".into(),
            issued_at: now,
            expires_at: now + chrono::Duration::minutes(10),
            consumed: false,
        };
        assert!(store.insert_code(&fresh).unwrap());
        assert_eq!(store.code("246810").unwrap(), Some(fresh.clone()));
        assert_eq!(store.pending_codes(now).unwrap(), vec![fresh.clone()]);

        // A second delivery while the first is live keeps the first.
        let again = TwoFactorCode {
            issued_at: now + chrono::Duration::minutes(1),
            expires_at: now + chrono::Duration::minutes(11),
            ..fresh.clone()
        };
        assert!(!store.insert_code(&again).unwrap());
        assert_eq!(store.code("246810").unwrap(), Some(fresh));
    }

    #[test]
    fn file_backed_store_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("node.db");
        {
            let store = NodeStore::open(&path).unwrap();
            let link = CampaignLink {
                campaign_id: "C1".into(),
                link_token: LinkToken::generate(),
                created_at: Utc::now(),
                expires_at: None,
                status: LinkStatus::Active,
                landing_url: Some("https://shop.example".into()),
            };
            store.replace_active_link(None, &link).unwrap();
            store.flush().unwrap();
        }
        let store = NodeStore::open(&path).unwrap();
        let links = store.load_links().unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].landing_url.as_deref(), Some("https://shop.example"));
    }
}
