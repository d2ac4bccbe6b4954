// SQLite backing store for events, participants, slots, and allocations.

use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::model::{Allocation, EventInfo, Participant, PaymentStatus, Slot, Snapshot, StreamKind};
use crate::transport::Fetcher;

/// SQLite-backed store. Uniqueness of allocations per participant and per
/// slot is enforced by the schema, which is what makes concurrent draws safe
/// across connections.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a SQLite database at `path` and ensure all tables
    /// exist. Pass `":memory:"` for an ephemeral in-memory database.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to set database pragmas")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS events (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                slot_count  INTEGER NOT NULL,
                created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE TABLE IF NOT EXISTS participants (
                id             TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
                event_id       TEXT NOT NULL REFERENCES events(id),
                display_name   TEXT NOT NULL,
                payment_status TEXT NOT NULL,
                joined_at      TEXT NOT NULL,
                removed        INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS slots (
                id         TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
                event_id   TEXT NOT NULL REFERENCES events(id),
                number     INTEGER NOT NULL,
                name       TEXT NOT NULL,
                scratched  INTEGER NOT NULL DEFAULT 0,
                UNIQUE(event_id, number)
            );

            CREATE TABLE IF NOT EXISTS allocations (
                id             TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
                event_id       TEXT NOT NULL REFERENCES events(id),
                participant_id TEXT NOT NULL REFERENCES participants(id),
                slot_id        TEXT NOT NULL REFERENCES slots(id),
                created_at     TEXT NOT NULL,
                UNIQUE(event_id, participant_id),
                UNIQUE(event_id, slot_id)
            );

            CREATE INDEX IF NOT EXISTS idx_participants_event ON participants(event_id, joined_at);
            CREATE INDEX IF NOT EXISTS idx_allocations_event ON allocations(event_id, created_at);
            ",
        )
        .context("failed to create database schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the database connection.
    ///
    /// Panics if the mutex is poisoned (another thread panicked while
    /// holding the lock).
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }

    // ------------------------------------------------------------------
    // Event setup
    // ------------------------------------------------------------------

    /// Create an event with `slot_count` slots named "Horse 1".."Horse N" in
    /// a single transaction. Returns `false` without touching anything if the
    /// event already exists.
    pub fn create_event(&self, id: &str, name: &str, slot_count: u32) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction().context("failed to begin transaction")?;

        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO events (id, name, slot_count) VALUES (?1, ?2, ?3)",
                params![id, name, slot_count],
            )
            .context("failed to insert event")?;
        if inserted == 0 {
            return Ok(false);
        }

        for number in 1..=slot_count {
            tx.execute(
                "INSERT INTO slots (event_id, number, name) VALUES (?1, ?2, ?3)",
                params![id, number, format!("Horse {number}")],
            )
            .context("failed to insert slot")?;
        }

        tx.commit().context("failed to commit create_event")?;
        Ok(true)
    }

    /// Look up an event by id.
    pub fn event(&self, id: &str) -> Result<Option<EventInfo>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT id, name, slot_count, created_at FROM events WHERE id = ?1",
            params![id],
            |row| {
                Ok(EventInfo {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    slot_count: row.get(2)?,
                    created_at: timestamp_column(row, 3)?,
                })
            },
        )
        .optional()
        .context("failed to query event")
    }

    /// Mark a slot as scratched (withdrawn). Scratched slots are never drawn.
    pub fn set_slot_scratched(&self, slot_id: &str, scratched: bool) -> Result<bool> {
        let conn = self.conn();
        let updated = conn
            .execute(
                "UPDATE slots SET scratched = ?2 WHERE id = ?1",
                params![slot_id, scratched],
            )
            .context("failed to update slot")?;
        Ok(updated > 0)
    }

    // ------------------------------------------------------------------
    // Participants
    // ------------------------------------------------------------------

    /// Register a participant and return the stored record.
    pub fn add_participant(
        &self,
        event_id: &str,
        display_name: &str,
        payment_status: PaymentStatus,
        joined_at: DateTime<Utc>,
    ) -> Result<Participant> {
        let conn = self.conn();
        conn.query_row(
            "INSERT INTO participants (event_id, display_name, payment_status, joined_at)
             VALUES (?1, ?2, ?3, ?4)
             RETURNING id, event_id, display_name, payment_status, joined_at, removed",
            params![
                event_id,
                display_name,
                payment_status.as_str(),
                format_timestamp(&joined_at),
            ],
            participant_from_row,
        )
        .context("failed to insert participant")
    }

    /// Update a participant's payment status. Returns the updated record, or
    /// `None` if no such participant exists.
    pub fn set_payment_status(
        &self,
        participant_id: &str,
        status: PaymentStatus,
    ) -> Result<Option<Participant>> {
        let conn = self.conn();
        conn.query_row(
            "UPDATE participants SET payment_status = ?2 WHERE id = ?1
             RETURNING id, event_id, display_name, payment_status, joined_at, removed",
            params![participant_id, status.as_str()],
            participant_from_row,
        )
        .optional()
        .context("failed to update payment status")
    }

    /// Soft-remove a participant. Existing allocations are kept.
    pub fn remove_participant(&self, participant_id: &str) -> Result<Option<Participant>> {
        let conn = self.conn();
        conn.query_row(
            "UPDATE participants SET removed = 1 WHERE id = ?1
             RETURNING id, event_id, display_name, payment_status, joined_at, removed",
            params![participant_id],
            participant_from_row,
        )
        .optional()
        .context("failed to remove participant")
    }

    /// Mark every pending participant of `event_id` who joined at or before
    /// `cutoff` as expired, in one transaction. Returns the updated records.
    pub fn expire_pending_before(
        &self,
        event_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Participant>> {
        let mut conn = self.conn();
        let tx = conn.transaction().context("failed to begin transaction")?;
        let expired = {
            let mut stmt = tx
                .prepare(
                    "UPDATE participants SET payment_status = 'expired'
                     WHERE event_id = ?1 AND payment_status = 'pending' AND removed = 0
                       AND joined_at <= ?2
                     RETURNING id, event_id, display_name, payment_status, joined_at, removed",
                )
                .context("failed to prepare payment expiry")?;
            let rows = stmt
                .query_map(params![event_id, format_timestamp(&cutoff)], participant_from_row)
                .context("failed to expire pending payments")?
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("failed to map expired participants")?;
            rows
        };
        tx.commit().context("failed to commit payment expiry")?;
        Ok(expired)
    }

    /// All participants of an event (including soft-removed ones), oldest
    /// first.
    pub fn load_participants(&self, event_id: &str) -> Result<Vec<Participant>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, event_id, display_name, payment_status, joined_at, removed
                 FROM participants WHERE event_id = ?1 ORDER BY joined_at, rowid",
            )
            .context("failed to prepare load_participants query")?;
        let participants = stmt
            .query_map(params![event_id], participant_from_row)
            .context("failed to query participants")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to map participant rows")?;
        Ok(participants)
    }

    // ------------------------------------------------------------------
    // Slots and allocations
    // ------------------------------------------------------------------

    /// All slots of an event ordered by number.
    pub fn load_slots(&self, event_id: &str) -> Result<Vec<Slot>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, event_id, number, name, scratched
                 FROM slots WHERE event_id = ?1 ORDER BY number",
            )
            .context("failed to prepare load_slots query")?;
        let slots = stmt
            .query_map(params![event_id], slot_from_row)
            .context("failed to query slots")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to map slot rows")?;
        Ok(slots)
    }

    /// All allocations of an event in creation order.
    pub fn load_allocations(&self, event_id: &str) -> Result<Vec<Allocation>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, event_id, participant_id, slot_id, created_at
                 FROM allocations WHERE event_id = ?1 ORDER BY created_at, rowid",
            )
            .context("failed to prepare load_allocations query")?;
        let allocations = stmt
            .query_map(params![event_id], allocation_from_row)
            .context("failed to query allocations")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to map allocation rows")?;
        Ok(allocations)
    }

    /// Number of allocations recorded for an event.
    pub fn allocation_count(&self, event_id: &str) -> Result<usize> {
        let conn = self.conn();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM allocations WHERE event_id = ?1",
                params![event_id],
                |row| row.get(0),
            )
            .context("failed to count allocations")?;
        Ok(count as usize)
    }
}

#[async_trait]
impl Fetcher for Database {
    async fn fetch_all(&self, stream: StreamKind, event_id: &str) -> Result<Snapshot> {
        match stream {
            StreamKind::Participants => self.load_participants(event_id).map(Snapshot::Participants),
            StreamKind::Allocations => self.load_allocations(event_id).map(Snapshot::Allocations),
        }
    }

    async fn fetch_slots(&self, event_id: &str) -> Result<Vec<Slot>> {
        self.load_slots(event_id)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

/// Canonical stored timestamp format: RFC 3339, UTC, microseconds. Fixed width
/// so lexical order matches chronological order.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn participant_from_row(row: &Row<'_>) -> rusqlite::Result<Participant> {
    let status: String = row.get(3)?;
    let payment_status = PaymentStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            Type::Text,
            format!("unknown payment status {status:?}").into(),
        )
    })?;
    Ok(Participant {
        id: row.get(0)?,
        event_id: row.get(1)?,
        display_name: row.get(2)?,
        payment_status,
        joined_at: timestamp_column(row, 4)?,
        removed: row.get(5)?,
    })
}

pub(crate) fn slot_from_row(row: &Row<'_>) -> rusqlite::Result<Slot> {
    Ok(Slot {
        id: row.get(0)?,
        event_id: row.get(1)?,
        number: row.get(2)?,
        name: row.get(3)?,
        scratched: row.get(4)?,
    })
}

pub(crate) fn allocation_from_row(row: &Row<'_>) -> rusqlite::Result<Allocation> {
    Ok(Allocation {
        id: row.get(0)?,
        event_id: row.get(1)?,
        participant_id: row.get(2)?,
        slot_id: row.get(3)?,
        created_at: timestamp_column(row, 4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const EVENT: &str = "test_cup";

    /// Helper: create a fresh in-memory database with a 24-slot event.
    fn test_db() -> Database {
        let db = Database::open(":memory:").expect("in-memory database should open");
        db.create_event(EVENT, "Test Cup", 24).unwrap();
        db
    }

    fn t(minutes: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + Duration::minutes(minutes)
    }

    #[test]
    fn create_event_seeds_numbered_slots() {
        let db = test_db();
        let slots = db.load_slots(EVENT).unwrap();
        assert_eq!(slots.len(), 24);
        assert_eq!(slots[0].number, 1);
        assert_eq!(slots[0].name, "Horse 1");
        assert_eq!(slots[23].number, 24);
        assert!(slots.iter().all(|s| !s.scratched));

        let info = db.event(EVENT).unwrap().unwrap();
        assert_eq!(info.slot_count, 24);
        assert_eq!(info.name, "Test Cup");
    }

    #[test]
    fn create_event_is_idempotent() {
        let db = test_db();
        assert!(!db.create_event(EVENT, "Renamed", 10).unwrap());
        assert_eq!(db.load_slots(EVENT).unwrap().len(), 24);
        assert_eq!(db.event(EVENT).unwrap().unwrap().name, "Test Cup");
    }

    #[test]
    fn unknown_event_is_none() {
        let db = test_db();
        assert!(db.event("nope").unwrap().is_none());
    }

    #[test]
    fn participants_load_oldest_first() {
        let db = test_db();
        db.add_participant(EVENT, "Late", PaymentStatus::Paid, t(30)).unwrap();
        db.add_participant(EVENT, "Early", PaymentStatus::Pending, t(0)).unwrap();
        db.add_participant(EVENT, "Middle", PaymentStatus::Paid, t(10)).unwrap();

        let names: Vec<String> = db
            .load_participants(EVENT)
            .unwrap()
            .into_iter()
            .map(|p| p.display_name)
            .collect();
        assert_eq!(names, vec!["Early", "Middle", "Late"]);
    }

    #[test]
    fn add_participant_round_trips_fields() {
        let db = test_db();
        let stored = db.add_participant(EVENT, "Ada", PaymentStatus::Pending, t(5)).unwrap();
        assert!(!stored.id.is_empty());
        assert_eq!(stored.event_id, EVENT);
        assert_eq!(stored.joined_at, t(5));
        assert_eq!(stored.payment_status, PaymentStatus::Pending);
        assert!(!stored.removed);

        let loaded = db.load_participants(EVENT).unwrap();
        assert_eq!(loaded, vec![stored]);
    }

    #[test]
    fn payment_status_and_removal_update_in_place() {
        let db = test_db();
        let p = db.add_participant(EVENT, "Ada", PaymentStatus::Pending, t(0)).unwrap();

        let paid = db.set_payment_status(&p.id, PaymentStatus::Paid).unwrap().unwrap();
        assert_eq!(paid.payment_status, PaymentStatus::Paid);

        let removed = db.remove_participant(&p.id).unwrap().unwrap();
        assert!(removed.removed);
        assert!(db.set_payment_status("missing", PaymentStatus::Paid).unwrap().is_none());
    }

    #[test]
    fn expire_pending_before_only_touches_overdue_pending() {
        let db = test_db();
        let old_pending = db.add_participant(EVENT, "Old", PaymentStatus::Pending, t(0)).unwrap();
        db.add_participant(EVENT, "Old paid", PaymentStatus::Paid, t(0)).unwrap();
        db.add_participant(EVENT, "Fresh", PaymentStatus::Pending, t(50)).unwrap();

        let expired = db.expire_pending_before(EVENT, t(30)).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, old_pending.id);
        assert_eq!(expired[0].payment_status, PaymentStatus::Expired);

        let statuses: Vec<PaymentStatus> = db
            .load_participants(EVENT)
            .unwrap()
            .into_iter()
            .map(|p| p.payment_status)
            .collect();
        assert_eq!(
            statuses,
            vec![PaymentStatus::Expired, PaymentStatus::Paid, PaymentStatus::Pending]
        );
    }

    #[test]
    fn scratching_a_slot_persists() {
        let db = test_db();
        let slot = db.load_slots(EVENT).unwrap().remove(4);
        assert!(db.set_slot_scratched(&slot.id, true).unwrap());
        assert!(db.load_slots(EVENT).unwrap()[4].scratched);
        assert!(!db.set_slot_scratched("missing", true).unwrap());
    }

    #[test]
    fn schema_rejects_second_allocation_for_same_slot() {
        let db = test_db();
        let a = db.add_participant(EVENT, "A", PaymentStatus::Paid, t(0)).unwrap();
        let b = db.add_participant(EVENT, "B", PaymentStatus::Paid, t(1)).unwrap();
        let slot = db.load_slots(EVENT).unwrap().remove(0);

        let conn = db.conn();
        let insert = "INSERT INTO allocations (event_id, participant_id, slot_id, created_at)
                      VALUES (?1, ?2, ?3, ?4)";
        let now = format_timestamp(&t(2));
        conn.execute(insert, params![EVENT, a.id, slot.id, now]).unwrap();
        assert!(conn.execute(insert, params![EVENT, b.id, slot.id, now]).is_err());
    }

    #[tokio::test]
    async fn fetcher_returns_snapshots_per_stream() {
        let db = test_db();
        db.add_participant(EVENT, "Ada", PaymentStatus::Paid, t(0)).unwrap();

        let participants = db.fetch_all(StreamKind::Participants, EVENT).await.unwrap();
        assert_eq!(participants.stream(), StreamKind::Participants);
        assert_eq!(participants.len(), 1);

        let allocations = db.fetch_all(StreamKind::Allocations, EVENT).await.unwrap();
        assert!(allocations.is_empty());
        assert_eq!(db.fetch_slots(EVENT).await.unwrap().len(), 24);
        assert_eq!(db.allocation_count(EVENT).unwrap(), 0);
    }
}
