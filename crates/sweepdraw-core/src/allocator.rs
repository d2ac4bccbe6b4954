// Draw allocator: assigns free slots to waiting participants.
//
// Every draw runs inside an IMMEDIATE transaction, so concurrent draws from
// other connections or processes serialize on the SQLite write lock. The
// allocation insert itself is guarded by the schema's unique constraints; a
// skipped insert means another writer got there first and the whole draw is
// rolled back.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use thiserror::Error;
use tracing::{info, warn};

use crate::db::{
    allocation_from_row, format_timestamp, participant_from_row, slot_from_row, Database,
};
use crate::feed::ChangeFeed;
use crate::model::{Allocation, Change, ChangeEvent, Participant, Slot};

// ---------------------------------------------------------------------------
// Error and result types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DrawError {
    #[error("unknown event: {0}")]
    UnknownEvent(String),

    #[error("no participants waiting for a slot")]
    NoParticipantsWaiting,

    #[error("no free slots left")]
    NoSlotsAvailable,

    #[error("{participants} participants waiting but only {slots} free slots")]
    InsufficientSlots { slots: usize, participants: usize },

    #[error("another draw allocated the same participant or slot; nothing was written")]
    Conflict,

    #[error("database error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("draw task did not finish: {0}")]
    Interrupted(String),
}

/// Who is eligible to be drawn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrawPolicy {
    /// Only participants whose payment is confirmed. Otherwise anyone not
    /// expired.
    pub require_paid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawOutcome {
    pub allocation: Allocation,
    pub participant: Participant,
    pub slot: Slot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawAllOutcome {
    pub allocations: Vec<DrawOutcome>,
}

impl DrawAllOutcome {
    pub fn count(&self) -> usize {
        self.allocations.len()
    }
}

// ---------------------------------------------------------------------------
// Draw operations
// ---------------------------------------------------------------------------

/// Allocate a uniformly random free slot to the longest-waiting participant.
pub fn draw_next<R: Rng + ?Sized>(
    db: &Database,
    event_id: &str,
    policy: &DrawPolicy,
    rng: &mut R,
) -> Result<DrawOutcome, DrawError> {
    let mut conn = db.conn();
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    ensure_event(&tx, event_id)?;
    let participant = waiting_participants(&tx, event_id, policy)?
        .into_iter()
        .next()
        .ok_or(DrawError::NoParticipantsWaiting)?;
    let mut free = free_slots(&tx, event_id)?;
    if free.is_empty() {
        return Err(DrawError::NoSlotsAvailable);
    }
    let slot = free.swap_remove(rng.gen_range(0..free.len()));

    let created_at = format_timestamp(&Utc::now());
    let allocation = insert_allocation(&tx, event_id, &participant.id, &slot.id, &created_at)?;
    tx.commit()?;

    Ok(DrawOutcome {
        allocation,
        participant,
        slot,
    })
}

/// Allocate every waiting participant at once: a random permutation of the
/// free slots is assigned oldest participant first. All or nothing.
pub fn draw_all<R: Rng + ?Sized>(
    db: &Database,
    event_id: &str,
    policy: &DrawPolicy,
    rng: &mut R,
) -> Result<DrawAllOutcome, DrawError> {
    let mut conn = db.conn();
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    ensure_event(&tx, event_id)?;
    let waiting = waiting_participants(&tx, event_id, policy)?;
    if waiting.is_empty() {
        return Err(DrawError::NoParticipantsWaiting);
    }
    let mut free = free_slots(&tx, event_id)?;
    if free.len() < waiting.len() {
        return Err(DrawError::InsufficientSlots {
            slots: free.len(),
            participants: waiting.len(),
        });
    }
    free.shuffle(rng);

    let created_at = format_timestamp(&Utc::now());
    let mut allocations = Vec::with_capacity(waiting.len());
    for (participant, slot) in waiting.into_iter().zip(free) {
        let allocation =
            insert_allocation(&tx, event_id, &participant.id, &slot.id, &created_at)?;
        allocations.push(DrawOutcome {
            allocation,
            participant,
            slot,
        });
    }
    tx.commit()?;

    Ok(DrawAllOutcome { allocations })
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

fn ensure_event(conn: &Connection, event_id: &str) -> Result<(), DrawError> {
    let exists = conn
        .query_row("SELECT 1 FROM events WHERE id = ?1", params![event_id], |_| Ok(()))
        .optional()?
        .is_some();
    if exists {
        Ok(())
    } else {
        Err(DrawError::UnknownEvent(event_id.to_string()))
    }
}

/// Eligible, unallocated participants, longest waiting first.
fn waiting_participants(
    conn: &Connection,
    event_id: &str,
    policy: &DrawPolicy,
) -> Result<Vec<Participant>, DrawError> {
    let mut stmt = conn.prepare(
        "SELECT p.id, p.event_id, p.display_name, p.payment_status, p.joined_at, p.removed
         FROM participants p
         WHERE p.event_id = ?1
           AND p.removed = 0
           AND p.payment_status != 'expired'
           AND (?2 = 0 OR p.payment_status = 'paid')
           AND NOT EXISTS (
               SELECT 1 FROM allocations a
               WHERE a.event_id = p.event_id AND a.participant_id = p.id
           )
         ORDER BY p.joined_at, p.rowid",
    )?;
    let rows = stmt
        .query_map(params![event_id, policy.require_paid], participant_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Unscratched, unallocated slots by number.
fn free_slots(conn: &Connection, event_id: &str) -> Result<Vec<Slot>, DrawError> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.event_id, s.number, s.name, s.scratched
         FROM slots s
         WHERE s.event_id = ?1
           AND s.scratched = 0
           AND NOT EXISTS (
               SELECT 1 FROM allocations a
               WHERE a.event_id = s.event_id AND a.slot_id = s.id
           )
         ORDER BY s.number",
    )?;
    let rows = stmt
        .query_map(params![event_id], slot_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn insert_allocation(
    conn: &Connection,
    event_id: &str,
    participant_id: &str,
    slot_id: &str,
    created_at: &str,
) -> Result<Allocation, DrawError> {
    conn.query_row(
        "INSERT INTO allocations (event_id, participant_id, slot_id, created_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT DO NOTHING
         RETURNING id, event_id, participant_id, slot_id, created_at",
        params![event_id, participant_id, slot_id, created_at],
        allocation_from_row,
    )
    .optional()?
    .ok_or(DrawError::Conflict)
}

// ---------------------------------------------------------------------------
// DrawService
// ---------------------------------------------------------------------------

/// Draw entry point used by operator surfaces. Publishes committed
/// allocations to the change feed so live views see them as push deliveries.
pub struct DrawService {
    db: Arc<Database>,
    feed: Option<Arc<ChangeFeed>>,
    policy: DrawPolicy,
    rng: Mutex<StdRng>,
}

impl DrawService {
    pub fn new(db: Arc<Database>, policy: DrawPolicy) -> Self {
        DrawService {
            db,
            feed: None,
            policy,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic draws, for tests and rehearsals.
    pub fn with_seed(self, seed: u64) -> Self {
        self.reseed(seed);
        self
    }

    pub fn reseed(&self, seed: u64) {
        *self.rng.lock().unwrap_or_else(|e| e.into_inner()) = StdRng::seed_from_u64(seed);
    }

    pub fn with_feed(mut self, feed: Arc<ChangeFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn draw_next(&self, event_id: &str) -> Result<DrawOutcome, DrawError> {
        let result = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            draw_next(&self.db, event_id, &self.policy, &mut *rng)
        };
        match &result {
            Ok(outcome) => {
                info!(
                    "drew {} -> slot {} ({})",
                    outcome.participant.display_name, outcome.slot.number, outcome.allocation.id
                );
                self.publish(event_id, std::slice::from_ref(&outcome.allocation));
            }
            Err(e) => warn!("draw_next for {event_id} failed: {e}"),
        }
        result
    }

    pub fn draw_all(&self, event_id: &str) -> Result<DrawAllOutcome, DrawError> {
        let result = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            draw_all(&self.db, event_id, &self.policy, &mut *rng)
        };
        match &result {
            Ok(outcome) => {
                info!("bulk draw allocated {} participants", outcome.count());
                let allocations: Vec<Allocation> = outcome
                    .allocations
                    .iter()
                    .map(|o| o.allocation.clone())
                    .collect();
                self.publish(event_id, &allocations);
            }
            Err(e) => warn!("draw_all for {event_id} failed: {e}"),
        }
        result
    }

    /// `draw_next` on the blocking pool. A draw may wait on another writer's
    /// lock for up to the store's busy timeout.
    pub async fn draw_next_blocking(
        self: &Arc<Self>,
        event_id: &str,
    ) -> Result<DrawOutcome, DrawError> {
        let service = Arc::clone(self);
        let event_id = event_id.to_string();
        tokio::task::spawn_blocking(move || service.draw_next(&event_id))
            .await
            .map_err(|e| DrawError::Interrupted(e.to_string()))?
    }

    /// `draw_all` on the blocking pool.
    pub async fn draw_all_blocking(
        self: &Arc<Self>,
        event_id: &str,
    ) -> Result<DrawAllOutcome, DrawError> {
        let service = Arc::clone(self);
        let event_id = event_id.to_string();
        tokio::task::spawn_blocking(move || service.draw_all(&event_id))
            .await
            .map_err(|e| DrawError::Interrupted(e.to_string()))?
    }

    fn publish(&self, event_id: &str, allocations: &[Allocation]) {
        if let Some(feed) = &self.feed {
            for allocation in allocations {
                feed.publish(
                    event_id,
                    ChangeEvent::Allocation(Change::Insert(allocation.clone())),
                );
            }
        }
    }
}
