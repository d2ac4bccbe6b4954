// Records observed by the live view: participants, slots, allocations, and
// the change/snapshot envelopes they travel in.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Participants
// ---------------------------------------------------------------------------

/// Payment state of a registered participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Expired,
}

impl PaymentStatus {
    /// Storage/wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Expired => "expired",
        }
    }

    /// Parse the storage representation. Case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(PaymentStatus::Pending),
            "paid" => Some(PaymentStatus::Paid),
            "expired" => Some(PaymentStatus::Expired),
            _ => None,
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered participant. Only `payment_status` and `removed` change after
/// registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub event_id: String,
    pub display_name: String,
    pub payment_status: PaymentStatus,
    pub joined_at: DateTime<Utc>,
    /// Soft removal; removed participants are never drawn.
    #[serde(default)]
    pub removed: bool,
}

// ---------------------------------------------------------------------------
// Slots
// ---------------------------------------------------------------------------

/// A numbered competition unit ("horse"). Created once per event at setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: String,
    pub event_id: String,
    /// Ordinal in `1..=slot_count`.
    pub number: u32,
    pub name: String,
    #[serde(default)]
    pub scratched: bool,
}

// ---------------------------------------------------------------------------
// Allocations
// ---------------------------------------------------------------------------

/// Assignment of one participant to one slot. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: String,
    pub event_id: String,
    pub participant_id: String,
    pub slot_id: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A sweepstake event as stored in the backing store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventInfo {
    pub id: String,
    pub name: String,
    pub slot_count: u32,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Streams and change envelopes
// ---------------------------------------------------------------------------

/// The two record streams a live view observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Participants,
    Allocations,
}

impl StreamKind {
    pub const ALL: [StreamKind; 2] = [StreamKind::Participants, StreamKind::Allocations];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Participants => "participants",
            StreamKind::Allocations => "allocations",
        }
    }

    /// Position of this stream in per-stream arrays.
    pub fn index(&self) -> usize {
        match self {
            StreamKind::Participants => 0,
            StreamKind::Allocations => 1,
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation carried by a push delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// A single push delivery for one record type. Deletes carry only the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change<T> {
    Insert(T),
    Update(T),
    Delete { id: String },
}

impl<T> Change<T> {
    pub fn op(&self) -> ChangeOp {
        match self {
            Change::Insert(_) => ChangeOp::Insert,
            Change::Update(_) => ChangeOp::Update,
            Change::Delete { .. } => ChangeOp::Delete,
        }
    }
}

/// A push delivery on either stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Participant(Change<Participant>),
    Allocation(Change<Allocation>),
}

impl ChangeEvent {
    pub fn stream(&self) -> StreamKind {
        match self {
            ChangeEvent::Participant(_) => StreamKind::Participants,
            ChangeEvent::Allocation(_) => StreamKind::Allocations,
        }
    }

    /// Event the changed record belongs to, when the record is present.
    pub fn event_id(&self) -> Option<&str> {
        match self {
            ChangeEvent::Participant(Change::Insert(p) | Change::Update(p)) => Some(&p.event_id),
            ChangeEvent::Allocation(Change::Insert(a) | Change::Update(a)) => Some(&a.event_id),
            _ => None,
        }
    }
}

/// A full fetch of one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Snapshot {
    Participants(Vec<Participant>),
    Allocations(Vec<Allocation>),
}

impl Snapshot {
    pub fn stream(&self) -> StreamKind {
        match self {
            Snapshot::Participants(_) => StreamKind::Participants,
            Snapshot::Allocations(_) => StreamKind::Allocations,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Snapshot::Participants(records) => records.len(),
            Snapshot::Allocations(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Input to a live view's synchronizer, regardless of which channel produced
/// it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncInput {
    /// First successful fetch of a stream after the session opened.
    InitialSnapshot(Snapshot),
    /// Polling or resync fetch.
    Snapshot(Snapshot),
    /// Push delivery.
    Change(ChangeEvent),
}
