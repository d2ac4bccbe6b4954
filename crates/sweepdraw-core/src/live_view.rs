// Live view: one display session's synchronized state.
//
// Composes the synchronizer and novelty detector: every input from the
// connection manager is reduced into the canonical collections, and allocations
// that are genuinely new become reveals for the presentation state machine.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::debug;

use crate::model::{Allocation, Participant, PaymentStatus, Slot, Snapshot, StreamKind, SyncInput};
use crate::novelty::{Novelty, NoveltyDetector};
use crate::presentation::Reveal;
use crate::sync::{StreamDiff, SyncDiff, Synchronizer};

/// Result of feeding one input into the view.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Ingested {
    pub diffs: Vec<StreamDiff>,
    /// Novel allocations ready to present, in arrival order.
    pub reveals: Vec<Reveal>,
    /// Both initial snapshots have now been applied.
    pub initial_load_completed: bool,
}

/// One row of the results board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoardEntry {
    pub slot_number: u32,
    pub slot_name: String,
    pub scratched: bool,
    pub participant_id: Option<String>,
    pub participant_name: Option<String>,
}

pub struct LiveView {
    event_id: String,
    sync: Synchronizer,
    novelty: NoveltyDetector,
    slots: HashMap<String, Slot>,
    initial_loaded: [bool; 2],
    /// Novel allocations whose slot is not in the catalog yet.
    deferred: Vec<Allocation>,
}

impl LiveView {
    pub fn new(event_id: &str, slots: Vec<Slot>) -> Self {
        LiveView {
            event_id: event_id.to_string(),
            sync: Synchronizer::new(),
            novelty: NoveltyDetector::new(),
            slots: slots.into_iter().map(|s| (s.id.clone(), s)).collect(),
            initial_loaded: [false; 2],
            deferred: Vec::new(),
        }
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn is_initialized(&self) -> bool {
        self.novelty.is_initialized()
    }

    pub fn participant_count(&self) -> usize {
        self.sync.participants.len()
    }

    pub fn allocation_count(&self) -> usize {
        self.sync.allocations.len()
    }

    pub fn participant(&self, id: &str) -> Option<&Participant> {
        self.sync.participants.get(id)
    }

    pub fn ingest(&mut self, input: SyncInput) -> Ingested {
        let mut initial_load_completed = false;
        let diffs = match input {
            SyncInput::InitialSnapshot(snapshot) => {
                let stream = snapshot.stream();
                let was_complete = self.initial_load_done();
                let diffs = self.apply_snapshot(snapshot);
                self.initial_loaded[stream.index()] = true;
                // Novelty is anchored on the allocations load alone; a late
                // participants load must not fold newer allocations into it.
                if stream == StreamKind::Allocations && !self.novelty.is_initialized() {
                    let ids: Vec<String> =
                        self.sync.allocations.ids().map(str::to_string).collect();
                    debug!("allocations loaded: {} pre-existing", ids.len());
                    self.novelty.mark_initialized(ids);
                }
                initial_load_completed = !was_complete && self.initial_load_done();
                diffs
            }
            SyncInput::Snapshot(snapshot) => self.apply_snapshot(snapshot),
            SyncInput::Change(change) => {
                if let Some(event_id) = change.event_id() {
                    if event_id != self.event_id {
                        debug!("ignoring change for event {event_id}");
                        return Ingested::default();
                    }
                }
                self.sync.apply_change(change)
            }
        };

        let mut out = Ingested {
            diffs,
            reveals: Vec::new(),
            initial_load_completed,
        };
        for diff in &out.diffs {
            if let StreamDiff::Allocation(SyncDiff::Added(allocation)) = diff {
                if self.novelty.classify(&allocation.id) != Novelty::Novel {
                    continue;
                }
                match self.reveal_for(allocation) {
                    Some(reveal) => out.reveals.push(reveal),
                    None => {
                        debug!(
                            "allocation {} references unknown slot {}; deferring",
                            allocation.id, allocation.slot_id
                        );
                        self.deferred.push(allocation.clone());
                    }
                }
            }
        }
        out
    }

    /// Replace the slot catalog and release deferred reveals whose slot is
    /// now known.
    pub fn refresh_slots(&mut self, slots: Vec<Slot>) -> Vec<Reveal> {
        self.slots = slots.into_iter().map(|s| (s.id.clone(), s)).collect();
        let pending = std::mem::take(&mut self.deferred);
        let mut reveals = Vec::new();
        for allocation in pending {
            match self.reveal_for(&allocation) {
                Some(reveal) => reveals.push(reveal),
                None => self.deferred.push(allocation),
            }
        }
        reveals
    }

    fn initial_load_done(&self) -> bool {
        self.initial_loaded.iter().all(|l| *l)
    }

    pub fn has_deferred(&self) -> bool {
        !self.deferred.is_empty()
    }

    /// Every slot in number order with its allocated participant, if any.
    pub fn board(&self) -> Vec<BoardEntry> {
        let by_slot: HashMap<&str, &Allocation> = self
            .sync
            .allocations
            .iter()
            .map(|a| (a.slot_id.as_str(), a))
            .collect();

        let mut slots: Vec<&Slot> = self.slots.values().collect();
        slots.sort_by_key(|s| s.number);
        slots
            .into_iter()
            .map(|slot| {
                let allocation = by_slot.get(slot.id.as_str());
                BoardEntry {
                    slot_number: slot.number,
                    slot_name: slot.name.clone(),
                    scratched: slot.scratched,
                    participant_id: allocation.map(|a| a.participant_id.clone()),
                    participant_name: allocation.and_then(|a| {
                        self.sync
                            .participants
                            .get(&a.participant_id)
                            .map(|p| p.display_name.clone())
                    }),
                }
            })
            .collect()
    }

    /// Participants still waiting for a slot, oldest first.
    pub fn waiting(&self) -> Vec<&Participant> {
        let allocated: HashSet<&str> = self
            .sync
            .allocations
            .iter()
            .map(|a| a.participant_id.as_str())
            .collect();
        let mut waiting: Vec<&Participant> = self
            .sync
            .participants
            .iter()
            .filter(|p| {
                !p.removed
                    && p.payment_status != PaymentStatus::Expired
                    && !allocated.contains(p.id.as_str())
            })
            .collect();
        waiting.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.id.cmp(&b.id)));
        waiting
    }

    fn apply_snapshot(&mut self, snapshot: Snapshot) -> Vec<StreamDiff> {
        if snapshot.stream() == StreamKind::Allocations {
            debug!("applying allocation snapshot of {} records", snapshot.len());
        }
        self.sync.apply_snapshot(snapshot)
    }

    fn reveal_for(&self, allocation: &Allocation) -> Option<Reveal> {
        let slot = self.slots.get(&allocation.slot_id)?;
        Some(Reveal {
            allocation_id: allocation.id.clone(),
            participant_id: allocation.participant_id.clone(),
            participant_name: self
                .sync
                .participants
                .get(&allocation.participant_id)
                .map(|p| p.display_name.clone()),
            slot_number: slot.number,
            slot_name: slot.name.clone(),
        })
    }
}
