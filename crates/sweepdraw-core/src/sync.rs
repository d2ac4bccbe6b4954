// Data synchronizer: identity-keyed collections that absorb push changes and
// full snapshots alike and report what actually changed.

use std::collections::{BTreeMap, HashSet};

use tracing::debug;

use crate::model::{Allocation, Change, ChangeEvent, Participant, Slot, Snapshot};

/// Records with a stable identity.
pub trait Keyed {
    fn key(&self) -> &str;
}

impl Keyed for Participant {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for Allocation {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for Slot {
    fn key(&self) -> &str {
        &self.id
    }
}

/// A single observable change to a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncDiff<T> {
    Added(T),
    Removed(T),
    Changed { old: T, new: T },
}

/// Canonical view of one stream, keyed by record id.
#[derive(Debug, Clone)]
pub struct Collection<T> {
    records: BTreeMap<String, T>,
}

impl<T> Default for Collection<T> {
    fn default() -> Self {
        Collection {
            records: BTreeMap::new(),
        }
    }
}

impl<T: Keyed + Clone + PartialEq> Collection<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in id order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.records.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    /// Apply one push delivery as an upsert/delete. Replays and updates that
    /// carry no new content produce no diff.
    pub fn apply_change(&mut self, change: Change<T>) -> Option<SyncDiff<T>> {
        match change {
            Change::Insert(record) | Change::Update(record) => self.upsert(record),
            Change::Delete { id } => match self.records.remove(&id) {
                Some(old) => Some(SyncDiff::Removed(old)),
                None => {
                    debug!("delete for unknown record {id} ignored");
                    None
                }
            },
        }
    }

    /// Replace the collection with a full fetch. Removals come first in id
    /// order, then additions and changes in snapshot order.
    pub fn apply_snapshot(&mut self, snapshot: Vec<T>) -> Vec<SyncDiff<T>> {
        let gone: Vec<String> = {
            let incoming: HashSet<&str> = snapshot.iter().map(Keyed::key).collect();
            self.records
                .keys()
                .filter(|id| !incoming.contains(id.as_str()))
                .cloned()
                .collect()
        };

        let mut diffs = Vec::new();
        for id in gone {
            if let Some(old) = self.records.remove(&id) {
                diffs.push(SyncDiff::Removed(old));
            }
        }
        for record in snapshot {
            if let Some(diff) = self.upsert(record) {
                diffs.push(diff);
            }
        }
        diffs
    }

    fn upsert(&mut self, record: T) -> Option<SyncDiff<T>> {
        let id = record.key().to_string();
        match self.records.get(&id) {
            Some(existing) if *existing == record => None,
            Some(_) => {
                let old = self.records.insert(id, record.clone())?;
                Some(SyncDiff::Changed { old, new: record })
            }
            None => {
                self.records.insert(id, record.clone());
                Some(SyncDiff::Added(record))
            }
        }
    }
}

/// A diff tagged with the stream it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamDiff {
    Participant(SyncDiff<Participant>),
    Allocation(SyncDiff<Allocation>),
}

/// Both streams of one live view.
#[derive(Debug, Clone, Default)]
pub struct Synchronizer {
    pub participants: Collection<Participant>,
    pub allocations: Collection<Allocation>,
}

impl Synchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_change(&mut self, change: ChangeEvent) -> Vec<StreamDiff> {
        match change {
            ChangeEvent::Participant(c) => self
                .participants
                .apply_change(c)
                .map(StreamDiff::Participant)
                .into_iter()
                .collect(),
            ChangeEvent::Allocation(c) => self
                .allocations
                .apply_change(c)
                .map(StreamDiff::Allocation)
                .into_iter()
                .collect(),
        }
    }

    pub fn apply_snapshot(&mut self, snapshot: Snapshot) -> Vec<StreamDiff> {
        match snapshot {
            Snapshot::Participants(records) => self
                .participants
                .apply_snapshot(records)
                .into_iter()
                .map(StreamDiff::Participant)
                .collect(),
            Snapshot::Allocations(records) => self
                .allocations
                .apply_snapshot(records)
                .into_iter()
                .map(StreamDiff::Allocation)
                .collect(),
        }
    }
}
