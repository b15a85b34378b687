//! PartitionAssignment (C4): turns a raw `Vec<Partition>` snapshot from the coordination store
//! into the view this session actually owns, and diffs two snapshots to find what changed.
//!
//! Grounded in the teacher's `ConsumerGroup`/`ConsumerPosition` bookkeeping in
//! `streams/subscriber.rs`, generalised from "offsets this consumer owns" to "partitions this
//! session owns right now, plus what just got taken away or handed over".

use std::collections::{HashMap, HashSet};

use crate::types::{Cursor, Offset, Partition, PartitionKey, PartitionState, SessionId, TimelineId};

/// The set of partitions a session currently owns, keyed for O(1) lookup during polling.
#[derive(Debug, Clone, Default)]
pub struct AssignmentView {
    owned: HashMap<PartitionKey, Partition>,
}

impl AssignmentView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.owned.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &PartitionKey> {
        self.owned.keys()
    }

    pub fn contains(&self, key: &PartitionKey) -> bool {
        self.owned.contains_key(key)
    }

    pub fn get(&self, key: &PartitionKey) -> Option<&Partition> {
        self.owned.get(key)
    }

    /// Starting cursor to poll from for a newly-owned partition: the store's committed offset,
    /// or the zero cursor if the partition has never been committed (§4.2).
    pub fn starting_cursor(&self, key: &PartitionKey) -> Cursor {
        match self.owned.get(key) {
            Some(p) => Cursor::new(key.clone(), p.committed_offset, TimelineId(0)),
            None => Cursor::new(key.clone(), Offset::ZERO, TimelineId(0)),
        }
    }
}

/// Result of comparing two successive partition snapshots for the same session, per §4.3's
/// "gained"/"lost" rebalance vocabulary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentDiff {
    pub gained: Vec<PartitionKey>,
    pub lost: Vec<PartitionKey>,
}

impl AssignmentDiff {
    pub fn is_empty(&self) -> bool {
        self.gained.is_empty() && self.lost.is_empty()
    }
}

/// Filters a raw coordination-store snapshot down to the partitions owned by `session_id`,
/// and reports what changed relative to `previous`.
pub fn apply_snapshot(
    previous: &AssignmentView,
    session_id: SessionId,
    snapshot: Vec<Partition>,
) -> (AssignmentView, AssignmentDiff) {
    let mut owned = HashMap::new();
    for p in snapshot {
        if p.owning_session == Some(session_id) && p.state != PartitionState::Reassigning {
            owned.insert(p.key.clone(), p);
        }
    }

    let before: HashSet<&PartitionKey> = previous.owned.keys().collect();
    let after: HashSet<&PartitionKey> = owned.keys().collect();

    let gained = after.difference(&before).map(|k| (*k).clone()).collect();
    let lost = before.difference(&after).map(|k| (*k).clone()).collect();

    (AssignmentView { owned }, AssignmentDiff { gained, lost })
}
