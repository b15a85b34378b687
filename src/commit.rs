//! CommitTracker (C7): tracks events sent but not yet acknowledged, enforces
//! `max_uncommitted_events` backpressure and `commit_timeout`, and drives autocommit.
//!
//! Grounded in the teacher's `pending_commits` bookkeeping and `spawn_commit_task` in
//! `streams/subscriber.rs` — here folded into plain state queried by the session loop on each
//! tick rather than its own background task, since this engine's task queue (C1) already is
//! one.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::types::{Cursor, Offset, PartitionKey};

struct PendingEntry {
    offset: Offset,
    sent_at: Instant,
}

/// Tracks, per partition, the cursors sent to the client that have not yet been committed.
pub struct CommitTracker {
    pending: HashMap<PartitionKey, VecDeque<PendingEntry>>,
    last_autocommit_at: Instant,
}

impl Default for CommitTracker {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
            last_autocommit_at: Instant::now(),
        }
    }
}

impl CommitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called whenever a batch is handed to the client: every cursor covered by the batch
    /// becomes uncommitted until acknowledged.
    pub fn record_sent(&mut self, cursor: &Cursor) {
        self.pending.entry(cursor.partition_key.clone()).or_default().push_back(PendingEntry {
            offset: cursor.offset,
            sent_at: Instant::now(),
        });
    }

    /// Called on a client (or autocommit) commit: clears every pending entry at or before
    /// `cursor.offset` on that partition, per §4.4's "commit clears everything up to and
    /// including this cursor" rule.
    pub fn acknowledge(&mut self, cursor: &Cursor) {
        if let Some(queue) = self.pending.get_mut(&cursor.partition_key) {
            queue.retain(|e| e.offset > cursor.offset);
            if queue.is_empty() {
                self.pending.remove(&cursor.partition_key);
            }
        }
    }

    pub fn drop_partition(&mut self, key: &PartitionKey) {
        self.pending.remove(key);
    }

    pub fn uncommitted_count(&self) -> usize {
        self.pending.values().map(|q| q.len()).sum()
    }

    fn uncommitted_count_for(&self, key: &PartitionKey) -> usize {
        self.pending.get(key).map(VecDeque::len).unwrap_or(0)
    }

    /// True once `key`'s own uncommitted count reaches the configured ceiling: polling must be
    /// suspended for that partition alone until the client catches up, per §4.5 — a backed-up
    /// partition does not stop delivery on every other partition the session owns.
    pub fn is_backpressured(&self, key: &PartitionKey, max_uncommitted_events: usize) -> bool {
        self.uncommitted_count_for(key) >= max_uncommitted_events
    }

    /// The first partition whose oldest uncommitted entry has sat longer than
    /// `commit_timeout`, if any — this closes the session per §4.4's commit-timeout rule.
    pub fn timed_out_partition(&self, commit_timeout: Duration) -> Option<PartitionKey> {
        self.pending
            .iter()
            .filter_map(|(key, queue)| queue.front().map(|e| (key, e.sent_at)))
            .find(|(_, sent_at)| sent_at.elapsed() >= commit_timeout)
            .map(|(key, _)| key.clone())
    }

    /// Whether an autocommit sweep is due, per the `autocommit_interval` annotation (§6, §9).
    pub fn autocommit_due(&self, interval: Option<Duration>) -> bool {
        match interval {
            Some(d) => self.last_autocommit_at.elapsed() >= d,
            None => false,
        }
    }

    /// Commits every pending cursor unconditionally and resets the autocommit clock. Used when
    /// `autocommit_due` fires.
    pub fn autocommit_all(&mut self) -> Vec<Cursor> {
        self.last_autocommit_at = Instant::now();
        let mut cursors = Vec::new();
        for (key, queue) in self.pending.iter() {
            if let Some(last) = queue.back() {
                cursors.push(Cursor::new(key.clone(), last.offset, crate::types::TimelineId(0)));
            }
        }
        self.pending.clear();
        cursors
    }
}
