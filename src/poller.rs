//! EventPoller (C5): pulls events for the partitions a session currently owns.
//!
//! `EventStorage` is the external collaborator boundary onto wherever events actually live
//! (log-structured storage, a broker's own partition files, ...). Grounded in the teacher's
//! `PublishedEvent`/offset-indexed read path in `streams/publisher.rs`, generalised to an
//! `async_trait` the same way `coordination` generalises `ServiceDiscovery`.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::assignment::AssignmentView;
use crate::types::{ConsumedEvent, Cursor, PartitionKey};

#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("storage unavailable for partition {0:?}: {1}")]
    Unavailable(PartitionKey, String),

    #[error("cursor for partition {0:?} no longer exists (timeline compacted away)")]
    CursorGone(PartitionKey),
}

/// Boundary onto the event store backing a partition's timeline.
#[async_trait]
pub trait EventStorage: Send + Sync {
    /// Reads up to `max_events` events strictly after `from`, waiting up to `timeout` for at
    /// least one to become available. An empty result on timeout is not an error (§4.5).
    async fn poll(
        &self,
        from: &Cursor,
        max_events: usize,
        timeout: Duration,
    ) -> Result<Vec<ConsumedEvent>, StorageError>;
}

/// Drives one poll pass across every partition a session owns, tracking the per-partition
/// cursor to resume from on the next pass.
pub struct EventPoller {
    storage: std::sync::Arc<dyn EventStorage>,
    cursors: std::collections::HashMap<PartitionKey, Cursor>,
}

impl EventPoller {
    pub fn new(storage: std::sync::Arc<dyn EventStorage>) -> Self {
        Self {
            storage,
            cursors: std::collections::HashMap::new(),
        }
    }

    /// Seeds (or reseeds, after a rebalance gain) the cursor a partition resumes from.
    pub fn seed(&mut self, key: PartitionKey, cursor: Cursor) {
        self.cursors.insert(key, cursor);
    }

    pub fn drop_partition(&mut self, key: &PartitionKey) {
        self.cursors.remove(key);
    }

    /// Polls every owned partition once, round-robin, splitting `max_events` and `timeout`
    /// evenly across them (§4.5). `is_backpressured` is consulted per partition and, when it
    /// returns true, that partition is skipped for this pass entirely — polling resumes once
    /// its uncommitted count drops, per §4.5's "suspended for that partition only" rule.
    /// Returns the union of events read, each partition's output already ordered by cursor. A
    /// partition whose storage call errors is skipped for this pass rather than failing the
    /// whole poll; the caller decides what to do with a wholesale storage outage separately.
    pub async fn poll_once(
        &mut self,
        assignment: &AssignmentView,
        max_events: usize,
        timeout: Duration,
        is_backpressured: impl Fn(&PartitionKey) -> bool,
    ) -> Vec<ConsumedEvent> {
        let keys: Vec<PartitionKey> = assignment.keys().filter(|k| !is_backpressured(k)).cloned().collect();
        if keys.is_empty() {
            return Vec::new();
        }
        let per_partition_max = (max_events / keys.len()).max(1);
        let per_partition_timeout = timeout / (keys.len() as u32);

        let mut out = Vec::new();
        for key in keys {
            let from = self
                .cursors
                .get(&key)
                .cloned()
                .unwrap_or_else(|| assignment.starting_cursor(&key));
            match self.storage.poll(&from, per_partition_max, per_partition_timeout).await {
                Ok(events) => {
                    if let Some(last) = events.last() {
                        self.cursors.insert(key.clone(), last.offset_after.clone());
                    }
                    out.extend(events);
                }
                Err(_) => continue,
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Offset, Partition, PartitionState, SessionId, TimelineId};
    use std::sync::Arc;

    struct FakeStorage {
        events: std::collections::HashMap<PartitionKey, Vec<ConsumedEvent>>,
    }

    #[async_trait]
    impl EventStorage for FakeStorage {
        async fn poll(
            &self,
            from: &Cursor,
            max_events: usize,
            _timeout: Duration,
        ) -> Result<Vec<ConsumedEvent>, StorageError> {
            let all = self.events.get(&from.partition_key).cloned().unwrap_or_default();
            Ok(all
                .into_iter()
                .filter(|e| e.offset_after.offset > from.offset)
                .take(max_events)
                .collect())
        }
    }

    fn event(key: &PartitionKey, offset: u64) -> ConsumedEvent {
        ConsumedEvent {
            partition_key: key.clone(),
            offset_after: Cursor::new(key.clone(), Offset(offset), TimelineId(0)),
            payload_bytes: bytes::Bytes::from_static(b"{}"),
            consumer_subscription_id: None,
            produced_at: chrono::Utc::now(),
            payload_event_type: None,
        }
    }

    #[tokio::test]
    async fn polls_each_owned_partition_and_advances_cursor() {
        let k0 = PartitionKey::new("orders", 0);
        let session = SessionId::new();
        let mut events = std::collections::HashMap::new();
        events.insert(k0.clone(), vec![event(&k0, 1), event(&k0, 2)]);
        let storage = Arc::new(FakeStorage { events });
        let mut poller = EventPoller::new(storage);

        let (view, _) = crate::assignment::apply_snapshot(
            &AssignmentView::new(),
            session,
            vec![Partition {
                key: k0.clone(),
                owning_session: Some(session),
                state: PartitionState::Assigned,
                committed_offset: Offset::ZERO,
            }],
        );

        let batch = poller.poll_once(&view, 500, Duration::from_millis(100), |_| false).await;
        assert_eq!(batch.len(), 2);

        let batch2 = poller.poll_once(&view, 500, Duration::from_millis(100), |_| false).await;
        assert!(batch2.is_empty(), "second pass should start past the last cursor");
    }

    #[tokio::test]
    async fn empty_assignment_polls_nothing() {
        let storage = Arc::new(FakeStorage {
            events: std::collections::HashMap::new(),
        });
        let mut poller = EventPoller::new(storage);
        let batch = poller.poll_once(&AssignmentView::new(), 500, Duration::from_millis(100), |_| false).await;
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn backpressured_partition_is_skipped_while_others_still_poll() {
        let k0 = PartitionKey::new("orders", 0);
        let k1 = PartitionKey::new("orders", 1);
        let session = SessionId::new();
        let mut events = std::collections::HashMap::new();
        events.insert(k0.clone(), vec![event(&k0, 1)]);
        events.insert(k1.clone(), vec![event(&k1, 1)]);
        let storage = Arc::new(FakeStorage { events });
        let mut poller = EventPoller::new(storage);

        let (view, _) = crate::assignment::apply_snapshot(
            &AssignmentView::new(),
            session,
            vec![
                Partition {
                    key: k0.clone(),
                    owning_session: Some(session),
                    state: PartitionState::Assigned,
                    committed_offset: Offset::ZERO,
                },
                Partition {
                    key: k1.clone(),
                    owning_session: Some(session),
                    state: PartitionState::Assigned,
                    committed_offset: Offset::ZERO,
                },
            ],
        );

        let backpressured = k0.clone();
        let batch = poller
            .poll_once(&view, 500, Duration::from_millis(100), |k| *k == backpressured)
            .await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].partition_key, k1);
    }
}
