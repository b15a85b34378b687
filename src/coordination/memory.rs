//! In-memory `CoordinationClient`, used by the scenario tests in §8 and the demo binary.
//!
//! Grounded in this codebase's `EtcdDiscovery` (lease-based registration, watch dispatch) but
//! without any network I/O: state lives behind a `parking_lot::Mutex`, and watcher callbacks
//! are dispatched via `tokio::spawn` so they genuinely run off the caller's stack, matching the
//! "invoked on a background thread" contract in §4.3.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::CoordinationError;
use crate::types::{Cursor, CursorComparator, Partition, PartitionKey, PartitionState, SessionId, SubscriptionId};

use super::{zero_cursor, CommitOutcome, CoordinationClient, LockedAction, SessionRegistration, Watcher};

type ListenerId = u64;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum ListenerKind {
    SessionList,
    Authorization,
}

struct Inner {
    sessions: HashMap<SessionId, SubscriptionId>,
    partitions: HashMap<SubscriptionId, HashMap<PartitionKey, Partition>>,
    listeners: HashMap<(SubscriptionId, ListenerKind), HashMap<ListenerId, Arc<dyn Fn() + Send + Sync>>>,
    next_listener_id: AtomicU64,
    locks: HashMap<SubscriptionId, Arc<tokio::sync::Mutex<()>>>,
}

/// A fully in-process stand-in for a ZooKeeper/etcd-shaped coordination store.
#[derive(Clone)]
pub struct InMemoryCoordinationClient {
    inner: Arc<Mutex<Inner>>,
}

impl Default for InMemoryCoordinationClient {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCoordinationClient {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                sessions: HashMap::new(),
                partitions: HashMap::new(),
                listeners: HashMap::new(),
                next_listener_id: AtomicU64::new(0),
                locks: HashMap::new(),
            })),
        }
    }

    /// Test/demo seam: seeds the partition table for a subscription before a session starts.
    pub fn seed_partitions(&self, subscription_id: SubscriptionId, partitions: Vec<Partition>) {
        let mut inner = self.inner.lock();
        let table = inner.partitions.entry(subscription_id).or_default();
        for p in partitions {
            table.insert(p.key.clone(), p);
        }
    }

    /// Test seam: reassigns `key` to `session_id` (or unassigns with `None`) and fires
    /// watchers, simulating a rebalance computed server-side.
    pub fn reassign(&self, subscription_id: SubscriptionId, key: PartitionKey, owner: Option<SessionId>) {
        let mut inner = self.inner.lock();
        if let Some(table) = inner.partitions.get_mut(&subscription_id) {
            if let Some(p) = table.get_mut(&key) {
                p.owning_session = owner;
                p.state = if owner.is_some() {
                    PartitionState::Assigned
                } else {
                    PartitionState::Unassigned
                };
            }
        }
        let listeners = Self::listeners_for(&mut inner, subscription_id, ListenerKind::SessionList);
        drop(inner);
        for cb in listeners {
            tokio::spawn(async move { cb() });
        }
    }

    /// Test seam: fires every watcher registered via `subscribe_for_authorization_changes`,
    /// simulating a policy update on the authorization engine's side.
    pub fn trigger_authorization_change(&self, subscription_id: SubscriptionId) {
        let mut inner = self.inner.lock();
        let listeners = Self::listeners_for(&mut inner, subscription_id, ListenerKind::Authorization);
        drop(inner);
        for cb in listeners {
            tokio::spawn(async move { cb() });
        }
    }

    fn listeners_for(inner: &mut Inner, subscription_id: SubscriptionId, kind: ListenerKind) -> Vec<Arc<dyn Fn() + Send + Sync>> {
        inner
            .listeners
            .get(&(subscription_id, kind))
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    fn subscribe(&self, subscription_id: SubscriptionId, kind: ListenerKind, callback: Box<dyn Fn() + Send + Sync>) -> Box<dyn Watcher> {
        let mut inner = self.inner.lock();
        let id = inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        inner
            .listeners
            .entry((subscription_id, kind))
            .or_default()
            .insert(id, Arc::from(callback));
        Box::new(MemoryWatcher {
            inner: self.inner.clone(),
            subscription_id,
            kind,
            id,
            cancelled: false,
        })
    }
}

#[async_trait]
impl CoordinationClient for InMemoryCoordinationClient {
    async fn register_session(&self, registration: SessionRegistration) -> Result<(), CoordinationError> {
        let mut inner = self.inner.lock();
        inner
            .sessions
            .insert(registration.session_id, registration.subscription_id);
        Ok(())
    }

    async fn unregister_session(&self, session_id: SessionId) -> Result<(), CoordinationError> {
        let mut inner = self.inner.lock();
        inner.sessions.remove(&session_id);
        for table in inner.partitions.values_mut() {
            for p in table.values_mut() {
                if p.owning_session == Some(session_id) {
                    p.owning_session = None;
                    p.state = PartitionState::Unassigned;
                }
            }
        }
        Ok(())
    }

    async fn is_active_session(&self, session_id: SessionId) -> Result<bool, CoordinationError> {
        Ok(self.inner.lock().sessions.contains_key(&session_id))
    }

    async fn list_partitions(
        &self,
        subscription_id: SubscriptionId,
    ) -> Result<Vec<Partition>, CoordinationError> {
        Ok(self
            .inner
            .lock()
            .partitions
            .get(&subscription_id)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default())
    }

    fn subscribe_for_session_list_changes(
        &self,
        subscription_id: SubscriptionId,
        callback: Box<dyn Fn() + Send + Sync>,
    ) -> Box<dyn Watcher> {
        self.subscribe(subscription_id, ListenerKind::SessionList, callback)
    }

    fn subscribe_for_authorization_changes(
        &self,
        subscription_id: SubscriptionId,
        callback: Box<dyn Fn() + Send + Sync>,
    ) -> Box<dyn Watcher> {
        self.subscribe(subscription_id, ListenerKind::Authorization, callback)
    }

    async fn rebalance_sessions(&self, subscription_id: SubscriptionId) -> Result<(), CoordinationError> {
        let listeners = Self::listeners_for(&mut self.inner.lock(), subscription_id, ListenerKind::SessionList);
        for cb in listeners {
            tokio::spawn(async move { cb() });
        }
        Ok(())
    }

    async fn get_offset(&self, partition_key: &PartitionKey) -> Result<Cursor, CoordinationError> {
        let inner = self.inner.lock();
        for table in inner.partitions.values() {
            if let Some(p) = table.get(partition_key) {
                return Ok(Cursor::new(partition_key.clone(), p.committed_offset, crate::types::TimelineId(0)));
            }
        }
        Ok(zero_cursor(partition_key.clone()))
    }

    async fn commit_offsets(
        &self,
        cursors: &[Cursor],
        comparator: &dyn CursorComparator,
    ) -> Result<Vec<CommitOutcome>, CoordinationError> {
        let mut inner = self.inner.lock();
        let mut outcomes = Vec::with_capacity(cursors.len());
        for cursor in cursors {
            let mut committed = false;
            'outer: for table in inner.partitions.values_mut() {
                if let Some(p) = table.get_mut(&cursor.partition_key) {
                    let current = Cursor::new(cursor.partition_key.clone(), p.committed_offset, cursor.timeline_id);
                    if comparator.compare(cursor, &current) == std::cmp::Ordering::Greater {
                        p.committed_offset = cursor.offset;
                        committed = true;
                    }
                    break 'outer;
                }
            }
            outcomes.push(committed);
        }
        Ok(outcomes)
    }

    async fn reset_cursors(&self, cursors: &[Cursor], _timeout: std::time::Duration) -> Result<(), CoordinationError> {
        let mut inner = self.inner.lock();
        for cursor in cursors {
            for table in inner.partitions.values_mut() {
                if let Some(p) = table.get_mut(&cursor.partition_key) {
                    p.committed_offset = cursor.offset;
                }
            }
        }
        Ok(())
    }

    async fn run_locked(&self, subscription_id: SubscriptionId, action: LockedAction) -> Result<(), CoordinationError> {
        // `Inner`'s own mutex is only held long enough to fetch/create this subscription's
        // lock; the critical section itself is guarded by a `tokio::sync::Mutex` so `action`
        // can `.await` (including calling back into this same client) while holding it.
        let lock = {
            let mut inner = self.inner.lock();
            inner
                .locks
                .entry(subscription_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;
        action().await
    }
}

struct MemoryWatcher {
    inner: Arc<Mutex<Inner>>,
    subscription_id: SubscriptionId,
    kind: ListenerKind,
    id: ListenerId,
    cancelled: bool,
}

impl Watcher for MemoryWatcher {
    fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        if let Some(m) = self.inner.lock().listeners.get_mut(&(self.subscription_id, self.kind)) {
            m.remove(&self.id);
        }
    }
}

impl Drop for MemoryWatcher {
    fn drop(&mut self) {
        self.cancel();
    }
}
