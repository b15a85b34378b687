//! CoordinationClient (C3): the adapter boundary onto whatever coordination store backs a
//! deployment (ZooKeeper-, etcd-, or Raft-log-shaped — the core does not care). Modelled after
//! this codebase's `ServiceDiscovery` trait: an `async_trait` with register/discover/watch
//! methods, implementations kept behind `Arc<dyn _>`.

mod memory;

pub use memory::InMemoryCoordinationClient;

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;

use crate::error::CoordinationError;
use crate::types::{Cursor, CursorComparator, Offset, Partition, PartitionKey, SessionId, SubscriptionId};

/// A critical section run under `run_locked`. Boxed rather than generic so
/// `CoordinationClient` stays object-safe; the action itself is async because seeding cursors
/// (its one caller, `Starting::on_enter`) needs to call back into this same trait's other async
/// methods while the lock is held.
pub type LockedAction = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = Result<(), CoordinationError>> + Send>> + Send>;

/// A session row as registered in the coordination store.
#[derive(Debug, Clone)]
pub struct SessionRegistration {
    pub session_id: SessionId,
    pub subscription_id: SubscriptionId,
}

/// A live watch on the coordination store. Dropping it releases the underlying registration
/// (background task, ephemeral node, etc.) — the "scoped resource released on state exit" from
/// §9.
pub trait Watcher: Send {
    /// Cancels the watch. Idempotent; also run implicitly on `Drop`.
    fn cancel(&mut self);
}

/// The per-cursor outcome of a `commit_offsets` call, per §4.3: true iff the cursor was
/// strictly greater than the previously committed cursor.
pub type CommitOutcome = bool;

#[async_trait]
pub trait CoordinationClient: Send + Sync {
    async fn register_session(&self, registration: SessionRegistration) -> Result<(), CoordinationError>;

    async fn unregister_session(&self, session_id: SessionId) -> Result<(), CoordinationError>;

    async fn is_active_session(&self, session_id: SessionId) -> Result<bool, CoordinationError>;

    async fn list_partitions(
        &self,
        subscription_id: SubscriptionId,
    ) -> Result<Vec<Partition>, CoordinationError>;

    /// Registers a callback fired (on a background task — never inline) whenever the session
    /// set for `subscription_id` changes. The callback **must only enqueue work**; see §9's
    /// "Watcher callbacks on foreign threads" note. Returns a handle whose `cancel`/`Drop`
    /// releases the watch.
    fn subscribe_for_session_list_changes(
        &self,
        subscription_id: SubscriptionId,
        callback: Box<dyn Fn() + Send + Sync>,
    ) -> Box<dyn Watcher>;

    /// Registers a callback fired whenever the authorization policy covering `subscription_id`
    /// changes (§4.2's "subscribes to authorization updates for all event types"). Same
    /// foreign-thread contract as `subscribe_for_session_list_changes`.
    fn subscribe_for_authorization_changes(
        &self,
        subscription_id: SubscriptionId,
        callback: Box<dyn Fn() + Send + Sync>,
    ) -> Box<dyn Watcher>;

    /// Requests a server-side reassignment computation. Side effect only: watchers fire later
    /// with the new partition table.
    async fn rebalance_sessions(&self, subscription_id: SubscriptionId) -> Result<(), CoordinationError>;

    async fn get_offset(&self, partition_key: &PartitionKey) -> Result<Cursor, CoordinationError>;

    /// Returns one outcome per input cursor, in order, per §4.3's success rule.
    async fn commit_offsets(
        &self,
        cursors: &[Cursor],
        comparator: &dyn CursorComparator,
    ) -> Result<Vec<CommitOutcome>, CoordinationError>;

    async fn reset_cursors(
        &self,
        cursors: &[Cursor],
        timeout: std::time::Duration,
    ) -> Result<(), CoordinationError>;

    /// Runs `action` inside the subscription's distributed critical section.
    async fn run_locked(&self, subscription_id: SubscriptionId, action: LockedAction) -> Result<(), CoordinationError>;
}

/// Helper used by `Starting` to seed a partition's initial cursor when absent, per §4.2.
pub fn zero_cursor(partition_key: PartitionKey) -> Cursor {
    Cursor::new(partition_key, Offset::ZERO, crate::types::TimelineId(0))
}
