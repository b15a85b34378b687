//! Core identifiers and value types shared by every component (§3 of the design).

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque session identity. Minted by the facade (C9) at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub Uuid);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventTypeName(pub String);

impl std::fmt::Display for EventTypeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type PartitionId = u32;

/// `{eventType, partitionId}` — the unit of ownership, polling, and commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    pub event_type: EventTypeName,
    pub partition_id: PartitionId,
}

impl PartitionKey {
    pub fn new(event_type: impl Into<String>, partition_id: PartitionId) -> Self {
        Self {
            event_type: EventTypeName(event_type.into()),
            partition_id,
        }
    }
}

/// Ownership state of a partition as tracked by the coordination store (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionState {
    Unassigned,
    Assigned,
    Reassigning,
}

/// Snapshot of one partition's assignment row, as returned by `listPartitions()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub key: PartitionKey,
    pub owning_session: Option<SessionId>,
    pub state: PartitionState,
    pub committed_offset: Offset,
}

/// Offset within a partition. Always non-negative, monotonically non-decreasing per partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Offset(pub u64);

impl Offset {
    pub const ZERO: Offset = Offset(0);

    pub fn next(self, n: u64) -> Offset {
        Offset(self.0 + n)
    }
}

/// Identifies a storage timeline (e.g. after a topic compaction or cursor reset); cursors in
/// different timelines are incomparable by offset alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimelineId(pub u32);

/// Opaque, client-facing token minted per streamed batch. The core never inspects its
/// contents; it only echoes it back on the wire (§3 "Cursor tokens").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorToken(pub String);

impl CursorToken {
    pub fn mint(cursor: &Cursor) -> Self {
        Self(format!(
            "{}-{}-{}-{}",
            cursor.partition_key.event_type, cursor.partition_key.partition_id, cursor.timeline_id.0, cursor.offset.0
        ))
    }
}

/// A position within a partition: `{partitionKey, offset, timelineId}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub partition_key: PartitionKey,
    pub offset: Offset,
    pub timeline_id: TimelineId,
}

impl Cursor {
    pub fn new(partition_key: PartitionKey, offset: Offset, timeline_id: TimelineId) -> Self {
        Self {
            partition_key,
            offset,
            timeline_id,
        }
    }
}

/// Total ordering of cursors within a single partition, supplied externally per §4.4:
/// "respect timeline ordering then offset ordering within a timeline". Cursors on different
/// partitions are not meaningfully comparable; callers must only invoke this after checking
/// `partition_key` equality (enforced by [`CursorComparator::compare`] via a panic in debug
/// builds, since a cross-partition compare is always a caller bug).
pub trait CursorComparator: Send + Sync {
    fn compare(&self, a: &Cursor, b: &Cursor) -> Ordering;
}

/// Default comparator: timeline first, then offset. Grounded in the "timeline then offset"
/// rule from §4.4.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimelineThenOffsetComparator;

impl CursorComparator for TimelineThenOffsetComparator {
    fn compare(&self, a: &Cursor, b: &Cursor) -> Ordering {
        debug_assert_eq!(
            a.partition_key, b.partition_key,
            "cursor comparator invoked across two different partitions"
        );
        a.timeline_id.0.cmp(&b.timeline_id.0).then(a.offset.cmp(&b.offset))
    }
}

/// One event as it arrives from the poller, after being attributed to a partition but before
/// any filtering.
#[derive(Debug, Clone)]
pub struct ConsumedEvent {
    pub partition_key: PartitionKey,
    /// The cursor that the subscriber would point to *after* consuming this event.
    pub offset_after: Cursor,
    pub payload_bytes: bytes::Bytes,
    /// The `consumer_subscription_id` header tag (§4.6 step 3), if the producer set one. A
    /// value that doesn't match this session's own subscription id gets the event dropped;
    /// `None` means the producer didn't tag it and the check doesn't apply.
    pub consumer_subscription_id: Option<SubscriptionId>,
    pub produced_at: DateTime<Utc>,
    /// Event-type name embedded in the payload itself, used for the misplaced-event check
    /// (§4.6 step 2). `None` means the category is `UNDEFINED` and the check does not apply.
    pub payload_event_type: Option<EventTypeName>,
}
