//! StreamPipeline (C6): the per-event filtering chain plus batch accumulation, grounded in the
//! teacher's `EventSubscriber` delivery path (filter-then-buffer-then-flush) from
//! `streams/subscriber.rs`, re-expressed for the filter rules and batching knobs named in §4.6
//! and §4.7.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;

use crate::config::{FeatureToggles, StreamParameters};
use crate::error::SessionError;
use crate::types::{ConsumedEvent, CursorToken, PartitionKey, SubscriptionId};

/// Why an event never reached the client. Dropped events are not errors (see `error.rs`'s doc
/// comment); this enum exists purely for metrics/logging at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    BlockedConsumption,
    MisplacedEvent,
    ConsumerTagMismatch,
    AuthorizationDenied,
}

/// External collaborator: decides whether `event`'s producer is allowed to reach this
/// client. Stands in for whatever authz the deployment actually runs (OAuth scopes, ACLs, ...).
pub trait EventAuthorizer: Send + Sync {
    fn is_denied(&self, event: &ConsumedEvent) -> bool;
}

/// Default authorizer: denies nothing. Used when a subscription has no authz configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl EventAuthorizer for AllowAll {
    fn is_denied(&self, _event: &ConsumedEvent) -> bool {
        false
    }
}

/// Outcome of running one event through the filter chain.
pub enum FilterOutcome {
    Kept,
    Dropped(DropReason),
}

/// The wire-facing batch: one line of JSON per flush, cursor first (§4.7 "batch flush"). One
/// partition's batch never mixes events from another partition's timeline.
#[derive(Debug, Clone, Serialize)]
pub struct StreamBatch {
    pub cursor: CursorToken,
    pub events: Vec<serde_json::Value>,
}

/// Delivery sink for batches and keep-alives. Implemented by whatever actually owns the
/// client's socket/channel; the pipeline itself never touches I/O.
#[async_trait]
pub trait SubscriptionOutput: Send + Sync {
    async fn send_batch(&self, batch: StreamBatch) -> Result<(), SessionError>;
    async fn send_keep_alive(&self) -> Result<(), SessionError>;
}

/// One partition's accumulating batch (§4.6 "accumulate into a per-partition pending batch").
struct PendingBatch {
    events: Vec<serde_json::Value>,
    buffered_bytes: usize,
    last_cursor: Option<CursorToken>,
    opened_at: Option<Instant>,
    last_flushed_at: Instant,
}

impl PendingBatch {
    fn new() -> Self {
        Self {
            events: Vec::new(),
            buffered_bytes: 0,
            last_cursor: None,
            opened_at: None,
            last_flushed_at: Instant::now(),
        }
    }

    fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn push(&mut self, payload: serde_json::Value, payload_len: usize, cursor: CursorToken) {
        self.buffered_bytes += payload_len;
        self.events.push(payload);
        self.last_cursor = Some(cursor);
        if self.opened_at.is_none() {
            self.opened_at = Some(Instant::now());
        }
    }

    fn flush(&mut self) -> Option<StreamBatch> {
        if self.events.is_empty() {
            return None;
        }
        let cursor = self.last_cursor.clone()?;
        self.opened_at = None;
        self.buffered_bytes = 0;
        self.last_flushed_at = Instant::now();
        Some(StreamBatch {
            cursor,
            events: std::mem::take(&mut self.events),
        })
    }
}

/// Filters incoming events and accumulates the ones that survive into a per-partition batch,
/// per the flush rules in §4.7: whichever of size, time, or memory limit is hit first.
pub struct StreamPipeline {
    subscription_id: SubscriptionId,
    feature_toggles: FeatureToggles,
    authorizer: std::sync::Arc<dyn EventAuthorizer>,
    /// Set by an external "consumption blocked for this client" signal (§4.6 step 1) — not to
    /// be confused with commit backpressure, which instead suspends polling a single partition
    /// (see `EventPoller::poll_once`). Nothing in this crate currently produces that signal;
    /// it exists for whatever owns the client connection (HTTP layer, out of scope here) to
    /// drive.
    blocked: bool,
    partitions: HashMap<PartitionKey, PendingBatch>,
}

impl StreamPipeline {
    pub fn new(subscription_id: SubscriptionId, feature_toggles: FeatureToggles, authorizer: std::sync::Arc<dyn EventAuthorizer>) -> Self {
        Self {
            subscription_id,
            feature_toggles,
            authorizer,
            blocked: false,
            partitions: HashMap::new(),
        }
    }

    pub fn set_blocked(&mut self, blocked: bool) {
        self.blocked = blocked;
    }

    /// Registers a newly-owned partition so it starts participating in keep-alive tracking
    /// even before its first event arrives. Idempotent.
    pub fn ensure_partition(&mut self, key: PartitionKey) {
        self.partitions.entry(key).or_insert_with(PendingBatch::new);
    }

    fn filter(&self, event: &ConsumedEvent) -> FilterOutcome {
        if self.blocked {
            return FilterOutcome::Dropped(DropReason::BlockedConsumption);
        }
        if self.feature_toggles.skip_misplaced_events {
            if let Some(payload_type) = &event.payload_event_type {
                if payload_type != &event.partition_key.event_type {
                    return FilterOutcome::Dropped(DropReason::MisplacedEvent);
                }
            }
        }
        if let Some(tag) = event.consumer_subscription_id {
            if tag != self.subscription_id {
                return FilterOutcome::Dropped(DropReason::ConsumerTagMismatch);
            }
        }
        if self.authorizer.is_denied(event) {
            return FilterOutcome::Dropped(DropReason::AuthorizationDenied);
        }
        FilterOutcome::Kept
    }

    /// Runs one event through the filter chain and, if kept, appends it to its partition's open
    /// batch. Returns the reason it was dropped, if any, for the caller's telemetry.
    pub fn accept(&mut self, event: ConsumedEvent) -> Option<DropReason> {
        match self.filter(&event) {
            FilterOutcome::Dropped(reason) => Some(reason),
            FilterOutcome::Kept => {
                let payload: serde_json::Value =
                    serde_json::from_slice(&event.payload_bytes).unwrap_or(serde_json::Value::Null);
                let len = event.payload_bytes.len();
                let cursor = CursorToken::mint(&event.offset_after);
                self.partitions
                    .entry(event.partition_key)
                    .or_insert_with(PendingBatch::new)
                    .push(payload, len, cursor);
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.values().all(PendingBatch::is_empty)
    }

    fn total_buffered_bytes(&self) -> usize {
        self.partitions.values().map(|b| b.buffered_bytes).sum()
    }

    /// The next partition whose batch should be flushed, if any, per §4.7's three independent
    /// limits. When the memory limit is the trigger, the largest batch is picked first, per
    /// §4.6's "flush largest batch first" rule.
    pub fn partition_to_flush(&self, params: &StreamParameters) -> Option<PartitionKey> {
        for (key, batch) in &self.partitions {
            if batch.is_empty() {
                continue;
            }
            if batch.events.len() >= params.batch_limit_events {
                return Some(key.clone());
            }
            if let Some(opened_at) = batch.opened_at {
                if opened_at.elapsed() >= params.batch_flush_timeout {
                    return Some(key.clone());
                }
            }
        }
        if self.total_buffered_bytes() >= params.stream_memory_limit_bytes {
            return self
                .partitions
                .iter()
                .filter(|(_, b)| !b.is_empty())
                .max_by_key(|(_, b)| b.buffered_bytes)
                .map(|(key, _)| key.clone());
        }
        None
    }

    /// Drains `key`'s open batch. Returns `None` if there is nothing buffered for it (an empty
    /// batch is never sent; a keep-alive covers that case instead).
    pub fn flush(&mut self, key: &PartitionKey) -> Option<StreamBatch> {
        self.partitions.get_mut(key)?.flush()
    }

    /// Drops all in-memory state for a partition the session no longer owns, without flushing
    /// it — a rebalance loss discards uncommitted runtime state (§4.4).
    pub fn drop_partition(&mut self, key: &PartitionKey) {
        self.partitions.remove(key);
    }

    /// Every owned partition whose last flush (or pipeline start) is older than
    /// `stream_keep_alive_limit` and needs an empty keep-alive batch (§4.7).
    pub fn partitions_needing_keep_alive(&self, params: &StreamParameters) -> Vec<PartitionKey> {
        self.partitions
            .iter()
            .filter(|(_, b)| b.is_empty() && b.last_flushed_at.elapsed() >= params.stream_keep_alive_limit)
            .map(|(key, _)| key.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventTypeName, Offset, PartitionKey, TimelineId};
    use chrono::Utc;
    use std::sync::Arc;

    fn event(key: &PartitionKey, tag: Option<SubscriptionId>, payload_type: Option<EventTypeName>) -> ConsumedEvent {
        ConsumedEvent {
            offset_after: crate::types::Cursor::new(key.clone(), Offset(1), TimelineId(0)),
            partition_key: key.clone(),
            payload_bytes: bytes::Bytes::from_static(b"{\"a\":1}"),
            consumer_subscription_id: tag,
            produced_at: Utc::now(),
            payload_event_type: payload_type,
        }
    }

    fn pipeline(subscription_id: SubscriptionId, toggles: FeatureToggles) -> StreamPipeline {
        StreamPipeline::new(subscription_id, toggles, Arc::new(AllowAll))
    }

    #[test]
    fn blocked_consumption_drops_everything() {
        let sub = SubscriptionId(uuid::Uuid::new_v4());
        let key = PartitionKey::new("orders", 0);
        let mut p = pipeline(sub, FeatureToggles::default());
        p.set_blocked(true);
        let reason = p.accept(event(&key, None, None));
        assert_eq!(reason, Some(DropReason::BlockedConsumption));
        assert!(p.is_empty());
    }

    #[test]
    fn misplaced_event_dropped_when_toggle_enabled() {
        let sub = SubscriptionId(uuid::Uuid::new_v4());
        let key = PartitionKey::new("orders", 0);
        let mut p = pipeline(sub, FeatureToggles { skip_misplaced_events: true });
        let e = event(&key, None, Some(EventTypeName("other".into())));
        assert_eq!(p.accept(e), Some(DropReason::MisplacedEvent));
    }

    #[test]
    fn misplaced_event_kept_when_toggle_disabled() {
        let sub = SubscriptionId(uuid::Uuid::new_v4());
        let key = PartitionKey::new("orders", 0);
        let mut p = pipeline(sub, FeatureToggles { skip_misplaced_events: false });
        let e = event(&key, None, Some(EventTypeName("other".into())));
        assert_eq!(p.accept(e), None);
        assert!(!p.is_empty());
    }

    #[test]
    fn foreign_consumer_subscription_tag_dropped() {
        let sub = SubscriptionId(uuid::Uuid::new_v4());
        let other = SubscriptionId(uuid::Uuid::new_v4());
        let key = PartitionKey::new("orders", 0);
        let mut p = pipeline(sub, FeatureToggles::default());
        let e = event(&key, Some(other), None);
        assert_eq!(p.accept(e), Some(DropReason::ConsumerTagMismatch));
    }

    #[test]
    fn untagged_event_is_not_dropped_by_the_tag_check() {
        let sub = SubscriptionId(uuid::Uuid::new_v4());
        let key = PartitionKey::new("orders", 0);
        let mut p = pipeline(sub, FeatureToggles::default());
        let e = event(&key, None, None);
        assert_eq!(p.accept(e), None);
    }

    #[test]
    fn matching_consumer_subscription_tag_kept() {
        let sub = SubscriptionId(uuid::Uuid::new_v4());
        let key = PartitionKey::new("orders", 0);
        let mut p = pipeline(sub, FeatureToggles::default());
        let e = event(&key, Some(sub), None);
        assert_eq!(p.accept(e), None);
    }

    #[test]
    fn flush_triggered_by_batch_limit_per_partition() {
        let sub = SubscriptionId(uuid::Uuid::new_v4());
        let k0 = PartitionKey::new("orders", 0);
        let k1 = PartitionKey::new("orders", 1);
        let mut p = pipeline(sub, FeatureToggles::default());
        let params = StreamParameters::builder().batch_limit_events(1).build().unwrap();

        p.accept(event(&k0, None, None));
        p.accept(event(&k1, None, None));

        let due = p.partition_to_flush(&params).unwrap();
        assert_eq!(due, k0);
        let batch = p.flush(&due).unwrap();
        assert_eq!(batch.events.len(), 1);

        // k1's batch is untouched by flushing k0's — each partition's buffer is independent.
        assert!(!p.is_empty());
        let due2 = p.partition_to_flush(&params).unwrap();
        assert_eq!(due2, k1);
    }

    #[test]
    fn memory_limit_flushes_largest_batch_first() {
        let sub = SubscriptionId(uuid::Uuid::new_v4());
        let k0 = PartitionKey::new("orders", 0);
        let k1 = PartitionKey::new("orders", 1);
        let mut p = pipeline(sub, FeatureToggles::default());
        let params = StreamParameters::builder()
            .batch_limit_events(1000)
            .stream_memory_limit_bytes(1)
            .build()
            .unwrap();

        p.accept(event(&k0, None, None));
        p.accept(event(&k1, None, None));
        p.accept(event(&k1, None, None));

        let due = p.partition_to_flush(&params).unwrap();
        assert_eq!(due, k1, "k1 has two buffered events and should flush before k0's one");
    }

    #[test]
    fn keep_alive_fires_after_idle_window_per_partition() {
        let sub = SubscriptionId(uuid::Uuid::new_v4());
        let key = PartitionKey::new("orders", 0);
        let mut p = pipeline(sub, FeatureToggles::default());
        p.accept(event(&key, None, None));
        let params = StreamParameters::builder()
            .stream_keep_alive_limit(Duration::from_millis(1))
            .build()
            .unwrap();
        p.flush(&key);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(p.partitions_needing_keep_alive(&params), vec![key]);
    }
}
