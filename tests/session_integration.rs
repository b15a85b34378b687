//! End-to-end scenarios for a running `Session`, against the in-memory coordination client and
//! a small local storage/output fake — no network, no real broker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use stream_engine::config::StreamParameters;
use stream_engine::coordination::InMemoryCoordinationClient;
use stream_engine::pipeline::{StreamBatch, SubscriptionOutput};
use stream_engine::poller::{EventStorage, StorageError};
use stream_engine::types::{ConsumedEvent, Cursor, Offset, Partition, PartitionKey, PartitionState, SessionId, SubscriptionId, TimelineId};
use stream_engine::{Session, SessionError};

struct RecordingOutput {
    batches: Arc<Mutex<Vec<StreamBatch>>>,
}

#[async_trait]
impl SubscriptionOutput for RecordingOutput {
    async fn send_batch(&self, batch: StreamBatch) -> Result<(), SessionError> {
        self.batches.lock().push(batch);
        Ok(())
    }

    async fn send_keep_alive(&self) -> Result<(), SessionError> {
        Ok(())
    }
}

struct FixedStorage {
    events: HashMap<PartitionKey, Vec<ConsumedEvent>>,
}

#[async_trait]
impl EventStorage for FixedStorage {
    async fn poll(&self, from: &Cursor, max_events: usize, _timeout: Duration) -> Result<Vec<ConsumedEvent>, StorageError> {
        let all = self.events.get(&from.partition_key).cloned().unwrap_or_default();
        Ok(all.into_iter().filter(|e| e.offset_after.offset > from.offset).take(max_events).collect())
    }
}

fn event(key: &PartitionKey, offset: u64) -> ConsumedEvent {
    ConsumedEvent {
        partition_key: key.clone(),
        offset_after: Cursor::new(key.clone(), Offset(offset), TimelineId(0)),
        payload_bytes: bytes::Bytes::from(format!("{{\"n\":{offset}}}")),
        consumer_subscription_id: None,
        produced_at: chrono::Utc::now(),
        payload_event_type: Some(key.event_type.clone()),
    }
}

fn fast_params() -> StreamParameters {
    StreamParameters::builder()
        .poll_timeout(Duration::from_millis(10))
        .batch_flush_timeout(Duration::from_millis(20))
        .batch_limit_events(2)
        .stream_keep_alive_limit(Duration::from_secs(30))
        .commit_timeout(Duration::from_secs(30))
        .build()
        .unwrap()
}

#[tokio::test]
async fn streams_assigned_events_and_terminates_cleanly() {
    let subscription_id = SubscriptionId(uuid::Uuid::new_v4());
    let session_id = SessionId::new();
    let key = PartitionKey::new("orders.created", 0);

    let coordination = Arc::new(InMemoryCoordinationClient::new());
    coordination.seed_partitions(
        subscription_id,
        vec![Partition {
            key: key.clone(),
            owning_session: Some(session_id),
            state: PartitionState::Assigned,
            committed_offset: Offset::ZERO,
        }],
    );

    let mut events = HashMap::new();
    events.insert(key.clone(), (1..=4).map(|n| event(&key, n)).collect());
    let storage = Arc::new(FixedStorage { events });

    let batches = Arc::new(Mutex::new(Vec::new()));
    let session = Session::builder()
        .session_id(session_id)
        .subscription_id(subscription_id)
        .coordination(coordination)
        .storage(storage)
        .output(Arc::new(RecordingOutput { batches: batches.clone() }))
        .params(fast_params())
        .build()
        .unwrap();

    let handle = session.handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.terminate();
    });

    let result = tokio::time::timeout(Duration::from_secs(2), session.stream()).await.expect("session did not finish in time");
    assert!(result.is_ok(), "session should close cleanly on terminate(): {result:?}");

    let total_events: usize = batches.lock().iter().map(|b| b.events.len()).sum();
    assert_eq!(total_events, 4);
}

#[tokio::test]
async fn commit_timeout_closes_the_session() {
    let subscription_id = SubscriptionId(uuid::Uuid::new_v4());
    let session_id = SessionId::new();
    let key = PartitionKey::new("orders.created", 0);

    let coordination = Arc::new(InMemoryCoordinationClient::new());
    coordination.seed_partitions(
        subscription_id,
        vec![Partition {
            key: key.clone(),
            owning_session: Some(session_id),
            state: PartitionState::Assigned,
            committed_offset: Offset::ZERO,
        }],
    );

    let mut events = HashMap::new();
    events.insert(key.clone(), vec![event(&key, 1)]);
    let storage = Arc::new(FixedStorage { events });

    let params = StreamParameters::builder()
        .poll_timeout(Duration::from_millis(10))
        .batch_flush_timeout(Duration::from_millis(5))
        .batch_limit_events(1)
        .commit_timeout(Duration::from_millis(50))
        .stream_keep_alive_limit(Duration::from_secs(30))
        .build()
        .unwrap();

    let session = Session::builder()
        .session_id(session_id)
        .subscription_id(subscription_id)
        .coordination(coordination)
        .storage(storage)
        .output(Arc::new(RecordingOutput { batches: Arc::new(Mutex::new(Vec::new())) }))
        .params(params)
        .build()
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), session.stream()).await.expect("session did not finish in time");
    assert!(matches!(result, Err(SessionError::CommitTimeout(_))));
}

#[tokio::test]
async fn rebalance_away_stops_further_delivery_from_lost_partition() {
    let subscription_id = SubscriptionId(uuid::Uuid::new_v4());
    let session_id = SessionId::new();
    let other_session = SessionId::new();
    let key = PartitionKey::new("orders.created", 0);

    let coordination = Arc::new(InMemoryCoordinationClient::new());
    coordination.seed_partitions(
        subscription_id,
        vec![Partition {
            key: key.clone(),
            owning_session: Some(session_id),
            state: PartitionState::Assigned,
            committed_offset: Offset::ZERO,
        }],
    );

    let mut events = HashMap::new();
    events.insert(key.clone(), (1..=10).map(|n| event(&key, n)).collect());
    let storage = Arc::new(FixedStorage { events });

    let batches = Arc::new(Mutex::new(Vec::new()));
    let session = Session::builder()
        .session_id(session_id)
        .subscription_id(subscription_id)
        .coordination(coordination.clone())
        .storage(storage)
        .output(Arc::new(RecordingOutput { batches: batches.clone() }))
        .params(fast_params())
        .build()
        .unwrap();

    let handle = session.handle();
    let coordination_for_reassign = coordination.clone();
    let key_for_reassign = key.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        coordination_for_reassign.reassign(subscription_id, key_for_reassign, Some(other_session));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.terminate();
    });

    let result = tokio::time::timeout(Duration::from_secs(2), session.stream()).await.expect("session did not finish in time");
    assert!(result.is_ok());

    // Once reassigned away, the session must stop polling that partition: the batch count
    // settles rather than continuing to grow across the whole 10-event backlog.
    let delivered: usize = batches.lock().iter().map(|b| b.events.len()).sum();
    assert!(delivered < 10, "expected delivery to stop once the partition was reassigned away, got {delivered}");
}

#[tokio::test]
async fn commit_returns_synchronous_result_to_caller() {
    let subscription_id = SubscriptionId(uuid::Uuid::new_v4());
    let session_id = SessionId::new();
    let key = PartitionKey::new("orders.created", 0);

    let coordination = Arc::new(InMemoryCoordinationClient::new());
    coordination.seed_partitions(
        subscription_id,
        vec![Partition {
            key: key.clone(),
            owning_session: Some(session_id),
            state: PartitionState::Assigned,
            committed_offset: Offset::ZERO,
        }],
    );

    let mut events = HashMap::new();
    events.insert(key.clone(), vec![event(&key, 1)]);
    let storage = Arc::new(FixedStorage { events });

    let session = Session::builder()
        .session_id(session_id)
        .subscription_id(subscription_id)
        .coordination(coordination)
        .storage(storage)
        .output(Arc::new(RecordingOutput { batches: Arc::new(Mutex::new(Vec::new())) }))
        .params(fast_params())
        .build()
        .unwrap();

    let handle = session.handle();
    let stream_task = tokio::spawn(session.stream());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let outcomes = handle
        .commit(vec![Cursor::new(key.clone(), Offset(1), TimelineId(0))])
        .await
        .expect("commit() must resolve while the session loop is alive");
    assert_eq!(outcomes, vec![true]);

    handle.terminate();
    let result = tokio::time::timeout(Duration::from_secs(2), stream_task)
        .await
        .expect("session task did not finish in time")
        .expect("session task panicked");
    assert!(result.is_ok());
}

#[tokio::test]
async fn two_owned_partitions_batch_independently() {
    let subscription_id = SubscriptionId(uuid::Uuid::new_v4());
    let session_id = SessionId::new();
    let k0 = PartitionKey::new("orders.created", 0);
    let k1 = PartitionKey::new("orders.created", 1);

    let coordination = Arc::new(InMemoryCoordinationClient::new());
    coordination.seed_partitions(
        subscription_id,
        vec![
            Partition {
                key: k0.clone(),
                owning_session: Some(session_id),
                state: PartitionState::Assigned,
                committed_offset: Offset::ZERO,
            },
            Partition {
                key: k1.clone(),
                owning_session: Some(session_id),
                state: PartitionState::Assigned,
                committed_offset: Offset::ZERO,
            },
        ],
    );

    let mut events = HashMap::new();
    events.insert(k0.clone(), (1..=3).map(|n| event(&k0, n)).collect());
    events.insert(k1.clone(), (1..=3).map(|n| event(&k1, n)).collect());
    let storage = Arc::new(FixedStorage { events });

    let batches = Arc::new(Mutex::new(Vec::new()));
    let session = Session::builder()
        .session_id(session_id)
        .subscription_id(subscription_id)
        .coordination(coordination)
        .storage(storage)
        .output(Arc::new(RecordingOutput { batches: batches.clone() }))
        .params(fast_params())
        .build()
        .unwrap();

    let handle = session.handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.terminate();
    });

    let result = tokio::time::timeout(Duration::from_secs(2), session.stream()).await.expect("session did not finish in time");
    assert!(result.is_ok());

    // A shared, non-partitioned batch buffer would either interleave these two partitions'
    // events into one batch or silently drop one side; each must arrive in full.
    let total_events: usize = batches.lock().iter().map(|b| b.events.len()).sum();
    assert_eq!(total_events, 6, "both partitions' events must be delivered independently");
}
