//! Demo binary: runs one session end to end against in-memory fakes, so the streaming engine
//! can be exercised without a real coordination store or broker behind it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stream_engine::coordination::InMemoryCoordinationClient;
use stream_engine::pipeline::{StreamBatch, SubscriptionOutput};
use stream_engine::poller::{EventStorage, StorageError};
use stream_engine::types::{ConsumedEvent, Cursor, Offset, Partition, PartitionKey, PartitionState, SessionId, SubscriptionId, TimelineId};
use stream_engine::error::ConfigError;
use stream_engine::{Session, SessionError};
use tracing::info;

struct StdoutOutput;

#[async_trait]
impl SubscriptionOutput for StdoutOutput {
    async fn send_batch(&self, batch: StreamBatch) -> Result<(), SessionError> {
        info!(events = batch.events.len(), cursor = ?batch.cursor, "delivering batch");
        Ok(())
    }

    async fn send_keep_alive(&self) -> Result<(), SessionError> {
        info!("keep-alive");
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

fn sample_event(key: &PartitionKey, offset: u64) -> ConsumedEvent {
    ConsumedEvent {
        partition_key: key.clone(),
        offset_after: Cursor::new(key.clone(), Offset(offset), TimelineId(0)),
        payload_bytes: bytes::Bytes::from(format!("{{\"order_id\":{offset}}}")),
        consumer_subscription_id: None,
        produced_at: chrono::Utc::now(),
        payload_event_type: Some(key.event_type.clone()),
    }
}

#[tokio::main]
async fn main() -> Result<(), ConfigError> {
    tracing_subscriber::fmt().with_target(false).with_level(true).init();

    let subscription_id = SubscriptionId(uuid::Uuid::new_v4());
    let partition_key = PartitionKey::new("orders.created", 0);

    let coordination = Arc::new(InMemoryCoordinationClient::new());
    let session_id = SessionId::new();
    coordination.seed_partitions(
        subscription_id,
        vec![Partition {
            key: partition_key.clone(),
            owning_session: Some(session_id),
            state: PartitionState::Assigned,
            committed_offset: Offset::ZERO,
        }],
    );

    let mut events = HashMap::new();
    events.insert(partition_key.clone(), (1..=5).map(|n| sample_event(&partition_key, n)).collect());
    let storage = Arc::new(FixedStorage { events });

    let session = Session::builder()
        .session_id(session_id)
        .subscription_id(subscription_id)
        .coordination(coordination)
        .storage(storage)
        .output(Arc::new(StdoutOutput))
        .build()?;

    let handle = session.handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        handle.terminate();
    });

    match session.stream().await {
        Ok(()) => info!("session closed cleanly"),
        Err(e) => info!(error = %e, "session closed with error"),
    }
    Ok(())
}
