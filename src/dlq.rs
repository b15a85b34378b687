//! DLQHandler (C8): what happens to an event the pipeline could not deliver because it was
//! unprocessable (malformed payload, schema mismatch at the consumer) rather than filtered out
//! by policy. Grounded in the teacher's `PublishedEvent` shape from `streams/publisher.rs`,
//! reused here as the wire shape for re-publishing a poison event to a dead-letter topic.

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use crate::config::UnprocessableEventPolicy;
use crate::error::SessionError;
use crate::types::ConsumedEvent;

#[derive(Error, Debug, Clone)]
pub enum PublishError {
    #[error("failed to publish to dead-letter topic {0}: {1}")]
    Failed(String, String),
}

/// External collaborator: publishes a re-shaped event to a topic. Implemented by whatever the
/// deployment already uses to produce events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, event: &ConsumedEvent, reason: &str) -> Result<(), PublishError>;
}

/// Outcome of running the unprocessable-event policy over one event (§4.8).
#[derive(Debug)]
pub enum UnprocessableOutcome {
    Skipped,
    SentToDlq,
}

pub struct DlqHandler {
    publisher: std::sync::Arc<dyn EventPublisher>,
    dlq_topic: String,
}

impl DlqHandler {
    pub fn new(publisher: std::sync::Arc<dyn EventPublisher>, dlq_topic: impl Into<String>) -> Self {
        Self {
            publisher,
            dlq_topic: dlq_topic.into(),
        }
    }

    /// Applies `policy` to one unprocessable event. `Abort` is not handled here: the caller
    /// (the session loop) checks for that policy before ever calling in, since aborting closes
    /// the whole session rather than disposing of a single event.
    pub async fn handle(
        &self,
        event: &ConsumedEvent,
        policy: UnprocessableEventPolicy,
        reason: &str,
    ) -> Result<UnprocessableOutcome, SessionError> {
        match policy {
            UnprocessableEventPolicy::SkipEvent => Ok(UnprocessableOutcome::Skipped),
            UnprocessableEventPolicy::DeadLetterQueue => {
                self.publisher
                    .publish(&self.dlq_topic, event, reason)
                    .await
                    .map_err(|e| SessionError::Unprocessable(e.to_string()))?;
                Ok(UnprocessableOutcome::SentToDlq)
            }
            UnprocessableEventPolicy::Abort => Err(SessionError::Unprocessable(format!(
                "abort policy reached DlqHandler::handle for event on {:?} at {}",
                event.partition_key,
                Utc::now()
            ))),
        }
    }
}
