//! Session (C9): the facade a caller actually holds. `SessionBuilder` assembles the
//! collaborators (coordination client, storage, output sink, ...) and validated stream
//! parameters; `Session::stream` drives the state machine (C1/C2) to completion and
//! `Session::terminate` can be called concurrently from another task to stop it early.
//!
//! Grounded in the teacher's top-level `EventSubscriber` constructor, which is likewise the
//! single place a caller touches while `spawn_commit_task`/`spawn_heartbeat_task` do the actual
//! work off to the side.

pub mod context;
pub mod state;
pub mod task_queue;

use std::sync::Arc;

use tracing::{info_span, Instrument};

use crate::commit::CommitTracker;
use crate::config::{StreamParameters, SubscriptionAnnotations};
use crate::coordination::CoordinationClient;
use crate::dlq::DlqHandler;
use crate::error::{ConfigError, SessionError};
use crate::pipeline::{AllowAll, EventAuthorizer, StreamPipeline, SubscriptionOutput};
use crate::poller::{EventPoller, EventStorage};
use crate::types::{CursorComparator, SessionId, SubscriptionId, TimelineThenOffsetComparator};

use context::SessionContext;
use state::{enter_chain, State};
use task_queue::{SessionTask, TaskQueue, TaskSender};

/// Assembles a [`Session`]. Every external collaborator is mandatory; stream parameters and
/// annotations fall back to their defaults, matching `StreamParametersBuilder`'s convention of
/// never panicking on missing optional fields.
pub struct SessionBuilder {
    session_id: Option<SessionId>,
    subscription_id: Option<SubscriptionId>,
    coordination: Option<Arc<dyn CoordinationClient>>,
    storage: Option<Arc<dyn EventStorage>>,
    output: Option<Arc<dyn SubscriptionOutput>>,
    dlq: Option<DlqHandler>,
    authorizer: Option<Arc<dyn EventAuthorizer>>,
    comparator: Option<Arc<dyn CursorComparator>>,
    params: StreamParameters,
    annotations: SubscriptionAnnotations,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self {
            session_id: None,
            subscription_id: None,
            coordination: None,
            storage: None,
            output: None,
            dlq: None,
            authorizer: None,
            comparator: None,
            params: StreamParameters::default(),
            annotations: SubscriptionAnnotations::default(),
        }
    }
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the session's identity explicitly. Optional: a random one is minted in `build()`
    /// if never called, which is the right choice for every caller except tests that need to
    /// seed the coordination store with a matching `owning_session` ahead of time.
    pub fn session_id(mut self, id: SessionId) -> Self {
        self.session_id = Some(id);
        self
    }

    pub fn subscription_id(mut self, id: SubscriptionId) -> Self {
        self.subscription_id = Some(id);
        self
    }

    pub fn coordination(mut self, client: Arc<dyn CoordinationClient>) -> Self {
        self.coordination = Some(client);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn EventStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn output(mut self, output: Arc<dyn SubscriptionOutput>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn dlq(mut self, dlq: DlqHandler) -> Self {
        self.dlq = Some(dlq);
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn EventAuthorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn comparator(mut self, comparator: Arc<dyn CursorComparator>) -> Self {
        self.comparator = Some(comparator);
        self
    }

    pub fn params(mut self, params: StreamParameters) -> Self {
        self.params = params;
        self
    }

    pub fn annotations(mut self, annotations: SubscriptionAnnotations) -> Self {
        self.annotations = annotations;
        self
    }

    pub fn build(self) -> Result<Session, ConfigError> {
        let subscription_id = self.subscription_id.ok_or(ConfigError::MissingField("subscription_id"))?;
        let coordination = self.coordination.ok_or(ConfigError::MissingField("coordination"))?;
        let storage = self.storage.ok_or(ConfigError::MissingField("storage"))?;
        let output = self.output.ok_or(ConfigError::MissingField("output"))?;
        let authorizer = self.authorizer.unwrap_or_else(|| Arc::new(AllowAll));
        let comparator = self.comparator.unwrap_or_else(|| Arc::new(TimelineThenOffsetComparator));

        let session_id = self.session_id.unwrap_or_default();
        let span = info_span!("session", session_id = %session_id, subscription_id = %subscription_id);

        let queue = TaskQueue::new();
        let tasks = queue.sender();

        let pipeline = StreamPipeline::new(subscription_id, crate::config::FeatureToggles::default(), authorizer);

        let ctx = SessionContext {
            session_id,
            subscription_id,
            params: self.params,
            annotations: self.annotations,
            coordination,
            comparator,
            poller: EventPoller::new(storage),
            pipeline,
            commit_tracker: CommitTracker::new(),
            output,
            dlq: self.dlq,
            assignment: crate::assignment::AssignmentView::new(),
            unprocessable_attempts: std::collections::HashMap::new(),
            tasks: tasks.clone(),
            span,
            watcher: None,
            authz_watcher: None,
            poll_timer: None,
            keepalive_timer: None,
            autocommit_timer: None,
        };

        Ok(Session { ctx, queue, tasks })
    }
}

/// A running (or not-yet-started) per-client subscription stream.
pub struct Session {
    ctx: SessionContext,
    queue: TaskQueue,
    tasks: TaskSender,
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    pub fn id(&self) -> SessionId {
        self.ctx.session_id
    }

    /// A cloneable handle that can request early termination from outside `stream()`'s future,
    /// e.g. from an HTTP handler noticing the client disconnected.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle { tasks: self.tasks.clone() }
    }

    /// A downstream consumer failed to process `event`; routes it through the unprocessable-event
    /// policy (§4.8) on the session's own loop rather than acting on it here.
    pub fn report_unprocessable(&self, event: crate::types::ConsumedEvent) {
        self.tasks.enqueue(SessionTask::UnprocessableEventReported(event));
    }

    /// Drives the session through `Starting -> Streaming -> ... -> Closing -> Dead`. Returns
    /// `Ok(())` if closed via `terminate()`, `Err` for any other reason (§4's "session always
    /// ends in exactly one of these ways").
    pub async fn stream(mut self) -> Result<(), SessionError> {
        let span = self.ctx.span.clone();
        async move {
            let mut state = enter_chain(&mut self.ctx, State::Starting).await;
            let mut closing_reason: Option<SessionError> = None;

            loop {
                if let State::Closing(ref reason) = state {
                    closing_reason = Some(reason.clone());
                }
                if matches!(state, State::Dead) {
                    break;
                }
                let task = match self.queue.recv().await {
                    Some(t) => t,
                    None => break,
                };
                let before = std::mem::discriminant(&state);
                let next = state.handle(&mut self.ctx, task).await;
                state = if std::mem::discriminant(&next) == before {
                    // No actual transition: the individual task handlers (PollTick,
                    // KeepAliveTick, ...) already re-arm whatever timer they consumed, so
                    // re-running `on_enter` here would reset timers that aren't due yet.
                    next
                } else {
                    enter_chain(&mut self.ctx, next).await
                };
            }

            match closing_reason {
                Some(SessionError::Terminated) | None => Ok(()),
                Some(reason) => Err(reason),
            }
        }
        .instrument(span)
        .await
    }
}

/// A detached handle for requesting termination of a [`Session`] whose `stream()` future is
/// owned elsewhere (another task, an HTTP connection handler, ...).
#[derive(Clone)]
pub struct SessionHandle {
    tasks: TaskSender,
}

impl SessionHandle {
    pub fn terminate(&self) {
        self.tasks.enqueue(SessionTask::Terminate);
    }

    pub fn report_unprocessable(&self, event: crate::types::ConsumedEvent) {
        self.tasks.enqueue(SessionTask::UnprocessableEventReported(event));
    }

    /// The client committed these cursors. Enqueues the commit onto the session's own loop and
    /// waits for its result, so the per-cursor outcome is surfaced synchronously to the caller
    /// rather than fire-and-forget (§4.7, §6).
    pub async fn commit(&self, cursors: Vec<crate::types::Cursor>) -> Result<Vec<bool>, SessionError> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.tasks.enqueue(SessionTask::CommitRequested(cursors, reply_tx));
        reply_rx
            .await
            .map_err(|_| SessionError::Internal("session loop ended before replying to commit".into()))
    }
}
