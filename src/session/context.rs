//! SessionContext: the collaborators and mutable runtime state every `State` variant needs to
//! handle a task. Passed by `&mut` into `State::handle` rather than split across many small
//! arguments, the way the teacher threads a single connection/session struct through its state
//! handlers.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::Span;

use crate::assignment::AssignmentView;
use crate::commit::CommitTracker;
use crate::config::{StreamParameters, SubscriptionAnnotations};
use crate::coordination::{CoordinationClient, Watcher};
use crate::dlq::DlqHandler;
use crate::pipeline::{StreamPipeline, SubscriptionOutput};
use crate::poller::EventPoller;
use crate::timer::Timer;
use crate::types::{CursorComparator, Offset, PartitionKey, SessionId, SubscriptionId};

use super::task_queue::TaskSender;

pub struct SessionContext {
    pub session_id: SessionId,
    pub subscription_id: SubscriptionId,
    pub params: StreamParameters,
    pub annotations: SubscriptionAnnotations,

    pub coordination: Arc<dyn CoordinationClient>,
    pub comparator: Arc<dyn CursorComparator>,
    pub poller: EventPoller,
    pub pipeline: StreamPipeline,
    pub commit_tracker: CommitTracker,
    pub output: Arc<dyn SubscriptionOutput>,
    pub dlq: Option<DlqHandler>,

    pub assignment: AssignmentView,
    /// Send attempts per `(partition, offset)`, consulted against
    /// `annotations.max_event_send_count` before the unprocessable-event policy applies (§4.8).
    pub unprocessable_attempts: HashMap<(PartitionKey, Offset), u32>,

    pub tasks: TaskSender,
    pub span: Span,

    /// Held only to keep the watch alive; dropped (and so cancelled) on `Dead::on_enter`.
    pub watcher: Option<Box<dyn Watcher>>,
    /// Same lifetime contract as `watcher`, for the authorization-change subscription.
    pub authz_watcher: Option<Box<dyn Watcher>>,
    pub poll_timer: Option<Timer>,
    pub keepalive_timer: Option<Timer>,
    pub autocommit_timer: Option<Timer>,
}

impl SessionContext {
    /// (Re)arms the poll timer for one `poll_timeout` out. Called after every poll pass so the
    /// loop keeps ticking as long as the session is `Streaming`.
    pub fn arm_poll_timer(&mut self) {
        let tasks = self.tasks.clone();
        self.poll_timer = Some(Timer::schedule(self.params.poll_timeout, move || {
            tasks.enqueue(super::task_queue::SessionTask::PollTick);
        }));
    }

    pub fn arm_keepalive_timer(&mut self) {
        let tasks = self.tasks.clone();
        self.keepalive_timer = Some(Timer::schedule(self.params.stream_keep_alive_limit, move || {
            tasks.enqueue(super::task_queue::SessionTask::KeepAliveTick);
        }));
    }

    pub fn arm_autocommit_timer(&mut self) {
        if let Some(interval) = self.annotations.autocommit_interval {
            let tasks = self.tasks.clone();
            self.autocommit_timer = Some(Timer::schedule(interval, move || {
                tasks.enqueue(super::task_queue::SessionTask::AutocommitTick);
            }));
        }
    }

    pub fn disarm_all_timers(&mut self) {
        self.poll_timer = None;
        self.keepalive_timer = None;
        self.autocommit_timer = None;
    }
}
