//! TaskQueue (C1): the single consumer every watcher callback, timer, and poll result funnels
//! into. Grounded in the teacher's `spawn_commit_task`/`spawn_heartbeat_task` pattern of
//! background producers feeding one actor, collapsed here into one `mpsc` channel so the
//! session loop never touches shared mutable state from more than one task.

use tokio::sync::mpsc;

use crate::error::SessionError;
use crate::types::{ConsumedEvent, Cursor};

/// Everything that can move the session's state machine. A task is produced either by a
/// watcher callback, a fired [`crate::timer::Timer`], or the poller's own loop turn — never
/// handled inline by its producer.
pub enum SessionTask {
    /// The coordination store's partition table changed for this subscription.
    AssignmentChanged,
    /// It is time to run another poll pass over the owned partitions.
    PollTick,
    /// A poll pass completed with these events (possibly empty).
    EventsReady(Vec<ConsumedEvent>),
    /// The client acknowledged delivery up to these cursors. The sender carries the per-cursor
    /// outcome back to the `commit()` caller, outside the session loop (§4.7, §6).
    CommitRequested(Vec<Cursor>, tokio::sync::oneshot::Sender<Vec<bool>>),
    /// The periodic autocommit interval elapsed.
    AutocommitTick,
    /// No batch has flushed within the keep-alive window, for at least one owned partition.
    KeepAliveTick,
    /// The authorization policy covering this subscription changed; re-evaluate denied event
    /// types on the next filter pass (§4.2's authorization-update subscription).
    AuthorizationRecheckTriggered,
    /// The client asked to end the stream, or the owning process is shutting down.
    Terminate,
    /// A downstream consumer reported it could not process this event.
    UnprocessableEventReported(ConsumedEvent),
    /// Something the loop can't recover from; carries the reason for `Closing`.
    Fail(SessionError),
}

/// Producer handle: cloneable, `Send`, safe to capture in a watcher callback or timer closure.
#[derive(Clone)]
pub struct TaskSender {
    inner: mpsc::UnboundedSender<SessionTask>,
}

impl TaskSender {
    /// Enqueues a task. The only error case is the consumer having already shut down, which is
    /// not actionable from a detached callback — silently dropped, matching §9's note that a
    /// watcher firing after session teardown is expected, not a bug.
    pub fn enqueue(&self, task: SessionTask) {
        let _ = self.inner.send(task);
    }
}

pub struct TaskQueue {
    sender: TaskSender,
    receiver: mpsc::UnboundedReceiver<SessionTask>,
}

impl TaskQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            sender: TaskSender { inner: tx },
            receiver: rx,
        }
    }

    pub fn sender(&self) -> TaskSender {
        self.sender.clone()
    }

    /// Awaits the next task. Returns `None` only once every `TaskSender` clone has been
    /// dropped, which in practice means the session has already fully torn down.
    pub async fn recv(&mut self) -> Option<SessionTask> {
        self.receiver.recv().await
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
