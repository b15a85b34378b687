//! State (C2): the session's state machine. Four variants, no cycles —
//! `Starting -> Streaming -> Closing(reason) -> Dead` — each with `on_enter`/`on_exit`/`handle`
//! dispatch, grounded in the teacher's `ConsumerGroup` lifecycle (join -> consume -> leave) from
//! `streams/subscriber.rs`, made explicit here as a sum type instead of a handful of booleans.

use tracing::{debug, info, warn};

use crate::assignment::apply_snapshot;
use crate::coordination::{LockedAction, SessionRegistration};
use crate::error::SessionError;
use crate::types::{Cursor, Offset, TimelineId};

use super::context::SessionContext;
use super::task_queue::SessionTask;

/// A session's lifecycle stage. `Closing` carries the reason it is shutting down so `Dead`'s
/// caller (the facade) knows whether `stream()` returned `Ok` or the specific `Err`.
pub enum State {
    Starting,
    Streaming,
    Closing(SessionError),
    Dead,
}

impl State {
    /// Runs this state's entry action. A `Starting` or `Streaming` entry failure is reported
    /// back as `Err` rather than self-transitioning, so the driver can fold it into `Closing`
    /// through the same single path `handle`'s `Fail` task uses.
    pub async fn on_enter(&mut self, ctx: &mut SessionContext) -> Result<(), SessionError> {
        match self {
            State::Starting => {
                debug!(parent: &ctx.span, "session starting");
                ctx.coordination
                    .register_session(SessionRegistration {
                        session_id: ctx.session_id,
                        subscription_id: ctx.subscription_id,
                    })
                    .await?;

                // Seed cursors for any owned partition that has never been committed, under the
                // subscription's distributed lock so two sessions racing `Starting` can't both
                // seed the same partition (§4.2).
                let coordination = ctx.coordination.clone();
                let subscription_id = ctx.subscription_id;
                let session_id = ctx.session_id;
                let initial_offset = ctx.annotations.initial_offset;
                if initial_offset != Offset::ZERO {
                    let action: LockedAction = Box::new(move || {
                        Box::pin(async move {
                            let partitions = coordination.list_partitions(subscription_id).await?;
                            let to_seed: Vec<Cursor> = partitions
                                .into_iter()
                                .filter(|p| p.owning_session == Some(session_id) && p.committed_offset == Offset::ZERO)
                                .map(|p| Cursor::new(p.key, initial_offset, TimelineId(0)))
                                .collect();
                            if !to_seed.is_empty() {
                                coordination.reset_cursors(&to_seed, std::time::Duration::from_secs(30)).await?;
                            }
                            Ok(())
                        })
                    });
                    ctx.coordination.run_locked(subscription_id, action).await?;
                }

                let tasks = ctx.tasks.clone();
                ctx.watcher = Some(ctx.coordination.subscribe_for_session_list_changes(
                    ctx.subscription_id,
                    Box::new(move || tasks.enqueue(SessionTask::AssignmentChanged)),
                ));

                let tasks = ctx.tasks.clone();
                ctx.authz_watcher = Some(ctx.coordination.subscribe_for_authorization_changes(
                    ctx.subscription_id,
                    Box::new(move || tasks.enqueue(SessionTask::AuthorizationRecheckTriggered)),
                ));

                ctx.tasks.enqueue(SessionTask::AssignmentChanged);
                Ok(())
            }
            State::Streaming => {
                info!(parent: &ctx.span, "session streaming");
                // The poll timer is armed by the `PollTick` handler itself once this first,
                // immediate tick runs — arming it here too would leave two live timers racing.
                ctx.arm_keepalive_timer();
                ctx.arm_autocommit_timer();
                ctx.tasks.enqueue(SessionTask::PollTick);
                Ok(())
            }
            State::Closing(reason) => {
                warn!(parent: &ctx.span, %reason, "session closing");
                ctx.disarm_all_timers();
                ctx.watcher.take();
                ctx.authz_watcher.take();

                let pending: Vec<_> = ctx.assignment.keys().cloned().collect();
                for key in &pending {
                    if let Some(batch) = ctx.pipeline.flush(key) {
                        let _ = ctx.output.send_batch(batch).await;
                    }
                }
                let _ = ctx.coordination.unregister_session(ctx.session_id).await;
                Ok(())
            }
            State::Dead => {
                debug!(parent: &ctx.span, "session dead");
                Ok(())
            }
        }
    }

    pub fn on_exit(&mut self, _ctx: &mut SessionContext) {}

    /// Consumes `self` and the next task, returning the state to transition to (which may be
    /// `self` unchanged, represented by returning the same variant).
    pub async fn handle(self, ctx: &mut SessionContext, task: SessionTask) -> State {
        match (self, task) {
            (State::Starting, SessionTask::AssignmentChanged) => match ctx.coordination.list_partitions(ctx.subscription_id).await {
                Ok(snapshot) => {
                    let (view, diff) = apply_snapshot(&ctx.assignment, ctx.session_id, snapshot);
                    for key in &diff.gained {
                        let cursor = view.starting_cursor(key);
                        ctx.poller.seed(key.clone(), cursor);
                        ctx.pipeline.ensure_partition(key.clone());
                    }
                    for key in &diff.lost {
                        ctx.poller.drop_partition(key);
                        ctx.commit_tracker.drop_partition(key);
                        ctx.pipeline.drop_partition(key);
                    }
                    ctx.assignment = view;
                    State::Streaming
                }
                Err(e) => State::Closing(e.into()),
            },
            (State::Starting, SessionTask::Fail(reason)) => State::Closing(reason),
            (State::Starting, SessionTask::Terminate) => State::Closing(SessionError::Terminated),
            (State::Starting, _) => State::Starting,

            (State::Streaming, SessionTask::AssignmentChanged) => match ctx.coordination.list_partitions(ctx.subscription_id).await {
                Ok(snapshot) => {
                    let (view, diff) = apply_snapshot(&ctx.assignment, ctx.session_id, snapshot);
                    for key in &diff.gained {
                        let cursor = view.starting_cursor(key);
                        ctx.poller.seed(key.clone(), cursor);
                        ctx.pipeline.ensure_partition(key.clone());
                    }
                    for key in &diff.lost {
                        ctx.poller.drop_partition(key);
                        ctx.commit_tracker.drop_partition(key);
                        ctx.pipeline.drop_partition(key);
                    }
                    ctx.assignment = view;
                    State::Streaming
                }
                Err(e) => State::Closing(e.into()),
            },
            (State::Streaming, SessionTask::PollTick) => {
                if !ctx.assignment.is_empty() {
                    let max_uncommitted = ctx.params.max_uncommitted_events;
                    let events = ctx
                        .poller
                        .poll_once(&ctx.assignment, ctx.params.batch_limit_events, ctx.params.poll_timeout, |key| {
                            ctx.commit_tracker.is_backpressured(key, max_uncommitted)
                        })
                        .await;
                    ctx.tasks.enqueue(SessionTask::EventsReady(events));
                } else {
                    ctx.arm_poll_timer();
                }
                State::Streaming
            }
            (State::Streaming, SessionTask::EventsReady(events)) => {
                for event in events {
                    let cursor = event.offset_after.clone();
                    match ctx.pipeline.accept(event) {
                        None => {
                            ctx.commit_tracker.record_sent(&cursor);
                        }
                        Some(reason) => {
                            debug!(parent: &ctx.span, ?reason, partition = ?cursor.partition_key, "dropped event");
                        }
                    }
                }
                while let Some(key) = ctx.pipeline.partition_to_flush(&ctx.params) {
                    if let Some(batch) = ctx.pipeline.flush(&key) {
                        if let Err(e) = ctx.output.send_batch(batch).await {
                            ctx.tasks.enqueue(SessionTask::Fail(e));
                            break;
                        }
                    }
                }
                if let Some(key) = ctx.commit_tracker.timed_out_partition(ctx.params.commit_timeout) {
                    return State::Closing(SessionError::CommitTimeout(key));
                }
                ctx.arm_poll_timer();
                State::Streaming
            }
            (State::Streaming, SessionTask::CommitRequested(cursors, reply)) => {
                match ctx.coordination.commit_offsets(&cursors, ctx.comparator.as_ref()).await {
                    Ok(outcomes) => {
                        for (cursor, committed) in cursors.iter().zip(outcomes.iter()) {
                            if *committed {
                                ctx.commit_tracker.acknowledge(cursor);
                            }
                        }
                        let _ = reply.send(outcomes);
                        State::Streaming
                    }
                    Err(e) => {
                        let _ = reply.send(vec![false; cursors.len()]);
                        State::Closing(e.into())
                    }
                }
            }
            (State::Streaming, SessionTask::AutocommitTick) => {
                let cursors = ctx.commit_tracker.autocommit_all();
                if !cursors.is_empty() {
                    if let Err(e) = ctx.coordination.commit_offsets(&cursors, ctx.comparator.as_ref()).await {
                        return State::Closing(e.into());
                    }
                }
                ctx.arm_autocommit_timer();
                State::Streaming
            }
            (State::Streaming, SessionTask::KeepAliveTick) => {
                let due = ctx.pipeline.partitions_needing_keep_alive(&ctx.params);
                if !due.is_empty() {
                    if let Err(e) = ctx.output.send_keep_alive().await {
                        return State::Closing(e);
                    }
                }
                ctx.arm_keepalive_timer();
                State::Streaming
            }
            (State::Streaming, SessionTask::AuthorizationRecheckTriggered) => {
                // The authorizer itself (an `Arc<dyn EventAuthorizer>` shared with whatever owns
                // the policy) is consulted fresh on every `accept()` call; there is no cached
                // verdict to invalidate here. The notification exists so a future authorizer
                // that does cache per-event-type verdicts has a place to hang its invalidation.
                debug!(parent: &ctx.span, "authorization policy changed");
                State::Streaming
            }
            (State::Streaming, SessionTask::UnprocessableEventReported(event)) => {
                let key = (event.partition_key.clone(), event.offset_after.offset);
                let attempts = ctx.unprocessable_attempts.entry(key.clone()).or_insert(0);
                *attempts += 1;

                let threshold_reached = match ctx.annotations.max_event_send_count {
                    Some(max) => *attempts >= max,
                    // No threshold configured: the policy never applies (§9 decision), so the
                    // event is left to keep being retried by whatever reports it.
                    None => false,
                };
                if !threshold_reached {
                    return State::Streaming;
                }
                ctx.unprocessable_attempts.remove(&key);

                let policy = ctx.annotations.unprocessable_event_policy;
                match &ctx.dlq {
                    Some(dlq) => match dlq.handle(&event, policy, "max send attempts exceeded").await {
                        Ok(_) => State::Streaming,
                        Err(e) => State::Closing(e),
                    },
                    None => {
                        warn!(parent: &ctx.span, "unprocessable event policy {:?} configured but no DlqHandler attached", policy);
                        State::Streaming
                    }
                }
            }
            (State::Streaming, SessionTask::Fail(reason)) => State::Closing(reason),
            (State::Streaming, SessionTask::Terminate) => State::Closing(SessionError::Terminated),

            (State::Closing(reason), SessionTask::CommitRequested(cursors, reply)) => {
                let _ = reply.send(vec![false; cursors.len()]);
                State::Closing(reason)
            }
            (State::Closing(reason), _) => State::Closing(reason),
            (State::Dead, SessionTask::CommitRequested(cursors, reply)) => {
                let _ = reply.send(vec![false; cursors.len()]);
                State::Dead
            }
            (State::Dead, _) => State::Dead,
        }
    }
}

/// Drives `on_enter` until the state settles on something that waits for a task
/// (`Starting`, `Streaming`) or terminates (`Dead`). `Closing` has no task-driven exit: once its
/// cleanup runs, the next state is always `Dead`. A failed `on_enter` on `Starting`/`Streaming`
/// is folded into `Closing` the same way `handle`'s `Fail` task is.
pub async fn enter_chain(ctx: &mut SessionContext, mut state: State) -> State {
    loop {
        match state.on_enter(ctx).await {
            Ok(()) => match state {
                State::Closing(_) => {
                    state = State::Dead;
                    continue;
                }
                other => return other,
            },
            Err(e) => {
                state = State::Closing(e);
                continue;
            }
        }
    }
}
