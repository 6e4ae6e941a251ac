//! Owner actor: the single writer for one location key.
//!
//! An owner is a tokio task that exclusively holds the [`AggregateState`]
//! for one `(tenant, aggregate root, event source)` triple and runs the
//! jobs from its mailbox one at a time. The state is built lazily on the
//! first job and kept warm between jobs.
//!
//! The owner exits when its node stops, when it has been idle for the
//! configured timeout, or when every mailbox sender is gone. Before exiting
//! it closes the mailbox, gives its location key back to the cluster and
//! hands each undelivered job back to its caller for relocation.
//!
//! Applied events are never dropped silently: if the owner loses pending
//! events, the next operation on the instance fails with
//! [`DispatchError::UncommittedEventsLost`].

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, watch};

use crate::aggregate::AggregateRoot;
use crate::cancel::Cancellation;
use crate::cluster::{NodeId, OwnerLease};
use crate::error::{ActivationError, DispatchError};
use crate::event::UncommittedEvent;
use crate::event_log::EventLog;
use crate::factory::Factory;
use crate::ids::{AggregateRootVersion, EventSourceId};
use crate::state::AggregateState;

/// What the owner does with its warm state after a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// Keep the state for the next job.
    Keep,
    /// Drop the state; the next job rehydrates from the event log.
    Discard {
        /// Pending events dropped with the state whose callers were told
        /// they succeeded.
        lost: usize,
    },
}

/// A unit of work sent to an owner.
///
/// Exactly one of `run`, `fail` or `relocate` is called on every job.
pub(crate) trait Job<A: AggregateRoot>: Send + 'static {
    /// Run against the owner's state.
    fn run<'a>(
        self: Box<Self>,
        state: &'a mut AggregateState<A>,
        log: &'a dyn EventLog,
    ) -> BoxFuture<'a, Disposition>;

    /// Report that the job could not run.
    fn fail(self: Box<Self>, error: DispatchError);

    /// Hand the job back to its caller for delivery to another owner.
    fn relocate(self: Box<Self>);
}

/// Sending half of an owner's mailbox.
pub(crate) type MailboxSender<A> = mpsc::Sender<Box<dyn Job<A>>>;

/// A caller-supplied mutation, sync or async, erased to one shape.
pub(crate) trait Mutation<A: AggregateRoot, R, E>: Send {
    fn call<'s>(self: Box<Self>, state: &'s mut AggregateState<A>) -> BoxFuture<'s, Result<R, E>>;
}

/// Adapts `FnOnce(&mut AggregateState<A>) -> Result<R, E>`.
pub(crate) struct SyncMutation<F>(pub(crate) F);

impl<A, R, E, F> Mutation<A, R, E> for SyncMutation<F>
where
    A: AggregateRoot,
    R: Send + 'static,
    E: Send + 'static,
    F: FnOnce(&mut AggregateState<A>) -> Result<R, E> + Send,
{
    fn call<'s>(self: Box<Self>, state: &'s mut AggregateState<A>) -> BoxFuture<'s, Result<R, E>> {
        let result = (self.0)(state);
        futures::future::ready(result).boxed()
    }
}

/// Adapts a closure returning a boxed future that borrows the state.
pub(crate) struct AsyncMutation<F>(pub(crate) F);

impl<A, R, E, F> Mutation<A, R, E> for AsyncMutation<F>
where
    A: AggregateRoot,
    F: for<'s> FnOnce(&'s mut AggregateState<A>) -> BoxFuture<'s, Result<R, E>> + Send,
{
    fn call<'s>(self: Box<Self>, state: &'s mut AggregateState<A>) -> BoxFuture<'s, Result<R, E>> {
        (self.0)(state)
    }
}

/// Reply to a [`PerformJob`].
pub(crate) enum Outcome<A: AggregateRoot, R, E> {
    /// The mutation ran; carries its own result.
    Done(Result<R, E>),
    /// The job could not be carried out.
    Failed(DispatchError),
    /// The owner departed before running the job.
    Relocate(Box<PerformJob<A, R, E>>),
}

/// Runs one mutation and optionally commits what it applied.
pub(crate) struct PerformJob<A: AggregateRoot, R, E> {
    mutation: Box<dyn Mutation<A, R, E>>,
    commit_after: bool,
    reply: Option<oneshot::Sender<Outcome<A, R, E>>>,
}

impl<A, R, E> PerformJob<A, R, E>
where
    A: AggregateRoot,
    R: Send + 'static,
    E: Send + 'static,
{
    pub(crate) fn new(mutation: Box<dyn Mutation<A, R, E>>, commit_after: bool) -> Box<Self> {
        Box::new(Self {
            mutation,
            commit_after,
            reply: None,
        })
    }

    /// Set the channel the outcome is sent on.
    pub(crate) fn reply_to(&mut self, reply: oneshot::Sender<Outcome<A, R, E>>) {
        self.reply = Some(reply);
    }
}

fn send_outcome<A: AggregateRoot, R, E>(
    reply: Option<oneshot::Sender<Outcome<A, R, E>>>,
    outcome: Outcome<A, R, E>,
) {
    // A dropped receiver means the caller stopped waiting.
    if let Some(reply) = reply {
        let _ = reply.send(outcome);
    }
}

impl<A, R, E> Job<A> for PerformJob<A, R, E>
where
    A: AggregateRoot,
    R: Send + 'static,
    E: Send + 'static,
{
    fn run<'a>(
        self: Box<Self>,
        state: &'a mut AggregateState<A>,
        log: &'a dyn EventLog,
    ) -> BoxFuture<'a, Disposition> {
        Box::pin(async move {
            let PerformJob {
                mutation,
                commit_after,
                reply,
            } = *self;
            let pending_before = state.applied_events().len();

            let result = AssertUnwindSafe(async { mutation.call(&mut *state).await })
                .catch_unwind()
                .await;

            match result {
                Err(_panic) => {
                    tracing::error!(
                        aggregate_type = A::TYPE_NAME,
                        event_source = %state.event_source(),
                        "mutation panicked, discarding state"
                    );
                    send_outcome(reply, Outcome::Failed(DispatchError::MutationPanicked));
                    Disposition::Discard {
                        lost: pending_before,
                    }
                }
                Ok(Err(err)) => {
                    // Events applied before the error stay pending, like any
                    // other applied event.
                    send_outcome(reply, Outcome::Done(Err(err)));
                    Disposition::Keep
                }
                Ok(Ok(value)) => {
                    if commit_after && let Err(err) = commit_applied(state, log).await {
                        tracing::warn!(
                            aggregate_type = A::TYPE_NAME,
                            event_source = %state.event_source(),
                            error = %err,
                            "commit failed, discarding state"
                        );
                        // The caller learns the commit failed for every
                        // pending event.
                        send_outcome(reply, Outcome::Failed(err));
                        return Disposition::Discard { lost: 0 };
                    }
                    send_outcome(reply, Outcome::Done(Ok(value)));
                    Disposition::Keep
                }
            }
        })
    }

    fn fail(mut self: Box<Self>, error: DispatchError) {
        let reply = self.reply.take();
        send_outcome(reply, Outcome::Failed(error));
    }

    fn relocate(mut self: Box<Self>) {
        let reply = self.reply.take();
        send_outcome(reply, Outcome::Relocate(self));
    }
}

/// Commit the state's applied events at the version they were applied on.
///
/// On success the applied list is cleared; on failure it is left intact.
pub(crate) async fn commit_applied<A: AggregateRoot>(
    state: &mut AggregateState<A>,
    log: &dyn EventLog,
) -> Result<(), DispatchError> {
    if state.applied_events().is_empty() {
        return Ok(());
    }
    let events = state
        .applied_events()
        .iter()
        .map(UncommittedEvent::from_applied)
        .collect::<Result<Vec<_>, _>>()?;
    let expected =
        AggregateRootVersion::new(state.version().value().saturating_sub(events.len() as u64));
    let count = events.len();

    let committed = log
        .commit(state.aggregate_root(), state.event_source(), expected, events)
        .await
        .map_err(DispatchError::Commit)?;
    state.take_applied_events();

    tracing::debug!(
        aggregate_type = A::TYPE_NAME,
        event_source = %state.event_source(),
        count,
        version = %committed,
        "applied events committed"
    );
    Ok(())
}

/// Everything an owner needs besides its mailbox.
pub(crate) struct OwnerContext<A> {
    pub factory: Factory<A>,
    pub event_source: EventSourceId,
    pub node: NodeId,
    pub idle_timeout: Duration,
    pub lease: OwnerLease,
}

/// Why an owner loop exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    NodeStopped,
    Idle,
    Disconnected,
}

impl Exit {
    fn as_str(self) -> &'static str {
        match self {
            Exit::NodeStopped => "node stopped",
            Exit::Idle => "idle",
            Exit::Disconnected => "mailbox disconnected",
        }
    }
}

/// Completes once the node is stopped or the cluster is gone.
async fn node_stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

/// Runs the owner loop for one location key until it deactivates.
///
/// # Arguments
///
/// * `ctx` - Factory, identity and timing for this owner.
/// * `rx` - Receiving end of the owner's mailbox.
/// * `shutdown` - The hosting node's stop signal.
pub(crate) async fn run_owner<A: AggregateRoot>(
    ctx: OwnerContext<A>,
    mut rx: mpsc::Receiver<Box<dyn Job<A>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let OwnerContext {
        factory,
        event_source,
        node,
        idle_timeout,
        lease,
    } = ctx;
    let mut state: Option<AggregateState<A>> = None;
    // Dropped pending events the next job has to hear about.
    let mut unreported = 0usize;

    let exit = loop {
        let next = tokio::select! {
            biased;
            () = node_stopped(&mut shutdown) => break Exit::NodeStopped,
            next = tokio::time::timeout(idle_timeout, rx.recv()) => next,
        };
        let job = match next {
            Ok(Some(job)) => job,
            Ok(None) => break Exit::Disconnected,
            Err(_elapsed) => break Exit::Idle,
        };

        if unreported > 0 {
            job.fail(DispatchError::UncommittedEventsLost { count: unreported });
            unreported = 0;
            continue;
        }

        if state.is_none() {
            match activate(&factory, &event_source).await {
                Ok(built) => {
                    tracing::debug!(
                        aggregate_type = A::TYPE_NAME,
                        event_source = %event_source,
                        node = %node,
                        version = %built.version(),
                        "owner activated"
                    );
                    state = Some(built);
                }
                Err(err) => {
                    tracing::warn!(
                        aggregate_type = A::TYPE_NAME,
                        event_source = %event_source,
                        error = %err,
                        "activation failed"
                    );
                    job.fail(DispatchError::Activation(err));
                    continue;
                }
            }
        }
        let Some(current) = state.as_mut() else {
            continue;
        };

        let disposition = job.run(current, factory.log().as_ref()).await;
        if let Disposition::Discard { lost } = disposition {
            if lost > 0 {
                tracing::warn!(
                    aggregate_type = A::TYPE_NAME,
                    event_source = %event_source,
                    lost,
                    "discarded state with uncommitted events"
                );
            }
            unreported += lost;
            state = None;
        }
    };

    let pending = state.as_ref().map_or(0, |state| state.applied_events().len());
    if pending > 0 {
        tracing::warn!(
            aggregate_type = A::TYPE_NAME,
            event_source = %event_source,
            dropped = pending,
            "owner deactivated with uncommitted events"
        );
    }

    // Refuse new jobs and give the key back, then bounce whatever is still
    // queued.
    lease.release(unreported + pending, || rx.close()).await;
    let mut relocated = 0usize;
    while let Some(job) = rx.recv().await {
        job.relocate();
        relocated += 1;
    }

    tracing::info!(
        aggregate_type = A::TYPE_NAME,
        event_source = %event_source,
        node = %node,
        reason = exit.as_str(),
        relocated,
        "owner deactivated"
    );
}

/// Build the state, turning a panicking constructor or handler into an
/// error.
async fn activate<A: AggregateRoot>(
    factory: &Factory<A>,
    event_source: &EventSourceId,
) -> Result<AggregateState<A>, ActivationError> {
    AssertUnwindSafe(factory.build(event_source, &Cancellation::none()))
        .catch_unwind()
        .await
        .unwrap_or_else(|_panic| {
            Err(ActivationError::Panicked {
                type_name: A::TYPE_NAME,
            })
        })
}
