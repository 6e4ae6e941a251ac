//! Serialized operations against one aggregate instance.
//!
//! [`AggregateOperations`] turns each call into a job for the owner of the
//! instance's [`LocationKey`] and waits for its reply. Jobs handed back by a
//! departing owner are delivered again, so a failover only shows up as
//! latency.

use std::convert::Infallible;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tracing::Instrument;

use crate::actor::{AsyncMutation, Mutation, Outcome, PerformJob, SyncMutation};
use crate::aggregate::AggregateRoot;
use crate::cancel::Cancellation;
use crate::config::CommitPolicy;
use crate::error::{DispatchError, PerformError};
use crate::factory::Factory;
use crate::ids::{AggregateRootId, AggregateRootVersion, EventSourceId, LocationKey, TenantId};
use crate::runtime::Shared;
use crate::state::AggregateState;

/// Operations on one `(tenant, aggregate root, event source)` instance.
///
/// Every call runs on the instance's single owner, one at a time and in
/// the order each caller issued them. `Clone` is cheap; clones address the
/// same owner.
pub struct AggregateOperations<A: AggregateRoot> {
    tenant: TenantId,
    aggregate_root: AggregateRootId,
    event_source: EventSourceId,
    key: LocationKey,
    shared: Arc<Shared>,
    factory: Factory<A>,
}

impl<A: AggregateRoot> Clone for AggregateOperations<A> {
    fn clone(&self) -> Self {
        Self {
            tenant: self.tenant,
            aggregate_root: self.aggregate_root,
            event_source: self.event_source.clone(),
            key: self.key,
            shared: Arc::clone(&self.shared),
            factory: self.factory.clone(),
        }
    }
}

impl<A: AggregateRoot> std::fmt::Debug for AggregateOperations<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateOperations")
            .field("aggregate_type", &A::TYPE_NAME)
            .field("tenant", &self.tenant)
            .field("event_source", &self.event_source)
            .field("key", &self.key)
            .finish()
    }
}

impl<A: AggregateRoot> AggregateOperations<A> {
    pub(crate) fn new(
        tenant: TenantId,
        aggregate_root: AggregateRootId,
        event_source: EventSourceId,
        shared: Arc<Shared>,
        factory: Factory<A>,
    ) -> Self {
        let key = shared
            .cluster
            .location_key_for(tenant, &aggregate_root, &event_source);
        Self {
            tenant,
            aggregate_root,
            event_source,
            key,
            shared,
            factory,
        }
    }

    /// Tenant the instance belongs to.
    pub fn tenant(&self) -> TenantId {
        self.tenant
    }

    /// Identifier of the aggregate root type.
    pub fn aggregate_root(&self) -> AggregateRootId {
        self.aggregate_root
    }

    /// Identifier of the instance.
    pub fn event_source(&self) -> &EventSourceId {
        &self.event_source
    }

    /// The key this instance's owner is addressed by.
    pub fn location_key(&self) -> LocationKey {
        self.key
    }

    /// Run `mutation` against the instance's state on its owner.
    ///
    /// # Errors
    ///
    /// * [`PerformError::Operation`] carries the exact error `mutation`
    ///   returned.
    /// * [`PerformError::Failed`] for anything else: activation failure,
    ///   no live node, a panicking mutation, or a failed commit.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use aggregate_runtime::*;
    /// # async fn demo<A: AggregateRoot>(ops: AggregateOperations<A>) {
    /// let version = ops
    ///     .perform(|state| Ok::<_, std::convert::Infallible>(state.version()))
    ///     .await
    ///     .expect("perform");
    /// # let _ = version;
    /// # }
    /// ```
    pub async fn perform<R, E, F>(&self, mutation: F) -> Result<R, PerformError<E>>
    where
        R: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
        F: FnOnce(&mut AggregateState<A>) -> Result<R, E> + Send + 'static,
    {
        self.perform_with_cancel(mutation, &Cancellation::none())
            .await
    }

    /// Like [`perform`](Self::perform), but gives up waiting once `cancel`
    /// fires.
    ///
    /// Cancelling aborts the wait only. A mutation the owner already
    /// accepted may still run.
    pub async fn perform_with_cancel<R, E, F>(
        &self,
        mutation: F,
        cancel: &Cancellation,
    ) -> Result<R, PerformError<E>>
    where
        R: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
        F: FnOnce(&mut AggregateState<A>) -> Result<R, E> + Send + 'static,
    {
        self.dispatch(Box::new(SyncMutation(mutation)), self.commit_after(), cancel)
            .await
    }

    /// Run an asynchronous mutation against the instance's state.
    ///
    /// The returned future borrows the state and runs to completion on the
    /// owner before the next job starts.
    pub async fn perform_async<R, E, F>(&self, mutation: F) -> Result<R, PerformError<E>>
    where
        R: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
        F: for<'s> FnOnce(&'s mut AggregateState<A>) -> BoxFuture<'s, Result<R, E>>
            + Send
            + 'static,
    {
        self.perform_async_with_cancel(mutation, &Cancellation::none())
            .await
    }

    /// Cancellable form of [`perform_async`](Self::perform_async).
    pub async fn perform_async_with_cancel<R, E, F>(
        &self,
        mutation: F,
        cancel: &Cancellation,
    ) -> Result<R, PerformError<E>>
    where
        R: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
        F: for<'s> FnOnce(&'s mut AggregateState<A>) -> BoxFuture<'s, Result<R, E>>
            + Send
            + 'static,
    {
        self.dispatch(Box::new(AsyncMutation(mutation)), self.commit_after(), cancel)
            .await
    }

    /// Commit the events applied since the last commit.
    ///
    /// Returns the instance's version after the commit. A no-op when
    /// nothing is pending.
    ///
    /// # Errors
    ///
    /// [`PerformError::Failed`] with [`DispatchError::Commit`] if the event
    /// log rejects the write. The owner then drops its in-memory state and
    /// rehydrates on the next call.
    pub async fn commit(&self) -> Result<AggregateRootVersion, PerformError<Infallible>> {
        let read = |state: &mut AggregateState<A>| Ok::<_, Infallible>(state.version());
        self.dispatch::<AggregateRootVersion, Infallible>(
            Box::new(SyncMutation(read)),
            true,
            &Cancellation::none(),
        )
        .await
    }

    /// The instance's current version, including uncommitted events.
    pub async fn version(&self) -> Result<AggregateRootVersion, PerformError<Infallible>> {
        self.perform(|state: &mut AggregateState<A>| Ok::<_, Infallible>(state.version()))
            .await
    }

    fn commit_after(&self) -> bool {
        self.shared.config.commit_policy == CommitPolicy::Automatic
    }

    fn failed<E>(&self, source: DispatchError) -> PerformError<E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        PerformError::Failed {
            aggregate_type: A::TYPE_NAME,
            event_source: self.event_source.clone(),
            source,
        }
    }

    async fn dispatch<R, E>(
        &self,
        mutation: Box<dyn Mutation<A, R, E>>,
        commit_after: bool,
        cancel: &Cancellation,
    ) -> Result<R, PerformError<E>>
    where
        R: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let span = tracing::info_span!(
            "perform",
            aggregate_type = A::TYPE_NAME,
            event_source = %self.event_source,
            tenant = %self.tenant
        );
        self.deliver_until_answered(mutation, commit_after, cancel)
            .instrument(span)
            .await
    }

    async fn deliver_until_answered<R, E>(
        &self,
        mutation: Box<dyn Mutation<A, R, E>>,
        commit_after: bool,
        cancel: &Cancellation,
    ) -> Result<R, PerformError<E>>
    where
        R: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let max_relocations = self.shared.config.max_relocations;
        let mut job = PerformJob::new(mutation, commit_after);
        let mut relocations = 0u32;

        loop {
            let (tx, rx) = oneshot::channel();
            job.reply_to(tx);
            let cluster = &self.shared.cluster;
            let round_trip = async {
                cluster
                    .deliver(self.key, &self.event_source, &self.factory, job)
                    .await;
                rx.await
            };

            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(self.failed(DispatchError::Cancelled)),
                outcome = round_trip => outcome,
            };

            match outcome {
                Ok(Outcome::Done(Ok(value))) => return Ok(value),
                Ok(Outcome::Done(Err(err))) => return Err(PerformError::Operation(err)),
                Ok(Outcome::Failed(err)) => return Err(self.failed(err)),
                Ok(Outcome::Relocate(returned)) => {
                    relocations += 1;
                    if relocations > max_relocations {
                        return Err(self.failed(DispatchError::RelocationsExhausted {
                            attempts: relocations,
                        }));
                    }
                    tracing::debug!(relocations, "owner departed, relocating operation");
                    job = returned;
                }
                Err(_) => return Err(self.failed(DispatchError::OwnerGone)),
            }
        }
    }
}
