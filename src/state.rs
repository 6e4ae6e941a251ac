//! Per-instance state machine: applies new events, replays committed
//! history, and keeps the version.
//!
//! ```text
//! Fresh ──rehydrate──▶ Rehydrating ──▶ Ready ⇄ Mutated
//! ```

use std::sync::Arc;

use futures::{Stream, StreamExt};

use crate::aggregate::AggregateRoot;
use crate::cancel::Cancellation;
use crate::error::{ConfigurationError, EventLogError, StateError};
use crate::event::{AppliedEvent, CommittedEventBatch, EventContent, content_type_id, is_nil};
use crate::ids::{AggregateRootId, AggregateRootVersion, EventSourceId, EventType};
use crate::registry::{HandlerTable, TypeRegistry};

/// Lifecycle stage of an [`AggregateState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateStatus {
    /// Built but not rehydrated.
    Fresh,
    /// Replaying committed history.
    Rehydrating,
    /// Rehydrated, no pending applied events.
    Ready,
    /// Holds applied events that have not been committed.
    Mutated,
}

/// One aggregate instance together with its version and pending events.
pub struct AggregateState<A: AggregateRoot> {
    aggregate: A,
    aggregate_root: AggregateRootId,
    event_source: EventSourceId,
    version: AggregateRootVersion,
    applied: Vec<AppliedEvent>,
    handlers: Arc<HandlerTable<A>>,
    registry: Arc<TypeRegistry>,
    status: AggregateStatus,
}

impl<A: AggregateRoot + std::fmt::Debug> std::fmt::Debug for AggregateState<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateState")
            .field("aggregate", &self.aggregate)
            .field("aggregate_root", &self.aggregate_root)
            .field("event_source", &self.event_source)
            .field("version", &self.version)
            .field("applied", &self.applied.len())
            .field("status", &self.status)
            .finish()
    }
}

impl<A: AggregateRoot> AggregateState<A> {
    /// Wrap a freshly constructed aggregate at version `INITIAL`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::Unregistered`] if `A` is not in `registry`.
    pub fn new(
        aggregate: A,
        event_source: EventSourceId,
        registry: Arc<TypeRegistry>,
    ) -> Result<Self, ConfigurationError> {
        let aggregate_root = registry.identifier_for::<A>()?;
        let handlers = registry.handlers_for::<A>()?;
        Ok(Self {
            aggregate,
            aggregate_root,
            event_source,
            version: AggregateRootVersion::INITIAL,
            applied: Vec::new(),
            handlers,
            registry,
            status: AggregateStatus::Fresh,
        })
    }

    /// Apply new event content.
    ///
    /// The wire type is looked up in the registry's
    /// [`EventTypes`](crate::EventTypes).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::InvalidArgument`] if `content` is nil; the
    /// version is left unchanged.
    pub fn apply<E: EventContent>(&mut self, content: E, is_public: bool) -> Result<(), StateError> {
        self.apply_typed(Arc::new(content), None, is_public)
    }

    /// Apply event content visible outside the aggregate.
    pub fn apply_public<E: EventContent>(&mut self, content: E) -> Result<(), StateError> {
        self.apply(content, true)
    }

    /// Apply event content private to the aggregate.
    pub fn apply_private<E: EventContent>(&mut self, content: E) -> Result<(), StateError> {
        self.apply(content, false)
    }

    /// Apply already type-erased content, optionally with an explicit wire
    /// type that overrides the registry's mapping.
    ///
    /// Appends an [`AppliedEvent`], advances the version by one and then
    /// invokes the handler for the content type, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::InvalidArgument`] if `content` is nil.
    pub fn apply_typed(
        &mut self,
        content: Arc<dyn EventContent>,
        event_type: Option<EventType>,
        is_public: bool,
    ) -> Result<(), StateError> {
        if is_nil(content.as_ref()) {
            return Err(StateError::InvalidArgument {
                reason: "event content must not be nil",
            });
        }
        let event_type = event_type.or_else(|| {
            self.registry
                .event_types()
                .event_type_of(content_type_id(content.as_ref()))
        });
        self.applied.push(AppliedEvent {
            content: Arc::clone(&content),
            event_type,
            is_public,
        });
        self.version = self.version.next();
        self.handlers.invoke(&mut self.aggregate, content.as_ref());
        self.status = AggregateStatus::Mutated;
        Ok(())
    }

    /// Replay committed history.
    ///
    /// Batches are consumed eagerly, oldest first. `cancel` is observed
    /// between batches only.
    ///
    /// # Errors
    ///
    /// * [`StateError::EmptyHistory`] if the stream ends before yielding a
    ///   batch; the state is left untouched.
    /// * [`StateError::WrongEventSource`] / [`StateError::WrongAggregateRoot`]
    ///   if a batch belongs to another instance; no event of that batch is
    ///   replayed.
    /// * [`StateError::UndecodableEvent`] if a handled event fails to decode.
    /// * [`StateError::Cancelled`] if `cancel` fires between batches.
    /// * [`StateError::EventLog`] if the stream yields an error.
    pub async fn rehydrate<S>(&mut self, batches: S, cancel: &Cancellation) -> Result<(), StateError>
    where
        S: Stream<Item = Result<CommittedEventBatch, EventLogError>> + Send,
    {
        let previous = self.status;
        self.status = AggregateStatus::Rehydrating;

        let consumed = match self.replay_batches(batches, cancel).await {
            Ok(0) => {
                self.status = previous;
                return Err(StateError::EmptyHistory {
                    event_source: self.event_source.clone(),
                });
            }
            Ok(consumed) => consumed,
            Err(err) => {
                self.status = previous;
                return Err(err);
            }
        };

        tracing::trace!(
            aggregate_type = A::TYPE_NAME,
            event_source = %self.event_source,
            batches = consumed,
            version = %self.version,
            "rehydrated"
        );
        self.status = if self.applied.is_empty() {
            AggregateStatus::Ready
        } else {
            AggregateStatus::Mutated
        };
        Ok(())
    }

    /// Consume `batches`, returning how many were replayed.
    async fn replay_batches<S>(
        &mut self,
        batches: S,
        cancel: &Cancellation,
    ) -> Result<usize, StateError>
    where
        S: Stream<Item = Result<CommittedEventBatch, EventLogError>> + Send,
    {
        let mut batches = std::pin::pin!(batches);
        let stateless = self.handlers.is_stateless();
        let mut consumed = 0usize;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StateError::Cancelled),
                next = batches.next() => next,
            };
            let Some(batch) = next else { break };
            let batch = batch?;
            self.check_identity(&batch)?;
            consumed += 1;

            if stateless {
                self.version = batch.version;
                continue;
            }
            self.replay(batch)?;
        }
        Ok(consumed)
    }

    fn check_identity(&self, batch: &CommittedEventBatch) -> Result<(), StateError> {
        if batch.event_source != self.event_source {
            return Err(StateError::WrongEventSource {
                expected: self.event_source.clone(),
                actual: batch.event_source.clone(),
            });
        }
        if batch.aggregate_root != self.aggregate_root {
            return Err(StateError::WrongAggregateRoot {
                expected: self.aggregate_root,
                actual: batch.aggregate_root,
            });
        }
        Ok(())
    }

    fn replay(&mut self, batch: CommittedEventBatch) -> Result<(), StateError> {
        let event_types = self.registry.event_types();
        for event in batch.events {
            self.version = event.aggregate_root_version.next();

            // Unknown or unhandled event types only advance the version.
            let Some(content_type) = event_types.content_type_of(&event.event_type) else {
                continue;
            };
            if !self.handlers.handles(content_type) {
                continue;
            }
            let Some(decoded) = event_types.decode(&event.event_type, event.content) else {
                continue;
            };
            let content = decoded.map_err(|source| StateError::UndecodableEvent {
                event_type: event.event_type,
                version: event.aggregate_root_version,
                source,
            })?;
            self.handlers.invoke(&mut self.aggregate, content.as_ref());
        }
        Ok(())
    }

    /// The aggregate instance.
    pub fn aggregate(&self) -> &A {
        &self.aggregate
    }

    /// Mutable access to the aggregate instance.
    ///
    /// Changes made here bypass the event history and are lost when the
    /// state is rebuilt.
    pub fn aggregate_mut(&mut self) -> &mut A {
        &mut self.aggregate
    }

    /// Current version.
    pub fn version(&self) -> AggregateRootVersion {
        self.version
    }

    /// Identifier of the instance.
    pub fn event_source(&self) -> &EventSourceId {
        &self.event_source
    }

    /// Identifier of the aggregate root type.
    pub fn aggregate_root(&self) -> AggregateRootId {
        self.aggregate_root
    }

    /// Returns `true` if the aggregate has no handlers.
    pub fn is_stateless(&self) -> bool {
        self.handlers.is_stateless()
    }

    /// Applied events not committed yet, in apply order.
    pub fn applied_events(&self) -> &[AppliedEvent] {
        &self.applied
    }

    /// Current lifecycle stage.
    pub fn status(&self) -> AggregateStatus {
        self.status
    }

    /// Hand the pending events to the commit step.
    pub(crate) fn take_applied_events(&mut self) -> Vec<AppliedEvent> {
        if self.status == AggregateStatus::Mutated {
            self.status = AggregateStatus::Ready;
        }
        std::mem::take(&mut self.applied)
    }
}
