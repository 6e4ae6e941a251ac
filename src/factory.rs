//! Building aggregate instances and handing out operations on them.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::aggregate::{AggregateRoot, validate_constructor};
use crate::cancel::Cancellation;
use crate::dispatcher::AggregateOperations;
use crate::error::{ActivationError, DispatchError, FactoryError, PerformError};
use crate::event_log::EventLog;
use crate::ids::{EventSourceId, TenantId};
use crate::registry::TypeRegistry;
use crate::runtime::Shared;
use crate::state::AggregateState;

/// Builds rehydrated [`AggregateState`]s for one aggregate root type
/// against one event log.
pub(crate) struct Factory<A> {
    registry: Arc<TypeRegistry>,
    log: Arc<dyn EventLog>,
    _aggregate: PhantomData<fn() -> A>,
}

// Manual `Clone`: `A` itself need not be `Clone`.
impl<A> Clone for Factory<A> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            log: Arc::clone(&self.log),
            _aggregate: PhantomData,
        }
    }
}

impl<A: AggregateRoot> Factory<A> {
    pub(crate) fn new(registry: Arc<TypeRegistry>, log: Arc<dyn EventLog>) -> Self {
        Self {
            registry,
            log,
            _aggregate: PhantomData,
        }
    }

    /// The event log this factory reads from.
    pub(crate) fn log(&self) -> &Arc<dyn EventLog> {
        &self.log
    }

    /// Construct a blank `A` for `event_source` and replay its history.
    ///
    /// # Errors
    ///
    /// * [`ActivationError::Configuration`] if `A` is unregistered or
    ///   declares a non-standard constructor.
    /// * [`ActivationError::InstanceCreationFailed`] if
    ///   [`AggregateRoot::construct`] fails.
    /// * [`ActivationError::EventLog`] if history cannot be fetched.
    /// * [`ActivationError::Rehydration`] if replay fails.
    pub(crate) async fn build(
        &self,
        event_source: &EventSourceId,
        cancel: &Cancellation,
    ) -> Result<AggregateState<A>, ActivationError> {
        validate_constructor::<A>()?;
        let aggregate_root = self.registry.identifier_for::<A>()?;

        let aggregate = A::construct(event_source.clone(), &self.registry).map_err(|source| {
            ActivationError::InstanceCreationFailed {
                type_name: A::TYPE_NAME,
                source,
            }
        })?;
        let mut state =
            AggregateState::new(aggregate, event_source.clone(), Arc::clone(&self.registry))?;

        let history = self.log.fetch_history(aggregate_root, event_source).await?;
        state.rehydrate(history, cancel).await?;
        Ok(state)
    }
}

/// Entry point for one aggregate root type within one tenant.
///
/// Obtained from [`AggregateRuntime::aggregate_of`](crate::AggregateRuntime::aggregate_of).
/// `Clone` is cheap.
pub struct AggregateOf<A: AggregateRoot> {
    tenant: TenantId,
    shared: Arc<Shared>,
    factory: Factory<A>,
}

impl<A: AggregateRoot> Clone for AggregateOf<A> {
    fn clone(&self) -> Self {
        Self {
            tenant: self.tenant,
            shared: Arc::clone(&self.shared),
            factory: self.factory.clone(),
        }
    }
}

impl<A: AggregateRoot> std::fmt::Debug for AggregateOf<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateOf")
            .field("aggregate_type", &A::TYPE_NAME)
            .field("tenant", &self.tenant)
            .finish()
    }
}

impl<A: AggregateRoot> AggregateOf<A> {
    pub(crate) fn new(tenant: TenantId, shared: Arc<Shared>) -> Self {
        let factory = Factory::new(Arc::clone(&shared.registry), shared.log_for(tenant));
        Self {
            tenant,
            shared,
            factory,
        }
    }

    /// The tenant this entry point is bound to.
    pub fn tenant(&self) -> TenantId {
        self.tenant
    }

    /// Get operations for a brand-new instance with a random identifier.
    ///
    /// # Errors
    ///
    /// Same as [`get`](AggregateOf::get).
    pub async fn create(&self) -> Result<AggregateOperations<A>, FactoryError> {
        self.get(EventSourceId::new_random()).await
    }

    /// Get operations for the instance identified by `event_source`.
    ///
    /// The instance is activated before this returns: its owner constructs
    /// it and replays its committed history.
    ///
    /// # Errors
    ///
    /// Returns [`FactoryError::CouldNotGetAggregateRoot`] if the type is
    /// misconfigured, construction fails, or history cannot be replayed.
    pub async fn get(
        &self,
        event_source: impl Into<EventSourceId>,
    ) -> Result<AggregateOperations<A>, FactoryError> {
        let event_source = event_source.into();
        let could_not_get = |source: DispatchError| FactoryError::CouldNotGetAggregateRoot {
            aggregate_type: A::TYPE_NAME,
            event_source: event_source.clone(),
            source,
        };

        // Configuration problems are reported without touching the cluster.
        let aggregate_root = validate_constructor::<A>()
            .and_then(|()| self.shared.registry.identifier_for::<A>())
            .map_err(|err| could_not_get(ActivationError::Configuration(err).into()))?;

        let operations = AggregateOperations::new(
            self.tenant,
            aggregate_root,
            event_source.clone(),
            Arc::clone(&self.shared),
            self.factory.clone(),
        );

        match operations.version().await {
            Ok(version) => {
                tracing::debug!(
                    aggregate_type = A::TYPE_NAME,
                    event_source = %event_source,
                    version = %version,
                    "aggregate root ready"
                );
                Ok(operations)
            }
            Err(PerformError::Failed { source, .. }) => Err(could_not_get(source)),
            Err(PerformError::Operation(never)) => match never {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{
        Broken, CART_ID, Cart, ITEM_ADDED, ItemAdded, Misshapen, fixture_registry,
    };
    use crate::error::{ConfigurationError, StateError};
    use crate::event::{CommittedEvent, CommittedEventBatch, UncommittedEvent};
    use crate::event_log::InMemoryEventLog;
    use crate::event_log::test_fixtures::ScriptedEventLog;
    use crate::ids::AggregateRootVersion;

    fn factory<A: AggregateRoot>(log: Arc<dyn EventLog>) -> Factory<A> {
        Factory::new(Arc::new(fixture_registry()), log)
    }

    #[tokio::test]
    async fn fresh_instance_builds_at_initial() {
        let state = factory::<Cart>(Arc::new(InMemoryEventLog::new()))
            .build(&EventSourceId::new("cart-1"), &Cancellation::none())
            .await
            .expect("build");
        assert_eq!(state.version(), AggregateRootVersion::INITIAL);
        assert!(state.aggregate().items.is_empty());
    }

    #[tokio::test]
    async fn build_replays_committed_history() {
        let log = Arc::new(InMemoryEventLog::new().with_max_batch_size(2));
        let id = EventSourceId::new("cart-1");
        let events = ["a", "b", "c"]
            .into_iter()
            .map(|sku| UncommittedEvent {
                content: serde_json::json!({ "sku": sku }),
                event_type: ITEM_ADDED,
                is_public: true,
            })
            .collect();
        log.commit(CART_ID, &id, AggregateRootVersion::INITIAL, events)
            .await
            .expect("commit");

        let state = factory::<Cart>(log)
            .build(&id, &Cancellation::none())
            .await
            .expect("build");
        assert_eq!(state.version(), AggregateRootVersion::new(3));
        assert_eq!(state.aggregate().items, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn misshapen_constructor_is_rejected() {
        let err = factory::<Misshapen>(Arc::new(InMemoryEventLog::new()))
            .build(&EventSourceId::new("m-1"), &Cancellation::none())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ActivationError::Configuration(ConfigurationError::InvalidConstructorSignature { .. })
        ));
    }

    #[tokio::test]
    async fn constructor_failure_is_instance_creation_failed() {
        let err = factory::<Broken>(Arc::new(InMemoryEventLog::new()))
            .build(&EventSourceId::new("b-1"), &Cancellation::none())
            .await
            .unwrap_err();
        match err {
            ActivationError::InstanceCreationFailed { type_name, source } => {
                assert_eq!(type_name, "broken");
                assert!(source.to_string().contains("b-1"));
            }
            other => panic!("expected InstanceCreationFailed, got: {other}"),
        }
    }

    #[tokio::test]
    async fn unregistered_type_is_a_configuration_error() {
        let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::new());
        let factory = Factory::<Cart>::new(Arc::new(TypeRegistry::new()), log);
        let err = factory
            .build(&EventSourceId::new("cart-1"), &Cancellation::none())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ActivationError::Configuration(ConfigurationError::Unregistered { .. })
        ));
    }

    #[tokio::test]
    async fn empty_fetch_is_a_rehydration_error() {
        let log = Arc::new(ScriptedEventLog::new(Vec::new()));
        let err = factory::<Cart>(log)
            .build(&EventSourceId::new("cart-1"), &Cancellation::none())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ActivationError::Rehydration(StateError::EmptyHistory { .. })
        ));
    }

    #[tokio::test]
    async fn foreign_batch_is_a_rehydration_error() {
        let foreign = CommittedEventBatch {
            aggregate_root: CART_ID,
            event_source: EventSourceId::new("cart-2"),
            version: AggregateRootVersion::new(1),
            events: vec![CommittedEvent {
                content: serde_json::to_value(ItemAdded { sku: "a".into() }).expect("json"),
                event_type: ITEM_ADDED,
                aggregate_root_version: AggregateRootVersion::new(1),
                is_public: true,
            }],
        };
        let log = Arc::new(ScriptedEventLog::new(vec![foreign]));
        let err = factory::<Cart>(log)
            .build(&EventSourceId::new("cart-1"), &Cancellation::none())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ActivationError::Rehydration(StateError::WrongEventSource { .. })
        ));
    }
}
