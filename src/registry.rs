//! Registration of aggregate root types and their event handlers.
//!
//! Every aggregate root type is registered once at composition time with
//! its [`AggregateRootId`]. Handler tables are built lazily on first use
//! and then shared by every state of that type.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use serde::de::DeserializeOwned;

use crate::aggregate::AggregateRoot;
use crate::error::ConfigurationError;
use crate::event::{EventContent, EventTypes, content_type_id};
use crate::ids::{AggregateRootId, EventType};

/// A type-erased event handler for aggregate `A`.
pub type Handler<A> = Box<dyn Fn(&mut A, &dyn EventContent) + Send + Sync>;

/// The event handlers of one aggregate root type, keyed by event content
/// type.
///
/// An aggregate with an empty table is *stateless*: it only tracks a
/// version and never replays individual events.
pub struct HandlerTable<A> {
    handlers: HashMap<TypeId, Handler<A>>,
}

impl<A: AggregateRoot> HandlerTable<A> {
    /// Build the table by asking `A` to register its handlers.
    pub(crate) fn build() -> Self {
        let mut table = Self {
            handlers: HashMap::new(),
        };
        A::handlers(&mut table);
        tracing::debug!(
            aggregate_type = A::TYPE_NAME,
            handlers = table.handlers.len(),
            "handler table built"
        );
        table
    }

    /// Register `handler` for event content of type `E`.
    ///
    /// Registering a second handler for the same `E` replaces the first.
    ///
    /// # Examples
    ///
    /// ```
    /// use aggregate_runtime::{AggregateRoot, BoxError, EventSourceId, HandlerTable, TypeRegistry};
    /// use serde::{Deserialize, Serialize};
    ///
    /// #[derive(Debug, Serialize, Deserialize)]
    /// struct Deposited { amount: u64 }
    ///
    /// struct Account { balance: u64 }
    ///
    /// impl Account {
    ///     fn on_deposited(&mut self, event: &Deposited) {
    ///         self.balance += event.amount;
    ///     }
    /// }
    ///
    /// impl AggregateRoot for Account {
    ///     const TYPE_NAME: &'static str = "account";
    ///
    ///     fn construct(_: EventSourceId, _: &TypeRegistry) -> Result<Self, BoxError> {
    ///         Ok(Self { balance: 0 })
    ///     }
    ///
    ///     fn handlers(table: &mut HandlerTable<Self>) {
    ///         table.on(Self::on_deposited);
    ///     }
    /// }
    /// ```
    pub fn on<E>(&mut self, handler: impl Fn(&mut A, &E) + Send + Sync + 'static) -> &mut Self
    where
        E: EventContent,
    {
        let wrapped: Handler<A> = Box::new(move |aggregate, content| {
            if let Some(event) = content.as_any().downcast_ref::<E>() {
                handler(aggregate, event);
            }
        });
        if self.handlers.insert(TypeId::of::<E>(), wrapped).is_some() {
            tracing::warn!(
                aggregate_type = A::TYPE_NAME,
                event_content = std::any::type_name::<E>(),
                "duplicate handler registration, the later one wins"
            );
        }
        self
    }

    /// Returns the handler for an event content type, if any.
    pub fn handler_for(&self, content_type: TypeId) -> Option<&Handler<A>> {
        self.handlers.get(&content_type)
    }

    /// Returns `true` if a handler exists for `content_type`.
    pub fn handles(&self, content_type: TypeId) -> bool {
        self.handlers.contains_key(&content_type)
    }

    /// Returns `true` if the aggregate has no handlers at all.
    pub fn is_stateless(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns `true` if no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Invoke the handler for `content`, if one exists.
    ///
    /// Returns whether a handler ran.
    pub(crate) fn invoke(&self, aggregate: &mut A, content: &dyn EventContent) -> bool {
        match self.handlers.get(&content_type_id(content)) {
            Some(handler) => {
                handler(aggregate, content);
                true
            }
            None => false,
        }
    }
}

impl<A> fmt::Debug for HandlerTable<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

struct Registration {
    id: AggregateRootId,
    type_name: &'static str,
    handlers: OnceLock<Arc<dyn Any + Send + Sync>>,
}

/// Maps aggregate root types to their identifiers and handler tables, and
/// event content types to their wire event types.
#[derive(Default)]
pub struct TypeRegistry {
    aggregates: HashMap<TypeId, Registration>,
    event_types: EventTypes,
}

// Manual `Debug` because handler tables are type-erased.
impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.aggregates.values().map(|r| r.type_name).collect();
        names.sort_unstable();
        f.debug_struct("TypeRegistry")
            .field("aggregates", &names)
            .field("event_types", &self.event_types)
            .finish()
    }
}

impl TypeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register aggregate root type `A` under `id`.
    ///
    /// Registering `A` again replaces its identifier and drops any
    /// memoized handler table.
    pub fn register<A: AggregateRoot>(&mut self, id: AggregateRootId) -> &mut Self {
        tracing::debug!(aggregate_type = A::TYPE_NAME, aggregate_root = %id, "registering aggregate root");
        self.aggregates.insert(
            TypeId::of::<A>(),
            Registration {
                id,
                type_name: A::TYPE_NAME,
                handlers: OnceLock::new(),
            },
        );
        self
    }

    /// Associate event content type `E` with a wire event type.
    pub fn associate_event<E>(&mut self, event_type: EventType) -> &mut Self
    where
        E: EventContent + DeserializeOwned,
    {
        self.event_types.associate::<E>(event_type);
        self
    }

    /// Returns `true` if `A` was registered.
    pub fn is_registered<A: AggregateRoot>(&self) -> bool {
        self.aggregates.contains_key(&TypeId::of::<A>())
    }

    /// Returns the identifier `A` was registered with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::Unregistered`] if `A` was never registered.
    pub fn identifier_for<A: AggregateRoot>(&self) -> Result<AggregateRootId, ConfigurationError> {
        self.registration::<A>().map(|r| r.id)
    }

    /// Returns the handler table of `A`, building it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::Unregistered`] if `A` was never registered.
    pub fn handlers_for<A: AggregateRoot>(&self) -> Result<Arc<HandlerTable<A>>, ConfigurationError> {
        let registration = self.registration::<A>()?;
        let erased = registration
            .handlers
            .get_or_init(|| Arc::new(HandlerTable::<A>::build()) as Arc<dyn Any + Send + Sync>);
        Arc::clone(erased)
            .downcast::<HandlerTable<A>>()
            .map_err(|_| ConfigurationError::Unregistered {
                type_name: A::TYPE_NAME,
            })
    }

    /// Returns `true` if `A` has no handlers.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::Unregistered`] if `A` was never registered.
    pub fn is_stateless<A: AggregateRoot>(&self) -> Result<bool, ConfigurationError> {
        self.handlers_for::<A>().map(|table| table.is_stateless())
    }

    /// Returns the event type mapping.
    pub fn event_types(&self) -> &EventTypes {
        &self.event_types
    }

    fn registration<A: AggregateRoot>(&self) -> Result<&Registration, ConfigurationError> {
        self.aggregates
            .get(&TypeId::of::<A>())
            .ok_or(ConfigurationError::Unregistered {
                type_name: A::TYPE_NAME,
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    use super::*;
    use crate::aggregate::BoxError;
    use crate::aggregate::test_fixtures::{
        CART_ID, Cart, ItemAdded, ItemRemoved, LEDGER_ID, Ledger, fixture_registry,
    };
    use crate::ids::EventSourceId;

    #[test]
    fn identifier_for_registered_type() {
        let registry = fixture_registry();
        assert_eq!(registry.identifier_for::<Cart>().unwrap(), CART_ID);
        assert_eq!(registry.identifier_for::<Ledger>().unwrap(), LEDGER_ID);
    }

    #[test]
    fn identifier_for_unregistered_type_is_configuration_error() {
        let registry = TypeRegistry::new();
        let err = registry.identifier_for::<Cart>().unwrap_err();
        assert_eq!(err, ConfigurationError::Unregistered { type_name: "cart" });
        assert!(!registry.is_registered::<Cart>());
    }

    #[test]
    fn handler_for_known_and_unknown_content() {
        let registry = fixture_registry();
        let table = registry.handlers_for::<Cart>().unwrap();
        assert!(table.handler_for(TypeId::of::<ItemAdded>()).is_some());
        assert!(table.handler_for(TypeId::of::<ItemRemoved>()).is_some());
        assert!(table.handler_for(TypeId::of::<String>()).is_none());
    }

    #[test]
    fn stateless_means_no_handlers() {
        let registry = fixture_registry();
        assert!(registry.is_stateless::<Ledger>().unwrap());
        assert!(!registry.is_stateless::<Cart>().unwrap());
    }

    #[test]
    fn invoke_runs_matching_handler_only() {
        let registry = fixture_registry();
        let table = registry.handlers_for::<Cart>().unwrap();
        let mut cart = Cart::default();

        assert!(table.invoke(&mut cart, &ItemAdded { sku: "apple".into() }));
        assert!(!table.invoke(&mut cart, &42u32));
        assert_eq!(cart.items, vec!["apple".to_string()]);
    }

    static BUILDS: AtomicUsize = AtomicUsize::new(0);

    #[derive(Debug, Serialize, Deserialize)]
    struct Tick;

    struct Memoized;

    impl AggregateRoot for Memoized {
        const TYPE_NAME: &'static str = "memoized";

        fn construct(_: EventSourceId, _: &TypeRegistry) -> Result<Self, BoxError> {
            Ok(Self)
        }

        fn handlers(table: &mut HandlerTable<Self>) {
            BUILDS.fetch_add(1, Ordering::SeqCst);
            table.on(|_: &mut Memoized, _: &Tick| {});
        }
    }

    #[test]
    fn handler_table_is_built_once_per_type() {
        let mut registry = TypeRegistry::new();
        registry.register::<Memoized>(AggregateRootId::new(Uuid::from_u128(0x3e3)));

        let first = registry.handlers_for::<Memoized>().unwrap();
        let second = registry.handlers_for::<Memoized>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(BUILDS.load(Ordering::SeqCst), 1);
    }

    #[derive(Debug, Default)]
    struct Doubler {
        seen: Vec<&'static str>,
    }

    impl AggregateRoot for Doubler {
        const TYPE_NAME: &'static str = "doubler";

        fn construct(_: EventSourceId, _: &TypeRegistry) -> Result<Self, BoxError> {
            Ok(Self::default())
        }

        fn handlers(table: &mut HandlerTable<Self>) {
            table
                .on(|d: &mut Doubler, _: &Tick| d.seen.push("first"))
                .on(|d: &mut Doubler, _: &Tick| d.seen.push("second"));
        }
    }

    #[test]
    fn duplicate_handler_later_registration_wins() {
        let mut registry = TypeRegistry::new();
        registry.register::<Doubler>(AggregateRootId::new(Uuid::from_u128(0xd0)));
        let table = registry.handlers_for::<Doubler>().unwrap();
        assert_eq!(table.len(), 1);

        let mut doubler = Doubler::default();
        table.invoke(&mut doubler, &Tick);
        assert_eq!(doubler.seen, vec!["second"]);
    }

    #[test]
    fn reregistering_replaces_identifier() {
        let mut registry = fixture_registry();
        let newer = CART_ID.with_generation(2);
        registry.register::<Cart>(newer);
        assert_eq!(registry.identifier_for::<Cart>().unwrap(), newer);
    }
}
