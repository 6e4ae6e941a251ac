//! The aggregate root trait and its construction contract.

use crate::error::ConfigurationError;
use crate::ids::EventSourceId;
use crate::registry::{HandlerTable, TypeRegistry};

/// Boxed error returned by aggregate constructors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A parameter an aggregate root type declares for its constructor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstructorParam {
    /// The identifier of the instance being built.
    EventSourceId,
    /// The [`TypeRegistry`] the instance is built against.
    TypeRegistry,
    /// Any other dependency, named for diagnostics.
    Other(&'static str),
}

/// The only constructor shape the factory can satisfy.
pub const STANDARD_CONSTRUCTOR: &[ConstructorParam] =
    &[ConstructorParam::EventSourceId, ConstructorParam::TypeRegistry];

/// A consistency boundary whose state is rebuilt from its own events.
///
/// # Contract
///
/// - [`construct`](AggregateRoot::construct) builds a blank instance. It
///   must not read events; the runtime replays history afterwards.
/// - [`handlers`](AggregateRoot::handlers) registers one handler per event
///   content type. Handlers mutate fields only and must not fail. An
///   aggregate that registers nothing is stateless.
pub trait AggregateRoot: Send + Sized + 'static {
    /// Diagnostic name of the type (e.g. `"cart"`).
    const TYPE_NAME: &'static str;

    /// Parameters the constructor takes. Anything other than
    /// [`STANDARD_CONSTRUCTOR`] is rejected when the type is first used.
    const CONSTRUCTOR: &'static [ConstructorParam] = STANDARD_CONSTRUCTOR;

    /// Build a blank instance for `event_source`.
    ///
    /// # Errors
    ///
    /// Any error is reported as
    /// [`ActivationError::InstanceCreationFailed`](crate::ActivationError::InstanceCreationFailed).
    fn construct(event_source: EventSourceId, registry: &TypeRegistry) -> Result<Self, BoxError>;

    /// Register event handlers. Defaults to none.
    fn handlers(table: &mut HandlerTable<Self>) {
        let _ = table;
    }
}

/// Check that `A` declares the standard constructor.
pub(crate) fn validate_constructor<A: AggregateRoot>() -> Result<(), ConfigurationError> {
    if A::CONSTRUCTOR == STANDARD_CONSTRUCTOR {
        Ok(())
    } else {
        Err(ConfigurationError::InvalidConstructorSignature {
            type_name: A::TYPE_NAME,
            found: A::CONSTRUCTOR.to_vec(),
        })
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    use super::{AggregateRoot, BoxError, ConstructorParam};
    use crate::ids::{AggregateRootId, EventSourceId, EventType};
    use crate::registry::{HandlerTable, TypeRegistry};

    pub(crate) const CART_ID: AggregateRootId = AggregateRootId::new(Uuid::from_u128(0xca27));
    pub(crate) const COUNTER_ID: AggregateRootId = AggregateRootId::new(Uuid::from_u128(0xc0));
    pub(crate) const LEDGER_ID: AggregateRootId = AggregateRootId::new(Uuid::from_u128(0x1ed9));
    pub(crate) const MISSHAPEN_ID: AggregateRootId = AggregateRootId::new(Uuid::from_u128(0xbad));
    pub(crate) const BROKEN_ID: AggregateRootId = AggregateRootId::new(Uuid::from_u128(0xb0e));
    pub(crate) const PANICKY_ID: AggregateRootId = AggregateRootId::new(Uuid::from_u128(0x9a1c));

    pub(crate) const ITEM_ADDED: EventType = EventType::new(Uuid::from_u128(0xe1));
    pub(crate) const ITEM_REMOVED: EventType = EventType::new(Uuid::from_u128(0xe2));
    pub(crate) const INCREMENTED: EventType = EventType::new(Uuid::from_u128(0xe3));
    pub(crate) const ENTRY_POSTED: EventType = EventType::new(Uuid::from_u128(0xe4));

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub(crate) struct ItemAdded {
        pub sku: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub(crate) struct ItemRemoved {
        pub sku: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub(crate) struct Incremented {
        pub by: u64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub(crate) struct EntryPosted {
        pub amount: i64,
    }

    /// Errors a cart mutation can return.
    #[derive(Debug, Clone, PartialEq, thiserror::Error)]
    pub(crate) enum CartError {
        #[error("item {0} is not in the cart")]
        NotInCart(String),
    }

    /// A shopping cart that tracks its items in order.
    #[derive(Debug, Clone, Default, PartialEq)]
    pub(crate) struct Cart {
        pub items: Vec<String>,
    }

    impl Cart {
        pub(crate) fn on_item_added(&mut self, event: &ItemAdded) {
            self.items.push(event.sku.clone());
        }

        pub(crate) fn on_item_removed(&mut self, event: &ItemRemoved) {
            self.items.retain(|sku| sku != &event.sku);
        }
    }

    impl AggregateRoot for Cart {
        const TYPE_NAME: &'static str = "cart";

        fn construct(_: EventSourceId, _: &TypeRegistry) -> Result<Self, BoxError> {
            Ok(Self::default())
        }

        fn handlers(table: &mut HandlerTable<Self>) {
            table.on(Self::on_item_added).on(Self::on_item_removed);
        }
    }

    /// A counter that also records every handled increment in order.
    #[derive(Debug, Clone, Default, PartialEq)]
    pub(crate) struct Counter {
        pub value: u64,
        pub seen: Vec<u64>,
    }

    impl AggregateRoot for Counter {
        const TYPE_NAME: &'static str = "counter";

        fn construct(_: EventSourceId, _: &TypeRegistry) -> Result<Self, BoxError> {
            Ok(Self::default())
        }

        fn handlers(table: &mut HandlerTable<Self>) {
            table.on(|counter: &mut Counter, event: &Incremented| {
                counter.value += event.by;
                counter.seen.push(event.by);
            });
        }
    }

    /// A stateless aggregate: it registers no handlers.
    #[derive(Debug, Default)]
    pub(crate) struct Ledger;

    impl AggregateRoot for Ledger {
        const TYPE_NAME: &'static str = "ledger";

        fn construct(_: EventSourceId, _: &TypeRegistry) -> Result<Self, BoxError> {
            Ok(Self)
        }
    }

    /// Declares a constructor the factory cannot satisfy.
    #[derive(Debug)]
    pub(crate) struct Misshapen;

    impl AggregateRoot for Misshapen {
        const TYPE_NAME: &'static str = "misshapen";
        const CONSTRUCTOR: &'static [ConstructorParam] = &[
            ConstructorParam::EventSourceId,
            ConstructorParam::Other("clock"),
        ];

        fn construct(_: EventSourceId, _: &TypeRegistry) -> Result<Self, BoxError> {
            Ok(Self)
        }
    }

    /// Always fails to construct.
    #[derive(Debug)]
    pub(crate) struct Broken;

    impl AggregateRoot for Broken {
        const TYPE_NAME: &'static str = "broken";

        fn construct(event_source: EventSourceId, _: &TypeRegistry) -> Result<Self, BoxError> {
            Err(format!("refusing to build {event_source}").into())
        }
    }

    /// Panics in its constructor.
    #[derive(Debug)]
    pub(crate) struct Panicky;

    impl AggregateRoot for Panicky {
        const TYPE_NAME: &'static str = "panicky";

        fn construct(_: EventSourceId, _: &TypeRegistry) -> Result<Self, BoxError> {
            panic!("constructor exploded")
        }
    }

    /// A registry with every fixture registered and every event associated.
    pub(crate) fn fixture_registry() -> TypeRegistry {
        let mut registry = TypeRegistry::new();
        registry
            .register::<Cart>(CART_ID)
            .register::<Counter>(COUNTER_ID)
            .register::<Ledger>(LEDGER_ID)
            .register::<Misshapen>(MISSHAPEN_ID)
            .register::<Broken>(BROKEN_ID)
            .register::<Panicky>(PANICKY_ID)
            .associate_event::<ItemAdded>(ITEM_ADDED)
            .associate_event::<ItemRemoved>(ITEM_REMOVED)
            .associate_event::<Incremented>(INCREMENTED)
            .associate_event::<EntryPosted>(ENTRY_POSTED);
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::test_fixtures::{Broken, Cart, Misshapen, fixture_registry};
    use super::*;

    #[test]
    fn standard_constructor_is_accepted() {
        assert!(validate_constructor::<Cart>().is_ok());
    }

    #[test]
    fn other_constructor_shapes_are_rejected() {
        let err = validate_constructor::<Misshapen>().unwrap_err();
        match err {
            ConfigurationError::InvalidConstructorSignature { type_name, found } => {
                assert_eq!(type_name, "misshapen");
                assert_eq!(found[1], ConstructorParam::Other("clock"));
            }
            other => panic!("expected InvalidConstructorSignature, got: {other}"),
        }
    }

    #[test]
    fn construct_error_carries_message() {
        let registry = fixture_registry();
        let err = Broken::construct(EventSourceId::new("b-1"), &registry).unwrap_err();
        assert_eq!(err.to_string(), "refusing to build b-1");
    }
}
