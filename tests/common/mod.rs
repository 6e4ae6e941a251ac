//! Domain types shared by the integration tests.

#![allow(dead_code)]

use std::time::Duration;

use aggregate_runtime::{
    AggregateRoot, AggregateRootId, AggregateRuntimeBuilder, AggregateState, BoxError,
    EventSourceId, EventType, HandlerTable, StateError, TypeRegistry,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const TALLY_ID: AggregateRootId = AggregateRootId::new(Uuid::from_u128(0x7a11));
pub const BASKET_ID: AggregateRootId = AggregateRootId::new(Uuid::from_u128(0xba5c));
pub const AUDIT_ID: AggregateRootId = AggregateRootId::new(Uuid::from_u128(0xa0d1));

pub const BUMPED: EventType = EventType::new(Uuid::from_u128(0x1001));
pub const PUT_IN: EventType = EventType::new(Uuid::from_u128(0x1002));
pub const NOTED: EventType = EventType::new(Uuid::from_u128(0x1003));

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bumped {
    pub by: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutIn {
    pub item: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Noted {
    pub text: String,
}

/// Counts [`Bumped`] events.
#[derive(Debug, Default)]
pub struct Tally {
    pub count: u64,
}

impl AggregateRoot for Tally {
    const TYPE_NAME: &'static str = "tally";

    fn construct(_: EventSourceId, _: &TypeRegistry) -> Result<Self, BoxError> {
        Ok(Self::default())
    }

    fn handlers(table: &mut HandlerTable<Self>) {
        table.on(|tally: &mut Tally, event: &Bumped| tally.count += event.by);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BasketError {
    #[error("basket is full")]
    Full,
    #[error(transparent)]
    State(#[from] StateError),
}

/// Holds items in the order they were put in.
#[derive(Debug, Default)]
pub struct Basket {
    pub items: Vec<String>,
}

impl Basket {
    pub const CAPACITY: usize = 3;

    fn on_put_in(&mut self, event: &PutIn) {
        self.items.push(event.item.clone());
    }
}

/// Put `item` in the basket unless it is full.
pub fn put_in(
    item: &str,
) -> impl FnOnce(&mut AggregateState<Basket>) -> Result<usize, BasketError> + Send + 'static {
    let item = item.to_owned();
    move |state| {
        if state.aggregate().items.len() >= Basket::CAPACITY {
            return Err(BasketError::Full);
        }
        state.apply_public(PutIn { item })?;
        Ok(state.aggregate().items.len())
    }
}

impl AggregateRoot for Basket {
    const TYPE_NAME: &'static str = "basket";

    fn construct(_: EventSourceId, _: &TypeRegistry) -> Result<Self, BoxError> {
        Ok(Self::default())
    }

    fn handlers(table: &mut HandlerTable<Self>) {
        table.on(Self::on_put_in);
    }
}

/// Stateless: it only tracks a version.
#[derive(Debug, Default)]
pub struct Audit;

impl AggregateRoot for Audit {
    const TYPE_NAME: &'static str = "audit";

    fn construct(_: EventSourceId, _: &TypeRegistry) -> Result<Self, BoxError> {
        Ok(Self)
    }
}

/// A builder with every test type registered.
pub fn builder() -> AggregateRuntimeBuilder {
    aggregate_runtime::AggregateRuntime::builder()
        .register::<Tally>(TALLY_ID)
        .register::<Basket>(BASKET_ID)
        .register::<Audit>(AUDIT_ID)
        .associate_event::<Bumped>(BUMPED)
        .associate_event::<PutIn>(PUT_IN)
        .associate_event::<Noted>(NOTED)
        .idle_timeout(Duration::from_secs(60))
}
