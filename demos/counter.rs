//! Self-contained example: two counters on a three-node in-process cluster,
//! persisted to JSON-lines files, surviving the loss of a node.
//!
//! Run with: `cargo run --example counter`
//!
//! Set `RUST_LOG=aggregate_runtime=debug` to watch owners being placed,
//! deactivated and relocated.

use std::convert::Infallible;

use aggregate_runtime::{
    AggregateRoot, AggregateRootId, AggregateRuntime, AggregateState, BoxError, CommitPolicy,
    EventSourceId, EventType, HandlerTable, JsonlEventLog, StateError, TenantId, TypeRegistry,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Counter aggregate
// ---------------------------------------------------------------------------

const COUNTER: AggregateRootId = AggregateRootId::new(Uuid::from_u128(0x0c0_0001));
const INCREMENTED: EventType = EventType::new(Uuid::from_u128(0x0c0_1001));
const WAS_RESET: EventType = EventType::new(Uuid::from_u128(0x0c0_1002));

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Incremented {
    by: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WasReset {
    previous: i64,
}

/// Errors a counter operation can return.
#[derive(Debug, thiserror::Error)]
enum CounterError {
    #[error("counter is already zero, nothing to reset")]
    NothingToReset,
    #[error(transparent)]
    State(#[from] StateError),
}

#[derive(Debug, Default)]
struct Counter {
    value: i64,
}

impl AggregateRoot for Counter {
    const TYPE_NAME: &'static str = "counter";

    fn construct(_: EventSourceId, _: &TypeRegistry) -> Result<Self, BoxError> {
        Ok(Self::default())
    }

    fn handlers(table: &mut HandlerTable<Self>) {
        table
            .on(|counter: &mut Counter, event: &Incremented| counter.value += event.by)
            .on(|counter: &mut Counter, _: &WasReset| counter.value = 0);
    }
}

fn increment(state: &mut AggregateState<Counter>) -> Result<i64, CounterError> {
    state.apply_public(Incremented { by: 1 })?;
    Ok(state.aggregate().value)
}

fn reset(state: &mut AggregateState<Counter>) -> Result<(), CounterError> {
    let previous = state.aggregate().value;
    if previous == 0 {
        return Err(CounterError::NothingToReset);
    }
    state.apply_public(WasReset { previous })?;
    Ok(())
}

fn value(state: &mut AggregateState<Counter>) -> Result<i64, Infallible> {
    Ok(state.aggregate().value)
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let tmp = tempfile::tempdir()?;

    let runtime = AggregateRuntime::builder()
        .register::<Counter>(COUNTER)
        .associate_event::<Incremented>(INCREMENTED)
        .associate_event::<WasReset>(WAS_RESET)
        .event_log(JsonlEventLog::new(tmp.path()))
        .nodes(3)
        .commit_policy(CommitPolicy::Automatic)
        .build()?;
    let counters = runtime.aggregate_of::<Counter>(TenantId::DEVELOPMENT);

    let alpha = counters.get("alpha").await?;
    for _ in 0..3 {
        alpha.perform(increment).await?;
    }

    let beta = counters.get("beta").await?;
    beta.perform(increment).await?;

    // Take alpha's node away; the next call lands on another node.
    let node = runtime
        .cluster()
        .owner_node(&alpha.location_key())
        .await
        .ok_or("alpha has no owner")?;
    runtime.cluster().stop_node(node).await;
    println!("stopped {node}");

    alpha.perform(increment).await?;
    println!("alpha = {}", alpha.perform(value).await?);

    alpha.perform(reset).await?;
    match alpha.perform(reset).await {
        Err(err) => println!("second reset rejected: {err}"),
        Ok(()) => return Err("second reset should fail".into()),
    }

    let alpha_value = alpha.perform(value).await?;
    let beta_value = beta.perform(value).await?;
    println!("alpha = {alpha_value}, beta = {beta_value}");

    assert_eq!(alpha_value, 0, "alpha should be reset to 0");
    assert_eq!(beta_value, 1);
    assert_eq!(alpha.version().await?.value(), 5);

    println!("all assertions passed");
    Ok(())
}
