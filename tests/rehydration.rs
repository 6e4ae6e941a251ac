//! Activation against pre-existing history, in memory and on disk.

mod common;

use std::convert::Infallible;
use std::sync::Arc;

use aggregate_runtime::{
    AggregateRootVersion, AggregateState, CommitPolicy, EventLog, EventSourceId, InMemoryEventLog,
    JsonlEventLog, TenantId, UncommittedEvent,
};
use common::{AUDIT_ID, Audit, BUMPED, Basket, NOTED, TALLY_ID, Tally, builder, put_in};

fn bumped() -> UncommittedEvent {
    UncommittedEvent {
        content: serde_json::json!({ "by": 1 }),
        event_type: BUMPED,
        is_public: true,
    }
}

fn noted(text: &str) -> UncommittedEvent {
    UncommittedEvent {
        content: serde_json::json!({ "text": text }),
        event_type: NOTED,
        is_public: false,
    }
}

#[tokio::test]
async fn get_replays_every_batch_before_returning() {
    let log = Arc::new(InMemoryEventLog::new());
    let id = EventSourceId::new("tally-1");
    // Two commits: one batch of 2 events, one of 3.
    log.commit(TALLY_ID, &id, AggregateRootVersion::INITIAL, vec![bumped(), bumped()])
        .await
        .expect("first commit");
    log.commit(
        TALLY_ID,
        &id,
        AggregateRootVersion::new(2),
        vec![bumped(), bumped(), bumped()],
    )
    .await
    .expect("second commit");

    let runtime = builder().shared_event_log(log).build().expect("build");
    let ops = runtime
        .aggregate_of::<Tally>(TenantId::DEVELOPMENT)
        .get(id)
        .await
        .expect("get");

    let (version, count, pending) = ops
        .perform(|state: &mut AggregateState<Tally>| {
            Ok::<_, Infallible>((
                state.version().value(),
                state.aggregate().count,
                state.applied_events().len(),
            ))
        })
        .await
        .expect("read");
    assert_eq!(version, 5);
    assert_eq!(count, 5);
    assert_eq!(pending, 0);
}

#[tokio::test]
async fn stateless_aggregate_takes_the_logged_version() {
    let log = Arc::new(InMemoryEventLog::new().with_max_batch_size(2));
    let id = EventSourceId::new("audit-1");
    log.commit(
        AUDIT_ID,
        &id,
        AggregateRootVersion::INITIAL,
        vec![noted("a"), noted("b"), noted("c")],
    )
    .await
    .expect("commit");

    let runtime = builder().shared_event_log(log).build().expect("build");
    let ops = runtime
        .aggregate_of::<Audit>(TenantId::DEVELOPMENT)
        .get(id)
        .await
        .expect("get");

    let (version, stateless) = ops
        .perform(|state: &mut AggregateState<Audit>| {
            Ok::<_, Infallible>((state.version().value(), state.is_stateless()))
        })
        .await
        .expect("read");
    assert_eq!(version, 3);
    assert!(stateless);
}

#[tokio::test]
async fn jsonl_log_survives_a_restart() {
    let tmp = tempfile::tempdir().expect("failed to create tmpdir");
    let id = EventSourceId::new("basket-1");

    {
        let runtime = builder()
            .event_log(JsonlEventLog::new(tmp.path()))
            .commit_policy(CommitPolicy::Automatic)
            .build()
            .expect("build");
        let basket = runtime
            .aggregate_of::<Basket>(TenantId::DEVELOPMENT)
            .get(id.clone())
            .await
            .expect("get");
        basket.perform(put_in("apple")).await.expect("put in");
        basket.perform(put_in("bread")).await.expect("put in");
    }

    let log = JsonlEventLog::new(tmp.path());
    let streams = log
        .layout()
        .list_streams(&common::BASKET_ID)
        .await
        .expect("list streams");
    assert_eq!(streams, vec![id.clone()]);

    let runtime = builder().event_log(log).build().expect("build");
    let basket = runtime
        .aggregate_of::<Basket>(TenantId::DEVELOPMENT)
        .get(id)
        .await
        .expect("get after restart");
    let (version, items) = basket
        .perform(|state: &mut AggregateState<Basket>| {
            Ok::<_, Infallible>((state.version().value(), state.aggregate().items.clone()))
        })
        .await
        .expect("read");
    assert_eq!(version, 2);
    assert_eq!(items, vec!["apple", "bread"]);
}

#[tokio::test]
async fn commit_conflict_surfaces_as_failure_and_recovers() {
    let log = Arc::new(InMemoryEventLog::new());
    let runtime = builder()
        .shared_event_log(log.clone())
        .commit_policy(CommitPolicy::Manual)
        .build()
        .expect("build");
    let ops = runtime
        .aggregate_of::<Tally>(TenantId::DEVELOPMENT)
        .get("tally-1")
        .await
        .expect("get");
    ops.perform(|s: &mut AggregateState<Tally>| s.apply_public(common::Bumped { by: 1 }))
        .await
        .expect("bump");

    // Another writer gets to the stream first.
    log.commit(
        TALLY_ID,
        &EventSourceId::new("tally-1"),
        AggregateRootVersion::INITIAL,
        vec![bumped(), bumped()],
    )
    .await
    .expect("external commit");

    let err = ops.commit().await.unwrap_err();
    assert!(matches!(
        err.dispatch_error(),
        Some(aggregate_runtime::DispatchError::Commit(
            aggregate_runtime::EventLogError::WrongExpectedVersion { .. }
        ))
    ));

    // The owner dropped its stale state and now sees the other writer's events.
    assert_eq!(ops.version().await.expect("version").value(), 2);
}
