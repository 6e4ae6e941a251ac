//! Keyed single-writer runtime for event-sourced aggregate roots.
//!
//! Each `(tenant, aggregate root, event source)` instance is owned by one
//! actor at a time. Operations on the instance are queued to that owner
//! and run one after another against an [`AggregateState`] rebuilt from the
//! instance's committed events.

mod actor;
mod aggregate;
mod cancel;
mod cluster;
mod config;
mod dispatcher;
mod error;
mod event;
mod event_log;
mod factory;
mod ids;
mod registry;
mod runtime;
mod state;
mod storage;

pub use aggregate::{AggregateRoot, BoxError, ConstructorParam, STANDARD_CONSTRUCTOR};
pub use cancel::{Cancellation, CancellationSource};
pub use cluster::{Cluster, NodeId, Placement, RendezvousPlacement};
pub use config::{CommitPolicy, RuntimeConfig};
pub use dispatcher::AggregateOperations;
pub use error::{
    ActivationError, ConfigurationError, DispatchError, EncodeError, EventLogError, FactoryError,
    PerformError, StateError,
};
pub use event::{
    AppliedEvent, CommittedEvent, CommittedEventBatch, EventContent, EventTypes, UncommittedEvent,
};
pub use event_log::{BatchStream, EventLog, InMemoryEventLog};
pub use factory::AggregateOf;
pub use ids::{
    AggregateRootId, AggregateRootVersion, EventSourceId, EventType, LocationKey, TenantId,
};
pub use registry::{Handler, HandlerTable, TypeRegistry};
pub use runtime::{AggregateRuntime, AggregateRuntimeBuilder};
pub use state::{AggregateState, AggregateStatus};
pub use storage::{JsonlEventLog, StreamLayout};
