//! Crate-level error types for registration, rehydration, activation and
//! dispatch.

use std::io;

use crate::aggregate::{BoxError, ConstructorParam};
use crate::ids::{AggregateRootId, AggregateRootVersion, EventSourceId, EventType};

/// Error returned when an aggregate root type is not set up correctly.
///
/// Fatal and never retried: the composition of the runtime has to change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    /// The aggregate root type was never registered with the
    /// [`TypeRegistry`](crate::TypeRegistry).
    #[error("aggregate root type `{type_name}` is not registered")]
    Unregistered {
        /// Rust type name of the unregistered aggregate.
        type_name: &'static str,
    },

    /// The aggregate root type declares construction parameters the factory
    /// cannot supply.
    #[error(
        "aggregate root type `{type_name}` must be constructed from exactly an event source id \
         and a type registry, but declares {found:?}"
    )]
    InvalidConstructorSignature {
        /// Rust type name of the aggregate.
        type_name: &'static str,
        /// The parameters the type declared.
        found: Vec<ConstructorParam>,
    },

    /// A [`RuntimeConfig`](crate::RuntimeConfig) value is out of range.
    #[error("invalid runtime configuration: {reason}")]
    InvalidRuntimeConfig {
        /// What is wrong with the configuration.
        reason: &'static str,
    },
}

/// Error returned by the event log collaborator.
#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    /// Optimistic concurrency check failed on commit.
    ///
    /// Another writer committed to the stream since the expected version
    /// was read.
    #[error(
        "wrong expected version for event source {event_source}: expected {expected}, stream is at {actual}"
    )]
    WrongExpectedVersion {
        /// The stream that was written to.
        event_source: EventSourceId,
        /// The version the writer expected.
        expected: AggregateRootVersion,
        /// The version the stream is actually at.
        actual: AggregateRootVersion,
    },

    /// Disk or network I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A stored event could not be serialized or parsed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The log is unreachable or refused the request.
    #[error("event log unavailable: {0}")]
    Unavailable(String),
}

/// Error returned by [`AggregateState`](crate::AggregateState) operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The event content passed to `apply` was nil.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// Why the argument was rejected.
        reason: &'static str,
    },

    /// Rehydration produced no batch at all.
    #[error("no committed event batch was produced for event source {event_source}")]
    EmptyHistory {
        /// The instance being rehydrated.
        event_source: EventSourceId,
    },

    /// A batch belongs to another aggregate instance.
    #[error("committed events belong to event source {actual}, expected {expected}")]
    WrongEventSource {
        /// The instance being rehydrated.
        expected: EventSourceId,
        /// The event source the batch was tagged with.
        actual: EventSourceId,
    },

    /// A batch belongs to another aggregate root type.
    #[error("committed events belong to aggregate root {actual}, expected {expected}")]
    WrongAggregateRoot {
        /// The aggregate root type being rehydrated.
        expected: AggregateRootId,
        /// The aggregate root the batch was tagged with.
        actual: AggregateRootId,
    },

    /// A committed event has a handler but its content could not be decoded.
    #[error("committed event {event_type} at version {version} could not be decoded: {source}")]
    UndecodableEvent {
        /// The wire type of the event.
        event_type: EventType,
        /// The aggregate root version of the event.
        version: AggregateRootVersion,
        /// The underlying decode failure.
        #[source]
        source: serde_json::Error,
    },

    /// Rehydration was cancelled between two batches.
    #[error("rehydration was cancelled")]
    Cancelled,

    /// The event log failed while streaming history.
    #[error(transparent)]
    EventLog(#[from] EventLogError),
}

/// Error returned when an applied event cannot be turned into an
/// uncommitted event for the log.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// The event content type was never associated with an [`EventType`].
    #[error("event content `{content_type}` has no associated event type")]
    MissingEventType {
        /// Rust type name of the content.
        content_type: &'static str,
    },

    /// The event content could not be serialized.
    #[error("event content `{content_type}` could not be serialized: {source}")]
    Serialize {
        /// Rust type name of the content.
        content_type: &'static str,
        /// The underlying serialization failure.
        #[source]
        source: serde_json::Error,
    },
}

/// Error returned when an owner cannot build the state for an aggregate
/// instance.
#[derive(Debug, thiserror::Error)]
pub enum ActivationError {
    /// The aggregate root type is not registered or has an unusable
    /// constructor.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// The aggregate's constructor returned an error.
    #[error("could not create an instance of `{type_name}`: {source}")]
    InstanceCreationFailed {
        /// Rust type name of the aggregate.
        type_name: &'static str,
        /// The constructor's error.
        #[source]
        source: BoxError,
    },

    /// Fetching history from the event log failed.
    #[error("could not fetch committed events: {0}")]
    EventLog(#[from] EventLogError),

    /// Replaying committed events failed.
    #[error("could not rehydrate: {0}")]
    Rehydration(#[from] StateError),

    /// The constructor or a replayed handler panicked.
    #[error("`{type_name}` panicked while activating")]
    Panicked {
        /// Rust type name of the aggregate.
        type_name: &'static str,
    },
}

/// Infrastructure failure while routing an operation to its owner.
///
/// Never raised for errors returned by the caller's own mutation; those
/// surface as [`PerformError::Operation`].
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The owner could not build the aggregate state.
    #[error(transparent)]
    Activation(#[from] ActivationError),

    /// No node is live to own the location key.
    #[error("no live node can own the aggregate instance")]
    NoLiveOwner,

    /// The owner went away without answering.
    #[error("the owner of the aggregate instance stopped before replying")]
    OwnerGone,

    /// The operation was handed back for relocation too many times.
    #[error("operation was relocated {attempts} times without finding a stable owner")]
    RelocationsExhausted {
        /// How many relocations were attempted.
        attempts: u32,
    },

    /// The caller cancelled the wait.
    #[error("the wait for the operation was cancelled")]
    Cancelled,

    /// The mutation panicked inside the owner.
    #[error("the mutation panicked")]
    MutationPanicked,

    /// The previous owner dropped events that were applied but never
    /// committed. Reported once; the instance has been rebuilt from the
    /// event log.
    #[error("{count} applied but uncommitted events were lost")]
    UncommittedEventsLost {
        /// How many pending events were dropped.
        count: usize,
    },

    /// An applied event could not be encoded for commit.
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// Committing applied events failed.
    #[error("could not commit applied events: {0}")]
    Commit(#[source] EventLogError),
}

/// Error returned from [`AggregateOperations::perform`](crate::AggregateOperations::perform).
///
/// Generic over `E`, the error type of the caller's mutation.
///
/// # Type Parameters
///
/// * `E` - Business error type, must implement `Error + Send + Sync + 'static`
#[derive(Debug, thiserror::Error)]
pub enum PerformError<E: std::error::Error + Send + Sync + 'static> {
    /// The mutation itself returned an error.
    ///
    /// The exact value the mutation returned, forwarding its `Display` and
    /// `Error` impls.
    #[error(transparent)]
    Operation(E),

    /// The operation could not be carried out.
    #[error("operation on `{aggregate_type}` aggregate root {event_source} failed: {source}")]
    Failed {
        /// Type name of the aggregate root.
        aggregate_type: &'static str,
        /// The instance the operation targeted.
        event_source: EventSourceId,
        /// What went wrong.
        #[source]
        source: DispatchError,
    },
}

impl<E: std::error::Error + Send + Sync + 'static> PerformError<E> {
    /// Returns the business error if the mutation itself failed.
    pub fn operation(&self) -> Option<&E> {
        match self {
            Self::Operation(e) => Some(e),
            Self::Failed { .. } => None,
        }
    }

    /// Returns the infrastructure failure, if any.
    pub fn dispatch_error(&self) -> Option<&DispatchError> {
        match self {
            Self::Operation(_) => None,
            Self::Failed { source, .. } => Some(source),
        }
    }
}

/// Error returned from [`AggregateOf::get`](crate::AggregateOf::get) and
/// [`AggregateOf::create`](crate::AggregateOf::create).
#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    /// The aggregate instance could not be loaded.
    #[error("could not get `{aggregate_type}` aggregate root {event_source}: {source}")]
    CouldNotGetAggregateRoot {
        /// Type name of the aggregate root.
        aggregate_type: &'static str,
        /// The instance that was requested.
        event_source: EventSourceId,
        /// The root cause.
        #[source]
        source: DispatchError,
    },
}

impl FactoryError {
    /// Returns the root dispatch failure.
    pub fn dispatch_error(&self) -> &DispatchError {
        match self {
            Self::CouldNotGetAggregateRoot { source, .. } => source,
        }
    }
}
