//! Top-level entry point that ties the type registry, the event logs and
//! the cluster together into a single [`AggregateRuntime`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::aggregate::AggregateRoot;
use crate::cluster::{Cluster, Placement, RendezvousPlacement};
use crate::config::{CommitPolicy, RuntimeConfig};
use crate::error::ConfigurationError;
use crate::event::EventContent;
use crate::event_log::{EventLog, InMemoryEventLog};
use crate::factory::AggregateOf;
use crate::ids::{AggregateRootId, EventType, TenantId};
use crate::registry::TypeRegistry;

/// State shared by every handle a runtime gives out.
pub(crate) struct Shared {
    pub(crate) registry: Arc<TypeRegistry>,
    pub(crate) default_log: Arc<dyn EventLog>,
    pub(crate) tenant_logs: HashMap<TenantId, Arc<dyn EventLog>>,
    pub(crate) cluster: Cluster,
    pub(crate) config: RuntimeConfig,
}

impl Shared {
    /// The event log holding `tenant`'s streams.
    pub(crate) fn log_for(&self, tenant: TenantId) -> Arc<dyn EventLog> {
        self.tenant_logs
            .get(&tenant)
            .map_or_else(|| Arc::clone(&self.default_log), Arc::clone)
    }
}

/// Hosts aggregate instances behind single-writer owners.
///
/// Built with [`AggregateRuntime::builder`]. `Clone` is cheap: all internal
/// state is `Arc`-wrapped.
///
/// # Examples
///
/// ```no_run
/// use aggregate_runtime::{AggregateRuntime, CommitPolicy, TenantId};
/// # use aggregate_runtime::{AggregateRoot, BoxError, EventSourceId, TypeRegistry, AggregateRootId};
/// # struct Cart;
/// # impl AggregateRoot for Cart {
/// #     const TYPE_NAME: &'static str = "cart";
/// #     fn construct(_: EventSourceId, _: &TypeRegistry) -> Result<Self, BoxError> { Ok(Cart) }
/// # }
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let runtime = AggregateRuntime::builder()
///     .register::<Cart>(AggregateRootId::new(uuid::Uuid::from_u128(1)))
///     .commit_policy(CommitPolicy::Automatic)
///     .build()?;
/// let cart = runtime.aggregate_of::<Cart>(TenantId::DEVELOPMENT).create().await?;
/// # let _ = cart;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct AggregateRuntime {
    shared: Arc<Shared>,
}

// Manual `Debug`: event logs are trait objects.
impl std::fmt::Debug for AggregateRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateRuntime")
            .field("registry", &self.shared.registry)
            .field("tenant_logs", &self.shared.tenant_logs.len())
            .field("config", &self.shared.config)
            .finish()
    }
}

impl AggregateRuntime {
    /// Create a builder with no registrations and default settings.
    pub fn builder() -> AggregateRuntimeBuilder {
        AggregateRuntimeBuilder::new()
    }

    /// Entry point for aggregate root type `A` within `tenant`.
    pub fn aggregate_of<A: AggregateRoot>(&self, tenant: TenantId) -> AggregateOf<A> {
        AggregateOf::new(tenant, Arc::clone(&self.shared))
    }

    /// Registered aggregate root types and event types.
    pub fn registry(&self) -> &TypeRegistry {
        &self.shared.registry
    }

    /// The log used by tenants without a log of their own.
    pub fn event_log(&self) -> &Arc<dyn EventLog> {
        &self.shared.default_log
    }

    /// The log holding `tenant`'s streams.
    pub fn event_log_for(&self, tenant: TenantId) -> Arc<dyn EventLog> {
        self.shared.log_for(tenant)
    }

    /// The in-process cluster hosting the owners.
    pub fn cluster(&self) -> &Cluster {
        &self.shared.cluster
    }

    /// Settings the runtime was built with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }
}

/// Builder for configuring and creating an [`AggregateRuntime`].
///
/// All setters take `self` by value and return it for chaining.
pub struct AggregateRuntimeBuilder {
    registry: TypeRegistry,
    default_log: Option<Arc<dyn EventLog>>,
    tenant_logs: HashMap<TenantId, Arc<dyn EventLog>>,
    placement: Arc<dyn Placement>,
    config: RuntimeConfig,
}

impl AggregateRuntimeBuilder {
    /// Create a new builder.
    ///
    /// Without an [`event_log`](Self::event_log) the runtime keeps events in
    /// an [`InMemoryEventLog`].
    pub fn new() -> Self {
        Self {
            registry: TypeRegistry::new(),
            default_log: None,
            tenant_logs: HashMap::new(),
            placement: Arc::new(RendezvousPlacement),
            config: RuntimeConfig::default(),
        }
    }

    /// Replace the type registry wholesale.
    pub fn registry(mut self, registry: TypeRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Register aggregate root type `A` under `id`.
    pub fn register<A: AggregateRoot>(mut self, id: AggregateRootId) -> Self {
        self.registry.register::<A>(id);
        self
    }

    /// Associate event content type `E` with a wire event type.
    pub fn associate_event<E>(mut self, event_type: EventType) -> Self
    where
        E: EventContent + DeserializeOwned,
    {
        self.registry.associate_event::<E>(event_type);
        self
    }

    /// Use `log` for every tenant without a log of its own.
    pub fn event_log(self, log: impl EventLog) -> Self {
        self.shared_event_log(Arc::new(log))
    }

    /// Like [`event_log`](Self::event_log), for a log the caller keeps a
    /// handle to.
    pub fn shared_event_log(mut self, log: Arc<dyn EventLog>) -> Self {
        self.default_log = Some(log);
        self
    }

    /// Keep `tenant`'s streams in `log`.
    pub fn tenant_event_log(mut self, tenant: TenantId, log: Arc<dyn EventLog>) -> Self {
        self.tenant_logs.insert(tenant, log);
        self
    }

    /// Replace all settings at once.
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Set how long an owner waits for work before deactivating.
    ///
    /// Defaults to 5 minutes.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Set the capacity of each owner's mailbox. Defaults to 32.
    pub fn mailbox_capacity(mut self, capacity: usize) -> Self {
        self.config.mailbox_capacity = capacity;
        self
    }

    /// Set the number of in-process nodes. Defaults to 1.
    pub fn nodes(mut self, nodes: u32) -> Self {
        self.config.nodes = nodes;
        self
    }

    /// Set how often one operation may be relocated. Defaults to 3.
    pub fn max_relocations(mut self, max: u32) -> Self {
        self.config.max_relocations = max;
        self
    }

    /// Set when applied events are committed.
    ///
    /// Defaults to [`CommitPolicy::Automatic`].
    pub fn commit_policy(mut self, policy: CommitPolicy) -> Self {
        self.config.commit_policy = policy;
        self
    }

    /// Use a custom owner placement strategy.
    ///
    /// Defaults to [`RendezvousPlacement`].
    pub fn placement(mut self, placement: impl Placement) -> Self {
        self.placement = Arc::new(placement);
        self
    }

    /// Validate the settings and create the runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidRuntimeConfig`] if a setting is
    /// out of range.
    pub fn build(self) -> Result<AggregateRuntime, ConfigurationError> {
        self.config.validate()?;
        let default_log = self
            .default_log
            .unwrap_or_else(|| Arc::new(InMemoryEventLog::new()) as Arc<dyn EventLog>);

        tracing::debug!(
            registry = ?self.registry,
            nodes = self.config.nodes,
            tenant_logs = self.tenant_logs.len(),
            commit_policy = ?self.config.commit_policy,
            "aggregate runtime built"
        );

        let cluster = Cluster::new(self.config.clone(), self.placement);
        Ok(AggregateRuntime {
            shared: Arc::new(Shared {
                registry: Arc::new(self.registry),
                default_log,
                tenant_logs: self.tenant_logs,
                cluster,
                config: self.config,
            }),
        })
    }
}

impl Default for AggregateRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AggregateRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateRuntimeBuilder")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
