//! In-process cluster of nodes hosting owner actors.
//!
//! Every location key has at most one live owner at a time. A new owner is
//! placed on a live node only once the previous owner has released the key,
//! which it does after finishing its current job. Jobs the previous owner
//! never started are handed back and delivered again.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, mpsc, watch};
use uuid::Uuid;

use crate::actor::{Job, MailboxSender, OwnerContext, run_owner};
use crate::aggregate::AggregateRoot;
use crate::config::RuntimeConfig;
use crate::error::DispatchError;
use crate::factory::Factory;
use crate::ids::{AggregateRootId, EventSourceId, LocationKey, TenantId};

/// Identifies one node of the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Chooses the node a new owner is placed on.
pub trait Placement: Send + Sync + 'static {
    /// Pick one of `live` for `key`, or `None` if `live` is empty.
    fn place(&self, key: &LocationKey, live: &[NodeId]) -> Option<NodeId>;
}

/// Highest-random-weight placement.
///
/// Each node scores `uuid_v5(key, node)`; the highest live score wins, so
/// stopping a node only moves the keys that node would own.
#[derive(Debug, Clone, Copy, Default)]
pub struct RendezvousPlacement;

impl RendezvousPlacement {
    fn score(key: &LocationKey, node: NodeId) -> u128 {
        Uuid::new_v5(&key.as_uuid(), &node.0.to_be_bytes()).as_u128()
    }
}

impl Placement for RendezvousPlacement {
    fn place(&self, key: &LocationKey, live: &[NodeId]) -> Option<NodeId> {
        live.iter()
            .copied()
            .max_by_key(|node| Self::score(key, *node))
    }
}

/// Type-erased view of an owner's mailbox sender.
trait Mailbox: Send + Sync {
    fn is_closed(&self) -> bool;
    fn as_any(&self) -> &dyn Any;
}

impl<A: AggregateRoot> Mailbox for MailboxSender<A> {
    fn is_closed(&self) -> bool {
        mpsc::Sender::is_closed(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct OwnerEntry {
    node: NodeId,
    incarnation: u64,
    mailbox: Box<dyn Mailbox>,
}

struct NodeSlot {
    live: bool,
    shutdown: watch::Sender<bool>,
}

impl NodeSlot {
    fn started() -> Self {
        let (shutdown, _rx) = watch::channel(false);
        Self {
            live: true,
            shutdown,
        }
    }
}

#[derive(Default)]
struct ClusterState {
    nodes: BTreeMap<NodeId, NodeSlot>,
    owners: HashMap<LocationKey, OwnerEntry>,
    /// Uncommitted events dropped by released owners, reported to the next
    /// delivery for the key.
    lost: HashMap<LocationKey, usize>,
    next_incarnation: u64,
}

impl ClusterState {
    fn live_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, slot)| slot.live)
            .map(|(id, _)| *id)
            .collect()
    }
}

/// An owner's claim on its location key, given back when the owner exits.
pub(crate) struct OwnerLease {
    state: Weak<Mutex<ClusterState>>,
    key: LocationKey,
    incarnation: u64,
}

impl OwnerLease {
    /// A lease not tracked by any cluster.
    #[cfg(test)]
    pub(crate) fn detached(key: LocationKey) -> Self {
        Self {
            state: Weak::new(),
            key,
            incarnation: 0,
        }
    }

    /// Close the owner's mailbox and give the key back.
    ///
    /// `close` runs under the cluster lock, so no delivery can observe a
    /// closed mailbox whose owner still holds the key. `lost` pending
    /// events are reported to the next delivery for the key.
    pub(crate) async fn release(self, lost: usize, close: impl FnOnce()) {
        let Some(state) = self.state.upgrade() else {
            close();
            return;
        };
        let mut state = state.lock().await;
        close();
        if state
            .owners
            .get(&self.key)
            .is_some_and(|entry| entry.incarnation == self.incarnation)
        {
            state.owners.remove(&self.key);
        }
        if lost > 0 {
            *state.lost.entry(self.key).or_default() += lost;
        }
    }
}

/// Routes jobs to the single owner of each location key.
pub struct Cluster {
    state: Arc<Mutex<ClusterState>>,
    placement: Arc<dyn Placement>,
    config: RuntimeConfig,
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Cluster {
    /// Create a cluster with `config.nodes` live nodes, numbered from 0.
    pub(crate) fn new(config: RuntimeConfig, placement: Arc<dyn Placement>) -> Self {
        let nodes = (0..config.nodes)
            .map(|n| (NodeId(n), NodeSlot::started()))
            .collect();
        Self {
            state: Arc::new(Mutex::new(ClusterState {
                nodes,
                ..ClusterState::default()
            })),
            placement,
            config,
        }
    }

    /// Derive the location key of an aggregate instance.
    pub fn location_key_for(
        &self,
        tenant: TenantId,
        aggregate_root: &AggregateRootId,
        event_source: &EventSourceId,
    ) -> LocationKey {
        LocationKey::for_aggregate(tenant, aggregate_root, event_source)
    }

    /// Stop a node.
    ///
    /// Owners on the node finish their current job, hand back queued jobs
    /// and exit. Later deliveries place new owners on the remaining nodes.
    /// Returns `false` if the node was unknown or already stopped.
    pub async fn stop_node(&self, node: NodeId) -> bool {
        let mut state = self.state.lock().await;
        let Some(slot) = state.nodes.get_mut(&node) else {
            return false;
        };
        if !slot.live {
            return false;
        }
        slot.live = false;
        slot.shutdown.send_replace(true);
        tracing::info!(node = %node, "node stopped");
        true
    }

    /// Start a stopped node, or add a new one.
    ///
    /// Returns `false` if the node was already live.
    pub async fn start_node(&self, node: NodeId) -> bool {
        let mut state = self.state.lock().await;
        if state.nodes.get(&node).is_some_and(|slot| slot.live) {
            return false;
        }
        // A fresh channel: owners of the previous incarnation keep seeing
        // their stop signal.
        state.nodes.insert(node, NodeSlot::started());
        tracing::info!(node = %node, "node started");
        true
    }

    /// Live nodes, in ascending order.
    pub async fn live_nodes(&self) -> Vec<NodeId> {
        self.state.lock().await.live_nodes()
    }

    /// The node hosting the live owner of `key`, if any.
    pub async fn owner_node(&self, key: &LocationKey) -> Option<NodeId> {
        let state = self.state.lock().await;
        state
            .owners
            .get(key)
            .filter(|entry| !entry.mailbox.is_closed())
            .map(|entry| entry.node)
    }

    /// Number of owners currently accepting jobs.
    pub async fn active_owners(&self) -> usize {
        let state = self.state.lock().await;
        state
            .owners
            .values()
            .filter(|entry| !entry.mailbox.is_closed())
            .count()
    }

    /// Number of location keys the cluster is tracking an owner for.
    #[cfg(test)]
    async fn tracked_owners(&self) -> usize {
        self.state.lock().await.owners.len()
    }

    /// Returns the mailbox of the live owner of `key`, spawning an owner on
    /// a live node if there is none.
    async fn mailbox_for<A: AggregateRoot>(
        &self,
        key: LocationKey,
        event_source: &EventSourceId,
        factory: &Factory<A>,
    ) -> Result<MailboxSender<A>, DispatchError> {
        let mut state = self.state.lock().await;

        if let Some(count) = state.lost.remove(&key) {
            return Err(DispatchError::UncommittedEventsLost { count });
        }

        // Fast path: the current owner is still accepting jobs.
        if let Some(entry) = state.owners.get(&key)
            && !entry.mailbox.is_closed()
            && let Some(sender) = entry.mailbox.as_any().downcast_ref::<MailboxSender<A>>()
        {
            return Ok(sender.clone());
        }

        let live = state.live_nodes();
        let node = self
            .placement
            .place(&key, &live)
            .ok_or(DispatchError::NoLiveOwner)?;
        let shutdown = state
            .nodes
            .get(&node)
            .filter(|slot| slot.live)
            .map(|slot| slot.shutdown.subscribe())
            .ok_or(DispatchError::NoLiveOwner)?;

        tracing::debug!(
            aggregate_type = A::TYPE_NAME,
            event_source = %event_source,
            node = %node,
            "spawning owner"
        );
        let incarnation = state.next_incarnation;
        state.next_incarnation += 1;
        let (tx, rx) = mpsc::channel::<Box<dyn Job<A>>>(self.config.mailbox_capacity);
        let ctx = OwnerContext {
            factory: factory.clone(),
            event_source: event_source.clone(),
            node,
            idle_timeout: self.config.idle_timeout,
            lease: OwnerLease {
                state: Arc::downgrade(&self.state),
                key,
                incarnation,
            },
        };
        tokio::spawn(run_owner(ctx, rx, shutdown));

        state.owners.insert(
            key,
            OwnerEntry {
                node,
                incarnation,
                mailbox: Box::new(tx.clone()),
            },
        );
        Ok(tx)
    }

    /// Deliver `job` to the owner of `key`.
    ///
    /// A job bounced by a closing mailbox is retried against the next owner,
    /// at most `max_relocations` times. Undeliverable jobs are failed.
    pub(crate) async fn deliver<A: AggregateRoot>(
        &self,
        key: LocationKey,
        event_source: &EventSourceId,
        factory: &Factory<A>,
        job: Box<dyn Job<A>>,
    ) {
        let mut job = job;
        let attempts = self.config.max_relocations.saturating_add(1);
        for _ in 0..attempts {
            let mailbox = match self.mailbox_for(key, event_source, factory).await {
                Ok(mailbox) => mailbox,
                Err(err) => {
                    job.fail(err);
                    return;
                }
            };
            match mailbox.send(job).await {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => job = returned,
            }
        }
        job.fail(DispatchError::RelocationsExhausted { attempts });
    }
}
