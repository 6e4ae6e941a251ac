//! Identifiers for tenants, aggregate root types, event sources, versions
//! and the location keys derived from them.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fixed namespace UUID for deterministic location key derivation.
///
/// Every [`LocationKey`] is a UUID v5 value derived from this namespace and
/// the `"{tenant}/{aggregate root}/{event source}"` string, so the same
/// identity maps to the same key in every process.
const LOCATION_NAMESPACE: Uuid = Uuid::from_bytes([
    0x3c, 0x71, 0x0e, 0x5a, 0x92, 0x4b, 0x4f, 0x1d, 0xa8, 0x26, 0x5e, 0xb0, 0x77, 0x13, 0xc9, 0x4e,
]);

/// Identifies the tenant an aggregate instance belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(Uuid);

impl TenantId {
    /// The tenant used for local development and single-tenant deployments.
    pub const DEVELOPMENT: TenantId = TenantId(Uuid::from_u128(0x445f8ea8_1a6f_40d7_b2fc_796dba92dc44));

    /// Wrap an existing UUID.
    pub const fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for TenantId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Stable identifier of an aggregate root *type*, with a generation.
///
/// The generation lets a type evolve while keeping its identity; location
/// keys only use [`id`](AggregateRootId::id) so that all generations share
/// a single owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregateRootId {
    /// The type's stable UUID.
    pub id: Uuid,
    /// The type's generation, starting at 1.
    pub generation: u32,
}

impl AggregateRootId {
    /// Create an identifier with generation 1.
    pub const fn new(id: Uuid) -> Self {
        Self { id, generation: 1 }
    }

    /// Returns a copy with the given generation.
    pub const fn with_generation(self, generation: u32) -> Self {
        Self {
            id: self.id,
            generation,
        }
    }
}

impl fmt::Display for AggregateRootId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.generation)
    }
}

/// Identifies one aggregate instance, i.e. one event stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventSourceId(String);

impl EventSourceId {
    /// Create an event source identifier from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Create a new random event source identifier (UUID v4).
    pub fn new_random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventSourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventSourceId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for EventSourceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<Uuid> for EventSourceId {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}

impl From<&EventSourceId> for EventSourceId {
    fn from(id: &EventSourceId) -> Self {
        id.clone()
    }
}

/// Monotonically increasing version of one aggregate instance.
///
/// Starts at [`INITIAL`](AggregateRootVersion::INITIAL) and counts the
/// events the instance has applied or replayed.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct AggregateRootVersion(u64);

impl AggregateRootVersion {
    /// The version of an aggregate instance with no events.
    pub const INITIAL: AggregateRootVersion = AggregateRootVersion(0);

    /// Wrap a raw version number.
    pub const fn new(version: u64) -> Self {
        Self(version)
    }

    /// Returns the raw version number.
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Returns the version directly after this one.
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for AggregateRootVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for AggregateRootVersion {
    fn from(version: u64) -> Self {
        Self(version)
    }
}

/// Wire-level identifier of an event content type, with a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventType {
    /// The event type's stable UUID.
    pub id: Uuid,
    /// The event type's generation, starting at 1.
    pub generation: u32,
}

impl EventType {
    /// Create an event type with generation 1.
    pub const fn new(id: Uuid) -> Self {
        Self { id, generation: 1 }
    }

    /// Returns a copy with the given generation.
    pub const fn with_generation(self, generation: u32) -> Self {
        Self {
            id: self.id,
            generation,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.generation)
    }
}

/// Routing key for one `(tenant, aggregate root type, event source)` triple.
///
/// All operations for one key are funneled to a single owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationKey(Uuid);

impl LocationKey {
    /// Derive the location key for an aggregate instance.
    ///
    /// # Arguments
    ///
    /// * `tenant` - The tenant owning the instance.
    /// * `aggregate_root` - The aggregate root type. Only its `id` takes part,
    ///   so every generation of a type routes to the same owner.
    /// * `event_source` - The instance identifier.
    ///
    /// # Examples
    ///
    /// ```
    /// use aggregate_runtime::{AggregateRootId, EventSourceId, LocationKey, TenantId};
    /// use uuid::Uuid;
    ///
    /// let cart = AggregateRootId::new(Uuid::from_u128(7));
    /// let a = LocationKey::for_aggregate(TenantId::DEVELOPMENT, &cart, &EventSourceId::new("c-1"));
    /// let b = LocationKey::for_aggregate(TenantId::DEVELOPMENT, &cart, &EventSourceId::new("c-1"));
    /// assert_eq!(a, b);
    /// ```
    pub fn for_aggregate(
        tenant: TenantId,
        aggregate_root: &AggregateRootId,
        event_source: &EventSourceId,
    ) -> Self {
        let name = format!("{tenant}/{}/{event_source}", aggregate_root.id);
        Self(Uuid::new_v5(&LOCATION_NAMESPACE, name.as_bytes()))
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for LocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cart() -> AggregateRootId {
        AggregateRootId::new(Uuid::from_u128(0xca27))
    }

    #[test]
    fn location_key_is_deterministic() {
        let a = LocationKey::for_aggregate(TenantId::DEVELOPMENT, &cart(), &"c-1".into());
        let b = LocationKey::for_aggregate(TenantId::DEVELOPMENT, &cart(), &"c-1".into());
        assert_eq!(a, b, "same identity must produce the same key");
    }

    #[test]
    fn location_key_differs_by_event_source() {
        let a = LocationKey::for_aggregate(TenantId::DEVELOPMENT, &cart(), &"c-1".into());
        let b = LocationKey::for_aggregate(TenantId::DEVELOPMENT, &cart(), &"c-2".into());
        assert_ne!(a, b);
    }

    #[test]
    fn location_key_differs_by_tenant() {
        let other = TenantId::new(Uuid::from_u128(99));
        let a = LocationKey::for_aggregate(TenantId::DEVELOPMENT, &cart(), &"c-1".into());
        let b = LocationKey::for_aggregate(other, &cart(), &"c-1".into());
        assert_ne!(a, b);
    }

    #[test]
    fn location_key_differs_by_aggregate_type() {
        let other = AggregateRootId::new(Uuid::from_u128(0xbeef));
        let a = LocationKey::for_aggregate(TenantId::DEVELOPMENT, &cart(), &"c-1".into());
        let b = LocationKey::for_aggregate(TenantId::DEVELOPMENT, &other, &"c-1".into());
        assert_ne!(a, b);
    }

    #[test]
    fn location_key_ignores_generation() {
        let a = LocationKey::for_aggregate(TenantId::DEVELOPMENT, &cart(), &"c-1".into());
        let b = LocationKey::for_aggregate(
            TenantId::DEVELOPMENT,
            &cart().with_generation(4),
            &"c-1".into(),
        );
        assert_eq!(a, b, "generations of one type share an owner");
    }

    #[test]
    fn version_next_adds_exactly_one() {
        let v = AggregateRootVersion::INITIAL.next().next();
        assert_eq!(v.value(), 2);
        assert!(v > AggregateRootVersion::INITIAL);
    }

    #[test]
    fn random_event_sources_are_distinct() {
        assert_ne!(EventSourceId::new_random(), EventSourceId::new_random());
    }

    #[test]
    fn aggregate_root_id_display_includes_generation() {
        let id = cart().with_generation(3);
        assert!(id.to_string().ends_with("@3"));
    }

    #[test]
    fn event_source_serializes_as_plain_string() {
        let json = serde_json::to_string(&EventSourceId::new("c-1")).expect("serialize");
        assert_eq!(json, "\"c-1\"");
    }
}
