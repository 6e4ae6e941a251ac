//! Event content, applied and committed event records, and the mapping
//! between event content types and their wire-level [`EventType`]s.
//!
//! Aggregates apply strongly typed event content. The event log only ever
//! sees JSON values tagged with an [`EventType`]; [`EventTypes`] bridges the
//! two directions (encode on commit, decode on rehydration).

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::ser::{self, Impossible};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EncodeError;
use crate::ids::{AggregateRootId, AggregateRootVersion, EventSourceId, EventType};

/// Type-erased event content.
///
/// Implemented for every `Serialize + Debug + Send + Sync + 'static` type,
/// so aggregates apply their own plain structs and enums.
pub trait EventContent: Any + Send + Sync + fmt::Debug {
    /// Upcast for downcasting to the concrete content type.
    fn as_any(&self) -> &dyn Any;

    /// Serialize the content to a JSON value.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the content cannot be represented as JSON.
    fn to_json(&self) -> serde_json::Result<Value>;

    /// Rust type name of the concrete content, for diagnostics.
    fn content_type_name(&self) -> &'static str;

    /// Returns `true` if the content is `()` or `None`.
    ///
    /// Unit structs are not nil: they are valid marker events.
    fn is_nil(&self) -> bool;
}

impl<T> EventContent for T
where
    T: Serialize + fmt::Debug + Send + Sync + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn to_json(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    fn content_type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn is_nil(&self) -> bool {
        self.serialize(NilCheck).unwrap_or(false)
    }
}

/// Returns `true` if the content carries nothing.
pub(crate) fn is_nil(content: &dyn EventContent) -> bool {
    content.is_nil()
}

/// Serializer that only reports whether the top-level value is `()` or
/// `None`. Compound values bail out early with [`NotNil`].
struct NilCheck;

#[derive(Debug)]
struct NotNil;

impl fmt::Display for NotNil {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("content is not nil")
    }
}

impl std::error::Error for NotNil {}

impl ser::Error for NotNil {
    fn custom<M: fmt::Display>(_msg: M) -> Self {
        NotNil
    }
}

macro_rules! not_nil {
    ($($method:ident($ty:ty)),* $(,)?) => {
        $(
            fn $method(self, _v: $ty) -> Result<bool, NotNil> {
                Ok(false)
            }
        )*
    };
}

impl ser::Serializer for NilCheck {
    type Ok = bool;
    type Error = NotNil;
    type SerializeSeq = Impossible<bool, NotNil>;
    type SerializeTuple = Impossible<bool, NotNil>;
    type SerializeTupleStruct = Impossible<bool, NotNil>;
    type SerializeTupleVariant = Impossible<bool, NotNil>;
    type SerializeMap = Impossible<bool, NotNil>;
    type SerializeStruct = Impossible<bool, NotNil>;
    type SerializeStructVariant = Impossible<bool, NotNil>;

    not_nil! {
        serialize_bool(bool),
        serialize_i8(i8),
        serialize_i16(i16),
        serialize_i32(i32),
        serialize_i64(i64),
        serialize_u8(u8),
        serialize_u16(u16),
        serialize_u32(u32),
        serialize_u64(u64),
        serialize_f32(f32),
        serialize_f64(f64),
        serialize_char(char),
        serialize_str(&str),
        serialize_bytes(&[u8]),
        serialize_unit_struct(&'static str),
    }

    fn serialize_none(self) -> Result<bool, NotNil> {
        Ok(true)
    }

    fn serialize_unit(self) -> Result<bool, NotNil> {
        Ok(true)
    }

    fn serialize_some<V: ?Sized + Serialize>(self, _value: &V) -> Result<bool, NotNil> {
        Ok(false)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
    ) -> Result<bool, NotNil> {
        Ok(false)
    }

    fn serialize_newtype_struct<V: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _value: &V,
    ) -> Result<bool, NotNil> {
        Ok(false)
    }

    fn serialize_newtype_variant<V: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _value: &V,
    ) -> Result<bool, NotNil> {
        Ok(false)
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq, NotNil> {
        Err(NotNil)
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple, NotNil> {
        Err(NotNil)
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct, NotNil> {
        Err(NotNil)
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant, NotNil> {
        Err(NotNil)
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap, NotNil> {
        Err(NotNil)
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStruct, NotNil> {
        Err(NotNil)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, NotNil> {
        Err(NotNil)
    }
}

/// Returns the [`TypeId`] of the concrete type behind `content`.
pub(crate) fn content_type_id(content: &dyn EventContent) -> TypeId {
    content.as_any().type_id()
}

/// An event applied to an aggregate state that has not been committed yet.
#[derive(Debug, Clone)]
pub struct AppliedEvent {
    /// The typed content as the aggregate applied it.
    pub content: Arc<dyn EventContent>,
    /// The wire type of the content, when one is associated.
    pub event_type: Option<EventType>,
    /// Whether the event is visible outside the aggregate's boundary.
    pub is_public: bool,
}

impl AppliedEvent {
    /// Downcast the content to a concrete type.
    pub fn content_as<E: Any>(&self) -> Option<&E> {
        self.content.as_any().downcast_ref::<E>()
    }
}

/// A previously persisted event, as returned by the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedEvent {
    /// JSON encoded content.
    pub content: Value,
    /// Wire type of the content.
    pub event_type: EventType,
    /// Version of the aggregate at which the event was applied. The first
    /// event of a stream has version [`INITIAL`](AggregateRootVersion::INITIAL).
    pub aggregate_root_version: AggregateRootVersion,
    /// Whether the event is visible outside the aggregate's boundary.
    pub is_public: bool,
}

/// An ordered group of committed events for one aggregate instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedEventBatch {
    /// The aggregate root type the events belong to.
    pub aggregate_root: AggregateRootId,
    /// The instance the events belong to.
    pub event_source: EventSourceId,
    /// Version of the aggregate after the last event of this batch.
    pub version: AggregateRootVersion,
    /// Events in the order they were committed.
    pub events: Vec<CommittedEvent>,
}

impl CommittedEventBatch {
    /// A batch with no events, representing a never-written stream.
    pub fn empty(aggregate_root: AggregateRootId, event_source: EventSourceId) -> Self {
        Self {
            aggregate_root,
            event_source,
            version: AggregateRootVersion::INITIAL,
            events: Vec::new(),
        }
    }
}

/// An applied event encoded for submission to the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    /// JSON encoded content.
    pub content: Value,
    /// Wire type of the content.
    pub event_type: EventType,
    /// Whether the event is visible outside the aggregate's boundary.
    pub is_public: bool,
}

impl UncommittedEvent {
    /// Encode an applied event.
    ///
    /// # Errors
    ///
    /// * [`EncodeError::MissingEventType`] if no wire type is attached.
    /// * [`EncodeError::Serialize`] if the content cannot be serialized.
    pub fn from_applied(applied: &AppliedEvent) -> Result<Self, EncodeError> {
        let content_type = applied.content.content_type_name();
        let event_type = applied
            .event_type
            .ok_or(EncodeError::MissingEventType { content_type })?;
        let content = applied
            .content
            .to_json()
            .map_err(|source| EncodeError::Serialize {
                content_type,
                source,
            })?;
        Ok(Self {
            content,
            event_type,
            is_public: applied.is_public,
        })
    }

    /// Stamp the event with the version it is committed at.
    pub fn into_committed(self, version: AggregateRootVersion) -> CommittedEvent {
        CommittedEvent {
            content: self.content,
            event_type: self.event_type,
            aggregate_root_version: version,
            is_public: self.is_public,
        }
    }
}

type DecodeFn = Box<dyn Fn(Value) -> serde_json::Result<Arc<dyn EventContent>> + Send + Sync>;

struct Decoder {
    content_type: TypeId,
    decode: DecodeFn,
}

/// Two-way mapping between event content types and wire event types.
#[derive(Default)]
pub struct EventTypes {
    by_content: HashMap<TypeId, EventType>,
    decoders: HashMap<EventType, Decoder>,
}

impl fmt::Debug for EventTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventTypes")
            .field("associated", &self.decoders.len())
            .finish()
    }
}

impl EventTypes {
    /// Create an empty mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate the content type `E` with a wire event type.
    ///
    /// Re-associating either side replaces the previous entry.
    pub fn associate<E>(&mut self, event_type: EventType) -> &mut Self
    where
        E: EventContent + DeserializeOwned,
    {
        let content_type = TypeId::of::<E>();
        if let Some(previous) = self.by_content.insert(content_type, event_type)
            && previous != event_type
        {
            self.decoders.remove(&previous);
        }
        self.decoders.insert(
            event_type,
            Decoder {
                content_type,
                decode: Box::new(|value| {
                    let content: E = serde_json::from_value(value)?;
                    Ok(Arc::new(content) as Arc<dyn EventContent>)
                }),
            },
        );
        self
    }

    /// Returns the wire type associated with `E`.
    pub fn event_type_for<E: Any>(&self) -> Option<EventType> {
        self.event_type_of(TypeId::of::<E>())
    }

    /// Returns the wire type associated with a content [`TypeId`].
    pub fn event_type_of(&self, content_type: TypeId) -> Option<EventType> {
        self.by_content.get(&content_type).copied()
    }

    /// Returns the content [`TypeId`] a wire type decodes into.
    pub fn content_type_of(&self, event_type: &EventType) -> Option<TypeId> {
        self.decoders.get(event_type).map(|d| d.content_type)
    }

    /// Decode committed JSON content into its typed form.
    ///
    /// Returns `None` when no content type is associated with `event_type`.
    pub fn decode(
        &self,
        event_type: &EventType,
        content: Value,
    ) -> Option<serde_json::Result<Arc<dyn EventContent>>> {
        self.decoders
            .get(event_type)
            .map(|decoder| (decoder.decode)(content))
    }
}
