//! Entity model: commands and events share an identity header and a
//! declared type name, and are handled type-erased as [`Entity`] trait objects
//! once they enter the pipeline.

use crate::{HybridTimestamp, StorageError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use uuid::Uuid;

// ============================================================================
// KIND & HEADER
// ============================================================================

/// Whether a record type is a command or an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Command,
    Event,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Command => "command",
            EntityKind::Event => "event",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity and causal timestamp of a journaled entity.
///
/// Both fields start out empty and are assigned at most once; an explicitly
/// supplied value is never overwritten by the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityHeader {
    uuid: Option<Uuid>,
    timestamp: Option<HybridTimestamp>,
}

impl EntityHeader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = Some(uuid);
        self
    }

    pub fn with_timestamp(mut self, timestamp: HybridTimestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn uuid(&self) -> Option<Uuid> {
        self.uuid
    }

    pub fn timestamp(&self) -> Option<HybridTimestamp> {
        self.timestamp
    }

    /// Returns the existing uuid, generating one first if absent.
    pub fn assign_uuid(&mut self) -> Uuid {
        *self.uuid.get_or_insert_with(Uuid::now_v7)
    }

    /// Returns the existing timestamp, storing `timestamp` first if absent.
    pub fn assign_timestamp(&mut self, timestamp: HybridTimestamp) -> HybridTimestamp {
        *self.timestamp.get_or_insert(timestamp)
    }
}

// ============================================================================
// RECORD (static view)
// ============================================================================

/// One named, typed field of a record layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub ty: &'static str,
}

impl FieldDescriptor {
    pub const fn new(name: &'static str, ty: &'static str) -> Self {
        Self { name, ty }
    }
}

/// A concrete command or event type.
///
/// Implement it with the [`record!`](crate::record) macro, which also fills in
/// the field descriptors used for the type hash.
pub trait Record: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static {
    /// Stable type name. Queries and subscriptions match on it.
    const NAME: &'static str;
    const KIND: EntityKind;
    const FIELDS: &'static [FieldDescriptor];

    fn entity_header(&self) -> &EntityHeader;
    fn entity_header_mut(&mut self) -> &mut EntityHeader;

    fn with_uuid(mut self, uuid: Uuid) -> Self {
        let header = self.entity_header().with_uuid(uuid);
        *self.entity_header_mut() = header;
        self
    }

    fn with_timestamp(mut self, timestamp: HybridTimestamp) -> Self {
        let header = self.entity_header().with_timestamp(timestamp);
        *self.entity_header_mut() = header;
        self
    }
}

/// Marker for records that may appear in an event stream.
pub trait Event: Record {}

// ============================================================================
// ENTITY (erased view)
// ============================================================================

/// Object-safe view over any [`Record`].
pub trait Entity: fmt::Debug + Send + Sync + 'static {
    fn kind(&self) -> EntityKind;
    fn type_name(&self) -> &'static str;
    fn header(&self) -> &EntityHeader;
    fn header_mut(&mut self) -> &mut EntityHeader;
    fn encode(&self) -> Result<Vec<u8>, StorageError>;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;
    fn clone_entity(&self) -> Box<dyn Entity>;

    fn uuid(&self) -> Option<Uuid> {
        self.header().uuid()
    }

    fn timestamp(&self) -> Option<HybridTimestamp> {
        self.header().timestamp()
    }
}

impl<T: Record> Entity for T {
    fn kind(&self) -> EntityKind {
        T::KIND
    }

    fn type_name(&self) -> &'static str {
        T::NAME
    }

    fn header(&self) -> &EntityHeader {
        self.entity_header()
    }

    fn header_mut(&mut self) -> &mut EntityHeader {
        self.entity_header_mut()
    }

    fn encode(&self) -> Result<Vec<u8>, StorageError> {
        serde_json::to_vec(self).map_err(|e| StorageError::EncodeFailed {
            name: T::NAME.to_string(),
            reason: e.to_string(),
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }

    fn clone_entity(&self) -> Box<dyn Entity> {
        Box::new(self.clone())
    }
}

impl dyn Entity {
    pub fn is<T: Record>(&self) -> bool {
        self.as_any().is::<T>()
    }

    pub fn downcast_ref<T: Record>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// Unbox an erased entity into its concrete type.
pub fn downcast_entity<T: Record>(entity: Box<dyn Entity>) -> Result<T, StorageError> {
    let id = entity.uuid().unwrap_or_else(Uuid::nil);
    let found = entity.type_name();
    entity
        .into_any()
        .downcast::<T>()
        .map(|boxed| *boxed)
        .map_err(|_| StorageError::TypeMismatch {
            id,
            expected: T::NAME.to_string(),
            found: found.to_string(),
        })
}

/// Declare a [`Record`] implementation for a struct with a `header: EntityHeader` field.
///
/// ```ignore
/// #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// pub struct NameChanged { header: EntityHeader, name: String }
///
/// causeway_core::record!(event NameChanged = "name_changed" { name: String });
/// ```
#[macro_export]
macro_rules! record {
    (event $ty:ident = $name:literal { $($field:ident : $fty:ty),* $(,)? }) => {
        $crate::record!(@impl $ty, $name, $crate::EntityKind::Event, [$($field : $fty),*]);
        impl $crate::Event for $ty {}
    };
    (command $ty:ident = $name:literal { $($field:ident : $fty:ty),* $(,)? }) => {
        $crate::record!(@impl $ty, $name, $crate::EntityKind::Command, [$($field : $fty),*]);
    };
    (@impl $ty:ident, $name:literal, $kind:expr, [$($field:ident : $fty:ty),*]) => {
        impl $crate::Record for $ty {
            const NAME: &'static str = $name;
            const KIND: $crate::EntityKind = $kind;
            const FIELDS: &'static [$crate::FieldDescriptor] = &[
                $($crate::FieldDescriptor::new(stringify!($field), stringify!($fty))),*
            ];

            fn entity_header(&self) -> &$crate::EntityHeader {
                &self.header
            }

            fn entity_header_mut(&mut self) -> &mut $crate::EntityHeader {
                &mut self.header
            }
        }
    };
}

// ============================================================================
// HANDLES
// ============================================================================

/// Anything that can resolve a journaled entity by uuid.
pub trait EntityLookup: Send + Sync {
    fn lookup(&self, uuid: Uuid) -> Result<Option<Box<dyn Entity>>, StorageError>;
}

/// Reference to a journaled entity of unknown type. Resolved on demand.
#[derive(Clone)]
pub struct AnyEntityHandle {
    uuid: Uuid,
    source: Arc<dyn EntityLookup>,
}

impl AnyEntityHandle {
    pub fn new(uuid: Uuid, source: Arc<dyn EntityLookup>) -> Self {
        Self { uuid, source }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn get(&self) -> Result<Box<dyn Entity>, StorageError> {
        self.source
            .lookup(self.uuid)?
            .ok_or(StorageError::NotFound { id: self.uuid })
    }

    pub fn typed<T: Record>(self) -> EntityHandle<T> {
        EntityHandle::new(self.uuid, self.source)
    }
}

impl fmt::Debug for AnyEntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyEntityHandle")
            .field("uuid", &self.uuid)
            .finish_non_exhaustive()
    }
}

/// Typed reference to a journaled entity.
pub struct EntityHandle<T> {
    uuid: Uuid,
    source: Arc<dyn EntityLookup>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Record> EntityHandle<T> {
    pub fn new(uuid: Uuid, source: Arc<dyn EntityLookup>) -> Self {
        Self {
            uuid,
            source,
            _marker: PhantomData,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn get(&self) -> Result<T, StorageError> {
        let entity = self
            .source
            .lookup(self.uuid)?
            .ok_or(StorageError::NotFound { id: self.uuid })?;
        downcast_entity(entity)
    }
}

impl<T> Clone for EntityHandle<T> {
    fn clone(&self) -> Self {
        Self {
            uuid: self.uuid,
            source: Arc::clone(&self.source),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for EntityHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityHandle")
            .field("type", &std::any::type_name::<T>())
            .field("uuid", &self.uuid)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
