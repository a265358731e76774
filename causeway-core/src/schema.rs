//! Explicit record layouts.
//!
//! Every command and event type is registered once with a [`SchemaRegistry`].
//! Its [`Schema`] carries the field descriptors, a SHA-256 type hash over
//! kind, name and fields, and the function that decodes a stored payload
//! back into the concrete type. Journals key stored records by type hash.

use crate::{Entity, EntityKind, FieldDescriptor, Record, StorageError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};

// ============================================================================
// TYPE HASH
// ============================================================================

/// Stable SHA-256 digest of a record layout.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeHash([u8; 32]);

impl TypeHash {
    pub fn of(kind: EntityKind, name: &str, fields: &[FieldDescriptor]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(name.as_bytes());
        for field in fields {
            hasher.update(b";");
            hasher.update(field.name.as_bytes());
            hasher.update(b":");
            hasher.update(field.ty.as_bytes());
        }
        let result = hasher.finalize();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&result);
        TypeHash(hash)
    }

    pub fn of_record<T: Record>() -> Self {
        Self::of(T::KIND, T::NAME, T::FIELDS)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for TypeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for TypeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeHash({})", &hex::encode(self.0)[..12])
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

type DecodeFn = fn(&[u8]) -> Result<Box<dyn Entity>, StorageError>;

fn decode_record<T: Record>(payload: &[u8]) -> Result<Box<dyn Entity>, StorageError> {
    serde_json::from_slice::<T>(payload)
        .map(|record| Box::new(record) as Box<dyn Entity>)
        .map_err(|e| StorageError::DecodeFailed {
            name: T::NAME.to_string(),
            reason: e.to_string(),
        })
}

/// Registered layout of one record type.
pub struct Schema {
    name: &'static str,
    kind: EntityKind,
    hash: TypeHash,
    fields: &'static [FieldDescriptor],
    decode: DecodeFn,
}

impl Schema {
    pub fn of<T: Record>() -> Self {
        Self {
            name: T::NAME,
            kind: T::KIND,
            hash: TypeHash::of_record::<T>(),
            fields: T::FIELDS,
            decode: decode_record::<T>,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn hash(&self) -> TypeHash {
        self.hash
    }

    pub fn fields(&self) -> &'static [FieldDescriptor] {
        self.fields
    }

    pub fn decode(&self, payload: &[u8]) -> Result<Box<dyn Entity>, StorageError> {
        (self.decode)(payload)
    }

    pub fn layout(&self) -> LayoutInfo {
        LayoutInfo {
            hash: self.hash,
            name: self.name.to_string(),
            kind: self.kind,
            properties: self
                .fields
                .iter()
                .map(|f| PropertyInfo {
                    name: f.name.to_string(),
                    ty: f.ty.to_string(),
                })
                .collect(),
        }
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("hash", &self.hash)
            .finish()
    }
}

/// Persisted description of a layout, kept by journals so that stored
/// records can be identified even when their type is no longer registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutInfo {
    pub hash: TypeHash,
    pub name: String,
    pub kind: EntityKind,
    pub properties: Vec<PropertyInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyInfo {
    pub name: String,
    pub ty: String,
}

// ============================================================================
// REGISTRY
// ============================================================================

/// A bundle of record types registered together.
pub trait EntitySetProvider {
    fn register(&self, registry: &SchemaRegistry) -> Result<Vec<Arc<Schema>>, StorageError>;
}

#[derive(Default)]
struct RegistryInner {
    by_hash: HashMap<TypeHash, Arc<Schema>>,
    by_name: BTreeMap<&'static str, Arc<Schema>>,
}

/// Thread-safe schema registry. Types may be added while the repository runs.
#[derive(Default)]
pub struct SchemaRegistry {
    inner: RwLock<RegistryInner>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T`, returning its schema. Re-registering the same type is a no-op.
    pub fn register<T: Record>(&self) -> Result<Arc<Schema>, StorageError> {
        let schema = Schema::of::<T>();
        let mut inner = self.inner.write().map_err(|_| StorageError::LockPoisoned)?;
        if let Some(existing) = inner.by_name.get(T::NAME) {
            if existing.hash == schema.hash {
                return Ok(Arc::clone(existing));
            }
            return Err(StorageError::LayoutConflict {
                name: T::NAME.to_string(),
                registered: existing.hash,
                offered: schema.hash,
            });
        }
        let schema = Arc::new(schema);
        inner.by_hash.insert(schema.hash, Arc::clone(&schema));
        inner.by_name.insert(schema.name, Arc::clone(&schema));
        tracing::debug!(name = schema.name, kind = %schema.kind, hash = %schema.hash, "Registered schema");
        Ok(schema)
    }

    pub fn register_set(&self, provider: &dyn EntitySetProvider) -> Result<Vec<Arc<Schema>>, StorageError> {
        provider.register(self)
    }

    pub fn by_hash(&self, hash: &TypeHash) -> Option<Arc<Schema>> {
        let inner = self.inner.read().ok()?;
        inner.by_hash.get(hash).cloned()
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<Schema>> {
        let inner = self.inner.read().ok()?;
        inner.by_name.get(name).cloned()
    }

    pub fn schema_of<T: Record>(&self) -> Option<Arc<Schema>> {
        self.by_name(T::NAME)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.by_name(name).is_some()
    }

    /// All registered command schemas, ordered by name.
    pub fn commands(&self) -> Vec<Arc<Schema>> {
        self.of_kind(EntityKind::Command)
    }

    /// All registered event schemas, ordered by name.
    pub fn events(&self) -> Vec<Arc<Schema>> {
        self.of_kind(EntityKind::Event)
    }

    pub fn all(&self) -> Vec<Arc<Schema>> {
        match self.inner.read() {
            Ok(inner) => inner.by_name.values().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    fn of_kind(&self, kind: EntityKind) -> Vec<Arc<Schema>> {
        self.all().into_iter().filter(|s| s.kind == kind).collect()
    }

    /// Decode a stored payload by its type hash.
    pub fn decode(&self, hash: &TypeHash, payload: &[u8]) -> Result<Box<dyn Entity>, StorageError> {
        self.by_hash(hash)
            .ok_or(StorageError::UnknownSchema { hash: *hash })?
            .decode(payload)
    }
}

impl fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("schemas", &self.all())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EntityHeader;
    use proptest::prelude::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Opened {
        header: EntityHeader,
        account: String,
    }
    crate::record!(event Opened = "opened" { account: String });

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Open {
        header: EntityHeader,
        account: String,
    }
    crate::record!(command Open = "open" { account: String });

    // Same name as `Opened`, different layout.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OpenedV2 {
        header: EntityHeader,
        account: String,
        owner: String,
    }
    crate::record!(event OpenedV2 = "opened" { account: String, owner: String });

    struct Accounts;

    impl EntitySetProvider for Accounts {
        fn register(&self, registry: &SchemaRegistry) -> Result<Vec<Arc<Schema>>, StorageError> {
            Ok(vec![registry.register::<Open>()?, registry.register::<Opened>()?])
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = SchemaRegistry::new();
        let schema = registry.register::<Opened>().unwrap();
        assert_eq!(schema.name(), "opened");
        assert_eq!(registry.by_hash(&schema.hash()).unwrap().name(), "opened");
        assert!(registry.schema_of::<Opened>().is_some());
        assert!(registry.schema_of::<Open>().is_none());
    }

    #[test]
    fn test_reregistering_is_idempotent() {
        let registry = SchemaRegistry::new();
        let a = registry.register::<Opened>().unwrap();
        let b = registry.register::<Opened>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_conflicting_layout_rejected() {
        let registry = SchemaRegistry::new();
        registry.register::<Opened>().unwrap();
        assert!(matches!(
            registry.register::<OpenedV2>(),
            Err(StorageError::LayoutConflict { .. })
        ));
    }

    #[test]
    fn test_register_set_splits_kinds() {
        let registry = SchemaRegistry::new();
        let added = registry.register_set(&Accounts).unwrap();
        assert_eq!(added.len(), 2);
        assert_eq!(registry.commands().len(), 1);
        assert_eq!(registry.events().len(), 1);
        assert_eq!(registry.commands()[0].kind(), EntityKind::Command);
    }

    #[test]
    fn test_decode_by_hash() {
        let registry = SchemaRegistry::new();
        let schema = registry.register::<Opened>().unwrap();
        let event = Opened {
            header: EntityHeader::new(),
            account: "acc-1".to_string(),
        };
        let payload = Entity::encode(&event).unwrap();
        let decoded = registry.decode(&schema.hash(), &payload).unwrap();
        assert_eq!(decoded.downcast_ref::<Opened>(), Some(&event));

        let unknown = TypeHash::of_record::<OpenedV2>();
        assert!(matches!(
            registry.decode(&unknown, &payload),
            Err(StorageError::UnknownSchema { .. })
        ));
    }

    #[test]
    fn test_layout_lists_properties() {
        let layout = Schema::of::<OpenedV2>().layout();
        assert_eq!(layout.name, "opened");
        assert_eq!(layout.properties.len(), 2);
        assert_eq!(layout.properties[1].name, "owner");
    }

    proptest! {
        #[test]
        fn prop_hash_depends_on_every_field(name in "[a-z]{1,12}", field in "[a-z]{1,12}") {
            let base = [FieldDescriptor::new("id", "String")];
            let leaked: &'static str = Box::leak(field.clone().into_boxed_str());
            let extended = [FieldDescriptor::new("id", "String"), FieldDescriptor::new(leaked, "u64")];
            let a = TypeHash::of(EntityKind::Event, &name, &base);
            let b = TypeHash::of(EntityKind::Event, &name, &extended);
            prop_assert_ne!(a, b);
            prop_assert_eq!(a, TypeHash::of(EntityKind::Event, &name, &base));
            prop_assert_ne!(a, TypeHash::of(EntityKind::Command, &name, &base));
        }
    }
}
