//! In-memory Journal implementation.
//!
//! Records are kept as encoded payloads keyed by uuid, with a per-type
//! index in commit order. A [`MemoryStore`] may be shared by successive
//! journal instances, which is how a reopen with a different set of
//! registered types is exercised.

use causeway_core::{
    Entity, EntityKind, EntityLookup, LayoutInfo, Schema, SchemaRegistry, StorageError, TypeHash,
};
use causeway_journal::{Journal, JournalCursor, SnapshotCursor, Transaction};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

// ============================================================================
// STORE
// ============================================================================

#[derive(Debug, Clone)]
struct StoredRecord {
    hash: TypeHash,
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct StoreState {
    records: HashMap<Uuid, StoredRecord>,
    by_type: HashMap<TypeHash, Vec<Uuid>>,
    layouts: BTreeMap<TypeHash, LayoutInfo>,
}

/// Backing data of a [`MemoryJournal`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records of every type.
    pub fn len(&self) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(state.records.len())
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    /// Every layout ever recorded in this store.
    pub fn layouts(&self) -> Result<Vec<LayoutInfo>, StorageError> {
        let state = self.state.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(state.layouts.values().cloned().collect())
    }
}

/// Resolves uuids against a store with a given registry.
struct StoreLookup {
    store: Arc<MemoryStore>,
    registry: Arc<SchemaRegistry>,
}

impl EntityLookup for StoreLookup {
    fn lookup(&self, uuid: Uuid) -> Result<Option<Box<dyn Entity>>, StorageError> {
        let record = {
            let state = self.store.state.read().map_err(|_| StorageError::LockPoisoned)?;
            match state.records.get(&uuid) {
                Some(record) => record.clone(),
                None => return Ok(None),
            }
        };
        self.registry.decode(&record.hash, &record.payload).map(Some)
    }
}

// ============================================================================
// JOURNAL
// ============================================================================

/// Transactional in-memory journal.
///
/// # Example
///
/// ```rust,ignore
/// let journal = MemoryJournal::new();
/// journal.start(registry)?;
/// let count = journal.journal(&mut command, &mut NoopListener, &ctx)?;
/// ```
#[derive(Debug)]
pub struct MemoryJournal {
    store: Arc<MemoryStore>,
    registry: RwLock<Option<Arc<SchemaRegistry>>>,
    running: AtomicBool,
    open_cursors: Arc<AtomicUsize>,
    commit_failures: AtomicUsize,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    pub fn with_store(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            registry: RwLock::new(None),
            running: AtomicBool::new(false),
            open_cursors: Arc::new(AtomicUsize::new(0)),
            commit_failures: AtomicUsize::new(0),
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Cursors handed out and not yet exhausted, closed or dropped.
    pub fn open_cursors(&self) -> usize {
        self.open_cursors.load(Ordering::SeqCst)
    }

    /// Make the next `count` commits fail. Testing aid for the failure paths.
    pub fn fail_commits(&self, count: usize) {
        self.commit_failures.store(count, Ordering::SeqCst);
    }

    /// Stored layouts whose type hash no registered schema carries.
    pub fn unrecognized_entities(&self) -> Result<Vec<LayoutInfo>, StorageError> {
        let registry = self.registry()?;
        Ok(self
            .store
            .layouts()?
            .into_iter()
            .filter(|layout| registry.by_hash(&layout.hash).is_none())
            .collect())
    }

    fn registry(&self) -> Result<Arc<SchemaRegistry>, StorageError> {
        self.registry
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .clone()
            .ok_or(StorageError::NotStarted)
    }

    fn record_layouts(&self, schemas: &[Arc<Schema>]) -> Result<(), StorageError> {
        let mut state = self.store.state.write().map_err(|_| StorageError::LockPoisoned)?;
        for schema in schemas {
            state
                .layouts
                .entry(schema.hash())
                .or_insert_with(|| schema.layout());
        }
        Ok(())
    }

    fn report_unrecognized(&self) -> Result<(), StorageError> {
        for layout in self.unrecognized_entities()? {
            tracing::warn!(
                name = %layout.name,
                kind = %layout.kind,
                hash = %layout.hash,
                "Journal contains entities of an unregistered layout"
            );
        }
        Ok(())
    }

    fn take_injected_failure(&self) -> bool {
        self.commit_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemoryJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityLookup for MemoryJournal {
    fn lookup(&self, uuid: Uuid) -> Result<Option<Box<dyn Entity>>, StorageError> {
        StoreLookup {
            store: Arc::clone(&self.store),
            registry: self.registry()?,
        }
        .lookup(uuid)
    }
}

impl Journal for MemoryJournal {
    fn start(&self, registry: Arc<SchemaRegistry>) -> Result<(), StorageError> {
        let schemas = registry.all();
        *self.registry.write().map_err(|_| StorageError::LockPoisoned)? = Some(registry);
        self.record_layouts(&schemas)?;
        self.report_unrecognized()?;
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            schemas = schemas.len(),
            records = self.store.len()?,
            "Memory journal started"
        );
        Ok(())
    }

    fn stop(&self) -> Result<(), StorageError> {
        self.running.store(false, Ordering::SeqCst);
        tracing::info!(open_cursors = self.open_cursors(), "Memory journal stopped");
        Ok(())
    }

    fn on_schemas_added(&self, schemas: &[Arc<Schema>]) -> Result<(), StorageError> {
        self.record_layouts(schemas)?;
        self.report_unrecognized()
    }

    fn begin(&self) -> Result<Box<dyn Transaction + '_>, StorageError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(StorageError::NotStarted);
        }
        Ok(Box::new(MemoryTransaction {
            journal: self,
            registry: self.registry()?,
            pending: Vec::new(),
        }))
    }

    fn entities(&self, kind: EntityKind, name: &str) -> Result<JournalCursor, StorageError> {
        let registry = self.registry()?;
        let schema = registry
            .by_name(name)
            .filter(|schema| schema.kind() == kind)
            .ok_or_else(|| StorageError::UnregisteredType {
                name: name.to_string(),
            })?;
        let snapshot = {
            let state = self.store.state.read().map_err(|_| StorageError::LockPoisoned)?;
            state.by_type.get(&schema.hash()).cloned().unwrap_or_default()
        };

        self.open_cursors.fetch_add(1, Ordering::SeqCst);
        let open = Arc::clone(&self.open_cursors);
        let source = SnapshotCursor::new(snapshot).on_close(move || {
            open.fetch_sub(1, Ordering::SeqCst);
        });
        let lookup = Arc::new(StoreLookup {
            store: Arc::clone(&self.store),
            registry,
        });
        Ok(JournalCursor::new(Box::new(source), lookup))
    }

    fn clear(&self) -> Result<(), StorageError> {
        {
            let mut state = self.store.state.write().map_err(|_| StorageError::LockPoisoned)?;
            state.records.clear();
            state.by_type.clear();
            state.layouts.clear();
        }
        if let Ok(registry) = self.registry() {
            self.record_layouts(&registry.all())?;
        }
        tracing::info!("Memory journal cleared");
        Ok(())
    }

    fn size(&self, kind: EntityKind, name: &str) -> Result<usize, StorageError> {
        let registry = self.registry()?;
        let schema = registry
            .by_name(name)
            .filter(|schema| schema.kind() == kind)
            .ok_or_else(|| StorageError::UnregisteredType {
                name: name.to_string(),
            })?;
        let state = self.store.state.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(state.by_type.get(&schema.hash()).map_or(0, Vec::len))
    }
}

// ============================================================================
// TRANSACTION
// ============================================================================

struct MemoryTransaction<'a> {
    journal: &'a MemoryJournal,
    registry: Arc<SchemaRegistry>,
    pending: Vec<(Uuid, StoredRecord)>,
}

impl MemoryTransaction<'_> {
    fn put(&mut self, entity: &dyn Entity, expected: EntityKind) -> Result<(), StorageError> {
        if entity.kind() != expected {
            return Err(StorageError::TypeMismatch {
                id: entity.uuid().unwrap_or_else(Uuid::nil),
                expected: expected.to_string(),
                found: entity.kind().to_string(),
            });
        }
        let schema = self
            .registry
            .by_name(entity.type_name())
            .ok_or_else(|| StorageError::UnregisteredType {
                name: entity.type_name().to_string(),
            })?;
        let id = entity.uuid().ok_or_else(|| StorageError::TransactionFailed {
            reason: format!("{} has no uuid", entity.type_name()),
        })?;
        let payload = entity.encode()?;
        self.pending.push((
            id,
            StoredRecord {
                hash: schema.hash(),
                payload,
            },
        ));
        Ok(())
    }
}

impl Transaction for MemoryTransaction<'_> {
    fn put_event(&mut self, event: &dyn Entity) -> Result<(), StorageError> {
        self.put(event, EntityKind::Event)
    }

    fn put_command(&mut self, command: &dyn Entity) -> Result<(), StorageError> {
        self.put(command, EntityKind::Command)
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        if self.journal.take_injected_failure() {
            return Err(StorageError::TransactionFailed {
                reason: "injected commit failure".to_string(),
            });
        }

        let mut state = self
            .journal
            .store
            .state
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;

        let mut seen = HashSet::with_capacity(self.pending.len());
        for (id, _) in &self.pending {
            if state.records.contains_key(id) || !seen.insert(*id) {
                return Err(StorageError::DuplicateEntity { id: *id });
            }
        }

        for (id, record) in self.pending.drain(..) {
            state.by_type.entry(record.hash).or_default().push(id);
            state.records.insert(id, record);
        }
        Ok(())
    }

    fn rollback(&mut self) {
        self.pending.clear();
    }
}

// ============================================================================
// TESTS
// ============================================================================
