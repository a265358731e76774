//! Read side of the repository shared by callers, command logic and the pipeline.

use causeway_core::{
    CausewayResult, Entity, EntityKind, EntityLookup, HybridClock, HybridTimestamp,
    RepositoryView, StorageError,
};
use causeway_journal::Journal;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

/// Resolves handles through the journal.
pub(crate) struct JournalLookup(pub Arc<dyn Journal>);

impl EntityLookup for JournalLookup {
    fn lookup(&self, uuid: Uuid) -> Result<Option<Box<dyn Entity>>, StorageError> {
        self.0.get(uuid)
    }
}

/// Journal plus the pipeline clock.
pub struct RepositoryCore {
    journal: Arc<dyn Journal>,
    lookup: Arc<dyn EntityLookup>,
    clock: Arc<Mutex<HybridClock>>,
}

impl RepositoryCore {
    pub(crate) fn new(journal: Arc<dyn Journal>, clock: Arc<Mutex<HybridClock>>) -> Self {
        Self {
            lookup: Arc::new(JournalLookup(Arc::clone(&journal))),
            journal,
            clock,
        }
    }

    pub(crate) fn clock(&self) -> &Arc<Mutex<HybridClock>> {
        &self.clock
    }
}

impl RepositoryView for RepositoryCore {
    fn lookup(&self) -> Arc<dyn EntityLookup> {
        Arc::clone(&self.lookup)
    }

    fn scan(&self, kind: EntityKind, name: &str) -> CausewayResult<Vec<Uuid>> {
        let cursor = self.journal.entities(kind, name)?;
        Ok(cursor.map(|handle| handle.uuid()).collect())
    }

    fn timestamp(&self) -> HybridTimestamp {
        self.clock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .timestamp()
    }
}
