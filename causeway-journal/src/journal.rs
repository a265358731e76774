//! The Journal contract.
//!
//! Storage backends implement the primitives ([`Journal::begin`],
//! [`Transaction`], [`Journal::entities`]); the transaction protocol in
//! [`crate::protocol`] is shared and runs on top of them.

use crate::protocol;
use causeway_core::{
    AnyCommand, AnyEntityHandle, CommandContext, CommandState, Entity, EntityKind, EntityLookup,
    JournalError, Record, Schema, SchemaRegistry, StorageError,
};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

// ============================================================================
// LISTENER
// ============================================================================

/// Observer of one `journal` call.
///
/// `on_command_state` fires once before any event; `on_event` fires per
/// written event in write order; exactly one of `on_commit` / `on_abort`
/// closes each transaction attempt.
pub trait JournalListener {
    fn on_command_state(&mut self, _state: Option<CommandState>) {}

    fn on_event(&mut self, _event: &dyn Entity) {}

    fn on_commit(&mut self) {}

    fn on_abort(&mut self, _error: &JournalError) {}
}

/// Listener that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl JournalListener for NoopListener {}

// ============================================================================
// TRANSACTION
// ============================================================================

/// Buffered writes that become visible together on commit, or not at all.
pub trait Transaction {
    fn put_event(&mut self, event: &dyn Entity) -> Result<(), StorageError>;

    fn put_command(&mut self, command: &dyn Entity) -> Result<(), StorageError>;

    fn commit(&mut self) -> Result<(), StorageError>;

    /// Discard everything written so far. Never fails.
    fn rollback(&mut self);
}

// ============================================================================
// CURSOR
// ============================================================================

/// Backend side of a [`JournalCursor`].
pub trait CursorSource: Send {
    fn next_uuid(&mut self) -> Option<Uuid>;

    /// Release whatever the backend holds for this cursor.
    fn close(&mut self);
}

/// Cursor over a point-in-time list of uuids.
pub struct SnapshotCursor {
    uuids: std::vec::IntoIter<Uuid>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl SnapshotCursor {
    pub fn new(uuids: Vec<Uuid>) -> Self {
        Self {
            uuids: uuids.into_iter(),
            on_close: None,
        }
    }

    pub fn on_close(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(f));
        self
    }
}

impl CursorSource for SnapshotCursor {
    fn next_uuid(&mut self) -> Option<Uuid> {
        self.uuids.next()
    }

    fn close(&mut self) {
        if let Some(f) = self.on_close.take() {
            f();
        }
    }
}

/// Finite, single-pass sequence of handles in storage order.
///
/// Exhausting, closing, or dropping the cursor releases the backend cursor.
pub struct JournalCursor {
    source: Option<Box<dyn CursorSource>>,
    lookup: Arc<dyn EntityLookup>,
}

impl JournalCursor {
    pub fn new(source: Box<dyn CursorSource>, lookup: Arc<dyn EntityLookup>) -> Self {
        Self {
            source: Some(source),
            lookup,
        }
    }

    pub fn close(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.source.is_none()
    }
}

impl Iterator for JournalCursor {
    type Item = AnyEntityHandle;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.source.as_mut()?.next_uuid();
        match next {
            Some(uuid) => Some(AnyEntityHandle::new(uuid, Arc::clone(&self.lookup))),
            None => {
                self.close();
                None
            }
        }
    }
}

impl Drop for JournalCursor {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for JournalCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JournalCursor")
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// JOURNAL
// ============================================================================

/// Durable, transactional store of commands, events and causality links.
pub trait Journal: EntityLookup + Send + Sync {
    /// Attach the schema registry and open the backend.
    fn start(&self, registry: Arc<SchemaRegistry>) -> Result<(), StorageError>;

    fn stop(&self) -> Result<(), StorageError>;

    /// Called when types are registered after start.
    fn on_schemas_added(&self, _schemas: &[Arc<Schema>]) -> Result<(), StorageError> {
        Ok(())
    }

    fn begin(&self) -> Result<Box<dyn Transaction + '_>, StorageError>;

    /// Journal `command` and the events it produces in one transaction.
    ///
    /// Returns the number of events the command produced. On failure the
    /// transaction is rolled back and a `CommandTerminatedExceptionally`
    /// record is journaled in its place; the original failure is returned.
    fn journal(
        &self,
        command: &mut dyn AnyCommand,
        listener: &mut dyn JournalListener,
        ctx: &CommandContext<'_>,
    ) -> Result<usize, JournalError> {
        protocol::journal_command(self, command, listener, ctx)
    }

    fn get(&self, uuid: Uuid) -> Result<Option<Box<dyn Entity>>, StorageError> {
        self.lookup(uuid)
    }

    /// Handles to every entity of the named type, in storage order.
    fn entities(&self, kind: EntityKind, name: &str) -> Result<JournalCursor, StorageError>;

    fn command_iterator(&self, name: &str) -> Result<JournalCursor, StorageError> {
        self.entities(EntityKind::Command, name)
    }

    fn event_iterator(&self, name: &str) -> Result<JournalCursor, StorageError> {
        self.entities(EntityKind::Event, name)
    }

    /// Remove all journaled data.
    fn clear(&self) -> Result<(), StorageError>;

    fn size(&self, kind: EntityKind, name: &str) -> Result<usize, StorageError> {
        Ok(self.entities(kind, name)?.count())
    }

    fn is_empty(&self, kind: EntityKind, name: &str) -> Result<bool, StorageError> {
        Ok(self.size(kind, name)? == 0)
    }
}

/// Typed conveniences over any [`Journal`].
pub trait JournalExt: Journal {
    fn cursor_of<T: Record>(&self) -> Result<JournalCursor, StorageError> {
        self.entities(T::KIND, T::NAME)
    }

    fn size_of<T: Record>(&self) -> Result<usize, StorageError> {
        self.size(T::KIND, T::NAME)
    }

    fn is_empty_of<T: Record>(&self) -> Result<bool, StorageError> {
        self.is_empty(T::KIND, T::NAME)
    }
}

impl<J: Journal + ?Sized> JournalExt for J {}
