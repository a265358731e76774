//! Entity subscribers.
//!
//! A subscriber pairs a predicate with a sink. The pipeline evaluates the
//! predicate against every entity a transaction writes and, once the
//! transaction commits, hands the sink one lazy sequence of handles.

use crate::{AnyEntityHandle, Entity, EntityHandle, EntityLookup, Record};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use uuid::Uuid;

/// Standing predicate-and-sink pair.
pub trait EntitySubscriber: Send + Sync {
    fn matches(&self, entity: &dyn Entity) -> bool;

    /// Called once per committed transaction with at least one match.
    fn accept(&self, entities: EntityHandles);
}

/// Lazy, finite sequence of handles to committed entities. Each handle
/// resolves against the journal when read, not when delivered.
pub struct EntityHandles {
    uuids: std::vec::IntoIter<Uuid>,
    source: Arc<dyn EntityLookup>,
}

impl EntityHandles {
    pub fn new(uuids: Vec<Uuid>, source: Arc<dyn EntityLookup>) -> Self {
        Self {
            uuids: uuids.into_iter(),
            source,
        }
    }

    /// Handles still to be yielded.
    pub fn remaining(&self) -> usize {
        self.uuids.len()
    }
}

impl Iterator for EntityHandles {
    type Item = AnyEntityHandle;

    fn next(&mut self) -> Option<Self::Item> {
        self.uuids
            .next()
            .map(|uuid| AnyEntityHandle::new(uuid, Arc::clone(&self.source)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.uuids.size_hint()
    }
}

impl ExactSizeIterator for EntityHandles {}

impl fmt::Debug for EntityHandles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityHandles")
            .field("remaining", &self.uuids.len())
            .finish()
    }
}

/// Subscriber for every committed entity of record type `T`.
pub struct TypeSubscriber<T, F> {
    sink: F,
    _marker: PhantomData<fn() -> T>,
}

impl<T, F> TypeSubscriber<T, F>
where
    T: Record,
    F: Fn(Vec<EntityHandle<T>>) + Send + Sync,
{
    pub fn new(sink: F) -> Self {
        Self {
            sink,
            _marker: PhantomData,
        }
    }
}

impl<T, F> EntitySubscriber for TypeSubscriber<T, F>
where
    T: Record,
    F: Fn(Vec<EntityHandle<T>>) + Send + Sync,
{
    fn matches(&self, entity: &dyn Entity) -> bool {
        entity.kind() == T::KIND && entity.type_name() == T::NAME
    }

    fn accept(&self, entities: EntityHandles) {
        (self.sink)(entities.map(AnyEntityHandle::typed::<T>).collect())
    }
}
