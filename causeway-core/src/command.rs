//! Commands, their event streams, and the context they run in.

use crate::{
    downcast_entity, CausewayResult, CommandError, Entity, EntityHandle,
    EntityKind, EntityLookup, Event, HybridTimestamp, LockProvider, PhysicalTimeProvider, Record,
    RepositoryError, StorageError,
};
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use uuid::Uuid;

// ============================================================================
// EVENT STREAM
// ============================================================================

/// One pull from an event stream.
pub type EventResult = Result<Box<dyn Entity>, CommandError>;

/// Pull-based, fallible, single-pass event source.
pub type EventIter = Box<dyn Iterator<Item = EventResult> + Send>;

/// Events produced by a command, plus optional intermediate state for
/// [`Command::result`].
///
/// The stream is lazy: the journal pulls events one at a time and may stop
/// at the first error, discarding whatever the stream would still produce.
pub struct EventStream<S = ()> {
    state: Option<S>,
    events: EventIter,
}

impl<S> EventStream<S> {
    /// No events, no state.
    pub fn empty() -> Self {
        Self {
            state: None,
            events: Box::new(std::iter::empty()),
        }
    }

    /// No events, only state.
    pub fn with_state(state: S) -> Self {
        Self {
            state: Some(state),
            events: Box::new(std::iter::empty()),
        }
    }

    pub fn of<E: Event>(event: E) -> Self {
        Self::empty().then(event)
    }

    pub fn from_events<I, E>(events: I) -> Self
    where
        I: IntoIterator<Item = E>,
        I::IntoIter: Send + 'static,
        E: Event,
    {
        Self {
            state: None,
            events: Box::new(events.into_iter().map(|e| Ok(Box::new(e) as Box<dyn Entity>))),
        }
    }

    /// Events that may fail mid-stream. Production stops at the first `Err`.
    pub fn try_from_iter<I, E>(events: I) -> Self
    where
        I: IntoIterator<Item = Result<E, CommandError>>,
        I::IntoIter: Send + 'static,
        E: Event,
    {
        Self {
            state: None,
            events: Box::new(
                events
                    .into_iter()
                    .map(|r| r.map(|e| Box::new(e) as Box<dyn Entity>)),
            ),
        }
    }

    /// Append one event.
    pub fn then<E: Event>(self, event: E) -> Self {
        let next = std::iter::once(Ok(Box::new(event) as Box<dyn Entity>));
        Self {
            state: self.state,
            events: Box::new(self.events.chain(next)),
        }
    }

    /// Append another stream's events. Its state, if any, is dropped.
    pub fn chain<T>(self, other: EventStream<T>) -> Self {
        Self {
            state: self.state,
            events: Box::new(self.events.chain(other.events)),
        }
    }

    pub fn set_state(mut self, state: S) -> Self {
        self.state = Some(state);
        self
    }

    pub fn state(&self) -> Option<&S> {
        self.state.as_ref()
    }

    pub fn map_state<T>(self, f: impl FnOnce(S) -> T) -> EventStream<T> {
        EventStream {
            state: self.state.map(f),
            events: self.events,
        }
    }

    pub fn into_parts(self) -> (Option<S>, EventIter) {
        (self.state, self.events)
    }
}

impl<S> Default for EventStream<S> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<S: fmt::Debug> fmt::Debug for EventStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// COMMAND
// ============================================================================

/// Type-erased intermediate state passed from event production to result.
pub type CommandState = Box<dyn Any + Send>;

/// Everything command logic may touch while it runs.
#[derive(Clone, Copy)]
pub struct CommandContext<'a> {
    repository: &'a dyn RepositoryView,
    locks: &'a dyn LockProvider,
    time: &'a dyn PhysicalTimeProvider,
}

impl<'a> CommandContext<'a> {
    pub fn new(
        repository: &'a dyn RepositoryView,
        locks: &'a dyn LockProvider,
        time: &'a dyn PhysicalTimeProvider,
    ) -> Self {
        Self {
            repository,
            locks,
            time,
        }
    }

    pub fn repository(&self) -> &'a dyn RepositoryView {
        self.repository
    }

    pub fn locks(&self) -> &'a dyn LockProvider {
        self.locks
    }

    pub fn time(&self) -> &'a dyn PhysicalTimeProvider {
        self.time
    }

    /// Node id of the repository clock this context belongs to.
    pub fn node_id(&self) -> u16 {
        self.repository.timestamp().node_id()
    }

    /// A fresh timestamp from this context's time source and node.
    pub fn now(&self) -> HybridTimestamp {
        HybridTimestamp::now(self.time, self.node_id())
    }
}

impl fmt::Debug for CommandContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandContext").finish_non_exhaustive()
    }
}

/// A request to change state.
///
/// `events` runs in the journaling stage inside the command's transaction;
/// `result` runs in the completion stage once that transaction committed.
/// Commands that compute their result from the command alone use
/// `type State = ();`.
pub trait Command: Record {
    type State: Send + 'static;
    type Output: Clone + Send + Sync + 'static;

    fn events(&self, ctx: &CommandContext<'_>) -> Result<EventStream<Self::State>, CommandError>;

    fn result(
        &self,
        state: Option<Self::State>,
        ctx: &CommandContext<'_>,
    ) -> Result<Self::Output, CommandError>;
}

/// Object-safe view of a [`Command`] used by the journal.
pub trait AnyCommand: Entity {
    fn produce(&self, ctx: &CommandContext<'_>) -> Result<EventStream<CommandState>, CommandError>;
    fn as_entity(&self) -> &dyn Entity;
}

impl<C: Command> AnyCommand for C {
    fn produce(&self, ctx: &CommandContext<'_>) -> Result<EventStream<CommandState>, CommandError> {
        Ok(self
            .events(ctx)?
            .map_state(|state| Box::new(state) as CommandState))
    }

    fn as_entity(&self) -> &dyn Entity {
        self
    }
}

/// Run command logic, turning a panic into [`CommandError::Panicked`].
pub fn catch_panic<T>(f: impl FnOnce() -> Result<T, CommandError>) -> Result<T, CommandError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(CommandError::Panicked {
            message: panic_message(&*payload),
        }),
    }
}

pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ============================================================================
// REPOSITORY VIEW
// ============================================================================

/// Read access to the repository, for callers and for command logic.
pub trait RepositoryView: Send + Sync {
    /// Lookup used to resolve handles.
    fn lookup(&self) -> Arc<dyn EntityLookup>;

    /// Uuids of every journaled entity of the named type, in storage order.
    fn scan(&self, kind: EntityKind, name: &str) -> CausewayResult<Vec<Uuid>>;

    /// Current pipeline clock.
    fn timestamp(&self) -> HybridTimestamp;
}

/// Typed queries over any [`RepositoryView`].
pub trait RepositoryViewExt: RepositoryView {
    /// Every journaled `T` for which `predicate` holds.
    fn query<T: Record>(&self, predicate: impl Fn(&T) -> bool) -> CausewayResult<ResultSet<T>> {
        let lookup = self.lookup();
        let mut entries = Vec::new();
        for uuid in self.scan(T::KIND, T::NAME)? {
            let entity = match lookup.lookup(uuid)? {
                Some(entity) => entity,
                None => continue,
            };
            let record: T = downcast_entity(entity)?;
            if predicate(&record) {
                entries.push((
                    EntityHandle::new(uuid, Arc::clone(&lookup)),
                    record.entity_header().timestamp(),
                ));
            }
        }
        Ok(ResultSet { entries })
    }

    /// Every journaled `T`.
    fn all<T: Record>(&self) -> CausewayResult<ResultSet<T>> {
        self.query::<T>(|_| true)
    }
}

impl<R: RepositoryView + ?Sized> RepositoryViewExt for R {}

// ============================================================================
// RESULT SET
// ============================================================================

/// Handles matched by a query, in storage order unless reordered.
pub struct ResultSet<T> {
    entries: Vec<(EntityHandle<T>, Option<HybridTimestamp>)>,
}

impl<T: Record> ResultSet<T> {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityHandle<T>> {
        self.entries.iter().map(|(handle, _)| handle)
    }

    pub fn first(&self) -> Option<&EntityHandle<T>> {
        self.iter().next()
    }

    /// The only match, or an error when there are zero or several.
    pub fn unique(&self) -> CausewayResult<EntityHandle<T>> {
        match self.entries.as_slice() {
            [(handle, _)] => Ok(handle.clone()),
            other => Err(RepositoryError::NotUnique {
                name: T::NAME.to_string(),
                found: other.len(),
            }
            .into()),
        }
    }

    /// Match with the greatest timestamp: the current value of a projection.
    pub fn latest(&self) -> Option<&EntityHandle<T>> {
        self.entries
            .iter()
            .max_by_key(|(_, timestamp)| *timestamp)
            .map(|(handle, _)| handle)
    }

    /// Sort ascending by timestamp; untimestamped entries first.
    pub fn sort_by_timestamp(mut self) -> Self {
        self.entries.sort_by_key(|(_, timestamp)| *timestamp);
        self
    }

    pub fn reverse(mut self) -> Self {
        self.entries.reverse();
        self
    }

    /// Resolve every handle.
    pub fn load(&self) -> Result<Vec<T>, StorageError> {
        self.iter().map(EntityHandle::get).collect()
    }
}

impl<T> IntoIterator for ResultSet<T> {
    type Item = EntityHandle<T>;
    type IntoIter = std::vec::IntoIter<EntityHandle<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries
            .into_iter()
            .map(|(handle, _)| handle)
            .collect::<Vec<_>>()
            .into_iter()
    }
}

impl<T> fmt::Debug for ResultSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultSet")
            .field("len", &self.entries.len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EntityHeader, LocalLockProvider, ManualTimeProvider, TrackingLockProvider};
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use std::sync::RwLock;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counted {
        header: EntityHeader,
        n: u32,
    }
    crate::record!(event Counted = "counted" { n: u32 });

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Count {
        header: EntityHeader,
        upto: u32,
    }
    crate::record!(command Count = "count" { upto: u32 });

    impl Command for Count {
        type State = u32;
        type Output = u32;

        fn events(&self, ctx: &CommandContext<'_>) -> Result<EventStream<u32>, CommandError> {
            let _lock = ctx.locks().lock("count")?;
            let upto = self.upto;
            Ok(EventStream::from_events((0..upto).map(|n| Counted {
                header: EntityHeader::new(),
                n,
            }))
            .set_state(upto))
        }

        fn result(&self, state: Option<u32>, _ctx: &CommandContext<'_>) -> Result<u32, CommandError> {
            Ok(state.unwrap_or(0) * 2)
        }
    }

    #[derive(Default)]
    struct MapView {
        entities: RwLock<HashMap<Uuid, Box<dyn Entity>>>,
        order: RwLock<Vec<Uuid>>,
    }

    struct MapLookup(Arc<MapView>);

    impl EntityLookup for MapLookup {
        fn lookup(&self, uuid: Uuid) -> Result<Option<Box<dyn Entity>>, StorageError> {
            let map = self.0.entities.read().map_err(|_| StorageError::LockPoisoned)?;
            Ok(map.get(&uuid).map(|e| e.clone_entity()))
        }
    }

    struct SharedView(Arc<MapView>);

    impl RepositoryView for SharedView {
        fn lookup(&self) -> Arc<dyn EntityLookup> {
            Arc::new(MapLookup(Arc::clone(&self.0)))
        }

        fn scan(&self, _kind: EntityKind, name: &str) -> CausewayResult<Vec<Uuid>> {
            let map = self.0.entities.read().map_err(|_| StorageError::LockPoisoned)?;
            let order = self.0.order.read().map_err(|_| StorageError::LockPoisoned)?;
            Ok(order
                .iter()
                .filter(|id| map.get(id).map(|e| e.type_name() == name).unwrap_or(false))
                .copied()
                .collect())
        }

        fn timestamp(&self) -> HybridTimestamp {
            HybridTimestamp::new(0, 0, 0)
        }
    }

    fn insert(view: &MapView, n: u32, physical: u64) -> Uuid {
        let mut event = Counted {
            header: EntityHeader::new(),
            n,
        }
        .with_timestamp(HybridTimestamp::new(physical, 0, 0));
        let id = event.entity_header_mut().assign_uuid();
        view.entities.write().unwrap().insert(id, Box::new(event));
        view.order.write().unwrap().push(id);
        id
    }

    #[test]
    fn test_stream_preserves_order_and_state() {
        let stream: EventStream<&str> = EventStream::of(Counted {
            header: EntityHeader::new(),
            n: 1,
        })
        .then(Counted {
            header: EntityHeader::new(),
            n: 2,
        })
        .set_state("done");
        assert_eq!(stream.state(), Some(&"done"));
        let (state, events) = stream.into_parts();
        let ns: Vec<u32> = events
            .map(|e| e.unwrap().downcast_ref::<Counted>().unwrap().n)
            .collect();
        assert_eq!(ns, vec![1, 2]);
        assert_eq!(state, Some("done"));
    }

    #[test]
    fn test_stream_stops_being_useful_after_error() {
        let failing = EventStream::<()>::try_from_iter(
            std::iter::once(Ok(Counted {
                header: EntityHeader::new(),
                n: 0,
            }))
            .chain(std::iter::repeat_with(|| Err(CommandError::new("Broken", "no more")))),
        );
        let (_, mut events) = failing.into_parts();
        assert!(events.next().unwrap().is_ok());
        assert!(events.next().unwrap().is_err());
    }

    #[test]
    fn test_erased_command_passes_state() {
        let view = SharedView(Arc::default());
        let time = ManualTimeProvider::new(0);
        let locks = TrackingLockProvider::new(Arc::new(LocalLockProvider::new()));
        let ctx = CommandContext::new(&view, &locks, &time);

        let command = Count {
            header: EntityHeader::new(),
            upto: 3,
        };
        let erased: &dyn AnyCommand = &command;
        let (state, events) = erased.produce(&ctx).unwrap().into_parts();
        assert_eq!(events.count(), 3);
        let state = state.unwrap().downcast::<u32>().unwrap();
        assert_eq!(command.result(Some(*state), &ctx).unwrap(), 6);
        assert_eq!(locks.tracked(), 1);
    }

    #[test]
    fn test_catch_panic_converts_payload() {
        let result: Result<(), CommandError> = catch_panic(|| panic!("kaboom"));
        assert_eq!(
            result,
            Err(CommandError::Panicked {
                message: "kaboom".to_string()
            })
        );
    }

    #[test]
    fn test_query_filters_and_finds_latest() {
        let shared = Arc::new(MapView::default());
        insert(&shared, 1, 30);
        let newest = insert(&shared, 2, 50);
        insert(&shared, 3, 10);
        let view = SharedView(shared);

        let all = view.all::<Counted>().unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all.latest().unwrap().uuid(), newest);

        let odd = view.query::<Counted>(|c| c.n % 2 == 1).unwrap();
        assert_eq!(odd.len(), 2);
        assert!(odd.unique().is_err());

        let two = view.query::<Counted>(|c| c.n == 2).unwrap();
        assert_eq!(two.unique().unwrap().get().unwrap().n, 2);

        let sorted: Vec<u32> = all
            .sort_by_timestamp()
            .load()
            .unwrap()
            .into_iter()
            .map(|c| c.n)
            .collect();
        assert_eq!(sorted, vec![3, 1, 2]);
    }
}
