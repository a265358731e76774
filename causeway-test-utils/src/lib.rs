//! CAUSEWAY Test Utilities
//!
//! Shared test infrastructure for the CAUSEWAY workspace:
//! - Fixture commands and events covering every pipeline path
//! - Recording journal listeners and entity subscribers
//! - A harness that runs the journal protocol without a repository
//! - Proptest generators and custom assertions

pub use causeway_core::{
    AnyCommand, CausewayError, CausewayResult, Command, CommandContext, CommandError,
    CommandState, Entity, EntityHandles, EntityHeader, EntityKind, EntityLookup,
    EntitySetProvider, EntitySubscriber, EventStream, HybridTimestamp, JournalError,
    LocalLockProvider, LockProvider, ManualTimeProvider, Record, RepositoryView, Schema,
    SchemaRegistry, StorageError, TrackingLockProvider,
};
pub use causeway_journal::{Journal, JournalListener};

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};
use uuid::Uuid;

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Commands and events used across the workspace's tests.

    use super::*;
    use causeway_core::RepositoryViewExt;
    use serde::{Deserialize, Serialize};
    use thiserror::Error;

    /// Failure raised by the exceptional fixtures.
    #[derive(Debug, Clone, Error, PartialEq, Eq)]
    pub enum FixtureFailure {
        #[error("deliberate failure")]
        Deliberate,
    }

    fn deliberate() -> CommandError {
        CommandError::raise(FixtureFailure::Deliberate)
    }

    /// Class name recorded for [`FixtureFailure`].
    pub fn fixture_failure_class() -> String {
        std::any::type_name::<FixtureFailure>().to_string()
    }

    // === Events ===

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct TestEvent {
        pub header: EntityHeader,
        pub string: String,
    }
    causeway_core::record!(event TestEvent = "test.test_event" { string: String });

    impl TestEvent {
        pub fn new(string: impl Into<String>) -> Self {
            Self {
                header: EntityHeader::new(),
                string: string.into(),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct DescriptionChanged {
        pub header: EntityHeader,
        pub reference: Uuid,
        pub description: String,
    }
    causeway_core::record!(event DescriptionChanged = "test.description_changed" {
        reference: Uuid,
        description: String,
    });

    // === Commands ===

    /// Emits one [`TestEvent`] carrying `value`.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct RepositoryTestCommand {
        pub header: EntityHeader,
        pub value: String,
    }
    causeway_core::record!(command RepositoryTestCommand = "test.repository_test_command" { value: String });

    impl RepositoryTestCommand {
        pub fn new(value: impl Into<String>) -> Self {
            Self {
                header: EntityHeader::new(),
                value: value.into(),
            }
        }
    }

    impl Command for RepositoryTestCommand {
        type State = ();
        type Output = ();

        fn events(&self, _ctx: &CommandContext<'_>) -> Result<EventStream, CommandError> {
            Ok(EventStream::of(TestEvent::new(self.value.clone())))
        }

        fn result(&self, _state: Option<()>, _ctx: &CommandContext<'_>) -> Result<(), CommandError> {
            Ok(())
        }
    }

    /// Emits `count` events and resolves with how many it emitted.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct EmitEvents {
        pub header: EntityHeader,
        pub count: u32,
    }
    causeway_core::record!(command EmitEvents = "test.emit_events" { count: u32 });

    impl EmitEvents {
        pub fn new(count: u32) -> Self {
            Self {
                header: EntityHeader::new(),
                count,
            }
        }
    }

    impl Command for EmitEvents {
        type State = u32;
        type Output = u32;

        fn events(&self, _ctx: &CommandContext<'_>) -> Result<EventStream<u32>, CommandError> {
            let events = (0..self.count).map(|n| TestEvent::new(format!("event-{n}")));
            Ok(EventStream::from_events(events).set_state(self.count))
        }

        fn result(&self, state: Option<u32>, _ctx: &CommandContext<'_>) -> Result<u32, CommandError> {
            state.ok_or(CommandError::StateMismatch {
                expected: "u32".to_string(),
            })
        }
    }

    /// Acquires a named lock and never releases it.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct LockCommand {
        pub header: EntityHeader,
        pub key: String,
    }
    causeway_core::record!(command LockCommand = "test.lock_command" { key: String });

    impl LockCommand {
        pub fn new(key: impl Into<String>) -> Self {
            Self {
                header: EntityHeader::new(),
                key: key.into(),
            }
        }
    }

    impl Command for LockCommand {
        type State = ();
        type Output = ();

        fn events(&self, ctx: &CommandContext<'_>) -> Result<EventStream, CommandError> {
            let _lock = ctx.locks().lock(&self.key)?;
            Ok(EventStream::empty())
        }

        fn result(&self, _state: Option<()>, _ctx: &CommandContext<'_>) -> Result<(), CommandError> {
            Ok(())
        }
    }

    /// Acquires a named lock, then fails.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct ExceptionalLockCommand {
        pub header: EntityHeader,
        pub key: String,
    }
    causeway_core::record!(command ExceptionalLockCommand = "test.exceptional_lock_command" { key: String });

    impl ExceptionalLockCommand {
        pub fn new(key: impl Into<String>) -> Self {
            Self {
                header: EntityHeader::new(),
                key: key.into(),
            }
        }
    }

    impl Command for ExceptionalLockCommand {
        type State = ();
        type Output = ();

        fn events(&self, ctx: &CommandContext<'_>) -> Result<EventStream, CommandError> {
            let _lock = ctx.locks().lock(&self.key)?;
            Err(deliberate())
        }

        fn result(&self, _state: Option<()>, _ctx: &CommandContext<'_>) -> Result<(), CommandError> {
            Ok(())
        }
    }

    /// Fails before producing anything.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct ExceptionalCommand {
        pub header: EntityHeader,
    }
    causeway_core::record!(command ExceptionalCommand = "test.exceptional_command" {});

    impl Command for ExceptionalCommand {
        type State = ();
        type Output = ();

        fn events(&self, _ctx: &CommandContext<'_>) -> Result<EventStream, CommandError> {
            Err(deliberate())
        }

        fn result(&self, _state: Option<()>, _ctx: &CommandContext<'_>) -> Result<(), CommandError> {
            Ok(())
        }
    }

    /// Produces one event, then an endless run of failures.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct StreamExceptionCommand {
        pub header: EntityHeader,
    }
    causeway_core::record!(command StreamExceptionCommand = "test.stream_exception_command" {});

    impl Command for StreamExceptionCommand {
        type State = ();
        type Output = ();

        fn events(&self, _ctx: &CommandContext<'_>) -> Result<EventStream, CommandError> {
            let first = std::iter::once(Ok(TestEvent::new("before failure")));
            let failing = std::iter::repeat_with(|| Err(deliberate()));
            Ok(EventStream::try_from_iter(first.chain(failing)))
        }

        fn result(&self, _state: Option<()>, _ctx: &CommandContext<'_>) -> Result<(), CommandError> {
            Ok(())
        }
    }

    /// Panics while producing events.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct PanickingCommand {
        pub header: EntityHeader,
    }
    causeway_core::record!(command PanickingCommand = "test.panicking_command" {});

    impl Command for PanickingCommand {
        type State = ();
        type Output = ();

        fn events(&self, _ctx: &CommandContext<'_>) -> Result<EventStream, CommandError> {
            panic!("command logic panicked")
        }

        fn result(&self, _state: Option<()>, _ctx: &CommandContext<'_>) -> Result<(), CommandError> {
            Ok(())
        }
    }

    /// Hands a value from event production to its result.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct StatePassageCommand {
        pub header: EntityHeader,
    }
    causeway_core::record!(command StatePassageCommand = "test.state_passage_command" {});

    pub const PASSED_STATE: &str = "passed";

    impl Command for StatePassageCommand {
        type State = String;
        type Output = String;

        fn events(&self, _ctx: &CommandContext<'_>) -> Result<EventStream<String>, CommandError> {
            Ok(EventStream::of(TestEvent::new("state")).set_state(PASSED_STATE.to_string()))
        }

        fn result(&self, state: Option<String>, _ctx: &CommandContext<'_>) -> Result<String, CommandError> {
            state.ok_or(CommandError::StateMismatch {
                expected: "String".to_string(),
            })
        }
    }

    /// Emits one event carrying an explicit timestamp.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct TimestampedEventCommand {
        pub header: EntityHeader,
        pub timestamp: HybridTimestamp,
    }
    causeway_core::record!(command TimestampedEventCommand = "test.timestamped_event_command" {
        timestamp: HybridTimestamp,
    });

    impl TimestampedEventCommand {
        pub fn new(timestamp: HybridTimestamp) -> Self {
            Self {
                header: EntityHeader::new(),
                timestamp,
            }
        }
    }

    impl Command for TimestampedEventCommand {
        type State = ();
        type Output = ();

        fn events(&self, _ctx: &CommandContext<'_>) -> Result<EventStream, CommandError> {
            Ok(EventStream::of(
                TestEvent::new("timestamped").with_timestamp(self.timestamp),
            ))
        }

        fn result(&self, _state: Option<()>, _ctx: &CommandContext<'_>) -> Result<(), CommandError> {
            Ok(())
        }
    }

    /// Sets the description of `reference`.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct ChangeDescription {
        pub header: EntityHeader,
        pub reference: Uuid,
        pub description: String,
    }
    causeway_core::record!(command ChangeDescription = "test.change_description" {
        reference: Uuid,
        description: String,
    });

    impl ChangeDescription {
        pub fn new(reference: Uuid, description: impl Into<String>) -> Self {
            Self {
                header: EntityHeader::new(),
                reference,
                description: description.into(),
            }
        }
    }

    impl Command for ChangeDescription {
        type State = ();
        type Output = ();

        fn events(&self, _ctx: &CommandContext<'_>) -> Result<EventStream, CommandError> {
            Ok(EventStream::of(DescriptionChanged {
                header: EntityHeader::new(),
                reference: self.reference,
                description: self.description.clone(),
            }))
        }

        fn result(&self, _state: Option<()>, _ctx: &CommandContext<'_>) -> Result<(), CommandError> {
            Ok(())
        }
    }

    /// Counts description changes of `reference` from inside command logic.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct CountDescriptions {
        pub header: EntityHeader,
        pub reference: Uuid,
    }
    causeway_core::record!(command CountDescriptions = "test.count_descriptions" { reference: Uuid });

    impl CountDescriptions {
        pub fn new(reference: Uuid) -> Self {
            Self {
                header: EntityHeader::new(),
                reference,
            }
        }
    }

    impl Command for CountDescriptions {
        type State = usize;
        type Output = usize;

        fn events(&self, ctx: &CommandContext<'_>) -> Result<EventStream<usize>, CommandError> {
            let reference = self.reference;
            let found = ctx
                .repository()
                .query::<DescriptionChanged>(|e| e.reference == reference)?;
            Ok(EventStream::with_state(found.len()))
        }

        fn result(&self, state: Option<usize>, _ctx: &CommandContext<'_>) -> Result<usize, CommandError> {
            Ok(state.unwrap_or(0))
        }
    }

    /// Never registered. Publishing it must be rejected.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct UnregisteredCommand {
        pub header: EntityHeader,
    }
    causeway_core::record!(command UnregisteredCommand = "test.unregistered_command" {});

    impl Command for UnregisteredCommand {
        type State = ();
        type Output = ();

        fn events(&self, _ctx: &CommandContext<'_>) -> Result<EventStream, CommandError> {
            Ok(EventStream::empty())
        }

        fn result(&self, _state: Option<()>, _ctx: &CommandContext<'_>) -> Result<(), CommandError> {
            Ok(())
        }
    }

    /// Latest description journaled for `reference`.
    pub fn description_of<R: RepositoryView + ?Sized>(
        repository: &R,
        reference: Uuid,
    ) -> CausewayResult<Option<String>> {
        let changes = repository.query::<DescriptionChanged>(|e| e.reference == reference)?;
        match changes.latest() {
            Some(handle) => Ok(Some(handle.get()?.description)),
            None => Ok(None),
        }
    }

    /// Every fixture type except [`UnregisteredCommand`].
    #[derive(Debug, Clone, Copy, Default)]
    pub struct TestEntities;

    impl EntitySetProvider for TestEntities {
        fn register(&self, registry: &SchemaRegistry) -> Result<Vec<Arc<Schema>>, StorageError> {
            Ok(vec![
                registry.register::<TestEvent>()?,
                registry.register::<DescriptionChanged>()?,
                registry.register::<RepositoryTestCommand>()?,
                registry.register::<EmitEvents>()?,
                registry.register::<LockCommand>()?,
                registry.register::<ExceptionalLockCommand>()?,
                registry.register::<ExceptionalCommand>()?,
                registry.register::<StreamExceptionCommand>()?,
                registry.register::<PanickingCommand>()?,
                registry.register::<StatePassageCommand>()?,
                registry.register::<TimestampedEventCommand>()?,
                registry.register::<ChangeDescription>()?,
                registry.register::<CountDescriptions>()?,
            ])
        }
    }

    /// Registry with the journal's derived events and every fixture type.
    pub fn fixture_registry() -> Result<Arc<SchemaRegistry>, StorageError> {
        let registry = SchemaRegistry::new();
        causeway_journal::register_builtin_events(&registry)?;
        registry.register_set(&TestEntities)?;
        Ok(Arc::new(registry))
    }

    /// Name of a fixture type, for log-friendly assertions.
    pub fn name_of<T: Record>() -> &'static str {
        T::NAME
    }
}

// ============================================================================
// RECORDERS
// ============================================================================

/// Journal listener that keeps everything it is told.
#[derive(Default)]
pub struct RecordingListener {
    pub states: Vec<Option<CommandState>>,
    pub events: Vec<Box<dyn Entity>>,
    pub commits: usize,
    pub aborts: Vec<JournalError>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_names(&self) -> Vec<&'static str> {
        self.events.iter().map(|e| e.type_name()).collect()
    }
}

impl JournalListener for RecordingListener {
    fn on_command_state(&mut self, state: Option<CommandState>) {
        self.states.push(state);
    }

    fn on_event(&mut self, event: &dyn Entity) {
        self.events.push(event.clone_entity());
    }

    fn on_commit(&mut self) {
        self.commits += 1;
    }

    fn on_abort(&mut self, error: &JournalError) {
        self.aborts.push(error.clone());
    }
}

type Predicate = Box<dyn Fn(&dyn Entity) -> bool + Send + Sync>;

/// Entity subscriber that records each delivery as a list of uuids.
pub struct RecordingSubscriber {
    predicate: Predicate,
    deliveries: Mutex<Vec<Vec<Uuid>>>,
    delivered: Condvar,
}

impl RecordingSubscriber {
    pub fn new(predicate: impl Fn(&dyn Entity) -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Box::new(predicate),
            deliveries: Mutex::new(Vec::new()),
            delivered: Condvar::new(),
        }
    }

    /// Matches every entity of record type `T`.
    pub fn of_type<T: Record>() -> Self {
        Self::new(|e| e.kind() == T::KIND && e.type_name() == T::NAME)
    }

    pub fn deliveries(&self) -> Vec<Vec<Uuid>> {
        self.deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Every delivered uuid, flattened in delivery order.
    pub fn received(&self) -> Vec<Uuid> {
        self.deliveries().into_iter().flatten().collect()
    }

    /// Block until at least `count` deliveries arrived or `timeout` passed.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut deliveries = self.deliveries.lock().unwrap_or_else(PoisonError::into_inner);
        while deliveries.len() < count {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            deliveries = self
                .delivered
                .wait_timeout(deliveries, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

impl EntitySubscriber for RecordingSubscriber {
    fn matches(&self, entity: &dyn Entity) -> bool {
        (self.predicate)(entity)
    }

    fn accept(&self, entities: EntityHandles) {
        let uuids = entities.map(|handle| handle.uuid()).collect();
        self.deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(uuids);
        self.delivered.notify_all();
    }
}

// ============================================================================
// JOURNAL HARNESS
// ============================================================================

struct JournalLookup(Arc<dyn Journal>);

impl EntityLookup for JournalLookup {
    fn lookup(&self, uuid: Uuid) -> Result<Option<Box<dyn Entity>>, StorageError> {
        self.0.lookup(uuid)
    }
}

/// Repository view backed directly by a journal.
pub struct JournalView {
    journal: Arc<dyn Journal>,
    time: Arc<ManualTimeProvider>,
    node_id: u16,
}

impl RepositoryView for JournalView {
    fn lookup(&self) -> Arc<dyn EntityLookup> {
        Arc::new(JournalLookup(Arc::clone(&self.journal)))
    }

    fn scan(&self, kind: EntityKind, name: &str) -> CausewayResult<Vec<Uuid>> {
        Ok(self.journal.entities(kind, name)?.map(|h| h.uuid()).collect())
    }

    fn timestamp(&self) -> HybridTimestamp {
        HybridTimestamp::now(&*self.time, self.node_id)
    }
}

/// Runs the journal protocol against a started journal, without a pipeline.
pub struct JournalHarness<J> {
    pub journal: Arc<J>,
    pub registry: Arc<SchemaRegistry>,
    pub time: Arc<ManualTimeProvider>,
    pub locks: Arc<LocalLockProvider>,
    pub node_id: u16,
}

impl<J: Journal + 'static> JournalHarness<J> {
    /// Start `journal` with the fixture registry and a manual clock at 1000ms.
    pub fn start(journal: J) -> Result<Self, StorageError> {
        let registry = fixtures::fixture_registry()?;
        let journal = Arc::new(journal);
        journal.start(Arc::clone(&registry))?;
        Ok(Self {
            journal,
            registry,
            time: Arc::new(ManualTimeProvider::new(1_000)),
            locks: Arc::new(LocalLockProvider::new()),
            node_id: 0,
        })
    }

    pub fn with_node_id(mut self, node_id: u16) -> Self {
        self.node_id = node_id;
        self
    }

    pub fn view(&self) -> JournalView {
        JournalView {
            journal: Arc::clone(&self.journal) as Arc<dyn Journal>,
            time: Arc::clone(&self.time),
            node_id: self.node_id,
        }
    }

    /// Journal `command` under a fresh tracking lock provider, releasing its
    /// locks afterwards.
    pub fn run(
        &self,
        command: &mut dyn AnyCommand,
        listener: &mut dyn JournalListener,
    ) -> Result<usize, JournalError> {
        let view = self.view();
        let tracking = TrackingLockProvider::new(Arc::clone(&self.locks) as Arc<dyn LockProvider>);
        let ctx = CommandContext::new(&view, &tracking, &*self.time);
        let outcome = self.journal.journal(command, listener, &ctx);
        tracking.release();
        outcome
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for clock and fixture values.

    use super::*;
    use proptest::prelude::*;

    /// Millisecond wall-clock readings well clear of the epoch.
    pub fn arb_physical_time() -> impl Strategy<Value = u64> {
        1_000u64..(1u64 << 42)
    }

    pub fn arb_timestamp() -> impl Strategy<Value = HybridTimestamp> {
        (arb_physical_time(), any::<u16>(), any::<u16>())
            .prop_map(|(physical, counter, node)| HybridTimestamp::new(physical, counter, node))
    }

    pub fn arb_description() -> impl Strategy<Value = String> {
        "[a-z][a-z ]{0,23}"
    }

    pub fn arb_event_count() -> impl Strategy<Value = u32> {
        0u32..12
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for causal ordering and failure reporting.

    use super::*;

    /// Assert every timestamp is strictly greater than the one before it.
    #[track_caller]
    pub fn assert_strictly_increasing(timestamps: &[HybridTimestamp]) {
        for pair in timestamps.windows(2) {
            assert!(
                pair[0] < pair[1],
                "Expected {} < {} in {:?}",
                pair[0],
                pair[1],
                timestamps
            );
        }
    }

    /// Assert `result` failed because command logic raised `class_name`.
    #[track_caller]
    pub fn assert_command_failed<T: std::fmt::Debug>(result: &CausewayResult<T>, class_name: &str) {
        match result {
            Err(error) => match error.command_error() {
                Some(cause) => assert_eq!(cause.class_name(), class_name),
                None => panic!("Expected command failure {class_name}, got: {error:?}"),
            },
            Ok(value) => panic!("Expected command failure {class_name}, got Ok({value:?})"),
        }
    }

    /// Assert a journal call failed because command logic raised `class_name`.
    #[track_caller]
    pub fn assert_journal_command_failed<T: std::fmt::Debug>(
        result: &Result<T, JournalError>,
        class_name: &str,
    ) {
        match result {
            Err(JournalError::Command { source, .. }) => assert_eq!(source.class_name(), class_name),
            other => panic!("Expected command failure {class_name}, got: {other:?}"),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use fixtures::*;
    use proptest::prelude::*;

    #[test]
    fn test_fixture_registry_holds_every_fixture() {
        let registry = fixture_registry().unwrap();
        assert!(registry.is_registered(name_of::<TestEvent>()));
        assert!(registry.is_registered(name_of::<CountDescriptions>()));
        assert!(!registry.is_registered(name_of::<UnregisteredCommand>()));
        assert_eq!(registry.events().len(), 4);
    }

    #[test]
    fn test_recording_subscriber_waits_for_deliveries() {
        let subscriber = Arc::new(RecordingSubscriber::of_type::<TestEvent>());
        assert!(subscriber.matches(&TestEvent::new("x")));
        assert!(!subscriber.matches(&ExceptionalCommand::default()));
        assert!(!subscriber.wait_for(1, Duration::from_millis(10)));

        struct Nothing;
        impl EntityLookup for Nothing {
            fn lookup(&self, _uuid: Uuid) -> Result<Option<Box<dyn Entity>>, StorageError> {
                Ok(None)
            }
        }

        let id = Uuid::now_v7();
        let remote = Arc::clone(&subscriber);
        let handle = std::thread::spawn(move || {
            remote.accept(EntityHandles::new(vec![id], Arc::new(Nothing)));
        });
        assert!(subscriber.wait_for(1, Duration::from_secs(5)));
        handle.join().unwrap();
        assert_eq!(subscriber.received(), vec![id]);
    }

    #[test]
    fn test_fixture_failure_class_names_the_type() {
        assert!(fixture_failure_class().ends_with("FixtureFailure"));
    }

    proptest! {
        #[test]
        fn prop_generated_timestamps_are_past_epoch(ts in generators::arb_timestamp()) {
            prop_assert!(ts.physical_time() >= 1_000);
        }
    }
}
