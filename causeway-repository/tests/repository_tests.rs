//! End-to-end repository behavior: publishing, subscribing, timestamping,
//! lock tracking, failure records and backpressure.

use causeway_core::{
    BackpressurePolicy, CausewayError, Command, CommandContext, CommandError, Entity,
    EntityHandles, EntityHeader, EntitySubscriber, EventStream, HybridTimestamp, JournalError,
    LocalLockProvider, PhysicalTimeProvider, Record, RepositoryConfig, RepositoryError,
    SystemTimeProvider,
};
use causeway_journal::{CommandTerminatedExceptionally, EventCausalityEstablished};
use causeway_repository::{MemoryJournal, Repository, RepositoryBuilder};
use causeway_test_utils::assertions::{assert_command_failed, assert_strictly_increasing};
use causeway_test_utils::fixtures::*;
use causeway_test_utils::RecordingSubscriber;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

fn config() -> RepositoryConfig {
    RepositoryConfig::default()
        .with_ring_capacity(64)
        .with_workers(2, 2)
}

fn builder() -> RepositoryBuilder {
    Repository::builder().config(config()).entities(TestEntities)
}

fn started() -> Repository {
    causeway_repository::telemetry::init_tracing();
    let repository = builder().build().unwrap();
    repository.start().unwrap();
    repository
}

fn failures_of(repository: &Repository, command_id: uuid::Uuid) -> Vec<CommandTerminatedExceptionally> {
    repository
        .query::<CommandTerminatedExceptionally>(|e| e.command_id() == command_id)
        .unwrap()
        .load()
        .unwrap()
}

// ============================================================================
// LIFECYCLE
// ============================================================================

#[test]
fn test_start_twice_is_rejected() {
    let repository = started();
    assert!(matches!(
        repository.start(),
        Err(CausewayError::Repository(RepositoryError::AlreadyRunning))
    ));
    repository.stop().unwrap();
}

#[test]
fn test_publish_after_stop_fails() {
    let repository = started();
    repository.stop().unwrap();
    assert!(!repository.is_running());
    assert!(matches!(
        repository.publish(RepositoryTestCommand::new("late")),
        Err(CausewayError::Repository(RepositoryError::NotRunning))
    ));
    // Stopping again is harmless.
    repository.stop().unwrap();
}

#[test]
fn test_invalid_config_fails_build() {
    let result = Repository::builder()
        .config(RepositoryConfig::default().with_ring_capacity(3))
        .build();
    assert!(matches!(result, Err(CausewayError::Config(_))));
}

#[test]
fn test_stop_drains_in_flight_commands() {
    let repository = started();
    let futures: Vec<_> = (0..32)
        .map(|n| repository.publish(RepositoryTestCommand::new(format!("c{n}"))).unwrap())
        .collect();
    repository.stop().unwrap();
    for future in futures {
        assert!(future.is_resolved());
        future.wait().unwrap();
    }
    // Reads still work once the pipeline is down.
    assert_eq!(repository.all::<RepositoryTestCommand>().unwrap().len(), 32);
}

// ============================================================================
// PUBLISHING
// ============================================================================

#[test]
fn test_basic_publish() {
    let repository = started();
    repository
        .publish(RepositoryTestCommand::new("hello"))
        .unwrap()
        .wait()
        .unwrap();

    let commands = repository.all::<RepositoryTestCommand>().unwrap();
    assert_eq!(commands.len(), 1);
    let events = repository.query::<TestEvent>(|e| e.string == "hello").unwrap();
    assert_eq!(events.len(), 1);
}

#[test]
fn test_stored_command_reads_back_equal() {
    let repository = started();
    let future = repository.publish(RepositoryTestCommand::new("layout")).unwrap();
    future.wait().unwrap();

    let stored = repository
        .get::<RepositoryTestCommand>(future.command_id())
        .get()
        .unwrap();
    assert_eq!(stored.value, "layout");
    assert_eq!(stored.header.uuid(), Some(future.command_id()));
    assert!(stored.header.timestamp().is_some());
}

#[test]
fn test_preassigned_uuid_is_kept() {
    let repository = started();
    let id = uuid::Uuid::now_v7();
    let future = repository
        .publish(RepositoryTestCommand::new("mine").with_uuid(id))
        .unwrap();
    assert_eq!(future.command_id(), id);
    future.wait().unwrap();
    assert!(repository.get::<RepositoryTestCommand>(id).get().is_ok());
}

#[test]
fn test_state_passage() {
    let repository = started();
    let output = repository
        .publish(StatePassageCommand::default())
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(output, PASSED_STATE);
}

#[test]
fn test_emitted_count_is_returned() {
    let repository = started();
    let count = repository.publish(EmitEvents::new(5)).unwrap().wait().unwrap();
    assert_eq!(count, 5);
    assert_eq!(repository.all::<TestEvent>().unwrap().len(), 5);
}

#[test]
fn test_causal_relationship() {
    let repository = started();
    let future = repository.publish(RepositoryTestCommand::new("cause")).unwrap();
    future.wait().unwrap();

    let event = repository
        .query::<TestEvent>(|e| e.string == "cause")
        .unwrap()
        .unique()
        .unwrap();
    let links = repository
        .query::<EventCausalityEstablished>(|e| e.command() == future.command_id())
        .unwrap()
        .load()
        .unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].event(), event.uuid());
}

// ============================================================================
// FAILURES
// ============================================================================

#[test]
fn test_exceptional_command() {
    let repository = started();
    let future = repository.publish(ExceptionalCommand::default()).unwrap();
    let result = future.wait();
    assert_command_failed(&result, &fixture_failure_class());

    let failures = failures_of(&repository, future.command_id());
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].class_name(), fixture_failure_class());
    assert_eq!(failures[0].message(), "deliberate failure");
    // The command itself is journaled with its failure record.
    assert!(repository
        .get::<ExceptionalCommand>(future.command_id())
        .get()
        .is_ok());
}

#[test]
fn test_stream_exception_rolls_back_events() {
    let repository = started();
    let future = repository.publish(StreamExceptionCommand::default()).unwrap();
    assert_command_failed(&future.wait(), &fixture_failure_class());

    assert!(repository
        .query::<TestEvent>(|e| e.string == "before failure")
        .unwrap()
        .is_empty());
    assert_eq!(failures_of(&repository, future.command_id()).len(), 1);
}

#[test]
fn test_panicking_command_fails_its_future_only() {
    let repository = started();
    let future = repository.publish(PanickingCommand::default()).unwrap();
    assert_command_failed(&future.wait(), "panic");

    // The pipeline keeps working.
    repository
        .publish(RepositoryTestCommand::new("after"))
        .unwrap()
        .wait()
        .unwrap();
    let stats = repository.stats().unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 1);
}

#[test]
fn test_lost_failure_record_fails_future_and_releases_locks() {
    let journal = Arc::new(MemoryJournal::new());
    let locks = Arc::new(LocalLockProvider::new());
    let repository = builder()
        .journal(journal.clone())
        .lock_provider(locks.clone())
        .build()
        .unwrap();
    repository.start().unwrap();
    // The primary attempt never commits, so the only commit is the failure record's.
    journal.fail_commits(1);

    let future = repository
        .publish(ExceptionalLockCommand::new("vault"))
        .unwrap();
    let result = future.wait();
    assert!(matches!(
        result,
        Err(CausewayError::Journal(JournalError::FailureRecordLost { .. }))
    ));
    assert_command_failed(&result, &fixture_failure_class());
    assert!(!locks.is_held("vault"));
    assert!(failures_of(&repository, future.command_id()).is_empty());

    repository
        .publish(RepositoryTestCommand::new("after loss"))
        .unwrap()
        .wait()
        .unwrap();
}

/// System time that panics on the first read after being armed.
#[derive(Default)]
struct ArmedTime {
    armed: AtomicBool,
}

impl PhysicalTimeProvider for ArmedTime {
    fn physical_time(&self) -> u64 {
        if self.armed.swap(false, Ordering::SeqCst) {
            panic!("time source failed");
        }
        SystemTimeProvider.physical_time()
    }
}

#[test]
fn test_timestamping_panic_fails_only_that_command() {
    let time = Arc::new(ArmedTime::default());
    let repository = builder().time_provider(time.clone()).build().unwrap();
    repository.start().unwrap();

    time.armed.store(true, Ordering::SeqCst);
    let future = repository.publish(RepositoryTestCommand::new("doomed")).unwrap();
    assert_command_failed(&future.wait(), "panic");
    assert!(repository
        .get::<RepositoryTestCommand>(future.command_id())
        .get()
        .is_err());

    assert!(repository.is_running());
    repository
        .publish(RepositoryTestCommand::new("survivor"))
        .unwrap()
        .wait()
        .unwrap();
    let stats = repository.stats().unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.available_slots, stats.capacity);
}

// ============================================================================
// TIMESTAMPS
// ============================================================================

#[test]
fn test_clock_passes_command_timestamp() {
    let repository = started();
    let future = repository.publish(RepositoryTestCommand::new("tick")).unwrap();
    future.wait().unwrap();

    let command = repository
        .get::<RepositoryTestCommand>(future.command_id())
        .get()
        .unwrap();
    let stamped = command.header.timestamp().unwrap();
    assert!(repository.timestamp() > stamped);
}

#[test]
fn test_command_and_event_timestamps_increase() {
    let repository = started();
    let future = repository.publish(EmitEvents::new(3)).unwrap();
    future.wait().unwrap();

    let command = repository.get::<EmitEvents>(future.command_id()).get().unwrap();
    let mut stamps = vec![command.header.timestamp().unwrap()];
    let mut events = repository.all::<TestEvent>().unwrap().load().unwrap();
    events.sort_by_key(|e| e.header.timestamp());
    stamps.extend(events.iter().filter_map(|e| e.header.timestamp()));
    assert_eq!(stamps.len(), 4);
    assert_strictly_increasing(&stamps);
}

#[test]
fn test_explicit_event_timestamp_is_kept() {
    let repository = started();
    let explicit = HybridTimestamp::new(42, 7, 0);
    repository
        .publish(TimestampedEventCommand::new(explicit))
        .unwrap()
        .wait()
        .unwrap();

    let event = repository
        .query::<TestEvent>(|e| e.string == "timestamped")
        .unwrap()
        .unique()
        .unwrap()
        .get()
        .unwrap();
    assert_eq!(event.header.timestamp(), Some(explicit));
}

#[test]
fn test_extreme_explicit_timestamp_does_not_wedge_pipeline() {
    let repository = started();
    let extreme = HybridTimestamp::new(u64::MAX, u16::MAX, 0);
    let future = repository
        .publish(RepositoryTestCommand::new("far future").with_timestamp(extreme))
        .unwrap();
    future.wait().unwrap();
    assert!(repository.timestamp() >= extreme);

    repository
        .publish(RepositoryTestCommand::new("next"))
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(repository.all::<RepositoryTestCommand>().unwrap().len(), 2);
}

#[test]
fn test_concurrent_publishers_get_distinct_timestamps() {
    let repository = Arc::new(started());
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let repository = Arc::clone(&repository);
            thread::spawn(move || {
                (0..25)
                    .map(|n| {
                        repository
                            .publish(RepositoryTestCommand::new(format!("{t}-{n}")))
                            .unwrap()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    for handle in handles {
        for future in handle.join().unwrap() {
            future.wait().unwrap();
        }
    }

    let mut stamps: Vec<_> = repository
        .all::<RepositoryTestCommand>()
        .unwrap()
        .load()
        .unwrap()
        .iter()
        .filter_map(|c| c.header.timestamp())
        .collect();
    assert_eq!(stamps.len(), 100);
    stamps.sort();
    assert_strictly_increasing(&stamps);
}

// ============================================================================
// QUERIES FROM COMMAND LOGIC
// ============================================================================

#[test]
fn test_description_protocol() {
    let repository = started();
    let reference = uuid::Uuid::now_v7();

    repository
        .publish(ChangeDescription::new(reference, "one"))
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(
        description_of(&repository, reference).unwrap().as_deref(),
        Some("one")
    );

    // Causally earlier than the first change, so it does not become the latest.
    let earlier = HybridTimestamp::new(1, 0, 0);
    repository
        .publish(ChangeDescription::new(reference, "two").with_timestamp(earlier))
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(
        description_of(&repository, reference).unwrap().as_deref(),
        Some("one")
    );

    let seen = repository
        .publish(CountDescriptions::new(reference))
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(seen, 2);
}

// ============================================================================
// LOCKS
// ============================================================================

#[test]
fn test_forgotten_lock_is_released() {
    let locks = Arc::new(LocalLockProvider::new());
    let repository = builder().lock_provider(locks.clone()).build().unwrap();
    repository.start().unwrap();

    repository.publish(LockCommand::new("account")).unwrap().wait().unwrap();
    assert!(!locks.is_held("account"));

    // A second command on the same key is not blocked.
    repository.publish(LockCommand::new("account")).unwrap().wait().unwrap();
    assert!(!locks.is_held("account"));
}

#[test]
fn test_lock_released_after_exceptional_command() {
    let locks = Arc::new(LocalLockProvider::new());
    let repository = builder().lock_provider(locks.clone()).build().unwrap();
    repository.start().unwrap();

    let result = repository
        .publish(ExceptionalLockCommand::new("ledger"))
        .unwrap()
        .wait();
    assert_command_failed(&result, &fixture_failure_class());
    assert!(!locks.is_held("ledger"));
}

// ============================================================================
// SUBSCRIBERS
// ============================================================================

#[test]
fn test_subscriber_receives_committed_entities() {
    let repository = started();
    let events = Arc::new(RecordingSubscriber::of_type::<TestEvent>());
    let commands = Arc::new(RecordingSubscriber::of_type::<RepositoryTestCommand>());
    repository.add_entity_subscriber(events.clone());
    repository.add_entity_subscriber(commands.clone());

    let future = repository.publish(RepositoryTestCommand::new("seen")).unwrap();
    future.wait().unwrap();

    assert_eq!(events.received().len(), 1);
    assert_eq!(commands.received(), vec![future.command_id()]);
}

#[test]
fn test_typed_subscription() {
    let repository = started();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    repository.subscribe::<TestEvent, _>(move |handles| {
        let mut seen = sink.lock().unwrap();
        for handle in handles {
            seen.push(handle.get().unwrap().string);
        }
    });

    repository.publish(EmitEvents::new(2)).unwrap().wait().unwrap();
    let mut seen = seen.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, vec!["event-0", "event-1"]);
}

#[test]
fn test_failed_command_events_are_not_delivered() {
    let repository = started();
    let events = Arc::new(RecordingSubscriber::of_type::<TestEvent>());
    let failures = Arc::new(RecordingSubscriber::of_type::<CommandTerminatedExceptionally>());
    repository.add_entity_subscriber(events.clone());
    repository.add_entity_subscriber(failures.clone());

    let future = repository.publish(StreamExceptionCommand::default()).unwrap();
    assert!(future.wait().is_err());

    assert!(events.received().is_empty());
    assert_eq!(failures.received().len(), 1);
}

#[test]
fn test_late_subscriber_misses_earlier_commands() {
    let repository = started();
    repository
        .publish(RepositoryTestCommand::new("before"))
        .unwrap()
        .wait()
        .unwrap();

    let events = Arc::new(RecordingSubscriber::of_type::<TestEvent>());
    repository.add_entity_subscriber(events.clone());
    repository
        .publish(RepositoryTestCommand::new("after"))
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(events.received().len(), 1);
}

// ============================================================================
// REGISTRATION
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Impostor {
    header: EntityHeader,
}
causeway_core::record!(command Impostor = "test.test_event" {});

impl Command for Impostor {
    type State = ();
    type Output = ();

    fn events(&self, _ctx: &CommandContext<'_>) -> Result<EventStream, CommandError> {
        Ok(EventStream::empty())
    }

    fn result(&self, _state: Option<()>, _ctx: &CommandContext<'_>) -> Result<(), CommandError> {
        Ok(())
    }
}

#[test]
fn test_unregistered_command_is_rejected() {
    let repository = started();
    assert!(matches!(
        repository.publish(UnregisteredCommand::default()),
        Err(CausewayError::Repository(RepositoryError::UnregisteredType { .. }))
    ));
}

#[test]
fn test_event_name_cannot_be_published() {
    let repository = started();
    assert!(matches!(
        repository.publish(Impostor::default()),
        Err(CausewayError::Repository(RepositoryError::WrongKind { .. }))
    ));
}

#[test]
fn test_register_while_running() {
    let repository = started();
    repository.register::<UnregisteredCommand>().unwrap();
    repository
        .publish(UnregisteredCommand::default())
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(repository.all::<UnregisteredCommand>().unwrap().len(), 1);
}

#[test]
fn test_registry_lists_fixture_types() {
    let repository = builder().build().unwrap();
    let commands: Vec<_> = repository.commands().iter().map(|s| s.name()).collect();
    assert!(commands.contains(&RepositoryTestCommand::NAME));
    let events: Vec<_> = repository.events().iter().map(|s| s.name()).collect();
    assert!(events.contains(&TestEvent::NAME));
    assert!(events.contains(&EventCausalityEstablished::NAME));
}

// ============================================================================
// BACKPRESSURE
// ============================================================================

/// Holds the journaling worker inside delivery until the gate opens.
struct Gate {
    open: crossbeam::channel::Receiver<()>,
}

impl EntitySubscriber for Gate {
    fn matches(&self, entity: &dyn Entity) -> bool {
        entity.type_name() == TestEvent::NAME
    }

    fn accept(&self, _entities: EntityHandles) {
        let _ = self.open.recv_timeout(Duration::from_secs(5));
    }
}

#[test]
fn test_reject_when_ring_is_full() {
    let repository = Repository::builder()
        .config(
            RepositoryConfig::default()
                .with_ring_capacity(1)
                .with_workers(1, 1)
                .with_backpressure(BackpressurePolicy::Reject),
        )
        .entities(TestEntities)
        .build()
        .unwrap();
    repository.start().unwrap();
    let (open, gate) = crossbeam::channel::bounded::<()>(0);
    repository.add_entity_subscriber(Arc::new(Gate { open: gate }));

    let first = repository.publish(RepositoryTestCommand::new("held")).unwrap();
    assert!(matches!(
        repository.publish(RepositoryTestCommand::new("refused")),
        Err(CausewayError::Repository(RepositoryError::PipelineFull { capacity: 1 }))
    ));

    drop(open);
    first.wait().unwrap();
    repository
        .publish(RepositoryTestCommand::new("accepted"))
        .unwrap();
}

#[test]
fn test_block_with_timeout_when_ring_is_full() {
    let repository = Repository::builder()
        .config(
            RepositoryConfig::default()
                .with_ring_capacity(1)
                .with_workers(1, 1)
                .with_submit_timeout(Duration::from_millis(50)),
        )
        .entities(TestEntities)
        .build()
        .unwrap();
    repository.start().unwrap();
    let (open, gate) = crossbeam::channel::bounded::<()>(0);
    repository.add_entity_subscriber(Arc::new(Gate { open: gate }));

    let first = repository.publish(RepositoryTestCommand::new("held")).unwrap();
    assert!(matches!(
        repository.publish(RepositoryTestCommand::new("late")),
        Err(CausewayError::Repository(RepositoryError::SubmitTimeout { .. }))
    ));
    drop(open);
    first.wait().unwrap();
}

// ============================================================================
// ASYNC
// ============================================================================

#[tokio::test]
async fn test_future_can_be_awaited() {
    let repository = started();
    let count = repository.publish(EmitEvents::new(2)).unwrap().await.unwrap();
    assert_eq!(count, 2);
}
