//! Journal listener used by the journaling stage.
//!
//! Routes written entities to matching subscribers, holds deliveries back
//! until commit, and folds the transaction's timestamps into the pipeline
//! clock afterwards.

use causeway_core::{
    panic_message, CommandState, Entity, EntityHandles, EntityLookup, EntitySubscriber,
    HybridClock, HybridTimestamp, JournalError,
};
use causeway_journal::JournalListener;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

pub(crate) struct PipelineListener<'a> {
    subscribers: &'a [Arc<dyn EntitySubscriber>],
    lookup: Arc<dyn EntityLookup>,
    clock: &'a Mutex<HybridClock>,
    command_id: Uuid,
    command_timestamp: HybridTimestamp,
    command_matches: Vec<bool>,
    event_matches: Vec<Vec<Uuid>>,
    latest: HybridTimestamp,
    state: Option<CommandState>,
    committed: bool,
}

impl<'a> PipelineListener<'a> {
    /// `command` must already carry its uuid and timestamp.
    pub fn new(
        command: &dyn Entity,
        command_id: Uuid,
        command_timestamp: HybridTimestamp,
        subscribers: &'a [Arc<dyn EntitySubscriber>],
        lookup: Arc<dyn EntityLookup>,
        clock: &'a Mutex<HybridClock>,
    ) -> Self {
        let command_matches = subscribers
            .iter()
            .map(|subscriber| guarded_match(subscriber.as_ref(), command))
            .collect();
        Self {
            subscribers,
            lookup,
            clock,
            command_id,
            command_timestamp,
            command_matches,
            event_matches: vec![Vec::new(); subscribers.len()],
            latest: command_timestamp,
            state: None,
            committed: false,
        }
    }

    pub fn take_state(&mut self) -> Option<CommandState> {
        self.state.take()
    }

    pub fn committed(&self) -> bool {
        self.committed
    }

    fn deliver(&mut self) {
        for (index, subscriber) in self.subscribers.iter().enumerate() {
            let mut uuids = std::mem::take(&mut self.event_matches[index]);
            if self.command_matches[index] {
                uuids.push(self.command_id);
            }
            if uuids.is_empty() {
                continue;
            }
            let handles = EntityHandles::new(uuids, Arc::clone(&self.lookup));
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| subscriber.accept(handles))) {
                tracing::error!(
                    command = %self.command_id,
                    panic = %panic_message(&*payload),
                    "Entity subscriber panicked"
                );
            }
        }
    }
}

fn guarded_match(subscriber: &dyn EntitySubscriber, entity: &dyn Entity) -> bool {
    match catch_unwind(AssertUnwindSafe(|| subscriber.matches(entity))) {
        Ok(matched) => matched,
        Err(payload) => {
            tracing::error!(
                entity = entity.type_name(),
                panic = %panic_message(&*payload),
                "Entity subscriber predicate panicked"
            );
            false
        }
    }
}

impl JournalListener for PipelineListener<'_> {
    fn on_command_state(&mut self, state: Option<CommandState>) {
        self.state = state;
    }

    fn on_event(&mut self, event: &dyn Entity) {
        if let Some(uuid) = event.uuid() {
            for (index, subscriber) in self.subscribers.iter().enumerate() {
                if guarded_match(subscriber.as_ref(), event) {
                    self.event_matches[index].push(uuid);
                }
            }
        }
        if let Some(timestamp) = event.timestamp() {
            self.latest = self.latest.max(timestamp);
        }
    }

    fn on_commit(&mut self) {
        self.committed = true;
        self.deliver();
        let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
        let now = clock.update_from(&self.latest);
        tracing::trace!(command = %self.command_id, clock = %now, "Transaction committed");
    }

    fn on_abort(&mut self, error: &JournalError) {
        for matches in &mut self.event_matches {
            matches.clear();
        }
        self.latest = self.command_timestamp;
        tracing::trace!(command = %self.command_id, error = %error, "Transaction aborted");
    }
}
