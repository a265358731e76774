//! Three-stage command pipeline.
//!
//! ```text
//!  submit ─→ [claim slot] ─→ timestamp ─→ journal (N workers) ─→ complete (M workers) ─→ [free slot]
//!                           single thread   journal protocol,      evaluate result,
//!                           total causal    subscriber routing,    release locks,
//!                           order           clock merge            resolve future
//! ```
//!
//! Slots move between stages by index over crossbeam channels. Stopping drops
//! the submission sender; each stage drains and exits once its upstream is
//! gone, so every accepted command still reaches a terminal state.

use crate::completion::{CommandFuture, Pending, PendingCommand};
use crate::listener::PipelineListener;
use crate::ring::CommandRing;
use crate::view::RepositoryCore;
use causeway_core::{
    panic_message, CausewayError, Command, CommandContext, CommandError, CommandState, EntitySubscriber,
    JournalError, LockProvider, PhysicalTimeProvider, Record, RepositoryConfig,
    RepositoryError, RepositoryView, TrackingLockProvider,
};
use causeway_journal::Journal;
use crossbeam::channel::{bounded, Receiver, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

// ============================================================================
// STATS
// ============================================================================

/// Point-in-time pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub capacity: usize,
    pub available_slots: usize,
}

impl PipelineStats {
    /// Commands submitted and not yet resolved.
    pub fn in_flight(&self) -> u64 {
        self.submitted.saturating_sub(self.completed + self.failed)
    }
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

// ============================================================================
// PIPELINE
// ============================================================================

/// Everything the stage workers share.
struct Stages {
    ring: CommandRing,
    core: Arc<RepositoryCore>,
    journal: Arc<dyn Journal>,
    locks: Arc<dyn LockProvider>,
    time: Arc<dyn PhysicalTimeProvider>,
    counters: Counters,
}

pub struct CommandPipeline {
    stages: Arc<Stages>,
    config: RepositoryConfig,
    submit_tx: Mutex<Option<Sender<usize>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl CommandPipeline {
    /// Spawn the stage workers.
    pub fn start(
        config: RepositoryConfig,
        core: Arc<RepositoryCore>,
        journal: Arc<dyn Journal>,
        locks: Arc<dyn LockProvider>,
    ) -> Result<Self, RepositoryError> {
        let capacity = config.ring_capacity;
        let time = Arc::clone(
            core.clock()
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .provider(),
        );
        let stages = Arc::new(Stages {
            ring: CommandRing::new(capacity),
            core,
            journal,
            locks,
            time,
            counters: Counters::default(),
        });

        let (submit_tx, submit_rx) = bounded::<usize>(capacity);
        let (journal_tx, journal_rx) = bounded::<usize>(capacity);
        let (complete_tx, complete_rx) = bounded::<usize>(capacity);

        let mut workers = Vec::with_capacity(1 + config.journal_workers + config.completion_workers);

        let s = Arc::clone(&stages);
        workers.push(spawn("causeway-timestamp".to_string(), move || {
            timestamp_stage(&s, submit_rx, journal_tx)
        })?);

        for n in 0..config.journal_workers {
            let s = Arc::clone(&stages);
            let rx = journal_rx.clone();
            let tx = complete_tx.clone();
            workers.push(spawn(format!("causeway-journal-{n}"), move || {
                journal_stage(&s, rx, tx)
            })?);
        }
        drop(complete_tx);

        for n in 0..config.completion_workers {
            let s = Arc::clone(&stages);
            let rx = complete_rx.clone();
            workers.push(spawn(format!("causeway-complete-{n}"), move || {
                completion_stage(&s, rx)
            })?);
        }

        tracing::info!(
            capacity,
            journal_workers = config.journal_workers,
            completion_workers = config.completion_workers,
            backpressure = %config.backpressure,
            "Command pipeline started"
        );

        Ok(Self {
            stages,
            config,
            submit_tx: Mutex::new(Some(submit_tx)),
            workers: Mutex::new(workers),
            running: AtomicBool::new(true),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Accept `command`, blocking or refusing per the backpressure policy
    /// while the ring is full.
    pub fn submit<C: Command>(
        &self,
        mut command: C,
        subscribers: Vec<Arc<dyn EntitySubscriber>>,
    ) -> Result<CommandFuture<C::Output>, RepositoryError> {
        let submit_tx = self
            .submit_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(RepositoryError::NotRunning)?;

        let index = self
            .stages
            .ring
            .claim(self.config.backpressure, self.config.submit_timeout)?;

        let command_id = command.entity_header_mut().assign_uuid();
        let (sender, future) = CommandFuture::channel(command_id);
        {
            let mut slot = self.stages.ring.slot(index);
            slot.pending = Some(Box::new(Pending::new(command, sender)));
            slot.subscribers = subscribers;
        }

        if submit_tx.send(index).is_err() {
            // Stopped between cloning the sender and handing over the slot.
            self.stages.ring.release(index);
            return Err(RepositoryError::NotRunning);
        }
        self.stages.counters.submitted.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(command = %command_id, slot = index, kind = C::NAME, "Command submitted");
        Ok(future)
    }

    /// Stop accepting commands, drain everything in flight and join the workers.
    /// Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        drop(
            self.submit_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for worker in workers {
            if worker.join().is_err() {
                tracing::error!("Pipeline worker exited by panic");
            }
        }
        let stats = self.stats();
        tracing::info!(
            submitted = stats.submitted,
            completed = stats.completed,
            failed = stats.failed,
            "Command pipeline stopped"
        );
    }

    pub fn stats(&self) -> PipelineStats {
        let counters = &self.stages.counters;
        PipelineStats {
            submitted: counters.submitted.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            capacity: self.stages.ring.capacity(),
            available_slots: self.stages.ring.available(),
        }
    }
}

impl Drop for CommandPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn(
    name: String,
    f: impl FnOnce() + Send + 'static,
) -> Result<JoinHandle<()>, RepositoryError> {
    thread::Builder::new()
        .name(name)
        .spawn(f)
        .map_err(|e| RepositoryError::SpawnFailed {
            reason: e.to_string(),
        })
}

// ============================================================================
// STAGES
// ============================================================================

/// Stage 1. Sole writer of new command timestamps.
///
/// A panic while stamping fails that slot's command and moves on.
fn timestamp_stage(stages: &Stages, rx: Receiver<usize>, tx: Sender<usize>) {
    for index in rx {
        let stamped = catch_unwind(AssertUnwindSafe(|| stamp_slot(stages, index)));
        if let Err(payload) = stamped {
            let message = panic_message(&*payload);
            tracing::error!(slot = index, panic = %message, "Timestamping panicked");
            stages.ring.slot(index).failure = Some(CommandError::Panicked { message }.into());
        }
        tracing::trace!(slot = index, "Timestamped");
        if tx.send(index).is_err() {
            break;
        }
    }
}

fn stamp_slot(stages: &Stages, index: usize) {
    let mut slot = stages.ring.slot(index);
    if let Some(pending) = slot.pending.as_mut() {
        let header = pending.command_mut().header_mut();
        let mut clock = stages
            .core
            .clock()
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match header.timestamp() {
            Some(explicit) => {
                clock.update_from(&explicit);
            }
            None => {
                header.assign_timestamp(clock.update());
            }
        }
    }
}

/// Stage 2. Runs the journal protocol for one command at a time per worker.
fn journal_stage(stages: &Stages, rx: Receiver<usize>, tx: Sender<usize>) {
    for index in rx {
        let (pending, subscribers) = {
            let mut slot = stages.ring.slot(index);
            if slot.failure.is_some() {
                drop(slot);
                if tx.send(index).is_err() {
                    break;
                }
                continue;
            }
            (slot.pending.take(), std::mem::take(&mut slot.subscribers))
        };
        let Some(mut pending) = pending else {
            stages.ring.release(index);
            continue;
        };

        let locks = TrackingLockProvider::new(Arc::clone(&stages.locks));
        let (state, failure) = journal_one(stages, pending.as_mut(), &subscribers, &locks);

        {
            let mut slot = stages.ring.slot(index);
            slot.pending = Some(pending);
            slot.locks = Some(locks);
            slot.state = state;
            slot.failure = failure;
        }
        tracing::trace!(slot = index, "Journaled");
        if tx.send(index).is_err() {
            break;
        }
    }
}

fn journal_one(
    stages: &Stages,
    pending: &mut dyn PendingCommand,
    subscribers: &[Arc<dyn EntitySubscriber>],
    locks: &TrackingLockProvider,
) -> (Option<CommandState>, Option<CausewayError>) {
    let command = pending.command_mut();
    let command_id = command.header_mut().assign_uuid();
    let command_timestamp = command
        .header()
        .timestamp()
        .unwrap_or_else(|| stages.core.timestamp());

    let mut listener = PipelineListener::new(
        command.as_entity(),
        command_id,
        command_timestamp,
        subscribers,
        stages.core.lookup(),
        stages.core.clock(),
    );
    let ctx = CommandContext::new(stages.core.as_ref(), locks, stages.time.as_ref());

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        stages.journal.journal(command, &mut listener, &ctx)
    }))
    .unwrap_or_else(|payload| {
        Err(JournalError::Command {
            command_id,
            source: CommandError::Panicked {
                message: panic_message(&*payload),
            },
        })
    });

    match outcome {
        Ok(_) => (listener.take_state(), None),
        Err(error) => {
            if !listener.committed() {
                tracing::warn!(command = %command_id, error = %error, "Command left no journal record");
            }
            (None, Some(error.into()))
        }
    }
}

/// Stage 3. Computes results, releases locks, resolves futures.
fn completion_stage(stages: &Stages, rx: Receiver<usize>) {
    for index in rx {
        let (pending, locks, state, failure) = {
            let mut slot = stages.ring.slot(index);
            (
                slot.pending.take(),
                slot.locks.take(),
                slot.state.take(),
                slot.failure.take(),
            )
        };
        stages.ring.release(index);

        let Some(mut pending) = pending else {
            continue;
        };
        let locks =
            locks.unwrap_or_else(|| TrackingLockProvider::new(Arc::clone(&stages.locks)));

        // Counters move before the future resolves so waiters observe them.
        let succeeded = match failure {
            Some(error) => {
                locks.release();
                stages.counters.failed.fetch_add(1, Ordering::Relaxed);
                pending.fail(error);
                false
            }
            None => {
                let ctx = CommandContext::new(stages.core.as_ref(), &locks, stages.time.as_ref());
                let ok = pending.evaluate(state, &ctx);
                locks.release();
                let counter = if ok {
                    &stages.counters.completed
                } else {
                    &stages.counters.failed
                };
                counter.fetch_add(1, Ordering::Relaxed);
                pending.resolve();
                ok
            }
        };
        tracing::trace!(slot = index, succeeded, "Completed");
    }
}

