//! Fixed ring of reusable command slots.
//!
//! Slots are identified by index. Free indices live in a bounded channel:
//! claiming a slot receives an index, releasing it sends the index back.
//! Stages hand slots to each other by index only.

use crate::completion::PendingCommand;
use causeway_core::{
    BackpressurePolicy, CausewayError, CommandState, EntitySubscriber, RepositoryError,
    TrackingLockProvider,
};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Per-command working state while it moves through the stages.
#[derive(Default)]
pub(crate) struct Slot {
    pub pending: Option<Box<dyn PendingCommand>>,
    /// Subscribers active when the command was submitted.
    pub subscribers: Vec<Arc<dyn EntitySubscriber>>,
    pub locks: Option<TrackingLockProvider>,
    pub state: Option<CommandState>,
    pub failure: Option<CausewayError>,
}

pub(crate) struct CommandRing {
    slots: Box<[Mutex<Slot>]>,
    free_tx: Sender<usize>,
    free_rx: Receiver<usize>,
}

impl CommandRing {
    pub fn new(capacity: usize) -> Self {
        let (free_tx, free_rx) = bounded(capacity);
        for index in 0..capacity {
            // Cannot fail: the channel holds exactly `capacity` indices.
            let _ = free_tx.send(index);
        }
        Self {
            slots: (0..capacity).map(|_| Mutex::new(Slot::default())).collect(),
            free_tx,
            free_rx,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slots not currently claimed.
    pub fn available(&self) -> usize {
        self.free_rx.len()
    }

    /// Claim a free slot according to `policy`.
    pub fn claim(
        &self,
        policy: BackpressurePolicy,
        timeout: Option<Duration>,
    ) -> Result<usize, RepositoryError> {
        match (policy, timeout) {
            (BackpressurePolicy::Reject, _) => self.free_rx.try_recv().map_err(|e| match e {
                TryRecvError::Empty | TryRecvError::Disconnected => RepositoryError::PipelineFull {
                    capacity: self.capacity(),
                },
            }),
            (BackpressurePolicy::Block, Some(timeout)) => {
                let started = Instant::now();
                self.free_rx.recv_timeout(timeout).map_err(|e| match e {
                    RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected => {
                        RepositoryError::SubmitTimeout {
                            waited_ms: started.elapsed().as_millis() as u64,
                        }
                    }
                })
            }
            (BackpressurePolicy::Block, None) => {
                self.free_rx.recv().map_err(|_| RepositoryError::NotRunning)
            }
        }
    }

    pub fn slot(&self, index: usize) -> MutexGuard<'_, Slot> {
        self.slots[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Clear the slot and return it to the free list.
    pub fn release(&self, index: usize) {
        *self.slot(index) = Slot::default();
        let _ = self.free_tx.send(index);
    }
}
