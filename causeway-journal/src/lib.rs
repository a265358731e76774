//! CAUSEWAY Journal - Contract and Transaction Protocol
//!
//! This crate defines the Journal trait storage backends implement, and the
//! protocol every backend shares for turning one command into one atomic
//! transaction:
//!
//! - the command's events, each causally timestamped after the command;
//! - one `EventCausalityEstablished` record per event;
//! - the command record itself.
//!
//! If anything fails, the transaction is rolled back and replaced by a single
//! `CommandTerminatedExceptionally` record.
//!
//! # Key Types
//!
//! - `Journal`: backend primitives plus the provided `journal` operation
//! - `Transaction`: buffered writes with commit/rollback
//! - `JournalListener`: observer of state, events, commit and abort
//! - `JournalCursor`: releasable cursor over stored entities

mod events;
mod journal;
pub mod protocol;

pub use events::{
    register_builtin_events, BuiltinEvents, CommandTerminatedExceptionally,
    EventCausalityEstablished,
};
pub use journal::{
    CursorSource, Journal, JournalCursor, JournalExt, JournalListener, NoopListener,
    SnapshotCursor, Transaction,
};
