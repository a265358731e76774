//! CAUSEWAY Repository - Causal Command Pipeline
//!
//! Accepts commands, orders them with a hybrid logical clock, journals each
//! command with the events it produces in one transaction, routes committed
//! entities to subscribers and resolves the caller's future with the
//! command's result.
//!
//! ```text
//! Repository::publish ─→ CommandPipeline ─→ Journal ─→ EntitySubscriber
//!        ▲                                     │
//!        └──────────── query / get ◀───────────┘
//! ```

mod completion;
mod listener;
mod pipeline;
mod repository;
mod ring;
pub mod telemetry;
mod view;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use completion::CommandFuture;
pub use pipeline::{CommandPipeline, PipelineStats};
pub use repository::{Repository, RepositoryBuilder};
pub use view::RepositoryCore;

pub use causeway_core::*;
pub use causeway_journal::{
    CommandTerminatedExceptionally, EventCausalityEstablished, Journal, JournalExt, JournalListener,
};
pub use causeway_storage::MemoryJournal;
