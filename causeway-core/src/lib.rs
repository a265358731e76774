//! CAUSEWAY Core - Entity, Clock and Command Types
//!
//! Leaf crate of the workspace. Defines what flows through the command
//! pipeline (commands, events, their headers and schemas), the hybrid logical
//! clock that orders them, the lock discipline commands run under, and the
//! error taxonomy every other crate reports through.

mod command;
mod config;
mod entity;
mod error;
mod hlc;
mod lock;
mod schema;
mod subscriber;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use command::{
    catch_panic, panic_message, AnyCommand, Command, CommandContext, CommandState, EventIter,
    EventResult, EventStream, RepositoryView, RepositoryViewExt, ResultSet,
};
pub use config::{BackpressurePolicy, RepositoryConfig};
pub use entity::{
    downcast_entity, AnyEntityHandle, Entity, EntityHandle, EntityHeader, EntityKind,
    EntityLookup, Event, FieldDescriptor, Record,
};
pub use error::{
    CausewayError, CausewayResult, CommandError, ConfigError, JournalError, LockError,
    RepositoryError, StorageError,
};
pub use hlc::{
    HybridClock, HybridTimestamp, ManualTimeProvider, PhysicalTimeProvider, SystemTimeProvider,
};
pub use lock::{LocalLockProvider, Lock, LockProvider, TrackingLockProvider};
pub use schema::{EntitySetProvider, LayoutInfo, PropertyInfo, Schema, SchemaRegistry, TypeHash};
pub use subscriber::{EntityHandles, EntitySubscriber, TypeSubscriber};

// Re-exported so `record!` users and downstream crates agree on versions.
pub use uuid::Uuid;
