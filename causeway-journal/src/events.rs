//! Events the journal derives on its own.

use causeway_core::{EntityHeader, EntitySetProvider, Schema, SchemaRegistry, StorageError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Links a journaled event to the command that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCausalityEstablished {
    header: EntityHeader,
    event: Uuid,
    command: Uuid,
}

causeway_core::record!(event EventCausalityEstablished = "causeway.event_causality_established" {
    event: Uuid,
    command: Uuid,
});

impl EventCausalityEstablished {
    pub fn new(event: Uuid, command: Uuid) -> Self {
        Self {
            header: EntityHeader::new(),
            event,
            command,
        }
    }

    pub fn event(&self) -> Uuid {
        self.event
    }

    pub fn command(&self) -> Uuid {
        self.command
    }
}

/// Journaled instead of a command's events when the command failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTerminatedExceptionally {
    header: EntityHeader,
    command_id: Uuid,
    class_name: String,
    message: String,
}

causeway_core::record!(event CommandTerminatedExceptionally = "causeway.command_terminated_exceptionally" {
    command_id: Uuid,
    class_name: String,
    message: String,
});

impl CommandTerminatedExceptionally {
    pub fn new(command_id: Uuid, class_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            header: EntityHeader::new(),
            command_id,
            class_name: class_name.into(),
            message: message.into(),
        }
    }

    pub fn command_id(&self) -> Uuid {
        self.command_id
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Registers the derived events every journal writes.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinEvents;

impl EntitySetProvider for BuiltinEvents {
    fn register(&self, registry: &SchemaRegistry) -> Result<Vec<Arc<Schema>>, StorageError> {
        Ok(vec![
            registry.register::<EventCausalityEstablished>()?,
            registry.register::<CommandTerminatedExceptionally>()?,
        ])
    }
}

pub fn register_builtin_events(registry: &SchemaRegistry) -> Result<Vec<Arc<Schema>>, StorageError> {
    registry.register_set(&BuiltinEvents)
}
