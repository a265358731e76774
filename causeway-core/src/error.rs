//! Error types for CAUSEWAY operations

use crate::TypeHash;
use std::any::type_name;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Journal not started")]
    NotStarted,

    #[error("No schema registered for type hash {hash}")]
    UnknownSchema { hash: TypeHash },

    #[error("Layout conflict for {name}: registered {registered}, offered {offered}")]
    LayoutConflict {
        name: String,
        registered: TypeHash,
        offered: TypeHash,
    },

    #[error("Type not registered: {name}")]
    UnregisteredType { name: String },

    #[error("Encoding {name} failed: {reason}")]
    EncodeFailed { name: String, reason: String },

    #[error("Decoding {name} failed: {reason}")]
    DecodeFailed { name: String, reason: String },

    #[error("Entity {id} already journaled")]
    DuplicateEntity { id: Uuid },

    #[error("Entity not found: {id}")]
    NotFound { id: Uuid },

    #[error("Type mismatch for {id}: expected {expected}, found {found}")]
    TypeMismatch {
        id: Uuid,
        expected: String,
        found: String,
    },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Lock provider errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("Timed out acquiring lock {key} after {waited_ms}ms")]
    Timeout { key: String, waited_ms: u64 },

    #[error("Lock table poisoned")]
    Poisoned,
}

/// Failures raised by command logic while producing events or computing a result.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("{class_name}: {message}")]
    Raised { class_name: String, message: String },

    #[error("Lock failure: {0}")]
    Lock(#[from] LockError),

    #[error("Command panicked: {message}")]
    Panicked { message: String },

    #[error("Intermediate state was not a {expected}")]
    StateMismatch { expected: String },

    #[error("Query failed: {reason}")]
    QueryFailed { reason: String },
}

impl CommandError {
    /// Capture an arbitrary error, recording its type name as the failure class.
    pub fn raise<E: fmt::Display>(error: E) -> Self {
        CommandError::Raised {
            class_name: type_name::<E>().to_string(),
            message: error.to_string(),
        }
    }

    pub fn new(class_name: impl Into<String>, message: impl Into<String>) -> Self {
        CommandError::Raised {
            class_name: class_name.into(),
            message: message.into(),
        }
    }

    /// Name of the failure class recorded in `CommandTerminatedExceptionally`.
    pub fn class_name(&self) -> String {
        match self {
            CommandError::Raised { class_name, .. } => class_name.clone(),
            CommandError::Lock(_) => type_name::<LockError>().to_string(),
            CommandError::Panicked { .. } => "panic".to_string(),
            CommandError::StateMismatch { .. } | CommandError::QueryFailed { .. } => {
                type_name::<CommandError>().to_string()
            }
        }
    }

    /// Human readable failure message, without the class prefix.
    pub fn message(&self) -> String {
        match self {
            CommandError::Raised { message, .. } | CommandError::Panicked { message } => {
                message.clone()
            }
            other => other.to_string(),
        }
    }
}

impl From<CausewayError> for CommandError {
    fn from(error: CausewayError) -> Self {
        CommandError::QueryFailed {
            reason: error.to_string(),
        }
    }
}

impl From<StorageError> for CommandError {
    fn from(error: StorageError) -> Self {
        CommandError::QueryFailed {
            reason: error.to_string(),
        }
    }
}

/// Journal protocol errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JournalError {
    #[error("Command {command_id} failed: {source}")]
    Command {
        command_id: Uuid,
        source: CommandError,
    },

    #[error("Journal storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("Failure record for command {command_id} could not be journaled: {cause} (original failure: {original})")]
    FailureRecordLost {
        command_id: Uuid,
        original: Box<JournalError>,
        cause: Box<JournalError>,
    },
}

impl JournalError {
    /// The command failure behind this error, if command logic caused it.
    pub fn command_error(&self) -> Option<&CommandError> {
        match self {
            JournalError::Command { source, .. } => Some(source),
            JournalError::FailureRecordLost { original, .. } => original.command_error(),
            JournalError::Storage(_) => None,
        }
    }

    /// Failure class recorded when this error terminates a command.
    pub fn class_name(&self) -> String {
        match self {
            JournalError::Command { source, .. } => source.class_name(),
            JournalError::Storage(_) => type_name::<StorageError>().to_string(),
            JournalError::FailureRecordLost { original, .. } => original.class_name(),
        }
    }

    pub fn message(&self) -> String {
        match self {
            JournalError::Command { source, .. } => source.message(),
            JournalError::Storage(e) => e.to_string(),
            JournalError::FailureRecordLost { original, .. } => original.message(),
        }
    }
}

/// Repository and pipeline lifecycle errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("Repository is not running")]
    NotRunning,

    #[error("Repository is already running")]
    AlreadyRunning,

    #[error("Command pipeline full ({capacity} slots in flight)")]
    PipelineFull { capacity: usize },

    #[error("Timed out after {waited_ms}ms waiting for a pipeline slot")]
    SubmitTimeout { waited_ms: u64 },

    #[error("Command {command_id} was abandoned before completion")]
    CommandAbandoned { command_id: Uuid },

    #[error("Type not registered with the repository: {name}")]
    UnregisteredType { name: String },

    #[error("{name} is registered as a {actual}, not a {expected}")]
    WrongKind {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Expected exactly one {name}, found {found}")]
    NotUnique { name: String, found: usize },

    #[error("Worker thread could not be spawned: {reason}")]
    SpawnFailed { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },
}

/// Master error type for all CAUSEWAY errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CausewayError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl CausewayError {
    /// The command failure behind this error, looking through journal wrapping.
    pub fn command_error(&self) -> Option<&CommandError> {
        match self {
            CausewayError::Command(e) => Some(e),
            CausewayError::Journal(e) => e.command_error(),
            _ => None,
        }
    }
}

/// Result type alias for CAUSEWAY operations.
pub type CausewayResult<T> = Result<T, CausewayError>;

// =============================================================================
// TESTS
// =============================================================================
