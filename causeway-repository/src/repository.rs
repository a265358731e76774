//! Repository facade.

use crate::completion::CommandFuture;
use crate::pipeline::{CommandPipeline, PipelineStats};
use crate::view::RepositoryCore;
use causeway_core::{
    CausewayResult, Command, EntityHandle, EntityKind, EntityLookup, EntitySetProvider,
    EntitySubscriber, HybridClock, HybridTimestamp, LocalLockProvider, LockProvider,
    PhysicalTimeProvider, Record, RepositoryConfig, RepositoryError, RepositoryView,
    RepositoryViewExt, ResultSet, Schema, SchemaRegistry, SystemTimeProvider, TypeHash,
    TypeSubscriber,
};
use causeway_journal::{register_builtin_events, Journal};
use causeway_storage::MemoryJournal;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use uuid::Uuid;

// ============================================================================
// BUILDER
// ============================================================================

/// Assembles a [`Repository`].
///
/// Anything left unset falls back to a default: an in-memory journal, a local
/// lock provider honoring `lock_timeout`, and the system clock.
#[derive(Default)]
pub struct RepositoryBuilder {
    config: Option<RepositoryConfig>,
    journal: Option<Arc<dyn Journal>>,
    lock_provider: Option<Arc<dyn LockProvider>>,
    time: Option<Arc<dyn PhysicalTimeProvider>>,
    sets: Vec<Box<dyn EntitySetProvider>>,
}

impl RepositoryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: RepositoryConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn journal(mut self, journal: Arc<dyn Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn lock_provider(mut self, provider: Arc<dyn LockProvider>) -> Self {
        self.lock_provider = Some(provider);
        self
    }

    pub fn time_provider(mut self, time: Arc<dyn PhysicalTimeProvider>) -> Self {
        self.time = Some(time);
        self
    }

    /// Register a set of command and event types at build time.
    pub fn entities(mut self, set: impl EntitySetProvider + 'static) -> Self {
        self.sets.push(Box::new(set));
        self
    }

    pub fn build(self) -> CausewayResult<Repository> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let registry = Arc::new(SchemaRegistry::new());
        register_builtin_events(&registry)?;
        for set in &self.sets {
            registry.register_set(set.as_ref())?;
        }

        let journal: Arc<dyn Journal> = match self.journal {
            Some(journal) => journal,
            None => Arc::new(MemoryJournal::new()),
        };
        let lock_provider: Arc<dyn LockProvider> = match (self.lock_provider, config.lock_timeout) {
            (Some(provider), _) => provider,
            (None, Some(timeout)) => Arc::new(LocalLockProvider::with_timeout(timeout)),
            (None, None) => Arc::new(LocalLockProvider::new()),
        };
        let time: Arc<dyn PhysicalTimeProvider> = match self.time {
            Some(time) => time,
            None => Arc::new(SystemTimeProvider),
        };
        let clock = Arc::new(Mutex::new(HybridClock::with_node_id(time, config.node_id)));
        let core = Arc::new(RepositoryCore::new(Arc::clone(&journal), clock));

        Ok(Repository {
            config,
            registry,
            journal,
            lock_provider,
            core,
            subscribers: RwLock::new(Vec::new()),
            pipeline: Mutex::new(None),
        })
    }
}

// ============================================================================
// REPOSITORY
// ============================================================================

/// Event-sourcing repository: publishes commands through the pipeline and
/// answers queries from the journal.
///
/// # Example
///
/// ```rust,ignore
/// let repository = Repository::builder().entities(Accounts).build()?;
/// repository.start()?;
/// let opened = repository.publish(OpenAccount::new("alice"))?.wait()?;
/// let accounts = repository.query::<AccountOpened>(|e| e.owner == "alice")?;
/// repository.stop()?;
/// ```
pub struct Repository {
    config: RepositoryConfig,
    registry: Arc<SchemaRegistry>,
    journal: Arc<dyn Journal>,
    lock_provider: Arc<dyn LockProvider>,
    core: Arc<RepositoryCore>,
    subscribers: RwLock<Vec<Arc<dyn EntitySubscriber>>>,
    pipeline: Mutex<Option<Arc<CommandPipeline>>>,
}

impl Repository {
    pub fn builder() -> RepositoryBuilder {
        RepositoryBuilder::new()
    }

    // === Lifecycle ===

    /// Start the journal, then the pipeline.
    pub fn start(&self) -> CausewayResult<()> {
        let mut pipeline = self.pipeline.lock().unwrap_or_else(PoisonError::into_inner);
        if pipeline.is_some() {
            return Err(RepositoryError::AlreadyRunning.into());
        }
        self.journal.start(Arc::clone(&self.registry))?;
        let started = CommandPipeline::start(
            self.config.clone(),
            Arc::clone(&self.core),
            Arc::clone(&self.journal),
            Arc::clone(&self.lock_provider),
        )?;
        *pipeline = Some(Arc::new(started));
        tracing::info!(
            commands = self.registry.commands().len(),
            events = self.registry.events().len(),
            "Repository started"
        );
        Ok(())
    }

    /// Drain the pipeline, then stop the journal. Stopping twice is a no-op.
    pub fn stop(&self) -> CausewayResult<()> {
        let pipeline = self
            .pipeline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(pipeline) = pipeline else {
            return Ok(());
        };
        pipeline.stop();
        self.journal.stop()?;
        tracing::info!("Repository stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.pipeline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn running_pipeline(&self) -> Result<Arc<CommandPipeline>, RepositoryError> {
        self.pipeline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(RepositoryError::NotRunning)
    }

    // === Commands ===

    /// Submit `command` for execution. Its uuid is assigned here if absent.
    ///
    /// The future resolves with the command's result once its transaction
    /// committed, or with the failure that terminated it.
    pub fn publish<C: Command>(&self, command: C) -> CausewayResult<CommandFuture<C::Output>> {
        let unregistered = || RepositoryError::UnregisteredType {
            name: C::NAME.to_string(),
        };
        let schema = self.registry.by_name(C::NAME).ok_or_else(unregistered)?;
        if schema.kind() != EntityKind::Command {
            return Err(RepositoryError::WrongKind {
                name: C::NAME.to_string(),
                expected: EntityKind::Command.to_string(),
                actual: schema.kind().to_string(),
            }
            .into());
        }
        if schema.hash() != TypeHash::of_record::<C>() {
            return Err(unregistered().into());
        }

        let pipeline = self.running_pipeline()?;
        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Ok(pipeline.submit(command, subscribers)?)
    }

    // === Queries ===

    /// Every journaled `T` satisfying `predicate`, in storage order.
    pub fn query<T: Record>(&self, predicate: impl Fn(&T) -> bool) -> CausewayResult<ResultSet<T>> {
        self.core.query(predicate)
    }

    pub fn all<T: Record>(&self) -> CausewayResult<ResultSet<T>> {
        self.core.all()
    }

    /// Handle to any journaled entity.
    pub fn get<T: Record>(&self, uuid: Uuid) -> EntityHandle<T> {
        EntityHandle::new(uuid, self.core.lookup())
    }

    // === Subscribers ===

    /// Subscribers apply to commands published after this call.
    pub fn add_entity_subscriber(&self, subscriber: Arc<dyn EntitySubscriber>) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(subscriber);
    }

    /// Subscribe `sink` to every committed `T`.
    pub fn subscribe<T, F>(&self, sink: F)
    where
        T: Record,
        F: Fn(Vec<EntityHandle<T>>) + Send + Sync + 'static,
    {
        self.add_entity_subscriber(Arc::new(TypeSubscriber::<T, F>::new(sink)));
    }

    // === Schemas ===

    /// Register one type, announcing it to the journal if already running.
    pub fn register<T: Record>(&self) -> CausewayResult<Arc<Schema>> {
        let schema = self.registry.register::<T>()?;
        if self.is_running() {
            self.journal.on_schemas_added(&[Arc::clone(&schema)])?;
        }
        Ok(schema)
    }

    pub fn register_set(&self, set: &dyn EntitySetProvider) -> CausewayResult<Vec<Arc<Schema>>> {
        let schemas = self.registry.register_set(set)?;
        if self.is_running() {
            self.journal.on_schemas_added(&schemas)?;
        }
        Ok(schemas)
    }

    pub fn commands(&self) -> Vec<Arc<Schema>> {
        self.registry.commands()
    }

    pub fn events(&self) -> Vec<Arc<Schema>> {
        self.registry.events()
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    // === Accessors ===

    /// Current pipeline clock. Never decreases.
    pub fn timestamp(&self) -> HybridTimestamp {
        self.core.timestamp()
    }

    pub fn journal(&self) -> &Arc<dyn Journal> {
        &self.journal
    }

    pub fn lock_provider(&self) -> &Arc<dyn LockProvider> {
        &self.lock_provider
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    /// Pipeline counters, if running.
    pub fn stats(&self) -> Option<PipelineStats> {
        self.running_pipeline().ok().map(|pipeline| pipeline.stats())
    }
}

impl RepositoryView for Repository {
    fn lookup(&self) -> Arc<dyn EntityLookup> {
        self.core.lookup()
    }

    fn scan(&self, kind: EntityKind, name: &str) -> CausewayResult<Vec<Uuid>> {
        self.core.scan(kind, name)
    }

    fn timestamp(&self) -> HybridTimestamp {
        self.core.timestamp()
    }
}

impl Drop for Repository {
    fn drop(&mut self) {
        if let Err(error) = self.stop() {
            tracing::warn!(error = %error, "Repository did not stop cleanly");
        }
    }
}

impl fmt::Debug for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("running", &self.is_running())
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
