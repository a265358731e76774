//! Result futures and the type-erased commands that resolve them.

use causeway_core::{
    catch_panic, AnyCommand, CausewayError, CausewayResult, Command, CommandContext, CommandError,
    CommandState, Record, RepositoryError,
};
use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use std::any::type_name;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use uuid::Uuid;

// ============================================================================
// COMMAND FUTURE
// ============================================================================

type Outcome<T> = CausewayResult<T>;

/// Eventual result of a published command.
///
/// Resolves exactly once. Any number of clones may await or [`wait`](Self::wait)
/// on it; all observe the same outcome.
pub struct CommandFuture<T> {
    command_id: Uuid,
    inner: Shared<oneshot::Receiver<Outcome<T>>>,
}

impl<T: Clone> CommandFuture<T> {
    pub(crate) fn channel(command_id: Uuid) -> (oneshot::Sender<Outcome<T>>, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Self {
                command_id,
                inner: rx.shared(),
            },
        )
    }

    /// Uuid of the command this future belongs to.
    pub fn command_id(&self) -> Uuid {
        self.command_id
    }

    /// Block the current thread until the command completes.
    pub fn wait(&self) -> CausewayResult<T> {
        futures::executor::block_on(self.clone())
    }

    pub fn is_resolved(&self) -> bool {
        self.try_result().is_some()
    }

    /// The outcome, if already resolved. Never blocks.
    pub fn try_result(&self) -> Option<CausewayResult<T>> {
        self.inner
            .clone()
            .now_or_never()
            .map(|outcome| settle(self.command_id, outcome))
    }
}

fn settle<T>(
    command_id: Uuid,
    outcome: Result<Outcome<T>, oneshot::Canceled>,
) -> CausewayResult<T> {
    outcome.unwrap_or_else(|_| Err(RepositoryError::CommandAbandoned { command_id }.into()))
}

impl<T: Clone> Future for CommandFuture<T> {
    type Output = CausewayResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let command_id = this.command_id;
        Pin::new(&mut this.inner)
            .poll(cx)
            .map(|outcome| settle(command_id, outcome))
    }
}

impl<T> Clone for CommandFuture<T> {
    fn clone(&self) -> Self {
        Self {
            command_id: self.command_id,
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone> fmt::Debug for CommandFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandFuture")
            .field("command_id", &self.command_id)
            .field("resolved", &self.inner.peek().is_some())
            .finish()
    }
}

// ============================================================================
// PENDING COMMAND
// ============================================================================

/// A submitted command together with the sender side of its future.
pub(crate) trait PendingCommand: Send {
    fn command_mut(&mut self) -> &mut dyn AnyCommand;

    /// Compute the result from journaled state and hold it until `resolve`.
    /// Returns whether the result is a success.
    fn evaluate(&mut self, state: Option<CommandState>, ctx: &CommandContext<'_>) -> bool;

    fn resolve(self: Box<Self>);

    fn fail(self: Box<Self>, error: CausewayError);
}

pub(crate) struct Pending<C: Command> {
    command: C,
    result: Option<Outcome<C::Output>>,
    sender: oneshot::Sender<Outcome<C::Output>>,
}

impl<C: Command> Pending<C> {
    pub(crate) fn new(command: C, sender: oneshot::Sender<Outcome<C::Output>>) -> Self {
        Self {
            command,
            result: None,
            sender,
        }
    }
}

impl<C: Command> PendingCommand for Pending<C> {
    fn command_mut(&mut self) -> &mut dyn AnyCommand {
        &mut self.command
    }

    fn evaluate(&mut self, state: Option<CommandState>, ctx: &CommandContext<'_>) -> bool {
        let command = &self.command;
        let result = catch_panic(|| {
            let state = match state {
                Some(state) => Some(*state.downcast::<C::State>().map_err(|_| {
                    CommandError::StateMismatch {
                        expected: type_name::<C::State>().to_string(),
                    }
                })?),
                None => None,
            };
            command.result(state, ctx)
        })
        .map_err(CausewayError::from);
        let ok = result.is_ok();
        self.result = Some(result);
        ok
    }

    fn resolve(self: Box<Self>) {
        let command_id = self.command.entity_header().uuid().unwrap_or_else(Uuid::nil);
        let result = self
            .result
            .unwrap_or_else(|| Err(RepositoryError::CommandAbandoned { command_id }.into()));
        // The caller may have dropped every clone of the future.
        let _ = self.sender.send(result);
    }

    fn fail(self: Box<Self>, error: CausewayError) {
        let _ = self.sender.send(Err(error));
    }
}
