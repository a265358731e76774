//! Journal transaction protocol.
//!
//! ```text
//! begin ─→ produce events ─→ for each event:                ─→ put command ─→ commit ─→ on_commit
//!            │ on_command_state    stamp, put, on_event,
//!            │                     put causality, on_event
//!            └─ any failure ─→ rollback ─→ on_abort ─→ retry once with a single
//!                                                      CommandTerminatedExceptionally
//! ```
//!
//! The retry never recurses: if the failure record itself cannot be
//! journaled the command fails with [`JournalError::FailureRecordLost`].

use crate::events::{CommandTerminatedExceptionally, EventCausalityEstablished};
use crate::journal::{Journal, JournalListener, Transaction};
use causeway_core::{
    catch_panic, AnyCommand, CommandContext, Entity, EventIter, HybridTimestamp, JournalError,
    PhysicalTimeProvider,
};
use uuid::Uuid;

enum Attempt {
    Primary,
    FailureRecord(CommandTerminatedExceptionally),
}

/// Journal `command` through `journal`, retrying once with a failure record.
pub fn journal_command<J: Journal + ?Sized>(
    journal: &J,
    command: &mut dyn AnyCommand,
    listener: &mut dyn JournalListener,
    ctx: &CommandContext<'_>,
) -> Result<usize, JournalError> {
    let command_id = command.header_mut().assign_uuid();
    if command.header().timestamp().is_none() {
        command
            .header_mut()
            .assign_timestamp(ctx.now());
    }

    let error = match run_transaction(journal, command, listener, ctx, Attempt::Primary) {
        Ok(count) => return Ok(count),
        Err(error) => error,
    };

    tracing::warn!(
        command = %command_id,
        kind = command.type_name(),
        error = %error,
        "Command failed, journaling failure record"
    );
    let record = CommandTerminatedExceptionally::new(command_id, error.class_name(), error.message());

    match run_transaction(journal, command, listener, ctx, Attempt::FailureRecord(record)) {
        Ok(_) => Err(error),
        Err(cause) => {
            tracing::error!(
                command = %command_id,
                error = %cause,
                original = %error,
                "Failure record could not be journaled"
            );
            Err(JournalError::FailureRecordLost {
                command_id,
                original: Box::new(error),
                cause: Box::new(cause),
            })
        }
    }
}

fn run_transaction<J: Journal + ?Sized>(
    journal: &J,
    command: &mut dyn AnyCommand,
    listener: &mut dyn JournalListener,
    ctx: &CommandContext<'_>,
    attempt: Attempt,
) -> Result<usize, JournalError> {
    let mut tx = match journal.begin() {
        Ok(tx) => tx,
        Err(e) => {
            let error = JournalError::from(e);
            listener.on_abort(&error);
            return Err(error);
        }
    };

    let outcome = write_entities(&mut *tx, command, listener, ctx, attempt)
        .and_then(|count| tx.commit().map(|_| count).map_err(JournalError::from));

    match outcome {
        Ok(count) => {
            listener.on_commit();
            Ok(count)
        }
        Err(error) => {
            tx.rollback();
            listener.on_abort(&error);
            Err(error)
        }
    }
}

fn write_entities(
    tx: &mut dyn Transaction,
    command: &mut dyn AnyCommand,
    listener: &mut dyn JournalListener,
    ctx: &CommandContext<'_>,
    attempt: Attempt,
) -> Result<usize, JournalError> {
    let command_id = command.header_mut().assign_uuid();
    let failed = |source| JournalError::Command { command_id, source };

    let mut clock = command
        .header()
        .timestamp()
        .unwrap_or_else(|| ctx.now());

    let mut events: EventIter = match attempt {
        Attempt::Primary => {
            let stream = catch_panic(|| command.produce(ctx)).map_err(failed)?;
            let (state, events) = stream.into_parts();
            listener.on_command_state(state);
            events
        }
        Attempt::FailureRecord(record) => {
            Box::new(std::iter::once(Ok(Box::new(record) as Box<dyn Entity>)))
        }
    };

    let mut count = 0;
    loop {
        let produced = match catch_panic(|| Ok(events.next())).map_err(failed)? {
            Some(produced) => produced,
            None => break,
        };
        let mut event = produced.map_err(failed)?;
        let event_id = stamp(&mut *event, &mut clock, ctx.time());
        tx.put_event(&*event)?;
        listener.on_event(&*event);

        let mut causality = EventCausalityEstablished::new(event_id, command_id);
        stamp(&mut causality, &mut clock, ctx.time());
        tx.put_event(&causality)?;
        listener.on_event(&causality);

        count += 1;
    }

    tx.put_command(command.as_entity())?;
    Ok(count)
}

/// Timestamp `entity` causally after `clock` unless it carries its own
/// timestamp, in which case fold that into `clock`. Returns the entity's uuid.
fn stamp(entity: &mut dyn Entity, clock: &mut HybridTimestamp, time: &dyn PhysicalTimeProvider) -> Uuid {
    let header = entity.header_mut();
    match header.timestamp() {
        Some(own) => clock.update_from(&own, time),
        None => {
            clock.update(time);
            header.assign_timestamp(*clock);
        }
    }
    header.assign_uuid()
}
