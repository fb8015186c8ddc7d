// src/handler/stop.rs - M0/M1/M2
use super::{CommandHandler, Handled};
use crate::channel::Channel;
use crate::command::{Command, Message};
use crate::job::JobError;

/// Stop, conditional stop and program end. A live stop cancels a paused job;
/// the job's own file channel may end it at any time.
pub(super) async fn stop(handler: &CommandHandler, command: &mut Command) -> Handled {
    handler.flush(command, true).await?;

    if command.channel != Channel::File2 {
        let mut job = handler.lock_job(command).await?;
        if job.is_file_selected() {
            match job.cancel(command.channel) {
                Ok(state) => tracing::debug!("{} ended the job, now {}", command.channel, state.name()),
                Err(e @ JobError::NotPaused) => return Ok(Some(Message::error(e.to_string()))),
                Err(e) => tracing::debug!("Stop on {} left the job alone: {}", command.channel, e),
            }
        }
    }

    if command.is_from_file() {
        // the cancelled job would otherwise take this code down with it
        command.reset_cancellation();
    }
    Ok(None)
}
