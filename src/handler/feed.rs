// src/handler/feed.rs - Feeding job file lines through the handler
use super::{CommandHandler, HandlerError};
use crate::channel::Channel;
use crate::command::{Command, CommandFlags, CommandParseError};
use crate::job::JobError;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Executes the job file line by line on the channel of `system` until
/// `shutdown` fires, which also cancels the line in flight.
pub async fn run_file_feed(handler: Arc<CommandHandler>, system: usize, shutdown: CancellationToken) {
    let Some(channel) = Channel::for_motion_system(system) else {
        tracing::error!("No file channel for motion system {}", system);
        return;
    };
    tracing::info!("File feed {} running on {}", system, channel);

    loop {
        let line = match handler.job.wait_for_line(system, &shutdown).await {
            Ok(line) => line,
            Err(JobError::Cancelled) => break,
            Err(e) => {
                tracing::error!("{} stopped reading the job file: {}", channel, e);
                if !abort_job(&handler, channel).await {
                    break;
                }
                continue;
            }
        };

        let command = match Command::parse(&line, channel) {
            Ok(command) => command,
            Err(CommandParseError::Empty) => continue,
            Err(e) => {
                tracing::warn!("{}: skipping '{}': {}", channel, line, e);
                continue;
            }
        };
        let mut command = command
            .with_flags(CommandFlags::FROM_FILE)
            .with_cancellation(shutdown.child_token());

        match handler.execute(&mut command).await {
            Ok(message) if message.is_error() => tracing::warn!("{}: {} -> {}", channel, line, message),
            Ok(message) if !message.text.is_empty() => tracing::info!("{}: {}", channel, message),
            Ok(_) => {}
            Err(HandlerError::Cancelled) => tracing::debug!("{}: {} cancelled", channel, line),
            Err(e) => {
                tracing::error!("{}: {} failed: {}", channel, line, e);
                if !abort_job(&handler, channel).await {
                    break;
                }
            }
        }
    }
    tracing::info!("File feed {} stopped", system);
}

/// Ends the job after a line could not be executed. Returns false once the
/// feed itself should stop.
async fn abort_job(handler: &CommandHandler, channel: Channel) -> bool {
    if handler.lifecycle.is_terminating() {
        return false;
    }
    if let Ok(mut job) = handler.job.lock(&CancellationToken::new()).await {
        match job.cancel(channel) {
            Ok(_) => {
                if let Err(e) = job.resume() {
                    tracing::warn!("Cancelled job did not return to idle: {}", e);
                }
            }
            Err(e) => tracing::debug!("Job not cancelled: {}", e),
        }
    }
    true
}
