// src/handler/react.rs - Follow-up once a code has been executed
use super::CommandHandler;
use crate::channel::Channel;
use crate::command::{CodeType, Command};
use crate::diagnostics::HostDiagnostics;
use crate::job::JobState;
use tokio_util::sync::CancellationToken;

pub(super) async fn react(handler: &CommandHandler, command: &mut Command) {
    if !command.result().is_some_and(|r| !r.is_error()) {
        return;
    }
    if command.code_type != CodeType::M {
        return;
    }
    let Some(major) = command.major else {
        return;
    };

    match major {
        0 | 1 | 2 => finish_cancellation(handler).await,
        24 | 32 | 37 => resume_job(handler, command).await,
        25 | 226 => pause_job(handler).await,
        501 | 502 | 703 => {
            tracing::debug!("M{} changed the machine state, requesting full update", major);
            handler.firmware.request_full_update().await;
        }
        115 if command.channel == Channel::Daemon => {
            // internal probe, the answer is not meant for anyone
            if let Some(result) = command.result_mut() {
                result.text.clear();
            }
        }
        122 if !command.has_parameter('P') && command.i64_or('B', 0).is_ok_and(|b| b == 0) => {
            let report = diagnostics(handler).await;
            if let Some(result) = command.result_mut() {
                result.append_line(&report);
            }
        }
        999 if command.i64_or('B', 0).is_ok_and(|b| b == -1) => {
            handler.lifecycle.schedule_termination(0, "Host reset requested");
        }
        _ => {}
    }
}

async fn finish_cancellation(handler: &CommandHandler) {
    let Ok(mut job) = handler.job.lock(&CancellationToken::new()).await else {
        return;
    };
    if job.state() == JobState::Cancelling {
        if let Err(e) = job.resume() {
            tracing::warn!("Failed to complete cancellation: {}", e);
        }
        drop(job);
        handler.model.write().await.job = Default::default();
    }
}

async fn resume_job(handler: &CommandHandler, command: &Command) {
    if command.is(CodeType::M, 37) && !command.has_parameter('P') {
        return;
    }
    let Ok(mut job) = handler.job.lock(&CancellationToken::new()).await else {
        return;
    };
    match job.resume() {
        Ok(state) => tracing::debug!("Job dispatch resumed, now {}", state.name()),
        Err(e) => tracing::debug!("Nothing to resume: {}", e),
    }
}

async fn pause_job(handler: &CommandHandler) {
    let Ok(mut job) = handler.job.lock(&CancellationToken::new()).await else {
        return;
    };
    if let Err(e) = job.pause() {
        tracing::debug!("Pause acknowledged without a running job: {}", e);
    }
}

async fn diagnostics(handler: &CommandHandler) -> String {
    let job = handler.job.snapshot().await;
    let dispatcher = handler.dispatcher.clone();
    HostDiagnostics::collect(
        handler.started.elapsed(),
        job,
        move |channel| dispatcher.pending(channel),
        handler.files().open_uploads(),
    )
    .to_string()
}
