// src/handler/job.rs - M23, M24, M26, M27, M32, M37, M606
use super::{CommandHandler, Handled};
use crate::channel::Channel;
use crate::command::{Command, Message};
use crate::files::FileDirectory;
use crate::job::JobError;

/// M23/M32, and M37 with `simulate`: makes the `P` file the job file and
/// lets the firmware start it.
pub(super) async fn select_file(handler: &CommandHandler, command: &mut Command, simulate: bool) -> Handled {
    handler.flush(command, true).await?;
    let name = try_message!(command.required('P')).value.clone();
    let path = try_message!(handler.physical_path(&name, FileDirectory::GCodes).await);
    let size = match tokio::fs::metadata(&path).await {
        Ok(metadata) if metadata.is_file() => metadata.len(),
        _ => return Ok(Some(Message::error(format!("Could not find file {}", name)))),
    };
    let virtual_name = handler.virtual_path(&name, FileDirectory::GCodes).await;

    let mut job = handler.lock_job(command).await?;
    if let Err(e) = job.select_file(&virtual_name, path, size, simulate, command.channel) {
        return Ok(Some(Message::error(e.to_string())));
    }
    drop(job);

    let mut model = handler.model.write().await;
    model.job.file_name = Some(virtual_name);
    model.job.file_size = Some(size);
    model.job.file_position = Some(0);
    model.job.simulating = simulate;
    Ok(None)
}

pub(super) async fn simulate(handler: &CommandHandler, command: &mut Command) -> Handled {
    if !command.has_parameter('P') {
        return Ok(None);
    }
    select_file(handler, command, true).await
}

/// M24. The job only starts once the firmware has acknowledged.
pub(super) async fn start_or_resume(handler: &CommandHandler, command: &mut Command) -> Handled {
    handler.flush(command, true).await?;
    let job = handler.lock_job(command).await?;
    if !job.is_file_selected() {
        return Ok(Some(Message::error(JobError::NoFileSelected.to_string())));
    }
    Ok(None)
}

/// M26: `S` byte offset for motion system `P`.
pub(super) async fn set_file_position(handler: &CommandHandler, command: &mut Command) -> Handled {
    handler.flush(command, false).await?;
    let position = try_message!(command.required('S').and_then(|p| p.as_u64()));
    let system = try_message!(command.i64_or('P', 0));

    let mut job = handler.lock_job(command).await?;
    match job.set_file_position(system, position) {
        Ok(()) => {
            drop(job);
            if system == 0 {
                handler.model.write().await.job.file_position = Some(position);
            }
            Ok(None)
        }
        Err(e) => Ok(Some(Message::error(e.to_string()))),
    }
}

pub(super) async fn report_file_position(handler: &CommandHandler, command: &mut Command) -> Handled {
    handler.flush(command, false).await?;
    let system = try_message!(command.i64_or('P', 0));
    let mut job = handler.lock_job(command).await?;
    if !job.is_processing() {
        return Ok(Some(Message::success("Not SD printing.")));
    }
    match job.get_file_position(system) {
        Ok(position) => {
            drop(job);
            let size = handler.job.snapshot().await.file_size.unwrap_or_default();
            Ok(Some(Message::success(format!("SD printing byte {}/{}", position, size))))
        }
        Err(e) => Ok(Some(Message::error(e.to_string()))),
    }
}

/// M606: starts the secondary feed where the primary one is.
pub(super) async fn fork(handler: &CommandHandler, command: &mut Command) -> Handled {
    handler.flush(command, true).await?;
    let secondary_available = handler.dispatcher.is_open(Channel::File2);
    let mut job = handler.lock_job(command).await?;
    match job.fork_second_job(secondary_available) {
        Ok(()) => Ok(Some(Message::ok())),
        Err(e) => Ok(Some(Message::error(e.to_string()))),
    }
}
