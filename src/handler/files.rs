// src/handler/files.rs - M20, M28-M30, M36, M38, M470, M471
use super::{CommandHandler, Handled, HandlerError};
use crate::command::{Command, Message};
use crate::files::checksum::{self, ChecksumError};
use crate::files::info::{self, InfoError};
use crate::files::listing;
use crate::files::{FileDirectory, FileWriteError};
use serde_json::json;

pub(super) async fn list_directory(handler: &CommandHandler, command: &mut Command) -> Handled {
    handler.flush(command, false).await?;

    let directory = match command.parameter('P') {
        Some(p) => p.value.clone(),
        None => handler.model.read().await.directories.g_codes.clone(),
    };
    let style = try_message!(command.i64_or('S', 0));
    let first = try_message!(command.i64_or('R', 0)).max(0) as usize;

    let entries = match handler.physical_path(&directory, FileDirectory::GCodes).await {
        Ok(path) => listing::read_directory(&path).await.map_err(|e| e.to_string()),
        Err(message) => Err(message.text),
    };
    let max_length = handler.config.listing_buffer;
    let text = match (style, entries) {
        (2 | 3, Err(e)) => {
            tracing::debug!("Cannot list {}: {}", directory, e);
            json!({ "err": 2 }).to_string()
        }
        (2, Ok(entries)) => listing::json_names(&directory, &entries, first, max_length),
        (3, Ok(entries)) => listing::json_detailed(&directory, &entries, first, max_length),
        (_, Err(e)) => {
            tracing::warn!("Cannot list {}: {}", directory, e);
            return Ok(Some(Message::error(format!("Failed to open directory {}", directory))));
        }
        (_, Ok(entries)) => listing::legacy_listing(&entries, handler.config.compatibility),
    };
    Ok(Some(Message::success(text)))
}

pub(super) async fn begin_upload(handler: &CommandHandler, command: &mut Command) -> Handled {
    handler.flush(command, true).await?;
    let name = try_message!(command.required('P')).value.clone();
    let path = try_message!(handler.physical_path(&name, FileDirectory::GCodes).await);
    match handler.files().begin_write(command.channel, &name, &path, command.cancellation()).await {
        Ok(message) => Ok(Some(message)),
        Err(FileWriteError::Cancelled) => Err(HandlerError::Cancelled),
        Err(e @ FileWriteError::AlreadyWriting) => Ok(Some(Message::error(e.to_string()))),
        Err(FileWriteError::Io(e)) => {
            tracing::warn!("Failed to open {} for writing: {}", path.display(), e);
            Ok(Some(Message::error(format!("Failed to open file {} for writing: {}", name, e))))
        }
    }
}

pub(super) async fn end_upload(handler: &CommandHandler, command: &mut Command) -> Handled {
    match handler.files().end_write(command.channel, command.cancellation()).await {
        Ok(message) => Ok(Some(message)),
        Err(FileWriteError::Cancelled) => Err(HandlerError::Cancelled),
        Err(e) => {
            tracing::warn!("Failed to close upload on {}: {}", command.channel, e);
            Ok(Some(Message::error(format!("Failed to close file: {}", e))))
        }
    }
}

pub(super) async fn delete(handler: &CommandHandler, command: &mut Command) -> Handled {
    handler.flush(command, false).await?;
    let name = try_message!(command.required('P')).value.clone();
    let path = try_message!(handler.physical_path(&name, FileDirectory::GCodes).await);

    let result = match tokio::fs::metadata(&path).await {
        Ok(metadata) if metadata.is_dir() => tokio::fs::remove_dir(&path).await,
        Ok(_) => tokio::fs::remove_file(&path).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => {
            tracing::debug!("Deleted {}", path.display());
            Ok(Some(Message::ok()))
        }
        Err(e) => Ok(Some(Message::error(format!("Failed to delete file {}: {}", name, e)))),
    }
}

/// M36 with a file name. Without one the firmware reports on the running
/// job itself.
pub(super) async fn file_info(handler: &CommandHandler, command: &mut Command) -> Handled {
    let Some(name) = command.parameter('P').map(|p| p.value.clone()) else {
        return Ok(None);
    };
    handler.flush(command, false).await?;

    let path = match handler.physical_path(&name, FileDirectory::GCodes).await {
        Ok(path) => path,
        Err(_) => return Ok(Some(Message::success(json!({ "err": 1 }).to_string()))),
    };
    let virtual_name = handler.virtual_path(&name, FileDirectory::GCodes).await;
    match info::parse_file_info(&path, &virtual_name, command.cancellation()).await {
        Ok(info) => match serde_json::to_string(&info) {
            Ok(text) => Ok(Some(Message::success(text))),
            Err(e) => Ok(Some(Message::error(e.to_string()))),
        },
        Err(InfoError::Cancelled) => Err(HandlerError::Cancelled),
        Err(InfoError::Io(e)) => {
            tracing::debug!("No file info for {}: {}", path.display(), e);
            Ok(Some(Message::success(json!({ "err": 1 }).to_string())))
        }
    }
}

pub(super) async fn checksum(handler: &CommandHandler, command: &mut Command) -> Handled {
    handler.flush(command, false).await?;
    let name = try_message!(command.required('P')).value.clone();
    let path = try_message!(handler.physical_path(&name, FileDirectory::GCodes).await);
    match checksum::sha1_file(path, command.cancellation().clone()).await {
        Ok(hash) => Ok(Some(Message::success(hash))),
        Err(ChecksumError::Cancelled) => Err(HandlerError::Cancelled),
        Err(e) => Ok(Some(Message::error(format!("Could not compute SHA1 checksum for file {}: {}", name, e)))),
    }
}

pub(super) async fn create_directory(handler: &CommandHandler, command: &mut Command) -> Handled {
    handler.flush(command, false).await?;
    let name = try_message!(command.required('P')).value.clone();
    let path = try_message!(handler.physical_path(&name, FileDirectory::GCodes).await);
    match tokio::fs::create_dir_all(&path).await {
        Ok(()) => Ok(Some(Message::ok())),
        Err(e) => Ok(Some(Message::error(format!("Failed to create directory {}: {}", name, e)))),
    }
}

/// M471: moves `S` to `T`. An existing destination is only replaced with
/// `D1`.
pub(super) async fn rename(handler: &CommandHandler, command: &mut Command) -> Handled {
    handler.flush(command, false).await?;
    let from_name = try_message!(command.required('S')).value.clone();
    let to_name = try_message!(command.required('T')).value.clone();
    let overwrite = try_message!(command.bool_or('D', false));
    let from = try_message!(handler.physical_path(&from_name, FileDirectory::GCodes).await);
    let to = try_message!(handler.physical_path(&to_name, FileDirectory::GCodes).await);

    if let Ok(existing) = tokio::fs::metadata(&to).await {
        if !overwrite {
            return Ok(Some(Message::error(format!("Destination file {} already exists", to_name))));
        }
        let removed = if existing.is_dir() {
            tokio::fs::remove_dir_all(&to).await
        } else {
            tokio::fs::remove_file(&to).await
        };
        if let Err(e) = removed {
            return Ok(Some(Message::error(format!("Failed to delete {}: {}", to_name, e))));
        }
    }
    match tokio::fs::rename(&from, &to).await {
        Ok(()) => {
            tracing::debug!("Moved {} to {}", from.display(), to.display());
            Ok(Some(Message::ok()))
        }
        Err(e) => Ok(Some(Message::error(format!("Failed to rename {} to {}: {}", from_name, to_name, e)))),
    }
}
