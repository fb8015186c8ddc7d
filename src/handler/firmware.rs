// src/handler/firmware.rs - M112, M997, M999
use super::{CommandHandler, Handled, HandlerError};
use crate::command::{Command, Message};
use crate::files::FileDirectory;
use crate::firmware::update::{self, ImageError};
use crate::firmware::FirmwareError;
use crate::model::MachineStatus;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

/// Hard bound for emergency stop and reset.
pub const FIRMWARE_ACTION_TIMEOUT: Duration = Duration::from_millis(4500);

/// Exit code used when the firmware stops responding to a bounded action.
const TIMEOUT_EXIT_CODE: i32 = 1;

impl CommandHandler {
    /// Waits for a running firmware update, then runs `action` against the
    /// hard bound. Past the bound the process is scheduled to terminate.
    async fn bounded_firmware_action<F>(&self, command: &Command, action: &'static str, call: F) -> Result<(), HandlerError>
    where
        F: Future<Output = Result<(), FirmwareError>>,
    {
        self.firmware_call(command, self.firmware.wait_for_pending_update()).await?;
        match tokio::time::timeout(FIRMWARE_ACTION_TIMEOUT, self.firmware_call(command, call)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!("{} did not complete within {:?}", action, FIRMWARE_ACTION_TIMEOUT);
                self.lifecycle.schedule_termination(
                    TIMEOUT_EXIT_CODE,
                    format!("{} timed out", action),
                );
                Err(HandlerError::Timeout { action, after: FIRMWARE_ACTION_TIMEOUT })
            }
        }
    }
}

pub(super) async fn emergency_stop(handler: &CommandHandler, command: &mut Command) -> Handled {
    handler
        .bounded_firmware_action(command, "Emergency stop", handler.firmware.emergency_stop())
        .await?;
    handler.model.write().await.state.status = MachineStatus::Halted;
    Ok(Some(Message::ok()))
}

/// M999. `B0` or no `B` resets the main board here; `B-1` (the host itself)
/// and expansion boards are the firmware's business.
pub(super) async fn reset(handler: &CommandHandler, command: &mut Command) -> Handled {
    let board = try_message!(command.i64_or('B', 0));
    if board != 0 {
        return Ok(None);
    }
    handler
        .bounded_firmware_action(command, "Firmware reset", handler.firmware.reset_firmware())
        .await?;
    handler.model.write().await.state.status = MachineStatus::Starting;
    Ok(Some(Message::ok()))
}

/// M997 for the main board. Other module numbers go to the firmware.
pub(super) async fn update(handler: &CommandHandler, command: &mut Command) -> Handled {
    let module = match command.parameter('S') {
        None => 0,
        Some(p) => match p.as_i64() {
            Ok(module) => module,
            Err(_) => return Ok(None),
        },
    };
    if module != 0 {
        return Ok(None);
    }
    handler.flush(command, true).await?;

    let _motion = handler
        .firmware_call(command, handler.firmware.lock_all_motion_and_wait_for_standstill(command.channel))
        .await?;

    let (firmware_name, iap_name, directories) = {
        let model = handler.model.read().await;
        let Some(board) = model.boards.first() else {
            return Ok(Some(Message::error("No boards have been detected")));
        };
        (board.firmware_file_name.clone(), board.iap_file_name_sbc.clone(), model.directories.clone())
    };
    if firmware_name.is_empty() || iap_name.is_empty() {
        return Ok(Some(Message::error("The main board does not support firmware updates from the host")));
    }

    let mut search: Vec<PathBuf> = Vec::new();
    for directory in [FileDirectory::Firmware, FileDirectory::System] {
        match handler.resolver.to_physical(directory.virtual_path(&directories), "0:/") {
            Ok(path) => search.push(path),
            Err(e) => tracing::warn!("Skipping firmware search directory: {}", e),
        }
    }
    search.push(handler.config.firmware_directory.clone());

    let iap_path = try_message!(update::resolve_image(&iap_name, &search).map_err(image_error));
    let firmware_path = try_message!(update::resolve_image(&firmware_name, &search).map_err(image_error));

    let plugins = handler.plugins.stop_all().await;
    let restart_plugins = async {
        if !plugins.is_empty() {
            handler.plugins.start(&plugins).await;
        }
    };

    let images = async {
        let iap = update::load_image(&iap_path).await?;
        let firmware = update::load_image(&firmware_path).await?;
        Ok::<_, ImageError>((iap, firmware))
    };
    let (iap, firmware) = match images.await {
        Ok(images) => images,
        Err(e) => {
            restart_plugins.await;
            return Ok(Some(image_error(e)));
        }
    };

    handler.model.write().await.state.status = MachineStatus::Updating;
    tracing::info!("Updating firmware from {} using {}", firmware_path.display(), iap_path.display());
    let flashed = handler.firmware_call(command, handler.firmware.update_firmware(iap, firmware)).await;
    handler.model.write().await.state.status = MachineStatus::Starting;
    if let Err(e) = flashed {
        restart_plugins.await;
        return match e {
            HandlerError::Firmware(e) => Ok(Some(Message::error(e.to_string()))),
            other => Err(other),
        };
    }

    if handler.config.terminate_after_firmware_update {
        handler.lifecycle.schedule_termination(0, "Firmware updated");
        return Ok(Some(Message::ok()));
    }
    let resynced = handler.firmware_call(command, handler.firmware.wait_for_full_update()).await;
    restart_plugins.await;
    match resynced {
        Ok(()) => Ok(Some(Message::ok())),
        Err(HandlerError::Firmware(e)) => {
            tracing::warn!("No machine state after the update: {}", e);
            Ok(Some(Message::error(format!("Firmware updated, but the board did not report back: {}", e))))
        }
        Err(other) => Err(other),
    }
}

fn image_error(e: ImageError) -> Message {
    tracing::warn!("{}", e);
    Message::error(e.to_string())
}
