// src/firmware/mod.rs - Boundary to the motion-control firmware
pub mod serial;
pub mod uf2;
pub mod update;

use crate::channel::Channel;
use crate::command::{Command, Message};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FirmwareError {
    #[error("Not connected to the firmware")]
    NotConnected,
    #[error("Serial port error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Timeout waiting for the firmware after {0:?}")]
    Timeout(Duration),
    #[error("Firmware rejected the request: {0}")]
    Rejected(String),
    #[error("Firmware update failed: {0}")]
    Update(String),
}

/// Holds all motion systems still until dropped.
pub struct MotionLock {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl MotionLock {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self { release: Some(Box::new(release)) }
    }

    pub fn noop() -> Self {
        Self { release: None }
    }
}

impl Drop for MotionLock {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for MotionLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MotionLock").field("held", &self.release.is_some()).finish()
    }
}

/// Everything the code handlers need from the firmware side. Implementations
/// apply their own per-call timeouts; callers add cancellation on top.
#[async_trait]
pub trait FirmwareLink: Send + Sync {
    /// Executes a forwarded code and returns the firmware's reply.
    async fn execute(&self, command: &Command) -> Result<Message, FirmwareError>;

    /// Resolves once no firmware update is in progress.
    async fn wait_for_pending_update(&self) -> Result<(), FirmwareError>;

    async fn emergency_stop(&self) -> Result<(), FirmwareError>;

    async fn reset_firmware(&self) -> Result<(), FirmwareError>;

    async fn update_firmware(&self, boot_image: Vec<u8>, firmware_image: Vec<u8>) -> Result<(), FirmwareError>;

    async fn lock_all_motion_and_wait_for_standstill(&self, channel: Channel) -> Result<MotionLock, FirmwareError>;

    async fn set_macro_pausable(&self, channel: Channel, pausable: bool) -> Result<(), FirmwareError>;

    /// Marks the mirrored machine state stale so it is fetched again in full.
    async fn request_full_update(&self);

    /// Resolves after the next complete state fetch.
    async fn wait_for_full_update(&self) -> Result<(), FirmwareError>;
}
