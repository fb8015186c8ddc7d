// src/firmware/serial.rs - Line-oriented firmware link over a serial port
//
// Each request is written as one line and answered by zero or more reply
// lines terminated by a line starting with `ok`. Only one request is on the
// wire at a time.
use super::{FirmwareError, FirmwareLink, MotionLock};
use crate::channel::Channel;
use crate::command::{CodeType, Command, Message};
use async_trait::async_trait;
use serial2_tokio::SerialPort;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;

/// Payload bytes per write while streaming an image.
const IMAGE_CHUNK: usize = 4096;

/// How long the firmware may take to come back after a reset.
const RESET_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

struct Port {
    serial: SerialPort,
    pending: String,
}

impl Port {
    async fn write_line(&mut self, line: &str) -> Result<(), FirmwareError> {
        tracing::debug!("Firmware <- {}", line);
        self.serial.write_all(format!("{}\n", line).as_bytes()).await?;
        Ok(())
    }

    /// Next complete line from the port. Partial input stays buffered.
    async fn read_line(&mut self) -> Result<String, FirmwareError> {
        let mut buf = [0u8; 256];
        loop {
            if let Some(end) = self.pending.find('\n') {
                let line: String = self.pending.drain(..=end).collect();
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                tracing::debug!("Firmware -> {}", line);
                return Ok(line);
            }
            let n = self.serial.read(&mut buf).await?;
            if n == 0 {
                return Err(FirmwareError::NotConnected);
            }
            self.pending.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
    }

    /// Reads reply lines up to and including the terminating `ok`.
    async fn read_reply(&mut self) -> Result<Vec<String>, FirmwareError> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line == "ok" || line.starts_with("ok ") {
                return Ok(lines);
            }
            if let Some(error) = line.strip_prefix("Error:") {
                return Err(FirmwareError::Rejected(error.trim().to_string()));
            }
            lines.push(line);
        }
    }
}

pub struct SerialFirmwareLink {
    port: Mutex<Option<Port>>,
    reply_timeout: Duration,
    updating: watch::Sender<bool>,
    stale: AtomicBool,
    motion_holds: Arc<AtomicUsize>,
}

impl SerialFirmwareLink {
    /// Opens the serial device.
    pub fn connect(path: &str, baud: u32, reply_timeout: Duration) -> Result<Self, FirmwareError> {
        tracing::info!("Connecting to firmware on {} at {} baud", path, baud);
        let serial = SerialPort::open(path, baud)?;
        let link = Self::offline(reply_timeout);
        *link.port.try_lock().map_err(|_| FirmwareError::NotConnected)? = Some(Port { serial, pending: String::new() });
        tracing::info!("Connected to firmware");
        Ok(link)
    }

    /// A link without a device. Every firmware call fails with
    /// [`FirmwareError::NotConnected`].
    pub fn offline(reply_timeout: Duration) -> Self {
        Self {
            port: Mutex::new(None),
            reply_timeout,
            updating: watch::Sender::new(false),
            stale: AtomicBool::new(true),
            motion_holds: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    async fn transact(&self, line: &str, reply_timeout: Duration) -> Result<Vec<String>, FirmwareError> {
        let mut guard = self.port.lock().await;
        let port = guard.as_mut().ok_or(FirmwareError::NotConnected)?;
        port.write_line(line).await?;
        timeout(reply_timeout, port.read_reply())
            .await
            .map_err(|_| FirmwareError::Timeout(reply_timeout))?
    }

    async fn stream_image(&self, port: &mut Port, image: &[u8]) -> Result<(), FirmwareError> {
        for chunk in image.chunks(IMAGE_CHUNK) {
            port.serial.write_all(chunk).await?;
        }
        Ok(())
    }
}

/// Clears the update flag however the update ends.
struct UpdateFlag<'a>(&'a watch::Sender<bool>);

impl Drop for UpdateFlag<'_> {
    fn drop(&mut self) {
        self.0.send_replace(false);
    }
}

#[async_trait]
impl FirmwareLink for SerialFirmwareLink {
    async fn execute(&self, command: &Command) -> Result<Message, FirmwareError> {
        if command.code_type == CodeType::G && self.motion_holds.load(Ordering::Acquire) > 0 {
            return Err(FirmwareError::Rejected("Motion is locked".to_string()));
        }
        let lines = self.transact(&command.to_string(), self.reply_timeout).await?;
        let mut message = Message::ok();
        for line in lines {
            match line.strip_prefix("Warning:") {
                Some(warning) => {
                    message.kind = crate::command::MessageKind::Warning;
                    message.append_line(warning.trim());
                }
                None => message.append_line(&line),
            }
        }
        Ok(message)
    }

    async fn wait_for_pending_update(&self) -> Result<(), FirmwareError> {
        let mut updating = self.updating.subscribe();
        updating.wait_for(|busy| !*busy).await.map_err(|_| FirmwareError::NotConnected)?;
        Ok(())
    }

    async fn emergency_stop(&self) -> Result<(), FirmwareError> {
        let mut guard = self.port.lock().await;
        let port = guard.as_mut().ok_or(FirmwareError::NotConnected)?;
        // the firmware halts without acknowledging
        port.write_line("M112").await?;
        self.stale.store(true, Ordering::Release);
        Ok(())
    }

    async fn reset_firmware(&self) -> Result<(), FirmwareError> {
        self.transact("M999", RESET_REPLY_TIMEOUT).await?;
        self.stale.store(true, Ordering::Release);
        Ok(())
    }

    async fn update_firmware(&self, boot_image: Vec<u8>, firmware_image: Vec<u8>) -> Result<(), FirmwareError> {
        let mut guard = self.port.lock().await;
        let port = guard.as_mut().ok_or(FirmwareError::NotConnected)?;
        self.updating.send_replace(true);
        let _flag = UpdateFlag(&self.updating);

        tracing::info!(
            "Flashing firmware ({} byte loader, {} byte image)",
            boot_image.len(),
            firmware_image.len()
        );
        port.write_line(&format!("M997 S0 B{} F{}", boot_image.len(), firmware_image.len())).await?;
        self.stream_image(port, &boot_image).await?;
        self.stream_image(port, &firmware_image).await?;
        timeout(RESET_REPLY_TIMEOUT, port.read_reply())
            .await
            .map_err(|_| FirmwareError::Timeout(RESET_REPLY_TIMEOUT))?
            .map_err(|e| FirmwareError::Update(e.to_string()))?;
        self.stale.store(true, Ordering::Release);
        Ok(())
    }

    async fn lock_all_motion_and_wait_for_standstill(&self, channel: Channel) -> Result<MotionLock, FirmwareError> {
        self.motion_holds.fetch_add(1, Ordering::AcqRel);
        let holds = self.motion_holds.clone();
        let lock = MotionLock::new(move || {
            holds.fetch_sub(1, Ordering::AcqRel);
        });
        // M400 returns once all queued moves are done
        self.transact("M400", self.reply_timeout).await?;
        tracing::debug!("Motion locked for {}", channel);
        Ok(lock)
    }

    async fn set_macro_pausable(&self, channel: Channel, pausable: bool) -> Result<(), FirmwareError> {
        tracing::debug!("Macro on {} pausable: {}", channel, pausable);
        self.transact(&format!("M98 R{}", u8::from(pausable)), self.reply_timeout).await?;
        Ok(())
    }

    async fn request_full_update(&self) {
        self.stale.store(true, Ordering::Release);
    }

    async fn wait_for_full_update(&self) -> Result<(), FirmwareError> {
        self.transact("M409 F\"d99f\"", self.reply_timeout).await?;
        self.stale.store(false, Ordering::Release);
        Ok(())
    }
}
