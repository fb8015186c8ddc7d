//! Shared fixtures for the integration tests: a scripted firmware, a
//! recording plugin manager and a handler on a scratch volume.
#![allow(dead_code)]

use async_trait::async_trait;
use gantry_host::channel::Channel;
use gantry_host::command::{Command, Message};
use gantry_host::config::HostConfig;
use gantry_host::dispatch::CommandDispatcher;
use gantry_host::files::{ChannelFileRegistry, VolumeResolver};
use gantry_host::firmware::uf2::{BLOCK_SIZE, MAGIC_END, MAGIC_START0, MAGIC_START1};
use gantry_host::firmware::{FirmwareError, FirmwareLink, MotionLock};
use gantry_host::handler::{CommandHandler, HandlerServices};
use gantry_host::job::JobController;
use gantry_host::lifecycle::Lifecycle;
use gantry_host::model::{Board, ObjectModel, ObjectModelStore};
use gantry_host::plugins::PluginManager;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

type CallLog = Arc<Mutex<Vec<String>>>;

/// Firmware double that records every call and answers from a script.
#[derive(Debug, Default)]
pub struct ScriptedFirmware {
    pub(crate) calls: CallLog,
    /// How long emergency stop and reset take to complete.
    pub action_delay: Duration,
    /// How long each forwarded code takes.
    pub execute_delay: Duration,
    /// Forwarded codes starting with this text are rejected.
    pub reject_prefix: Option<String>,
    pub fail_update: bool,
    /// The board never reports back after an update.
    pub fail_resync: bool,
    pub flashed: Mutex<Option<(Vec<u8>, Vec<u8>)>>,
    pub(crate) updating: AtomicBool,
    pub(crate) update_done: Notify,
}

impl ScriptedFirmware {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Holds `wait_for_pending_update` until `finish_update` is called.
    pub fn begin_update(&self) {
        self.updating.store(true, Ordering::SeqCst);
    }

    pub fn finish_update(&self) {
        self.updating.store(false, Ordering::SeqCst);
        self.update_done.notify_waiters();
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

#[async_trait]
impl FirmwareLink for ScriptedFirmware {
    async fn execute(&self, command: &Command) -> Result<Message, FirmwareError> {
        tokio::time::sleep(self.execute_delay).await;
        let text = command.text();
        self.record(format!("execute {}", text));
        match &self.reject_prefix {
            Some(prefix) if text.starts_with(prefix.as_str()) => {
                Err(FirmwareError::Rejected(format!("Error: {} is not allowed", text)))
            }
            _ => Ok(Message::ok()),
        }
    }

    async fn wait_for_pending_update(&self) -> Result<(), FirmwareError> {
        loop {
            let notified = self.update_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.updating.load(Ordering::SeqCst) {
                return Ok(());
            }
            notified.await;
        }
    }

    async fn emergency_stop(&self) -> Result<(), FirmwareError> {
        tokio::time::sleep(self.action_delay).await;
        self.record("emergency_stop");
        Ok(())
    }

    async fn reset_firmware(&self) -> Result<(), FirmwareError> {
        tokio::time::sleep(self.action_delay).await;
        self.record("reset");
        Ok(())
    }

    async fn update_firmware(&self, boot_image: Vec<u8>, firmware_image: Vec<u8>) -> Result<(), FirmwareError> {
        self.record("update");
        if self.fail_update {
            return Err(FirmwareError::Update("flash verification failed".to_string()));
        }
        *self.flashed.lock().unwrap() = Some((boot_image, firmware_image));
        Ok(())
    }

    async fn lock_all_motion_and_wait_for_standstill(&self, channel: Channel) -> Result<MotionLock, FirmwareError> {
        self.record(format!("lock {}", channel));
        let calls = self.calls.clone();
        Ok(MotionLock::new(move || calls.lock().unwrap().push("unlock".to_string())))
    }

    async fn set_macro_pausable(&self, _channel: Channel, pausable: bool) -> Result<(), FirmwareError> {
        self.record(format!("pausable {}", pausable));
        Ok(())
    }

    async fn request_full_update(&self) {
        self.record("request_full_update");
    }

    async fn wait_for_full_update(&self) -> Result<(), FirmwareError> {
        self.record("full_update");
        if self.fail_resync {
            return Err(FirmwareError::Timeout(Duration::from_secs(4)));
        }
        Ok(())
    }
}

/// Plugin manager that only keeps track of names.
#[derive(Debug, Default)]
pub struct RecordingPlugins {
    running: Mutex<Vec<String>>,
    pub starts: Mutex<Vec<Vec<String>>>,
}

impl RecordingPlugins {
    pub fn with_running(names: &[&str]) -> Self {
        Self {
            running: Mutex::new(names.iter().map(|n| n.to_string()).collect()),
            starts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl PluginManager for RecordingPlugins {
    async fn stop_all(&self) -> Vec<String> {
        std::mem::take(&mut *self.running.lock().unwrap())
    }

    async fn start(&self, names: &[String]) {
        self.starts.lock().unwrap().push(names.to_vec());
        self.running.lock().unwrap().extend(names.iter().cloned());
    }

    async fn running(&self) -> Vec<String> {
        self.running.lock().unwrap().clone()
    }
}

pub struct Harness {
    pub handler: Arc<CommandHandler>,
    pub firmware: Arc<ScriptedFirmware>,
    pub plugins: Arc<RecordingPlugins>,
    pub dir: TempDir,
}

impl Harness {
    pub fn new(firmware: ScriptedFirmware) -> Self {
        Self::build(firmware, RecordingPlugins::default(), |config| config)
    }

    pub fn build(
        firmware: ScriptedFirmware,
        plugins: RecordingPlugins,
        configure: impl FnOnce(HostConfig) -> HostConfig,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = configure(HostConfig {
            hostname: Some("gantry-01".to_string()),
            base_directory: dir.path().to_path_buf(),
            firmware_directory: dir.path().join("store"),
            ..HostConfig::default()
        });
        let firmware = Arc::new(firmware);
        let plugins = Arc::new(plugins);
        let files = Arc::new(ChannelFileRegistry::new(config.compatibility));
        let mut model = ObjectModel::default();
        model.network.name = "gantry-01".to_string();
        model.boards.push(Board {
            name: "Duet 3 MB6HC".to_string(),
            short_name: "MB6HC".to_string(),
            firmware_version: "3.5.0".to_string(),
            firmware_file_name: "Duet3Firmware_MB6HC.bin".to_string(),
            iap_file_name_sbc: "Duet3_SBCiap32_MB6HC.bin".to_string(),
        });
        let handler = CommandHandler::new(
            config.clone(),
            HandlerServices {
                dispatcher: CommandDispatcher::new(files),
                job: Arc::new(JobController::new()),
                model: ObjectModelStore::new(model),
                resolver: Arc::new(VolumeResolver::single(config.base_directory.clone())),
                firmware: firmware.clone(),
                plugins: plugins.clone(),
                lifecycle: Lifecycle::new(),
            },
        );
        Self { handler: Arc::new(handler), firmware, plugins, dir }
    }

    /// Writes a file below the volume root, creating its directories.
    pub fn write(&self, relative: &str, contents: impl AsRef<[u8]>) -> std::path::PathBuf {
        let path = self.dir.path().join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, contents).unwrap();
        path
    }

    pub async fn run(&self, line: &str, channel: Channel) -> Message {
        let mut command = Command::parse(line, channel).unwrap();
        self.handler.execute(&mut command).await.unwrap()
    }
}

/// Wraps `payload` into a single-block UF2 container at `address`.
pub fn uf2_image(address: u32, payload: &[u8]) -> Vec<u8> {
    let mut block = vec![0u8; BLOCK_SIZE];
    block[0..4].copy_from_slice(&MAGIC_START0.to_le_bytes());
    block[4..8].copy_from_slice(&MAGIC_START1.to_le_bytes());
    block[12..16].copy_from_slice(&address.to_le_bytes());
    block[16..20].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    block[24..28].copy_from_slice(&1u32.to_le_bytes());
    block[32..32 + payload.len()].copy_from_slice(payload);
    block[508..512].copy_from_slice(&MAGIC_END.to_le_bytes());
    block
}
