// src/handler/mod.rs - Local handling of codes before and after the firmware
//
// `process` decides per code whether the host answers it itself (Some) or
// hands it on to the firmware unchanged (None). `react_to_executed` runs
// after a code has completed successfully, wherever it was executed.

/// Returns the error side of a `Result<_, impl Into<Message>>` as the
/// code's result.
macro_rules! try_message {
    ($e:expr) => {
        match $e {
            Ok(value) => value,
            Err(message) => return Ok(Some(crate::command::Message::from(message))),
        }
    };
}

mod feed;
mod files;
mod firmware;
mod job;
mod react;
mod settings;
mod stop;

pub use feed::run_file_feed;
pub use firmware::FIRMWARE_ACTION_TIMEOUT;
pub use settings::is_local_model_key;

use crate::channel::Channel;
use crate::command::{CodeType, Command, CommandParseError, Message};
use crate::config::HostConfig;
use crate::dispatch::CommandDispatcher;
use crate::files::{ChannelFileRegistry, FileDirectory, FileWriteError, PathResolver};
use crate::firmware::{FirmwareError, FirmwareLink};
use crate::job::{JobController, JobGuard};
use crate::lifecycle::Lifecycle;
use crate::model::ObjectModelStore;
use crate::plugins::PluginManager;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum HandlerError {
    /// The code was cancelled while waiting; it has no result.
    #[error("Cancelled")]
    Cancelled,
    #[error("Unsupported code {0}")]
    Unsupported(String),
    #[error("{action} timed out after {after:?}")]
    Timeout { action: &'static str, after: Duration },
    #[error(transparent)]
    Firmware(#[from] FirmwareError),
    #[error(transparent)]
    Parse(#[from] CommandParseError),
}

type Handled = Result<Option<Message>, HandlerError>;

/// The collaborators a handler works with.
pub struct HandlerServices {
    pub dispatcher: CommandDispatcher,
    pub job: Arc<JobController>,
    pub model: ObjectModelStore,
    pub resolver: Arc<dyn PathResolver>,
    pub firmware: Arc<dyn FirmwareLink>,
    pub plugins: Arc<dyn PluginManager>,
    pub lifecycle: Lifecycle,
}

pub struct CommandHandler {
    config: HostConfig,
    dispatcher: CommandDispatcher,
    job: Arc<JobController>,
    model: ObjectModelStore,
    resolver: Arc<dyn PathResolver>,
    firmware: Arc<dyn FirmwareLink>,
    plugins: Arc<dyn PluginManager>,
    lifecycle: Lifecycle,
    started: Instant,
}

impl CommandHandler {
    pub fn new(config: HostConfig, services: HandlerServices) -> Self {
        Self {
            config,
            dispatcher: services.dispatcher,
            job: services.job,
            model: services.model,
            resolver: services.resolver,
            firmware: services.firmware,
            plugins: services.plugins,
            lifecycle: services.lifecycle,
            started: Instant::now(),
        }
    }

    pub fn job(&self) -> &Arc<JobController> {
        &self.job
    }

    pub fn model(&self) -> &ObjectModelStore {
        &self.model
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn files(&self) -> &ChannelFileRegistry {
        self.dispatcher.files()
    }

    /// Handles the code locally if it is one of ours. `Ok(None)` means the
    /// code goes to the firmware as it is.
    pub async fn process(&self, command: &mut Command) -> Handled {
        if command.is_cancelled() {
            return Err(HandlerError::Cancelled);
        }

        // while an upload is open every line of that channel is file content
        if !command.is(CodeType::M, 28) && !command.is(CodeType::M, 29) {
            let line = command.line().map(str::to_string).unwrap_or_else(|| command.text());
            match self.files().write_line(command.channel, &line, command.cancellation()).await {
                Ok(true) => return Ok(Some(Message::ok())),
                Ok(false) => {}
                Err(FileWriteError::Cancelled) => return Err(HandlerError::Cancelled),
                Err(e) => return Ok(Some(Message::error(format!("Failed to write upload line: {}", e)))),
            }
        }

        let major = match (command.code_type, command.major) {
            (CodeType::Keyword, _) | (CodeType::M, None) => {
                return Err(HandlerError::Unsupported(command.text()));
            }
            (_, Some(major)) if !(0..=9999).contains(&major) => {
                return Err(HandlerError::Unsupported(command.text()));
            }
            (CodeType::G | CodeType::T, _) => return Ok(None),
            (CodeType::M, Some(major)) => major,
        };

        // firmware requests are only served for file codes and M505
        if command.is_from_firmware() && !(20..=38).contains(&major) && major != 505 {
            return Ok(None);
        }

        tracing::debug!("{} -> M{}", command.channel, major);
        match major {
            0 | 1 | 2 => stop::stop(self, command).await,
            20 => files::list_directory(self, command).await,
            23 => job::select_file(self, command, false).await,
            24 => job::start_or_resume(self, command).await,
            26 => job::set_file_position(self, command).await,
            27 => job::report_file_position(self, command).await,
            28 => files::begin_upload(self, command).await,
            29 => files::end_upload(self, command).await,
            30 => files::delete(self, command).await,
            32 => job::select_file(self, command, false).await,
            36 => files::file_info(self, command).await,
            37 => job::simulate(self, command).await,
            38 => files::checksum(self, command).await,
            98 => settings::macro_pausable(self, command).await,
            112 => firmware::emergency_stop(self, command).await,
            409 => settings::query_model(self, command).await,
            470 => files::create_directory(self, command).await,
            471 => files::rename(self, command).await,
            505 => settings::system_directory(self, command).await,
            550 => settings::machine_name(self, command).await,
            551 => settings::password(self, command).await,
            586 => settings::cors(self, command).await,
            606 => job::fork(self, command).await,
            929 => settings::logging(self, command).await,
            997 => firmware::update(self, command).await,
            999 => firmware::reset(self, command).await,
            _ => Ok(None),
        }
    }

    /// Follow-up for a successfully executed code.
    pub async fn react_to_executed(&self, command: &mut Command) {
        react::react(self, command).await
    }

    /// Runs a code end to end: registers it on its channel, handles it
    /// locally or forwards it, stores the result and reacts to it.
    pub async fn execute(&self, command: &mut Command) -> Result<Message, HandlerError> {
        let _ticket = self.dispatcher.accept(command).map_err(|e| {
            tracing::debug!("{}", e);
            HandlerError::Cancelled
        })?;

        let message = match self.process(command).await? {
            Some(message) => message,
            None => match self.firmware_call(command, self.firmware.execute(command)).await {
                Err(HandlerError::Firmware(FirmwareError::Rejected(reason))) => Message::error(reason),
                other => other?,
            },
        };
        if command.set_result(message).is_err() {
            tracing::warn!("Result of {} already set", command);
        }
        self.react_to_executed(command).await;
        Ok(command.result().cloned().unwrap_or_else(Message::ok))
    }

    /// Runs one received line on `channel`. A line that does not parse is
    /// still stored when the channel has an upload open.
    pub async fn execute_line(&self, line: &str, channel: Channel, cancel: CancellationToken) -> Result<Message, HandlerError> {
        let parse_error = match Command::parse(line, channel) {
            Ok(command) => return self.execute(&mut command.with_cancellation(cancel)).await,
            Err(e) => e,
        };

        // keeps the line in order behind the codes already on the channel
        let mut placeholder = Command::new(channel, CodeType::Keyword, None).with_cancellation(cancel);
        placeholder.set_line(line);
        let _ticket = self.dispatcher.accept(&mut placeholder).map_err(|_| HandlerError::Cancelled)?;
        self.flush(&placeholder, false).await?;
        match self.files().write_line(channel, placeholder.line().unwrap_or(line), placeholder.cancellation()).await {
            Ok(true) => Ok(Message::ok()),
            Ok(false) => Err(HandlerError::Parse(parse_error)),
            Err(FileWriteError::Cancelled) => Err(HandlerError::Cancelled),
            Err(e) => Ok(Message::error(format!("Failed to write upload line: {}", e))),
        }
    }

    /// Flushes the code's channel; a failed flush cancels the code.
    async fn flush(&self, command: &Command, sync_file_streams: bool) -> Result<(), HandlerError> {
        if self.dispatcher.flush(command, sync_file_streams).await {
            Ok(())
        } else {
            Err(HandlerError::Cancelled)
        }
    }

    async fn lock_job(&self, command: &Command) -> Result<JobGuard<'_>, HandlerError> {
        // waiting for the lock only fails on cancellation
        self.job.lock(command.cancellation()).await.map_err(|_| HandlerError::Cancelled)
    }

    /// Awaits a firmware call unless the code is cancelled first.
    async fn firmware_call<T>(
        &self,
        command: &Command,
        call: impl Future<Output = Result<T, FirmwareError>>,
    ) -> Result<T, HandlerError> {
        tokio::select! {
            biased;
            _ = command.cancellation().cancelled() => Err(HandlerError::Cancelled),
            result = call => result.map_err(HandlerError::Firmware),
        }
    }

    /// Physical path of a code's file argument, relative to a well-known
    /// directory.
    async fn physical_path(&self, path: &str, base: FileDirectory) -> Result<PathBuf, Message> {
        let model = self.model.read().await;
        let base = base.virtual_path(&model.directories).to_string();
        drop(model);
        self.resolver
            .to_physical(path, &base)
            .map_err(|e| Message::error(e.to_string()))
    }

    /// Virtual form of a path argument, for messages and the job file name.
    async fn virtual_path(&self, path: &str, base: FileDirectory) -> String {
        match self.physical_path(path, base).await {
            Ok(physical) => self.resolver.to_virtual(&physical).unwrap_or_else(|| path.to_string()),
            Err(_) => path.to_string(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use crate::channel::Channel;
    use crate::config::Compatibility;
    use crate::files::VolumeResolver;
    use crate::firmware::serial::SerialFirmwareLink;
    use crate::model::ObjectModel;
    use crate::plugins::ProcessPlugins;
    use std::path::Path;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    /// Handler on a scratch `0:` volume with no firmware attached.
    pub fn handler_with_root() -> (CommandHandler, TempDir) {
        handler_with_compatibility(Compatibility::RepRapFirmware)
    }

    pub fn handler_with_compatibility(compatibility: Compatibility) -> (CommandHandler, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let files = Arc::new(ChannelFileRegistry::new(compatibility));
        let config = HostConfig { compatibility, hostname: Some("gantry-01".to_string()), ..HostConfig::default() };
        let handler = CommandHandler::new(
            config,
            HandlerServices {
                dispatcher: CommandDispatcher::new(files),
                job: Arc::new(JobController::new()),
                model: ObjectModelStore::new(ObjectModel::default()),
                resolver: Arc::new(VolumeResolver::single(dir.path())),
                firmware: Arc::new(SerialFirmwareLink::offline(Duration::from_millis(10))),
                plugins: Arc::new(ProcessPlugins::new()),
                lifecycle: Lifecycle::new(),
            },
        );
        (handler, dir)
    }

    /// Writes `0:/gcodes/<name>` and starts it as the job.
    pub async fn select_and_start(handler: &CommandHandler, root: &Path, name: &str) {
        let path = root.join("gcodes").join(name);
        std::fs::create_dir_all(root.join("gcodes")).unwrap();
        std::fs::write(&path, "G28\nG1 X10\n").unwrap();
        let mut job = handler.job().lock(&CancellationToken::new()).await.unwrap();
        job.select_file(&format!("0:/gcodes/{}", name), path, 11, false, Channel::Http).unwrap();
        job.resume().unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::handler::tests_support::handler_with_root;

    #[tokio::test]
    async fn motion_codes_are_forwarded() {
        let (handler, _dir) = handler_with_root();
        let mut command = Command::parse("G1 X10 F3000", Channel::Http).unwrap();
        assert_eq!(handler.process(&mut command).await.unwrap(), None);
        let mut command = Command::parse("M104 S200", Channel::Http).unwrap();
        assert_eq!(handler.process(&mut command).await.unwrap(), None);
    }

    #[tokio::test]
    async fn keywords_and_out_of_range_codes_are_unsupported() {
        let (handler, _dir) = handler_with_root();
        let mut keyword = Command::parse("echo 1", Channel::Http).unwrap();
        assert!(matches!(handler.process(&mut keyword).await, Err(HandlerError::Unsupported(_))));
        let mut huge = Command::mcode(Channel::Http, 10000);
        assert!(matches!(handler.process(&mut huge).await, Err(HandlerError::Unsupported(_))));
        let mut bare = Command::new(Channel::Http, CodeType::M, None);
        assert!(matches!(handler.process(&mut bare).await, Err(HandlerError::Unsupported(_))));
    }

    #[tokio::test]
    async fn firmware_requests_only_reach_file_codes() {
        let (handler, _dir) = handler_with_root();
        let mut request = Command::parse("M551 Psecret", Channel::Sbc)
            .unwrap()
            .with_flags(crate::command::CommandFlags::FROM_FIRMWARE);
        assert_eq!(handler.process(&mut request).await.unwrap(), None);
        assert!(handler.model.read().await.network.password.is_none());
    }

    #[tokio::test]
    async fn cancelled_codes_have_no_result() {
        let (handler, _dir) = handler_with_root();
        let mut command = Command::mcode(Channel::Http, 20);
        command.cancellation().cancel();
        assert!(matches!(handler.process(&mut command).await, Err(HandlerError::Cancelled)));
    }
}
