// src/job/mod.rs - Print job lifecycle
//
// The controller is the only owner of the job state. Everything that
// inspects or changes it goes through `JobController::lock`, and every
// operation lives on the returned guard, so a state check and the mutation
// that depends on it cannot be separated by another channel.
use crate::channel::Channel;
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio_util::sync::CancellationToken;

/// Independent readers of the job file: the primary feed and the forked one.
pub const MOTION_SYSTEMS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum JobState {
    Idle,
    FileSelected,
    Processing,
    Paused,
    Cancelling,
    Simulating,
    SimulationPaused,
}

impl JobState {
    pub fn name(self) -> &'static str {
        match self {
            JobState::Idle => "idle",
            JobState::FileSelected => "file selected",
            JobState::Processing => "processing",
            JobState::Paused => "paused",
            JobState::Cancelling => "cancelling",
            JobState::Simulating => "simulating",
            JobState::SimulationPaused => "simulation paused",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum JobError {
    #[error("Cannot set file to print, because a file is already being printed")]
    AlreadyProcessing,
    #[error("Cannot print, because no file is selected!")]
    NoFileSelected,
    #[error("Pause the print before attempting to cancel it")]
    NotPaused,
    #[error("Cannot {action} while the job is {state}")]
    InvalidTransition { action: &'static str, state: &'static str },
    #[error("Invalid motion system index {0}")]
    InvalidMotionSystem(i64),
    #[error("File position {0} is beyond the end of the file")]
    InvalidPosition(u64),
    #[error("The secondary file channel is not available")]
    SecondaryUnavailable,
    #[error("The secondary file channel is already running")]
    SecondaryRunning,
    #[error("Failed to read job file: {0}")]
    Io(String),
    #[error("Cancelled")]
    Cancelled,
}

#[derive(Debug)]
struct JobFile {
    name: String,
    path: PathBuf,
    size: u64,
    positions: [u64; MOTION_SYSTEMS],
    valid: [bool; MOTION_SYSTEMS],
    readers: [Option<BufReader<File>>; MOTION_SYSTEMS],
}

impl JobFile {
    fn new(name: &str, path: PathBuf, size: u64) -> Self {
        Self {
            name: name.to_string(),
            path,
            size,
            positions: [0; MOTION_SYSTEMS],
            valid: [true, false],
            readers: [None, None],
        }
    }
}

#[derive(Debug)]
struct JobInner {
    state: JobState,
    simulate: bool,
    file: Option<JobFile>,
    secondary_running: bool,
}

enum Feed {
    Run,
    Wait,
    Stop,
}

impl JobInner {
    fn feed(&self, system: usize) -> Feed {
        let Some(file) = &self.file else {
            return Feed::Stop;
        };
        if !file.valid[system] {
            return Feed::Stop;
        }
        if system > 0 {
            return if self.secondary_running { Feed::Run } else { Feed::Stop };
        }
        match self.state {
            JobState::Processing | JobState::Simulating => Feed::Run,
            JobState::FileSelected | JobState::Paused | JobState::SimulationPaused => Feed::Wait,
            JobState::Cancelling | JobState::Idle => Feed::Stop,
        }
    }

    fn release_file_if_unused(&mut self) {
        if self.state == JobState::Idle && !self.secondary_running {
            self.file = None;
            self.simulate = false;
        }
    }
}

/// Read-only view for status reports and diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub state: JobState,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub positions: [u64; MOTION_SYSTEMS],
    pub simulating: bool,
    pub secondary_running: bool,
}

#[derive(Debug)]
pub struct JobController {
    inner: Mutex<JobInner>,
    dispatch: Notify,
}

impl Default for JobController {
    fn default() -> Self {
        Self::new()
    }
}

impl JobController {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(JobInner {
                state: JobState::Idle,
                simulate: false,
                file: None,
                secondary_running: false,
            }),
            dispatch: Notify::new(),
        }
    }

    /// Takes the job lock. Waiting is abandoned when `cancel` fires.
    pub async fn lock(&self, cancel: &CancellationToken) -> Result<JobGuard<'_>, JobError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(JobError::Cancelled),
            inner = self.inner.lock() => Ok(JobGuard { inner, controller: self }),
        }
    }

    pub async fn snapshot(&self) -> JobSnapshot {
        let inner = self.inner.lock().await;
        JobSnapshot {
            state: inner.state,
            file_name: inner.file.as_ref().map(|f| f.name.clone()),
            file_size: inner.file.as_ref().map(|f| f.size),
            positions: inner.file.as_ref().map(|f| f.positions).unwrap_or_default(),
            simulating: inner.simulate,
            secondary_running: inner.secondary_running,
        }
    }

    pub async fn state(&self) -> JobState {
        self.inner.lock().await.state
    }

    /// Next line of the job file for the given motion system. Waits while the
    /// primary feed is selected or paused; returns `None` once the file is
    /// finished or invalidated.
    pub async fn next_line(&self, system: usize, cancel: &CancellationToken) -> Result<Option<String>, JobError> {
        if system >= MOTION_SYSTEMS {
            return Err(JobError::InvalidMotionSystem(system as i64));
        }
        loop {
            let notified = self.dispatch.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut guard = self.lock(cancel).await?;
                match guard.inner.feed(system) {
                    Feed::Run => return guard.read_line(system).await,
                    Feed::Stop => return Ok(None),
                    Feed::Wait => {}
                }
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(JobError::Cancelled),
                _ = &mut notified => {}
            }
        }
    }

    /// Like [`next_line`](Self::next_line), but keeps waiting across job
    /// boundaries: an idle or finished feed waits for the next started job.
    /// Only cancellation ends the wait.
    pub async fn wait_for_line(&self, system: usize, cancel: &CancellationToken) -> Result<String, JobError> {
        if system >= MOTION_SYSTEMS {
            return Err(JobError::InvalidMotionSystem(system as i64));
        }
        loop {
            let notified = self.dispatch.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut guard = self.lock(cancel).await?;
                if let Feed::Run = guard.inner.feed(system) {
                    if let Some(line) = guard.read_line(system).await? {
                        return Ok(line);
                    }
                    continue;
                }
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(JobError::Cancelled),
                _ = &mut notified => {}
            }
        }
    }
}

/// Exclusive access to the job. Dropping the guard releases the job lock.
pub struct JobGuard<'a> {
    inner: MutexGuard<'a, JobInner>,
    controller: &'a JobController,
}

impl JobGuard<'_> {
    pub fn state(&self) -> JobState {
        self.inner.state
    }

    pub fn is_file_selected(&self) -> bool {
        self.inner.state != JobState::Idle
    }

    /// True from the start of processing until the job has ended, including
    /// pauses and a pending cancellation.
    pub fn is_processing(&self) -> bool {
        !matches!(self.inner.state, JobState::Idle | JobState::FileSelected)
    }

    pub fn is_paused(&self) -> bool {
        matches!(self.inner.state, JobState::Paused | JobState::SimulationPaused)
    }

    pub fn is_simulating(&self) -> bool {
        self.inner.simulate
    }

    pub fn is_secondary_running(&self) -> bool {
        self.inner.secondary_running
    }

    pub fn file_name(&self) -> Option<&str> {
        self.inner.file.as_ref().map(|f| f.name.as_str())
    }

    /// Whether `channel` is the channel the running file is fed through.
    fn owns_running_file(&self, channel: Channel) -> bool {
        match channel {
            Channel::File => self.inner.file.is_some(),
            Channel::File2 => self.inner.secondary_running,
            _ => false,
        }
    }

    /// Selects `name` (resolved to `path`, `size` bytes) as the job file. A
    /// running job may only be replaced from its own file channel.
    pub fn select_file(&mut self, name: &str, path: PathBuf, size: u64, simulate: bool, channel: Channel) -> Result<(), JobError> {
        let busy = self.is_processing() || self.inner.secondary_running;
        if busy && !self.owns_running_file(channel) {
            return Err(JobError::AlreadyProcessing);
        }
        if let Some(previous) = &mut self.inner.file {
            previous.valid = [false; MOTION_SYSTEMS];
        }
        self.inner.file = Some(JobFile::new(name, path, size));
        self.inner.simulate = simulate;
        self.inner.secondary_running = false;
        self.inner.state = JobState::FileSelected;
        tracing::info!("Selected file {} for {}", name, if simulate { "simulation" } else { "printing" });
        Ok(())
    }

    /// Called once the firmware has acknowledged a start or resume. Also
    /// completes a pending cancellation.
    pub fn resume(&mut self) -> Result<JobState, JobError> {
        let next = match self.inner.state {
            JobState::FileSelected if self.inner.simulate => JobState::Simulating,
            JobState::FileSelected | JobState::Paused => JobState::Processing,
            JobState::SimulationPaused => JobState::Simulating,
            JobState::Processing | JobState::Simulating => self.inner.state,
            JobState::Cancelling => JobState::Idle,
            JobState::Idle => return Err(JobError::NoFileSelected),
        };
        if next != self.inner.state {
            tracing::info!("Job {} -> {}", self.inner.state.name(), next.name());
        }
        self.inner.state = next;
        self.inner.release_file_if_unused();
        self.controller.dispatch.notify_waiters();
        Ok(next)
    }

    /// Called once the firmware has acknowledged a pause.
    pub fn pause(&mut self) -> Result<JobState, JobError> {
        let next = match self.inner.state {
            JobState::Processing => JobState::Paused,
            JobState::Simulating => JobState::SimulationPaused,
            JobState::Paused | JobState::SimulationPaused => self.inner.state,
            state => return Err(JobError::InvalidTransition { action: "pause", state: state.name() }),
        };
        self.inner.state = next;
        Ok(next)
    }

    /// Cancels the job on behalf of `channel`. A running job must be paused
    /// first unless the request comes from its own file channel. The file is
    /// invalidated at once; the job becomes idle when the firmware confirms.
    pub fn cancel(&mut self, channel: Channel) -> Result<JobState, JobError> {
        match self.inner.state {
            JobState::Idle => return Err(JobError::InvalidTransition { action: "cancel", state: "idle" }),
            JobState::FileSelected => {
                self.inner.state = JobState::Idle;
                self.inner.release_file_if_unused();
                return Ok(JobState::Idle);
            }
            JobState::Cancelling => return Ok(JobState::Cancelling),
            _ => {}
        }
        if !self.is_paused() && !channel.is_file_feed() {
            return Err(JobError::NotPaused);
        }
        if let Some(file) = &mut self.inner.file {
            file.valid[0] = false;
            file.readers[0] = None;
        }
        tracing::info!("Cancelling job {}", self.file_name().unwrap_or_default());
        self.inner.state = JobState::Cancelling;
        self.controller.dispatch.notify_waiters();
        Ok(JobState::Cancelling)
    }

    fn file_mut(&mut self, system: i64) -> Result<&mut JobFile, JobError> {
        if !(0..MOTION_SYSTEMS as i64).contains(&system) {
            return Err(JobError::InvalidMotionSystem(system));
        }
        self.inner.file.as_mut().ok_or(JobError::NoFileSelected)
    }

    pub fn set_file_position(&mut self, system: i64, position: u64) -> Result<(), JobError> {
        let file = self.file_mut(system)?;
        if position > file.size {
            return Err(JobError::InvalidPosition(position));
        }
        let index = system as usize;
        file.positions[index] = position;
        file.readers[index] = None;
        Ok(())
    }

    pub fn get_file_position(&mut self, system: i64) -> Result<u64, JobError> {
        let file = self.file_mut(system)?;
        Ok(file.positions[system as usize])
    }

    /// Starts the secondary feed at the primary feed's position.
    /// `secondary_available` tells whether the secondary channel can accept
    /// codes.
    pub fn fork_second_job(&mut self, secondary_available: bool) -> Result<(), JobError> {
        if !secondary_available {
            return Err(JobError::SecondaryUnavailable);
        }
        if self.inner.secondary_running {
            return Err(JobError::SecondaryRunning);
        }
        if !self.is_processing() {
            return Err(JobError::InvalidTransition { action: "fork the job", state: self.inner.state.name() });
        }
        let file = self.inner.file.as_mut().ok_or(JobError::NoFileSelected)?;
        let position = file.positions[0];
        file.positions[1] = position;
        file.valid[1] = true;
        file.readers[1] = None;
        self.inner.secondary_running = true;
        tracing::info!("Forked secondary feed at byte {}", position);
        self.controller.dispatch.notify_waiters();
        Ok(())
    }

    async fn read_line(&mut self, system: usize) -> Result<Option<String>, JobError> {
        let Some(file) = self.inner.file.as_mut() else {
            return Ok(None);
        };
        if file.readers[system].is_none() {
            let mut handle = File::open(&file.path).await.map_err(|e| JobError::Io(e.to_string()))?;
            handle
                .seek(std::io::SeekFrom::Start(file.positions[system]))
                .await
                .map_err(|e| JobError::Io(e.to_string()))?;
            file.readers[system] = Some(BufReader::new(handle));
        }
        let mut line = String::new();
        let read = match file.readers[system].as_mut() {
            Some(reader) => reader.read_line(&mut line).await.map_err(|e| JobError::Io(e.to_string()))?,
            None => 0,
        };
        if read > 0 {
            file.positions[system] += read as u64;
            return Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()));
        }

        // end of file
        file.valid[system] = false;
        file.readers[system] = None;
        if system == 0 {
            tracing::info!("Finished {}", file.name);
            self.inner.state = JobState::Idle;
        } else {
            self.inner.secondary_running = false;
        }
        self.inner.release_file_if_unused();
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn select_resume_pause_cancel() {
        let job = JobController::new();
        let cancel = token();
        let mut guard = job.lock(&cancel).await.unwrap();
        guard.select_file("0:/gcodes/print.gcode", PathBuf::from("/tmp/print.gcode"), 100, false, Channel::Http).unwrap();
        assert_eq!(guard.state(), JobState::FileSelected);
        assert_eq!(guard.resume().unwrap(), JobState::Processing);

        assert_eq!(guard.cancel(Channel::Http).unwrap_err(), JobError::NotPaused);
        assert_eq!(guard.pause().unwrap(), JobState::Paused);
        assert_eq!(guard.cancel(Channel::Http).unwrap(), JobState::Cancelling);
        assert_eq!(guard.resume().unwrap(), JobState::Idle);
        assert!(guard.file_name().is_none());
    }

    #[tokio::test]
    async fn cannot_select_while_processing_except_from_file_channel() {
        let job = JobController::new();
        let mut guard = job.lock(&token()).await.unwrap();
        guard.select_file("a.g", PathBuf::from("/a.g"), 10, false, Channel::Http).unwrap();
        guard.resume().unwrap();
        assert_eq!(
            guard.select_file("b.g", PathBuf::from("/b.g"), 10, false, Channel::Telnet).unwrap_err(),
            JobError::AlreadyProcessing
        );
        guard.select_file("b.g", PathBuf::from("/b.g"), 10, false, Channel::File).unwrap();
        assert_eq!(guard.file_name(), Some("b.g"));
        assert_eq!(guard.state(), JobState::FileSelected);
    }

    #[tokio::test]
    async fn file_channel_cancels_without_pause() {
        let job = JobController::new();
        let mut guard = job.lock(&token()).await.unwrap();
        guard.select_file("a.g", PathBuf::from("/a.g"), 10, true, Channel::Http).unwrap();
        assert_eq!(guard.resume().unwrap(), JobState::Simulating);
        assert_eq!(guard.cancel(Channel::File).unwrap(), JobState::Cancelling);
    }

    #[tokio::test]
    async fn resume_without_selection_fails() {
        let job = JobController::new();
        let mut guard = job.lock(&token()).await.unwrap();
        assert_eq!(guard.resume().unwrap_err(), JobError::NoFileSelected);
        assert!(matches!(guard.pause(), Err(JobError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn file_positions_are_per_motion_system() {
        let job = JobController::new();
        let mut guard = job.lock(&token()).await.unwrap();
        assert_eq!(guard.set_file_position(0, 5).unwrap_err(), JobError::NoFileSelected);
        guard.select_file("a.g", PathBuf::from("/a.g"), 10, false, Channel::Http).unwrap();
        guard.set_file_position(0, 7).unwrap();
        assert_eq!(guard.get_file_position(0).unwrap(), 7);
        assert_eq!(guard.get_file_position(1).unwrap(), 0);
        assert_eq!(guard.set_file_position(2, 1).unwrap_err(), JobError::InvalidMotionSystem(2));
        assert_eq!(guard.set_file_position(-1, 1).unwrap_err(), JobError::InvalidMotionSystem(-1));
        assert_eq!(guard.set_file_position(0, 11).unwrap_err(), JobError::InvalidPosition(11));
    }

    #[tokio::test]
    async fn lock_wait_is_cancellable() {
        let job = JobController::new();
        let _held = job.lock(&token()).await.unwrap();
        let cancel = token();
        cancel.cancel();
        assert!(matches!(job.lock(&cancel).await, Err(JobError::Cancelled)));
    }

    #[tokio::test]
    async fn feeds_lines_after_resume_and_stops_after_cancel() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("job.g");
        std::fs::write(&path, "G28\nG1 X10\nM400\n").unwrap();
        let job = std::sync::Arc::new(JobController::new());
        {
            let mut guard = job.lock(&token()).await.unwrap();
            guard.select_file("job.g", path.clone(), 16, false, Channel::Http).unwrap();
        }

        let reader = {
            let job = job.clone();
            tokio::spawn(async move { job.next_line(0, &CancellationToken::new()).await })
        };
        tokio::task::yield_now().await;
        job.lock(&token()).await.unwrap().resume().unwrap();
        assert_eq!(reader.await.unwrap().unwrap().as_deref(), Some("G28"));
        assert_eq!(job.next_line(0, &token()).await.unwrap().as_deref(), Some("G1 X10"));
        assert_eq!(job.snapshot().await.positions[0], 11);

        {
            let mut guard = job.lock(&token()).await.unwrap();
            guard.pause().unwrap();
            guard.cancel(Channel::Http).unwrap();
        }
        assert_eq!(job.next_line(0, &token()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn feed_waits_for_the_next_job() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("job.g");
        std::fs::write(&path, "G28\n").unwrap();
        let job = std::sync::Arc::new(JobController::new());
        let feed = {
            let job = job.clone();
            tokio::spawn(async move { job.wait_for_line(0, &CancellationToken::new()).await })
        };
        tokio::task::yield_now().await;
        assert!(!feed.is_finished());
        {
            let mut guard = job.lock(&token()).await.unwrap();
            guard.select_file("job.g", path, 4, false, Channel::Http).unwrap();
            guard.resume().unwrap();
        }
        assert_eq!(feed.await.unwrap().unwrap(), "G28");

        let cancel = token();
        cancel.cancel();
        assert_eq!(job.wait_for_line(0, &cancel).await.unwrap_err(), JobError::Cancelled);
    }

    #[tokio::test]
    async fn secondary_feed_is_independent_of_primary_pause() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("job.g");
        std::fs::write(&path, "G28\nM606 S1\nG1 X1\n").unwrap();
        let job = JobController::new();
        let mut guard = job.lock(&token()).await.unwrap();
        assert_eq!(guard.fork_second_job(false).unwrap_err(), JobError::SecondaryUnavailable);
        assert!(matches!(guard.fork_second_job(true), Err(JobError::InvalidTransition { .. })));
        guard.select_file("job.g", path, 18, false, Channel::Http).unwrap();
        guard.resume().unwrap();
        drop(guard);

        assert_eq!(job.next_line(0, &token()).await.unwrap().as_deref(), Some("G28"));
        assert_eq!(job.next_line(0, &token()).await.unwrap().as_deref(), Some("M606 S1"));
        let mut guard = job.lock(&token()).await.unwrap();
        guard.fork_second_job(true).unwrap();
        assert_eq!(guard.fork_second_job(true).unwrap_err(), JobError::SecondaryRunning);
        guard.pause().unwrap();
        drop(guard);

        assert_eq!(job.next_line(1, &token()).await.unwrap().as_deref(), Some("G1 X1"));
        assert_eq!(job.next_line(1, &token()).await.unwrap(), None);
        assert!(!job.snapshot().await.secondary_running);
        assert_eq!(job.state().await, JobState::Paused);
    }
}
