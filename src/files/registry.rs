// src/files/registry.rs - Per-channel upload slots (M28/M29)
use crate::channel::Channel;
use crate::command::Message;
use crate::config::Compatibility;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum FileWriteError {
    #[error("Another file is already being written to")]
    AlreadyWriting,
    #[error("Cancelled")]
    Cancelled,
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// An open output stream owned by one channel.
#[derive(Debug)]
pub struct FileWriteSlot {
    pub name: String,
    pub path: PathBuf,
    pub lines: u64,
    writer: BufWriter<File>,
}

/// At most one open upload per channel. Every operation holds the channel's
/// lock for its whole duration, so lines of one upload never interleave with
/// the begin or end of another.
#[derive(Debug)]
pub struct ChannelFileRegistry {
    slots: [Mutex<Option<FileWriteSlot>>; Channel::COUNT],
    compatibility: Compatibility,
}

impl ChannelFileRegistry {
    pub fn new(compatibility: Compatibility) -> Self {
        Self {
            slots: std::array::from_fn(|_| Mutex::new(None)),
            compatibility,
        }
    }

    async fn lock(
        &self,
        channel: Channel,
        cancel: &CancellationToken,
    ) -> Result<MutexGuard<'_, Option<FileWriteSlot>>, FileWriteError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FileWriteError::Cancelled),
            guard = self.slots[channel.index()].lock() => Ok(guard),
        }
    }

    /// Opens (creating or truncating) `path` for the channel. `name` is the
    /// file name echoed back to the client.
    pub async fn begin_write(
        &self,
        channel: Channel,
        name: &str,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<Message, FileWriteError> {
        let mut slot = self.lock(channel, cancel).await?;
        if slot.is_some() {
            return Err(FileWriteError::AlreadyWriting);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = File::create(path).await?;
        tracing::debug!("{} started writing {}", channel, path.display());
        *slot = Some(FileWriteSlot {
            name: name.to_string(),
            path: path.to_path_buf(),
            lines: 0,
            writer: BufWriter::new(file),
        });
        Ok(match self.compatibility {
            Compatibility::Marlin | Compatibility::NanoDlp => Message::success(format!("Writing to file: {}", name)),
            Compatibility::RepRapFirmware => Message::ok(),
        })
    }

    /// Closes the channel's upload. Without an open upload this is a no-op.
    pub async fn end_write(&self, channel: Channel, cancel: &CancellationToken) -> Result<Message, FileWriteError> {
        let mut slot = self.lock(channel, cancel).await?;
        let Some(mut open) = slot.take() else {
            return Ok(Message::ok());
        };
        open.writer.flush().await?;
        open.writer.get_mut().sync_all().await?;
        tracing::debug!("{} finished writing {} ({} lines)", channel, open.path.display(), open.lines);
        Ok(match self.compatibility {
            Compatibility::Marlin => Message::success("Done saving file."),
            _ => Message::ok(),
        })
    }

    /// Appends a line to the channel's upload. Returns false when no upload
    /// is open, in which case the caller executes the line instead.
    pub async fn write_line(&self, channel: Channel, line: &str, cancel: &CancellationToken) -> Result<bool, FileWriteError> {
        let mut slot = self.lock(channel, cancel).await?;
        let Some(open) = slot.as_mut() else {
            return Ok(false);
        };
        open.writer.write_all(line.as_bytes()).await?;
        open.writer.write_all(b"\n").await?;
        open.lines += 1;
        Ok(true)
    }

    /// Waits for writes in progress on the channel and pushes buffered data
    /// of an open upload to disk.
    pub async fn sync(&self, channel: Channel, cancel: &CancellationToken) -> Result<(), FileWriteError> {
        let mut slot = self.lock(channel, cancel).await?;
        if let Some(open) = slot.as_mut() {
            open.writer.flush().await?;
        }
        Ok(())
    }

    pub async fn is_writing(&self, channel: Channel) -> bool {
        self.slots[channel.index()].lock().await.is_some()
    }

    /// Open uploads for diagnostics. Channels whose lock is busy are
    /// reported without a file name rather than waited for.
    pub fn open_uploads(&self) -> Vec<(Channel, Option<String>)> {
        Channel::ALL
            .iter()
            .filter_map(|&channel| match self.slots[channel.index()].try_lock() {
                Ok(slot) => slot.as_ref().map(|open| (channel, Some(open.name.clone()))),
                Err(_) => Some((channel, None)),
            })
            .collect()
    }
}
