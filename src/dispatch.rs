// src/dispatch.rs - Per-channel ordering barrier
//
// Every code accepted on a channel gets a sequence number and stays pending
// until its ticket is dropped. A flush waits until no code accepted before
// the caller is still pending, which makes the side effects of earlier codes
// (local or on the firmware) visible to the caller.
use crate::channel::Channel;
use crate::command::Command;
use crate::files::ChannelFileRegistry;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, PartialEq)]
pub enum DispatchError {
    #[error("Channel {0} is not accepting codes")]
    ChannelClosed(Channel),
}

#[derive(Debug, Default)]
struct ChannelQueue {
    next_sequence: u64,
    pending: BTreeSet<u64>,
    closed: bool,
}

enum Barrier {
    Clear,
    Blocked,
    Closed,
}

#[derive(Debug)]
struct DispatcherInner {
    queues: [Mutex<ChannelQueue>; Channel::COUNT],
    changed: [Notify; Channel::COUNT],
    files: Arc<ChannelFileRegistry>,
}

impl DispatcherInner {
    fn queue(&self, channel: Channel) -> std::sync::MutexGuard<'_, ChannelQueue> {
        // A poisoned queue only means a panic elsewhere; the set itself is intact
        self.queues[channel.index()].lock().unwrap_or_else(|e| e.into_inner())
    }

    fn complete(&self, channel: Channel, sequence: u64) {
        self.queue(channel).pending.remove(&sequence);
        self.changed[channel.index()].notify_waiters();
    }

    fn barrier(&self, channel: Channel, before: u64) -> Barrier {
        let queue = self.queue(channel);
        if queue.closed {
            Barrier::Closed
        } else if queue.pending.first().is_some_and(|&oldest| oldest < before) {
            Barrier::Blocked
        } else {
            Barrier::Clear
        }
    }
}

/// Keeps a code pending on its channel until dropped.
#[derive(Debug)]
pub struct Ticket {
    inner: Arc<DispatcherInner>,
    channel: Channel,
    sequence: u64,
}

impl Ticket {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.inner.complete(self.channel, self.sequence);
    }
}

#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    inner: Arc<DispatcherInner>,
}

impl CommandDispatcher {
    pub fn new(files: Arc<ChannelFileRegistry>) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                queues: std::array::from_fn(|_| Mutex::new(ChannelQueue::default())),
                changed: std::array::from_fn(|_| Notify::new()),
                files,
            }),
        }
    }

    pub fn files(&self) -> &Arc<ChannelFileRegistry> {
        &self.inner.files
    }

    /// Registers the code on its channel and stamps its sequence number.
    /// The returned ticket must live until the code's effects are complete.
    pub fn accept(&self, command: &mut Command) -> Result<Ticket, DispatchError> {
        let channel = command.channel;
        let mut queue = self.inner.queue(channel);
        if queue.closed {
            return Err(DispatchError::ChannelClosed(channel));
        }
        let sequence = queue.next_sequence;
        queue.next_sequence += 1;
        queue.pending.insert(sequence);
        drop(queue);
        command.set_sequence(sequence);
        Ok(Ticket { inner: self.inner.clone(), channel, sequence })
    }

    /// Waits until every code accepted on the command's channel before it has
    /// finished. With `sync_file_streams` the channel's pending upload writes
    /// are flushed as well. Returns false if the channel was closed or the
    /// command was cancelled while waiting; the caller must then treat the
    /// command as cancelled. Prioritized codes do not wait for earlier codes
    /// but still fail on a closed channel.
    pub async fn flush(&self, command: &Command, sync_file_streams: bool) -> bool {
        let before = match command.sequence() {
            _ if command.is_prioritized() => 0,
            Some(sequence) => sequence,
            None => self.inner.queue(command.channel).next_sequence,
        };
        self.flush_until(command.channel, before, sync_file_streams, command.cancellation()).await
    }

    /// Flushes everything accepted on `channel` so far.
    pub async fn flush_channel(&self, channel: Channel, cancel: &CancellationToken) -> bool {
        let before = self.inner.queue(channel).next_sequence;
        self.flush_until(channel, before, false, cancel).await
    }

    async fn flush_until(&self, channel: Channel, before: u64, sync_file_streams: bool, cancel: &CancellationToken) -> bool {
        loop {
            let notified = self.inner.changed[channel.index()].notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.inner.barrier(channel, before) {
                Barrier::Clear => break,
                Barrier::Closed => {
                    tracing::debug!("Flush on {} aborted, channel closed", channel);
                    return false;
                }
                Barrier::Blocked => {}
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                _ = &mut notified => {}
            }
        }
        if cancel.is_cancelled() {
            return false;
        }

        if sync_file_streams {
            match self.inner.files.sync(channel, cancel).await {
                Ok(()) => {}
                Err(crate::files::FileWriteError::Cancelled) => return false,
                Err(e) => tracing::warn!("Failed to sync upload on {}: {}", channel, e),
            }
        }
        true
    }

    /// Tears the channel down. Pending and future flushes on it fail until
    /// it is reopened.
    pub fn close(&self, channel: Channel) {
        self.inner.queue(channel).closed = true;
        self.inner.changed[channel.index()].notify_waiters();
        tracing::info!("Channel {} closed", channel);
    }

    pub fn reopen(&self, channel: Channel) {
        self.inner.queue(channel).closed = false;
    }

    pub fn is_open(&self, channel: Channel) -> bool {
        !self.inner.queue(channel).closed
    }

    pub fn pending(&self, channel: Channel) -> usize {
        self.inner.queue(channel).pending.len()
    }
}
