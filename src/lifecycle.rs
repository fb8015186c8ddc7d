// src/lifecycle.rs - Process termination requests
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Termination {
    pub code: i32,
    pub reason: String,
}

/// Carries the request to exit the process. `main` waits on it; handlers
/// schedule it after fatal timeouts, host resets and firmware updates.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    termination: Arc<watch::Sender<Option<Termination>>>,
    shutdown: CancellationToken,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            termination: Arc::new(watch::Sender::new(None)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Requests termination. The first request wins; later ones are logged
    /// and dropped.
    pub fn schedule_termination(&self, code: i32, reason: impl Into<String>) {
        let reason = reason.into();
        let scheduled = self.termination.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(Termination { code, reason: reason.clone() });
            true
        });
        if scheduled {
            tracing::warn!("Terminating with code {}: {}", code, reason);
            self.shutdown.cancel();
        } else {
            tracing::debug!("Termination already scheduled, ignoring: {}", reason);
        }
    }

    pub fn is_terminating(&self) -> bool {
        self.termination.borrow().is_some()
    }

    pub fn requested(&self) -> Option<Termination> {
        self.termination.borrow().clone()
    }

    /// Fires once termination has been requested. Codes that should not
    /// outlive the process take a child of it.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Termination>> {
        self.termination.subscribe()
    }

    /// Resolves once termination has been requested.
    pub async fn terminated(&self) -> Termination {
        let mut rx = self.subscribe();
        loop {
            if let Some(termination) = rx.borrow_and_update().clone() {
                return termination;
            }
            if rx.changed().await.is_err() {
                // unreachable while `self` holds the sender
                std::future::pending::<()>().await;
            }
        }
    }
}
