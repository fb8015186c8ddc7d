// src/plugins.rs - Extension processes started alongside the host
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// Control over extension processes. A firmware update stops them and
/// restarts the same set afterwards.
#[async_trait]
pub trait PluginManager: Send + Sync {
    /// Stops every running plugin and returns the names that were running.
    async fn stop_all(&self) -> Vec<String>;

    async fn start(&self, names: &[String]);

    async fn running(&self) -> Vec<String>;
}

/// Runs each plugin as a child process. A plugin name is its command line.
#[derive(Debug, Default)]
pub struct ProcessPlugins {
    children: Mutex<BTreeMap<String, Child>>,
}

impl ProcessPlugins {
    pub fn new() -> Self {
        Self::default()
    }

    fn spawn(name: &str) -> std::io::Result<Child> {
        let mut parts = name.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty plugin command"))?;
        Command::new(program).args(parts).kill_on_drop(true).spawn()
    }
}

#[async_trait]
impl PluginManager for ProcessPlugins {
    async fn stop_all(&self) -> Vec<String> {
        let mut children = self.children.lock().await;
        let mut stopped = Vec::new();
        for (name, mut child) in std::mem::take(&mut *children) {
            match child.kill().await {
                Ok(()) => tracing::info!("Stopped plugin {}", name),
                Err(e) => tracing::warn!("Failed to stop plugin {}: {}", name, e),
            }
            stopped.push(name);
        }
        stopped
    }

    async fn start(&self, names: &[String]) {
        let mut children = self.children.lock().await;
        for name in names {
            if children.contains_key(name) {
                continue;
            }
            match Self::spawn(name) {
                Ok(child) => {
                    tracing::info!("Started plugin {}", name);
                    children.insert(name.clone(), child);
                }
                Err(e) => tracing::warn!("Failed to start plugin {}: {}", name, e),
            }
        }
    }

    async fn running(&self) -> Vec<String> {
        self.children.lock().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_returns_what_was_running() {
        let plugins = ProcessPlugins::new();
        plugins.start(&["sleep 30".to_string(), "".to_string()]).await;
        assert_eq!(plugins.running().await, vec!["sleep 30".to_string()]);
        assert_eq!(plugins.stop_all().await, vec!["sleep 30".to_string()]);
        assert!(plugins.running().await.is_empty());
    }
}
