// src/model.rs - Host-side mirror of the machine state
//
// Only the fields the code handlers read or write are modelled here; the
// firmware owns the rest of the tree.
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MachineStatus {
    #[default]
    Starting,
    Idle,
    Busy,
    Processing,
    Simulating,
    Pausing,
    Paused,
    Resuming,
    Cancelling,
    Updating,
    Halted,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Off,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    /// Maps the numeric `S` level of the logging code.
    pub fn from_code(level: i64) -> Option<Self> {
        match level {
            0 => Some(LogLevel::Off),
            1 => Some(LogLevel::Warn),
            2 => Some(LogLevel::Info),
            3 => Some(LogLevel::Debug),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineState {
    pub status: MachineStatus,
    pub log_file: Option<String>,
    pub log_level: LogLevel,
    pub up_time: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Board {
    pub name: String,
    pub short_name: String,
    pub firmware_version: String,
    /// Firmware image file name the board expects, e.g. `Duet3Firmware_MB6HC.bin`.
    pub firmware_file_name: String,
    /// In-application programmer image used by the host to flash the board.
    pub iap_file_name_sbc: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub path: String,
    pub mounted: bool,
    pub capacity: Option<u64>,
    pub free_space: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directories {
    pub filaments: String,
    pub firmware: String,
    pub g_codes: String,
    pub macros: String,
    pub menu: String,
    pub system: String,
    pub web: String,
}

impl Default for Directories {
    fn default() -> Self {
        Self {
            filaments: "0:/filaments".to_string(),
            firmware: "0:/firmware".to_string(),
            g_codes: "0:/gcodes".to_string(),
            macros: "0:/macros".to_string(),
            menu: "0:/menu".to_string(),
            system: "0:/sys".to_string(),
            web: "0:/www".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    pub name: String,
    pub hostname: String,
    pub cors_site: Option<String>,
    #[serde(skip)]
    pub password: Option<String>,
}

/// The file the job controller currently feeds from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub file_position: Option<u64>,
    pub simulating: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectModel {
    pub state: MachineState,
    pub boards: Vec<Board>,
    pub volumes: Vec<Volume>,
    pub directories: Directories,
    pub network: Network,
    pub job: JobInfo,
}

impl ObjectModel {
    /// Serializes the part of the model selected by a dotted key such as
    /// `network.name` or `volumes[0]`. An empty key selects everything.
    pub fn query(&self, key: &str) -> Option<serde_json::Value> {
        let mut value = serde_json::to_value(self).ok()?;
        for segment in key.split('.').filter(|s| !s.is_empty()) {
            let (name, index) = match segment.find('[') {
                Some(open) => {
                    let index = segment[open + 1..].trim_end_matches(']').parse::<usize>().ok()?;
                    (&segment[..open], Some(index))
                }
                None => (segment, None),
            };
            value = value.get(name)?.clone();
            if let Some(index) = index {
                value = value.get(index)?.clone();
            }
        }
        Some(value)
    }
}

/// Shared-read / exclusive-write access to the [`ObjectModel`]. Writers
/// replace fields under the write guard, so readers never see a half-done
/// update.
#[derive(Debug, Clone, Default)]
pub struct ObjectModelStore {
    inner: Arc<RwLock<ObjectModel>>,
}

impl ObjectModelStore {
    pub fn new(model: ObjectModel) -> Self {
        Self { inner: Arc::new(RwLock::new(model)) }
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, ObjectModel> {
        self.inner.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, ObjectModel> {
        self.inner.write().await
    }

    pub async fn snapshot(&self) -> ObjectModel {
        self.inner.read().await.clone()
    }
}
