// src/files/mod.rs - Virtual paths, uploads, listings and file analysis
pub mod checksum;
pub mod info;
pub mod listing;
pub mod registry;

use crate::model::Directories;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

pub use registry::{ChannelFileRegistry, FileWriteError};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PathError {
    #[error("Invalid volume in path '{0}'")]
    UnknownVolume(String),
    #[error("Path '{0}' leaves its volume")]
    OutsideVolume(String),
}

/// Well-known directories a relative path may be resolved against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileDirectory {
    Filaments,
    Firmware,
    GCodes,
    Macros,
    Menu,
    System,
    Web,
}

impl FileDirectory {
    pub fn virtual_path(self, directories: &Directories) -> &str {
        match self {
            FileDirectory::Filaments => &directories.filaments,
            FileDirectory::Firmware => &directories.firmware,
            FileDirectory::GCodes => &directories.g_codes,
            FileDirectory::Macros => &directories.macros,
            FileDirectory::Menu => &directories.menu,
            FileDirectory::System => &directories.system,
            FileDirectory::Web => &directories.web,
        }
    }
}

/// Translation between virtual (`0:/gcodes/a.g`) and physical paths.
pub trait PathResolver: Send + Sync {
    /// Resolves `path`; relative paths are taken relative to the virtual
    /// directory `base`.
    fn to_physical(&self, path: &str, base: &str) -> Result<PathBuf, PathError>;

    fn to_virtual(&self, physical: &Path) -> Option<String>;
}

/// Maps volume `N:` to the N-th configured root directory.
#[derive(Debug, Clone)]
pub struct VolumeResolver {
    roots: Vec<PathBuf>,
}

impl VolumeResolver {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    pub fn single(root: impl Into<PathBuf>) -> Self {
        Self::new(vec![root.into()])
    }

    fn split_volume(path: &str) -> Option<(usize, &str)> {
        let colon = path.find(':')?;
        let volume = path[..colon].parse::<usize>().ok()?;
        Some((volume, &path[colon + 1..]))
    }
}

impl PathResolver for VolumeResolver {
    fn to_physical(&self, path: &str, base: &str) -> Result<PathBuf, PathError> {
        let absolute = if Self::split_volume(path).is_some() || path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{}", base.trim_end_matches('/'), path)
        };
        let (volume, rest) = match Self::split_volume(&absolute) {
            Some((volume, rest)) => (volume, rest.to_string()),
            None if absolute.starts_with('/') => (0, absolute.clone()),
            None => return Err(PathError::UnknownVolume(path.to_string())),
        };
        let root = self.roots.get(volume).ok_or_else(|| PathError::UnknownVolume(path.to_string()))?;

        let mut resolved = root.clone();
        let mut depth = 0usize;
        for component in Path::new(&rest).components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::ParentDir => {
                    if depth == 0 {
                        return Err(PathError::OutsideVolume(path.to_string()));
                    }
                    resolved.pop();
                    depth -= 1;
                }
                _ => {}
            }
        }
        Ok(resolved)
    }

    fn to_virtual(&self, physical: &Path) -> Option<String> {
        self.roots.iter().enumerate().find_map(|(volume, root)| {
            let rest = physical.strip_prefix(root).ok()?;
            let rest = rest.to_string_lossy().replace('\\', "/");
            Some(format!("{}:/{}", volume, rest))
        })
    }
}
