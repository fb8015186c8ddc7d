// src/firmware/update.rs - Locating and loading firmware images for M997
use super::uf2;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("Failed to find {0}")]
    NotFound(String),
    #[error("Failed to read {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("Failed to unpack {path}: {source}")]
    Container { path: String, source: uf2::Uf2Error },
}

/// The name a board reports plus its `.bin`/`.uf2` sibling.
pub fn candidate_names(name: &str) -> Vec<String> {
    let path = Path::new(name);
    let sibling = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("uf2") => Some(path.with_extension("bin")),
        Some(ext) if ext.eq_ignore_ascii_case("bin") => Some(path.with_extension("uf2")),
        _ => None,
    };
    let mut names = vec![name.to_string()];
    if let Some(sibling) = sibling {
        names.push(sibling.to_string_lossy().into_owned());
    }
    names
}

/// First existing file for `name`, trying each directory in order and, in
/// each, the primary name before its fallback.
pub fn resolve_image(name: &str, directories: &[PathBuf]) -> Result<PathBuf, ImageError> {
    let candidates = candidate_names(name);
    for directory in directories {
        for candidate in &candidates {
            let path = directory.join(candidate);
            if path.is_file() {
                tracing::debug!("Using firmware image {}", path.display());
                return Ok(path);
            }
        }
    }
    Err(ImageError::NotFound(name.to_string()))
}

/// Reads an image, unpacking UF2 containers to a flat binary.
pub async fn load_image(path: &Path) -> Result<Vec<u8>, ImageError> {
    let data = tokio::fs::read(path).await.map_err(|source| ImageError::Io {
        path: path.display().to_string(),
        source,
    })?;
    if uf2::is_uf2(&data) {
        tracing::info!("Unpacking UF2 container {}", path.display());
        return uf2::unpack(&data).map_err(|source| ImageError::Container {
            path: path.display().to_string(),
            source,
        });
    }
    Ok(data)
}
