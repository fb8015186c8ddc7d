// src/files/checksum.rs - M38 file hashing off the dispatch path
use sha1::{Digest, Sha1};
use std::io::Read;
use std::path::PathBuf;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ChecksumError {
    #[error("Cancelled")]
    Cancelled,
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("hashing task failed: {0}")]
    Task(String),
}

const CHUNK_SIZE: usize = 64 * 1024;

fn hash_file(path: &PathBuf, cancel: &CancellationToken) -> Result<String, ChecksumError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        if cancel.is_cancelled() {
            return Err(ChecksumError::Cancelled);
        }
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hex SHA-1 of a file, computed on the blocking pool so other channels keep
/// dispatching. The token is checked between chunks.
pub async fn sha1_file(path: PathBuf, cancel: CancellationToken) -> Result<String, ChecksumError> {
    tokio::task::spawn_blocking(move || hash_file(&path, &cancel))
        .await
        .map_err(|e| ChecksumError::Task(e.to_string()))?
}
