// src/files/info.rs - G-code file metadata for M36
use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum InfoError {
    #[error("Cancelled")]
    Cancelled,
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GCodeFileInfo {
    pub err: u8,
    pub file_name: String,
    pub size: u64,
    pub last_modified: Option<String>,
    pub height: f64,
    pub layer_height: f64,
    pub filament: Vec<f64>,
    pub generated_by: String,
    pub print_time: Option<u64>,
    pub simulated_time: Option<u64>,
}

/// Lines between cancellation checks.
const CANCEL_CHECK_INTERVAL: usize = 512;

fn value_after_separator(line: &str) -> Option<&str> {
    let index = line.find([':', '='])?;
    Some(line[index + 1..].trim())
}

fn leading_number(text: &str) -> Option<f64> {
    let end = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
        .unwrap_or(text.len());
    text[..end].parse().ok()
}

/// `1h 2m 3s`, `2d 1h`, or plain seconds.
fn parse_duration(text: &str) -> Option<u64> {
    if let Ok(seconds) = text.trim().parse::<f64>() {
        return Some(seconds as u64);
    }
    let mut total = 0u64;
    let mut found = false;
    for part in text.split_whitespace() {
        let (number, unit) = part.split_at(part.find(|c: char| !c.is_ascii_digit())?);
        let value: u64 = number.parse().ok()?;
        total += value
            * match unit {
                "d" => 86_400,
                "h" => 3_600,
                "m" => 60,
                "s" => 1,
                _ => return None,
            };
        found = true;
    }
    found.then_some(total)
}

fn apply_comment(info: &mut GCodeFileInfo, comment: &str) {
    let lower = comment.to_lowercase();
    if info.generated_by.is_empty() {
        for marker in ["generated by ", "generated with "] {
            if let Some(index) = lower.find(marker) {
                info.generated_by = comment[index + marker.len()..].trim().to_string();
                return;
            }
        }
    }
    if lower.contains("layer_height") || lower.contains("layer height") {
        if let Some(height) = value_after_separator(comment).and_then(leading_number) {
            if info.layer_height == 0.0 {
                info.layer_height = height;
            }
        }
    } else if lower.starts_with("filament used [mm]") {
        if let Some(values) = value_after_separator(comment) {
            info.filament = values.split(',').filter_map(|v| v.trim().parse().ok()).collect();
        }
    } else if lower.starts_with("filament used") {
        // Cura style, metres
        if let Some(values) = value_after_separator(comment) {
            info.filament = values
                .split(',')
                .filter_map(|v| leading_number(v.trim()))
                .map(|m| m * 1000.0)
                .collect();
        }
    } else if lower.starts_with("estimated printing time") || lower.starts_with("time:") {
        if let Some(value) = value_after_separator(comment) {
            info.print_time = parse_duration(value);
        }
    } else if lower.starts_with("simulated print time") {
        if let Some(value) = value_after_separator(comment) {
            info.simulated_time = parse_duration(value);
        }
    }
}

fn apply_move(info: &mut GCodeFileInfo, code: &str) {
    let mut words = code.split_whitespace();
    let Some(first) = words.next() else {
        return;
    };
    if !matches!(first.to_ascii_uppercase().as_str(), "G0" | "G1") {
        return;
    }
    for word in words {
        if let Some(z) = word.strip_prefix(['Z', 'z']).and_then(|z| z.parse::<f64>().ok()) {
            if z > info.height {
                info.height = z;
            }
        }
    }
}

/// Scans a job file for slicer metadata and the highest Z move.
pub async fn parse_file_info(
    path: &Path,
    file_name: &str,
    cancel: &CancellationToken,
) -> Result<GCodeFileInfo, InfoError> {
    let file = File::open(path).await?;
    let metadata = file.metadata().await?;
    let mut info = GCodeFileInfo {
        file_name: file_name.to_string(),
        size: metadata.len(),
        last_modified: metadata
            .modified()
            .ok()
            .map(|m| DateTime::<Local>::from(m).format("%Y-%m-%dT%H:%M:%S").to_string()),
        ..Default::default()
    };

    let mut lines = BufReader::new(file).lines();
    let mut count = 0usize;
    while let Some(line) = lines.next_line().await? {
        count += 1;
        if count % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
            return Err(InfoError::Cancelled);
        }
        let line = line.trim();
        let (code, comment) = match line.find(';') {
            Some(index) => (&line[..index], Some(line[index + 1..].trim())),
            None => (line, None),
        };
        if let Some(comment) = comment.filter(|c| !c.is_empty()) {
            apply_comment(&mut info, comment);
        }
        if !code.is_empty() {
            apply_move(&mut info, code);
        }
    }
    if cancel.is_cancelled() {
        return Err(InfoError::Cancelled);
    }
    Ok(info)
}
