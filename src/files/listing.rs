// src/files/listing.rs - M20 directory listings
use crate::config::Compatibility;
use chrono::{DateTime, Local};
use serde_json::json;
use std::path::Path;
use tokio::fs;

#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
    pub name: String,
    pub is_directory: bool,
    pub size: u64,
    pub modified: Option<DateTime<Local>>,
}

/// Reads a directory, skipping hidden entries. Directories come first, then
/// files, each group sorted case-insensitively.
pub async fn read_directory(path: &Path) -> std::io::Result<Vec<DirEntry>> {
    let mut entries = fs::read_dir(path).await?;
    let mut result = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            tracing::warn!("Skipping non UTF-8 file name in {}", path.display());
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        let metadata = entry.metadata().await?;
        result.push(DirEntry {
            name,
            is_directory: metadata.is_dir(),
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            modified: metadata.modified().ok().map(DateTime::<Local>::from),
        });
    }
    result.sort_by(|a, b| {
        b.is_directory
            .cmp(&a.is_directory)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
    Ok(result)
}

/// Plain-text listing in the convention of the configured firmware flavour.
pub fn legacy_listing(entries: &[DirEntry], compatibility: Compatibility) -> String {
    match compatibility {
        Compatibility::RepRapFirmware => {
            let names: Vec<String> = entries
                .iter()
                .map(|e| if e.is_directory { format!("\"*{}\"", e.name) } else { format!("\"{}\"", e.name) })
                .collect();
            format!("GCode files:\n{}", names.join(","))
        }
        Compatibility::Marlin => {
            let mut out = String::from("Begin file list\n");
            for entry in entries {
                out.push_str(&entry.name);
                if entry.is_directory {
                    out.push('/');
                }
                out.push('\n');
            }
            out.push_str("End file list\n");
            out
        }
        Compatibility::NanoDlp => {
            let mut out = String::new();
            for entry in entries.iter().filter(|e| !e.is_directory) {
                out.push_str(&entry.name);
                out.push('\n');
            }
            out
        }
    }
}

fn format_date(modified: Option<DateTime<Local>>) -> serde_json::Value {
    match modified {
        Some(date) => json!(date.format("%Y-%m-%dT%H:%M:%S").to_string()),
        None => serde_json::Value::Null,
    }
}

/// Builds `{"dir":..,"first":..,"files":[..],"next":..}` and stops adding
/// entries once the document would exceed `max_length` bytes. The first entry
/// is always included, even when it alone overflows, so a client paging with
/// `next` always moves forward. `next` is the index of the first entry left
/// out, or 0 when all fit.
fn capped_json<F>(directory: &str, entries: &[DirEntry], first: usize, max_length: usize, render: F) -> String
where
    F: Fn(&DirEntry) -> serde_json::Value,
{
    let head = format!("{{\"dir\":{},\"first\":{},\"files\":[", json!(directory), first);
    // room for the largest possible `],"next":N}` tail
    let tail_reserve = format!("],\"next\":{}}}", entries.len()).len();
    let mut body = head;
    let mut next = 0;
    let mut count = 0;
    for (index, entry) in entries.iter().enumerate().skip(first) {
        let rendered = render(entry).to_string();
        let separator = if count == 0 { 0 } else { 1 };
        if count > 0 && body.len() + separator + rendered.len() + tail_reserve > max_length {
            next = index;
            break;
        }
        if count > 0 {
            body.push(',');
        }
        body.push_str(&rendered);
        count += 1;
    }
    body.push_str(&format!("],\"next\":{}}}", next));
    body
}

/// `S2`: names only, directories prefixed with `*`.
pub fn json_names(directory: &str, entries: &[DirEntry], first: usize, max_length: usize) -> String {
    capped_json(directory, entries, first, max_length, |e| {
        if e.is_directory { json!(format!("*{}", e.name)) } else { json!(e.name) }
    })
}

/// `S3`: type, name, size and modification date per entry.
pub fn json_detailed(directory: &str, entries: &[DirEntry], first: usize, max_length: usize) -> String {
    capped_json(directory, entries, first, max_length, |e| {
        json!({
            "type": if e.is_directory { "d" } else { "f" },
            "name": e.name,
            "size": e.size,
            "date": format_date(e.modified),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(name: &str, is_directory: bool) -> DirEntry {
        DirEntry { name: name.to_string(), is_directory, size: 10, modified: None }
    }

    fn sample() -> Vec<DirEntry> {
        vec![entry("parts", true), entry("a.gcode", false), entry("b.gcode", false)]
    }

    #[test]
    fn legacy_formats() {
        assert_eq!(
            legacy_listing(&sample(), Compatibility::RepRapFirmware),
            "GCode files:\n\"*parts\",\"a.gcode\",\"b.gcode\""
        );
        assert_eq!(
            legacy_listing(&sample(), Compatibility::Marlin),
            "Begin file list\nparts/\na.gcode\nb.gcode\nEnd file list\n"
        );
        assert_eq!(legacy_listing(&sample(), Compatibility::NanoDlp), "a.gcode\nb.gcode\n");
        assert_eq!(legacy_listing(&[], Compatibility::RepRapFirmware), "GCode files:\n");
    }

    #[test]
    fn names_listing_fits() {
        let out = json_names("0:/gcodes", &sample(), 0, 4096);
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["files"], json!(["*parts", "a.gcode", "b.gcode"]));
        assert_eq!(value["next"], json!(0));
    }

    #[test]
    fn listing_is_capped() {
        let entries: Vec<DirEntry> = (0..50).map(|i| entry(&format!("file{:02}.gcode", i), false)).collect();
        let out = json_detailed("0:/gcodes", &entries, 0, 300);
        assert!(out.len() <= 300, "{} bytes", out.len());
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        let listed = value["files"].as_array().unwrap().len();
        assert!(listed > 0 && listed < 50);
        assert_eq!(value["next"], json!(listed));

        let rest = json_detailed("0:/gcodes", &entries, listed, 300);
        let value: serde_json::Value = serde_json::from_str(&rest).unwrap();
        assert_eq!(value["first"], json!(listed));
        assert_eq!(value["files"][0]["name"], json!(format!("file{:02}.gcode", listed)));
    }

    #[test]
    fn oversized_entry_still_advances_paging() {
        let long = "x".repeat(200);
        let entries = vec![entry(&long, false), entry("b.g", false)];

        let out = json_names("0:/gcodes", &entries, 0, 100);
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["files"], json!([long]));
        assert_eq!(value["next"], json!(1));

        let out = json_names("0:/gcodes", &entries, 1, 100);
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["files"], json!(["b.g"]));
        assert_eq!(value["next"], json!(0));
    }

    #[tokio::test]
    async fn directories_sort_first_and_hidden_files_are_skipped() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("B.gcode"), "G28").unwrap();
        std::fs::write(dir.path().join("a.gcode"), "G28").unwrap();
        std::fs::write(dir.path().join(".hidden"), "").unwrap();
        std::fs::create_dir(dir.path().join("zeta")).unwrap();
        let entries = read_directory(dir.path()).await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "a.gcode", "B.gcode"]);
        assert!(entries[1].modified.is_some());
    }
}
