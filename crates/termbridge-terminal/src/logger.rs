use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

/// Per-session JSONL lifecycle log.
///
/// Only events and byte counts are recorded, never terminal content.
pub struct SessionLogger {
    session_key: String,
    log_path: PathBuf,
    log_file: File,
    meta_path: PathBuf,
}

impl SessionLogger {
    /// Create a new session logger
    pub fn new(session_key: &str, log_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(log_dir).context("Failed to create log directory")?;

        let stem = file_stem(session_key);
        let log_path = log_dir.join(format!("session-{}.log", stem));
        let meta_path = log_dir.join(format!("session-{}-meta.json", stem));

        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .context("Failed to create log file")?;

        Ok(Self {
            session_key: session_key.to_string(),
            log_path,
            log_file,
            meta_path,
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn meta_path(&self) -> &Path {
        &self.meta_path
    }

    /// Append one event line; `fields` must be a JSON object or null
    pub fn log_event(&mut self, event: &str, fields: Value) -> Result<()> {
        let mut entry = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "session_key": self.session_key,
            "event": event,
        });
        if let (Some(entry), Value::Object(fields)) = (entry.as_object_mut(), fields) {
            entry.extend(fields);
        }

        writeln!(self.log_file, "{}", entry).context("Failed to write to log file")?;
        self.log_file.flush()?;
        Ok(())
    }

    pub fn log_resize(&mut self, rows: u16, cols: u16) -> Result<()> {
        self.log_event("resize", json!({ "rows": rows, "cols": cols }))
    }

    /// Write metadata, replacing any previous contents
    pub fn write_metadata(&mut self, metadata: &Value) -> Result<()> {
        let json_str =
            serde_json::to_string_pretty(metadata).context("Failed to serialize metadata")?;
        std::fs::write(&self.meta_path, json_str).context("Failed to write metadata")?;
        Ok(())
    }
}

/// Session keys are caller-chosen; keep file names tame. The suffix hashes
/// the raw key so keys that sanitize alike still get their own files.
fn file_stem(session_key: &str) -> String {
    let digest = Uuid::new_v5(&Uuid::NAMESPACE_OID, session_key.as_bytes()).simple().to_string();
    format!("{}-{}", readable_stem(session_key), &digest[..8])
}

fn readable_stem(session_key: &str) -> String {
    let stem: String = session_key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() || stem.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        stem
    }
}
