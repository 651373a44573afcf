//! Append-only JSONL output shared by every record task.
//!
//! Epistemic foundation:
//! - K_i: One line per finished record, success or error, never interleaved
//! - K_i: The output file doubles as the resume checkpoint
//! - B_i: A previous run may have been killed mid-line → malformed lines are skipped

use crate::models::{RerollError, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Serialized writer for the output file.
#[derive(Debug)]
pub struct OutputWriter {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl OutputWriter {
    /// Open the output file, appending when resuming and truncating otherwise.
    ///
    /// Missing parent directories are created.
    pub async fn open(path: &Path, resume: bool) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RerollError::io("creating output directory", e))?;
        }

        let mut options = OpenOptions::new();
        options.create(true);
        if resume {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }

        let file = options
            .open(path)
            .await
            .map_err(|e| RerollError::io("opening output file", e))?;

        debug!(path = %path.display(), resume, "Opened output file");
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one JSON line and flush.
    pub async fn write_line<T: Serialize>(&self, value: &T) -> Result<()> {
        let mut line = serde_json::to_string(value)
            .map_err(|e| RerollError::Internal(format!("Failed to serialize output line: {}", e)))?;
        line.push('\n');

        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| RerollError::io("writing output", e))?;
        file.flush()
            .await
            .map_err(|e| RerollError::io("flushing output", e))?;
        Ok(())
    }
}

/// Ids already present in an output file, error lines included.
///
/// Lines without a non-empty `id` (or `uuid`) are not counted. A missing file
/// means nothing has been processed yet.
pub fn load_processed_ids(path: &Path) -> Result<HashSet<String>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(e) => return Err(RerollError::io("opening output file for resume", e)),
    };

    let mut ids = HashSet::new();
    let mut skipped = 0usize;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| RerollError::io("reading output file for resume", e))?;
        if line.trim().is_empty() {
            continue;
        }

        // Empty ids never mark a record as done
        let id = serde_json::from_str::<Value>(&line).ok().and_then(|v| {
            ["id", "uuid"].iter().find_map(|key| {
                v.get(*key)
                    .and_then(Value::as_str)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
            })
        });
        match id {
            Some(id) => {
                ids.insert(id);
            }
            None => skipped += 1,
        }
    }

    info!(processed = ids.len(), skipped, path = %path.display(), "Loaded processed ids");
    Ok(ids)
}
