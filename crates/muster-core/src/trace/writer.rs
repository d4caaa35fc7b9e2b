//! JSONL append-only writer for planner traces.
//!
//! Storage path: `<trace_dir>/{day}/planner-{datetime}.jsonl`
//!
//! Files rotate daily. Write failures are logged, never surfaced to the
//! planner.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, Utc};
use serde::Serialize;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct TraceWriter {
    base_dir: PathBuf,
    current_file: Arc<Mutex<Option<CurrentFile>>>,
}

struct CurrentFile {
    /// YYYY-MM-DD, for rotation
    date: String,
    path: PathBuf,
}

impl TraceWriter {
    pub fn with_base_dir(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            current_file: Arc::new(Mutex::new(None)),
        }
    }

    /// Append one record as a single JSON line to today's file.
    pub async fn append<T: Serialize>(&self, record: &T) -> Result<(), TraceWriteError> {
        let today = Local::now().format("%Y-%m-%d").to_string();
        let file_path = self.file_for(&today).await?;

        let mut line = serde_json::to_string(record).map_err(|e| TraceWriteError::Serialization(e.to_string()))?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file_path)
            .await
            .map_err(|e| TraceWriteError::Io(e.to_string()))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| TraceWriteError::Io(e.to_string()))?;
        file.flush().await.map_err(|e| TraceWriteError::Io(e.to_string()))?;
        Ok(())
    }

    pub async fn append_safe<T: Serialize>(&self, record: &T) {
        if let Err(e) = self.append(record).await {
            tracing::warn!("[TraceWriter] Failed to write trace: {}", e);
        }
    }

    async fn file_for(&self, date: &str) -> Result<PathBuf, TraceWriteError> {
        let mut current = self.current_file.lock().await;
        if let Some(ref cf) = *current {
            if cf.date == date {
                return Ok(cf.path.clone());
            }
        }

        let day_dir = self.base_dir.join(date);
        fs::create_dir_all(&day_dir)
            .await
            .map_err(|e| TraceWriteError::Io(format!("Failed to create trace dir: {}", e)))?;

        let datetime = Utc::now().format("%Y%m%d-%H%M%S").to_string();
        let file_path = day_dir.join(format!("planner-{}.jsonl", datetime));
        *current = Some(CurrentFile {
            date: date.to_string(),
            path: file_path.clone(),
        });
        Ok(file_path)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TraceWriteError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TraceWriter::with_base_dir(dir.path());
        writer.append(&json!({"n": 1})).await.unwrap();
        writer.append(&json!({"n": 2})).await.unwrap();

        let today = Local::now().format("%Y-%m-%d").to_string();
        let mut entries = std::fs::read_dir(dir.path().join(today)).unwrap();
        let file = entries.next().unwrap().unwrap().path();
        let content = std::fs::read_to_string(file).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(serde_json::from_str::<serde_json::Value>(lines[1]).unwrap()["n"], 2);
    }
}
