//! Append-only JSONL log for writes accepted before the backend is ready
//!
//! One line per queued call:
//!
//! ```text
//! {"timestamp":"2026-03-01T10:00:00Z","params":{"name":"add_memory","arguments":{...}}}
//! ```
//!
//! The log is drained in file order and truncated once every line has been
//! handled. Callers serialize access through the gate's mutex.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error::{Result, VaultError};
use crate::types::AddMemoryInput;

/// The only call that may be queued
pub const ADD_MEMORY: &str = "add_memory";

/// One queued call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub params: LogParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogParams {
    pub name: String,
    pub arguments: serde_json::Value,
}

impl LogLine {
    pub fn add_memory(timestamp: DateTime<Utc>, input: &AddMemoryInput) -> Result<Self> {
        Ok(Self {
            timestamp,
            params: LogParams {
                name: ADD_MEMORY.to_string(),
                arguments: serde_json::to_value(input)?,
            },
        })
    }

    /// Parse one raw line of the log
    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Arguments of a queued `add_memory` call
    pub fn into_add_memory(self) -> Result<AddMemoryInput> {
        if self.params.name != ADD_MEMORY {
            return Err(VaultError::InvalidInput(format!(
                "unsupported queued operation '{}'",
                self.params.name
            )));
        }
        Ok(serde_json::from_value(self.params.arguments)?)
    }
}

/// The log file
#[derive(Debug, Clone)]
pub struct WriteAheadLog {
    path: PathBuf,
}

impl WriteAheadLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line and flush it to disk before returning
    pub async fn append(&self, line: &LogLine) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut encoded = serde_json::to_vec(line)?;
        encoded.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&encoded).await?;
        file.sync_data().await?;
        Ok(())
    }

    /// Non-empty lines in file order. A missing file is an empty log.
    pub async fn read_lines(&self) -> Result<Vec<String>> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(vec![]),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn truncate(&self) -> Result<()> {
        match OpenOptions::new().write(true).open(&self.path).await {
            Ok(file) => {
                file.set_len(0).await?;
                file.sync_data().await?;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Sibling file collecting lines the backend refused during a drain
    pub fn rejected_path(&self) -> PathBuf {
        self.path.with_extension("rejected.jsonl")
    }

    /// Keep a line the backend refused, so the log itself can be truncated
    pub async fn reject(&self, raw: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.rejected_path())
            .await?;
        file.write_all(raw.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_data().await?;
        Ok(())
    }
}
