//! Pipeline run state: a current-mode flag plus an append-only audit log.
//!
//! The authoritative current mode lives behind a mutex; the JSONL file is a
//! history of every change, replayed only when a control handle is opened.
//! Readers never scan the log to answer "are we paused right now".

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("pipeline state I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt pipeline state entry: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    Running,
    Paused,
}

/// One audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeChange {
    pub mode: PipelineMode,
    pub at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Shared handle on the pipeline run state.
#[derive(Debug, Clone)]
pub struct PipelineControl {
    log_path: PathBuf,
    mode: Arc<Mutex<PipelineMode>>,
}

impl PipelineControl {
    /// Open the control, initializing the current mode from the log tail.
    /// An absent log means the pipeline has never been paused: running.
    pub fn open(log_path: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let log_path = log_path.into();
        let mode = Self::replay(&log_path)?;
        Ok(Self {
            log_path,
            mode: Arc::new(Mutex::new(mode)),
        })
    }

    fn replay(path: &Path) -> Result<PipelineMode, PipelineError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(PipelineMode::Running),
            Err(source) => {
                return Err(PipelineError::Io {
                    path: path.to_owned(),
                    source,
                })
            }
        };
        match raw.lines().rev().find(|l| !l.trim().is_empty()) {
            Some(last) => {
                let entry: ModeChange = serde_json::from_str(last)?;
                Ok(entry.mode)
            }
            None => Ok(PipelineMode::Running),
        }
    }

    pub async fn mode(&self) -> PipelineMode {
        *self.mode.lock().await
    }

    pub async fn is_paused(&self) -> bool {
        self.mode().await == PipelineMode::Paused
    }

    pub async fn pause(&self, reason: impl Into<String>) -> Result<(), PipelineError> {
        self.set_mode(PipelineMode::Paused, Some(reason.into())).await
    }

    pub async fn resume(&self) -> Result<(), PipelineError> {
        self.set_mode(PipelineMode::Running, None).await
    }

    /// Change the mode and append to the audit log. The mutex is held
    /// across the append so the log order matches the order of changes.
    async fn set_mode(
        &self,
        mode: PipelineMode,
        reason: Option<String>,
    ) -> Result<(), PipelineError> {
        let mut current = self.mode.lock().await;
        if *current == mode {
            return Ok(());
        }
        let entry = ModeChange {
            mode,
            at: Utc::now().to_rfc3339(),
            reason,
        };
        if let Some(parent) = self.log_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| PipelineError::Io {
                path: parent.to_owned(),
                source,
            })?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|source| PipelineError::Io {
                path: self.log_path.clone(),
                source,
            })?;
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        file.write_all(line.as_bytes())
            .map_err(|source| PipelineError::Io {
                path: self.log_path.clone(),
                source,
            })?;
        *current = mode;
        info!(?mode, "pipeline mode changed");
        Ok(())
    }

    /// Full audit history, oldest first.
    pub fn history(&self) -> Result<Vec<ModeChange>, PipelineError> {
        let raw = match std::fs::read_to_string(&self.log_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(PipelineError::Io {
                    path: self.log_path.clone(),
                    source,
                })
            }
        };
        let mut out = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            out.push(serde_json::from_str(line)?);
        }
        Ok(out)
    }
}
