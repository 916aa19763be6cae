//! Best-effort agent registration records.
//!
//! One `key=value` file per agent under `<root>/agents/`. The records are
//! observability, not coordination: nothing in the mailbox consults them to
//! make delivery decisions, and a stale record never blocks anything.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::MailboxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Running,
    Waiting,
    Cleaned,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Running => "running",
            AgentStatus::Waiting => "waiting",
            AgentStatus::Cleaned => "cleaned",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(AgentStatus::Running),
            "waiting" => Some(AgentStatus::Waiting),
            "cleaned" => Some(AgentStatus::Cleaned),
            _ => None,
        }
    }
}

/// A registered agent as read back from disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub name: String,
    pub pid: u32,
    pub status: AgentStatus,
    /// RFC 3339 timestamp of the last status change.
    pub updated_at: String,
}

/// Registry of live agents under a mailbox root.
#[derive(Debug, Clone)]
pub struct AgentRegistry {
    dir: PathBuf,
}

impl AgentRegistry {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, MailboxError> {
        let dir = root.into().join("agents");
        fs::create_dir_all(&dir).map_err(|source| MailboxError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    fn record_path(&self, name: &str) -> Result<PathBuf, MailboxError> {
        super::validate_name(name)?;
        Ok(self.dir.join(name))
    }

    /// Register (or re-register) an agent as running.
    pub fn register(&self, name: &str) -> Result<(), MailboxError> {
        self.write_record(name, std::process::id(), AgentStatus::Running)
    }

    /// Update the recorded status of an agent. Best-effort callers may
    /// ignore the result; a missing record is recreated.
    pub fn set_status(&self, name: &str, status: AgentStatus) -> Result<(), MailboxError> {
        let pid = self
            .get(name)?
            .map(|r| r.pid)
            .unwrap_or_else(std::process::id);
        self.write_record(name, pid, status)
    }

    fn write_record(&self, name: &str, pid: u32, status: AgentStatus) -> Result<(), MailboxError> {
        let path = self.record_path(name)?;
        let body = format!(
            "name={name}\npid={pid}\nstatus={}\nupdated_at={}\n",
            status.as_str(),
            Utc::now().to_rfc3339()
        );
        fs::write(&path, body).map_err(|source| MailboxError::Io { path, source })
    }

    /// Remove an agent's record.
    pub fn unregister(&self, name: &str) -> Result<(), MailboxError> {
        let path = self.record_path(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(MailboxError::Io { path, source }),
        }
    }

    pub fn get(&self, name: &str) -> Result<Option<AgentRecord>, MailboxError> {
        let path = self.record_path(name)?;
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(parse_record(&raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(MailboxError::Io { path, source }),
        }
    }

    /// All registered agents, sorted by name. Unparseable records are
    /// skipped rather than failing the listing.
    pub fn list(&self) -> Result<Vec<AgentRecord>, MailboxError> {
        let mut out = Vec::new();
        let entries = fs::read_dir(&self.dir).map_err(|source| MailboxError::Io {
            path: self.dir.clone(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| MailboxError::Io {
                path: self.dir.clone(),
                source,
            })?;
            if let Ok(raw) = fs::read_to_string(entry.path()) {
                if let Some(record) = parse_record(&raw) {
                    out.push(record);
                }
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

fn parse_record(raw: &str) -> Option<AgentRecord> {
    let mut name = None;
    let mut pid = None;
    let mut status = None;
    let mut updated_at = None;
    for line in raw.lines() {
        let (key, value) = line.split_once('=')?;
        match key {
            "name" => name = Some(value.to_owned()),
            "pid" => pid = value.parse().ok(),
            "status" => status = AgentStatus::parse(value),
            "updated_at" => updated_at = Some(value.to_owned()),
            _ => {}
        }
    }
    Some(AgentRecord {
        name: name?,
        pid: pid?,
        status: status?,
        updated_at: updated_at?,
    })
}
