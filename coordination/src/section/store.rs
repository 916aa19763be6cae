//! Durable section artifacts.
//!
//! Everything a section produces or consumes lives under one artifact root:
//!
//! ```text
//! <root>/excerpts/section-<id>.md      governing-description excerpts
//! <root>/proposals/section-<id>.md     current proposal draft
//! <root>/decisions/section-<id>.md     append-only upstream decision log
//! <root>/notes/from-<a>-to-<b>.md      consequence notes between sections
//! <root>/notes/acks/section-<id>.json  note ids a section has processed
//! <root>/snapshots/section-<id>/...    files as of that section's convergence
//! <root>/state/section-<id>.json       persisted state + inputs hash
//! ```
//!
//! The inputs hash is the invalidation currency: it covers every input that
//! shaped a section's converged output, and a mismatch against the hash
//! recorded at convergence is the only targeted path from aligned to dirty.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::SectionState;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("artifact I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt artifact record: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("reported path escapes the workspace: {0}")]
    PathEscape(String),
}

/// Persisted per-section record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionRecord {
    pub section: String,
    pub state: SectionState,
    /// Inputs hash recorded when the section last converged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs_hash: Option<String>,
    pub updated_at: String,
}

/// A consequence note addressed from one section to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsequenceNote {
    /// Stable id: 12 hex chars of the hash of file name + content.
    pub id: String,
    pub from: String,
    pub to: String,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct SectionStore {
    root: PathBuf,
}

impl SectionStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for sub in [
            "excerpts",
            "proposals",
            "decisions",
            "notes/acks",
            "snapshots",
            "state",
        ] {
            let dir = root.join(sub);
            fs::create_dir_all(&dir).map_err(|source| StoreError::Io { path: dir, source })?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ---- plain artifacts ----------------------------------------------

    pub fn excerpt_path(&self, section: &str) -> PathBuf {
        self.root.join("excerpts").join(format!("section-{section}.md"))
    }

    pub fn write_excerpt(&self, section: &str, content: &str) -> Result<(), StoreError> {
        write_file(&self.excerpt_path(section), content)
    }

    pub fn read_excerpt(&self, section: &str) -> Result<Option<String>, StoreError> {
        read_optional(&self.excerpt_path(section))
    }

    pub fn proposal_path(&self, section: &str) -> PathBuf {
        self.root.join("proposals").join(format!("section-{section}.md"))
    }

    pub fn write_proposal(&self, section: &str, content: &str) -> Result<(), StoreError> {
        write_file(&self.proposal_path(section), content)
    }

    pub fn read_proposal(&self, section: &str) -> Result<Option<String>, StoreError> {
        read_optional(&self.proposal_path(section))
    }

    // ---- decision log -------------------------------------------------

    fn decision_path(&self, section: &str) -> PathBuf {
        self.root.join("decisions").join(format!("section-{section}.md"))
    }

    /// Append an upstream decision to the section's log. Called before the
    /// paused step retries, so the decision is durable even if the retry
    /// dies immediately.
    pub fn append_decision(&self, section: &str, payload: &str) -> Result<(), StoreError> {
        let path = self.decision_path(section);
        let mut body = read_optional(&path)?.unwrap_or_default();
        body.push_str("\n## Decision (from parent)\n");
        body.push_str(payload);
        body.push('\n');
        write_file(&path, &body)
    }

    pub fn read_decisions(&self, section: &str) -> Result<Option<String>, StoreError> {
        read_optional(&self.decision_path(section))
    }

    // ---- section record -----------------------------------------------

    fn record_path(&self, section: &str) -> PathBuf {
        self.root.join("state").join(format!("section-{section}.json"))
    }

    pub fn load_record(&self, section: &str) -> Result<Option<SectionRecord>, StoreError> {
        match read_optional(&self.record_path(section))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn save_record(&self, record: &SectionRecord) -> Result<(), StoreError> {
        let raw = serde_json::to_string_pretty(record)?;
        write_file(&self.record_path(&record.section), &raw)
    }

    pub fn set_state(&self, section: &str, state: SectionState) -> Result<(), StoreError> {
        let mut record = self.load_record(section)?.unwrap_or(SectionRecord {
            section: section.to_owned(),
            state,
            inputs_hash: None,
            updated_at: String::new(),
        });
        record.state = state;
        if state != SectionState::Aligned {
            record.inputs_hash = None;
        }
        record.updated_at = Utc::now().to_rfc3339();
        self.save_record(&record)
    }

    /// Record convergence together with the inputs hash it was reached
    /// under.
    pub fn mark_aligned(&self, section: &str) -> Result<(), StoreError> {
        let hash = self.inputs_hash(section)?;
        let record = SectionRecord {
            section: section.to_owned(),
            state: SectionState::Aligned,
            inputs_hash: Some(hash),
            updated_at: Utc::now().to_rfc3339(),
        };
        self.save_record(&record)
    }

    /// All sections with a persisted record, sorted by id.
    pub fn sections(&self) -> Result<Vec<SectionRecord>, StoreError> {
        let dir = self.root.join("state");
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })? {
            let entry = entry.map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?;
            if let Ok(raw) = fs::read_to_string(entry.path()) {
                if let Ok(record) = serde_json::from_str::<SectionRecord>(&raw) {
                    out.push(record);
                }
            }
        }
        out.sort_by(|a, b| a.section.cmp(&b.section));
        Ok(out)
    }

    // ---- invalidation -------------------------------------------------

    /// Hash of everything that shapes this section's output: excerpts, the
    /// proposal, the decision log, and incoming consequence notes (sorted
    /// by file name so ordering is stable).
    pub fn inputs_hash(&self, section: &str) -> Result<String, StoreError> {
        let mut hasher = blake3::Hasher::new();
        for part in [
            self.read_excerpt(section)?,
            self.read_proposal(section)?,
            self.read_decisions(section)?,
        ] {
            hasher.update(part.as_deref().unwrap_or("").as_bytes());
            hasher.update(b"\0");
        }
        for note in self.notes_to(section)? {
            hasher.update(note.id.as_bytes());
            hasher.update(note.body.as_bytes());
            hasher.update(b"\0");
        }
        Ok(hasher.finalize().to_hex().to_string())
    }

    /// Whether a converged section's inputs changed since convergence.
    /// Sections that never converged are not "dirty", they are unfinished.
    pub fn is_invalidated(&self, section: &str) -> Result<bool, StoreError> {
        let Some(record) = self.load_record(section)? else {
            return Ok(false);
        };
        let Some(recorded) = record.inputs_hash.as_deref() else {
            return Ok(false);
        };
        Ok(recorded != self.inputs_hash(section)?)
    }

    /// Targeted invalidation: flip one converged section to dirty.
    pub fn invalidate(&self, section: &str) -> Result<(), StoreError> {
        info!(section, "section invalidated");
        self.set_state(section, SectionState::Dirty)
    }

    /// Cascade invalidation after the governing description itself changed:
    /// every converged section becomes dirty and every excerpt is deleted,
    /// forcing re-extraction against the new text. Deliberately coarse.
    pub fn invalidate_all(&self) -> Result<Vec<String>, StoreError> {
        let mut dirtied = Vec::new();
        for record in self.sections()? {
            if record.state == SectionState::Aligned {
                self.invalidate(&record.section)?;
                dirtied.push(record.section);
            }
        }
        let excerpts = self.root.join("excerpts");
        for entry in fs::read_dir(&excerpts).map_err(|source| StoreError::Io {
            path: excerpts.clone(),
            source,
        })? {
            let entry = entry.map_err(|source| StoreError::Io {
                path: excerpts.clone(),
                source,
            })?;
            fs::remove_file(entry.path()).map_err(|source| StoreError::Io {
                path: entry.path(),
                source,
            })?;
        }
        info!(count = dirtied.len(), "cascade invalidation");
        Ok(dirtied)
    }

    // ---- consequence notes --------------------------------------------

    fn notes_dir(&self) -> PathBuf {
        self.root.join("notes")
    }

    /// Write a note from `from` to `to`, returning its stable id.
    pub fn write_note(&self, from: &str, to: &str, body: &str) -> Result<String, StoreError> {
        let name = format!("from-{from}-to-{to}.md");
        let path = self.notes_dir().join(&name);
        write_file(&path, body)?;
        Ok(note_id(&name, body))
    }

    /// Notes addressed to `section`, sorted by source section.
    pub fn notes_to(&self, section: &str) -> Result<Vec<ConsequenceNote>, StoreError> {
        let dir = self.notes_dir();
        let suffix = format!("-to-{section}.md");
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })? {
            let entry = entry.map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(stripped) = name.strip_prefix("from-") else {
                continue;
            };
            let Some(from) = stripped.strip_suffix(&suffix) else {
                continue;
            };
            let body = fs::read_to_string(entry.path()).map_err(|source| StoreError::Io {
                path: entry.path(),
                source,
            })?;
            out.push(ConsequenceNote {
                id: note_id(&name, &body),
                from: from.to_owned(),
                to: section.to_owned(),
                body,
            });
        }
        out.sort_by(|a, b| a.from.cmp(&b.from));
        Ok(out)
    }

    fn ack_path(&self, section: &str) -> PathBuf {
        self.notes_dir().join("acks").join(format!("section-{section}.json"))
    }

    /// Record that `section` has processed the note with `id`.
    pub fn ack_note(&self, section: &str, id: &str) -> Result<(), StoreError> {
        let mut acks = self.acked_notes(section)?;
        if !acks.iter().any(|a| a == id) {
            acks.push(id.to_owned());
        }
        let raw = serde_json::to_string_pretty(&acks)?;
        write_file(&self.ack_path(section), &raw)
    }

    pub fn acked_notes(&self, section: &str) -> Result<Vec<String>, StoreError> {
        match read_optional(&self.ack_path(section))? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    /// Notes addressed to `section` that it has not acknowledged yet.
    pub fn unacked_notes(&self, section: &str) -> Result<Vec<ConsequenceNote>, StoreError> {
        let acked = self.acked_notes(section)?;
        Ok(self
            .notes_to(section)?
            .into_iter()
            .filter(|n| !acked.contains(&n.id))
            .collect())
    }

    // ---- snapshots ----------------------------------------------------

    pub fn snapshot_dir(&self, section: &str) -> PathBuf {
        self.root.join("snapshots").join(format!("section-{section}"))
    }

    /// Copy `paths` (relative to `workspace`) into the section's snapshot
    /// directory, preserving relative layout. Paths that resolve outside
    /// the workspace are rejected; collaborators report these paths and
    /// are not trusted with them.
    pub fn snapshot_files(
        &self,
        section: &str,
        workspace: &Path,
        paths: &[String],
    ) -> Result<usize, StoreError> {
        let dest_root = self.snapshot_dir(section);
        let mut copied = 0;
        for rel in paths {
            let rel_path = Path::new(rel);
            if rel_path.is_absolute()
                || rel_path
                    .components()
                    .any(|c| matches!(c, std::path::Component::ParentDir))
            {
                return Err(StoreError::PathEscape(rel.clone()));
            }
            let src = workspace.join(rel_path);
            if !src.is_file() {
                debug!(path = rel.as_str(), "skipping missing snapshot source");
                continue;
            }
            let dest = dest_root.join(rel_path);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                    path: parent.to_owned(),
                    source,
                })?;
            }
            fs::copy(&src, &dest).map_err(|source| StoreError::Io {
                path: dest.clone(),
                source,
            })?;
            copied += 1;
        }
        Ok(copied)
    }

    /// Read a file out of a section's snapshot, if present.
    pub fn snapshot_file(&self, section: &str, rel: &str) -> Result<Option<String>, StoreError> {
        read_optional(&self.snapshot_dir(section).join(rel))
    }

    /// Workspace-relative paths captured in a section's snapshot. These are
    /// the files the section touched, which is what overlap grouping keys
    /// on.
    pub fn snapshot_paths(&self, section: &str) -> Result<Vec<String>, StoreError> {
        let root = self.snapshot_dir(section);
        if !root.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        let mut stack = vec![root.clone()];
        while let Some(dir) = stack.pop() {
            for entry in fs::read_dir(&dir).map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })? {
                let entry = entry.map_err(|source| StoreError::Io {
                    path: dir.clone(),
                    source,
                })?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(rel) = path.strip_prefix(&root) {
                    out.push(rel.to_string_lossy().into_owned());
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

/// Stable note id: short hash of the note's file name and content, so a
/// rewritten note gets a fresh id and must be re-acknowledged.
pub fn note_id(name: &str, body: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(name.as_bytes());
    hasher.update(b":");
    hasher.update(body.as_bytes());
    hasher.finalize().to_hex()[..12].to_string()
}

fn write_file(path: &Path, content: &str) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| StoreError::Io {
            path: parent.to_owned(),
            source,
        })?;
    }
    fs::write(path, content).map_err(|source| StoreError::Io {
        path: path.to_owned(),
        source,
    })
}

fn read_optional(path: &Path) -> Result<Option<String>, StoreError> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(StoreError::Io {
            path: path.to_owned(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &tempfile::TempDir) -> SectionStore {
        SectionStore::open(dir.path()).unwrap()
    }

    #[test]
    fn decision_log_appends() {
        let dir = tempdir().unwrap();
        let s = store(&dir);
        s.append_decision("03", "prefer the flat layout").unwrap();
        s.append_decision("03", "keep both spellings").unwrap();
        let log = s.read_decisions("03").unwrap().unwrap();
        assert_eq!(log.matches("## Decision (from parent)").count(), 2);
        assert!(log.contains("prefer the flat layout"));
        assert!(log.contains("keep both spellings"));
    }

    #[test]
    fn inputs_hash_changes_with_any_input() {
        let dir = tempdir().unwrap();
        let s = store(&dir);
        s.write_excerpt("03", "excerpt").unwrap();
        s.write_proposal("03", "proposal").unwrap();
        let base = s.inputs_hash("03").unwrap();

        s.write_note("01", "03", "the hook name changed").unwrap();
        let with_note = s.inputs_hash("03").unwrap();
        assert_ne!(base, with_note);

        s.append_decision("03", "use the new name").unwrap();
        assert_ne!(with_note, s.inputs_hash("03").unwrap());
    }

    #[test]
    fn aligned_section_detects_invalidation() {
        let dir = tempdir().unwrap();
        let s = store(&dir);
        s.write_excerpt("03", "excerpt").unwrap();
        s.mark_aligned("03").unwrap();
        assert!(!s.is_invalidated("03").unwrap());

        s.write_note("05", "03", "contract moved").unwrap();
        assert!(s.is_invalidated("03").unwrap());
    }

    #[test]
    fn unconverged_section_never_reports_invalidated() {
        let dir = tempdir().unwrap();
        let s = store(&dir);
        s.set_state("07", SectionState::Proposed).unwrap();
        s.write_note("01", "07", "anything").unwrap();
        assert!(!s.is_invalidated("07").unwrap());
    }

    #[test]
    fn cascade_dirties_converged_and_deletes_excerpts() {
        let dir = tempdir().unwrap();
        let s = store(&dir);
        s.write_excerpt("01", "e1").unwrap();
        s.write_excerpt("02", "e2").unwrap();
        s.mark_aligned("01").unwrap();
        s.set_state("02", SectionState::Proposed).unwrap();

        let dirtied = s.invalidate_all().unwrap();
        assert_eq!(dirtied, vec!["01".to_owned()]);
        assert_eq!(s.load_record("01").unwrap().unwrap().state, SectionState::Dirty);
        assert_eq!(
            s.load_record("02").unwrap().unwrap().state,
            SectionState::Proposed
        );
        assert!(s.read_excerpt("01").unwrap().is_none());
        assert!(s.read_excerpt("02").unwrap().is_none());
    }

    #[test]
    fn note_ack_cycle() {
        let dir = tempdir().unwrap();
        let s = store(&dir);
        let id = s.write_note("02", "04", "renamed the event type").unwrap();
        let unacked = s.unacked_notes("04").unwrap();
        assert_eq!(unacked.len(), 1);
        assert_eq!(unacked[0].id, id);
        assert_eq!(unacked[0].from, "02");

        s.ack_note("04", &id).unwrap();
        assert!(s.unacked_notes("04").unwrap().is_empty());

        // Rewriting the note issues a new id that needs a fresh ack.
        let new_id = s.write_note("02", "04", "renamed it again").unwrap();
        assert_ne!(new_id, id);
        assert_eq!(s.unacked_notes("04").unwrap().len(), 1);
    }

    #[test]
    fn snapshot_rejects_escaping_paths() {
        let dir = tempdir().unwrap();
        let s = store(&dir);
        let ws = tempdir().unwrap();
        let err = s
            .snapshot_files("01", ws.path(), &["../outside.txt".into()])
            .unwrap_err();
        assert!(matches!(err, StoreError::PathEscape(_)));
    }

    #[test]
    fn snapshot_preserves_relative_layout() {
        let dir = tempdir().unwrap();
        let s = store(&dir);
        let ws = tempdir().unwrap();
        fs::create_dir_all(ws.path().join("docs")).unwrap();
        fs::write(ws.path().join("docs/03.md"), "body").unwrap();

        let copied = s
            .snapshot_files("03", ws.path(), &["docs/03.md".into(), "missing.md".into()])
            .unwrap();
        assert_eq!(copied, 1);
        assert_eq!(
            s.snapshot_file("03", "docs/03.md").unwrap().as_deref(),
            Some("body")
        );
    }
}
