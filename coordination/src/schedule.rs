//! Typed schedule document and the sequential driver over it.
//!
//! A schedule is a plain-text file, one step per line:
//!
//! ```text
//! [wait] 3. section-03 | strong -- reconcile the hook contracts (docs/03.md)
//! ```
//!
//! Statuses are `wait`, `run`, `done`, `fail`, `skip`. The driver never
//! edits lines as strings: the file is parsed into [`ScheduleStep`] records,
//! mutated through the typed API, and rendered back, so a formatting quirk
//! can never corrupt step state. Parse and render are exact inverses.
//!
//! All load-modify-store cycles run under a lock file taken with an atomic
//! create, so concurrent drivers cannot interleave their rewrites.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("schedule file not found: {0}")]
    Missing(PathBuf),
    #[error("schedule I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed schedule line {line_no}: {line:?}")]
    Malformed { line_no: usize, line: String },
    #[error("no step is currently running")]
    NoRunningStep,
    #[error("no failed step to retry")]
    NoFailedStep,
    #[error("could not take schedule lock {0} (another driver holds it)")]
    Locked(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Wait,
    Run,
    Done,
    Fail,
    Skip,
}

impl StepStatus {
    fn as_str(self) -> &'static str {
        match self {
            StepStatus::Wait => "wait",
            StepStatus::Run => "run",
            StepStatus::Done => "done",
            StepStatus::Fail => "fail",
            StepStatus::Skip => "skip",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "wait" => Some(StepStatus::Wait),
            "run" => Some(StepStatus::Run),
            "done" => Some(StepStatus::Done),
            "fail" => Some(StepStatus::Fail),
            "skip" => Some(StepStatus::Skip),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleStep {
    pub status: StepStatus,
    pub number: u32,
    pub name: String,
    pub model: String,
    pub description: String,
    pub reference: Option<String>,
}

impl ScheduleStep {
    fn parse(line: &str, line_no: usize) -> Result<Self, ScheduleError> {
        let malformed = || ScheduleError::Malformed {
            line_no,
            line: line.to_owned(),
        };

        let rest = line.strip_prefix('[').ok_or_else(malformed)?;
        let (status, rest) = rest.split_once("] ").ok_or_else(malformed)?;
        let status = StepStatus::parse(status).ok_or_else(malformed)?;
        let (number, rest) = rest.split_once(". ").ok_or_else(malformed)?;
        let number: u32 = number.parse().map_err(|_| malformed())?;
        let (name, rest) = rest.split_once(" | ").ok_or_else(malformed)?;
        let (model, tail) = rest.split_once(" -- ").ok_or_else(malformed)?;

        let (description, reference) = match tail.rsplit_once(" (") {
            Some((desc, rest)) if rest.ends_with(')') => (
                desc.to_owned(),
                Some(rest[..rest.len() - 1].to_owned()),
            ),
            _ => (tail.to_owned(), None),
        };

        Ok(Self {
            status,
            number,
            name: name.to_owned(),
            model: model.to_owned(),
            description,
            reference,
        })
    }

    fn render(&self) -> String {
        let mut line = format!(
            "[{}] {}. {} | {} -- {}",
            self.status.as_str(),
            self.number,
            self.name,
            self.model,
            self.description
        );
        if let Some(r) = &self.reference {
            line.push_str(&format!(" ({r})"));
        }
        line
    }
}

/// In-memory schedule document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    steps: Vec<ScheduleStep>,
}

impl Schedule {
    pub fn parse(text: &str) -> Result<Self, ScheduleError> {
        let mut steps = Vec::new();
        for (i, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            steps.push(ScheduleStep::parse(line, i + 1)?);
        }
        Ok(Self { steps })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for step in &self.steps {
            out.push_str(&step.render());
            out.push('\n');
        }
        out
    }

    pub fn steps(&self) -> &[ScheduleStep] {
        &self.steps
    }

    pub fn running(&self) -> Option<&ScheduleStep> {
        self.steps.iter().find(|s| s.status == StepStatus::Run)
    }

    fn running_mut(&mut self) -> Option<&mut ScheduleStep> {
        self.steps.iter_mut().find(|s| s.status == StepStatus::Run)
    }

    pub fn is_complete(&self) -> bool {
        !self
            .steps
            .iter()
            .any(|s| matches!(s.status, StepStatus::Wait | StepStatus::Run))
    }
}

/// What `next()` handed back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverOutcome {
    Step(ScheduleStep),
    /// No waiting or running steps remain.
    Complete,
}

/// Sequential driver over a schedule file.
///
/// At most one step is running at a time, steps run in document order, and
/// every state change is a locked load-modify-store.
#[derive(Debug, Clone)]
pub struct ScheduleDriver {
    path: PathBuf,
    lock_stale: Duration,
}

impl ScheduleDriver {
    pub fn new(path: impl Into<PathBuf>, lock_stale: Duration) -> Self {
        Self {
            path: path.into(),
            lock_stale,
        }
    }

    /// Return the step to work on.
    ///
    /// Idempotent: if a step is already running it is returned unchanged,
    /// so a driver restarted mid-step resumes instead of double-advancing.
    /// Otherwise the first waiting step is promoted to running.
    pub fn next(&self) -> Result<DriverOutcome, ScheduleError> {
        self.with_locked_schedule(|schedule| {
            if let Some(step) = schedule.running() {
                debug!(step = %step.name, "resuming already-running step");
                return Ok((false, DriverOutcome::Step(step.clone())));
            }
            match schedule
                .steps
                .iter_mut()
                .find(|s| s.status == StepStatus::Wait)
            {
                Some(step) => {
                    step.status = StepStatus::Run;
                    debug!(step = %step.name, "step promoted to running");
                    Ok((true, DriverOutcome::Step(step.clone())))
                }
                None => Ok((false, DriverOutcome::Complete)),
            }
        })
    }

    /// Mark the running step done.
    pub fn done(&self) -> Result<ScheduleStep, ScheduleError> {
        self.finish_running(StepStatus::Done)
    }

    /// Mark the running step failed.
    pub fn fail(&self) -> Result<ScheduleStep, ScheduleError> {
        self.finish_running(StepStatus::Fail)
    }

    /// Mark the running step skipped.
    pub fn skip(&self) -> Result<ScheduleStep, ScheduleError> {
        self.finish_running(StepStatus::Skip)
    }

    fn finish_running(&self, status: StepStatus) -> Result<ScheduleStep, ScheduleError> {
        self.with_locked_schedule(|schedule| {
            let step = schedule.running_mut().ok_or(ScheduleError::NoRunningStep)?;
            step.status = status;
            Ok((true, step.clone()))
        })
    }

    /// Demote the first failed step back to waiting, in place. Document
    /// order never changes, so the retried step runs before anything after
    /// it.
    pub fn retry(&self) -> Result<ScheduleStep, ScheduleError> {
        self.with_locked_schedule(|schedule| {
            let step = schedule
                .steps
                .iter_mut()
                .find(|s| s.status == StepStatus::Fail)
                .ok_or(ScheduleError::NoFailedStep)?;
            step.status = StepStatus::Wait;
            Ok((true, step.clone()))
        })
    }

    /// Load without locking, for read-only inspection.
    pub fn load(&self) -> Result<Schedule, ScheduleError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ScheduleError::Missing(self.path.clone()))
            }
            Err(source) => {
                return Err(ScheduleError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        Schedule::parse(&text)
    }

    fn with_locked_schedule<T>(
        &self,
        f: impl FnOnce(&mut Schedule) -> Result<(bool, T), ScheduleError>,
    ) -> Result<T, ScheduleError> {
        let _guard = LockGuard::take(&self.path, self.lock_stale)?;
        let mut schedule = self.load()?;
        let (dirty, value) = f(&mut schedule)?;
        if dirty {
            self.store(&schedule)?;
        }
        Ok(value)
    }

    fn store(&self, schedule: &Schedule) -> Result<(), ScheduleError> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, schedule.render()).map_err(|source| ScheduleError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &self.path).map_err(|source| ScheduleError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

/// Lock file held for one load-modify-store cycle. Removed on drop.
struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    fn take(schedule_path: &Path, stale_after: Duration) -> Result<Self, ScheduleError> {
        let path = schedule_path.with_extension("lock");
        // Short contention window; a handful of retries covers it.
        for _ in 0..200 {
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path, stale_after) {
                        warn!(lock = %path.display(), "breaking stale schedule lock");
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    std::thread::sleep(Duration::from_millis(25));
                }
                Err(source) => return Err(ScheduleError::Io { path, source }),
            }
        }
        Err(ScheduleError::Locked(path))
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn lock_is_stale(path: &Path, stale_after: Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|mtime| mtime.elapsed().ok())
        .map(|age| age > stale_after)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = "\
[done] 1. section-01 | fast -- rewrite the intro (docs/01.md)
[run] 2. section-02 | fast -- align the data model (docs/02.md)
[wait] 3. section-03 | strong -- reconcile hooks
[fail] 4. section-04 | fast -- retime the walkthrough (docs/04.md)
";

    fn driver(dir: &tempfile::TempDir, text: &str) -> ScheduleDriver {
        let path = dir.path().join("schedule.txt");
        fs::write(&path, text).unwrap();
        ScheduleDriver::new(path, Duration::from_secs(300))
    }

    #[test]
    fn parse_render_are_inverses() {
        let schedule = Schedule::parse(SAMPLE).unwrap();
        assert_eq!(schedule.render(), SAMPLE);
        let step = &schedule.steps()[0];
        assert_eq!(step.reference.as_deref(), Some("docs/01.md"));
        let no_ref = &schedule.steps()[2];
        assert_eq!(no_ref.reference, None);
        assert_eq!(no_ref.description, "reconcile hooks");
    }

    #[test]
    fn malformed_line_reports_position() {
        let err = Schedule::parse("[run] not a step").unwrap_err();
        match err {
            ScheduleError::Malformed { line_no, .. } => assert_eq!(line_no, 1),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn next_is_idempotent_on_running_step() {
        let dir = tempdir().unwrap();
        let d = driver(&dir, SAMPLE);
        let first = d.next().unwrap();
        let second = d.next().unwrap();
        assert_eq!(first, second);
        match first {
            DriverOutcome::Step(step) => assert_eq!(step.name, "section-02"),
            DriverOutcome::Complete => panic!("expected a step"),
        }
    }

    #[test]
    fn done_then_next_advances_in_order() {
        let dir = tempdir().unwrap();
        let d = driver(&dir, SAMPLE);
        d.done().unwrap();
        match d.next().unwrap() {
            DriverOutcome::Step(step) => {
                assert_eq!(step.name, "section-03");
                assert_eq!(step.status, StepStatus::Run);
            }
            DriverOutcome::Complete => panic!("expected a step"),
        }
    }

    #[test]
    fn retry_demotes_failed_step_in_place() {
        let dir = tempdir().unwrap();
        let d = driver(&dir, SAMPLE);
        d.done().unwrap();
        let retried = d.retry().unwrap();
        assert_eq!(retried.name, "section-04");
        // section-03 still precedes the retried step in document order
        let schedule = d.load().unwrap();
        assert_eq!(schedule.steps()[2].name, "section-03");
        assert_eq!(schedule.steps()[3].status, StepStatus::Wait);
    }

    #[test]
    fn complete_when_nothing_waits_or_runs() {
        let dir = tempdir().unwrap();
        let d = driver(
            &dir,
            "[done] 1. a | m -- x\n[skip] 2. b | m -- y\n[fail] 3. c | m -- z\n",
        );
        assert_eq!(d.next().unwrap(), DriverOutcome::Complete);
    }

    #[test]
    fn finish_without_running_step_errors() {
        let dir = tempdir().unwrap();
        let d = driver(&dir, "[wait] 1. a | m -- x\n");
        assert!(matches!(d.done(), Err(ScheduleError::NoRunningStep)));
    }

    #[test]
    fn lock_released_after_each_operation() {
        let dir = tempdir().unwrap();
        let d = driver(&dir, SAMPLE);
        d.next().unwrap();
        assert!(!dir.path().join("schedule.lock").exists());
    }

    #[test]
    fn stale_lock_is_broken() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("schedule.txt");
        fs::write(&path, SAMPLE).unwrap();
        fs::write(path.with_extension("lock"), "").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let d = ScheduleDriver::new(&path, Duration::from_millis(1));
        assert!(matches!(d.next(), Ok(DriverOutcome::Step(_))));
        assert!(!path.with_extension("lock").exists());
    }
}
