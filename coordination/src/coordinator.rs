//! Bounded multi-round global coordination.
//!
//! After every section has individually converged, cross-section effects
//! can still leave the whole misaligned: a late section's changes
//! invalidate an early one, notes sit unacknowledged, pause signals sit
//! unanswered. Each round collects the outstanding problems, groups the
//! ones that plausibly share a root cause, dispatches fixes with bounded
//! parallelism, and re-verifies only what changed. Rounds are capped and a
//! run that stops reducing the problem count escalates with full
//! diagnostics instead of looping.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::collaborator::{
    AlignmentJudge, ModelTier, RelationshipChecker, Verdict, WorkRequest, WorkStage, Worker,
};
use crate::config::CoordinationConfig;
use crate::mailbox::{Mailbox, MailboxError};
use crate::protocol::ControlMessage;
use crate::section::store::{SectionStore, StoreError};
use crate::section::SectionState;

#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    #[error(transparent)]
    Mailbox(#[from] MailboxError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("coordination artifact I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("coordination artifact encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemKind {
    Misaligned,
    UnaddressedNote,
    UnresolvedSignal,
}

/// One outstanding cross-section problem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Problem {
    pub section: String,
    pub kind: ProblemKind,
    pub description: String,
    /// Workspace-relative files plausibly involved; grouping keys on these.
    pub files: BTreeSet<String>,
    /// For note problems: (target section, note id) to acknowledge once
    /// the fix lands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<(String, String)>,
}

/// Diagnostics handed to a stronger collaborator when coordination gives
/// up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationReport {
    pub rounds: u32,
    pub stalled_rounds: u32,
    pub outstanding: Vec<Problem>,
}

#[derive(Debug, Clone)]
pub enum CoordinationOutcome {
    Converged { rounds: u32 },
    Escalated(EscalationReport),
}

pub struct GlobalCoordinator {
    config: CoordinationConfig,
    bus: Mailbox,
    store: SectionStore,
    /// Queue the coordinator reports `complete`/escalations to, and drains
    /// for unanswered section signals.
    report_queue: String,
    fixer: Arc<dyn Worker>,
    judge: Arc<dyn AlignmentJudge>,
    checker: Arc<dyn RelationshipChecker>,
}

impl GlobalCoordinator {
    pub fn new(
        config: CoordinationConfig,
        bus: Mailbox,
        store: SectionStore,
        report_queue: impl Into<String>,
        fixer: Arc<dyn Worker>,
        judge: Arc<dyn AlignmentJudge>,
        checker: Arc<dyn RelationshipChecker>,
    ) -> Self {
        Self {
            config,
            bus,
            store,
            report_queue: report_queue.into(),
            fixer,
            judge,
            checker,
        }
    }

    /// Run coordination to quiescence or escalation.
    pub async fn run(&self, sections: &[String]) -> Result<CoordinationOutcome, CoordinationError> {
        // Inputs hash at the last judge check that came back aligned;
        // unchanged means the check is still valid and is skipped.
        let mut verified: HashMap<String, String> = HashMap::new();
        let mut stall: u32 = 0;
        // Baseline is the count entering coordination, so a first round
        // that fixes nothing already counts against the stall window.
        let mut prev_outstanding = self.baseline_outstanding(sections)?;

        for round in 1..=self.config.max_rounds {
            let problems = self.collect_problems(sections, &mut verified).await?;
            self.dump_round(round, &problems)?;

            if problems.is_empty() {
                info!(round, "coordination converged");
                self.bus
                    .send(&self.report_queue, &ControlMessage::Complete.to_string())?;
                return Ok(CoordinationOutcome::Converged { rounds: round });
            }
            if problems.len() >= prev_outstanding {
                stall += 1;
            } else {
                stall = 0;
            }
            prev_outstanding = problems.len();
            info!(
                round,
                outstanding = problems.len(),
                stall,
                "coordination round"
            );
            if round >= self.config.min_rounds && stall >= self.config.stall_rounds {
                return self.escalate(round, stall, problems);
            }

            let groups = self.group_problems(problems).await;
            self.dispatch_fixes(groups).await?;
        }

        let problems = self.collect_problems(sections, &mut verified).await?;
        if problems.is_empty() {
            self.bus
                .send(&self.report_queue, &ControlMessage::Complete.to_string())?;
            return Ok(CoordinationOutcome::Converged {
                rounds: self.config.max_rounds,
            });
        }
        self.escalate(self.config.max_rounds, stall, problems)
    }

    fn escalate(
        &self,
        rounds: u32,
        stalled_rounds: u32,
        outstanding: Vec<Problem>,
    ) -> Result<CoordinationOutcome, CoordinationError> {
        let report = EscalationReport {
            rounds,
            stalled_rounds,
            outstanding,
        };
        let path = self.coordination_dir()?.join("escalation.json");
        std::fs::write(&path, serde_json::to_string_pretty(&report)?)
            .map_err(|source| CoordinationError::Io { path, source })?;
        warn!(
            rounds,
            outstanding = report.outstanding.len(),
            "coordination escalated"
        );
        self.bus.send(
            &self.report_queue,
            &ControlMessage::Escalation {
                detail: format!(
                    "{} problems outstanding after {} rounds",
                    report.outstanding.len(),
                    rounds
                ),
            }
            .to_string(),
        )?;
        Ok(CoordinationOutcome::Escalated(report))
    }

    /// Outstanding count entering coordination: sections that are not
    /// converged plus notes nobody acknowledged. Record inspection only;
    /// no judges are consulted and no queue is drained.
    fn baseline_outstanding(&self, sections: &[String]) -> Result<usize, CoordinationError> {
        let mut count = 0;
        for section in sections {
            if let Some(record) = self.store.load_record(section)? {
                if record.state != SectionState::Aligned {
                    count += 1;
                }
            }
            count += self.store.unacked_notes(section)?.len();
        }
        Ok(count)
    }

    /// Everything still wrong: misaligned sections (re-checked only when
    /// their inputs changed), consequence notes nobody processed, and
    /// section signals nobody answered.
    async fn collect_problems(
        &self,
        sections: &[String],
        verified: &mut HashMap<String, String>,
    ) -> Result<Vec<Problem>, CoordinationError> {
        let mut problems = Vec::new();

        for section in sections {
            let Some(record) = self.store.load_record(section)? else {
                continue;
            };
            match record.state {
                SectionState::Aligned => {
                    let hash = self.store.inputs_hash(section)?;
                    let gated = verified.get(section) == Some(&hash)
                        || record.inputs_hash.as_deref() == Some(hash.as_str());
                    if gated {
                        verified.insert(section.clone(), hash);
                        continue;
                    }
                    match self.recheck(section).await? {
                        Verdict::Aligned => {
                            self.store.mark_aligned(section)?;
                            verified.insert(section.clone(), self.store.inputs_hash(section)?);
                        }
                        Verdict::Problems(description)
                        | Verdict::Underspecified(description) => {
                            self.store.invalidate(section)?;
                            verified.remove(section);
                            problems.push(self.misaligned(section, description)?);
                        }
                    }
                }
                SectionState::Dirty | SectionState::Failed => {
                    // Always re-check: the previous round's fix may have
                    // resolved it.
                    match self.recheck(section).await? {
                        Verdict::Aligned => {
                            self.store.mark_aligned(section)?;
                            verified.insert(section.clone(), self.store.inputs_hash(section)?);
                        }
                        Verdict::Problems(description)
                        | Verdict::Underspecified(description) => {
                            problems.push(self.misaligned(section, description)?);
                        }
                    }
                }
                _ => {
                    problems.push(self.misaligned(
                        section,
                        format!("section never converged (state {:?})", record.state),
                    )?);
                }
            }

            for note in self.store.unacked_notes(section)? {
                let mut files: BTreeSet<String> =
                    self.store.snapshot_paths(&note.from)?.into_iter().collect();
                files.extend(self.store.snapshot_paths(section)?);
                problems.push(Problem {
                    section: section.clone(),
                    kind: ProblemKind::UnaddressedNote,
                    description: format!(
                        "note {} from section {} not processed:\n{}",
                        note.id, note.from, note.body
                    ),
                    files,
                    note: Some((section.clone(), note.id)),
                });
            }
        }

        for msg in self.bus.drain(&self.report_queue)? {
            match ControlMessage::parse(&msg.payload) {
                ControlMessage::Pause {
                    kind,
                    section,
                    detail,
                } => {
                    let files = self.store.snapshot_paths(&section)?.into_iter().collect();
                    problems.push(Problem {
                        section: section.clone(),
                        kind: ProblemKind::UnresolvedSignal,
                        description: format!("unanswered {:?} signal: {detail}", kind),
                        files,
                        note: None,
                    });
                }
                // Progress reports carry no outstanding work.
                _ => {}
            }
        }

        Ok(problems)
    }

    fn misaligned(
        &self,
        section: &str,
        description: String,
    ) -> Result<Problem, CoordinationError> {
        Ok(Problem {
            section: section.to_owned(),
            kind: ProblemKind::Misaligned,
            description,
            files: self.store.snapshot_paths(section)?.into_iter().collect(),
            note: None,
        })
    }

    async fn recheck(&self, section: &str) -> Result<Verdict, CoordinationError> {
        let subject = self
            .store
            .read_proposal(section)?
            .or(self.store.read_excerpt(section)?)
            .unwrap_or_default();
        let mut context = String::new();
        if let Some(excerpt) = self.store.read_excerpt(section)? {
            context.push_str(&excerpt);
        }
        if let Some(decisions) = self.store.read_decisions(section)? {
            context.push_str(&decisions);
        }
        match self.judge.review(section, &subject, &context).await {
            Ok(report) => Ok(Verdict::parse(&report)),
            // A judge outage must not wedge the round; the section stays
            // in its current state and is re-checked next round.
            Err(e) => {
                warn!(section, error = %e, "re-check failed, deferring");
                Ok(Verdict::Problems(format!("re-check unavailable: {e}")))
            }
        }
    }

    /// Connected components over shared files, each multi-problem
    /// component confirmed as a genuine shared root cause before it is
    /// fixed as a unit. Unconfirmed or unconfirmable components fall back
    /// to per-problem groups.
    async fn group_problems(&self, problems: Vec<Problem>) -> Vec<Vec<Problem>> {
        let mut component: Vec<usize> = (0..problems.len()).collect();
        for i in 0..problems.len() {
            for j in (i + 1)..problems.len() {
                if !problems[i].files.is_disjoint(&problems[j].files) {
                    let (a, b) = (component[i], component[j]);
                    if a != b {
                        for c in component.iter_mut() {
                            if *c == b {
                                *c = a;
                            }
                        }
                    }
                }
            }
        }

        let mut by_component: HashMap<usize, Vec<Problem>> = HashMap::new();
        for (idx, problem) in problems.into_iter().enumerate() {
            by_component.entry(component[idx]).or_default().push(problem);
        }

        let mut groups = Vec::new();
        for (_, group) in by_component {
            if group.len() < 2 {
                groups.push(group);
                continue;
            }
            let descriptions: Vec<String> =
                group.iter().map(|p| p.description.clone()).collect();
            match self.checker.confirm_related(&descriptions).await {
                Ok(true) => groups.push(group),
                Ok(false) => groups.extend(group.into_iter().map(|p| vec![p])),
                Err(e) => {
                    warn!(error = %e, "relationship check failed, splitting group");
                    groups.extend(group.into_iter().map(|p| vec![p]));
                }
            }
        }
        groups.sort_by(|a, b| a[0].section.cmp(&b[0].section));
        groups
    }

    /// Dispatch fixes batch by batch: groups whose file sets are disjoint
    /// run concurrently under the configured cap, overlapping groups wait
    /// for the next batch. One group failing never aborts the others.
    async fn dispatch_fixes(&self, groups: Vec<Vec<Problem>>) -> Result<(), CoordinationError> {
        let mut remaining = groups;
        while !remaining.is_empty() {
            let mut batch: Vec<Vec<Problem>> = Vec::new();
            let mut batch_files: BTreeSet<String> = BTreeSet::new();
            let mut deferred = Vec::new();
            for group in remaining {
                let files: BTreeSet<String> = group
                    .iter()
                    .flat_map(|p| p.files.iter().cloned())
                    .collect();
                if files.is_disjoint(&batch_files) {
                    batch_files.extend(files);
                    batch.push(group);
                } else {
                    deferred.push(group);
                }
            }
            remaining = deferred;

            let semaphore = Arc::new(Semaphore::new(self.config.fix_concurrency));
            let mut handles = Vec::new();
            for group in batch {
                let semaphore = Arc::clone(&semaphore);
                let fixer = Arc::clone(&self.fixer);
                let store = self.store.clone();
                handles.push(tokio::spawn(async move {
                    // Closing the semaphore is not a thing we do, so the
                    // only acquire failure mode is cancellation.
                    let Ok(_permit) = semaphore.acquire().await else {
                        return;
                    };
                    fix_group(fixer, store, group).await;
                }));
            }
            for result in futures::future::join_all(handles).await {
                if let Err(e) = result {
                    warn!(error = %e, "fix task panicked");
                }
            }
        }
        Ok(())
    }

    fn coordination_dir(&self) -> Result<PathBuf, CoordinationError> {
        let dir = self.store.root().join("coordination");
        std::fs::create_dir_all(&dir)
            .map_err(|source| CoordinationError::Io {
                path: dir.clone(),
                source,
            })?;
        Ok(dir)
    }

    fn dump_round(&self, round: u32, problems: &[Problem]) -> Result<(), CoordinationError> {
        let path = self
            .coordination_dir()?
            .join(format!("round-{round:02}-problems.json"));
        std::fs::write(&path, serde_json::to_string_pretty(problems)?)
            .map_err(|source| CoordinationError::Io { path, source })?;
        Ok(())
    }
}

/// Fix one problem group. Failures are logged and isolated; the next
/// round's re-check decides whether anything actually improved.
async fn fix_group(fixer: Arc<dyn Worker>, store: SectionStore, group: Vec<Problem>) {
    let section = group[0].section.clone();
    let mut context = String::new();
    for problem in &group {
        context.push_str(&format!(
            "## Problem in section {} ({:?})\n{}\n",
            problem.section, problem.kind, problem.description
        ));
    }
    let request = WorkRequest {
        section: section.clone(),
        stage: WorkStage::Fix,
        tier: ModelTier::Standard,
        context,
    };
    match fixer.perform(request).await {
        Ok(output) => {
            for problem in &group {
                match &problem.kind {
                    ProblemKind::UnaddressedNote => {
                        if let Some((target, id)) = &problem.note {
                            if let Err(e) = store.ack_note(target, id) {
                                warn!(section = %target, error = %e, "note ack failed");
                            }
                        }
                    }
                    ProblemKind::UnresolvedSignal => {
                        if let Err(e) = store.append_decision(&problem.section, &output.text) {
                            warn!(section = %problem.section, error = %e, "decision append failed");
                        }
                    }
                    ProblemKind::Misaligned => {}
                }
            }
            info!(section = %section, problems = group.len(), "fix dispatched");
        }
        Err(e) => {
            warn!(section = %section, error = %e, "fix failed, will retry next round");
        }
    }
}
