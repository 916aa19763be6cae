//! Drives one section from untouched to converged.
//!
//! The engine owns no text judgment of its own: workers draft, judges
//! review, and the engine routes the structured outcome. Three loops run in
//! order — setup until excerpts exist, proposal until the draft passes
//! review, implementation until the applied change passes review — and each
//! loop can pause out to the parent when the governing description does not
//! decide a question. A resume retries the interrupted step with the
//! upstream decision already durable in the section's decision log.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::collaborator::{
    normalize_feedback, parse_impacts, AlignmentJudge, CollaboratorFailure, ImpactClassifier,
    ImpactKind, ModelTier, Verdict, WorkOutput, WorkRequest, WorkStage, Worker,
};
use crate::config::CoordinationConfig;
use crate::mailbox::{AgentRegistry, AgentStatus, Mailbox, MailboxError, RecvOutcome};
use crate::pipeline::{PipelineControl, PipelineError};
use crate::protocol::{ControlMessage, PauseKind};
use crate::section::store::{SectionStore, StoreError};
use crate::section::{IllegalTransition, SectionProgress, SectionState};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Mailbox(#[from] MailboxError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Transition(#[from] IllegalTransition),
    #[error(transparent)]
    Collaborator(#[from] CollaboratorFailure),
    #[error("section {section} stalled: judge repeated the same feedback: {feedback}")]
    Stalled { section: String, feedback: String },
}

/// How a section run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionOutcome {
    Converged { summary: String },
    /// The parent sent `abort` while this section was waiting.
    Aborted,
    /// The governing description changed under us; the caller should
    /// requeue the section after the cascade invalidation.
    Superseded,
}

enum ResumeOutcome {
    Decision(String),
    Aborted,
    Superseded,
}

pub struct ConvergenceEngine {
    config: CoordinationConfig,
    bus: Mailbox,
    registry: AgentRegistry,
    store: SectionStore,
    pipeline: PipelineControl,
    workspace: PathBuf,
    parent_queue: String,
    worker: Arc<dyn Worker>,
    judge: Arc<dyn AlignmentJudge>,
    classifier: Arc<dyn ImpactClassifier>,
}

impl ConvergenceEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CoordinationConfig,
        bus: Mailbox,
        registry: AgentRegistry,
        store: SectionStore,
        pipeline: PipelineControl,
        workspace: PathBuf,
        parent_queue: impl Into<String>,
        worker: Arc<dyn Worker>,
        judge: Arc<dyn AlignmentJudge>,
        classifier: Arc<dyn ImpactClassifier>,
    ) -> Self {
        Self {
            config,
            bus,
            registry,
            store,
            pipeline,
            workspace,
            parent_queue: parent_queue.into(),
            worker,
            judge,
            classifier,
        }
    }

    fn own_queue(section: &str) -> String {
        format!("section-{section}")
    }

    /// Run one section to convergence or failure. `others` are the section
    /// ids the impact pass may address notes to.
    ///
    /// On success a `done:<section>:<summary>` message goes to the parent;
    /// on stall or collaborator failure a `fail:<section>:<error>` message
    /// goes out before the error is returned.
    pub async fn run_section(
        &self,
        section: &str,
        others: &[String],
    ) -> Result<SectionOutcome, EngineError> {
        let queue = Self::own_queue(section);
        self.registry.register(&queue)?;
        let result = self.run_inner(section, &queue, others).await;
        match &result {
            Ok(SectionOutcome::Converged { summary }) => {
                self.bus.send(
                    &self.parent_queue,
                    &ControlMessage::Done {
                        section: section.to_owned(),
                        summary: summary.clone(),
                    }
                    .to_string(),
                )?;
            }
            Ok(SectionOutcome::Aborted) => {
                self.registry.unregister(&queue)?;
            }
            Ok(SectionOutcome::Superseded) => {}
            Err(e) => {
                self.store.set_state(section, SectionState::Failed)?;
                // Best effort; the error itself is what the caller acts on.
                let _ = self.bus.send(
                    &self.parent_queue,
                    &ControlMessage::Fail {
                        section: section.to_owned(),
                        error: e.to_string(),
                    }
                    .to_string(),
                );
            }
        }
        result
    }

    async fn run_inner(
        &self,
        section: &str,
        queue: &str,
        others: &[String],
    ) -> Result<SectionOutcome, EngineError> {
        // A converged section whose inputs have not changed stays
        // converged; re-entering the draft loops without a recorded
        // invalidation would be a silent re-convergence.
        if let Some(record) = self.store.load_record(section)? {
            if record.state == SectionState::Aligned && !self.store.is_invalidated(section)? {
                debug!(section, "already converged, nothing invalidated");
                return Ok(SectionOutcome::Converged {
                    summary: "already converged".to_owned(),
                });
            }
        }

        // Surviving artifacts, not the persisted record, decide what
        // reruns: a dirty section with intact excerpts goes straight back
        // to proposing against them.
        let mut progress = SectionProgress::new(section);

        // Fold unacknowledged notes into context and acknowledge them;
        // the note ids stay in the inputs hash either way.
        let mut note_context = String::new();
        for note in self.store.unacked_notes(section)? {
            note_context.push_str(&format!("\n## Note from section {}\n{}\n", note.from, note.body));
            self.store.ack_note(section, &note.id)?;
        }

        // Setup: run until excerpts exist.
        while self.store.read_excerpt(section)?.is_none() {
            if let Some(outcome) = self.wait_if_paused(queue).await? {
                return Ok(outcome);
            }
            let out = self
                .worker
                .perform(WorkRequest {
                    section: section.to_owned(),
                    stage: WorkStage::Setup,
                    tier: ModelTier::Standard,
                    context: note_context.clone(),
                })
                .await?;
            self.store.write_excerpt(section, &out.text)?;
        }
        progress.advance(SectionState::Excerpted, None)?;
        self.store.set_state(section, SectionState::Excerpted)?;

        // Proposal loop.
        match self
            .review_loop(section, queue, &mut progress, WorkStage::Proposal, &note_context)
            .await?
        {
            LoopResult::Passed(_) => {
                progress.advance(SectionState::ProposalAligned, None)?;
                self.store.set_state(section, SectionState::ProposalAligned)?;
            }
            LoopResult::Interrupted(outcome) => return Ok(outcome),
        }

        // Implementation loop.
        let implementation = match self
            .review_loop(
                section,
                queue,
                &mut progress,
                WorkStage::Implementation,
                &note_context,
            )
            .await?
        {
            LoopResult::Passed(out) => out,
            LoopResult::Interrupted(outcome) => return Ok(outcome),
        };
        progress.advance(SectionState::Aligned, None)?;
        self.store.mark_aligned(section)?;

        let summary = first_line(&implementation.text);
        self.propagate_impacts(section, &summary, &implementation.modified_files, others)
            .await?;
        info!(section, "section converged");
        Ok(SectionOutcome::Converged { summary })
    }

    /// One draft-review loop: produce an artifact, judge it, feed problems
    /// back into the next attempt, pause on underspecification, and stop
    /// when the judge repeats itself past the stall threshold.
    async fn review_loop(
        &self,
        section: &str,
        queue: &str,
        progress: &mut SectionProgress,
        stage: WorkStage,
        note_context: &str,
    ) -> Result<LoopResult, EngineError> {
        let working_state = match stage {
            WorkStage::Proposal => SectionState::Proposed,
            _ => SectionState::Implemented,
        };
        let mut attempt: u32 = 0;
        let mut feedback: Option<String> = None;
        let mut last_norm: Option<String> = None;
        let mut repeats: u32 = 0;
        let mut modified: BTreeSet<String> = BTreeSet::new();

        loop {
            if let Some(outcome) = self.wait_if_paused(queue).await? {
                return Ok(LoopResult::Interrupted(outcome));
            }
            attempt += 1;
            let tier = if attempt >= self.config.escalation_attempts {
                ModelTier::Escalated
            } else {
                ModelTier::Standard
            };
            let context = self.build_context(section, note_context, feedback.as_deref())?;
            let out = self
                .worker
                .perform(WorkRequest {
                    section: section.to_owned(),
                    stage,
                    tier,
                    context,
                })
                .await?;
            modified.extend(out.modified_files.iter().cloned());
            progress.advance(working_state, None)?;
            self.store.set_state(section, working_state)?;
            if stage == WorkStage::Proposal {
                self.store.write_proposal(section, &out.text)?;
            }

            let review_context = self.build_context(section, note_context, None)?;
            let report = self.judge.review(section, &out.text, &review_context).await?;
            match Verdict::parse(&report) {
                Verdict::Aligned => {
                    let out = WorkOutput {
                        text: out.text,
                        modified_files: modified.into_iter().collect(),
                    };
                    return Ok(LoopResult::Passed(out));
                }
                Verdict::Underspecified(detail) => {
                    progress.advance(SectionState::Paused, Some(detail.clone()))?;
                    self.store.set_state(section, SectionState::Paused)?;
                    match self
                        .pause_for_parent(section, queue, PauseKind::Underspec, &detail)
                        .await?
                    {
                        ResumeOutcome::Decision(payload) => {
                            // Durable before the retry, so a crash cannot
                            // lose the decision.
                            self.store.append_decision(section, &payload)?;
                            progress.advance(working_state, Some("resumed".into()))?;
                            self.store.set_state(section, working_state)?;
                            // Same step retried with the decision in context.
                            continue;
                        }
                        ResumeOutcome::Aborted => {
                            return Ok(LoopResult::Interrupted(SectionOutcome::Aborted))
                        }
                        ResumeOutcome::Superseded => {
                            return Ok(LoopResult::Interrupted(SectionOutcome::Superseded))
                        }
                    }
                }
                Verdict::Problems(problems) => {
                    let norm = normalize_feedback(&problems);
                    if last_norm.as_deref() == Some(norm.as_str()) {
                        repeats += 1;
                    } else {
                        repeats = 1;
                        last_norm = Some(norm);
                    }
                    if repeats >= self.config.stall_threshold {
                        return Err(EngineError::Stalled {
                            section: section.to_owned(),
                            feedback: problems,
                        });
                    }
                    warn!(section, ?stage, attempt, "review found problems");
                    feedback = Some(problems);
                }
            }
        }
    }

    fn build_context(
        &self,
        section: &str,
        note_context: &str,
        feedback: Option<&str>,
    ) -> Result<String, EngineError> {
        let mut ctx = String::new();
        if let Some(excerpt) = self.store.read_excerpt(section)? {
            ctx.push_str("## Excerpts\n");
            ctx.push_str(&excerpt);
            ctx.push('\n');
        }
        if let Some(proposal) = self.store.read_proposal(section)? {
            ctx.push_str("## Current proposal\n");
            ctx.push_str(&proposal);
            ctx.push('\n');
        }
        if let Some(decisions) = self.store.read_decisions(section)? {
            ctx.push_str("## Decisions\n");
            ctx.push_str(&decisions);
            ctx.push('\n');
        }
        ctx.push_str(note_context);
        if let Some(fb) = feedback {
            ctx.push_str("\n## Review feedback to address\n");
            ctx.push_str(fb);
            ctx.push('\n');
        }
        Ok(ctx)
    }

    /// Signal the parent and block until it answers.
    ///
    /// Non-control messages that arrive while waiting are held in memory
    /// and requeued once the wait ends, so they replay after the resume
    /// without the receive loop re-claiming its own deferrals.
    async fn pause_for_parent(
        &self,
        section: &str,
        queue: &str,
        kind: PauseKind,
        detail: &str,
    ) -> Result<ResumeOutcome, EngineError> {
        self.bus.send(
            &self.parent_queue,
            &ControlMessage::Pause {
                kind,
                section: section.to_owned(),
                detail: detail.to_owned(),
            }
            .to_string(),
        )?;
        let _ = self.registry.set_status(queue, AgentStatus::Waiting);
        let mut deferred: Vec<String> = Vec::new();
        let outcome = loop {
            let msg = match self.bus.recv(queue, None).await? {
                RecvOutcome::Message(m) => m,
                RecvOutcome::Timeout => continue,
            };
            match ControlMessage::parse(&msg.payload) {
                ControlMessage::Resume { payload } => {
                    let _ = self.registry.set_status(queue, AgentStatus::Running);
                    break ResumeOutcome::Decision(payload);
                }
                ControlMessage::Abort => break ResumeOutcome::Aborted,
                ControlMessage::AlignmentChanged => break ResumeOutcome::Superseded,
                _ => deferred.push(msg.payload),
            }
        };
        for payload in deferred {
            self.bus.send(queue, &payload)?;
        }
        Ok(outcome)
    }

    /// Park while the pipeline is paused. Returns an interrupting outcome
    /// if an `abort` or `alignment_changed` arrives while parked.
    async fn wait_if_paused(&self, queue: &str) -> Result<Option<SectionOutcome>, EngineError> {
        if !self.pipeline.is_paused().await {
            return Ok(None);
        }
        self.bus.send(
            &self.parent_queue,
            &ControlMessage::Status {
                text: "paused".into(),
            }
            .to_string(),
        )?;
        let _ = self.registry.set_status(queue, AgentStatus::Waiting);
        while self.pipeline.is_paused().await {
            for msg in self.bus.drain(queue)? {
                match ControlMessage::parse(&msg.payload) {
                    ControlMessage::Abort => return Ok(Some(SectionOutcome::Aborted)),
                    ControlMessage::AlignmentChanged => {
                        return Ok(Some(SectionOutcome::Superseded))
                    }
                    _ => {
                        self.bus.send(queue, &msg.payload)?;
                    }
                }
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
        let _ = self.registry.set_status(queue, AgentStatus::Running);
        self.bus.send(
            &self.parent_queue,
            &ControlMessage::Status {
                text: "resumed".into(),
            }
            .to_string(),
        )?;
        Ok(None)
    }

    /// After convergence: snapshot what changed, ask the classifier which
    /// other sections are affected, and leave consequence notes for the
    /// material ones. Classifier trouble is logged and swallowed; it never
    /// un-converges the section that just finished.
    async fn propagate_impacts(
        &self,
        section: &str,
        summary: &str,
        modified: &[String],
        others: &[String],
    ) -> Result<(), EngineError> {
        if !modified.is_empty() {
            let copied = self
                .store
                .snapshot_files(section, &self.workspace, modified)?;
            info!(section, copied, "snapshotted modified files");
        }
        if others.is_empty() || modified.is_empty() {
            return Ok(());
        }
        let raw = match self.classifier.classify(section, summary, others).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(section, error = %e, "impact classification failed, skipping");
                return Ok(());
            }
        };
        let report = match parse_impacts(&raw) {
            Ok(report) => report,
            Err(e) => {
                warn!(section, error = %e, "unusable impact report, skipping");
                return Ok(());
            }
        };
        for entry in report.impacts {
            if entry.impact != ImpactKind::Material {
                continue;
            }
            if !others.contains(&entry.to) {
                warn!(section, to = %entry.to, "impact addressed to unknown section, dropped");
                continue;
            }
            let body = entry
                .note_markdown
                .unwrap_or_else(|| format!("## Consequence\n{}\n", entry.reason));
            let id = self.store.write_note(section, &entry.to, &body)?;
            info!(section, to = %entry.to, note = %id, "consequence note written");
        }
        Ok(())
    }
}

enum LoopResult {
    Passed(WorkOutput),
    Interrupted(SectionOutcome),
}

fn first_line(text: &str) -> String {
    text.lines()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("converged")
        .trim()
        .to_owned()
}
