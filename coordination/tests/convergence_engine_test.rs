//! Convergence engine integration tests with scripted collaborators.
//!
//! Tests verify:
//! - A clean draft-review-implement run converges and reports done
//! - Rerunning a converged, uninvalidated section does no new work
//! - An underspecified verdict pauses out, and the resume decision is
//!   durable in the decision log before the retried step runs
//! - Non-control messages claimed while paused replay after resume
//! - Repeated identical judge feedback stalls the loop instead of spinning
//! - Material impacts leave consequence notes for the affected sections
//! - alignment_changed while paused supersedes the run

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use section_coordination::section::engine::{ConvergenceEngine, EngineError, SectionOutcome};
use section_coordination::{
    AgentRegistry, AlignmentJudge, CollaboratorFailure, ControlMessage, CoordinationConfig,
    ImpactClassifier, Mailbox, PipelineControl, SectionState, SectionStore, WorkOutput,
    WorkRequest, WorkStage, Worker,
};

// ─── Scripted collaborators ──────────────────────────────────────────

/// Worker that fabricates stage-appropriate text and reports a modified
/// file for implementation work.
struct EchoWorker {
    calls: AtomicUsize,
}

#[async_trait]
impl Worker for EchoWorker {
    async fn perform(&self, request: WorkRequest) -> Result<WorkOutput, CollaboratorFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let modified = if request.stage == WorkStage::Implementation {
            vec!["docs/section.md".to_owned()]
        } else {
            Vec::new()
        };
        Ok(WorkOutput {
            text: format!("{:?} output for section {}", request.stage, request.section),
            modified_files: modified,
        })
    }
}

/// Judge that replays a fixed sequence of reports.
struct ScriptedJudge {
    reports: Mutex<VecDeque<&'static str>>,
}

impl ScriptedJudge {
    fn new(reports: &[&'static str]) -> Arc<Self> {
        Arc::new(Self {
            reports: Mutex::new(reports.iter().copied().collect()),
        })
    }
}

#[async_trait]
impl AlignmentJudge for ScriptedJudge {
    async fn review(
        &self,
        _section: &str,
        _subject: &str,
        _context: &str,
    ) -> Result<String, CollaboratorFailure> {
        self.reports
            .lock()
            .unwrap()
            .pop_front()
            .map(str::to_owned)
            .ok_or_else(|| CollaboratorFailure::new("judge", "script exhausted"))
    }
}

/// Classifier with a canned reply.
struct StaticClassifier(&'static str);

#[async_trait]
impl ImpactClassifier for StaticClassifier {
    async fn classify(
        &self,
        _section: &str,
        _change_summary: &str,
        _other_sections: &[String],
    ) -> Result<String, CollaboratorFailure> {
        Ok(self.0.to_owned())
    }
}

// ─── Harness ─────────────────────────────────────────────────────────

struct Harness {
    _root: tempfile::TempDir,
    bus: Mailbox,
    store: SectionStore,
    worker: Arc<EchoWorker>,
    engine: Arc<ConvergenceEngine>,
}

fn harness(judge: Arc<ScriptedJudge>, classifier: &'static str) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let mut config = CoordinationConfig::default();
    config.poll_interval_ms = 10;

    let workspace: PathBuf = root.path().join("workspace");
    std::fs::create_dir_all(workspace.join("docs")).unwrap();
    std::fs::write(workspace.join("docs/section.md"), "modified body").unwrap();

    let bus = Mailbox::open(root.path().join("bus"), config.poll_interval()).unwrap();
    let registry = AgentRegistry::open(root.path().join("bus")).unwrap();
    let store = SectionStore::open(root.path().join("artifacts")).unwrap();
    let pipeline = PipelineControl::open(root.path().join("pipeline-state.jsonl")).unwrap();

    let worker = Arc::new(EchoWorker {
        calls: AtomicUsize::new(0),
    });
    let engine = Arc::new(ConvergenceEngine::new(
        config,
        bus.clone(),
        registry,
        store.clone(),
        pipeline,
        workspace,
        "driver",
        worker.clone(),
        judge,
        Arc::new(StaticClassifier(classifier)),
    ));
    Harness {
        _root: root,
        bus,
        store,
        worker,
        engine,
    }
}

const NO_IMPACTS: &str = r#"{"impacts":[]}"#;

async fn recv_parsed(bus: &Mailbox, queue: &str) -> ControlMessage {
    match bus.recv(queue, Some(Duration::from_secs(5))).await.unwrap() {
        section_coordination::RecvOutcome::Message(m) => ControlMessage::parse(&m.payload),
        section_coordination::RecvOutcome::Timeout => panic!("timed out waiting on {queue}"),
    }
}

// ─── Scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn clean_run_converges_and_reports_done() {
    let h = harness(ScriptedJudge::new(&["ALIGNED", "ALIGNED"]), NO_IMPACTS);
    let outcome = h.engine.run_section("03", &[]).await.unwrap();
    assert!(matches!(outcome, SectionOutcome::Converged { .. }));

    let record = h.store.load_record("03").unwrap().unwrap();
    assert_eq!(record.state, SectionState::Aligned);
    assert!(record.inputs_hash.is_some());
    assert!(h.store.read_excerpt("03").unwrap().is_some());

    match recv_parsed(&h.bus, "driver").await {
        ControlMessage::Done { section, .. } => assert_eq!(section, "03"),
        other => panic!("expected done, got {other:?}"),
    }
}

#[tokio::test]
async fn converged_section_is_not_silently_reconverged() {
    // Two verdicts cover the first run; a second run that re-entered the
    // loop would exhaust the script and error instead of re-judging.
    let h = harness(ScriptedJudge::new(&["ALIGNED", "ALIGNED"]), NO_IMPACTS);
    let outcome = h.engine.run_section("03", &[]).await.unwrap();
    assert!(matches!(outcome, SectionOutcome::Converged { .. }));
    assert_eq!(h.worker.calls.load(Ordering::SeqCst), 3);
    let first = h.store.load_record("03").unwrap().unwrap();

    let outcome = h.engine.run_section("03", &[]).await.unwrap();
    assert!(matches!(outcome, SectionOutcome::Converged { .. }));
    assert_eq!(
        h.worker.calls.load(Ordering::SeqCst),
        3,
        "a converged section with unchanged inputs does no new work"
    );
    let second = h.store.load_record("03").unwrap().unwrap();
    assert_eq!(second.state, SectionState::Aligned);
    assert_eq!(second.inputs_hash, first.inputs_hash);
}

#[tokio::test]
async fn underspecified_pauses_and_resume_is_durable_before_retry() {
    let h = harness(
        ScriptedJudge::new(&["UNDERSPECIFIED: which list wins", "ALIGNED", "ALIGNED"]),
        NO_IMPACTS,
    );
    let engine = Arc::clone(&h.engine);
    let run = tokio::spawn(async move { engine.run_section("03", &[]).await });

    match recv_parsed(&h.bus, "driver").await {
        ControlMessage::Pause { section, detail, .. } => {
            assert_eq!(section, "03");
            assert_eq!(detail, "which list wins");
        }
        other => panic!("expected pause, got {other:?}"),
    }
    h.bus
        .send("section-03", "resume:the second list is authoritative")
        .unwrap();

    let outcome = run.await.unwrap().unwrap();
    assert!(matches!(outcome, SectionOutcome::Converged { .. }));
    let decisions = h.store.read_decisions("03").unwrap().unwrap();
    assert!(decisions.contains("the second list is authoritative"));
}

#[tokio::test]
async fn messages_arriving_while_paused_replay_after_resume() {
    let h = harness(
        ScriptedJudge::new(&["UNDERSPECIFIED: which list wins", "ALIGNED", "ALIGNED"]),
        NO_IMPACTS,
    );
    let engine = Arc::clone(&h.engine);
    let run = tokio::spawn(async move { engine.run_section("03", &[]).await });

    match recv_parsed(&h.bus, "driver").await {
        ControlMessage::Pause { .. } => {}
        other => panic!("expected pause, got {other:?}"),
    }
    // A status query lands ahead of the resume; the pause wait must set
    // it aside and put it back once, not churn it through the queue.
    h.bus.send("section-03", "status:ping").unwrap();
    h.bus.send("section-03", "resume:the first list wins").unwrap();

    let outcome = run.await.unwrap().unwrap();
    assert!(matches!(outcome, SectionOutcome::Converged { .. }));

    let leftover = h.bus.drain("section-03").unwrap();
    let payloads: Vec<_> = leftover.iter().map(|m| m.payload.as_str()).collect();
    assert_eq!(payloads, vec!["status:ping"], "deferred message replays exactly once");
}

#[tokio::test]
async fn repeated_identical_feedback_stalls() {
    let h = harness(
        ScriptedJudge::new(&[
            "PROBLEMS: the example list is stale",
            "PROBLEMS: the  example list IS stale",
            "PROBLEMS: the example list is stale",
        ]),
        NO_IMPACTS,
    );
    let err = h.engine.run_section("03", &[]).await.unwrap_err();
    assert!(matches!(err, EngineError::Stalled { .. }));
    assert_eq!(
        h.store.load_record("03").unwrap().unwrap().state,
        SectionState::Failed
    );
    match recv_parsed(&h.bus, "driver").await {
        ControlMessage::Fail { section, .. } => assert_eq!(section, "03"),
        other => panic!("expected fail, got {other:?}"),
    }
}

#[tokio::test]
async fn material_impact_leaves_a_note_for_the_target() {
    let h = harness(
        ScriptedJudge::new(&["ALIGNED", "ALIGNED"]),
        r###"{"impacts":[{"to":"04","impact":"MATERIAL","reason":"shared hook contract","note_markdown":"## Change\nthe hook was renamed"}]}"###,
    );
    let outcome = h
        .engine
        .run_section("03", &["04".to_owned()])
        .await
        .unwrap();
    assert!(matches!(outcome, SectionOutcome::Converged { .. }));

    let notes = h.store.unacked_notes("04").unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].from, "03");
    assert!(notes[0].body.contains("the hook was renamed"));
    // The note is part of 04's inputs, so a converged 04 would now be
    // invalidated rather than silently staying aligned.
    assert!(h.store.snapshot_file("03", "docs/section.md").unwrap().is_some());
}

#[tokio::test]
async fn alignment_changed_while_paused_supersedes_the_run() {
    let h = harness(
        ScriptedJudge::new(&["UNDERSPECIFIED: cannot decide"]),
        NO_IMPACTS,
    );
    let engine = Arc::clone(&h.engine);
    let run = tokio::spawn(async move { engine.run_section("03", &[]).await });

    match recv_parsed(&h.bus, "driver").await {
        ControlMessage::Pause { .. } => {}
        other => panic!("expected pause, got {other:?}"),
    }
    h.bus.send("section-03", "alignment_changed").unwrap();

    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome, SectionOutcome::Superseded);
}
