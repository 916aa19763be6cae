//! Coordination substrate for autonomous section workers.
//!
//! A filesystem-backed mailbox carries ordered, at-most-once messages
//! between processes; a schedule driver serializes section work; a
//! convergence engine drives each section through propose-review-implement
//! loops with pause-out escalation; a global coordinator reconciles
//! cross-section fallout in bounded rounds.

pub mod collaborator;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod mailbox;
pub mod pipeline;
pub mod protocol;
pub mod schedule;
pub mod section;

pub use collaborator::{
    AlignmentJudge, CollaboratorFailure, ImpactClassifier, ModelTier, RelationshipChecker,
    Verdict, WorkOutput, WorkRequest, WorkStage, Worker,
};
pub use config::CoordinationConfig;
pub use coordinator::{CoordinationOutcome, GlobalCoordinator, Problem, ProblemKind};
pub use mailbox::{AgentRegistry, AgentStatus, Mailbox, Message, RecvOutcome};
pub use pipeline::{PipelineControl, PipelineMode};
pub use protocol::{ControlMessage, PauseKind};
pub use schedule::{DriverOutcome, Schedule, ScheduleDriver, ScheduleStep, StepStatus};
pub use section::engine::{ConvergenceEngine, SectionOutcome};
pub use section::store::SectionStore;
pub use section::{SectionProgress, SectionState};
