//! Seams to the text-generating collaborators.
//!
//! The engine and coordinator never reason about content; they hand work
//! items to these traits and act on the structured part of the reply. Real
//! deployments back them with model endpoints; tests back them with
//! scripted fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
#[error("collaborator {role} failed: {message}")]
pub struct CollaboratorFailure {
    pub role: &'static str,
    pub message: String,
}

impl CollaboratorFailure {
    pub fn new(role: &'static str, message: impl Into<String>) -> Self {
        Self {
            role,
            message: message.into(),
        }
    }
}

/// Which kind of work a worker is being asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStage {
    Setup,
    Proposal,
    Implementation,
    Fix,
}

/// Model strength to route the work to. The engine escalates after
/// repeated churn on the same item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Standard,
    Escalated,
}

#[derive(Debug, Clone)]
pub struct WorkRequest {
    pub section: String,
    pub stage: WorkStage,
    pub tier: ModelTier,
    /// Accumulated context: excerpts, prior feedback, decisions, notes.
    pub context: String,
}

#[derive(Debug, Clone)]
pub struct WorkOutput {
    pub text: String,
    /// Workspace-relative paths the worker reports having modified.
    pub modified_files: Vec<String>,
}

/// Produces excerpts, proposals, implementations, and fixes.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn perform(&self, request: WorkRequest) -> Result<WorkOutput, CollaboratorFailure>;
}

/// Reviews an artifact against the governing description.
#[async_trait]
pub trait AlignmentJudge: Send + Sync {
    /// Returns the raw review report; [`Verdict::parse`] interprets it.
    async fn review(
        &self,
        section: &str,
        subject: &str,
        context: &str,
    ) -> Result<String, CollaboratorFailure>;
}

/// Classifies whether a completed section's changes affect other sections.
#[async_trait]
pub trait ImpactClassifier: Send + Sync {
    /// Returns a JSON impact report; [`parse_impacts`] interprets it.
    async fn classify(
        &self,
        section: &str,
        change_summary: &str,
        other_sections: &[String],
    ) -> Result<String, CollaboratorFailure>;
}

/// Confirms whether a group of problems shares a root cause.
#[async_trait]
pub trait RelationshipChecker: Send + Sync {
    async fn confirm_related(
        &self,
        descriptions: &[String],
    ) -> Result<bool, CollaboratorFailure>;
}

/// Parsed judge report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Aligned,
    /// Concrete problems the next revision must address.
    Problems(String),
    /// The governing description does not decide the question; escalate
    /// upstream instead of guessing.
    Underspecified(String),
}

impl Verdict {
    /// Interpret a raw review report.
    ///
    /// Aligned requires the first non-empty line to equal `ALIGNED`
    /// exactly (so a leading `MISALIGNED` never passes) and the body to
    /// carry no problem or underspecification marker. Reports with neither
    /// marker are treated as problem feedback wholesale rather than
    /// guessed at.
    pub fn parse(report: &str) -> Verdict {
        let first = report
            .lines()
            .find(|l| !l.trim().is_empty())
            .map(str::trim)
            .unwrap_or("");
        let has_problems = report.contains("PROBLEMS:");
        let has_underspec = report.contains("UNDERSPECIFIED");
        if first == "ALIGNED" && !has_problems && !has_underspec {
            return Verdict::Aligned;
        }
        if let Some(idx) = report.find("UNDERSPECIFIED:") {
            let detail = report[idx + "UNDERSPECIFIED:".len()..].trim();
            return Verdict::Underspecified(detail.to_owned());
        }
        if let Some(idx) = report.find("PROBLEMS:") {
            let problems = report[idx + "PROBLEMS:".len()..].trim();
            return Verdict::Problems(problems.to_owned());
        }
        Verdict::Problems(report.trim().to_owned())
    }
}

/// Whitespace- and case-insensitive form used to detect a judge repeating
/// itself across attempts.
pub fn normalize_feedback(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImpactKind {
    #[serde(rename = "MATERIAL")]
    Material,
    #[serde(rename = "NO_IMPACT")]
    NoImpact,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpactEntry {
    pub to: String,
    pub impact: ImpactKind,
    pub reason: String,
    /// Ready-to-write consequence note; present for material impacts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note_markdown: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpactReport {
    pub impacts: Vec<ImpactEntry>,
}

/// Parse a classifier reply, tolerating prose or code fences around the
/// JSON object.
pub fn parse_impacts(raw: &str) -> Result<ImpactReport, CollaboratorFailure> {
    let start = raw.find('{');
    let end = raw.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &raw[s..=e],
        _ => {
            return Err(CollaboratorFailure::new(
                "impact-classifier",
                "reply contains no JSON object",
            ))
        }
    };
    serde_json::from_str(json).map_err(|e| {
        CollaboratorFailure::new("impact-classifier", format!("invalid impact JSON: {e}"))
    })
}
