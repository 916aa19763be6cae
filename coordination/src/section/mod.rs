//! Per-section convergence state.
//!
//! Every section moves through an explicit state machine; transitions are
//! checked against a legality table and recorded, so a section can never
//! silently jump from converged back to converged after an edit — the only
//! way out of [`SectionState::Aligned`] is an explicit invalidation to
//! [`SectionState::Dirty`].

pub mod engine;
pub mod store;

use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;

/// Convergence state of one section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionState {
    /// Nothing produced yet.
    New,
    /// Governing-description excerpts extracted.
    Excerpted,
    /// A proposal draft exists and awaits judgment.
    Proposed,
    /// The proposal passed alignment review.
    ProposalAligned,
    /// The accepted proposal has been applied to the working tree.
    Implemented,
    /// Implementation passed alignment review; converged.
    Aligned,
    /// Work suspended awaiting an upstream decision.
    Paused,
    /// A prior convergence was invalidated; inputs changed.
    Dirty,
    /// Gave up after exhausting retries or coordination.
    Failed,
}

impl SectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SectionState::Failed)
    }

    /// Whether `from -> to` is a legal transition.
    ///
    /// Self-transitions on `Proposed` and `Implemented` model revision
    /// loops (a rejected draft replaced by the next attempt). `Paused`
    /// resumes back into the state whose step it interrupted.
    pub fn is_legal_transition(from: SectionState, to: SectionState) -> bool {
        use SectionState::*;
        matches!(
            (from, to),
            (New, Excerpted)
                | (Excerpted, Proposed)
                | (Proposed, Proposed)
                | (Proposed, ProposalAligned)
                | (ProposalAligned, Implemented)
                | (Implemented, Implemented)
                | (Implemented, Aligned)
                | (New | Excerpted | Proposed | ProposalAligned | Implemented, Paused)
                | (Paused, New | Excerpted | Proposed | ProposalAligned | Implemented)
                | (Aligned, Dirty)
                | (Dirty, Proposed | Implemented | Aligned)
                | (
                    New | Excerpted | Proposed | ProposalAligned | Implemented | Paused | Dirty,
                    Failed,
                )
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("illegal section transition: {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: SectionState,
    pub to: SectionState,
}

/// One recorded transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: SectionState,
    pub to: SectionState,
    pub iteration: u32,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Tracks one section's state with transition validation and history.
#[derive(Debug)]
pub struct SectionProgress {
    pub section: String,
    state: SectionState,
    started: Instant,
    iteration: u32,
    transitions: Vec<TransitionRecord>,
}

impl SectionProgress {
    pub fn new(section: impl Into<String>) -> Self {
        Self::starting_at(section, SectionState::New)
    }

    /// Resume tracking from a persisted state.
    pub fn starting_at(section: impl Into<String>, state: SectionState) -> Self {
        Self {
            section: section.into(),
            state,
            started: Instant::now(),
            iteration: 0,
            transitions: Vec::new(),
        }
    }

    pub fn state(&self) -> SectionState {
        self.state
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    /// Advance to `to`, recording the transition.
    pub fn advance(
        &mut self,
        to: SectionState,
        reason: Option<String>,
    ) -> Result<(), IllegalTransition> {
        if !SectionState::is_legal_transition(self.state, to) {
            return Err(IllegalTransition {
                from: self.state,
                to,
            });
        }
        self.iteration += 1;
        let record = TransitionRecord {
            from: self.state,
            to,
            iteration: self.iteration,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            reason,
        };
        debug!(
            section = %self.section,
            from = ?record.from,
            to = ?record.to,
            iteration = record.iteration,
            "section transition"
        );
        self.transitions.push(record);
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_legal() {
        let mut p = SectionProgress::new("03");
        for to in [
            SectionState::Excerpted,
            SectionState::Proposed,
            SectionState::ProposalAligned,
            SectionState::Implemented,
            SectionState::Aligned,
        ] {
            p.advance(to, None).unwrap();
        }
        assert_eq!(p.state(), SectionState::Aligned);
        assert_eq!(p.transitions().len(), 5);
    }

    #[test]
    fn aligned_only_leaves_via_dirty() {
        assert!(SectionState::is_legal_transition(
            SectionState::Aligned,
            SectionState::Dirty
        ));
        for to in [
            SectionState::New,
            SectionState::Excerpted,
            SectionState::Proposed,
            SectionState::Implemented,
            SectionState::Aligned,
            SectionState::Paused,
            SectionState::Failed,
        ] {
            assert!(
                !SectionState::is_legal_transition(SectionState::Aligned, to),
                "aligned -> {to:?} should be illegal"
            );
        }
    }

    #[test]
    fn revision_loops_are_self_transitions() {
        assert!(SectionState::is_legal_transition(
            SectionState::Proposed,
            SectionState::Proposed
        ));
        assert!(SectionState::is_legal_transition(
            SectionState::Implemented,
            SectionState::Implemented
        ));
        assert!(!SectionState::is_legal_transition(
            SectionState::New,
            SectionState::New
        ));
    }

    #[test]
    fn pause_resumes_into_interrupted_state() {
        let mut p = SectionProgress::new("05");
        p.advance(SectionState::Excerpted, None).unwrap();
        p.advance(SectionState::Proposed, None).unwrap();
        p.advance(SectionState::Paused, Some("underspecified".into()))
            .unwrap();
        p.advance(SectionState::Proposed, Some("decision received".into()))
            .unwrap();
        assert_eq!(p.state(), SectionState::Proposed);
    }

    #[test]
    fn illegal_transition_rejected_and_state_kept() {
        let mut p = SectionProgress::new("01");
        let err = p.advance(SectionState::Aligned, None).unwrap_err();
        assert_eq!(err.from, SectionState::New);
        assert_eq!(err.to, SectionState::Aligned);
        assert_eq!(p.state(), SectionState::New);
        assert!(p.transitions().is_empty());
    }

    #[test]
    fn failed_is_terminal() {
        assert!(SectionState::Failed.is_terminal());
        for to in [SectionState::New, SectionState::Proposed, SectionState::Aligned] {
            assert!(!SectionState::is_legal_transition(SectionState::Failed, to));
        }
    }
}
