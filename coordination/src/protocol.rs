//! Typed control messages carried over the mailbox.
//!
//! The wire form is a single line, `<kind>` or `<kind>:<args>` with
//! colon-separated fields; the last field of each shape is free text and
//! may itself contain colons. The mailbox stays payload-agnostic, so
//! anything that does not parse as a known kind round-trips untouched as
//! [`ControlMessage::Other`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reason a section engine paused itself and handed control upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseKind {
    /// The governing description does not decide the question at hand.
    Underspec,
    /// A judgment call is needed that the worker must not make alone.
    NeedDecision,
    /// Blocked on another section's output.
    Dependency,
    /// The engine detected it is repeating itself.
    LoopDetected,
}

impl PauseKind {
    fn as_str(self) -> &'static str {
        match self {
            PauseKind::Underspec => "underspec",
            PauseKind::NeedDecision => "need_decision",
            PauseKind::Dependency => "dependency",
            PauseKind::LoopDetected => "loop_detected",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "underspec" => Some(PauseKind::Underspec),
            "need_decision" => Some(PauseKind::NeedDecision),
            "dependency" => Some(PauseKind::Dependency),
            "loop_detected" => Some(PauseKind::LoopDetected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMessage {
    Pause {
        kind: PauseKind,
        section: String,
        detail: String,
    },
    Resume {
        payload: String,
    },
    Done {
        section: String,
        summary: String,
    },
    Fail {
        section: String,
        error: String,
    },
    Status {
        text: String,
    },
    Summary {
        stage: String,
        section: String,
        text: String,
    },
    Escalation {
        detail: String,
    },
    Abort,
    AlignmentChanged,
    Complete,
    /// Unrecognized payload, preserved verbatim.
    Other(String),
}

impl ControlMessage {
    /// Parse a wire line. Never fails: unknown shapes become `Other`.
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches('\n');
        match line {
            "abort" => return ControlMessage::Abort,
            "alignment_changed" => return ControlMessage::AlignmentChanged,
            "complete" => return ControlMessage::Complete,
            _ => {}
        }
        let Some((kind, rest)) = line.split_once(':') else {
            return ControlMessage::Other(line.to_owned());
        };
        match kind {
            "pause" => {
                // pause:<kind>:<section>:<detail>
                let mut parts = rest.splitn(3, ':');
                let pk = parts.next().and_then(PauseKind::parse);
                match (pk, parts.next()) {
                    (Some(kind), Some(section)) => ControlMessage::Pause {
                        kind,
                        section: section.to_owned(),
                        detail: parts.next().unwrap_or_default().to_owned(),
                    },
                    _ => ControlMessage::Other(line.to_owned()),
                }
            }
            "resume" => ControlMessage::Resume {
                payload: rest.to_owned(),
            },
            "done" => match rest.split_once(':') {
                Some((section, summary)) => ControlMessage::Done {
                    section: section.to_owned(),
                    summary: summary.to_owned(),
                },
                None => ControlMessage::Other(line.to_owned()),
            },
            "fail" => match rest.split_once(':') {
                Some((section, error)) => ControlMessage::Fail {
                    section: section.to_owned(),
                    error: error.to_owned(),
                },
                None => ControlMessage::Other(line.to_owned()),
            },
            "status" => ControlMessage::Status {
                text: rest.to_owned(),
            },
            "summary" => {
                let mut parts = rest.splitn(3, ':');
                match (parts.next(), parts.next()) {
                    (Some(stage), Some(section)) => ControlMessage::Summary {
                        stage: stage.to_owned(),
                        section: section.to_owned(),
                        text: parts.next().unwrap_or_default().to_owned(),
                    },
                    _ => ControlMessage::Other(line.to_owned()),
                }
            }
            "escalation" => ControlMessage::Escalation {
                detail: rest.to_owned(),
            },
            _ => ControlMessage::Other(line.to_owned()),
        }
    }

    /// True for messages that redirect control flow rather than report it.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            ControlMessage::Abort
                | ControlMessage::AlignmentChanged
                | ControlMessage::Resume { .. }
        )
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlMessage::Pause {
                kind,
                section,
                detail,
            } => write!(f, "pause:{}:{section}:{detail}", kind.as_str()),
            ControlMessage::Resume { payload } => write!(f, "resume:{payload}"),
            ControlMessage::Done { section, summary } => write!(f, "done:{section}:{summary}"),
            ControlMessage::Fail { section, error } => write!(f, "fail:{section}:{error}"),
            ControlMessage::Status { text } => write!(f, "status:{text}"),
            ControlMessage::Summary {
                stage,
                section,
                text,
            } => write!(f, "summary:{stage}:{section}:{text}"),
            ControlMessage::Escalation { detail } => write!(f, "escalation:{detail}"),
            ControlMessage::Abort => write!(f, "abort"),
            ControlMessage::AlignmentChanged => write!(f, "alignment_changed"),
            ControlMessage::Complete => write!(f, "complete"),
            ControlMessage::Other(raw) => write!(f, "{raw}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pause_with_colons_in_detail() {
        let msg = ControlMessage::parse("pause:underspec:04:ordering of a: b: c unclear");
        assert_eq!(
            msg,
            ControlMessage::Pause {
                kind: PauseKind::Underspec,
                section: "04".into(),
                detail: "ordering of a: b: c unclear".into(),
            }
        );
    }

    #[test]
    fn bare_tokens_parse() {
        assert_eq!(ControlMessage::parse("abort"), ControlMessage::Abort);
        assert_eq!(
            ControlMessage::parse("alignment_changed"),
            ControlMessage::AlignmentChanged
        );
        assert_eq!(ControlMessage::parse("complete"), ControlMessage::Complete);
    }

    #[test]
    fn display_round_trips() {
        let cases = vec![
            ControlMessage::Done {
                section: "07".into(),
                summary: "renamed the hook API".into(),
            },
            ControlMessage::Fail {
                section: "02".into(),
                error: "coordination_exhausted: still misaligned".into(),
            },
            ControlMessage::Resume {
                payload: "use the second option".into(),
            },
            ControlMessage::Summary {
                stage: "proposal".into(),
                section: "01".into(),
                text: "split into two passes".into(),
            },
            ControlMessage::Status {
                text: "paused".into(),
            },
        ];
        for msg in cases {
            assert_eq!(ControlMessage::parse(&msg.to_string()), msg);
        }
    }

    #[test]
    fn unknown_payload_preserved() {
        let msg = ControlMessage::parse("weird payload without structure");
        assert_eq!(
            msg,
            ControlMessage::Other("weird payload without structure".into())
        );
        assert_eq!(msg.to_string(), "weird payload without structure");
    }

    #[test]
    fn malformed_known_kind_falls_back_to_other() {
        assert!(matches!(
            ControlMessage::parse("done:only-one-field"),
            ControlMessage::Other(_)
        ));
        assert!(matches!(
            ControlMessage::parse("pause:not_a_kind:04:x"),
            ControlMessage::Other(_)
        ));
    }

    #[test]
    fn control_classification() {
        assert!(ControlMessage::Abort.is_control());
        assert!(ControlMessage::AlignmentChanged.is_control());
        assert!(ControlMessage::Resume { payload: "x".into() }.is_control());
        assert!(!ControlMessage::Status { text: "ok".into() }.is_control());
    }
}
