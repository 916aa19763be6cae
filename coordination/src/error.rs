//! Shared error taxonomy.
//!
//! Each subsystem defines its own `thiserror` enum next to its code; this
//! module re-exports them and maps failures to process exit codes for the
//! CLI. The split the rest of the crate relies on:
//!
//! - usage errors (bad arguments, malformed schedule lines) are fatal and
//!   map to exit 1;
//! - claim race losses inside the mailbox are expected and retried, never
//!   surfaced;
//! - collaborator failures are isolated per work item during fan-out and
//!   only fatal when a phase cannot proceed without the result;
//! - convergence stalls terminate loops with a structured escalation
//!   instead of retrying forever.

pub use crate::coordinator::CoordinationError;
pub use crate::mailbox::MailboxError;
pub use crate::schedule::ScheduleError;
pub use crate::section::engine::EngineError;

/// Exit code for CLI usage errors and missing resources.
pub const EXIT_USAGE: i32 = 1;

/// Exit code used by `recv` when the timeout elapses with no message.
pub const EXIT_TIMEOUT: i32 = 1;
