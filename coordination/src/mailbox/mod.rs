//! File-backed ordered mailbox with at-most-once delivery.
//!
//! Each queue is a directory of zero-padded sequence files. A send becomes
//! visible in one atomic step (hard-link of a hidden temp file onto the
//! sequence name), so readers never observe partially written payloads and
//! two writers can never publish the same sequence. A receive claims the
//! oldest pending file by renaming it to a claimer-owned name; the rename
//! either succeeds for exactly one claimer or fails with `NotFound` for
//! everyone who lost the race.
//!
//! Delivery is at-most-once: a process that crashes after claiming but
//! before processing loses that message. Callers that need stronger
//! guarantees must layer acknowledgment on top.

pub mod registry;

pub use registry::{AgentRecord, AgentRegistry, AgentStatus};

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

/// Width of the zero-padded sequence component of a message file name.
const SEQ_WIDTH: usize = 8;

/// Distinguishes concurrent staging files within one process; clones of a
/// `Mailbox` share a claim token, so the token alone is not unique per
/// in-flight send.
static STAGE_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("invalid queue name {0:?}: must be non-empty and contain no path separators")]
    InvalidQueueName(String),
    #[error("mailbox I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A message claimed from a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub queue: String,
    pub seq: u64,
    pub payload: String,
}

/// Result of a bounded receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvOutcome {
    Message(Message),
    /// The timeout elapsed with no claimable message.
    Timeout,
}

/// Handle on a mailbox root directory.
///
/// Cheap to clone per task; all state lives on disk.
#[derive(Debug, Clone)]
pub struct Mailbox {
    root: PathBuf,
    poll_interval: Duration,
    claim_token: String,
}

impl Mailbox {
    /// Open (creating if needed) a mailbox rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, poll_interval: Duration) -> Result<Self, MailboxError> {
        let root = root.into();
        let queues = root.join("queues");
        fs::create_dir_all(&queues).map_err(|source| MailboxError::Io {
            path: queues.clone(),
            source,
        })?;
        Ok(Self {
            root,
            poll_interval,
            claim_token: claim_token(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn queue_dir(&self, queue: &str) -> Result<PathBuf, MailboxError> {
        validate_name(queue)?;
        Ok(self.root.join("queues").join(queue))
    }

    /// Publish `payload` onto `queue`, returning the assigned sequence.
    ///
    /// The payload is stored newline-terminated; a missing trailing newline
    /// is added. Sequence assignment is race-free: the payload is staged in
    /// a hidden temp file, then hard-linked onto the next free sequence
    /// name. A collision means another sender took that sequence first, so
    /// we rescan and retry with a later one.
    pub fn send(&self, queue: &str, payload: &str) -> Result<u64, MailboxError> {
        let dir = self.queue_dir(queue)?;
        fs::create_dir_all(&dir).map_err(|source| MailboxError::Io {
            path: dir.clone(),
            source,
        })?;

        let stage = STAGE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let tmp = dir.join(format!(".stage-{}-{stage}", self.claim_token));
        let mut body = payload.to_owned();
        if !body.ends_with('\n') {
            body.push('\n');
        }
        fs::write(&tmp, &body).map_err(|source| MailboxError::Io {
            path: tmp.clone(),
            source,
        })?;

        let seq = loop {
            let next = self.highest_seq(&dir)? + 1;
            let dest = dir.join(seq_name(next));
            match fs::hard_link(&tmp, &dest) {
                Ok(()) => break next,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    trace!(queue, seq = next, "sequence collision, retrying");
                    continue;
                }
                Err(source) => {
                    let _ = fs::remove_file(&tmp);
                    return Err(MailboxError::Io { path: dest, source });
                }
            }
        };
        let _ = fs::remove_file(&tmp);
        debug!(queue, seq, "message published");
        Ok(seq)
    }

    /// Highest sequence ever observed in the queue, pending or claimed.
    ///
    /// Claimed files are counted so a sequence is never reused while its
    /// claimer is still processing it.
    fn highest_seq(&self, dir: &Path) -> Result<u64, MailboxError> {
        let mut max = 0;
        for entry in read_dir(dir)? {
            if let Some(seq) = parse_seq(&entry) {
                max = max.max(seq);
            }
        }
        Ok(max)
    }

    /// Claim the oldest pending message without blocking.
    ///
    /// Returns `Ok(None)` when the queue is empty or every pending message
    /// was claimed by someone else during the scan.
    pub fn try_recv(&self, queue: &str) -> Result<Option<Message>, MailboxError> {
        let dir = self.queue_dir(queue)?;
        if !dir.exists() {
            return Ok(None);
        }
        let mut pending: Vec<u64> = read_dir(&dir)?
            .iter()
            .filter_map(|name| name.parse::<u64>().ok())
            .collect();
        pending.sort_unstable();

        for seq in pending {
            let src = dir.join(seq_name(seq));
            let claimed = dir.join(format!("{}.claimed-{}", seq_name(seq), self.claim_token));
            match fs::rename(&src, &claimed) {
                Ok(()) => {
                    let payload =
                        fs::read_to_string(&claimed).map_err(|source| MailboxError::Io {
                            path: claimed.clone(),
                            source,
                        })?;
                    fs::remove_file(&claimed).map_err(|source| MailboxError::Io {
                        path: claimed.clone(),
                        source,
                    })?;
                    let payload = payload.strip_suffix('\n').unwrap_or(&payload).to_owned();
                    return Ok(Some(Message {
                        queue: queue.to_owned(),
                        seq,
                        payload,
                    }));
                }
                // Lost the claim race; the winner will process it.
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    trace!(queue, seq, "claim race lost");
                    continue;
                }
                Err(source) => return Err(MailboxError::Io { path: src, source }),
            }
        }
        Ok(None)
    }

    /// Receive the oldest message, waiting up to `timeout`.
    ///
    /// `None` waits indefinitely. Waiting is a bounded poll at the
    /// configured interval, not a spin.
    pub async fn recv(
        &self,
        queue: &str,
        timeout: Option<Duration>,
    ) -> Result<RecvOutcome, MailboxError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(msg) = self.try_recv(queue)? {
                return Ok(RecvOutcome::Message(msg));
            }
            let sleep_for = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Ok(RecvOutcome::Timeout);
                    }
                    self.poll_interval.min(d - now)
                }
                None => self.poll_interval,
            };
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// Claim every pending message in sequence order without blocking.
    pub fn drain(&self, queue: &str) -> Result<Vec<Message>, MailboxError> {
        let mut out = Vec::new();
        while let Some(msg) = self.try_recv(queue)? {
            out.push(msg);
        }
        Ok(out)
    }

    /// Number of pending (unclaimed) messages.
    pub fn check(&self, queue: &str) -> Result<usize, MailboxError> {
        let dir = self.queue_dir(queue)?;
        if !dir.exists() {
            return Ok(0);
        }
        Ok(read_dir(&dir)?
            .iter()
            .filter(|name| name.parse::<u64>().is_ok())
            .count())
    }

    /// Remove a queue and everything pending in it.
    pub fn remove_queue(&self, queue: &str) -> Result<(), MailboxError> {
        let dir = self.queue_dir(queue)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(MailboxError::Io { path: dir, source }),
        }
    }

    /// Remove every queue and registration under the root.
    pub fn cleanup_all(&self) -> Result<(), MailboxError> {
        for sub in ["queues", "agents"] {
            let dir = self.root.join(sub);
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(source) => return Err(MailboxError::Io { path: dir, source }),
            }
        }
        Ok(())
    }
}

fn seq_name(seq: u64) -> String {
    format!("{seq:08}")
}

/// Sequence of a directory entry, pending or claimed. Hidden staging files
/// parse as neither and are skipped.
fn parse_seq(name: &str) -> Option<u64> {
    let numeric = name.split('.').next()?;
    if numeric.len() != SEQ_WIDTH {
        return None;
    }
    numeric.parse().ok()
}

fn read_dir(dir: &Path) -> Result<Vec<String>, MailboxError> {
    let entries = fs::read_dir(dir).map_err(|source| MailboxError::Io {
        path: dir.to_owned(),
        source,
    })?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| MailboxError::Io {
            path: dir.to_owned(),
            source,
        })?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_owned());
        }
    }
    Ok(names)
}

fn validate_name(name: &str) -> Result<(), MailboxError> {
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(MailboxError::InvalidQueueName(name.to_owned()));
    }
    Ok(())
}

fn claim_token() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!("{}-{nanos}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn mailbox(dir: &tempfile::TempDir) -> Mailbox {
        Mailbox::open(dir.path(), Duration::from_millis(10)).unwrap()
    }

    #[test]
    fn send_assigns_monotonic_sequences() {
        let dir = tempdir().unwrap();
        let mb = mailbox(&dir);
        assert_eq!(mb.send("q", "a").unwrap(), 1);
        assert_eq!(mb.send("q", "b").unwrap(), 2);
        assert_eq!(mb.send("q", "c").unwrap(), 3);
        assert_eq!(mb.check("q").unwrap(), 3);
    }

    #[test]
    fn drain_preserves_fifo_order() {
        let dir = tempdir().unwrap();
        let mb = mailbox(&dir);
        for i in 0..5 {
            mb.send("q", &format!("msg-{i}")).unwrap();
        }
        let drained = mb.drain("q").unwrap();
        let payloads: Vec<_> = drained.iter().map(|m| m.payload.as_str()).collect();
        assert_eq!(payloads, ["msg-0", "msg-1", "msg-2", "msg-3", "msg-4"]);
        assert_eq!(mb.check("q").unwrap(), 0);
    }

    #[test]
    fn payload_round_trips_without_trailing_newline() {
        let dir = tempdir().unwrap();
        let mb = mailbox(&dir);
        mb.send("q", "done:03:summary text").unwrap();
        let msg = mb.try_recv("q").unwrap().unwrap();
        assert_eq!(msg.payload, "done:03:summary text");
    }

    #[test]
    fn sequence_not_reused_after_interleaved_recv() {
        let dir = tempdir().unwrap();
        let mb = mailbox(&dir);
        mb.send("q", "a").unwrap();
        mb.send("q", "b").unwrap();
        mb.try_recv("q").unwrap().unwrap();
        // seq 1 consumed; next send must still advance past 2
        assert_eq!(mb.send("q", "c").unwrap(), 3);
    }

    #[test]
    fn check_on_missing_queue_is_zero() {
        let dir = tempdir().unwrap();
        let mb = mailbox(&dir);
        assert_eq!(mb.check("never-used").unwrap(), 0);
        assert!(mb.try_recv("never-used").unwrap().is_none());
    }

    #[test]
    fn invalid_queue_name_rejected() {
        let dir = tempdir().unwrap();
        let mb = mailbox(&dir);
        assert!(matches!(
            mb.send("a/b", "x"),
            Err(MailboxError::InvalidQueueName(_))
        ));
        assert!(matches!(
            mb.check(""),
            Err(MailboxError::InvalidQueueName(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn recv_times_out_when_empty() {
        let dir = tempdir().unwrap();
        let mb = mailbox(&dir);
        let outcome = mb.recv("q", Some(Duration::from_millis(50))).await.unwrap();
        assert_eq!(outcome, RecvOutcome::Timeout);
    }

    #[tokio::test]
    async fn recv_returns_message_sent_after_wait_begins() {
        let dir = tempdir().unwrap();
        let mb = mailbox(&dir);
        let mb2 = mb.clone();
        let waiter = tokio::spawn(async move { mb2.recv("q", Some(Duration::from_secs(5))).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        mb.send("q", "late").unwrap();
        match waiter.await.unwrap().unwrap() {
            RecvOutcome::Message(m) => assert_eq!(m.payload, "late"),
            RecvOutcome::Timeout => panic!("expected message"),
        }
    }

    #[test]
    fn remove_queue_discards_pending() {
        let dir = tempdir().unwrap();
        let mb = mailbox(&dir);
        mb.send("q", "a").unwrap();
        mb.remove_queue("q").unwrap();
        assert_eq!(mb.check("q").unwrap(), 0);
    }
}
