use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level coordination configuration.
///
/// Every bound that governs retry or termination behavior lives here so
/// deployments can tune them without touching code. Defaults match the
/// values the system has been operated with.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Root directory for mailbox queues and agent registrations.
    pub bus_root: PathBuf,
    /// Root directory for section artifacts (excerpts, proposals, notes, ...).
    pub artifact_root: PathBuf,
    /// Mailbox receive poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Consecutive near-identical judge feedbacks before a section loop
    /// stops retrying and escalates.
    pub stall_threshold: u32,
    /// Proposal/implementation attempts before the engine asks for a
    /// stronger collaborator.
    pub escalation_attempts: u32,
    /// Hard cap on global coordination rounds.
    pub max_rounds: u32,
    /// Rounds that must complete before stall-based escalation may fire.
    pub min_rounds: u32,
    /// Consecutive non-reducing rounds that count as a coordination stall.
    pub stall_rounds: u32,
    /// Maximum concurrent fix dispatches during a coordination round.
    pub fix_concurrency: usize,
    /// Age in seconds after which a schedule lock file is considered stale.
    pub lock_stale_secs: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            bus_root: env_path("COORD_BUS_ROOT", ".coordination/bus"),
            artifact_root: env_path("COORD_ARTIFACT_ROOT", ".coordination/artifacts"),
            poll_interval_ms: env_u64("COORD_POLL_INTERVAL_MS", 500),
            stall_threshold: env_u64("COORD_STALL_THRESHOLD", 3) as u32,
            escalation_attempts: env_u64("COORD_ESCALATION_ATTEMPTS", 3) as u32,
            max_rounds: env_u64("COORD_MAX_ROUNDS", 10) as u32,
            min_rounds: env_u64("COORD_MIN_ROUNDS", 2) as u32,
            stall_rounds: env_u64("COORD_STALL_ROUNDS", 3) as u32,
            fix_concurrency: env_u64("COORD_FIX_CONCURRENCY", 4) as usize,
            lock_stale_secs: env_u64("COORD_LOCK_STALE_SECS", 300),
        }
    }
}

impl CoordinationConfig {
    /// Load from a TOML file, falling back to env/defaults for absent keys.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(default))
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_operated_values() {
        let c = CoordinationConfig::default();
        assert_eq!(c.stall_threshold, 3);
        assert_eq!(c.max_rounds, 10);
        assert_eq!(c.min_rounds, 2);
        assert_eq!(c.fix_concurrency, 4);
        assert_eq!(c.poll_interval(), Duration::from_millis(500));
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coord.toml");
        std::fs::write(&path, "max_rounds = 5\nfix_concurrency = 2\n").unwrap();
        let c = CoordinationConfig::from_file(&path).unwrap();
        assert_eq!(c.max_rounds, 5);
        assert_eq!(c.fix_concurrency, 2);
        assert_eq!(c.min_rounds, 2);
    }
}
