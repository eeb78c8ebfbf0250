//! Graceful degradation tracking for CAKE subsystems.
//!
//! When a component fails, the supervisor keeps running with reduced
//! functionality instead of crashing. Each subsystem independently enters
//! and leaves degraded state; the report feeds `cake status` and the
//! escalation payload.
//!
//! | Subsystem        | Trigger                      | Behavior                        |
//! |------------------|------------------------------|---------------------------------|
//! | `RecallDb`       | Open/write failure           | In-memory map, queued writes    |
//! | `PatternEngine`  | User rule compile failure    | Rule skipped, built-ins active  |
//! | `VoiceEmbedding` | Embedding backend unavailable| Lexical similarity fallback     |
//! | `Adapter`        | Injection failures           | Failover to next adapter        |
//! | `SnapshotGit`    | git subprocess failures      | Interventions without snapshots |
//! | `StreamReader`   | Repeated read failures       | Stream marked degraded          |

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::metrics::metrics;

/// Global degradation state shared by all runtime tasks.
static GLOBAL_DEGRADATION: OnceLock<Arc<RwLock<DegradationTracker>>> = OnceLock::new();

/// Identifies a subsystem that can enter degraded mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subsystem {
    /// Recall store persistence.
    RecallDb,
    /// Pattern detection engine (user rule compile failures).
    PatternEngine,
    /// Voice gate embedding backend.
    VoiceEmbedding,
    /// Adapter injection path.
    Adapter,
    /// Snapshot git interaction.
    SnapshotGit,
    /// Supervised stream readers.
    StreamReader,
}

impl std::fmt::Display for Subsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RecallDb => write!(f, "recall_db"),
            Self::PatternEngine => write!(f, "pattern_engine"),
            Self::VoiceEmbedding => write!(f, "voice_embedding"),
            Self::Adapter => write!(f, "adapter"),
            Self::SnapshotGit => write!(f, "snapshot_git"),
            Self::StreamReader => write!(f, "stream_reader"),
        }
    }
}

/// All known subsystems, in display order.
pub const ALL_SUBSYSTEMS: [Subsystem; 6] = [
    Subsystem::RecallDb,
    Subsystem::PatternEngine,
    Subsystem::VoiceEmbedding,
    Subsystem::Adapter,
    Subsystem::SnapshotGit,
    Subsystem::StreamReader,
];

/// Degraded-state details for one subsystem.
#[derive(Debug, Clone)]
struct DegradedEntry {
    reason: String,
    since: Instant,
    since_epoch_ms: u64,
    recovery_attempts: u32,
}

/// Snapshot of a subsystem's degradation state for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradationSnapshot {
    pub subsystem: Subsystem,
    pub reason: String,
    pub since_epoch_ms: u64,
    pub duration_ms: u64,
    pub recovery_attempts: u32,
}

/// Overall operating status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Degraded,
}

impl std::fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "HEALTHY"),
            Self::Degraded => write!(f, "DEGRADED"),
        }
    }
}

/// Full degradation report for status display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradationReport {
    pub overall: OverallStatus,
    pub active: Vec<DegradationSnapshot>,
}

/// Tracks which subsystems are degraded and why.
#[derive(Debug, Default)]
pub struct DegradationTracker {
    degraded: BTreeMap<Subsystem, DegradedEntry>,
}

impl DegradationTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a subsystem degraded. Re-entering refreshes the reason but keeps
    /// the original start time and bumps recovery attempts.
    pub fn enter_degraded(&mut self, subsystem: Subsystem, reason: impl Into<String>) {
        let reason = reason.into();
        match self.degraded.get_mut(&subsystem) {
            Some(entry) => {
                entry.reason = reason;
                entry.recovery_attempts += 1;
            }
            None => {
                warn!(subsystem = %subsystem, reason = %reason, "subsystem entering degraded mode");
                metrics().set_gauge(
                    "subsystem_degraded",
                    &[("subsystem", &subsystem.to_string())],
                    1.0,
                );
                self.degraded.insert(
                    subsystem,
                    DegradedEntry {
                        reason,
                        since: Instant::now(),
                        since_epoch_ms: epoch_ms(),
                        recovery_attempts: 0,
                    },
                );
            }
        }
    }

    /// Mark a subsystem healthy again.
    pub fn recover(&mut self, subsystem: Subsystem) {
        if let Some(entry) = self.degraded.remove(&subsystem) {
            info!(
                subsystem = %subsystem,
                degraded_ms = entry.since.elapsed().as_millis() as u64,
                "subsystem recovered"
            );
            metrics().set_gauge(
                "subsystem_degraded",
                &[("subsystem", &subsystem.to_string())],
                0.0,
            );
        }
    }

    #[must_use]
    pub fn is_degraded(&self, subsystem: Subsystem) -> bool {
        self.degraded.contains_key(&subsystem)
    }

    /// Build the status report.
    #[must_use]
    pub fn report(&self) -> DegradationReport {
        let active: Vec<DegradationSnapshot> = self
            .degraded
            .iter()
            .map(|(subsystem, entry)| DegradationSnapshot {
                subsystem: *subsystem,
                reason: entry.reason.clone(),
                since_epoch_ms: entry.since_epoch_ms,
                duration_ms: entry.since.elapsed().as_millis() as u64,
                recovery_attempts: entry.recovery_attempts,
            })
            .collect();

        DegradationReport {
            overall: if active.is_empty() {
                OverallStatus::Healthy
            } else {
                OverallStatus::Degraded
            },
            active,
        }
    }
}

/// The process-wide tracker.
#[must_use]
pub fn global() -> Arc<RwLock<DegradationTracker>> {
    GLOBAL_DEGRADATION
        .get_or_init(|| Arc::new(RwLock::new(DegradationTracker::new())))
        .clone()
}

/// Convenience: mark a subsystem degraded on the global tracker.
pub fn enter_degraded(subsystem: Subsystem, reason: impl Into<String>) {
    if let Ok(mut tracker) = global().write() {
        tracker.enter_degraded(subsystem, reason);
    }
}

/// Convenience: mark a subsystem recovered on the global tracker.
pub fn recover(subsystem: Subsystem) {
    if let Ok(mut tracker) = global().write() {
        tracker.recover(subsystem);
    }
}

/// Convenience: read whether a subsystem is degraded.
#[must_use]
pub fn is_degraded(subsystem: Subsystem) -> bool {
    global()
        .read()
        .map(|tracker| tracker.is_degraded(subsystem))
        .unwrap_or(false)
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
