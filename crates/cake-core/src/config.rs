//! Configuration management for CAKE.
//!
//! Settings load from a TOML file into an immutable [`CakeConfig`] snapshot.
//! A [`ConfigHandle`] publishes snapshots over a watch channel; hot reload
//! polls the file (content hash, not mtime) and atomically swaps in a new
//! snapshot only when it validates. In-flight operations keep whatever
//! snapshot they captured.
//!
//! Strictness presets bundle severity and cooldown choices; explicit keys in
//! the file always win over the preset.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::ConfigError;
use crate::events::{ErrorKind, Severity};

/// Schema version this build understands.
pub const SUPPORTED_VERSION: &str = "1.0";

/// Default poll interval for hot reload; must stay <= 1 s.
pub const DEFAULT_RELOAD_POLL: Duration = Duration::from_millis(500);

// =============================================================================
// Config schema
// =============================================================================

/// Output format for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Severity/cooldown preset bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strictness {
    /// Intervene only on the loudest failures.
    Minimal,
    /// Sensible defaults.
    #[default]
    Balanced,
    /// Treat most failures as urgent; short cooldown.
    Paranoid,
}

impl Strictness {
    /// Severity overrides applied before explicit `[severity]` keys.
    #[must_use]
    pub fn severity_overrides(self) -> Vec<(ErrorKind, Severity)> {
        match self {
            Self::Minimal => vec![
                (ErrorKind::AttributeError, Severity::Low),
                (ErrorKind::TestFailure, Severity::Low),
                (ErrorKind::CoverageDrop, Severity::Low),
            ],
            Self::Balanced => Vec::new(),
            Self::Paranoid => vec![
                (ErrorKind::AttributeError, Severity::High),
                (ErrorKind::TestFailure, Severity::High),
                (ErrorKind::CoverageDrop, Severity::Medium),
                (ErrorKind::Unknown, Severity::Medium),
            ],
        }
    }

    /// Cooldown the preset implies when the file does not set one.
    #[must_use]
    pub fn default_cooldown_minutes(self) -> u64 {
        match self {
            Self::Minimal => 15,
            Self::Balanced => 5,
            Self::Paranoid => 1,
        }
    }
}

/// Escalation limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Max intervention retries before ESCALATING (1-10).
    pub max_strikes: u32,
    /// Per-signature suppression window in minutes (1-60).
    /// `None` defers to the strictness preset.
    pub cooldown_minutes: Option<u64>,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            max_strikes: 3,
            cooldown_minutes: None,
        }
    }
}

/// Latency budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Soft end-to-end intervention budget in ms (50-1000).
    pub max_latency_ms: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self { max_latency_ms: 300 }
    }
}

/// Recall store location and retention.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Recall store file; defaults to `<data_dir>/recall.db`.
    pub path: Option<PathBuf>,
    /// Default TTL in hours (1-168); 24 when absent.
    pub ttl_hours: Option<u64>,
}

/// Extra command-policy patterns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Extra blocked patterns (regex), evaluated before built-ins allow.
    pub blocked_commands: Vec<String>,
    /// Extra confirmation-required patterns (regex).
    pub require_confirmation: Vec<String>,
    /// Elevated-privilege invocations matching these are allowed anyway.
    pub allow_elevated: Vec<String>,
}

/// Snapshot retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// GC age cap in hours (1-720).
    pub retention_hours: u64,
    /// Aggregate size cap in GB (1-100).
    pub max_size_gb: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            retention_hours: 72,
            max_size_gb: 1,
        }
    }
}

/// Voice gate inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Reference corpus file; the built-in corpus is used when absent.
    pub corpus_path: Option<PathBuf>,
    /// Extra forbidden substrings, appended to the defaults.
    pub forbidden_substrings: Vec<String>,
    /// Similarity threshold (0.5-1.0).
    pub similarity_threshold: f64,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            corpus_path: None,
            forbidden_substrings: Vec::new(),
            similarity_threshold: 0.90,
        }
    }
}

/// Stream monitor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Bounded event queue capacity (16-65536).
    pub queue_capacity: usize,
    /// User pattern rules, appended after the built-in pack. Hot-reloadable
    /// with the rest of the config.
    pub rules: Vec<crate::patterns::UserRuleDef>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            rules: Vec::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level filter (trace, debug, info, warn, error).
    /// Can be overridden by the RUST_LOG environment variable.
    pub level: String,
    /// Output format (pretty or json).
    pub format: LogFormat,
    /// Optional path to a log file.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

/// Top-level CAKE configuration snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CakeConfig {
    /// Schema version; must be [`SUPPORTED_VERSION`].
    pub version: String,
    /// Severity/cooldown preset.
    pub strictness: Strictness,
    /// Durable state root; defaults to the platform data dir + `cake`.
    pub data_dir: Option<PathBuf>,
    pub escalation: EscalationConfig,
    pub performance: PerformanceConfig,
    pub database: DatabaseConfig,
    pub safety: SafetyConfig,
    pub snapshot: SnapshotConfig,
    pub voice: VoiceConfig,
    pub monitor: MonitorConfig,
    pub logging: LogConfig,
    /// Explicit per-kind severity overrides (win over the preset).
    pub severity: BTreeMap<String, Severity>,
}

impl Default for CakeConfig {
    fn default() -> Self {
        Self {
            version: SUPPORTED_VERSION.to_string(),
            strictness: Strictness::Balanced,
            data_dir: None,
            escalation: EscalationConfig::default(),
            performance: PerformanceConfig::default(),
            database: DatabaseConfig::default(),
            safety: SafetyConfig::default(),
            snapshot: SnapshotConfig::default(),
            voice: VoiceConfig::default(),
            monitor: MonitorConfig::default(),
            logging: LogConfig::default(),
            severity: BTreeMap::new(),
        }
    }
}

impl CakeConfig {
    /// Parse and validate a TOML payload.
    pub fn from_toml(payload: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(payload).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate from a file path.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let payload = std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.display().to_string(),
            cause: e.to_string(),
        })?;
        Self::from_toml(&payload)
    }

    /// Validate every range in the schema, collecting all violations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut violations = Vec::new();

        if self.version != SUPPORTED_VERSION {
            return Err(ConfigError::Version(self.version.clone()));
        }
        if !(1..=10).contains(&self.escalation.max_strikes) {
            violations.push(format!(
                "escalation.max_strikes must be 1-10, got {}",
                self.escalation.max_strikes
            ));
        }
        if let Some(cooldown) = self.escalation.cooldown_minutes {
            if !(1..=60).contains(&cooldown) {
                violations.push(format!(
                    "escalation.cooldown_minutes must be 1-60, got {cooldown}"
                ));
            }
        }
        if !(50..=1000).contains(&self.performance.max_latency_ms) {
            violations.push(format!(
                "performance.max_latency_ms must be 50-1000, got {}",
                self.performance.max_latency_ms
            ));
        }
        if let Some(ttl) = self.database.ttl_hours {
            if !(1..=168).contains(&ttl) {
                violations.push(format!("database.ttl_hours must be 1-168, got {ttl}"));
            }
        }
        if !(1..=720).contains(&self.snapshot.retention_hours) {
            violations.push(format!(
                "snapshot.retention_hours must be 1-720, got {}",
                self.snapshot.retention_hours
            ));
        }
        if !(1..=100).contains(&self.snapshot.max_size_gb) {
            violations.push(format!(
                "snapshot.max_size_gb must be 1-100, got {}",
                self.snapshot.max_size_gb
            ));
        }
        if !(0.5..=1.0).contains(&self.voice.similarity_threshold) {
            violations.push(format!(
                "voice.similarity_threshold must be 0.5-1.0, got {}",
                self.voice.similarity_threshold
            ));
        }
        if !(16..=65_536).contains(&self.monitor.queue_capacity) {
            violations.push(format!(
                "monitor.queue_capacity must be 16-65536, got {}",
                self.monitor.queue_capacity
            ));
        }
        for key in self.severity.keys() {
            if !ErrorKind::ALL.iter().any(|k| k.tag() == key) {
                violations.push(format!("severity.{key} is not a known error kind"));
            }
        }
        for rule in &self.monitor.rules {
            if !ErrorKind::ALL.iter().any(|k| k.tag() == rule.kind) {
                violations.push(format!(
                    "monitor.rules[{}].kind {} is not a known error kind",
                    rule.id, rule.kind
                ));
            }
            if !(0.0..=1.0).contains(&rule.confidence) {
                violations.push(format!(
                    "monitor.rules[{}].confidence must be 0.0-1.0, got {}",
                    rule.id, rule.confidence
                ));
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { violations })
        }
    }

    /// Root for durable state (recall db, audit log, snapshots).
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("cake")
        })
    }

    /// Recall store file location.
    #[must_use]
    pub fn recall_db_path(&self) -> PathBuf {
        self.database
            .path
            .clone()
            .unwrap_or_else(|| self.data_dir().join("recall.db"))
    }

    /// Append-only audit log location.
    #[must_use]
    pub fn audit_log_path(&self) -> PathBuf {
        self.data_dir().join("audit.log")
    }

    /// Snapshot directory root.
    #[must_use]
    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir().join("snapshots")
    }

    /// TTL for recall records, after defaults.
    #[must_use]
    pub fn recall_ttl(&self) -> Duration {
        Duration::from_secs(self.database.ttl_hours.unwrap_or(24) * 3600)
    }

    /// Cooldown window, preset-aware.
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        let minutes = self
            .escalation
            .cooldown_minutes
            .unwrap_or_else(|| self.strictness.default_cooldown_minutes());
        Duration::from_secs(minutes * 60)
    }

    /// Effective severity table: built-in defaults, then preset, then
    /// explicit `[severity]` keys.
    #[must_use]
    pub fn severity_table(&self) -> BTreeMap<ErrorKind, Severity> {
        let mut table: BTreeMap<ErrorKind, Severity> = BTreeMap::from([
            (ErrorKind::ImportMissing, Severity::High),
            (ErrorKind::SyntaxError, Severity::High),
            (ErrorKind::AttributeError, Severity::Medium),
            (ErrorKind::TestFailure, Severity::Medium),
            (ErrorKind::CoverageDrop, Severity::Low),
            (ErrorKind::Unknown, Severity::Low),
        ]);
        for (kind, severity) in self.strictness.severity_overrides() {
            table.insert(kind, severity);
        }
        for (key, severity) in &self.severity {
            if let Some(kind) = ErrorKind::ALL.iter().find(|k| k.tag() == key) {
                table.insert(*kind, *severity);
            }
        }
        table
    }
}

// =============================================================================
// Hot reload
// =============================================================================

/// Shared handle over the current config snapshot.
///
/// `current()` is a cheap Arc clone; callers hold the snapshot they captured
/// for the whole operation so a concurrent reload never changes semantics
/// mid-flight.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    tx: watch::Sender<Arc<CakeConfig>>,
}

impl ConfigHandle {
    #[must_use]
    pub fn new(config: CakeConfig) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(config));
        Self { tx }
    }

    /// The current snapshot.
    #[must_use]
    pub fn current(&self) -> Arc<CakeConfig> {
        self.tx.borrow().clone()
    }

    /// Subscribe for change notifications.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<CakeConfig>> {
        self.tx.subscribe()
    }

    /// Install a new validated snapshot.
    pub fn install(&self, config: CakeConfig) {
        self.tx.send_replace(Arc::new(config));
    }

    /// Poll `path` until shutdown, swapping in new snapshots when the file
    /// content changes and validates. Invalid payloads leave the running
    /// snapshot untouched.
    pub async fn run_poller(
        &self,
        path: PathBuf,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut last_hash = std::fs::read(&path).ok().map(|bytes| content_hash(&bytes));
        let mut ticker = tokio::time::interval(interval.min(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Ok(bytes) = std::fs::read(&path) else {
                        continue;
                    };
                    let hash = content_hash(&bytes);
                    if last_hash.as_deref() == Some(hash.as_str()) {
                        continue;
                    }
                    last_hash = Some(hash);

                    match String::from_utf8(bytes)
                        .map_err(|e| ConfigError::Parse(e.to_string()))
                        .and_then(|payload| CakeConfig::from_toml(&payload))
                    {
                        Ok(config) => {
                            info!(path = %path.display(), "config reloaded");
                            self.install(config);
                        }
                        Err(e) => {
                            crate::metrics::metrics().inc_counter("config_reload_rejected_total", &[]);
                            error!(path = %path.display(), error = %e, "config reload rejected; keeping previous snapshot");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        warn!("config poller stopped");
    }
}

fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Parsing and validation
    // ========================================================================

    #[test]
    fn default_config_validates() {
        CakeConfig::default().validate().unwrap();
    }

    #[test]
    fn minimal_toml_parses() {
        let config = CakeConfig::from_toml(r#"version = "1.0""#).unwrap();
        assert_eq!(config.strictness, Strictness::Balanced);
        assert_eq!(config.escalation.max_strikes, 3);
    }

    #[test]
    fn unknown_version_rejected() {
        let err = CakeConfig::from_toml(r#"version = "2.0""#).unwrap_err();
        assert!(matches!(err, ConfigError::Version(_)));
    }

    #[test]
    fn out_of_range_values_all_reported() {
        let toml = r#"
            version = "1.0"
            [escalation]
            max_strikes = 50
            cooldown_minutes = 0
            [performance]
            max_latency_ms = 5
        "#;
        let err = CakeConfig::from_toml(toml).unwrap_err();
        let ConfigError::Invalid { violations } = err else {
            panic!("expected Invalid, got {err}");
        };
        assert_eq!(violations.len(), 3);
    }

    #[test]
    fn unknown_severity_key_rejected() {
        let toml = r#"
            version = "1.0"
            [severity]
            made_up_kind = "high"
        "#;
        assert!(CakeConfig::from_toml(toml).is_err());
    }

    #[test]
    fn full_schema_round_trips() {
        let toml = r#"
            version = "1.0"
            strictness = "paranoid"
            data_dir = "/tmp/cake-test"

            [escalation]
            max_strikes = 5
            cooldown_minutes = 2

            [database]
            ttl_hours = 48

            [safety]
            blocked_commands = ["^curl .*\\| *sh$"]
            require_confirmation = ["^pip install"]

            [voice]
            forbidden_substrings = ["unfortunately"]

            [severity]
            coverage_drop = "high"
        "#;
        let config = CakeConfig::from_toml(toml).unwrap();
        assert_eq!(config.strictness, Strictness::Paranoid);
        assert_eq!(config.database.ttl_hours, Some(48));
        assert_eq!(config.safety.blocked_commands.len(), 1);
        assert_eq!(
            config.severity_table()[&ErrorKind::CoverageDrop],
            Severity::High
        );
    }

    // ========================================================================
    // Presets and derived values
    // ========================================================================

    #[test]
    fn paranoid_raises_test_failures() {
        let config = CakeConfig {
            strictness: Strictness::Paranoid,
            ..CakeConfig::default()
        };
        assert_eq!(
            config.severity_table()[&ErrorKind::TestFailure],
            Severity::High
        );
        assert_eq!(config.cooldown(), Duration::from_secs(60));
    }

    #[test]
    fn explicit_severity_beats_preset() {
        let mut config = CakeConfig {
            strictness: Strictness::Paranoid,
            ..CakeConfig::default()
        };
        config
            .severity
            .insert("test_failure".to_string(), Severity::Low);
        assert_eq!(
            config.severity_table()[&ErrorKind::TestFailure],
            Severity::Low
        );
    }

    #[test]
    fn explicit_cooldown_beats_preset() {
        let config = CakeConfig {
            strictness: Strictness::Paranoid,
            escalation: EscalationConfig {
                cooldown_minutes: Some(30),
                ..EscalationConfig::default()
            },
            ..CakeConfig::default()
        };
        assert_eq!(config.cooldown(), Duration::from_secs(1800));
    }

    #[test]
    fn data_dir_drives_artifact_paths() {
        let config = CakeConfig {
            data_dir: Some(PathBuf::from("/var/lib/cake")),
            ..CakeConfig::default()
        };
        assert_eq!(config.recall_db_path(), PathBuf::from("/var/lib/cake/recall.db"));
        assert_eq!(config.audit_log_path(), PathBuf::from("/var/lib/cake/audit.log"));
        assert_eq!(config.snapshot_dir(), PathBuf::from("/var/lib/cake/snapshots"));
    }

    #[test]
    fn database_path_overrides_data_dir() {
        let config = CakeConfig {
            data_dir: Some(PathBuf::from("/var/lib/cake")),
            database: DatabaseConfig {
                path: Some(PathBuf::from("/mnt/fast/recall.db")),
                ttl_hours: None,
            },
            ..CakeConfig::default()
        };
        assert_eq!(config.recall_db_path(), PathBuf::from("/mnt/fast/recall.db"));
    }

    // ========================================================================
    // Handle semantics
    // ========================================================================

    #[test]
    fn install_swaps_snapshot_atomically() {
        let handle = ConfigHandle::new(CakeConfig::default());
        let before = handle.current();

        let mut next = CakeConfig::default();
        next.escalation.max_strikes = 7;
        handle.install(next);

        // The captured snapshot is unchanged; the handle serves the new one.
        assert_eq!(before.escalation.max_strikes, 3);
        assert_eq!(handle.current().escalation.max_strikes, 7);
    }

    #[tokio::test]
    async fn subscribers_see_new_snapshot() {
        let handle = ConfigHandle::new(CakeConfig::default());
        let mut rx = handle.subscribe();

        let mut next = CakeConfig::default();
        next.strictness = Strictness::Paranoid;
        handle.install(next);

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().strictness, Strictness::Paranoid);
    }
}
