//! Controller — the supervision state machine.
//!
//! States: MONITORING, DETECTING, INTERVENING, RECOVERING, ESCALATING.
//!
//! ```text
//! MONITORING ──event(severity > low)──► DETECTING ──should_intervene──► INTERVENING
//!     ▲                                     │                              │
//!     │◄──────────── log only ──────────────┘        adapter ack ──────────┤
//!     │                                                                    ▼
//!     │◄── external resume ── ESCALATING ◄── strike >= max ── RECOVERING ◄─┘
//!                                                                  │ (same signature recurs)
//!                                                                  └── strike < max ──► INTERVENING
//! ```
//!
//! The happy-path cycle is strictly sequential: detect → classify → recall
//! update → snapshot (optional) → template render → voice gate → adapter
//! inject → outcome update. The recall write always commits before the
//! intervention is emitted, and every transition is logged with before and
//! after states.
//!
//! Success is detected passively: a 10-minute follow-up window per
//! signature; if the signature does not recur before the deadline the
//! intervention counts as a success.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::adapter::{AdapterRegistry, InjectContext};
use crate::classifier::Classifier;
use crate::config::ConfigHandle;
use crate::error::Result;
use crate::events::{ErrorEvent, Severity};
use crate::interceptor::SupervisionMode;
use crate::metrics::metrics;
use crate::operator::{InterventionContext, OperatorEngine, strike_level};
use crate::recall::{RecallStore, SIMILAR_THRESHOLD};
use crate::signature::{Signature, normalize_message, signature_of};
use crate::snapshots::SnapshotManager;

/// Follow-up window after an intervention; no recurrence inside it counts
/// as success.
pub const FOLLOWUP_WINDOW: Duration = Duration::from_secs(600);

/// Per-state processing timeout; exceeding it forces ESCALATING.
pub const STATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Strike level at which a linked snapshot is restored before retrying.
const RESTORE_STRIKE_LEVEL: u32 = 3;

// =============================================================================
// States
// =============================================================================

/// The machine is in exactly one of these at any moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Monitoring,
    Detecting,
    Intervening,
    Recovering,
    Escalating,
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Monitoring => write!(f, "monitoring"),
            Self::Detecting => write!(f, "detecting"),
            Self::Intervening => write!(f, "intervening"),
            Self::Recovering => write!(f, "recovering"),
            Self::Escalating => write!(f, "escalating"),
        }
    }
}

/// Escalation payload; carries enough context to resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationNotice {
    pub state: ControllerState,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_intervention: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recall_summary: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct StrikeState {
    /// Interventions issued for this signature since the last reset.
    attempts: u32,
}

#[derive(Debug, Clone)]
struct Followup {
    signature: Signature,
    kind_tag: &'static str,
    deadline: DateTime<Utc>,
}

// =============================================================================
// Controller
// =============================================================================

/// Composes monitor output, classifier, recall store, operator engine,
/// snapshots, and adapters into the supervision loop.
pub struct Controller {
    config: ConfigHandle,
    recall: Arc<RecallStore>,
    operator: OperatorEngine,
    adapters: Arc<AdapterRegistry>,
    snapshots: Option<Arc<SnapshotManager>>,
    escalations: Option<mpsc::Sender<EscalationNotice>>,
    state: ControllerState,
    strikes: HashMap<Signature, StrikeState>,
    followups: Vec<Followup>,
}

impl Controller {
    #[must_use]
    pub fn new(
        config: ConfigHandle,
        recall: Arc<RecallStore>,
        operator: OperatorEngine,
        adapters: Arc<AdapterRegistry>,
        snapshots: Option<Arc<SnapshotManager>>,
        escalations: Option<mpsc::Sender<EscalationNotice>>,
    ) -> Self {
        Self {
            config,
            recall,
            operator,
            adapters,
            snapshots,
            escalations,
            state: ControllerState::Monitoring,
            strikes: HashMap::new(),
            followups: Vec::new(),
        }
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Policy state the command interceptor consults.
    #[must_use]
    pub fn supervision_mode(&self) -> SupervisionMode {
        match self.state {
            ControllerState::Recovering | ControllerState::Escalating => SupervisionMode::Strict,
            _ => SupervisionMode::Normal,
        }
    }

    /// External resume signal: leaves ESCALATING and resets strikes.
    pub fn resume(&mut self) {
        if self.state == ControllerState::Escalating {
            self.transition(ControllerState::Monitoring, "external resume");
            self.strikes.clear();
        }
    }

    /// Process one event through the full cycle.
    ///
    /// The whole cycle runs under the per-state timeout; exceeding it
    /// forces ESCALATING.
    pub async fn handle_event(&mut self, event: ErrorEvent) -> Result<()> {
        let started = std::time::Instant::now();
        let outcome = tokio::time::timeout(STATE_TIMEOUT, self.process(event)).await;
        metrics().observe(
            "response_latency_seconds",
            &[("component", "controller"), ("operation", "cycle")],
            started.elapsed().as_secs_f64(),
        );
        let soft_budget =
            Duration::from_millis(self.config.current().performance.max_latency_ms);
        if started.elapsed() > soft_budget {
            metrics().inc_counter("cycle_budget_exceeded_total", &[]);
            warn!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                budget_ms = soft_budget.as_millis() as u64,
                "intervention cycle exceeded soft latency budget"
            );
        }
        match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_s = STATE_TIMEOUT.as_secs(), "controller cycle timed out");
                self.escalate("state timeout", None, None, None).await;
                Ok(())
            }
        }
    }

    async fn process(&mut self, event: ErrorEvent) -> Result<()> {
        let config = self.config.current();
        let classifier = Classifier::from_config(&config);

        // A recurrence inside a follow-up window means the prior
        // intervention did not take.
        let signature = signature_of(&event);
        let recurred = self.take_followup(&signature);
        if recurred {
            self.recall.mark_outcome(&signature, false).await?;
        }

        if self.state == ControllerState::Escalating {
            // Frozen until the external resume; keep the memory current.
            if event.severity_hint > Severity::Low {
                let normalized = normalize_message(&event.raw);
                self.recall.record(&signature, event.kind, &normalized).await?;
            }
            debug!(signature = signature.short(), "event observed while escalating; recorded only");
            return Ok(());
        }

        let classification = classifier.classify(&event);
        if classification.severity == Severity::Low {
            debug!(
                kind = %event.kind,
                severity = %classification.severity,
                "low severity; staying in monitoring"
            );
            return Ok(());
        }

        self.transition(ControllerState::Detecting, "error event");

        // Cooldown suppression happens before the occurrence is counted so
        // the repeat is still remembered.
        let normalized = normalize_message(&event.raw);
        let prior = self.recall.lookup(&signature).await?;

        // No exact history: a near-identical sibling may still exist, and
        // its last message feeds repeat-avoidance in the template engine.
        let sibling = if prior.is_none() {
            let siblings = self
                .recall
                .similar(&normalized, SIMILAR_THRESHOLD)
                .await
                .unwrap_or_default();
            if let Some(first) = siblings.first() {
                debug!(
                    signature = signature.short(),
                    sibling = first.signature.short(),
                    "no exact recall history; similar signature found"
                );
            }
            siblings.into_iter().next()
        } else {
            None
        };

        let suppressed = classifier.cooldown_active(
            classification.severity,
            prior.as_ref().and_then(|r| r.last_intervention_at),
            Utc::now(),
        );

        let record = self
            .recall
            .record(&signature, event.kind, &normalized)
            .await?;

        if suppressed {
            info!(
                signature = signature.short(),
                "intervention suppressed by cooldown"
            );
            self.transition(ControllerState::Monitoring, "cooldown suppression");
            return Ok(());
        }

        if !classifier.should_intervene(&classification, record.occurrence_count) {
            debug!(
                signature = signature.short(),
                occurrences = record.occurrence_count,
                "no intervention required"
            );
            self.transition(ControllerState::Monitoring, "log only");
            return Ok(());
        }

        let strike = strike_level(record.occurrence_count);
        let max_strikes = config.escalation.max_strikes;
        let attempts = self
            .strikes
            .get(&signature)
            .map_or(0, |s| s.attempts);

        if recurred {
            self.transition(ControllerState::Recovering, "signature recurred in window");
            if attempts >= max_strikes {
                let summary = format!(
                    "{} occurrences, {} interventions, {} successes",
                    record.occurrence_count, record.intervention_count, record.success_count
                );
                self.escalate(
                    "strike limit reached",
                    Some(&signature),
                    record.last_intervention_text.clone(),
                    Some(summary),
                )
                .await;
                return Ok(());
            }
            self.maybe_restore(&signature, strike).await;
        }

        self.transition(ControllerState::Intervening, "intervention required");

        // Snapshot on entry to INTERVENING once a signature is repeating.
        if strike >= 2 {
            self.maybe_snapshot(&signature).await;
        }

        let context = InterventionContext {
            kind: event.kind,
            path: event.path.clone(),
            line: event.line,
            raw_message: event.raw.clone(),
            strike,
            prior_interventions: sibling
                .as_ref()
                .and_then(|s| s.last_intervention_text.clone())
                .into_iter()
                .chain(record.last_intervention_text.clone())
                .collect(),
            remediation: classification.remediation.clone(),
            timestamp: event.timestamp,
            captures: extract_captures(&event),
        };
        let intervention = self.operator.build(&context);

        let inject_context = InjectContext {
            signature: Some(signature.as_hex().to_string()),
            kind: Some(event.kind.tag().to_string()),
            strike,
            template_id: intervention.template_id.clone(),
        };

        match self.adapters.inject(&intervention.text, &inject_context).await {
            Ok(()) => {
                // Adapter ack: record the intervention and arm the
                // follow-up window.
                self.recall
                    .mark_intervention(&signature, &intervention.text)
                    .await?;
                self.strikes
                    .entry(signature.clone())
                    .and_modify(|s| s.attempts += 1)
                    .or_insert(StrikeState { attempts: 1 });
                self.followups.push(Followup {
                    signature: signature.clone(),
                    kind_tag: event.kind.tag(),
                    deadline: Utc::now()
                        + chrono::Duration::from_std(FOLLOWUP_WINDOW)
                            .unwrap_or_else(|_| chrono::Duration::minutes(10)),
                });
                metrics().inc_counter(
                    "interventions_total",
                    &[
                        ("kind", event.kind.tag()),
                        ("severity", &classification.severity.to_string()),
                    ],
                );
                info!(
                    signature = signature.short(),
                    template_id = %intervention.template_id,
                    strike,
                    "intervention emitted"
                );
                self.transition(ControllerState::Monitoring, "adapter ack");
            }
            Err(e) => {
                error!(error = %e, "all adapters failed to inject");
                self.escalate(
                    "adapter injection failed",
                    Some(&signature),
                    Some(intervention.text),
                    None,
                )
                .await;
            }
        }
        Ok(())
    }

    /// Resolve follow-up windows: every expired window without recurrence
    /// counts as a success. Returns how many were resolved.
    pub async fn poll_followups(&mut self) -> Result<usize> {
        let now = Utc::now();
        let mut resolved = 0usize;
        let mut remaining = Vec::with_capacity(self.followups.len());
        for followup in std::mem::take(&mut self.followups) {
            if followup.deadline > now {
                remaining.push(followup);
                continue;
            }
            self.recall.mark_outcome(&followup.signature, true).await?;
            self.strikes.remove(&followup.signature);
            metrics().inc_counter("errors_prevented_total", &[("kind", followup.kind_tag)]);
            metrics().inc_counter(
                "interventions_total",
                &[("kind", followup.kind_tag), ("outcome", "success")],
            );
            info!(
                signature = followup.signature.short(),
                "no recurrence in follow-up window; intervention succeeded"
            );
            resolved += 1;
        }
        self.followups = remaining;
        Ok(resolved)
    }

    /// Signatures with live follow-up windows (pins for snapshot GC).
    #[must_use]
    pub fn open_signatures(&self) -> Vec<String> {
        self.followups
            .iter()
            .map(|f| f.signature.as_hex().to_string())
            .collect()
    }

    // ========================================================================
    // Internal
    // ========================================================================

    fn transition(&mut self, to: ControllerState, reason: &str) {
        if self.state == to {
            return;
        }
        info!(from = %self.state, to = %to, reason, "controller transition");
        metrics().inc_counter(
            "controller_transitions_total",
            &[("to", &to.to_string())],
        );
        self.state = to;
    }

    fn take_followup(&mut self, signature: &Signature) -> bool {
        let before = self.followups.len();
        self.followups.retain(|f| f.signature != *signature);
        before != self.followups.len()
    }

    async fn maybe_snapshot(&self, signature: &Signature) {
        let Some(snapshots) = &self.snapshots else {
            return;
        };
        match snapshots
            .create("pre-intervention", Some(signature.as_hex().to_string()))
            .await
        {
            Ok(snapshot) => {
                debug!(id = %snapshot.id, signature = signature.short(), "snapshot created before intervention");
            }
            Err(e) => {
                // Snapshots are best-effort; the intervention proceeds.
                warn!(error = %e, "snapshot before intervention failed");
                crate::degradation::enter_degraded(
                    crate::degradation::Subsystem::SnapshotGit,
                    e.to_string(),
                );
            }
        }
    }

    async fn maybe_restore(&self, signature: &Signature, strike: u32) {
        if strike < RESTORE_STRIKE_LEVEL {
            return;
        }
        let Some(snapshots) = &self.snapshots else {
            return;
        };
        let Ok(list) = snapshots.list().await else {
            return;
        };
        let linked = list
            .into_iter()
            .rev()
            .find(|s| s.signature.as_deref() == Some(signature.as_hex()));
        if let Some(snapshot) = linked {
            match snapshots.restore(snapshot.id).await {
                Ok(()) => info!(id = %snapshot.id, "restored snapshot before retry"),
                Err(e) => warn!(error = %e, "snapshot restore failed; retrying without rollback"),
            }
        }
    }

    async fn escalate(
        &mut self,
        reason: &str,
        signature: Option<&Signature>,
        last_intervention: Option<String>,
        recall_summary: Option<String>,
    ) {
        let from = self.state;
        self.transition(ControllerState::Escalating, reason);
        let notice = EscalationNotice {
            state: from,
            reason: reason.to_string(),
            signature: signature.map(|s| s.as_hex().to_string()),
            last_intervention,
            recall_summary,
            at: Utc::now(),
        };
        metrics().inc_counter("escalations_total", &[]);
        self.adapters.dispatch_error(&notice.reason);
        if let Some(tx) = &self.escalations {
            if tx.try_send(notice).is_err() {
                warn!("escalation channel full or closed; notice dropped");
            }
        }
    }
}

/// Pull the named captures the operator templates use back out of the raw
/// event text.
fn extract_captures(event: &ErrorEvent) -> HashMap<String, String> {
    let engine = crate::patterns::PatternEngine::new();
    engine
        .scan(&event.raw)
        .map(|m| m.captures)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::NullAdapter;
    use crate::config::{CakeConfig, VoiceConfig};
    use crate::events::{ErrorKind, StreamSource};
    use crate::voice::VoiceGate;

    struct Fixture {
        _dir: tempfile::TempDir,
        controller: Controller,
        adapter: Arc<NullAdapter>,
        escalations: mpsc::Receiver<EscalationNotice>,
    }

    async fn fixture(config: CakeConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let recall = Arc::new(
            RecallStore::open(dir.path().join("recall.db"), Duration::from_secs(24 * 3600))
                .await
                .unwrap(),
        );
        let adapter = Arc::new(NullAdapter::new());
        let mut registry = AdapterRegistry::new();
        registry.register(adapter.clone());
        let (tx, rx) = mpsc::channel(16);
        let controller = Controller::new(
            ConfigHandle::new(config),
            recall,
            OperatorEngine::new(VoiceGate::from_config(&VoiceConfig::default()).unwrap()),
            Arc::new(registry),
            None,
            Some(tx),
        );
        Fixture {
            _dir: dir,
            controller,
            adapter,
            escalations: rx,
        }
    }

    fn import_event(seq: u64) -> ErrorEvent {
        ErrorEvent::new(
            ErrorKind::ImportMissing,
            StreamSource::Stderr,
            "ImportError: No module named 'requests'",
            seq,
        )
        .with_location(Some("/workspace/main.py".to_string()), Some(10))
        .with_severity_hint(Severity::High)
    }

    fn test_failure_event(seq: u64) -> ErrorEvent {
        ErrorEvent::new(
            ErrorKind::TestFailure,
            StreamSource::Stdout,
            "FAILED tests/test_x.py::test_y",
            seq,
        )
        .with_severity_hint(Severity::Medium)
    }

    // ========================================================================
    // Scenario A: first occurrence of a missing import
    // ========================================================================

    #[tokio::test]
    async fn first_import_error_intervenes() {
        let mut f = fixture(CakeConfig::default()).await;
        f.controller.handle_event(import_event(0)).await.unwrap();

        let injected = f.adapter.injected();
        assert_eq!(injected.len(), 1);
        assert!(injected[0].starts_with("Operator (CAKE): Stop."));
        assert!(injected[0].contains("'requests'"));

        // Recall write committed before emit: record carries both counts.
        let sig = signature_of(&import_event(0));
        let record = f.controller.recall.lookup(&sig).await.unwrap().unwrap();
        assert_eq!(record.occurrence_count, 1);
        assert_eq!(record.intervention_count, 1);
        assert_eq!(f.controller.state(), ControllerState::Monitoring);
    }

    // ========================================================================
    // Scenario D: test failure needs recurrence
    // ========================================================================

    #[tokio::test]
    async fn medium_severity_waits_for_third_occurrence() {
        let mut config = CakeConfig::default();
        // Disable cooldown interference for the recurrence sequence.
        config.escalation.cooldown_minutes = Some(1);
        let mut f = fixture(config).await;

        f.controller.handle_event(test_failure_event(0)).await.unwrap();
        f.controller.handle_event(test_failure_event(1)).await.unwrap();
        assert!(f.adapter.injected().is_empty());

        f.controller.handle_event(test_failure_event(2)).await.unwrap();
        assert_eq!(f.adapter.injected().len(), 1);

        let sig = signature_of(&test_failure_event(0));
        let record = f.controller.recall.lookup(&sig).await.unwrap().unwrap();
        assert_eq!(record.occurrence_count, 3);
        assert_eq!(record.intervention_count, 1);
    }

    // ========================================================================
    // Cooldown
    // ========================================================================

    #[tokio::test]
    async fn cooldown_suppresses_repeat_but_counts_it() {
        let mut f = fixture(CakeConfig::default()).await;
        f.controller.handle_event(import_event(0)).await.unwrap();
        // Second occurrence lands inside the cooldown window: no second
        // message, but the occurrence is remembered.
        f.controller.handle_event(import_event(1)).await.unwrap();

        assert_eq!(f.adapter.injected().len(), 1);
        let sig = signature_of(&import_event(0));
        let record = f.controller.recall.lookup(&sig).await.unwrap().unwrap();
        assert_eq!(record.occurrence_count, 2);
        assert_eq!(record.intervention_count, 1);
        assert_eq!(f.controller.state(), ControllerState::Monitoring);
    }

    // ========================================================================
    // Low severity stays in monitoring
    // ========================================================================

    #[tokio::test]
    async fn low_severity_is_log_only() {
        let mut f = fixture(CakeConfig::default()).await;
        let event = ErrorEvent::new(
            ErrorKind::CoverageDrop,
            StreamSource::Stdout,
            "FAIL Required test coverage of 90% not reached. Total coverage: 84%",
            0,
        );
        f.controller.handle_event(event).await.unwrap();
        assert!(f.adapter.injected().is_empty());
        assert_eq!(f.controller.state(), ControllerState::Monitoring);
    }

    // ========================================================================
    // Escalation after strikes exhaust
    // ========================================================================

    #[tokio::test]
    async fn strike_limit_escalates_with_context() {
        let mut config = CakeConfig::default();
        config.escalation.max_strikes = 1;
        // Critical severity bypasses the cooldown, so the recurrence path
        // is exercised directly.
        config
            .severity
            .insert("import_missing".to_string(), Severity::Critical);
        let mut f = fixture(config).await;

        // First intervention arms the follow-up window.
        f.controller.handle_event(import_event(0)).await.unwrap();
        assert_eq!(f.adapter.injected().len(), 1);

        // Same signature recurs inside the window with attempts >= max.
        f.controller.handle_event(import_event(1)).await.unwrap();

        assert_eq!(f.controller.state(), ControllerState::Escalating);
        let notice = f.escalations.try_recv().unwrap();
        assert_eq!(notice.reason, "strike limit reached");
        assert!(notice.signature.is_some());
        assert!(notice.recall_summary.unwrap().contains("occurrences"));

        // Frozen until resume: further events are recorded, not acted on.
        f.controller.handle_event(import_event(2)).await.unwrap();
        assert_eq!(f.adapter.injected().len(), 1);

        f.controller.resume();
        assert_eq!(f.controller.state(), ControllerState::Monitoring);
    }

    // ========================================================================
    // Followup success path
    // ========================================================================

    #[tokio::test]
    async fn expired_followup_marks_success() {
        let mut f = fixture(CakeConfig::default()).await;
        f.controller.handle_event(import_event(0)).await.unwrap();

        // Force the single follow-up deadline into the past.
        for followup in &mut f.controller.followups {
            followup.deadline = Utc::now() - chrono::Duration::seconds(1);
        }
        let resolved = f.controller.poll_followups().await.unwrap();
        assert_eq!(resolved, 1);

        let sig = signature_of(&import_event(0));
        let record = f.controller.recall.lookup(&sig).await.unwrap().unwrap();
        assert_eq!(record.success_count, 1);
        assert!(f.controller.followups.is_empty());
        assert!(f.controller.strikes.is_empty());
    }

    #[tokio::test]
    async fn unexpired_followup_left_alone() {
        let mut f = fixture(CakeConfig::default()).await;
        f.controller.handle_event(import_event(0)).await.unwrap();
        let resolved = f.controller.poll_followups().await.unwrap();
        assert_eq!(resolved, 0);
        assert_eq!(f.controller.open_signatures().len(), 1);
    }

    // ========================================================================
    // Adapter failure escalates
    // ========================================================================

    #[tokio::test]
    async fn adapter_failure_escalates() {
        let dir = tempfile::tempdir().unwrap();
        let recall = Arc::new(
            RecallStore::open(dir.path().join("recall.db"), Duration::from_secs(3600))
                .await
                .unwrap(),
        );
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(NullAdapter::failing()));
        let (tx, mut rx) = mpsc::channel(4);
        let mut controller = Controller::new(
            ConfigHandle::new(CakeConfig::default()),
            recall,
            OperatorEngine::new(VoiceGate::from_config(&VoiceConfig::default()).unwrap()),
            Arc::new(registry),
            None,
            Some(tx),
        );

        controller.handle_event(import_event(0)).await.unwrap();
        assert_eq!(controller.state(), ControllerState::Escalating);
        let notice = rx.try_recv().unwrap();
        assert_eq!(notice.reason, "adapter injection failed");
        assert!(notice.last_intervention.is_some());
    }

    // ========================================================================
    // Supervision mode mapping
    // ========================================================================

    #[tokio::test]
    async fn supervision_mode_follows_state() {
        let mut f = fixture(CakeConfig::default()).await;
        assert_eq!(f.controller.supervision_mode(), SupervisionMode::Normal);
        f.controller.state = ControllerState::Escalating;
        assert_eq!(f.controller.supervision_mode(), SupervisionMode::Strict);
        f.controller.state = ControllerState::Recovering;
        assert_eq!(f.controller.supervision_mode(), SupervisionMode::Strict);
    }
}
