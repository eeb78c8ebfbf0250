//! Classifier — maps raw error events to severity-scored classifications
//! and decides whether an intervention is warranted.
//!
//! Severity comes from a fixed per-kind table that config (and the
//! strictness preset) can override. Confidence is per-kind; remediation is a
//! short imperative summary capped at 120 characters.
//!
//! Intervention policy:
//! - critical: always
//! - high: confidence >= 0.8
//! - medium: only once the signature has recurred (recall count >= 3)
//! - low: never
//!
//! A per-signature cooldown suppresses repeats inside the configured window
//! except at critical severity.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::config::CakeConfig;
use crate::events::{Classification, ErrorEvent, ErrorKind, Severity};
use crate::signature::path_basename;

/// Remediation strings must stay terse.
const REMEDIATION_MAX: usize = 120;

/// Recurrences of a medium-severity signature before intervening.
const MEDIUM_RECALL_THRESHOLD: u64 = 3;

static MODULE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"No module named '(?P<module>[^']+)'").expect("valid built-in pattern")
});

/// Per-kind confidence the classifier assigns.
fn base_confidence(kind: ErrorKind) -> f64 {
    match kind {
        ErrorKind::ImportMissing => 0.95,
        ErrorKind::SyntaxError => 0.9,
        ErrorKind::TestFailure => 0.9,
        ErrorKind::AttributeError => 0.85,
        ErrorKind::CoverageDrop => 0.85,
        ErrorKind::Unknown => 0.4,
    }
}

impl Classification {
    /// Fallback used when severity cannot be determined (spec'd failure
    /// policy: continue at medium).
    #[must_use]
    pub fn medium_fallback(kind: ErrorKind) -> Self {
        Self {
            kind,
            severity: Severity::Medium,
            confidence: 0.5,
            intervention_required: false,
            remediation: None,
        }
    }
}

/// Stateless classifier over one config snapshot.
#[derive(Debug, Clone)]
pub struct Classifier {
    severity_table: BTreeMap<ErrorKind, Severity>,
    cooldown: Duration,
}

impl Classifier {
    #[must_use]
    pub fn from_config(config: &CakeConfig) -> Self {
        Self {
            severity_table: config.severity_table(),
            cooldown: config.cooldown(),
        }
    }

    /// Classify one event.
    #[must_use]
    pub fn classify(&self, event: &ErrorEvent) -> Classification {
        let Some(severity) = self.severity_table.get(&event.kind).copied() else {
            return Classification::medium_fallback(event.kind);
        };
        let confidence = base_confidence(event.kind);
        let mut classification = Classification {
            kind: event.kind,
            severity,
            confidence,
            intervention_required: false,
            remediation: remediation_for(event),
        };
        // Reflects policy before recall history; `should_intervene` makes
        // the final call once the recall count is known.
        classification.intervention_required = self.should_intervene(&classification, 0);
        classification
    }

    /// Final intervention decision given the signature's recall count.
    #[must_use]
    pub fn should_intervene(&self, classification: &Classification, recall_count: u64) -> bool {
        match classification.severity {
            Severity::Critical => true,
            Severity::High => classification.confidence >= 0.8,
            Severity::Medium => recall_count >= MEDIUM_RECALL_THRESHOLD,
            Severity::Low => false,
        }
    }

    /// Whether the cooldown window suppresses this event.
    ///
    /// Critical severity is never suppressed.
    #[must_use]
    pub fn cooldown_active(
        &self,
        severity: Severity,
        last_intervention_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        if severity == Severity::Critical {
            return false;
        }
        let Some(last) = last_intervention_at else {
            return false;
        };
        let elapsed = now.signed_duration_since(last);
        elapsed
            .to_std()
            .map(|elapsed| elapsed < self.cooldown)
            .unwrap_or(true) // last-seen in the future: clock skew, suppress
    }

    /// The cooldown window in effect.
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }
}

fn remediation_for(event: &ErrorEvent) -> Option<String> {
    let text = match event.kind {
        ErrorKind::ImportMissing => MODULE_NAME
            .captures(&event.raw)
            .and_then(|caps| caps.name("module"))
            .map_or_else(
                || "Install the missing dependency before rerunning.".to_string(),
                |module| format!("Install the missing package '{}' before rerunning.", module.as_str()),
            ),
        ErrorKind::SyntaxError => match (&event.path, event.line) {
            (Some(path), Some(line)) => {
                format!("Fix the syntax error at {}:{line}.", path_basename(path))
            }
            _ => "Fix the reported syntax error before rerunning.".to_string(),
        },
        ErrorKind::AttributeError => {
            "Check the attribute name against the object's actual API.".to_string()
        }
        ErrorKind::TestFailure => {
            "Run the failing test alone and fix the assertion.".to_string()
        }
        ErrorKind::CoverageDrop => {
            "Add tests covering the new code paths to restore coverage.".to_string()
        }
        ErrorKind::Unknown => return None,
    };

    let mut text = text;
    if text.len() > REMEDIATION_MAX {
        let mut cut = REMEDIATION_MAX;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    Some(text)
}
