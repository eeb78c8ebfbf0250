//! Event and classification types shared across the pipeline.
//!
//! An [`ErrorEvent`] is produced by the stream monitor, consumed by the
//! classifier, and identified by a stable signature for repeat detection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of error kinds the monitor can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing import / module not found
    ImportMissing,
    /// Syntax error in source the agent touched
    SyntaxError,
    /// Attribute/member access failure
    AttributeError,
    /// Failing test case
    TestFailure,
    /// Coverage fell below the required threshold
    CoverageDrop,
    /// Anything the pattern packs could not type
    Unknown,
}

impl ErrorKind {
    /// All kinds in display order.
    pub const ALL: [ErrorKind; 6] = [
        ErrorKind::ImportMissing,
        ErrorKind::SyntaxError,
        ErrorKind::AttributeError,
        ErrorKind::TestFailure,
        ErrorKind::CoverageDrop,
        ErrorKind::Unknown,
    ];

    /// Stable lowercase tag used in signatures and metrics labels.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Self::ImportMissing => "import_missing",
            Self::SyntaxError => "syntax_error",
            Self::AttributeError => "attribute_error",
            Self::TestFailure => "test_failure",
            Self::CoverageDrop => "coverage_drop",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Which supervised stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamSource {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// Severity ordered from least to most urgent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// A single error observation extracted from the supervised agent's output.
///
/// Immutable once constructed. `seq` is monotone per stream; `severity_hint`
/// comes from the matching pattern rule and drives queue drop priority before
/// full classification runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Typed kind from the matching pattern rule.
    pub kind: ErrorKind,
    /// Stream the line was observed on.
    pub source: StreamSource,
    /// The raw matched text (single line, or partial tail on stream close).
    pub raw: String,
    /// Source path captured by the rule, if present.
    pub path: Option<String>,
    /// Line number captured by the rule, if present.
    pub line: Option<u32>,
    /// UTC capture timestamp.
    pub timestamp: DateTime<Utc>,
    /// Monotone sequence id within the source stream.
    pub seq: u64,
    /// Severity hint from the matching rule (pre-classification).
    pub severity_hint: Severity,
}

impl ErrorEvent {
    /// Build an event with the current timestamp.
    #[must_use]
    pub fn new(kind: ErrorKind, source: StreamSource, raw: impl Into<String>, seq: u64) -> Self {
        Self {
            kind,
            source,
            raw: raw.into(),
            path: None,
            line: None,
            timestamp: Utc::now(),
            seq,
            severity_hint: Severity::Low,
        }
    }

    #[must_use]
    pub fn with_location(mut self, path: Option<String>, line: Option<u32>) -> Self {
        self.path = path;
        self.line = line;
        self
    }

    #[must_use]
    pub fn with_severity_hint(mut self, hint: Severity) -> Self {
        self.severity_hint = hint;
        self
    }
}

/// Classifier verdict for one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub kind: ErrorKind,
    pub severity: Severity,
    /// Confidence in [0, 1].
    pub confidence: f64,
    /// Whether policy says this event warrants an operator message.
    pub intervention_required: bool,
    /// Short remediation summary (<= 120 chars), absent when nothing useful.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_by_urgency() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(ErrorKind::ImportMissing.tag(), "import_missing");
        assert_eq!(ErrorKind::Unknown.tag(), "unknown");
        assert_eq!(ErrorKind::ALL.len(), 6);
    }

    #[test]
    fn event_serializes_snake_case() {
        let event = ErrorEvent::new(
            ErrorKind::TestFailure,
            StreamSource::Stderr,
            "FAILED tests/test_x.py::test_y",
            7,
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("test_failure"));
        assert!(json.contains("stderr"));
    }

    #[test]
    fn builder_sets_location_and_hint() {
        let event = ErrorEvent::new(ErrorKind::SyntaxError, StreamSource::Stderr, "boom", 1)
            .with_location(Some("/workspace/main.py".to_string()), Some(10))
            .with_severity_hint(Severity::High);
        assert_eq!(event.line, Some(10));
        assert_eq!(event.severity_hint, Severity::High);
    }
}
