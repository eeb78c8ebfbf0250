//! Pattern detection engine — typed extraction of error events from raw
//! agent output.
//!
//! # Architecture
//!
//! ```text
//! Output line
//!      │
//!      ▼
//! Quick Reject (Aho-Corasick keyword scan, O(n))
//!      │ keyword hit
//!      ▼
//! Built-in rules (regex, first match wins)
//!      │ no match
//!      ▼
//! User rules (fancy-regex, from config, hot-reloadable)
//! ```
//!
//! Each rule is a (kind tag, regex, field-extraction map) triple. Extraction
//! uses named capture groups; `path` and `line` feed event locations, the
//! rest land in the capture map for remediation text.
//!
//! # Performance
//!
//! Quick reject lets the overwhelmingly common benign line exit after one
//! automaton pass; regexes only run on lines containing a trigger keyword.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use aho_corasick::AhoCorasick;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::events::{ErrorKind, Severity};

// =============================================================================
// Match result
// =============================================================================

/// A rule match on a single output line.
#[derive(Debug, Clone)]
pub struct PatternMatch {
    /// Stable rule identifier (e.g. "core.import:no-module").
    pub rule_id: String,
    pub kind: ErrorKind,
    pub severity: Severity,
    /// Confidence score 0.0-1.0 carried into classification.
    pub confidence: f64,
    /// Source path extracted from the line, if the rule captures one.
    pub path: Option<String>,
    /// Line number extracted from the line, if the rule captures one.
    pub line: Option<u32>,
    /// All named captures (module, detail, ...).
    pub captures: HashMap<String, String>,
}

/// Location context from a traceback frame line (`File "x.py", line 10`).
///
/// Frames are not events themselves; the monitor holds the most recent frame
/// per stream and attaches it to the next typed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameLocation {
    pub path: String,
    pub line: u32,
}

// =============================================================================
// Built-in rules
// =============================================================================

struct BuiltinRule {
    id: &'static str,
    kind: ErrorKind,
    severity: Severity,
    confidence: f64,
    pattern: &'static LazyLock<Regex>,
}

static NO_MODULE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:ImportError|ModuleNotFoundError): No module named '(?P<module>[^']+)'")
        .expect("valid built-in pattern")
});
static CANNOT_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"ImportError: cannot import name '(?P<module>[^']+)'")
        .expect("valid built-in pattern")
});
static SYNTAX_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"SyntaxError: (?P<detail>.+)").expect("valid built-in pattern")
});
static INDENTATION_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:IndentationError|TabError): (?P<detail>.+)").expect("valid built-in pattern")
});
static ATTRIBUTE_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"AttributeError: (?P<detail>.+)").expect("valid built-in pattern")
});
static PYTEST_FAILED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^FAILED (?P<path>[^\s:]+)(?:::(?P<test>\S+))?").expect("valid built-in pattern")
});
static ASSERTION_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^E?\s*AssertionError\b(?::\s*(?P<detail>.+))?").expect("valid built-in pattern")
});
static COVERAGE_REQUIRED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)required test coverage of (?P<required>\d+(?:\.\d+)?)% not reached\. total coverage: (?P<actual>\d+(?:\.\d+)?)%",
    )
    .expect("valid built-in pattern")
});
static COVERAGE_DROPPED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)coverage (?:dropped|decreased)(?: by)? (?P<delta>\d+(?:\.\d+)?)%")
        .expect("valid built-in pattern")
});
static GENERIC_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<etype>[A-Z][A-Za-z]*Error): (?P<detail>.+)").expect("valid built-in pattern")
});
static TRACE_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"File "(?P<path>[^"]+)", line (?P<line>\d+)"#).expect("valid built-in pattern")
});

/// Built-in pack, ordered most-specific first; first match wins.
static BUILTIN_RULES: &[BuiltinRule] = &[
    BuiltinRule {
        id: "core.import:no-module",
        kind: ErrorKind::ImportMissing,
        severity: Severity::High,
        confidence: 0.95,
        pattern: &NO_MODULE,
    },
    BuiltinRule {
        id: "core.import:cannot-import",
        kind: ErrorKind::ImportMissing,
        severity: Severity::High,
        confidence: 0.9,
        pattern: &CANNOT_IMPORT,
    },
    BuiltinRule {
        id: "core.syntax:syntax-error",
        kind: ErrorKind::SyntaxError,
        severity: Severity::High,
        confidence: 0.9,
        pattern: &SYNTAX_ERROR,
    },
    BuiltinRule {
        id: "core.syntax:indentation",
        kind: ErrorKind::SyntaxError,
        severity: Severity::High,
        confidence: 0.85,
        pattern: &INDENTATION_ERROR,
    },
    BuiltinRule {
        id: "core.attribute:attribute-error",
        kind: ErrorKind::AttributeError,
        severity: Severity::Medium,
        confidence: 0.85,
        pattern: &ATTRIBUTE_ERROR,
    },
    BuiltinRule {
        id: "core.test:pytest-failed",
        kind: ErrorKind::TestFailure,
        severity: Severity::Medium,
        confidence: 0.9,
        pattern: &PYTEST_FAILED,
    },
    BuiltinRule {
        id: "core.test:assertion",
        kind: ErrorKind::TestFailure,
        severity: Severity::Medium,
        confidence: 0.85,
        pattern: &ASSERTION_ERROR,
    },
    BuiltinRule {
        id: "core.coverage:required-not-reached",
        kind: ErrorKind::CoverageDrop,
        severity: Severity::Low,
        confidence: 0.9,
        pattern: &COVERAGE_REQUIRED,
    },
    BuiltinRule {
        id: "core.coverage:dropped",
        kind: ErrorKind::CoverageDrop,
        severity: Severity::Low,
        confidence: 0.8,
        pattern: &COVERAGE_DROPPED,
    },
    // Catch-all stays last: any other "FooError: ..." types as Unknown.
    BuiltinRule {
        id: "core.unknown:generic-error",
        kind: ErrorKind::Unknown,
        severity: Severity::Low,
        confidence: 0.5,
        pattern: &GENERIC_ERROR,
    },
];

/// Keywords that gate the regex scan.
static KEYWORD_AUTOMATON: LazyLock<AhoCorasick> = LazyLock::new(|| {
    AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .build([
            "error", "failed", "coverage", "assert", "file \"", "traceback",
        ])
        .expect("valid Aho-Corasick patterns")
});

// =============================================================================
// User rules (hot-reloadable)
// =============================================================================

/// A user-supplied rule triple from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRuleDef {
    /// Stable rule identifier.
    pub id: String,
    /// Kind tag; must be one of the closed [`ErrorKind`] tags.
    pub kind: String,
    /// Regex; compiled with fancy-regex so user packs may use backrefs.
    pub pattern: String,
    /// Severity hint for queue priority.
    #[serde(default = "default_user_severity")]
    pub severity: Severity,
    /// Confidence carried into classification.
    #[serde(default = "default_user_confidence")]
    pub confidence: f64,
}

fn default_user_severity() -> Severity {
    Severity::Low
}

fn default_user_confidence() -> f64 {
    0.6
}

struct CompiledUserRule {
    id: String,
    kind: ErrorKind,
    severity: Severity,
    confidence: f64,
    pattern: fancy_regex::Regex,
    group_names: Vec<String>,
}

// =============================================================================
// Engine
// =============================================================================

/// Compiled pattern set: built-in pack plus user rules.
pub struct PatternEngine {
    user_rules: Vec<CompiledUserRule>,
}

impl Default for PatternEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternEngine {
    /// Engine with only the built-in pack.
    #[must_use]
    pub fn new() -> Self {
        Self {
            user_rules: Vec::new(),
        }
    }

    /// Engine with the built-in pack plus user rules.
    ///
    /// Rules that fail to compile or carry an unknown kind tag are skipped
    /// with an error log; the rest of the pack stays active.
    #[must_use]
    pub fn with_user_rules(defs: &[UserRuleDef]) -> Self {
        let mut user_rules = Vec::with_capacity(defs.len());
        let mut skipped = 0usize;

        for def in defs {
            let Some(kind) = ErrorKind::ALL.iter().find(|k| k.tag() == def.kind).copied()
            else {
                error!(rule_id = %def.id, kind = %def.kind, "user rule has unknown kind tag; skipping");
                skipped += 1;
                continue;
            };
            match fancy_regex::Regex::new(&def.pattern) {
                Ok(pattern) => {
                    let group_names = pattern
                        .capture_names()
                        .flatten()
                        .map(str::to_string)
                        .collect();
                    user_rules.push(CompiledUserRule {
                        id: def.id.clone(),
                        kind,
                        severity: def.severity,
                        confidence: def.confidence.clamp(0.0, 1.0),
                        pattern,
                        group_names,
                    });
                }
                Err(e) => {
                    error!(rule_id = %def.id, error = %e, "user rule failed to compile; skipping");
                    skipped += 1;
                }
            }
        }

        if skipped > 0 {
            crate::degradation::enter_degraded(
                crate::degradation::Subsystem::PatternEngine,
                format!("{skipped} user rule(s) skipped"),
            );
        }

        Self { user_rules }
    }

    /// Number of active rules (built-in + user).
    #[must_use]
    pub fn rule_count(&self) -> usize {
        BUILTIN_RULES.len() + self.user_rules.len()
    }

    /// Quick reject: true when the line definitely matches no rule.
    ///
    /// With user rules present the keyword gate cannot speak for them, so
    /// the quick path only applies to a pure built-in engine.
    #[must_use]
    pub fn quick_reject(&self, line: &str) -> bool {
        self.user_rules.is_empty() && !KEYWORD_AUTOMATON.is_match(line)
    }

    /// Scan a line; first matching rule wins (built-ins before user rules).
    #[must_use]
    pub fn scan(&self, line: &str) -> Option<PatternMatch> {
        if self.quick_reject(line) {
            return None;
        }

        if KEYWORD_AUTOMATON.is_match(line) {
            for rule in BUILTIN_RULES {
                if let Some(caps) = rule.pattern.captures(line) {
                    return Some(build_match(
                        rule.id,
                        rule.kind,
                        rule.severity,
                        rule.confidence,
                        rule.pattern.capture_names().flatten(),
                        |name| caps.name(name).map(|m| m.as_str().to_string()),
                    ));
                }
            }
        }

        for rule in &self.user_rules {
            if let Ok(Some(caps)) = rule.pattern.captures(line) {
                return Some(build_match(
                    &rule.id,
                    rule.kind,
                    rule.severity,
                    rule.confidence,
                    rule.group_names.iter().map(String::as_str),
                    |name| caps.name(name).map(|m| m.as_str().to_string()),
                ));
            }
        }

        None
    }

    /// Detect a traceback frame line for location context.
    #[must_use]
    pub fn scan_frame(&self, line: &str) -> Option<FrameLocation> {
        let caps = TRACE_FRAME.captures(line)?;
        let path = caps.name("path")?.as_str().to_string();
        let line_no = caps.name("line")?.as_str().parse().ok()?;
        Some(FrameLocation {
            path,
            line: line_no,
        })
    }
}

/// Swappable engine handle: readers resolve the current engine per line so
/// a config reload can replace the rule set without restarting them.
pub struct SharedPatterns {
    inner: std::sync::RwLock<Arc<PatternEngine>>,
}

impl SharedPatterns {
    #[must_use]
    pub fn new(engine: PatternEngine) -> Self {
        Self {
            inner: std::sync::RwLock::new(Arc::new(engine)),
        }
    }

    /// The engine currently in effect.
    #[must_use]
    pub fn current(&self) -> Arc<PatternEngine> {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Atomically replace the engine (hot reload).
    pub fn swap(&self, engine: PatternEngine) {
        *self
            .inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Arc::new(engine);
    }
}

fn build_match<'a>(
    rule_id: &str,
    kind: ErrorKind,
    severity: Severity,
    confidence: f64,
    group_names: impl Iterator<Item = &'a str>,
    mut get: impl FnMut(&str) -> Option<String>,
) -> PatternMatch {
    let mut captures = HashMap::new();
    let mut path = None;
    let mut line = None;

    for name in group_names {
        let Some(value) = get(name) else { continue };
        match name {
            "path" => path = Some(value),
            "line" => line = value.parse().ok(),
            _ => {
                captures.insert(name.to_string(), value);
            }
        }
    }

    PatternMatch {
        rule_id: rule_id.to_string(),
        kind,
        severity,
        confidence,
        path,
        line,
        captures,
    }
}
