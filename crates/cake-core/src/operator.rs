//! Operator template engine — deterministic synthesis of intervention
//! messages.
//!
//! Templates are keyed by (error kind, strike level). Rendering substitutes
//! only whitelisted context fields, each sanitized and length-capped, into a
//! fixed skeleton; given an identical [`InterventionContext`] the output
//! bytes are identical across runs and processes.
//!
//! Escalation: strike level comes from the signature's occurrence count via
//! the fixed buckets {1, 2-3, 4-5, >=6}; higher levels select terser, more
//! directive templates.
//!
//! Every candidate passes through the voice gate before it is returned. On
//! rejection the engine retries with progressively simpler templates (up to
//! 3 candidates) and finally falls back to the canned message, bumping the
//! voice-gate-failure counter.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::events::ErrorKind;
use crate::metrics::metrics;
use crate::signature::path_basename;
use crate::voice::{VoiceGate, VoiceVerdict};

/// Highest strike level; also the terse template tier.
pub const MAX_STRIKE_LEVEL: u32 = 4;

/// The documented fallback when the voice gate rejects every candidate.
pub const CANNED_FALLBACK: &str =
    "Operator (CAKE): Stop. Check the last error output. Fix it before continuing.";

/// Substituted values never exceed this many characters. Two values plus
/// the widest template skeleton must stay inside the clause limit.
const VALUE_MAX: usize = 24;

/// Hard structural limits on rendered output.
const CLAUSE_MAX: usize = 80;
const MESSAGE_MAX: usize = 220;

// =============================================================================
// Context and output
// =============================================================================

/// Input to the template engine; assembled by the controller.
#[derive(Debug, Clone)]
pub struct InterventionContext {
    pub kind: ErrorKind,
    pub path: Option<String>,
    pub line: Option<u32>,
    pub raw_message: String,
    /// Strike level >= 1, from [`strike_level`].
    pub strike: u32,
    /// Prior intervention texts for the same signature, oldest first.
    pub prior_interventions: Vec<String>,
    pub remediation: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Named captures from the matching pattern rule (module, test, detail).
    pub captures: HashMap<String, String>,
}

/// A rendered, gate-approved operator message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intervention {
    pub text: String,
    pub template_id: String,
    pub strike: u32,
    /// True when this is the canned fallback rather than a gated template.
    pub fallback: bool,
}

/// Map an occurrence count onto the fixed strike buckets
/// {1, 2-3, 4-5, >=6} -> levels 1..=4.
#[must_use]
pub fn strike_level(occurrence_count: u64) -> u32 {
    match occurrence_count {
        0 | 1 => 1,
        2..=3 => 2,
        4..=5 => 3,
        _ => MAX_STRIKE_LEVEL,
    }
}

// =============================================================================
// Template table
// =============================================================================

struct Template {
    id: &'static str,
    kind: ErrorKind,
    level: u32,
    body: &'static str,
}

/// All substitution sites sit inside single quotes so the voice gate's
/// normalization treats rendered values as interchangeable literals.
static TEMPLATES: &[Template] = &[
    // Import missing
    Template {
        id: "import_missing.l1",
        kind: ErrorKind::ImportMissing,
        level: 1,
        body: "Operator (CAKE): Stop. Check the import of '{module}' in '{path}'. Try installing '{module}' before rerunning.",
    },
    Template {
        id: "import_missing.l2",
        kind: ErrorKind::ImportMissing,
        level: 2,
        body: "Operator (CAKE): Stop. Fix the missing module '{module}' now. See the last error for the exact name.",
    },
    Template {
        id: "import_missing.l3",
        kind: ErrorKind::ImportMissing,
        level: 3,
        body: "Operator (CAKE): Stop. Run the dependency install for '{module}' before anything else.",
    },
    Template {
        id: "import_missing.l4",
        kind: ErrorKind::ImportMissing,
        level: 4,
        body: "Operator (CAKE): Stop. Fix '{module}' or escalate.",
    },
    // Syntax error
    Template {
        id: "syntax_error.l1",
        kind: ErrorKind::SyntaxError,
        level: 1,
        body: "Operator (CAKE): Stop. Check the syntax at '{path}' line '{line}'. Fix it before rerunning.",
    },
    Template {
        id: "syntax_error.l2",
        kind: ErrorKind::SyntaxError,
        level: 2,
        body: "Operator (CAKE): Stop. Fix the syntax error at '{path}' line '{line}' now.",
    },
    Template {
        id: "syntax_error.l3",
        kind: ErrorKind::SyntaxError,
        level: 3,
        body: "Operator (CAKE): Stop. Fix the same syntax error at '{path}'. Try a smaller edit.",
    },
    Template {
        id: "syntax_error.l4",
        kind: ErrorKind::SyntaxError,
        level: 4,
        body: "Operator (CAKE): Stop. See '{path}'. Fix it or escalate.",
    },
    // Attribute error
    Template {
        id: "attribute_error.l1",
        kind: ErrorKind::AttributeError,
        level: 1,
        body: "Operator (CAKE): Check the attribute error in '{path}'. See the object's actual API first.",
    },
    Template {
        id: "attribute_error.l2",
        kind: ErrorKind::AttributeError,
        level: 2,
        body: "Operator (CAKE): Stop. Fix the attribute error in '{path}' now.",
    },
    Template {
        id: "attribute_error.l3",
        kind: ErrorKind::AttributeError,
        level: 3,
        body: "Operator (CAKE): Stop. Try printing the object type in '{path}' first.",
    },
    Template {
        id: "attribute_error.l4",
        kind: ErrorKind::AttributeError,
        level: 4,
        body: "Operator (CAKE): Stop. Fix the attribute error or escalate.",
    },
    // Test failure
    Template {
        id: "test_failure.l1",
        kind: ErrorKind::TestFailure,
        level: 1,
        body: "Operator (CAKE): Check the failing test '{test}'. Run it alone before rerunning the suite.",
    },
    Template {
        id: "test_failure.l2",
        kind: ErrorKind::TestFailure,
        level: 2,
        body: "Operator (CAKE): Stop. Run '{test}' alone. Fix the assertion before moving on.",
    },
    Template {
        id: "test_failure.l3",
        kind: ErrorKind::TestFailure,
        level: 3,
        body: "Operator (CAKE): Stop. Fix '{test}' before any other change.",
    },
    Template {
        id: "test_failure.l4",
        kind: ErrorKind::TestFailure,
        level: 4,
        body: "Operator (CAKE): Stop. Fix '{test}' or escalate.",
    },
    // Coverage drop
    Template {
        id: "coverage_drop.l1",
        kind: ErrorKind::CoverageDrop,
        level: 1,
        body: "Operator (CAKE): Check the coverage report. Try adding tests for the new code paths.",
    },
    Template {
        id: "coverage_drop.l2",
        kind: ErrorKind::CoverageDrop,
        level: 2,
        body: "Operator (CAKE): Stop. Fix the coverage gap before continuing.",
    },
    Template {
        id: "coverage_drop.l3",
        kind: ErrorKind::CoverageDrop,
        level: 3,
        body: "Operator (CAKE): Stop. Run the coverage report. Fix the largest gap first.",
    },
    Template {
        id: "coverage_drop.l4",
        kind: ErrorKind::CoverageDrop,
        level: 4,
        body: "Operator (CAKE): Stop. Fix the coverage gap or escalate.",
    },
    // Unknown
    Template {
        id: "unknown.l1",
        kind: ErrorKind::Unknown,
        level: 1,
        body: "Operator (CAKE): Check the last error output. Fix it before continuing.",
    },
    Template {
        id: "unknown.l2",
        kind: ErrorKind::Unknown,
        level: 2,
        body: "Operator (CAKE): Stop. Check the last error output. Fix it before continuing.",
    },
    Template {
        id: "unknown.l3",
        kind: ErrorKind::Unknown,
        level: 3,
        body: "Operator (CAKE): Stop. Try a different approach to the last error.",
    },
    Template {
        id: "unknown.l4",
        kind: ErrorKind::Unknown,
        level: 4,
        body: "Operator (CAKE): Stop. See the last error. Fix it or escalate.",
    },
];

fn template_for(kind: ErrorKind, level: u32) -> &'static Template {
    let level = level.clamp(1, MAX_STRIKE_LEVEL);
    TEMPLATES
        .iter()
        .find(|t| t.kind == kind && t.level == level)
        .or_else(|| {
            TEMPLATES
                .iter()
                .find(|t| t.kind == ErrorKind::Unknown && t.level == level)
        })
        .unwrap_or(&TEMPLATES[TEMPLATES.len() - 1])
}

// =============================================================================
// Engine
// =============================================================================

/// The template engine. Stateless apart from the voice gate it consults.
pub struct OperatorEngine {
    gate: VoiceGate,
}

impl OperatorEngine {
    #[must_use]
    pub fn new(gate: VoiceGate) -> Self {
        Self { gate }
    }

    /// Render an intervention for `context`.
    ///
    /// Never errors: after three gate rejections the canned fallback is
    /// returned and the failure surfaced through metrics.
    #[must_use]
    pub fn build(&self, context: &InterventionContext) -> Intervention {
        let values = substitution_values(context);

        // Candidate ladder: selected template, the terse level-4 template,
        // then the canned fallback. A candidate equal to the previous
        // intervention is skipped so strikes never repeat verbatim.
        let primary = template_for(context.kind, context.strike);
        let terse = template_for(context.kind, MAX_STRIKE_LEVEL);
        let mut candidates: Vec<(&'static str, String)> = Vec::with_capacity(3);
        for template in [primary, terse] {
            let text = render(template.body, &values);
            if candidates.iter().any(|(_, existing)| *existing == text) {
                continue;
            }
            candidates.push((template.id, text));
        }
        candidates.push(("canned.fallback", CANNED_FALLBACK.to_string()));

        if let Some(last) = context.prior_interventions.last() {
            if candidates.len() > 1 && candidates[0].1 == *last {
                candidates.remove(0);
            }
        }

        let mut last_verdict: Option<VoiceVerdict> = None;
        for (template_id, text) in candidates.iter().take(3) {
            debug_check_limits(text);
            let verdict = self.gate.validate(text);
            if verdict.passed {
                debug!(template_id = *template_id, score = verdict.score, "intervention passed voice gate");
                return Intervention {
                    text: text.clone(),
                    template_id: (*template_id).to_string(),
                    strike: context.strike,
                    fallback: *template_id == "canned.fallback",
                };
            }
            debug!(template_id = *template_id, reason = %verdict.reason, "voice gate rejected candidate");
            last_verdict = Some(verdict);
        }

        metrics().inc_counter("voice_gate_failures_total", &[]);
        warn!(
            kind = %context.kind,
            reason = %last_verdict.map(|v| v.reason).unwrap_or_default(),
            "voice gate rejected all candidates; emitting canned fallback"
        );
        Intervention {
            text: CANNED_FALLBACK.to_string(),
            template_id: "canned.fallback".to_string(),
            strike: context.strike,
            fallback: true,
        }
    }
}

// =============================================================================
// Rendering
// =============================================================================

fn substitution_values(context: &InterventionContext) -> HashMap<&'static str, String> {
    let mut values = HashMap::new();

    let module = context
        .captures
        .get("module")
        .map_or_else(|| "the missing module".to_string(), |m| sanitize(m));
    let path = context
        .path
        .as_deref()
        .map_or_else(|| "the last file".to_string(), |p| sanitize(&path_basename(p)));
    let line = context
        .line
        .map_or_else(|| "?".to_string(), |l| l.to_string());
    let test = match (context.captures.get("test"), context.path.as_deref()) {
        (Some(test), Some(path)) => sanitize(&format!("{}::{test}", path_basename(path))),
        (Some(test), None) => sanitize(test),
        (None, Some(path)) => sanitize(&path_basename(path)),
        (None, None) => "the failing test".to_string(),
    };
    let detail = context
        .captures
        .get("detail")
        .map_or_else(|| sanitize(&context.raw_message), |d| sanitize(d));

    values.insert("module", module);
    values.insert("path", path);
    values.insert("line", line);
    values.insert("test", test);
    values.insert("detail", detail);
    values
}

/// Strip quotes and control characters, collapse whitespace, cap length.
fn sanitize(value: &str) -> String {
    let mut out = String::with_capacity(value.len().min(VALUE_MAX));
    let mut last_was_space = true;
    for ch in value.chars() {
        let ch = match ch {
            '\'' | '"' | '`' => '_',
            c if c.is_control() => ' ',
            c => c,
        };
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
        } else {
            out.push(ch);
            last_was_space = false;
        }
        if out.chars().count() >= VALUE_MAX {
            break;
        }
    }
    let trimmed = out.trim().to_string();
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed
    }
}

/// Rendered output must honor the structural limits regardless of
/// substitution values; value sanitization guarantees this, the assert
/// keeps template authors honest.
fn debug_check_limits(text: &str) {
    debug_assert!(text.len() <= MESSAGE_MAX, "message over {MESSAGE_MAX} bytes: {text}");
    debug_assert!(
        text.split(['.', ';']).all(|clause| clause.len() <= CLAUSE_MAX),
        "clause over {CLAUSE_MAX} bytes: {text}"
    );
}

/// Interpolate `{key}` placeholders from the whitelist only.
fn render(body: &str, values: &HashMap<&'static str, String>) -> String {
    let mut out = String::with_capacity(body.len() + 32);
    let mut rest = body;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let Some(end) = rest[start..].find('}') else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let key = &rest[start + 1..start + end];
        match values.get(key) {
            Some(value) => out.push_str(value),
            // Unknown placeholder: render literally; whitelisting happens at
            // template authoring time and tests assert full coverage.
            None => out.push_str(&rest[start..=start + end]),
        }
        rest = &rest[start + end + 1..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VoiceConfig;

    fn engine() -> OperatorEngine {
        OperatorEngine::new(VoiceGate::from_config(&VoiceConfig::default()).unwrap())
    }

    fn context(kind: ErrorKind, strike: u32) -> InterventionContext {
        let mut captures = HashMap::new();
        if kind == ErrorKind::ImportMissing {
            captures.insert("module".to_string(), "requests".to_string());
        }
        if kind == ErrorKind::TestFailure {
            captures.insert("test".to_string(), "test_y".to_string());
        }
        InterventionContext {
            kind,
            path: Some("/workspace/main.py".to_string()),
            line: Some(10),
            raw_message: "ImportError: No module named 'requests'".to_string(),
            strike,
            prior_interventions: Vec::new(),
            remediation: None,
            timestamp: Utc::now(),
            captures,
        }
    }

    // ========================================================================
    // Strike buckets
    // ========================================================================

    #[test]
    fn occurrence_buckets_map_to_levels() {
        assert_eq!(strike_level(1), 1);
        assert_eq!(strike_level(2), 2);
        assert_eq!(strike_level(3), 2);
        assert_eq!(strike_level(4), 3);
        assert_eq!(strike_level(5), 3);
        assert_eq!(strike_level(6), 4);
        assert_eq!(strike_level(100), 4);
    }

    // ========================================================================
    // Rendering
    // ========================================================================

    #[test]
    fn first_strike_import_message() {
        let intervention = engine().build(&context(ErrorKind::ImportMissing, 1));
        assert!(intervention.text.starts_with("Operator (CAKE): Stop."));
        assert!(intervention.text.contains("'requests'"));
        assert!(intervention.text.contains("'main.py'"));
        assert_eq!(intervention.template_id, "import_missing.l1");
        assert!(!intervention.fallback);
    }

    #[test]
    fn higher_strikes_get_terser_templates() {
        let engine = engine();
        let l1 = engine.build(&context(ErrorKind::ImportMissing, 1));
        let l4 = engine.build(&context(ErrorKind::ImportMissing, 4));
        assert_eq!(l4.template_id, "import_missing.l4");
        assert!(l4.text.len() < l1.text.len());
    }

    #[test]
    fn rendering_is_deterministic() {
        let engine = engine();
        let ctx = context(ErrorKind::TestFailure, 2);
        let a = engine.build(&ctx);
        let b = engine.build(&ctx);
        assert_eq!(a.text.as_bytes(), b.text.as_bytes());
        assert_eq!(a.template_id, b.template_id);
    }

    #[test]
    fn all_templates_pass_the_gate() {
        let engine = engine();
        for kind in ErrorKind::ALL {
            for strike in 1..=MAX_STRIKE_LEVEL {
                let intervention = engine.build(&context(kind, strike));
                assert!(
                    !intervention.fallback,
                    "kind={kind} strike={strike} fell back: {}",
                    intervention.text
                );
            }
        }
    }

    #[test]
    fn all_templates_respect_length_limits() {
        let engine = engine();
        for kind in ErrorKind::ALL {
            for strike in 1..=MAX_STRIKE_LEVEL {
                let intervention = engine.build(&context(kind, strike));
                assert!(
                    intervention.text.len() <= MESSAGE_MAX,
                    "{} too long",
                    intervention.template_id
                );
                for clause in intervention.text.split(['.', ';']) {
                    assert!(
                        clause.len() <= CLAUSE_MAX,
                        "clause too long in {}: {clause}",
                        intervention.template_id
                    );
                }
            }
        }
    }

    #[test]
    fn missing_context_fields_use_fallback_values() {
        let ctx = InterventionContext {
            kind: ErrorKind::SyntaxError,
            path: None,
            line: None,
            raw_message: "SyntaxError: invalid syntax".to_string(),
            strike: 1,
            prior_interventions: Vec::new(),
            remediation: None,
            timestamp: Utc::now(),
            captures: HashMap::new(),
        };
        let intervention = engine().build(&ctx);
        assert!(intervention.text.contains("'the last file'"));
        assert!(!intervention.fallback);
    }

    #[test]
    fn hostile_values_are_sanitized() {
        let mut ctx = context(ErrorKind::ImportMissing, 1);
        ctx.captures.insert(
            "module".to_string(),
            "evil'; DROP TABLE--\nx".repeat(10),
        );
        let intervention = engine().build(&ctx);
        assert!(!intervention.text.contains('\n'));
        assert!(intervention.text.len() <= MESSAGE_MAX);
    }

    #[test]
    fn repeated_candidate_is_skipped() {
        let engine = engine();
        let mut ctx = context(ErrorKind::ImportMissing, 1);
        let first = engine.build(&ctx);
        ctx.prior_interventions.push(first.text.clone());
        let second = engine.build(&ctx);
        assert_ne!(first.text, second.text);
    }

    // ========================================================================
    // Fallback
    // ========================================================================

    #[test]
    fn hostile_corpus_forces_canned_fallback() {
        // A corpus that matches nothing the templates render.
        let config = VoiceConfig::default();
        let gate = VoiceGate::with_corpus(
            "Totally unrelated reference sentence about gardening.\n",
            &config,
        )
        .unwrap();
        let engine = OperatorEngine::new(gate);
        let intervention = engine.build(&context(ErrorKind::ImportMissing, 1));
        assert!(intervention.fallback);
        assert_eq!(intervention.text, CANNED_FALLBACK);
        assert!(metrics().counter("voice_gate_failures_total", &[]) >= 1);
    }

    #[test]
    fn canned_fallback_passes_default_gate() {
        let gate = VoiceGate::from_config(&VoiceConfig::default()).unwrap();
        assert!(gate.validate(CANNED_FALLBACK).passed);
    }

    // ========================================================================
    // Internals
    // ========================================================================

    #[test]
    fn render_interpolates_only_known_keys() {
        let mut values = HashMap::new();
        values.insert("module", "requests".to_string());
        assert_eq!(
            render("Fix '{module}' and {nope}.", &values),
            "Fix 'requests' and {nope}."
        );
    }

    #[test]
    fn sanitize_caps_and_cleans() {
        let long = "a".repeat(100);
        assert_eq!(sanitize(&long).chars().count(), VALUE_MAX);
        assert_eq!(sanitize("with 'quotes'"), "with _quotes_");
        assert_eq!(sanitize("  spaced   out  "), "spaced out");
        assert_eq!(sanitize(""), "unknown");
    }
}
