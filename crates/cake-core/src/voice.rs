//! Voice gate — structural and similarity validation of operator messages.
//!
//! Every intervention must read like the operator corpus before it reaches
//! the supervised agent. The rules are conjunctive:
//!
//! 1. exact prefix `"Operator (CAKE): "`,
//! 2. at most 3 sentences (terminal punctuation after the prefix),
//! 3. imperative clauses lead with an approved verb,
//! 4. no forbidden hedging substrings,
//! 5. similarity against the reference corpus >= threshold.
//!
//! Similarity runs over *normalized* text (quoted literals and numbers
//! collapsed, lowercased) so substituted module names and paths do not count
//! against a message's resemblance to the corpus. The primary backend embeds
//! with FNV-1a character n-gram feature hashing and scores max cosine;
//! when embedding is unavailable the gate falls back to token-set Jaccard at
//! the same threshold and records the degraded mode.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::VoiceConfig;
use crate::degradation::{self, Subsystem};
use crate::error::{Result, VoiceError};
use crate::metrics::metrics;
use crate::signature::normalize_message;

/// Required message prefix.
pub const OPERATOR_PREFIX: &str = "Operator (CAKE): ";

/// Verbs allowed to lead an imperative clause.
pub const APPROVED_VERBS: [&str; 6] = ["Run", "Check", "Fix", "Try", "See", "Stop"];

/// Imperative verbs the corpus never uses; leading with one fails the gate.
const DISALLOWED_VERBS: [&str; 20] = [
    "Install", "Use", "Add", "Remove", "Delete", "Update", "Make", "Do", "Go", "Revert",
    "Rerun", "Retry", "Ensure", "Verify", "Avoid", "Consider", "Please", "Wait", "Keep", "Let",
];

/// Hedging substrings that never appear in operator messages.
const FORBIDDEN_DEFAULTS: [&str; 6] = [
    "sorry",
    "apologies",
    "I think",
    "maybe",
    "perhaps",
    "might want to",
];

/// Reference corpus compiled into the binary; a configured corpus file
/// replaces it entirely.
const DEFAULT_CORPUS: &str = include_str!("voice_corpus.txt");

// =============================================================================
// Embedder
// =============================================================================

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01B3;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// FNV-1a character n-gram feature-hashing embedder.
///
/// Deterministic across runs and processes; no model files, no I/O.
#[derive(Debug, Clone)]
pub struct TextEmbedder {
    dimension: usize,
    ngram_range: (usize, usize),
}

impl Default for TextEmbedder {
    fn default() -> Self {
        Self {
            dimension: 256,
            ngram_range: (3, 4),
        }
    }
}

impl TextEmbedder {
    #[must_use]
    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let chars: Vec<char> = text.chars().collect();
        if chars.is_empty() {
            return vector;
        }
        for n in self.ngram_range.0..=self.ngram_range.1 {
            if n > chars.len() {
                continue;
            }
            for window in chars.windows(n) {
                let ngram: String = window.iter().collect();
                let h = fnv1a(ngram.as_bytes());
                let bucket = (h as usize) % self.dimension;
                let sign = if (h >> 32) & 1 == 0 { 1.0f32 } else { -1.0f32 };
                vector[bucket] += sign;
            }
        }
        l2_normalize(&mut vector);
        vector
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    f64::from(a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>())
}

fn word_tokens(normalized: &str) -> BTreeSet<String> {
    normalized
        .split(|c: char| !c.is_alphanumeric() && c != '<' && c != '>')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn lexical_similarity(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    crate::signature::jaccard(a, b)
}

// =============================================================================
// Gate
// =============================================================================

/// Verdict returned by [`VoiceGate::validate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceVerdict {
    pub passed: bool,
    /// Similarity score in [0, 1]; 0.0 when a structural rule failed first.
    pub score: f64,
    pub reason: String,
    /// True when the lexical fallback scored this message.
    pub degraded: bool,
}

impl VoiceVerdict {
    fn fail(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            score: 0.0,
            reason: reason.into(),
            degraded: false,
        }
    }
}

enum SimilarityBackend {
    Embedding {
        embedder: TextEmbedder,
        corpus: Vec<Vec<f32>>,
    },
    Lexical {
        corpus: Vec<BTreeSet<String>>,
    },
}

/// The gate: corpus loaded once at startup, never mutated at runtime.
pub struct VoiceGate {
    backend: SimilarityBackend,
    forbidden: Vec<String>,
    threshold: f64,
}

impl VoiceGate {
    /// Build the gate from config: corpus file if configured, built-in
    /// corpus otherwise.
    pub fn from_config(config: &VoiceConfig) -> Result<Self> {
        let corpus_text = match &config.corpus_path {
            Some(path) => std::fs::read_to_string(path).map_err(|e| VoiceError::CorpusUnavailable {
                path: path.display().to_string(),
                cause: e.to_string(),
            })?,
            None => DEFAULT_CORPUS.to_string(),
        };
        Self::with_corpus(&corpus_text, config)
    }

    /// Build from an explicit corpus payload.
    pub fn with_corpus(corpus_text: &str, config: &VoiceConfig) -> Result<Self> {
        let entries: Vec<String> = corpus_text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(normalize_message)
            .collect();
        if entries.is_empty() {
            return Err(VoiceError::EmptyCorpus.into());
        }

        let mut forbidden: Vec<String> = FORBIDDEN_DEFAULTS
            .iter()
            .map(|s| (*s).to_lowercase())
            .collect();
        forbidden.extend(
            config
                .forbidden_substrings
                .iter()
                .map(|s| s.to_lowercase()),
        );

        let backend = Self::build_backend(&entries);
        Ok(Self {
            backend,
            forbidden,
            threshold: config.similarity_threshold,
        })
    }

    fn build_backend(entries: &[String]) -> SimilarityBackend {
        let embedder = TextEmbedder::default();
        let mut corpus = Vec::with_capacity(entries.len());
        for entry in entries {
            let vector = embedder.embed(entry);
            if vector.iter().all(|v| *v == 0.0) && !entry.is_empty() {
                // Embedding produced nothing usable; fall back to lexical
                // scoring for the whole corpus.
                warn!("embedding backend unavailable; voice gate using lexical similarity");
                degradation::enter_degraded(
                    Subsystem::VoiceEmbedding,
                    "embedding backend unavailable",
                );
                return SimilarityBackend::Lexical {
                    corpus: entries.iter().map(|e| word_tokens(e)).collect(),
                };
            }
            corpus.push(vector);
        }
        SimilarityBackend::Embedding { embedder, corpus }
    }

    /// Whether the gate runs on the lexical fallback.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        matches!(self.backend, SimilarityBackend::Lexical { .. })
    }

    /// Validate a candidate operator message.
    #[must_use]
    pub fn validate(&self, candidate: &str) -> VoiceVerdict {
        // Rule 1: exact prefix.
        let Some(body) = candidate.strip_prefix(OPERATOR_PREFIX) else {
            return VoiceVerdict::fail("missing operator prefix");
        };
        if body.trim().is_empty() {
            return VoiceVerdict::fail("empty message body");
        }

        // Rule 2: sentence count.
        let sentences = split_sentences(body);
        if sentences.len() > 3 {
            return VoiceVerdict::fail(format!(
                "too many sentences: {} (max 3)",
                sentences.len()
            ));
        }

        // Rule 3: imperative clauses lead with approved verbs.
        for sentence in &sentences {
            for clause in sentence.split(';') {
                if let Some(verb) = disallowed_leading_verb(clause) {
                    return VoiceVerdict::fail(format!("unapproved imperative verb: {verb}"));
                }
            }
        }

        // Rule 4: forbidden substrings.
        let lowercase = candidate.to_lowercase();
        for forbidden in &self.forbidden {
            if lowercase.contains(forbidden) {
                return VoiceVerdict::fail(format!("forbidden phrase: {forbidden}"));
            }
        }

        // Rule 5: corpus similarity over normalized text.
        let normalized = normalize_message(candidate);
        let (score, degraded) = match &self.backend {
            SimilarityBackend::Embedding { embedder, corpus } => {
                let vector = embedder.embed(&normalized);
                let best = corpus
                    .iter()
                    .map(|entry| cosine(&vector, entry))
                    .fold(0.0f64, f64::max);
                (best, false)
            }
            SimilarityBackend::Lexical { corpus } => {
                let tokens = word_tokens(&normalized);
                let best = corpus
                    .iter()
                    .map(|entry| lexical_similarity(&tokens, entry))
                    .fold(0.0f64, f64::max);
                (best, true)
            }
        };

        metrics().set_gauge("voice_similarity_score", &[], score);

        if score < self.threshold {
            return VoiceVerdict {
                passed: false,
                score,
                reason: format!("similarity {score:.3} below threshold {:.2}", self.threshold),
                degraded,
            };
        }

        VoiceVerdict {
            passed: true,
            score,
            reason: String::new(),
            degraded,
        }
    }
}

/// Split on terminal punctuation: `.`, `!`, `?` followed by whitespace or
/// end of text. Dots inside file names (`main.py`) are not terminal.
fn split_sentences(body: &str) -> Vec<String> {
    let chars: Vec<char> = body.chars().collect();
    let mut sentences = Vec::new();
    let mut current = String::new();

    for (i, &ch) in chars.iter().enumerate() {
        current.push(ch);
        let terminal = matches!(ch, '.' | '!' | '?')
            && chars.get(i + 1).is_none_or(|next| next.is_whitespace());
        if terminal {
            let sentence = current.trim().to_string();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            current.clear();
        }
    }
    let tail = current.trim().to_string();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

/// Returns the leading verb when a clause starts with a known-but-unapproved
/// imperative; `None` means the clause passes rule 3.
fn disallowed_leading_verb(clause: &str) -> Option<String> {
    let first = clause
        .trim()
        .split_whitespace()
        .next()?
        .trim_matches(|c: char| !c.is_alphanumeric());
    if first.is_empty() || APPROVED_VERBS.contains(&first) {
        return None;
    }
    if DISALLOWED_VERBS.contains(&first) {
        return Some(first.to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> VoiceGate {
        VoiceGate::with_corpus(DEFAULT_CORPUS, &VoiceConfig::default()).unwrap()
    }

    // ========================================================================
    // Structural rules
    // ========================================================================

    #[test]
    fn corpus_message_passes() {
        let verdict = gate().validate(
            "Operator (CAKE): Stop. Check the import of 'requests' in 'main.py'. Try installing 'requests' before rerunning.",
        );
        assert!(verdict.passed, "reason: {}", verdict.reason);
        assert!(verdict.score >= 0.90);
        assert!(!verdict.degraded);
    }

    #[test]
    fn missing_prefix_fails() {
        let verdict = gate().validate("Stop. Fix the error.");
        assert!(!verdict.passed);
        assert!(verdict.reason.contains("prefix"));
    }

    #[test]
    fn four_sentences_fail() {
        let verdict =
            gate().validate("Operator (CAKE): Stop. Fix it. Run tests. Check output.");
        assert!(!verdict.passed);
        assert!(verdict.reason.contains("sentences"));
    }

    #[test]
    fn filename_dots_are_not_terminal() {
        let verdict = gate().validate(
            "Operator (CAKE): Stop. Check the syntax at 'main.py' line '10'. Fix it before rerunning.",
        );
        assert!(verdict.passed, "reason: {}", verdict.reason);
    }

    #[test]
    fn unapproved_verb_fails() {
        let verdict =
            gate().validate("Operator (CAKE): Install the package. Check the output.");
        assert!(!verdict.passed);
        assert!(verdict.reason.contains("Install"));
    }

    #[test]
    fn forbidden_phrase_fails() {
        let verdict = gate()
            .validate("Operator (CAKE): Stop. Check the error, sorry about that.");
        assert!(!verdict.passed);
        assert!(verdict.reason.contains("sorry"));
    }

    #[test]
    fn configured_forbidden_phrase_extends_defaults() {
        let config = VoiceConfig {
            forbidden_substrings: vec!["unfortunately".to_string()],
            ..VoiceConfig::default()
        };
        let gate = VoiceGate::with_corpus(DEFAULT_CORPUS, &config).unwrap();
        let verdict =
            gate.validate("Operator (CAKE): Stop. Check the log; unfortunately it failed.");
        assert!(!verdict.passed);
    }

    // ========================================================================
    // Similarity
    // ========================================================================

    #[test]
    fn off_corpus_text_fails_similarity() {
        let verdict = gate().validate(
            "Operator (CAKE): Stop. Check quarterly revenue projections against the board deck.",
        );
        assert!(!verdict.passed);
        assert!(verdict.reason.contains("similarity"), "reason: {}", verdict.reason);
    }

    #[test]
    fn substituted_values_do_not_hurt_similarity() {
        // Same template, wildly different substitutions: both pass.
        let a = gate().validate(
            "Operator (CAKE): Stop. Check the import of 'requests' in 'main.py'. Try installing 'requests' before rerunning.",
        );
        let b = gate().validate(
            "Operator (CAKE): Stop. Check the import of 'very_unusual_pkg_name_42' in 'deep/nested/module.py'. Try installing 'very_unusual_pkg_name_42' before rerunning.",
        );
        assert!(a.passed && b.passed, "a: {} b: {}", a.reason, b.reason);
    }

    #[test]
    fn validation_is_deterministic() {
        let gate = gate();
        let text = "Operator (CAKE): Stop. Fix the failing test 'test_y' before any other change.";
        let first = gate.validate(text);
        let second = gate.validate(text);
        assert_eq!(first.passed, second.passed);
        assert!((first.score - second.score).abs() < f64::EPSILON);
    }

    // ========================================================================
    // Corpus handling
    // ========================================================================

    #[test]
    fn empty_corpus_rejected() {
        let err = VoiceGate::with_corpus("# only comments\n\n", &VoiceConfig::default());
        assert!(err.is_err());
    }

    #[test]
    fn custom_corpus_file_replaces_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.txt");
        std::fs::write(&path, "Operator (CAKE): Stop. Run the linter.\n").unwrap();
        let config = VoiceConfig {
            corpus_path: Some(path),
            ..VoiceConfig::default()
        };
        let gate = VoiceGate::from_config(&config).unwrap();
        let verdict = gate.validate("Operator (CAKE): Stop. Run the linter.");
        assert!(verdict.passed);
        // Built-in corpus entries no longer match.
        let other = gate.validate(
            "Operator (CAKE): Stop. Check the import of 'x' in 'y.py'. Try installing 'x' before rerunning.",
        );
        assert!(!other.passed);
    }

    // ========================================================================
    // Embedder
    // ========================================================================

    #[test]
    fn embedding_is_deterministic() {
        let embedder = TextEmbedder::default();
        assert_eq!(embedder.embed("stop and check"), embedder.embed("stop and check"));
    }

    #[test]
    fn identical_text_scores_one() {
        let embedder = TextEmbedder::default();
        let v = embedder.embed("operator message");
        assert!((cosine(&v, &v) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn unrelated_text_scores_low() {
        let embedder = TextEmbedder::default();
        let a = embedder.embed("operator (cake): stop. fix the import of <q>.");
        let b = embedder.embed("the quick brown fox jumps over the lazy dog repeatedly");
        assert!(cosine(&a, &b) < 0.5);
    }

    // ========================================================================
    // Sentence splitting
    // ========================================================================

    #[test]
    fn splits_on_terminal_punctuation_only() {
        let sentences = split_sentences("Stop. Check 'main.py' now. Fix it!");
        assert_eq!(sentences.len(), 3);
        assert_eq!(sentences[1], "Check 'main.py' now.");
    }

    #[test]
    fn unterminated_tail_counts_as_sentence() {
        let sentences = split_sentences("Stop. Fix the error");
        assert_eq!(sentences.len(), 2);
    }
}
