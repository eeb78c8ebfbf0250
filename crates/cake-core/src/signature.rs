//! Stable error signatures for repeat detection.
//!
//! Two events that differ only in line numbers or in the specific quoted
//! name inside the message ("No module named 'X'") must hash to the same
//! signature. Normalization therefore collapses:
//!
//! - the kind to its lowercase tag,
//! - the path to its basename,
//! - decimal runs in the message to a `<n>` placeholder,
//! - quoted literals (single, double, or backticked) to a `<q>` placeholder.
//!
//! The digest is SHA-256 over `tag \n basename \n normalized-remainder`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::events::ErrorEvent;

/// 256-bit signature, rendered and stored as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(String);

impl Signature {
    /// Wrap an already-hex signature (e.g. read back from the store).
    #[must_use]
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    #[must_use]
    pub fn as_hex(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the stable signature for an event.
#[must_use]
pub fn signature_of(event: &ErrorEvent) -> Signature {
    let basename = event
        .path
        .as_deref()
        .map(path_basename)
        .unwrap_or_default();
    let remainder = normalize_message(&event.raw);

    let mut hasher = Sha256::new();
    hasher.update(event.kind.tag().as_bytes());
    hasher.update(b"\n");
    hasher.update(basename.as_bytes());
    hasher.update(b"\n");
    hasher.update(remainder.as_bytes());
    Signature(hex::encode(hasher.finalize()))
}

/// The normalized semantic remainder of a message.
///
/// Lowercased, quoted literals and decimal runs replaced with placeholders,
/// whitespace collapsed. This is what `similar()` token-matches on.
#[must_use]
pub fn normalize_message(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    let mut last_was_space = true;

    while let Some(ch) = chars.next() {
        match ch {
            '\'' | '"' | '`' => {
                // Consume through the matching close quote; unterminated
                // quotes swallow the rest of the line.
                let close = ch;
                for inner in chars.by_ref() {
                    if inner == close {
                        break;
                    }
                }
                out.push_str("<q>");
                last_was_space = false;
            }
            c if c.is_ascii_digit() => {
                while chars.peek().is_some_and(|c| c.is_ascii_digit() || *c == '.') {
                    chars.next();
                }
                out.push_str("<n>");
                last_was_space = false;
            }
            c if c.is_whitespace() => {
                if !last_was_space {
                    out.push(' ');
                    last_was_space = true;
                }
            }
            c => {
                for lower in c.to_lowercase() {
                    out.push(lower);
                }
                last_was_space = false;
            }
        }
    }

    out.trim().to_string()
}

/// Final path component, tolerant of both separators.
#[must_use]
pub fn path_basename(path: &str) -> String {
    path.rsplit(['/', '\\'])
        .next()
        .unwrap_or(path)
        .to_string()
}

/// Token set over a normalized remainder, for fuzzy sibling lookup.
#[must_use]
pub fn token_set(normalized: &str) -> BTreeSet<String> {
    normalized
        .split(|c: char| !c.is_alphanumeric() && c != '<' && c != '>')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Jaccard overlap of two token sets, in [0, 1].
#[must_use]
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}
