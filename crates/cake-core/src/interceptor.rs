//! Command interceptor — synchronous policy engine for shell commands the
//! supervised agent wants to run.
//!
//! # Architecture
//!
//! ```text
//! Command text
//!      │
//!      ▼
//! Quick Reject (Aho-Corasick keyword scan, O(n))
//!      │ keyword hit
//!      ▼
//! Safe Patterns (whitelist, checked first)
//!      │ no safe match
//!      ▼
//! Blocked rules → Confirmation rules → Default allow
//! ```
//!
//! First match wins. Every call produces exactly one [`CommandDecision`]
//! and exactly one audit entry, regardless of outcome. The engine is
//! fail-closed: rule-evaluation errors and budget exceedance both block
//! with reason "policy engine error".
//!
//! # Performance
//!
//! Quick reject exits benign commands after one automaton pass; the full
//! scan is a handful of regexes. The 50 ms decide budget is enforced with a
//! deadline check between rule categories.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use aho_corasick::AhoCorasick;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::audit::{AuditEntry, AuditLog};
use crate::config::SafetyConfig;
use crate::degradation::{self, Subsystem};
use crate::metrics::metrics;

/// Hard decide budget; exceeding it fails closed.
pub const DECIDE_BUDGET: Duration = Duration::from_millis(50);

/// Commands are truncated to this length in audit entries.
const AUDIT_COMMAND_MAX: usize = 512;

// =============================================================================
// Request / decision
// =============================================================================

/// A command the adapter intercepted before execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub cwd: PathBuf,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl CommandRequest {
    /// Build a request from a full shell line.
    #[must_use]
    pub fn from_line(line: &str, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command: line.to_string(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: HashMap::new(),
        }
    }

    fn full_line(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

/// Outcome of policy evaluation for one command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Allowed substitute command (e.g. leased force push).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alternative: Option<String>,
    pub require_confirmation: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
}

impl CommandDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            alternative: None,
            require_confirmation: false,
            rule_id: None,
        }
    }

    fn block(rule_id: impl Into<String>, reason: impl Into<String>, alternative: Option<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            alternative,
            require_confirmation: false,
            rule_id: Some(rule_id.into()),
        }
    }

    fn confirm(rule_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            alternative: None,
            require_confirmation: true,
            rule_id: Some(rule_id.into()),
        }
    }

    fn audit_label(&self) -> &'static str {
        if self.allowed {
            "allow"
        } else if self.require_confirmation {
            "confirm"
        } else {
            "block"
        }
    }
}

/// How strictly the interceptor should treat borderline commands.
///
/// The controller maps its state onto this: while recovering or escalating,
/// confirmation-required commands are blocked outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisionMode {
    #[default]
    Normal,
    Strict,
}

// =============================================================================
// Built-in rules
// =============================================================================

type AlternativeFn = fn(&str) -> Option<String>;

struct BlockedRule {
    id: &'static str,
    pattern: &'static LazyLock<Regex>,
    /// Whitelist checked before the rule fires (e.g. leased force push).
    safe_pattern: Option<&'static LazyLock<Regex>>,
    reason: &'static str,
    alternative: Option<AlternativeFn>,
    /// Config allowlist that exempts matches of this rule.
    elevated_exempt: bool,
}

struct ConfirmRule {
    id: &'static str,
    pattern: &'static LazyLock<Regex>,
    reason: &'static str,
}

static GIT_PUSH_FORCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bgit\s+push\b.*(\s--force\b|\s-f\b)").expect("valid built-in pattern"));
static GIT_PUSH_FORCE_LEASE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bgit\s+push\b.*--force-with-lease\b").expect("valid built-in pattern"));
static RM_RF_ROOT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\brm\s+(-[a-z]*r[a-z]*\s+(-[a-z]*f[a-z]*\s+)?|-[a-z]*f[a-z]*\s+(-[a-z]*r[a-z]*\s+)?)\s*(/\s*$|~\s*$|\$HOME\s*$)").expect("valid built-in pattern")
});
static DOCKER_PRIVILEGED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bdocker\s+run\b.*--privileged\b").expect("valid built-in pattern"));
static CHMOD_WORLD_WRITABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bchmod\b.*\b(777|666|000|[ao]\+w)\b").expect("valid built-in pattern")
});
static ELEVATED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(sudo|doas)\b").expect("valid built-in pattern"));

static PKG_INSTALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(pip3?|npm|yarn|pnpm|cargo|apt(?:-get)?|brew|gem)\s+(install|add)\b")
        .expect("valid built-in pattern")
});
static GIT_REMOTE_DELETE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bgit\s+push\b.*(--delete\b|\s+:\S+)").expect("valid built-in pattern")
});
static GIT_REMOTE_MUTATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bgit\s+remote\s+(add|remove|rm|set-url)\b").expect("valid built-in pattern")
});

fn leased_force_push(command: &str) -> Option<String> {
    if command.contains("--force-with-lease") {
        return None;
    }
    let replaced = command
        .replace(" --force", " --force-with-lease")
        .replace(" -f ", " --force-with-lease ");
    let replaced = if replaced.ends_with(" -f") {
        format!("{}--force-with-lease", &replaced[..replaced.len() - 2])
    } else {
        replaced
    };
    (replaced != command).then_some(replaced)
}

static BLOCKED_RULES: &[BlockedRule] = &[
    BlockedRule {
        id: "core.git:push-force",
        pattern: &GIT_PUSH_FORCE,
        safe_pattern: Some(&GIT_PUSH_FORCE_LEASE),
        reason: "force push rewrites remote history",
        alternative: Some(leased_force_push),
        elevated_exempt: false,
    },
    BlockedRule {
        id: "core.filesystem:rm-rf-root",
        pattern: &RM_RF_ROOT,
        safe_pattern: None,
        reason: "recursive deletion of root/home is unrecoverable",
        alternative: None,
        elevated_exempt: false,
    },
    BlockedRule {
        id: "core.containers:privileged",
        pattern: &DOCKER_PRIVILEGED,
        safe_pattern: None,
        reason: "privileged containers bypass isolation",
        alternative: None,
        elevated_exempt: false,
    },
    BlockedRule {
        id: "core.filesystem:world-writable",
        pattern: &CHMOD_WORLD_WRITABLE,
        safe_pattern: None,
        reason: "world-writable permission change",
        alternative: None,
        elevated_exempt: false,
    },
    BlockedRule {
        id: "core.system:elevated",
        pattern: &ELEVATED,
        safe_pattern: None,
        reason: "elevated-privilege invocation is not whitelisted",
        alternative: None,
        elevated_exempt: true,
    },
];

static CONFIRM_RULES: &[ConfirmRule] = &[
    ConfirmRule {
        id: "core.packages:install",
        pattern: &PKG_INSTALL,
        reason: "package installation changes the environment",
    },
    ConfirmRule {
        id: "core.git:remote-delete",
        pattern: &GIT_REMOTE_DELETE,
        reason: "deleting remote branches affects collaborators",
    },
    ConfirmRule {
        id: "core.git:remote-mutate",
        pattern: &GIT_REMOTE_MUTATE,
        reason: "changing remotes affects where work is pushed",
    },
];

/// Keywords gating the rule scan; anything else is allowed on the fast path.
static KEYWORD_AUTOMATON: LazyLock<AhoCorasick> = LazyLock::new(|| {
    AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .build([
            "git", "rm", "docker", "chmod", "sudo", "doas", "pip", "npm", "yarn", "pnpm",
            "cargo", "apt", "brew", "gem",
        ])
        .expect("valid Aho-Corasick patterns")
});

// =============================================================================
// Compiled config rules
// =============================================================================

struct UserPattern {
    id: String,
    pattern: Regex,
}

fn compile_user_patterns(kind: &str, patterns: &[String]) -> Vec<UserPattern> {
    let mut compiled = Vec::with_capacity(patterns.len());
    let mut skipped = 0usize;
    for (i, raw) in patterns.iter().enumerate() {
        match Regex::new(raw) {
            Ok(pattern) => compiled.push(UserPattern {
                id: format!("config.{kind}:{i}"),
                pattern,
            }),
            Err(e) => {
                error!(kind, pattern = %raw, error = %e, "config pattern failed to compile; skipping rule");
                skipped += 1;
            }
        }
    }
    if skipped > 0 {
        degradation::enter_degraded(
            Subsystem::PatternEngine,
            format!("{skipped} config {kind} pattern(s) skipped"),
        );
    }
    compiled
}

// =============================================================================
// Interceptor
// =============================================================================

/// The policy engine. Rules are compiled once per config snapshot.
pub struct CommandInterceptor {
    audit: AuditLog,
    user_blocked: Vec<UserPattern>,
    user_confirm: Vec<UserPattern>,
    allow_elevated: Vec<UserPattern>,
}

impl CommandInterceptor {
    /// Build the interceptor from a config snapshot and an open audit log.
    #[must_use]
    pub fn new(safety: &SafetyConfig, audit: AuditLog) -> Self {
        Self {
            audit,
            user_blocked: compile_user_patterns("blocked", &safety.blocked_commands),
            user_confirm: compile_user_patterns("confirm", &safety.require_confirmation),
            allow_elevated: compile_user_patterns("allow_elevated", &safety.allow_elevated),
        }
    }

    /// Decide whether a command may run. Synchronous; 50 ms hard budget.
    ///
    /// Exactly one audit entry is written per call.
    #[must_use]
    pub fn decide(&self, request: &CommandRequest, mode: SupervisionMode) -> CommandDecision {
        let started = Instant::now();
        let line = request.full_line();

        let mut decision = self.evaluate(&line, mode, started);

        // Budget check: a pathological rule set fails closed. A decision
        // that is already a hard block stands.
        if started.elapsed() > DECIDE_BUDGET && (decision.allowed || decision.require_confirmation)
        {
            warn!(elapsed_ms = started.elapsed().as_millis() as u64, "decide exceeded budget; failing closed");
            decision = CommandDecision::block("core.engine:budget", "policy engine error", None);
        }

        let eval_us = started.elapsed().as_micros() as u64;
        self.record_audit(request, &line, &decision, eval_us);

        metrics().observe(
            "response_latency_seconds",
            &[("component", "interceptor"), ("operation", "decide")],
            started.elapsed().as_secs_f64(),
        );
        if !decision.allowed && !decision.require_confirmation {
            metrics().inc_counter(
                "commands_blocked_total",
                &[("rule", decision.rule_id.as_deref().unwrap_or("unknown"))],
            );
        }

        decision
    }

    fn evaluate(&self, line: &str, mode: SupervisionMode, started: Instant) -> CommandDecision {
        if line.trim().is_empty() {
            return CommandDecision::allow();
        }

        // User-configured blocked patterns run before the quick reject:
        // their keywords are not in the automaton.
        for rule in &self.user_blocked {
            if rule.pattern.is_match(line) {
                return CommandDecision::block(rule.id.clone(), "blocked by configured policy", None);
            }
        }

        let keyword_hit = KEYWORD_AUTOMATON.is_match(line);
        if keyword_hit {
            for rule in BLOCKED_RULES {
                if started.elapsed() > DECIDE_BUDGET {
                    return CommandDecision::block("core.engine:budget", "policy engine error", None);
                }
                if !rule.pattern.is_match(line) {
                    continue;
                }
                // Safe pattern exempts only this rule; the rest of the
                // scan still applies to the full command line.
                if rule.safe_pattern.is_some_and(|safe| safe.is_match(line)) {
                    continue;
                }
                if rule.elevated_exempt
                    && self.allow_elevated.iter().any(|a| a.pattern.is_match(line))
                {
                    continue;
                }
                let alternative = rule.alternative.and_then(|f| f(line));
                return CommandDecision::block(rule.id, rule.reason, alternative);
            }

            for rule in CONFIRM_RULES {
                if rule.pattern.is_match(line) {
                    return confirm_or_block(rule.id, rule.reason, mode);
                }
            }
        }

        for rule in &self.user_confirm {
            if rule.pattern.is_match(line) {
                return confirm_or_block(&rule.id, "confirmation required by configured policy", mode);
            }
        }

        CommandDecision::allow()
    }

    fn record_audit(
        &self,
        request: &CommandRequest,
        line: &str,
        decision: &CommandDecision,
        eval_us: u64,
    ) {
        let command = if line.len() > AUDIT_COMMAND_MAX {
            let mut truncated = line
                .chars()
                .take(AUDIT_COMMAND_MAX - 3)
                .collect::<String>();
            truncated.push_str("...");
            truncated
        } else {
            line.to_string()
        };
        let entry = AuditEntry {
            timestamp: chrono::Utc::now(),
            command,
            cwd: Some(request.cwd.display().to_string()),
            decision: decision.audit_label().to_string(),
            rule_id: decision.rule_id.clone(),
            reason: decision.reason.clone(),
            alternative: decision.alternative.clone(),
            eval_us,
        };
        if let Err(e) = self.audit.append(&entry) {
            error!(error = %e, "audit append failed");
        }
    }

    /// The audit log path (for readers).
    #[must_use]
    pub fn audit_path(&self) -> &std::path::Path {
        self.audit.path()
    }
}

fn confirm_or_block(
    rule_id: &str,
    reason: &str,
    mode: SupervisionMode,
) -> CommandDecision {
    match mode {
        SupervisionMode::Normal => CommandDecision::confirm(rule_id, reason),
        // While recovering/escalating nothing borderline runs.
        SupervisionMode::Strict => CommandDecision::block(
            rule_id,
            format!("{reason} (blocked while supervisor is recovering)"),
            None,
        ),
    }
}
