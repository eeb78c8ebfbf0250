//! Adapter boundary — how operator messages reach the supervised LLM host.
//!
//! An [`Adapter`] delivers messages into the host session and reports its
//! own health. The [`AdapterRegistry`] holds the registered adapters in
//! failover order, enforces the 100 ms inject budget, and dispatches
//! lifecycle hooks:
//!
//! - `pre_execute` runs before any intercepted command executes and receives
//!   the policy decision; a hook error vetoes execution.
//! - `post_execute` runs after execution.
//! - `error` surfaces supervised-agent failures to observers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::degradation::{self, Subsystem};
use crate::error::{AdapterError, Result};
use crate::interceptor::{CommandDecision, CommandInterceptor, CommandRequest, SupervisionMode};
use crate::metrics::metrics;

/// Injection must complete within this budget per adapter.
pub const INJECT_BUDGET: Duration = Duration::from_millis(100);

// =============================================================================
// Trait
// =============================================================================

/// Context delivered alongside an operator message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InjectContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub strike: u32,
    pub template_id: String,
}

/// Adapter self-report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterHealth {
    pub healthy: bool,
    pub latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// The LLM-host boundary.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Stable adapter name for logs and health output.
    fn name(&self) -> &str;

    /// Deliver an operator message into the host session.
    async fn inject(&self, message: &str, context: &InjectContext) -> Result<()>;

    /// Health probe.
    async fn health(&self) -> AdapterHealth;
}

// =============================================================================
// Hooks
// =============================================================================

/// Lifecycle events observable through hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    PreExecute,
    PostExecute,
    Error,
}

/// Payload handed to hook callbacks.
#[derive(Debug, Clone)]
pub struct HookPayload {
    pub event: HookEvent,
    pub command: Option<CommandRequest>,
    /// Present for `pre_execute`: the interceptor's decision.
    pub decision: Option<CommandDecision>,
    pub error: Option<String>,
}

/// Hook callback; returning an error from `pre_execute` vetoes execution.
pub type HookCallback = Box<dyn Fn(&HookPayload) -> Result<()> + Send + Sync>;

// =============================================================================
// Registry
// =============================================================================

/// Registered adapters in failover order, plus hook dispatch.
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn Adapter>>,
    hooks: StdMutex<HashMap<HookEvent, Vec<HookCallback>>>,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            adapters: Vec::new(),
            hooks: StdMutex::new(HashMap::new()),
        }
    }

    /// Append an adapter; earlier adapters are tried first.
    pub fn register(&mut self, adapter: Arc<dyn Adapter>) {
        self.adapters.push(adapter);
    }

    #[must_use]
    pub fn adapter_count(&self) -> usize {
        self.adapters.len()
    }

    /// Register a hook callback for an event.
    pub fn register_hook(&self, event: HookEvent, callback: HookCallback) {
        self.hooks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(event)
            .or_default()
            .push(callback);
    }

    /// Inject through the first adapter that succeeds within budget.
    ///
    /// Failover walks the remaining adapters in order; when every adapter
    /// fails the caller escalates.
    pub async fn inject(&self, message: &str, context: &InjectContext) -> Result<()> {
        if self.adapters.is_empty() {
            return Err(AdapterError::AllFailed("no adapters registered".into()).into());
        }

        let started = Instant::now();
        let mut last_error = String::new();

        for adapter in &self.adapters {
            let attempt = tokio::time::timeout(INJECT_BUDGET, adapter.inject(message, context));
            match attempt.await {
                Ok(Ok(())) => {
                    metrics().observe(
                        "response_latency_seconds",
                        &[("component", "adapter"), ("operation", "inject")],
                        started.elapsed().as_secs_f64(),
                    );
                    degradation::recover(Subsystem::Adapter);
                    debug!(adapter = adapter.name(), "intervention injected");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    warn!(adapter = adapter.name(), error = %e, "inject failed; trying next adapter");
                    last_error = e.to_string();
                }
                Err(_) => {
                    warn!(adapter = adapter.name(), budget_ms = INJECT_BUDGET.as_millis() as u64, "inject timed out; trying next adapter");
                    last_error = AdapterError::InjectTimeout(INJECT_BUDGET.as_millis() as u64)
                        .to_string();
                }
            }
        }

        degradation::enter_degraded(Subsystem::Adapter, last_error.clone());
        Err(AdapterError::AllFailed(last_error).into())
    }

    /// The full pre-execution path host adapters call for every command
    /// attempt: policy decision first, then `pre_execute` hooks with that
    /// decision. A hook error (or the returned decision) prevents
    /// execution.
    pub fn gate_command(
        &self,
        interceptor: &CommandInterceptor,
        request: &CommandRequest,
        mode: SupervisionMode,
    ) -> Result<CommandDecision> {
        let decision = interceptor.decide(request, mode);
        self.dispatch_pre_execute(request, &decision)?;
        Ok(decision)
    }

    /// Run `pre_execute` hooks; the first error vetoes execution.
    pub fn dispatch_pre_execute(
        &self,
        command: &CommandRequest,
        decision: &CommandDecision,
    ) -> Result<()> {
        let payload = HookPayload {
            event: HookEvent::PreExecute,
            command: Some(command.clone()),
            decision: Some(decision.clone()),
            error: None,
        };
        let hooks = self
            .hooks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for callback in hooks.get(&HookEvent::PreExecute).into_iter().flatten() {
            callback(&payload).map_err(|e| AdapterError::Vetoed(e.to_string()))?;
        }
        Ok(())
    }

    /// Run `post_execute` hooks; errors are logged, never propagated.
    pub fn dispatch_post_execute(&self, command: &CommandRequest) {
        let payload = HookPayload {
            event: HookEvent::PostExecute,
            command: Some(command.clone()),
            decision: None,
            error: None,
        };
        self.dispatch_infallible(HookEvent::PostExecute, &payload);
    }

    /// Run `error` hooks; errors are logged, never propagated.
    pub fn dispatch_error(&self, error: &str) {
        let payload = HookPayload {
            event: HookEvent::Error,
            command: None,
            decision: None,
            error: Some(error.to_string()),
        };
        self.dispatch_infallible(HookEvent::Error, &payload);
    }

    fn dispatch_infallible(&self, event: HookEvent, payload: &HookPayload) {
        let hooks = self
            .hooks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for callback in hooks.get(&event).into_iter().flatten() {
            if let Err(e) = callback(payload) {
                warn!(event = ?event, error = %e, "hook callback failed");
            }
        }
    }

    /// Health of every registered adapter, in registration order.
    pub async fn health(&self) -> Vec<(String, AdapterHealth)> {
        let mut reports = Vec::with_capacity(self.adapters.len());
        for adapter in &self.adapters {
            reports.push((adapter.name().to_string(), adapter.health().await));
        }
        reports
    }
}

// =============================================================================
// Implementations
// =============================================================================

/// Delivers operator messages to the supervised process's stdin via a
/// channel the runtime drains.
pub struct ProcessAdapter {
    tx: mpsc::Sender<String>,
    last_error: StdMutex<Option<String>>,
}

impl ProcessAdapter {
    /// Returns the adapter and the receiver the runtime forwards to the
    /// child process's stdin.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                last_error: StdMutex::new(None),
            },
            rx,
        )
    }
}

#[async_trait]
impl Adapter for ProcessAdapter {
    fn name(&self) -> &str {
        "process"
    }

    async fn inject(&self, message: &str, _context: &InjectContext) -> Result<()> {
        let started = Instant::now();
        let result = self.tx.send(message.to_string()).await.map_err(|_| {
            AdapterError::InjectFailed {
                adapter: "process".to_string(),
                cause: "stdin channel closed".to_string(),
            }
        });
        let mut last_error = self
            .last_error
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match result {
            Ok(()) => {
                *last_error = None;
                debug!(elapsed_us = started.elapsed().as_micros() as u64, "message queued for stdin");
                Ok(())
            }
            Err(e) => {
                *last_error = Some(e.to_string());
                Err(e.into())
            }
        }
    }

    async fn health(&self) -> AdapterHealth {
        let last_error = self
            .last_error
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        AdapterHealth {
            healthy: !self.tx.is_closed(),
            latency_ms: 0.0,
            last_error,
        }
    }
}

/// Records injections without delivering them; tests and dry runs.
#[derive(Default)]
pub struct NullAdapter {
    injected: StdMutex<Vec<String>>,
    fail: bool,
}

impl NullAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An adapter whose injections always fail (failover tests).
    #[must_use]
    pub fn failing() -> Self {
        Self {
            injected: StdMutex::new(Vec::new()),
            fail: true,
        }
    }

    /// Messages injected so far.
    #[must_use]
    pub fn injected(&self) -> Vec<String> {
        self.injected
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Adapter for NullAdapter {
    fn name(&self) -> &str {
        "null"
    }

    async fn inject(&self, message: &str, _context: &InjectContext) -> Result<()> {
        if self.fail {
            return Err(AdapterError::InjectFailed {
                adapter: "null".to_string(),
                cause: "configured to fail".to_string(),
            }
            .into());
        }
        self.injected
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(message.to_string());
        Ok(())
    }

    async fn health(&self) -> AdapterHealth {
        AdapterHealth {
            healthy: !self.fail,
            latency_ms: 0.0,
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> InjectContext {
        InjectContext {
            signature: Some("abc123".to_string()),
            kind: Some("import_missing".to_string()),
            strike: 1,
            template_id: "import_missing.l1".to_string(),
        }
    }

    // ========================================================================
    // Injection and failover
    // ========================================================================

    #[tokio::test]
    async fn injects_through_first_healthy_adapter() {
        let adapter = Arc::new(NullAdapter::new());
        let mut registry = AdapterRegistry::new();
        registry.register(adapter.clone());

        registry.inject("Operator (CAKE): Stop.", &ctx()).await.unwrap();
        assert_eq!(adapter.injected(), vec!["Operator (CAKE): Stop."]);
    }

    #[tokio::test]
    async fn fails_over_to_next_adapter() {
        let failing = Arc::new(NullAdapter::failing());
        let working = Arc::new(NullAdapter::new());
        let mut registry = AdapterRegistry::new();
        registry.register(failing);
        registry.register(working.clone());

        registry.inject("msg", &ctx()).await.unwrap();
        assert_eq!(working.injected(), vec!["msg"]);
    }

    #[tokio::test]
    async fn all_adapters_failing_errors() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(NullAdapter::failing()));
        registry.register(Arc::new(NullAdapter::failing()));

        let err = registry.inject("msg", &ctx()).await.unwrap_err();
        assert!(err.to_string().contains("all adapters failed"));
    }

    #[tokio::test]
    async fn empty_registry_errors() {
        let registry = AdapterRegistry::new();
        assert!(registry.inject("msg", &ctx()).await.is_err());
    }

    struct SlowAdapter;

    #[async_trait]
    impl Adapter for SlowAdapter {
        fn name(&self) -> &str {
            "slow"
        }
        async fn inject(&self, _message: &str, _context: &InjectContext) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        }
        async fn health(&self) -> AdapterHealth {
            AdapterHealth {
                healthy: true,
                latency_ms: 10_000.0,
                last_error: None,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_adapter_times_out_and_fails_over() {
        let working = Arc::new(NullAdapter::new());
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(SlowAdapter));
        registry.register(working.clone());

        registry.inject("msg", &ctx()).await.unwrap();
        assert_eq!(working.injected(), vec!["msg"]);
    }

    // ========================================================================
    // Hooks
    // ========================================================================

    #[test]
    fn pre_execute_veto_prevents_execution() {
        let registry = AdapterRegistry::new();
        registry.register_hook(
            HookEvent::PreExecute,
            Box::new(|payload| {
                let decision = payload.decision.as_ref().unwrap();
                if decision.allowed {
                    Ok(())
                } else {
                    Err(crate::error::Error::Runtime("blocked".to_string()))
                }
            }),
        );

        let request = CommandRequest::from_line("git push --force", "/repo");
        let blocked = CommandDecision {
            allowed: false,
            reason: Some("force push".to_string()),
            alternative: None,
            require_confirmation: false,
            rule_id: Some("core.git:push-force".to_string()),
        };
        assert!(registry.dispatch_pre_execute(&request, &blocked).is_err());

        let allowed = CommandDecision {
            allowed: true,
            reason: None,
            alternative: None,
            require_confirmation: false,
            rule_id: None,
        };
        assert!(registry.dispatch_pre_execute(&request, &allowed).is_ok());
    }

    #[tokio::test]
    async fn gate_command_runs_decision_through_hooks() {
        let dir = tempfile::tempdir().unwrap();
        let audit = crate::audit::AuditLog::open(dir.path().join("audit.log")).unwrap();
        let interceptor =
            CommandInterceptor::new(&crate::config::SafetyConfig::default(), audit);

        let registry = AdapterRegistry::new();
        registry.register_hook(
            HookEvent::PreExecute,
            Box::new(|payload| {
                let decision = payload.decision.as_ref().unwrap();
                if decision.allowed {
                    Ok(())
                } else {
                    Err(crate::error::Error::Runtime("vetoed".to_string()))
                }
            }),
        );

        let allowed = registry
            .gate_command(
                &interceptor,
                &CommandRequest::from_line("ls -la", "/repo"),
                SupervisionMode::Normal,
            )
            .unwrap();
        assert!(allowed.allowed);

        let err = registry
            .gate_command(
                &interceptor,
                &CommandRequest::from_line("git push --force", "/repo"),
                SupervisionMode::Normal,
            )
            .unwrap_err();
        assert!(err.to_string().contains("vetoed"));
    }

    #[test]
    fn post_execute_errors_do_not_propagate() {
        let registry = AdapterRegistry::new();
        registry.register_hook(
            HookEvent::PostExecute,
            Box::new(|_| Err(crate::error::Error::Runtime("oops".to_string()))),
        );
        // Must not panic or return an error.
        registry.dispatch_post_execute(&CommandRequest::from_line("ls", "/"));
    }

    // ========================================================================
    // Process adapter
    // ========================================================================

    #[tokio::test]
    async fn process_adapter_queues_to_channel() {
        let (adapter, mut rx) = ProcessAdapter::channel(8);
        adapter.inject("Operator (CAKE): Stop.", &ctx()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "Operator (CAKE): Stop.");
        assert!(adapter.health().await.healthy);
    }

    #[tokio::test]
    async fn process_adapter_reports_closed_channel() {
        let (adapter, rx) = ProcessAdapter::channel(1);
        drop(rx);
        assert!(adapter.inject("msg", &ctx()).await.is_err());
        let health = adapter.health().await;
        assert!(!health.healthy);
        assert!(health.last_error.is_some());
    }
}
