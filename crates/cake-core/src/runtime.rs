//! Supervisor runtime — init, run, shutdown.
//!
//! Owns the lifecycle of one supervised agent process:
//!
//! ```text
//! child stdout ─► reader task ─┐
//! child stderr ─► reader task ─┴─► EventQueue ─► Controller loop
//!                                                    │ interventions
//! child stdin  ◄── stdin forwarder ◄── ProcessAdapter┘
//!
//! maintenance ticks: follow-up polling, recall purge, snapshot GC,
//! config hot-reload poller
//! ```
//!
//! The controller loop is the single consumer; readers never block on it.
//! Shutdown begins when the child exits: readers hit EOF, flush, and close
//! the queue; the loop drains what is left and returns the child's exit
//! code.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::adapter::{AdapterRegistry, ProcessAdapter};
use crate::config::{ConfigHandle, DEFAULT_RELOAD_POLL};
use crate::controller::{Controller, EscalationNotice};
use crate::error::{Error, Result};
use crate::events::StreamSource;
use crate::monitor::{EventQueue, run_reader};
use crate::operator::OperatorEngine;
use crate::patterns::{PatternEngine, SharedPatterns};
use crate::recall::RecallStore;
use crate::snapshots::SnapshotManager;
use crate::voice::VoiceGate;

/// How often follow-up windows are polled.
const FOLLOWUP_POLL: Duration = Duration::from_secs(10);
/// How often expired recall records are purged.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);
/// How often snapshot GC runs.
const SNAPSHOT_GC_INTERVAL: Duration = Duration::from_secs(3600);

/// Run a supervised agent command to completion.
///
/// Returns the child's exit code. `config_path` enables hot reload when
/// set; `repo_root` is where snapshots are taken from (the agent's working
/// directory).
pub async fn run_supervised(
    config: ConfigHandle,
    command: &[String],
    repo_root: PathBuf,
    config_path: Option<PathBuf>,
) -> Result<i32> {
    let Some((program, args)) = command.split_first() else {
        return Err(Error::Runtime("no command to supervise".to_string()));
    };
    let snapshot_config = config.current();

    std::fs::create_dir_all(snapshot_config.data_dir())?;

    // Durable components.
    let recall = Arc::new(
        RecallStore::open(snapshot_config.recall_db_path(), snapshot_config.recall_ttl()).await?,
    );
    let snapshots = Arc::new(SnapshotManager::new(
        repo_root,
        snapshot_config.snapshot_dir(),
    ));

    // Voice gate and operator engine.
    let gate = VoiceGate::from_config(&snapshot_config.voice)?;
    let operator = OperatorEngine::new(gate);

    // Adapter: operator messages flow to the child's stdin.
    let (process_adapter, stdin_rx) = ProcessAdapter::channel(32);
    let mut registry = AdapterRegistry::new();
    registry.register(Arc::new(process_adapter));
    let adapters = Arc::new(registry);

    let (escalation_tx, escalation_rx) = mpsc::channel::<EscalationNotice>(16);
    let mut controller = Controller::new(
        config.clone(),
        Arc::clone(&recall),
        operator,
        Arc::clone(&adapters),
        Some(Arc::clone(&snapshots)),
        Some(escalation_tx),
    );

    // Monitor. The pattern set follows config hot reloads.
    let patterns = Arc::new(SharedPatterns::new(PatternEngine::with_user_rules(
        &snapshot_config.monitor.rules,
    )));
    let queue = Arc::new(EventQueue::new(snapshot_config.monitor.queue_capacity));
    {
        let patterns = Arc::clone(&patterns);
        let mut config_rx = config.subscribe();
        tokio::spawn(async move {
            while config_rx.changed().await.is_ok() {
                let rules = config_rx.borrow().monitor.rules.clone();
                patterns.swap(PatternEngine::with_user_rules(&rules));
                info!(user_rules = rules.len(), "pattern set reloaded");
            }
        });
    }

    // Child process.
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Runtime(format!("failed to spawn {program}: {e}")))?;
    info!(program = %program, "supervised agent started");

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Runtime("child stdout unavailable".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Runtime("child stderr unavailable".to_string()))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Runtime("child stdin unavailable".to_string()))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Config hot-reload poller.
    if let Some(path) = config_path {
        let poller_config = config.clone();
        let poller_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            poller_config
                .run_poller(path, DEFAULT_RELOAD_POLL, poller_shutdown)
                .await;
        });
    }

    // Stream readers; when both finish the queue closes and the controller
    // loop drains.
    let stdout_reader = tokio::spawn(run_reader(
        stdout,
        StreamSource::Stdout,
        Arc::clone(&patterns),
        Arc::clone(&queue),
    ));
    let stderr_reader = tokio::spawn(run_reader(
        stderr,
        StreamSource::Stderr,
        Arc::clone(&patterns),
        Arc::clone(&queue),
    ));
    {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            let _ = stdout_reader.await;
            let _ = stderr_reader.await;
            queue.close();
        });
    }

    // Interventions to child stdin.
    tokio::spawn(forward_stdin(stdin_rx, stdin));

    // Supervision loop.
    run_loop(
        &mut controller,
        &queue,
        &recall,
        &snapshots,
        &config,
        escalation_rx,
        shutdown_rx,
    )
    .await;

    let status = child
        .wait()
        .await
        .map_err(|e| Error::Runtime(format!("wait for child: {e}")))?;
    let _ = shutdown_tx.send(true);

    let code = status.code().unwrap_or(-1);
    info!(exit_code = code, "supervised agent exited");
    Ok(code)
}

async fn run_loop(
    controller: &mut Controller,
    queue: &Arc<EventQueue>,
    recall: &Arc<RecallStore>,
    snapshots: &Arc<SnapshotManager>,
    config: &ConfigHandle,
    mut escalation_rx: mpsc::Receiver<EscalationNotice>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut followup_tick = tokio::time::interval(FOLLOWUP_POLL);
    let mut purge_tick = tokio::time::interval(PURGE_INTERVAL);
    let mut gc_tick = tokio::time::interval(SNAPSHOT_GC_INTERVAL);
    followup_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    purge_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    gc_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            event = queue.pop() => {
                let Some(event) = event else {
                    // Streams closed and queue drained: resolve what can be
                    // resolved, then stop.
                    if let Err(e) = controller.poll_followups().await {
                        warn!(error = %e, "final follow-up poll failed");
                    }
                    break;
                };
                if let Err(e) = controller.handle_event(event).await {
                    error!(error = %e, "event handling failed");
                }
            }
            _ = followup_tick.tick() => {
                if let Err(e) = controller.poll_followups().await {
                    warn!(error = %e, "follow-up poll failed");
                }
            }
            _ = purge_tick.tick() => {
                if let Err(e) = recall.purge_expired().await {
                    warn!(error = %e, "recall purge failed");
                }
            }
            _ = gc_tick.tick() => {
                let snapshot_config = config.current();
                let pinned = controller.open_signatures().into_iter().collect();
                let retention = Duration::from_secs(snapshot_config.snapshot.retention_hours * 3600);
                let cap = snapshot_config.snapshot.max_size_gb * 1024 * 1024 * 1024;
                if let Err(e) = snapshots.gc(retention, cap, &pinned).await {
                    warn!(error = %e, "snapshot gc failed");
                }
            }
            Some(notice) = escalation_rx.recv() => {
                on_escalation(&config.current().data_dir(), &notice);
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

/// Surface an escalation: structured error log plus a durable notice file
/// carrying enough context to resume.
fn on_escalation(data_dir: &std::path::Path, notice: &EscalationNotice) {
    error!(
        state = %notice.state,
        reason = %notice.reason,
        signature = notice.signature.as_deref().unwrap_or("-"),
        "ESCALATION: human attention required"
    );
    match serde_json::to_string_pretty(notice) {
        Ok(payload) => {
            let path = data_dir.join("escalation.json");
            if let Err(e) = std::fs::write(&path, payload) {
                warn!(error = %e, "failed to persist escalation notice");
            }
        }
        Err(e) => warn!(error = %e, "failed to serialize escalation notice"),
    }
}

async fn forward_stdin(
    mut rx: mpsc::Receiver<String>,
    mut stdin: tokio::process::ChildStdin,
) {
    while let Some(message) = rx.recv().await {
        let mut payload = message;
        if !payload.ends_with('\n') {
            payload.push('\n');
        }
        if let Err(e) = stdin.write_all(payload.as_bytes()).await {
            warn!(error = %e, "stdin forward failed; adapter channel closing");
            break;
        }
        if let Err(e) = stdin.flush().await {
            warn!(error = %e, "stdin flush failed");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CakeConfig;
    use crate::events::ErrorKind;
    use crate::signature::{Signature, signature_of};

    fn test_config(dir: &std::path::Path) -> CakeConfig {
        CakeConfig {
            data_dir: Some(dir.join("state")),
            ..CakeConfig::default()
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn supervises_child_and_records_errors() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let recall_path = config.recall_db_path();
        let handle = ConfigHandle::new(config);

        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo \"ImportError: No module named 'requests'\" 1>&2; exit 0".to_string(),
        ];
        let code = run_supervised(handle, &command, dir.path().to_path_buf(), None)
            .await
            .unwrap();
        assert_eq!(code, 0);

        // The event must have landed in the durable recall store.
        let store = RecallStore::open(recall_path, Duration::from_secs(3600))
            .await
            .unwrap();
        let event = crate::events::ErrorEvent::new(
            ErrorKind::ImportMissing,
            StreamSource::Stderr,
            "ImportError: No module named 'requests'",
            0,
        );
        let sig: Signature = signature_of(&event);
        let record = store.lookup(&sig).await.unwrap().unwrap();
        assert_eq!(record.occurrence_count, 1);
        assert_eq!(record.intervention_count, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn child_exit_code_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let handle = ConfigHandle::new(test_config(dir.path()));
        let command = vec!["sh".to_string(), "-c".to_string(), "exit 7".to_string()];
        let code = run_supervised(handle, &command, dir.path().to_path_buf(), None)
            .await
            .unwrap();
        assert_eq!(code, 7);
    }

    #[tokio::test]
    async fn empty_command_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let handle = ConfigHandle::new(test_config(dir.path()));
        let err = run_supervised(handle, &[], dir.path().to_path_buf(), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no command"));
    }
}
