//! Recall store — TTL-bounded persistent memory of error signatures.
//!
//! # Architecture
//!
//! ```text
//! Controller
//!   │ record / lookup / similar / mark_* / purge_expired
//!   ▼
//! RecallStore ── healthy ──► SQLite (WAL, spawn_blocking, single writer)
//!      │
//!      └────── degraded ──► in-memory map + ordered pending ops
//!                               │ reconnect succeeds
//!                               ▼
//!                           pending ops replayed FIFO into SQLite
//! ```
//!
//! Writes go through a single writer lock held for one upsert; readers open
//! their own connections and never contend with the writer beyond SQLite's
//! WAL semantics. Lookup is a primary-key hit and stays comfortably inside
//! the 10 ms budget at 10k records.
//!
//! Counter ordering (success <= intervention <= occurrence) is enforced in
//! the SQL itself, so a crashed controller can never persist a violation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::degradation::{self, Subsystem};
use crate::error::{RecallError, Result};
use crate::events::ErrorKind;
use crate::metrics::metrics;
use crate::retry::{RetryPolicy, with_retry};
use crate::signature::{Signature, jaccard, token_set};

/// TTL applied once a signature has recurred this many times.
const EXTENDED_TTL_OCCURRENCES: u64 = 5;
const EXTENDED_TTL: Duration = Duration::from_secs(72 * 3600);

/// Default fuzzy-match threshold for [`RecallStore::similar`].
pub const SIMILAR_THRESHOLD: f64 = 0.85;

// =============================================================================
// Record
// =============================================================================

/// One persistent signature history row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallRecord {
    pub signature: Signature,
    pub kind: ErrorKind,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub occurrence_count: u64,
    pub intervention_count: u64,
    pub success_count: u64,
    pub last_intervention_text: Option<String>,
    pub last_intervention_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    /// Normalized message remainder, the basis for fuzzy sibling lookup.
    pub normalized: String,
}

/// Store-level summary for status output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallStats {
    pub active_records: u64,
    pub expired_records: u64,
    pub degraded: bool,
}

/// A write queued while the backing store is unavailable.
///
/// Replayed in order on reconnect, preserving per-signature total ordering.
#[derive(Debug, Clone)]
enum PendingOp {
    Record {
        signature: Signature,
        kind: ErrorKind,
        normalized: String,
        at: DateTime<Utc>,
    },
    MarkIntervention {
        signature: Signature,
        text: String,
        at: DateTime<Utc>,
    },
    MarkOutcome {
        signature: Signature,
        success: bool,
    },
}

// =============================================================================
// Store
// =============================================================================

/// TTL'd persistent map from error signature to history.
pub struct RecallStore {
    db_path: PathBuf,
    ttl: Duration,
    retry: RetryPolicy,
    /// Serializes writers; held for exactly one upsert.
    writer: Mutex<()>,
    degraded: AtomicBool,
    /// Fallback state while degraded.
    memory: StdMutex<HashMap<Signature, RecallRecord>>,
    pending: StdMutex<Vec<PendingOp>>,
}

impl RecallStore {
    /// Open (or create) the store at `path`.
    ///
    /// If the database cannot be opened the store starts directly in
    /// degraded in-memory mode rather than failing.
    pub async fn open(path: impl Into<PathBuf>, ttl: Duration) -> Result<Self> {
        let db_path = path.into();
        let store = Self {
            db_path: db_path.clone(),
            ttl,
            retry: RetryPolicy::recall_write(),
            writer: Mutex::new(()),
            degraded: AtomicBool::new(false),
            memory: StdMutex::new(HashMap::new()),
            pending: StdMutex::new(Vec::new()),
        };

        let init = tokio::task::spawn_blocking(move || init_schema(&db_path))
            .await
            .map_err(|e| RecallError::TaskJoin(e.to_string()))?;

        match init {
            Ok(()) => {
                metrics().set_gauge("db_connections_active", &[], 1.0);
                metrics().set_gauge("recall_degraded_mode", &[], 0.0);
            }
            Err(e) => {
                warn!(error = %e, path = %store.db_path.display(), "recall store unavailable; starting in-memory");
                store.enter_degraded(&e.to_string());
            }
        }
        Ok(store)
    }

    /// Whether the store is running on the in-memory fallback.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Upsert an occurrence of `signature`: bumps occurrence count, updates
    /// last-seen, refreshes the TTL. Returns the record after the write.
    pub async fn record(
        &self,
        signature: &Signature,
        kind: ErrorKind,
        normalized: &str,
    ) -> Result<RecallRecord> {
        let at = Utc::now();
        let op = PendingOp::Record {
            signature: signature.clone(),
            kind,
            normalized: normalized.to_string(),
            at,
        };
        self.write(op).await?;
        self.lookup_any(signature)
            .await?
            .ok_or_else(|| RecallError::Database("record vanished after upsert".into()).into())
    }

    /// Exact lookup; expired records are invisible.
    pub async fn lookup(&self, signature: &Signature) -> Result<Option<RecallRecord>> {
        let started = std::time::Instant::now();
        let result = if self.is_degraded() {
            Ok(self.memory_lookup(signature, true))
        } else {
            let db_path = self.db_path.clone();
            let sig = signature.clone();
            let now = Utc::now().timestamp();
            tokio::task::spawn_blocking(move || lookup_sync(&db_path, &sig, Some(now)))
                .await
                .map_err(|e| RecallError::TaskJoin(e.to_string()))?
                .map_err(Into::into)
        };
        metrics().observe(
            "response_latency_seconds",
            &[("component", "recall"), ("operation", "lookup")],
            started.elapsed().as_secs_f64(),
        );
        result
    }

    /// Fuzzy sibling lookup by token-set overlap on the normalized
    /// remainder. Used when the exact signature is absent.
    pub async fn similar(&self, normalized: &str, threshold: f64) -> Result<Vec<RecallRecord>> {
        let target = token_set(normalized);
        let candidates = if self.is_degraded() {
            let memory = self.memory.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let now = Utc::now();
            memory
                .values()
                .filter(|r| r.expires_at > now)
                .cloned()
                .collect()
        } else {
            let db_path = self.db_path.clone();
            let now = Utc::now().timestamp();
            tokio::task::spawn_blocking(move || all_active_sync(&db_path, now))
                .await
                .map_err(|e| RecallError::TaskJoin(e.to_string()))??
        };

        let mut matches: Vec<(f64, RecallRecord)> = candidates
            .into_iter()
            .filter_map(|record| {
                let score = jaccard(&target, &token_set(&record.normalized));
                (score >= threshold).then_some((score, record))
            })
            .collect();
        matches.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(matches.into_iter().map(|(_, r)| r).collect())
    }

    /// Record that an intervention was emitted for `signature`.
    pub async fn mark_intervention(&self, signature: &Signature, text: &str) -> Result<()> {
        self.write(PendingOp::MarkIntervention {
            signature: signature.clone(),
            text: text.to_string(),
            at: Utc::now(),
        })
        .await
    }

    /// Record an intervention outcome; increments success-count only on
    /// success, and never past intervention-count.
    pub async fn mark_outcome(&self, signature: &Signature, success: bool) -> Result<()> {
        self.write(PendingOp::MarkOutcome {
            signature: signature.clone(),
            success,
        })
        .await
    }

    /// Remove expired records; returns how many were purged.
    pub async fn purge_expired(&self) -> Result<usize> {
        if self.is_degraded() {
            self.try_reconnect().await;
        }
        if self.is_degraded() {
            let mut memory = self.memory.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let now = Utc::now();
            let before = memory.len();
            memory.retain(|_, r| r.expires_at > now);
            return Ok(before - memory.len());
        }
        let db_path = self.db_path.clone();
        let now = Utc::now().timestamp();
        let removed = tokio::task::spawn_blocking(move || purge_sync(&db_path, now))
            .await
            .map_err(|e| RecallError::TaskJoin(e.to_string()))??;
        if removed > 0 {
            debug!(removed, "purged expired recall records");
        }
        Ok(removed)
    }

    /// Store-level stats (active/expired counts and degradation flag).
    pub async fn stats(&self) -> Result<RecallStats> {
        if self.is_degraded() {
            let memory = self.memory.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let now = Utc::now();
            let active = memory.values().filter(|r| r.expires_at > now).count() as u64;
            return Ok(RecallStats {
                active_records: active,
                expired_records: memory.len() as u64 - active,
                degraded: true,
            });
        }
        let db_path = self.db_path.clone();
        let now = Utc::now().timestamp();
        let (active, expired) = tokio::task::spawn_blocking(move || stats_sync(&db_path, now))
            .await
            .map_err(|e| RecallError::TaskJoin(e.to_string()))??;
        Ok(RecallStats {
            active_records: active,
            expired_records: expired,
            degraded: false,
        })
    }

    // ========================================================================
    // Internal
    // ========================================================================

    /// Lookup ignoring expiry (used to read back a just-written record).
    async fn lookup_any(&self, signature: &Signature) -> Result<Option<RecallRecord>> {
        if self.is_degraded() {
            return Ok(self.memory_lookup(signature, false));
        }
        let db_path = self.db_path.clone();
        let sig = signature.clone();
        tokio::task::spawn_blocking(move || lookup_sync(&db_path, &sig, None))
            .await
            .map_err(|e| RecallError::TaskJoin(e.to_string()))?
            .map_err(Into::into)
    }

    fn memory_lookup(&self, signature: &Signature, respect_expiry: bool) -> Option<RecallRecord> {
        let memory = self.memory.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let record = memory.get(signature)?.clone();
        if respect_expiry && record.expires_at <= Utc::now() {
            return None;
        }
        Some(record)
    }

    /// Apply one write op: to SQLite with retry, falling back to memory.
    async fn write(&self, op: PendingOp) -> Result<()> {
        if self.is_degraded() {
            self.try_reconnect().await;
        }

        if !self.is_degraded() {
            let guard = self.writer.lock().await;
            let db_path = self.db_path.clone();
            let ttl = self.ttl;
            let op_for_db = op.clone();
            let outcome = with_retry(&self.retry, || {
                let db_path = db_path.clone();
                let op = op_for_db.clone();
                async move {
                    tokio::task::spawn_blocking(move || apply_sync(&db_path, &op, ttl))
                        .await
                        .map_err(|e| RecallError::TaskJoin(e.to_string()))?
                        .map_err(Into::into)
                }
            })
            .await;
            drop(guard);

            match outcome {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(error = %e, "recall write failed after retries; switching to in-memory mode");
                    self.enter_degraded(&e.to_string());
                }
            }
        }

        // Degraded path: apply to memory and queue for replay.
        self.apply_memory(&op);
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(op);
        Ok(())
    }

    fn apply_memory(&self, op: &PendingOp) {
        let mut memory = self.memory.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match op {
            PendingOp::Record {
                signature,
                kind,
                normalized,
                at,
            } => {
                let entry = memory.entry(signature.clone()).or_insert_with(|| RecallRecord {
                    signature: signature.clone(),
                    kind: *kind,
                    first_seen: *at,
                    last_seen: *at,
                    occurrence_count: 0,
                    intervention_count: 0,
                    success_count: 0,
                    last_intervention_text: None,
                    last_intervention_at: None,
                    expires_at: *at,
                    normalized: normalized.clone(),
                });
                entry.occurrence_count += 1;
                entry.last_seen = *at;
                entry.expires_at = *at + ttl_for(entry.occurrence_count, self.ttl);
            }
            PendingOp::MarkIntervention {
                signature,
                text,
                at,
            } => {
                if let Some(entry) = memory.get_mut(signature) {
                    entry.intervention_count =
                        (entry.intervention_count + 1).min(entry.occurrence_count);
                    entry.last_intervention_text = Some(text.clone());
                    entry.last_intervention_at = Some(*at);
                }
            }
            PendingOp::MarkOutcome { signature, success } => {
                if *success {
                    if let Some(entry) = memory.get_mut(signature) {
                        entry.success_count =
                            (entry.success_count + 1).min(entry.intervention_count);
                    }
                }
            }
        }
    }

    fn enter_degraded(&self, reason: &str) {
        self.degraded.store(true, Ordering::SeqCst);
        degradation::enter_degraded(Subsystem::RecallDb, reason.to_string());
        metrics().set_gauge("db_connections_active", &[], 0.0);
        metrics().set_gauge("recall_degraded_mode", &[], 1.0);
    }

    /// Try to reopen the database and flush pending writes in order.
    async fn try_reconnect(&self) {
        let ops: Vec<PendingOp> = {
            self.pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone()
        };
        let db_path = self.db_path.clone();
        let ttl = self.ttl;

        let flushed = tokio::task::spawn_blocking(move || -> std::result::Result<(), RecallError> {
            init_schema(&db_path)?;
            for op in &ops {
                apply_sync(&db_path, op, ttl)?;
            }
            Ok(())
        })
        .await;

        match flushed {
            Ok(Ok(())) => {
                let count = {
                    let mut pending = self
                        .pending
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    let n = pending.len();
                    pending.clear();
                    n
                };
                self.memory
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .clear();
                self.degraded.store(false, Ordering::SeqCst);
                degradation::recover(Subsystem::RecallDb);
                metrics().set_gauge("db_connections_active", &[], 1.0);
                metrics().set_gauge("recall_degraded_mode", &[], 0.0);
                info!(flushed = count, "recall store reconnected; pending writes flushed");
            }
            Ok(Err(e)) => {
                debug!(error = %e, "recall store still unavailable");
            }
            Err(e) => {
                debug!(error = %e, "recall reconnect task failed");
            }
        }
    }
}

fn ttl_for(occurrence_count: u64, base: Duration) -> chrono::Duration {
    let ttl = if occurrence_count >= EXTENDED_TTL_OCCURRENCES {
        base.max(EXTENDED_TTL)
    } else {
        base
    };
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(24))
}

// =============================================================================
// SQLite helpers (blocking; called from spawn_blocking only)
// =============================================================================

fn open_connection(db_path: &Path) -> std::result::Result<Connection, RecallError> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| RecallError::Unavailable {
                path: db_path.display().to_string(),
                cause: e.to_string(),
            })?;
        }
    }
    let conn = Connection::open(db_path).map_err(|e| RecallError::Unavailable {
        path: db_path.display().to_string(),
        cause: e.to_string(),
    })?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(db_err)?;
    conn.busy_timeout(Duration::from_millis(250)).map_err(db_err)?;
    Ok(conn)
}

fn init_schema(db_path: &Path) -> std::result::Result<(), RecallError> {
    let conn = open_connection(db_path)?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS recall_records (
            signature TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            first_seen INTEGER NOT NULL,
            last_seen INTEGER NOT NULL,
            occurrence_count INTEGER NOT NULL DEFAULT 0,
            intervention_count INTEGER NOT NULL DEFAULT 0,
            success_count INTEGER NOT NULL DEFAULT 0,
            last_intervention_text TEXT,
            last_intervention_at INTEGER,
            expires_at INTEGER NOT NULL,
            normalized TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_recall_expires ON recall_records(expires_at);",
    )
    .map_err(db_err)
}

fn apply_sync(
    db_path: &Path,
    op: &PendingOp,
    ttl: Duration,
) -> std::result::Result<(), RecallError> {
    let conn = open_connection(db_path)?;
    match op {
        PendingOp::Record {
            signature,
            kind,
            normalized,
            at,
        } => {
            let now = at.timestamp();
            let base_expiry = (*at + ttl_for(1, ttl)).timestamp();
            let extended_expiry = (*at + ttl_for(EXTENDED_TTL_OCCURRENCES, ttl)).timestamp();
            conn.execute(
                "INSERT INTO recall_records
                    (signature, kind, first_seen, last_seen, occurrence_count,
                     intervention_count, success_count, expires_at, normalized)
                 VALUES (?1, ?2, ?3, ?3, 1, 0, 0, ?4, ?5)
                 ON CONFLICT(signature) DO UPDATE SET
                    last_seen = excluded.last_seen,
                    occurrence_count = recall_records.occurrence_count + 1,
                    expires_at = CASE
                        WHEN recall_records.occurrence_count + 1 >= ?6 THEN ?7
                        ELSE ?4
                    END,
                    normalized = excluded.normalized",
                params![
                    signature.as_hex(),
                    kind.tag(),
                    now,
                    base_expiry,
                    normalized,
                    EXTENDED_TTL_OCCURRENCES as i64,
                    extended_expiry,
                ],
            )
            .map_err(db_err)?;
        }
        PendingOp::MarkIntervention {
            signature,
            text,
            at,
        } => {
            conn.execute(
                "UPDATE recall_records SET
                    intervention_count = MIN(intervention_count + 1, occurrence_count),
                    last_intervention_text = ?2,
                    last_intervention_at = ?3
                 WHERE signature = ?1",
                params![signature.as_hex(), text, at.timestamp()],
            )
            .map_err(db_err)?;
        }
        PendingOp::MarkOutcome { signature, success } => {
            if *success {
                conn.execute(
                    "UPDATE recall_records SET
                        success_count = MIN(success_count + 1, intervention_count)
                     WHERE signature = ?1",
                    params![signature.as_hex()],
                )
                .map_err(db_err)?;
            }
        }
    }
    Ok(())
}

const SELECT_COLUMNS: &str = "signature, kind, first_seen, last_seen, occurrence_count, \
     intervention_count, success_count, last_intervention_text, last_intervention_at, \
     expires_at, normalized";

fn lookup_sync(
    db_path: &Path,
    signature: &Signature,
    visible_after: Option<i64>,
) -> std::result::Result<Option<RecallRecord>, RecallError> {
    let conn = open_connection(db_path)?;
    let sql = format!("SELECT {SELECT_COLUMNS} FROM recall_records WHERE signature = ?1");
    let record = conn
        .query_row(&sql, params![signature.as_hex()], row_to_record)
        .optional()
        .map_err(db_err)?;
    Ok(record.filter(|r| visible_after.is_none_or(|now| r.expires_at.timestamp() > now)))
}

fn all_active_sync(
    db_path: &Path,
    now: i64,
) -> std::result::Result<Vec<RecallRecord>, RecallError> {
    let conn = open_connection(db_path)?;
    let sql = format!("SELECT {SELECT_COLUMNS} FROM recall_records WHERE expires_at > ?1");
    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let rows = stmt
        .query_map(params![now], row_to_record)
        .map_err(db_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err)?;
    Ok(rows)
}

fn purge_sync(db_path: &Path, now: i64) -> std::result::Result<usize, RecallError> {
    let conn = open_connection(db_path)?;
    conn.execute(
        "DELETE FROM recall_records WHERE expires_at <= ?1",
        params![now],
    )
    .map_err(db_err)
}

fn stats_sync(db_path: &Path, now: i64) -> std::result::Result<(u64, u64), RecallError> {
    let conn = open_connection(db_path)?;
    let active: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM recall_records WHERE expires_at > ?1",
            params![now],
            |row| row.get(0),
        )
        .map_err(db_err)?;
    let expired: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM recall_records WHERE expires_at <= ?1",
            params![now],
            |row| row.get(0),
        )
        .map_err(db_err)?;
    Ok((active as u64, expired as u64))
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecallRecord> {
    let kind_tag: String = row.get(1)?;
    let kind = ErrorKind::ALL
        .iter()
        .find(|k| k.tag() == kind_tag)
        .copied()
        .unwrap_or(ErrorKind::Unknown);
    let last_intervention_at: Option<i64> = row.get(8)?;
    Ok(RecallRecord {
        signature: Signature::from_hex(row.get::<_, String>(0)?),
        kind,
        first_seen: epoch_to_datetime(row.get(2)?),
        last_seen: epoch_to_datetime(row.get(3)?),
        occurrence_count: row.get::<_, i64>(4)? as u64,
        intervention_count: row.get::<_, i64>(5)? as u64,
        success_count: row.get::<_, i64>(6)? as u64,
        last_intervention_text: row.get(7)?,
        last_intervention_at: last_intervention_at.map(epoch_to_datetime),
        expires_at: epoch_to_datetime(row.get(9)?),
        normalized: row.get(10)?,
    })
}

fn epoch_to_datetime(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

fn db_err(e: rusqlite::Error) -> RecallError {
    RecallError::Database(e.to_string())
}
