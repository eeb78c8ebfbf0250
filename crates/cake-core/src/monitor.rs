//! Stream monitor — non-blocking extraction of error events from the
//! supervised agent's stdout/stderr.
//!
//! One reader task per stream feeds a bounded [`EventQueue`]. The consumer
//! (the controller) never blocks the readers; when the queue is full, the
//! oldest LOW-severity pending events are dropped first, then MEDIUM, and
//! never HIGH or CRITICAL. Drops are counted per severity class and surfaced
//! through metrics.
//!
//! Closing a stream flushes any partial final line: it is scanned like a
//! normal line and falls back to a synthetic Unknown event so no bytes are
//! silently lost.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::events::{ErrorEvent, ErrorKind, Severity, StreamSource};
use crate::metrics::metrics;
use crate::patterns::{FrameLocation, PatternEngine, SharedPatterns};

/// Consecutive read failures within this window mark the stream degraded.
const READ_FAILURE_WINDOW: Duration = Duration::from_secs(30);
const READ_FAILURE_THRESHOLD: u32 = 5;

// =============================================================================
// Event queue
// =============================================================================

/// Bounded queue between stream readers and the controller.
///
/// The bound is soft for High/Critical events: they are always accepted so
/// the drop policy can never discard them, even when lower classes have
/// nothing left to evict.
pub struct EventQueue {
    inner: Mutex<VecDeque<ErrorEvent>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    dropped_low: AtomicU64,
    dropped_medium: AtomicU64,
}

impl EventQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped_low: AtomicU64::new(0),
            dropped_medium: AtomicU64::new(0),
        }
    }

    /// Enqueue an event, applying the severity drop policy when full.
    pub async fn push(&self, event: ErrorEvent) {
        let mut queue = self.inner.lock().await;

        if queue.len() >= self.capacity {
            if let Some(idx) = first_of(&queue, Severity::Low) {
                queue.remove(idx);
                self.count_drop(Severity::Low);
            } else if let Some(idx) = first_of(&queue, Severity::Medium) {
                queue.remove(idx);
                self.count_drop(Severity::Medium);
            } else if event.severity_hint < Severity::High {
                // Everything pending is High/Critical; the incoming event is
                // the lowest class present, so it is the one to drop.
                self.count_drop(event.severity_hint);
                return;
            }
            // High/Critical push proceeds even past capacity.
        }

        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }

    /// Dequeue the next event in emission order; `None` once the queue is
    /// closed and drained.
    pub async fn pop(&self) -> Option<ErrorEvent> {
        loop {
            {
                let mut queue = self.inner.lock().await;
                if let Some(event) = queue.pop_front() {
                    return Some(event);
                }
                if self.closed.load(Ordering::SeqCst) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Close the queue; pending events remain poppable.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Pending event count.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Whether the queue is currently empty.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Total drops per severity class since construction.
    #[must_use]
    pub fn drop_counts(&self) -> (u64, u64) {
        (
            self.dropped_low.load(Ordering::Relaxed),
            self.dropped_medium.load(Ordering::Relaxed),
        )
    }

    fn count_drop(&self, severity: Severity) {
        match severity {
            Severity::Low => {
                self.dropped_low.fetch_add(1, Ordering::Relaxed);
            }
            Severity::Medium => {
                self.dropped_medium.fetch_add(1, Ordering::Relaxed);
            }
            // Never dropped; counted here only to keep the match exhaustive.
            Severity::High | Severity::Critical => {}
        }
        metrics().inc_counter(
            "events_dropped_total",
            &[("severity", &severity.to_string())],
        );
    }
}

fn first_of(queue: &VecDeque<ErrorEvent>, severity: Severity) -> Option<usize> {
    queue.iter().position(|e| e.severity_hint == severity)
}

// =============================================================================
// Stream reader
// =============================================================================

/// Read one supervised stream to EOF, emitting typed events to the queue.
///
/// Traceback frame lines (`File "x.py", line 10`) are not events; the most
/// recent frame is held and attached to the next typed event from the same
/// stream, which is how Python-style tracebacks carry their location. The
/// pattern engine is resolved per line so hot-reloaded rule sets apply to
/// running readers.
pub async fn run_reader<R>(
    stream: R,
    source: StreamSource,
    patterns: Arc<SharedPatterns>,
    queue: Arc<EventQueue>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut seq: u64 = 0;
    let mut last_frame: Option<FrameLocation> = None;
    let mut failure_count: u32 = 0;
    let mut failure_window_start = Instant::now();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let terminated = buf.last() == Some(&b'\n');
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                if line.is_empty() {
                    continue;
                }
                let engine = patterns.current();
                if let Some(frame) = engine.scan_frame(line) {
                    last_frame = Some(frame);
                }
                if let Some(event) = event_from_line(&engine, line, source, &mut seq, &mut last_frame)
                {
                    queue.push(event).await;
                } else if !terminated {
                    // Stream closed mid-line: flush the partial tail as a
                    // terminal synthetic event so no bytes are lost.
                    queue.push(synthetic_unknown(line, source, &mut seq)).await;
                }
            }
            Err(e) => {
                warn!(stream = %source, error = %e, "stream read failed");
                if failure_window_start.elapsed() > READ_FAILURE_WINDOW {
                    failure_window_start = Instant::now();
                    failure_count = 0;
                }
                failure_count += 1;
                if failure_count >= READ_FAILURE_THRESHOLD {
                    crate::degradation::enter_degraded(
                        crate::degradation::Subsystem::StreamReader,
                        format!("{source}: repeated read failures"),
                    );
                    break;
                }
            }
        }
    }

    debug!(stream = %source, events = seq, "stream reader finished");
}

fn event_from_line(
    engine: &PatternEngine,
    line: &str,
    source: StreamSource,
    seq: &mut u64,
    last_frame: &mut Option<FrameLocation>,
) -> Option<ErrorEvent> {
    let m = engine.scan(line)?;

    let (path, line_no) = if m.path.is_some() {
        (m.path.clone(), m.line)
    } else if let Some(frame) = last_frame.take() {
        (Some(frame.path), Some(frame.line))
    } else {
        (None, None)
    };

    let event = ErrorEvent::new(m.kind, source, line, *seq)
        .with_location(path, line_no)
        .with_severity_hint(m.severity);
    *seq += 1;

    metrics().inc_counter("events_emitted_total", &[("kind", m.kind.tag())]);
    Some(event)
}

fn synthetic_unknown(raw: &str, source: StreamSource, seq: &mut u64) -> ErrorEvent {
    let event = ErrorEvent::new(ErrorKind::Unknown, source, raw, *seq)
        .with_severity_hint(Severity::Low);
    *seq += 1;
    metrics().inc_counter("events_emitted_total", &[("kind", "unknown")]);
    event
}
