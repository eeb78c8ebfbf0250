//! In-process metrics registry — counters, gauges, latency histograms.
//!
//! Every subsystem records through the global [`metrics()`] registry.
//! Rendering is plain Prometheus text exposition; serving it is the
//! caller's concern.
//!
//! Recording is a lock-per-family hash map update; this is not a hot path
//! (events, interventions, and command decisions are low-rate), so exactness
//! wins over lock-free cleverness.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{LazyLock, Mutex, RwLock};

/// Global registry used across all CAKE subsystems.
static REGISTRY: LazyLock<MetricsRegistry> = LazyLock::new(MetricsRegistry::new);

/// Access the global registry.
#[must_use]
pub fn metrics() -> &'static MetricsRegistry {
    &REGISTRY
}

/// Label pairs are rendered in the order given.
pub type Labels<'a> = &'a [(&'a str, &'a str)];

fn series_key(name: &str, labels: Labels<'_>) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let rendered: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{v}\""))
        .collect();
    format!("{name}{{{}}}", rendered.join(","))
}

// =============================================================================
// Histogram
// =============================================================================

/// Fixed-capacity histogram for latency distributions.
///
/// Keeps the most recent `max_samples` values (FIFO eviction) for quantile
/// estimation plus running count/sum over everything ever recorded.
#[derive(Debug, Clone)]
pub struct Histogram {
    samples: Vec<f64>,
    max_samples: usize,
    total_count: u64,
    total_sum: f64,
}

impl Histogram {
    #[must_use]
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: Vec::with_capacity(max_samples.min(1024)),
            max_samples: max_samples.max(1),
            total_count: 0,
            total_sum: 0.0,
        }
    }

    pub fn record(&mut self, value: f64) {
        self.total_count += 1;
        self.total_sum += value;
        if self.samples.len() >= self.max_samples {
            self.samples.remove(0);
        }
        self.samples.push(value);
    }

    /// Compute a quantile (0.0-1.0) from the retained samples.
    #[must_use]
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((sorted.len() - 1) as f64 * q.clamp(0.0, 1.0)).round() as usize;
        Some(sorted[idx])
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.total_count
    }

    #[must_use]
    pub fn sum(&self) -> f64 {
        self.total_sum
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Counter, gauge, and histogram families keyed by name + labels.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: RwLock<BTreeMap<String, AtomicU64>>,
    gauges: RwLock<BTreeMap<String, Mutex<f64>>>,
    histograms: Mutex<BTreeMap<String, Histogram>>,
}

impl MetricsRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter series by one.
    pub fn inc_counter(&self, name: &str, labels: Labels<'_>) {
        self.add_counter(name, labels, 1);
    }

    /// Add to a counter series.
    pub fn add_counter(&self, name: &str, labels: Labels<'_>, delta: u64) {
        let key = series_key(name, labels);
        {
            let counters = self.counters.read().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(counter) = counters.get(&key) {
                counter.fetch_add(delta, Ordering::Relaxed);
                return;
            }
        }
        let mut counters = self
            .counters
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        counters
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    /// Read a counter series (0 if never written).
    #[must_use]
    pub fn counter(&self, name: &str, labels: Labels<'_>) -> u64 {
        let key = series_key(name, labels);
        self.counters
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&key)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Set a gauge series.
    pub fn set_gauge(&self, name: &str, labels: Labels<'_>, value: f64) {
        let key = series_key(name, labels);
        {
            let gauges = self.gauges.read().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(slot) = gauges.get(&key) {
                *slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = value;
                return;
            }
        }
        let mut gauges = self
            .gauges
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match gauges.entry(key) {
            std::collections::btree_map::Entry::Occupied(entry) => {
                *entry
                    .get()
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) = value;
            }
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(Mutex::new(value));
            }
        }
    }

    /// Read a gauge series.
    #[must_use]
    pub fn gauge(&self, name: &str, labels: Labels<'_>) -> Option<f64> {
        let key = series_key(name, labels);
        self.gauges
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&key)
            .map(|slot| *slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner))
    }

    /// Record a latency observation in seconds.
    pub fn observe(&self, name: &str, labels: Labels<'_>, seconds: f64) {
        let key = series_key(name, labels);
        let mut histograms = self
            .histograms
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        histograms
            .entry(key)
            .or_insert_with(|| Histogram::new(2048))
            .record(seconds);
    }

    /// Quantile of a histogram series, if recorded.
    #[must_use]
    pub fn histogram_quantile(&self, name: &str, labels: Labels<'_>, q: f64) -> Option<f64> {
        let key = series_key(name, labels);
        self.histograms
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&key)
            .and_then(|h| h.quantile(q))
    }

    /// Render everything as Prometheus text exposition.
    #[must_use]
    pub fn render(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();

        for (key, counter) in self
            .counters
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
        {
            let _ = writeln!(out, "{key} {}", counter.load(Ordering::Relaxed));
        }
        for (key, gauge) in self
            .gauges
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
        {
            let value = *gauge.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let _ = writeln!(out, "{key} {value}");
        }
        for (key, histogram) in self
            .histograms
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
        {
            let (name, labels) = key
                .split_once('{')
                .map_or((key.as_str(), String::new()), |(n, rest)| {
                    (n, format!("{{{rest}"))
                });
            let _ = writeln!(out, "{name}_count{labels} {}", histogram.count());
            let _ = writeln!(out, "{name}_sum{labels} {}", histogram.sum());
            for (suffix, q) in [("p50", 0.50), ("p95", 0.95), ("p99", 0.99)] {
                if let Some(value) = histogram.quantile(q) {
                    let _ = writeln!(out, "{name}_{suffix}{labels} {value}");
                }
            }
        }
        out
    }
}
