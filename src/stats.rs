//! Statistics Sink
//!
//! Named atomic counters shared by every layer of the cache stack. Components
//! look their variables up once at construction and bump them lock-free on the
//! hot path.
//!
//! Rendering is left to the embedding server; [`SimpleStats::export_prometheus`]
//! mirrors the counters into a `prometheus::Registry` for scraping.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use prometheus::{IntGauge, Registry};

/// A single named counter
#[derive(Debug, Default)]
pub struct Variable {
    value: AtomicI64,
}

impl Variable {
    /// Create a new counter at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Add `delta` (may be negative) and return the new value
    pub fn add(&self, delta: i64) -> i64 {
        self.value.fetch_add(delta, Ordering::Relaxed) + delta
    }

    /// Overwrite the value
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Get current value
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Reset to zero
    pub fn clear(&self) {
        self.value.store(0, Ordering::Relaxed);
    }
}

/// Sink for named counters
pub trait Statistics: Send + Sync {
    /// Get or create the variable called `name`
    fn add_variable(&self, name: &str) -> Arc<Variable>;

    /// Look up an existing variable
    fn find_variable(&self, name: &str) -> Option<Arc<Variable>>;

    /// Current value of every variable, sorted by name
    fn snapshot(&self) -> BTreeMap<String, i64>;

    /// Reset every variable to zero
    fn clear(&self);
}

/// In-process statistics backed by a concurrent map
#[derive(Default)]
pub struct SimpleStats {
    variables: DashMap<String, Arc<Variable>>,
    exported: DashMap<String, IntGauge>,
}

impl SimpleStats {
    /// Create an empty statistics sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of `name`, or zero if it was never created
    pub fn value(&self, name: &str) -> i64 {
        self.find_variable(name).map(|v| v.get()).unwrap_or(0)
    }

    /// Register a gauge for every known variable with `registry`.
    ///
    /// Variable names are sanitized to the Prometheus metric-name alphabet.
    /// Call [`refresh_prometheus`](Self::refresh_prometheus) before each scrape
    /// to copy the counter values into the gauges.
    pub fn export_prometheus(&self, registry: &Registry) -> crate::Result<()> {
        for entry in self.variables.iter() {
            if self.exported.contains_key(entry.key()) {
                continue;
            }
            let metric_name = prometheus_name(entry.key());
            let gauge = IntGauge::new(metric_name, format!("pcache statistic {}", entry.key()))?;
            gauge.set(entry.value().get());
            registry.register(Box::new(gauge.clone()))?;
            self.exported.insert(entry.key().clone(), gauge);
        }
        Ok(())
    }

    /// Copy current counter values into the exported gauges
    pub fn refresh_prometheus(&self) {
        for gauge in self.exported.iter() {
            if let Some(var) = self.variables.get(gauge.key()) {
                gauge.value().set(var.get());
            }
        }
    }

    /// Serialize the snapshot as a JSON object
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or(serde_json::Value::Null)
    }
}

impl Statistics for SimpleStats {
    fn add_variable(&self, name: &str) -> Arc<Variable> {
        if let Some(var) = self.variables.get(name) {
            return var.clone();
        }
        self.variables
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Variable::new()))
            .clone()
    }

    fn find_variable(&self, name: &str) -> Option<Arc<Variable>> {
        self.variables.get(name).map(|v| v.clone())
    }

    fn snapshot(&self) -> BTreeMap<String, i64> {
        self.variables
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().get()))
            .collect()
    }

    fn clear(&self) {
        for entry in self.variables.iter() {
            entry.value().clear();
        }
    }
}

fn prometheus_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_variable_is_idempotent() {
        let stats = SimpleStats::new();
        let a = stats.add_variable("hits");
        let b = stats.add_variable("hits");
        a.inc();
        b.add(2);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(stats.value("hits"), 3);
    }

    #[test]
    fn test_missing_variable_reads_zero() {
        let stats = SimpleStats::new();
        assert!(stats.find_variable("nope").is_none());
        assert_eq!(stats.value("nope"), 0);
    }

    #[test]
    fn test_snapshot_and_clear() {
        let stats = SimpleStats::new();
        stats.add_variable("b").add(5);
        stats.add_variable("a").inc();

        let snap = stats.snapshot();
        let names: Vec<_> = snap.keys().cloned().collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(snap["b"], 5);

        stats.clear();
        assert_eq!(stats.value("a"), 0);
        assert_eq!(stats.value("b"), 0);
    }

    #[test]
    fn test_prometheus_export() {
        let stats = SimpleStats::new();
        let var = stats.add_variable("pcache-cohorts-dom_hits");
        var.add(7);

        let registry = Registry::new();
        stats.export_prometheus(&registry).unwrap();
        var.inc();
        stats.refresh_prometheus();

        let text = prometheus::TextEncoder::new()
            .encode_to_string(&registry.gather())
            .unwrap();
        assert!(text.contains("pcache_cohorts_dom_hits 8"), "{}", text);

        // A second export does not double-register
        stats.export_prometheus(&registry).unwrap();
    }

    #[test]
    fn test_prometheus_name_sanitizing() {
        assert_eq!(prometheus_name("a-b.c"), "a_b_c");
        assert_eq!(prometheus_name("9lives"), "_9lives");
    }

    #[test]
    fn test_to_json() {
        let stats = SimpleStats::new();
        stats.add_variable("x").add(4);
        assert_eq!(stats.to_json()["x"], 4);
    }
}
