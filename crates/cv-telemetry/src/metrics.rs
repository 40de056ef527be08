use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::OnceLock;

use dashmap::DashMap;

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// Distribution of observed values across fixed buckets.
#[derive(Debug)]
pub struct Histogram {
    pub buckets: Vec<f64>,
    pub counts: Vec<AtomicU64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum: AtomicU64::new(0f64.to_bits()),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        // f64 sum kept as bits
        let _ = self
            .sum
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some((f64::from_bits(current) + value).to_bits())
            });
        for (i, boundary) in self.buckets.iter().enumerate() {
            if value <= *boundary {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn get_sum(&self) -> f64 {
        f64::from_bits(self.sum.load(Ordering::Relaxed))
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Job run-time buckets, in seconds. Agent jobs run from seconds to tens of minutes.
fn default_duration_buckets() -> Vec<f64> {
    vec![
        0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0,
    ]
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Sorted key=value pairs distinguishing members of one counter family.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        Self(v)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// `{key="value",key2="value2"}`, or empty when there are no labels.
    pub fn prometheus_str(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let inner: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{k}=\"{v}\""))
            .collect();
        format!("{{{}}}", inner.join(","))
    }
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

/// Counters, gauges and histograms keyed by name.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: DashMap<(String, Labels), AtomicU64>,
    gauges: DashMap<String, AtomicI64>,
    histograms: DashMap<String, Histogram>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Counters -----------------------------------------------------------

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.increment_counter_by(name, labels, 1);
    }

    pub fn increment_counter_by(&self, name: &str, labels: &[(&str, &str)], amount: u64) {
        self.counters
            .entry((name.to_string(), Labels::new(labels)))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get_counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .get(&(name.to_string(), Labels::new(labels)))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // -- Gauges -------------------------------------------------------------

    pub fn set_gauge(&self, name: &str, value: i64) {
        self.gauges
            .entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn get_gauge(&self, name: &str) -> i64 {
        self.gauges
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // -- Histograms ---------------------------------------------------------

    /// Record a value. Unknown histograms are created with duration buckets.
    pub fn record_histogram(&self, name: &str, value: f64) {
        self.histograms
            .entry(name.to_string())
            .or_insert_with(|| Histogram::new(default_duration_buckets()))
            .observe(value);
    }

    /// `(count, sum)` of a histogram, if it has been recorded.
    pub fn histogram_summary(&self, name: &str) -> Option<(u64, f64)> {
        self.histograms
            .get(name)
            .map(|h| (h.get_count(), h.get_sum()))
    }

    // -- Export --------------------------------------------------------------

    /// Export all metrics in Prometheus text exposition format.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();
        self.write_counters(&mut out);
        self.write_gauges(&mut out);
        self.write_histograms(&mut out);
        out
    }

    fn write_counters(&self, out: &mut String) {
        let mut rows: Vec<(String, Labels, u64)> = self
            .counters
            .iter()
            .map(|e| {
                let (name, labels) = e.key();
                (name.clone(), labels.clone(), e.value().load(Ordering::Relaxed))
            })
            .collect();
        rows.sort();
        let mut family: Option<&str> = None;
        for (name, labels, value) in &rows {
            if family != Some(name.as_str()) {
                out.push_str(&format!("# TYPE {name} counter\n"));
                family = Some(name.as_str());
            }
            out.push_str(&format!("{name}{} {value}\n", labels.prometheus_str()));
        }
    }

    fn write_gauges(&self, out: &mut String) {
        let mut rows: Vec<(String, i64)> = self
            .gauges
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        rows.sort();
        for (name, value) in rows {
            out.push_str(&format!("# TYPE {name} gauge\n{name} {value}\n"));
        }
    }

    fn write_histograms(&self, out: &mut String) {
        let mut names: Vec<String> = self.histograms.iter().map(|e| e.key().clone()).collect();
        names.sort();
        for name in names {
            let Some(h) = self.histograms.get(&name) else {
                continue;
            };
            let count = h.get_count();
            out.push_str(&format!("# TYPE {name} histogram\n"));
            // Bucket counts are already cumulative.
            for (boundary, hits) in h.buckets.iter().zip(&h.counts) {
                out.push_str(&format!(
                    "{name}_bucket{{le=\"{boundary}\"}} {}\n",
                    hits.load(Ordering::Relaxed)
                ));
            }
            out.push_str(&format!("{name}_bucket{{le=\"+Inf\"}} {count}\n"));
            out.push_str(&format!("{name}_sum {}\n{name}_count {count}\n", h.get_sum()));
        }
    }

    /// Export all metrics as a JSON value.
    pub fn export_json(&self) -> serde_json::Value {
        let mut counters = serde_json::Map::new();
        for e in self.counters.iter() {
            let (name, labels) = e.key();
            counters.insert(
                format!("{name}{}", labels.prometheus_str()),
                serde_json::json!(e.value().load(Ordering::Relaxed)),
            );
        }

        let mut gauges = serde_json::Map::new();
        for e in self.gauges.iter() {
            gauges.insert(
                e.key().clone(),
                serde_json::json!(e.value().load(Ordering::Relaxed)),
            );
        }

        let mut histograms = serde_json::Map::new();
        for e in self.histograms.iter() {
            histograms.insert(
                e.key().clone(),
                serde_json::json!({
                    "sum": e.value().get_sum(),
                    "count": e.value().get_count(),
                }),
            );
        }

        serde_json::json!({
            "counters": counters,
            "gauges": gauges,
            "histograms": histograms,
        })
    }
}

// ---------------------------------------------------------------------------
// Metric names
// ---------------------------------------------------------------------------

/// Metric families recorded by the conveyor crates.
pub mod names {
    /// Counter, labelled `job_type`.
    pub const JOBS_CLAIMED: &str = "jobs_claimed_total";
    /// Counter of claims lost to another worker.
    pub const JOB_CLAIM_CONFLICTS: &str = "job_claim_conflicts_total";
    /// Counter, labelled `job_type` and `status`.
    pub const JOBS_FINISHED: &str = "jobs_finished_total";
    /// Histogram of executor wall time in seconds.
    pub const JOB_RUN_SECONDS: &str = "job_run_seconds";
    /// Gauge of pending jobs, set by the patrol loop.
    pub const JOBS_PENDING: &str = "jobs_pending";
}

// ---------------------------------------------------------------------------
// Global singleton
// ---------------------------------------------------------------------------

/// The process-wide collector.
pub fn global_metrics() -> &'static MetricsCollector {
    static INSTANCE: OnceLock<MetricsCollector> = OnceLock::new();
    INSTANCE.get_or_init(MetricsCollector::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_are_cumulative() {
        let h = Histogram::new(vec![1.0, 10.0]);
        h.observe(0.5);
        h.observe(5.0);
        h.observe(50.0);
        assert_eq!(h.counts[0].load(Ordering::Relaxed), 1);
        assert_eq!(h.counts[1].load(Ordering::Relaxed), 2);
        assert_eq!(h.get_count(), 3);
        assert!((h.get_sum() - 55.5).abs() < 1e-9);
    }

    #[test]
    fn labels_prometheus_format() {
        let l = Labels::new(&[("status", "failed"), ("job_type", "agent_run")]);
        assert_eq!(
            l.prometheus_str(),
            "{job_type=\"agent_run\",status=\"failed\"}"
        );
        assert_eq!(Labels::empty().prometheus_str(), "");
    }
}
