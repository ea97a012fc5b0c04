use std::collections::BTreeMap;

use serde::Serialize;

/// Deterministic metrics aggregation.
///
/// Sorted maps keep snapshots stable for logs and diagnostics panels.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Metrics {
    counters: BTreeMap<String, u64>,
    histograms: BTreeMap<String, Histogram>,
}

#[derive(Debug, Copy, Clone, PartialEq, Default, Serialize)]
pub struct Histogram {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl Histogram {
    pub fn record(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub counters: Vec<(String, u64)>,
    pub histograms: Vec<(String, Histogram)>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.counters.clear();
        self.histograms.clear();
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn inc_counter(&mut self, name: &str) {
        *self.counters.entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn record_histogram(&mut self, name: &str, value: f64) {
        self.histograms
            .entry(name.to_string())
            .or_default()
            .record(value);
    }

    pub fn histogram(&self, name: &str) -> Option<Histogram> {
        self.histograms.get(name).copied()
    }

    /// Returns a stable, sorted snapshot suitable for logs/debug UI.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            histograms: self
                .histograms
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Histogram, Metrics};

    #[test]
    fn counters_accumulate() {
        let mut m = Metrics::new();
        m.inc_counter("volume.fetch");
        m.inc_counter("volume.fetch");
        assert_eq!(m.counter("volume.fetch"), 2);
        assert_eq!(m.counter("missing"), 0);
    }

    #[test]
    fn histogram_tracks_min_max_mean_and_skips_nan() {
        let mut h = Histogram::default();
        assert_eq!(h.mean(), None);
        h.record(5.0);
        h.record(-2.0);
        h.record(f64::NAN);
        h.record(9.0);
        assert_eq!(h.count, 3);
        assert_eq!(h.min, -2.0);
        assert_eq!(h.max, 9.0);
        assert_eq!(h.mean(), Some(4.0));
    }

    #[test]
    fn snapshot_is_stably_sorted() {
        let mut m = Metrics::new();
        m.inc_counter("volume.stale");
        m.inc_counter("volume.cache_hit");
        m.record_histogram("volume.fetch_ms", 10.0);
        m.record_histogram("volume.decode_ms", 5.0);

        let snap = m.snapshot();
        assert_eq!(
            snap.counters,
            vec![
                ("volume.cache_hit".to_string(), 1),
                ("volume.stale".to_string(), 1)
            ]
        );
        assert_eq!(snap.histograms[0].0, "volume.decode_ms");
        assert_eq!(snap.histograms[1].0, "volume.fetch_ms");
    }
}
