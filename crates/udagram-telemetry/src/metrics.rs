use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
}

/// Point-in-time value of one metric series.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    pub name: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    pub value: f64,
    pub metric_type: MetricType,
}

/// Metric key: name + labels sorted by label name.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut sorted: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            name: name.to_string(),
            labels: sorted,
        }
    }

    fn sample(&self, value: f64, metric_type: MetricType) -> MetricSample {
        MetricSample {
            name: self.name.clone(),
            labels: self.labels.iter().cloned().collect(),
            value,
            metric_type,
        }
    }
}

/// Thread-safe in-process counters and gauges.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, AtomicU64>>,
    gauges: RwLock<HashMap<MetricKey, AtomicI64>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by n.
    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let key = MetricKey::new(name, labels);
        if let Some(c) = self.counters.read().get(&key) {
            c.fetch_add(n, Ordering::Relaxed);
            return;
        }
        self.counters
            .write()
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = MetricKey::new(name, labels);
        self.counters
            .read()
            .get(&key)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Move a gauge up or down by delta.
    pub fn gauge_add(&self, name: &str, labels: &[(&str, &str)], delta: i64) {
        let key = MetricKey::new(name, labels);
        if let Some(g) = self.gauges.read().get(&key) {
            g.fetch_add(delta, Ordering::Relaxed);
            return;
        }
        self.gauges
            .write()
            .entry(key)
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: i64) {
        let key = MetricKey::new(name, labels);
        if let Some(g) = self.gauges.read().get(&key) {
            g.store(value, Ordering::Relaxed);
            return;
        }
        self.gauges
            .write()
            .entry(key)
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> i64 {
        let key = MetricKey::new(name, labels);
        self.gauges
            .read()
            .get(&key)
            .map_or(0, |g| g.load(Ordering::Relaxed))
    }

    /// Every series, ordered by name then labels.
    pub fn snapshot(&self) -> Vec<MetricSample> {
        let mut entries: Vec<(MetricKey, MetricSample)> = Vec::new();
        for (key, c) in self.counters.read().iter() {
            let value = c.load(Ordering::Relaxed) as f64;
            entries.push((key.clone(), key.sample(value, MetricType::Counter)));
        }
        for (key, g) in self.gauges.read().iter() {
            let value = g.load(Ordering::Relaxed) as f64;
            entries.push((key.clone(), key.sample(value, MetricType::Gauge)));
        }
        entries.sort_by(|a, b| (&a.0.name, &a.0.labels).cmp(&(&b.0.name, &b.0.labels)));
        entries.into_iter().map(|(_, sample)| sample).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counter_basic() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("broadcast.deliveries", &[("outcome", "delivered")], 1);
        recorder.counter_inc("broadcast.deliveries", &[("outcome", "delivered")], 2);
        recorder.counter_inc("broadcast.deliveries", &[("outcome", "stale")], 1);

        assert_eq!(recorder.counter_get("broadcast.deliveries", &[("outcome", "delivered")]), 3);
        assert_eq!(recorder.counter_get("broadcast.deliveries", &[("outcome", "stale")]), 1);
        assert_eq!(recorder.counter_get("broadcast.deliveries", &[("outcome", "transient")]), 0);
    }

    #[test]
    fn gauge_moves_both_ways() {
        let recorder = MetricsRecorder::new();
        recorder.gauge_add("connections.active", &[], 3);
        recorder.gauge_add("connections.active", &[], -1);
        assert_eq!(recorder.gauge_get("connections.active", &[]), 2);

        recorder.gauge_set("connections.active", &[], 10);
        assert_eq!(recorder.gauge_get("connections.active", &[]), 10);
    }

    #[test]
    fn label_ordering_independent() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("test", &[("a", "1"), ("b", "2")], 1);
        recorder.counter_inc("test", &[("b", "2"), ("a", "1")], 1);
        assert_eq!(recorder.counter_get("test", &[("a", "1"), ("b", "2")]), 2);
    }

    #[test]
    fn snapshot_is_sorted_and_typed() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("z.counter", &[], 5);
        recorder.gauge_set("a.gauge", &[], 7);

        let samples = recorder.snapshot();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].name, "a.gauge");
        assert_eq!(samples[0].metric_type, MetricType::Gauge);
        assert_eq!(samples[0].value, 7.0);
        assert_eq!(samples[1].name, "z.counter");
        assert_eq!(samples[1].metric_type, MetricType::Counter);
    }

    #[test]
    fn sample_serializes_labels_as_map() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("broadcast.deliveries", &[("outcome", "stale")], 1);
        let json = serde_json::to_value(&recorder.snapshot()[0]).unwrap();
        assert_eq!(json["labels"]["outcome"], "stale");
        assert_eq!(json["metric_type"], "counter");
    }

    #[test]
    fn concurrent_counter_increments() {
        let recorder = Arc::new(MetricsRecorder::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = Arc::clone(&recorder);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        r.counter_inc("concurrent.test", &[], 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(recorder.counter_get("concurrent.test", &[]), 8_000);
    }
}
