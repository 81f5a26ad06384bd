use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

/// A thread-safe metrics registry with labelled series, rendered in
/// Prometheus text exposition format.
#[derive(Default)]
pub struct MetricsRegistry {
    counters: RwLock<BTreeMap<String, Family<AtomicU64>>>,
    gauges: RwLock<BTreeMap<String, Family<AtomicI64>>>,
}

/// One metric name with its help text and a value per label set.
struct Family<V> {
    help: String,
    series: BTreeMap<String, V>,
}

impl<V> Family<V> {
    fn new(help: &str) -> Self {
        Self {
            help: help.to_string(),
            series: BTreeMap::new(),
        }
    }
}

/// Render `[("outcome", "committed")]` as `{outcome="committed"}`.
fn label_key(labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let pairs: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, v.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect();
    format!("{{{}}}", pairs.join(","))
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a counter. If it already exists, this is a no-op.
    pub fn register_counter(&self, name: &str, help: &str) {
        let mut counters = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        counters
            .entry(name.to_string())
            .or_insert_with(|| Family::new(help));
    }

    /// Register a gauge. If it already exists, this is a no-op.
    pub fn register_gauge(&self, name: &str, help: &str) {
        let mut gauges = self.gauges.write().unwrap_or_else(PoisonError::into_inner);
        gauges
            .entry(name.to_string())
            .or_insert_with(|| Family::new(help));
    }

    /// Increment a counter series by 1.
    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)]) {
        self.counter_add(name, labels, 1);
    }

    /// Increment a counter series by `val`. Unregistered names are ignored.
    pub fn counter_add(&self, name: &str, labels: &[(&str, &str)], val: u64) {
        let key = label_key(labels);
        {
            let counters = self.counters.read().unwrap_or_else(PoisonError::into_inner);
            match counters.get(name) {
                Some(family) => {
                    if let Some(c) = family.series.get(&key) {
                        c.fetch_add(val, Ordering::Relaxed);
                        return;
                    }
                }
                None => return,
            }
        }
        let mut counters = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(family) = counters.get_mut(name) {
            family
                .series
                .entry(key)
                .or_insert_with(|| AtomicU64::new(0))
                .fetch_add(val, Ordering::Relaxed);
        }
    }

    /// Adjust a gauge series by `delta`. Unregistered names are ignored.
    pub fn gauge_add(&self, name: &str, labels: &[(&str, &str)], delta: i64) {
        let key = label_key(labels);
        {
            let gauges = self.gauges.read().unwrap_or_else(PoisonError::into_inner);
            match gauges.get(name) {
                Some(family) => {
                    if let Some(g) = family.series.get(&key) {
                        g.fetch_add(delta, Ordering::Relaxed);
                        return;
                    }
                }
                None => return,
            }
        }
        let mut gauges = self.gauges.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(family) = gauges.get_mut(name) {
            family
                .series
                .entry(key)
                .or_insert_with(|| AtomicI64::new(0))
                .fetch_add(delta, Ordering::Relaxed);
        }
    }

    /// Set a gauge series to a specific value.
    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], val: i64) {
        let key = label_key(labels);
        let mut gauges = self.gauges.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(family) = gauges.get_mut(name) {
            family
                .series
                .entry(key)
                .or_insert_with(|| AtomicI64::new(0))
                .store(val, Ordering::Relaxed);
        }
    }

    /// Current value of a counter series (0 if never touched).
    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let counters = self.counters.read().unwrap_or_else(PoisonError::into_inner);
        counters
            .get(name)
            .and_then(|f| f.series.get(&label_key(labels)))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Current value of a gauge series (0 if never touched).
    pub fn gauge_value(&self, name: &str, labels: &[(&str, &str)]) -> i64 {
        let gauges = self.gauges.read().unwrap_or_else(PoisonError::into_inner);
        gauges
            .get(name)
            .and_then(|f| f.series.get(&label_key(labels)))
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut output = String::new();

        let counters = self.counters.read().unwrap_or_else(PoisonError::into_inner);
        for (name, family) in counters.iter() {
            output.push_str(&format!("# HELP {} {}\n", name, family.help));
            output.push_str(&format!("# TYPE {} counter\n", name));
            for (labels, value) in &family.series {
                output.push_str(&format!(
                    "{}{} {}\n",
                    name,
                    labels,
                    value.load(Ordering::Relaxed)
                ));
            }
        }

        let gauges = self.gauges.read().unwrap_or_else(PoisonError::into_inner);
        for (name, family) in gauges.iter() {
            output.push_str(&format!("# HELP {} {}\n", name, family.help));
            output.push_str(&format!("# TYPE {} gauge\n", name));
            for (labels, value) in &family.series {
                output.push_str(&format!(
                    "{}{} {}\n",
                    name,
                    labels,
                    value.load(Ordering::Relaxed)
                ));
            }
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labelled_counters() {
        let m = MetricsRegistry::new();
        m.register_counter("settlements_total", "Settled reservations");
        m.counter_inc("settlements_total", &[("outcome", "committed")]);
        m.counter_add("settlements_total", &[("outcome", "committed")], 2);
        m.counter_inc("settlements_total", &[("outcome", "expired")]);
        assert_eq!(
            m.counter_value("settlements_total", &[("outcome", "committed")]),
            3
        );
        assert_eq!(
            m.counter_value("settlements_total", &[("outcome", "rolled_back")]),
            0
        );
    }

    #[test]
    fn test_unregistered_names_are_ignored() {
        let m = MetricsRegistry::new();
        m.counter_inc("nope", &[]);
        m.gauge_add("nope", &[], 4);
        assert_eq!(m.counter_value("nope", &[]), 0);
        assert!(m.render().is_empty());
    }

    #[test]
    fn test_gauges_move_both_ways() {
        let m = MetricsRegistry::new();
        m.register_gauge("outstanding", "Outstanding reservations");
        m.gauge_add("outstanding", &[], 5);
        m.gauge_add("outstanding", &[], -2);
        assert_eq!(m.gauge_value("outstanding", &[]), 3);
        m.gauge_set("outstanding", &[], 0);
        assert_eq!(m.gauge_value("outstanding", &[]), 0);
    }

    #[test]
    fn test_render_exposition_format() {
        let m = MetricsRegistry::new();
        m.register_counter("reservations_total", "Reservations created");
        m.counter_inc("reservations_total", &[]);
        m.register_gauge("outstanding", "Outstanding reservations");
        m.gauge_add("outstanding", &[("project", "p\"1")], 1);
        let out = m.render();
        assert!(out.contains("# TYPE reservations_total counter\n"));
        assert!(out.contains("reservations_total 1\n"));
        assert!(out.contains("outstanding{project=\"p\\\"1\"} 1\n"));
    }
}
