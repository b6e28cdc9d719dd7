//! Operation Metrics
//!
//! Per-operation timings and outcomes, with slow-query logging and simple
//! aggregation. Samples are kept in a bounded in-memory window.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::warn;

pub const DEFAULT_SLOW_QUERY_MS: u64 = 1000;
const DEFAULT_CAPACITY: usize = 10_000;

/// One measured operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationMetric {
    pub operation: String,
    pub model: String,
    pub tenant_id: Option<String>,
    pub duration_ms: u64,
    pub success: bool,
    pub rows: usize,
    pub cache_hit: bool,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate for one operation name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationStats {
    pub count: u64,
    pub errors: u64,
    pub cache_hits: u64,
    pub avg_duration_ms: f64,
    pub max_duration_ms: u64,
}

pub struct MetricsCollector {
    samples: Mutex<VecDeque<OperationMetric>>,
    capacity: usize,
    slow_query_threshold: Duration,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_SLOW_QUERY_MS))
    }
}

impl MetricsCollector {
    pub fn new(slow_query_threshold: Duration) -> Self {
        Self {
            samples: Mutex::new(VecDeque::new()),
            capacity: DEFAULT_CAPACITY,
            slow_query_threshold,
        }
    }

    /// Start timing an operation
    pub fn start(&self, operation: &str, model: &str, tenant_id: Option<&str>) -> OperationTimer<'_> {
        OperationTimer {
            collector: self,
            operation: operation.to_string(),
            model: model.to_string(),
            tenant_id: tenant_id.map(str::to_string),
            started: Instant::now(),
        }
    }

    pub fn record(&self, metric: OperationMetric) {
        if metric.duration_ms > self.slow_query_threshold.as_millis() as u64 {
            warn!(
                op = %metric.operation,
                model = %metric.model,
                duration_ms = metric.duration_ms,
                "slow query"
            );
        }
        let mut samples = self.samples.lock();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(metric);
    }

    pub fn samples(&self, model: Option<&str>) -> Vec<OperationMetric> {
        self.samples
            .lock()
            .iter()
            .filter(|m| model.map(|name| m.model == name).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub fn slow_queries(&self) -> Vec<OperationMetric> {
        let threshold = self.slow_query_threshold.as_millis() as u64;
        self.samples
            .lock()
            .iter()
            .filter(|m| m.duration_ms > threshold)
            .cloned()
            .collect()
    }

    /// Stats per operation name
    pub fn aggregate(&self) -> BTreeMap<String, OperationStats> {
        let mut totals: BTreeMap<String, (OperationStats, u64)> = BTreeMap::new();
        for m in self.samples.lock().iter() {
            let (stats, total_ms) = totals.entry(m.operation.clone()).or_default();
            stats.count += 1;
            if !m.success {
                stats.errors += 1;
            }
            if m.cache_hit {
                stats.cache_hits += 1;
            }
            stats.max_duration_ms = stats.max_duration_ms.max(m.duration_ms);
            *total_ms += m.duration_ms;
        }
        totals
            .into_iter()
            .map(|(op, (mut stats, total_ms))| {
                stats.avg_duration_ms = total_ms as f64 / stats.count as f64;
                (op, stats)
            })
            .collect()
    }

    pub fn reset(&self) {
        self.samples.lock().clear();
    }
}

pub struct OperationTimer<'a> {
    collector: &'a MetricsCollector,
    operation: String,
    model: String,
    tenant_id: Option<String>,
    started: Instant,
}

impl OperationTimer<'_> {
    pub fn finish(self, success: bool, rows: usize, cache_hit: bool, error: Option<String>) {
        let metric = OperationMetric {
            operation: self.operation,
            model: self.model,
            tenant_id: self.tenant_id,
            duration_ms: self.started.elapsed().as_millis() as u64,
            success,
            rows,
            cache_hit,
            error,
            timestamp: Utc::now(),
        };
        self.collector.record(metric);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(op: &str, ms: u64, success: bool) -> OperationMetric {
        OperationMetric {
            operation: op.to_string(),
            model: "User".to_string(),
            tenant_id: None,
            duration_ms: ms,
            success,
            rows: 1,
            cache_hit: false,
            error: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_aggregate() {
        let collector = MetricsCollector::default();
        collector.record(metric("read", 10, true));
        collector.record(metric("read", 30, false));
        collector.record(metric("create", 5, true));

        let stats = collector.aggregate();
        assert_eq!(stats["read"].count, 2);
        assert_eq!(stats["read"].errors, 1);
        assert_eq!(stats["read"].avg_duration_ms, 20.0);
        assert_eq!(stats["read"].max_duration_ms, 30);
        assert_eq!(stats["create"].count, 1);
    }

    #[test]
    fn test_slow_queries() {
        let collector = MetricsCollector::new(Duration::from_millis(100));
        collector.record(metric("read", 50, true));
        collector.record(metric("read", 150, true));
        assert_eq!(collector.slow_queries().len(), 1);
    }

    #[test]
    fn test_timer_records_sample() {
        let collector = MetricsCollector::default();
        collector.start("create", "Order", Some("t1")).finish(true, 1, false, None);
        let samples = collector.samples(Some("Order"));
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].tenant_id.as_deref(), Some("t1"));
        assert!(collector.samples(Some("User")).is_empty());
    }
}
