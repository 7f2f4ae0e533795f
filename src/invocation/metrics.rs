//! Per plugin+tool call metrics.
//!
//! Running counters only: entries are additive and live for the lifetime of
//! the process.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Default)]
struct CallStats {
    total: u64,
    success: u64,
    failed: u64,
    total_duration_ms: u64,
    last_call: Option<DateTime<Utc>>,
}

impl CallStats {
    fn record(&mut self, success: bool, duration: Duration) {
        self.total += 1;
        if success {
            self.success += 1;
        } else {
            self.failed += 1;
        }
        self.total_duration_ms = self
            .total_duration_ms
            .saturating_add(duration.as_millis() as u64);
        self.last_call = Some(Utc::now());
    }

    fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.success as f64 / self.total as f64
    }

    fn avg_duration_ms(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.total_duration_ms as f64 / self.total as f64
    }
}

/// Metrics for one plugin+tool pair.
#[derive(Debug, Clone, Serialize)]
pub struct ToolMetricsReport {
    pub plugin: String,
    pub tool: String,
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub total_duration_ms: u64,
    pub avg_duration_ms: f64,
    pub last_call_time: Option<DateTime<Utc>>,
}

/// Call counters keyed by (plugin, tool).
#[derive(Debug, Default)]
pub struct CallMetrics {
    stats: DashMap<(String, String), CallStats>,
}

impl CallMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one attempt.
    pub fn record(&self, plugin: &str, tool: &str, success: bool, duration: Duration) {
        self.stats
            .entry((plugin.to_string(), tool.to_string()))
            .or_default()
            .record(success, duration);
    }

    pub fn get(&self, plugin: &str, tool: &str) -> Option<ToolMetricsReport> {
        let key = (plugin.to_string(), tool.to_string());
        self.stats.get(&key).map(|s| report(&key, &s))
    }

    /// Every tracked pair, sorted by plugin then tool.
    pub fn snapshot(&self) -> Vec<ToolMetricsReport> {
        let mut reports: Vec<ToolMetricsReport> =
            self.stats.iter().map(|e| report(e.key(), e.value())).collect();
        reports.sort_by(|a, b| (&a.plugin, &a.tool).cmp(&(&b.plugin, &b.tool)));
        reports
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}

fn report(key: &(String, String), stats: &CallStats) -> ToolMetricsReport {
    ToolMetricsReport {
        plugin: key.0.clone(),
        tool: key.1.clone(),
        total: stats.total,
        success: stats.success,
        failed: stats.failed,
        success_rate: stats.success_rate(),
        total_duration_ms: stats.total_duration_ms,
        avg_duration_ms: stats.avg_duration_ms(),
        last_call_time: stats.last_call,
    }
}
