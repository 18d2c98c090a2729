//! Execution monitoring - rolling per-statement aggregates, slow-query
//! log, threshold alerts

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime};
use tracing::warn;

use crate::config::MonitoringConfig;
use crate::error::ErrorCode;
use crate::pool::ConnectionPoolStats;
use crate::statement::statement_hash;

/// Rolling aggregates for one statement shape
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueryMetrics {
    pub statement_hash: String,
    pub count: u64,
    pub total_time_ms: u64,
    pub avg_time_ms: f64,
    pub min_time_ms: u64,
    pub max_time_ms: u64,
    pub successes: u64,
    pub failures: u64,
    pub rows_returned: u64,
    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

impl QueryMetrics {
    fn new(statement_hash: String) -> Self {
        Self {
            statement_hash,
            count: 0,
            total_time_ms: 0,
            avg_time_ms: 0.0,
            min_time_ms: u64::MAX,
            max_time_ms: 0,
            successes: 0,
            failures: 0,
            rows_returned: 0,
            last_seen: None,
        }
    }
}

/// One slow execution retained for diagnostics
#[derive(Debug, Clone, serde::Serialize)]
pub struct SlowQuery {
    pub statement: String,
    pub duration_ms: u64,
    pub timestamp: SystemTime,
}

/// Aggregate view for reports
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct MonitorSnapshot {
    pub total_queries: u64,
    pub total_failures: u64,
    pub average_execution_time_ms: f64,
    pub slow_query_count: u64,
    pub error_rate: f64,
    pub top_slow_queries: Vec<SlowQuery>,
}

/// Records every execution and keeps rolling aggregates plus a bounded
/// slow-query log
#[derive(Debug)]
pub struct PerformanceMonitor {
    config: MonitoringConfig,
    metrics: HashMap<String, QueryMetrics>,
    slow_queries: Vec<SlowQuery>,
    total_queries: u64,
    total_failures: u64,
    total_time_ms: u64,
    slow_query_count: u64,
}

impl PerformanceMonitor {
    pub fn new(config: MonitoringConfig) -> Self {
        Self {
            config,
            metrics: HashMap::new(),
            slow_queries: Vec::new(),
            total_queries: 0,
            total_failures: 0,
            total_time_ms: 0,
            slow_query_count: 0,
        }
    }

    /// Record one execution
    pub fn record(
        &mut self,
        statement: &str,
        duration: Duration,
        success: bool,
        row_count: usize,
        error_code: Option<ErrorCode>,
    ) {
        let duration_ms = duration.as_millis() as u64;
        self.total_queries += 1;
        self.total_time_ms += duration_ms;
        if !success {
            self.total_failures += 1;
            if let Some(code) = error_code {
                warn!(code = %code, statement, "monitored execution failed");
            }
        }

        let hash = statement_hash(statement);
        let entry = self
            .metrics
            .entry(hash.clone())
            .or_insert_with(|| QueryMetrics::new(hash));
        entry.count += 1;
        entry.rows_returned += row_count as u64;
        entry.total_time_ms += duration_ms;
        entry.avg_time_ms = entry.total_time_ms as f64 / entry.count as f64;
        entry.min_time_ms = entry.min_time_ms.min(duration_ms);
        entry.max_time_ms = entry.max_time_ms.max(duration_ms);
        entry.last_seen = Some(Instant::now());
        if success {
            entry.successes += 1;
        } else {
            entry.failures += 1;
        }

        if duration >= self.config.slow_query_threshold() {
            self.slow_query_count += 1;
            self.slow_queries.push(SlowQuery {
                statement: statement.to_string(),
                duration_ms,
                timestamp: SystemTime::now(),
            });
            // Keep only the worst N
            self.slow_queries
                .sort_by(|a, b| b.duration_ms.cmp(&a.duration_ms));
            self.slow_queries.truncate(self.config.slow_query_log_size);
        }
    }

    pub fn metrics_for(&self, statement: &str) -> Option<&QueryMetrics> {
        self.metrics.get(&statement_hash(statement))
    }

    pub fn tracked_statements(&self) -> usize {
        self.metrics.len()
    }

    /// Compare live aggregates against configured limits
    pub fn check_thresholds(
        &self,
        pool_stats: &ConnectionPoolStats,
        memory_bytes: u64,
    ) -> Vec<String> {
        let mut alerts = Vec::new();

        if self.total_queries > 0 {
            let slow_rate = self.slow_query_count as f64 / self.total_queries as f64;
            if slow_rate > 0.1 {
                alerts.push(format!(
                    "slow query rate {:.0}% exceeds 10% (threshold {}ms)",
                    slow_rate * 100.0,
                    self.config.slow_query_threshold_ms
                ));
            }
            let error_rate = self.total_failures as f64 / self.total_queries as f64;
            if error_rate > 0.05 {
                alerts.push(format!(
                    "query error rate {:.0}% exceeds 5%",
                    error_rate * 100.0
                ));
            }
        }

        if pool_stats.size > 0 {
            let utilization =
                f64::from(pool_stats.size - pool_stats.available) / f64::from(pool_stats.size);
            if utilization > self.config.max_pool_utilization {
                alerts.push(format!(
                    "pool utilization {:.0}% exceeds {:.0}%",
                    utilization * 100.0,
                    self.config.max_pool_utilization * 100.0
                ));
            }
        }

        if memory_bytes > self.config.max_memory_bytes {
            alerts.push(format!(
                "memory usage {}MB exceeds limit {}MB",
                memory_bytes / (1024 * 1024),
                self.config.max_memory_bytes / (1024 * 1024)
            ));
        }

        alerts
    }

    /// Drop per-statement aggregates not seen within the retention window
    pub fn prune(&mut self, retention: Duration) {
        self.metrics.retain(|_, m| {
            m.last_seen
                .map(|seen| seen.elapsed() <= retention)
                .unwrap_or(false)
        });
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            total_queries: self.total_queries,
            total_failures: self.total_failures,
            average_execution_time_ms: if self.total_queries > 0 {
                self.total_time_ms as f64 / self.total_queries as f64
            } else {
                0.0
            },
            slow_query_count: self.slow_query_count,
            error_rate: if self.total_queries > 0 {
                self.total_failures as f64 / self.total_queries as f64
            } else {
                0.0
            },
            top_slow_queries: self.slow_queries.clone(),
        }
    }

    pub fn reconfigure(&mut self, config: MonitoringConfig) {
        self.config = config;
        self.slow_queries.truncate(self.config.slow_query_log_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(slow_ms: u64, log_size: usize) -> PerformanceMonitor {
        PerformanceMonitor::new(MonitoringConfig {
            slow_query_threshold_ms: slow_ms,
            slow_query_log_size: log_size,
            ..MonitoringConfig::default()
        })
    }

    fn pool_stats(size: u32, available: u32) -> ConnectionPoolStats {
        ConnectionPoolStats {
            size,
            available,
            ..ConnectionPoolStats::default()
        }
    }

    #[test]
    fn test_aggregates_roll_up() {
        let mut monitor = monitor(1000, 10);
        monitor.record("SELECT 1", Duration::from_millis(10), true, 1, None);
        monitor.record("SELECT 1", Duration::from_millis(30), true, 1, None);
        monitor.record("select  1", Duration::from_millis(20), false, 0, Some(ErrorCode::QueryFailed));

        let metrics = monitor.metrics_for("SELECT 1").unwrap();
        assert_eq!(metrics.count, 3, "formatting variants share one bucket");
        assert_eq!(metrics.min_time_ms, 10);
        assert_eq!(metrics.max_time_ms, 30);
        assert_eq!(metrics.successes, 2);
        assert_eq!(metrics.failures, 1);
        assert!((metrics.avg_time_ms - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_slow_query_log_bounded_and_ranked() {
        let mut monitor = monitor(5, 2);
        monitor.record("q1", Duration::from_millis(10), true, 0, None);
        monitor.record("q2", Duration::from_millis(50), true, 0, None);
        monitor.record("q3", Duration::from_millis(30), true, 0, None);

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.slow_query_count, 3);
        assert_eq!(snapshot.top_slow_queries.len(), 2);
        assert_eq!(snapshot.top_slow_queries[0].statement, "q2");
        assert_eq!(snapshot.top_slow_queries[1].statement, "q3");
    }

    #[test]
    fn test_fast_queries_not_logged() {
        let mut monitor = monitor(100, 10);
        monitor.record("q", Duration::from_millis(5), true, 0, None);
        assert_eq!(monitor.snapshot().slow_query_count, 0);
    }

    #[test]
    fn test_threshold_alerts() {
        let mut monitor = PerformanceMonitor::new(MonitoringConfig {
            slow_query_threshold_ms: 1,
            max_pool_utilization: 0.8,
            max_memory_bytes: 100,
            ..MonitoringConfig::default()
        });
        for _ in 0..10 {
            monitor.record("q", Duration::from_millis(10), false, 0, None);
        }

        let alerts = monitor.check_thresholds(&pool_stats(10, 0), 1000);
        assert!(alerts.iter().any(|a| a.contains("slow query rate")));
        assert!(alerts.iter().any(|a| a.contains("error rate")));
        assert!(alerts.iter().any(|a| a.contains("pool utilization")));
        assert!(alerts.iter().any(|a| a.contains("memory usage")));
    }

    #[test]
    fn test_no_alerts_when_healthy() {
        let mut monitor = monitor(1000, 10);
        monitor.record("q", Duration::from_millis(1), true, 1, None);
        let alerts = monitor.check_thresholds(&pool_stats(10, 8), 0);
        assert!(alerts.is_empty(), "unexpected alerts: {alerts:?}");
    }

    #[test]
    fn test_prune_drops_stale_metrics() {
        let mut monitor = monitor(1000, 10);
        monitor.record("q", Duration::from_millis(1), true, 0, None);
        assert_eq!(monitor.tracked_statements(), 1);
        monitor.prune(Duration::ZERO);
        assert_eq!(monitor.tracked_statements(), 0);
        // Totals survive pruning
        assert_eq!(monitor.snapshot().total_queries, 1);
    }
}
