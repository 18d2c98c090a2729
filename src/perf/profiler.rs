//! Named profiling sessions
//!
//! `start_profile`/`end_profile` bracket a unit of work, capturing memory
//! snapshots at both ends and every query recorded in between. The closing
//! report aggregates query timings, heap growth, and actionable
//! recommendations.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use super::memory::current_rss_bytes;

/// Tunable limits used when generating recommendations
#[derive(Debug, Clone)]
pub struct ProfilerThresholds {
    pub avg_query_time: Duration,
    pub heap_growth_bytes: u64,
    pub query_count: u64,
}

impl Default for ProfilerThresholds {
    fn default() -> Self {
        Self {
            avg_query_time: Duration::from_millis(100),
            heap_growth_bytes: 64 * 1024 * 1024,
            query_count: 1000,
        }
    }
}

#[derive(Debug)]
struct ProfileSession {
    name: String,
    started_at: Instant,
    start_memory: u64,
    queries: Vec<(String, Duration)>,
}

/// Closing report for one profile session
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProfileReport {
    pub name: String,
    pub duration_ms: u64,
    pub query_count: u64,
    pub total_query_time_ms: u64,
    pub average_query_time_ms: f64,
    pub max_query_time_ms: u64,
    /// Signed: a session can shrink the heap
    pub heap_growth_bytes: i64,
    pub recommendations: Vec<String>,
}

/// Bracketed profiling of named work units
#[derive(Debug)]
pub struct PerformanceProfiler {
    thresholds: ProfilerThresholds,
    sessions: HashMap<u64, ProfileSession>,
    next_id: u64,
}

impl PerformanceProfiler {
    pub fn new(thresholds: ProfilerThresholds) -> Self {
        Self {
            thresholds,
            sessions: HashMap::new(),
            next_id: 1,
        }
    }

    /// Open a session and capture the starting memory snapshot
    pub fn start_profile(&mut self, name: impl Into<String>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let name = name.into();
        debug!(profile_id = id, name = %name, "profile started");
        self.sessions.insert(
            id,
            ProfileSession {
                name,
                started_at: Instant::now(),
                start_memory: current_rss_bytes(),
                queries: Vec::new(),
            },
        );
        id
    }

    /// Attribute one query execution to an open session
    pub fn record_query(&mut self, id: u64, sql: &str, duration: Duration) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.queries.push((sql.to_string(), duration));
        }
    }

    /// Attribute one query execution to every open session. Executions are
    /// captured by whichever units of work are being profiled when they run.
    pub fn record_query_all(&mut self, sql: &str, duration: Duration) {
        for session in self.sessions.values_mut() {
            session.queries.push((sql.to_string(), duration));
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Close a session and compute its report. Unknown ids return `None`.
    pub fn end_profile(&mut self, id: u64) -> Option<ProfileReport> {
        let session = self.sessions.remove(&id)?;
        let duration = session.started_at.elapsed();
        let end_memory = current_rss_bytes();
        let heap_growth = end_memory as i64 - session.start_memory as i64;

        let query_count = session.queries.len() as u64;
        let total_query_time: Duration = session.queries.iter().map(|(_, d)| *d).sum();
        let max_query_time = session
            .queries
            .iter()
            .map(|(_, d)| *d)
            .max()
            .unwrap_or(Duration::ZERO);
        let average_query_time_ms = if query_count > 0 {
            total_query_time.as_millis() as f64 / query_count as f64
        } else {
            0.0
        };

        let mut recommendations = Vec::new();
        if query_count > 0
            && average_query_time_ms > self.thresholds.avg_query_time.as_millis() as f64
        {
            recommendations.push(format!(
                "average query time {:.1}ms exceeds {}ms threshold, review statements or add indexes",
                average_query_time_ms,
                self.thresholds.avg_query_time.as_millis()
            ));
        }
        if heap_growth > self.thresholds.heap_growth_bytes as i64 {
            recommendations.push(format!(
                "heap growth {}MB exceeds {}MB threshold, check for retained result sets",
                heap_growth / (1024 * 1024),
                self.thresholds.heap_growth_bytes / (1024 * 1024)
            ));
        }
        if query_count > self.thresholds.query_count {
            recommendations.push(format!(
                "{query_count} queries in one unit of work, consider batching"
            ));
        }

        debug!(
            profile_id = id,
            name = %session.name,
            duration_ms = duration.as_millis() as u64,
            query_count,
            "profile ended"
        );

        Some(ProfileReport {
            name: session.name,
            duration_ms: duration.as_millis() as u64,
            query_count,
            total_query_time_ms: total_query_time.as_millis() as u64,
            average_query_time_ms,
            max_query_time_ms: max_query_time.as_millis() as u64,
            heap_growth_bytes: heap_growth,
            recommendations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profiler() -> PerformanceProfiler {
        PerformanceProfiler::new(ProfilerThresholds::default())
    }

    #[test]
    fn test_session_lifecycle() {
        let mut profiler = profiler();
        let id = profiler.start_profile("index-batch");
        assert_eq!(profiler.active_sessions(), 1);

        profiler.record_query(id, "SELECT 1", Duration::from_millis(5));
        profiler.record_query(id, "SELECT 2", Duration::from_millis(15));

        let report = profiler.end_profile(id).unwrap();
        assert_eq!(report.name, "index-batch");
        assert_eq!(report.query_count, 2);
        assert_eq!(report.total_query_time_ms, 20);
        assert_eq!(report.max_query_time_ms, 15);
        assert_eq!(profiler.active_sessions(), 0);
    }

    #[test]
    fn test_unknown_session_returns_none() {
        let mut profiler = profiler();
        assert!(profiler.end_profile(42).is_none());
    }

    #[test]
    fn test_slow_queries_trigger_recommendation() {
        let mut profiler = PerformanceProfiler::new(ProfilerThresholds {
            avg_query_time: Duration::from_millis(10),
            ..ProfilerThresholds::default()
        });
        let id = profiler.start_profile("slow");
        profiler.record_query(id, "SELECT * FROM big", Duration::from_millis(500));
        let report = profiler.end_profile(id).unwrap();
        assert!(
            report
                .recommendations
                .iter()
                .any(|r| r.contains("average query time")),
            "missing recommendation in {:?}",
            report.recommendations
        );
    }

    #[test]
    fn test_quiet_session_has_no_recommendations() {
        let mut profiler = profiler();
        let id = profiler.start_profile("quiet");
        profiler.record_query(id, "SELECT 1", Duration::from_millis(1));
        let report = profiler.end_profile(id).unwrap();
        assert!(report.recommendations.is_empty());
    }

    #[test]
    fn test_query_count_recommendation() {
        let mut profiler = PerformanceProfiler::new(ProfilerThresholds {
            query_count: 2,
            ..ProfilerThresholds::default()
        });
        let id = profiler.start_profile("chatty");
        for _ in 0..3 {
            profiler.record_query(id, "SELECT 1", Duration::from_millis(1));
        }
        let report = profiler.end_profile(id).unwrap();
        assert!(report.recommendations.iter().any(|r| r.contains("batching")));
    }
}
