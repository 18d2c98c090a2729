//! Rolling-window error aggregation
//!
//! Collects classified errors by kind and operation over a sliding window
//! to compute an error rate (errors/minute) and surface the most frequent
//! failure kind. The façade polls this during health checks to raise
//! alerts when the rate or the critical-error count crosses thresholds.

use crate::error::{ErrorCode, ErrorKind, ServiceError};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Aggregation window and alert thresholds
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub window: Duration,
    /// Errors per minute above which an alert is raised
    pub max_error_rate: f64,
    /// Count of critical errors (corruption, permission) in the window
    /// above which an alert is raised
    pub max_critical_errors: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_error_rate: 10.0,
            max_critical_errors: 1,
        }
    }
}

#[derive(Debug, Clone)]
struct ErrorEvent {
    kind: ErrorKind,
    code: ErrorCode,
    operation: String,
    at: Instant,
}

/// Aggregate view over the current window
#[derive(Debug, Clone, Serialize, Default)]
pub struct ErrorStats {
    pub total_in_window: u64,
    pub errors_per_minute: f64,
    pub critical_in_window: u64,
    pub most_frequent_kind: Option<ErrorKind>,
    pub by_operation: HashMap<String, u64>,
}

/// Internally-synchronized rolling error window
#[derive(Debug)]
pub struct ErrorAggregator {
    config: AggregatorConfig,
    events: Mutex<Vec<ErrorEvent>>,
}

fn is_critical(code: ErrorCode) -> bool {
    matches!(
        code,
        ErrorCode::DatabaseCorruption | ErrorCode::PermissionDenied
    )
}

impl ErrorAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn record(&self, err: &ServiceError) {
        let mut events = self.events.lock().expect("aggregator lock poisoned");
        let now = Instant::now();
        Self::prune(&mut events, now, self.config.window);
        events.push(ErrorEvent {
            kind: err.kind,
            code: err.code,
            operation: err.operation.clone(),
            at: now,
        });
    }

    fn prune(events: &mut Vec<ErrorEvent>, now: Instant, window: Duration) {
        events.retain(|e| now.duration_since(e.at) <= window);
    }

    /// Errors per minute over the window
    pub fn error_rate(&self) -> f64 {
        self.stats().errors_per_minute
    }

    pub fn stats(&self) -> ErrorStats {
        let mut events = self.events.lock().expect("aggregator lock poisoned");
        let now = Instant::now();
        Self::prune(&mut events, now, self.config.window);

        let total = events.len() as u64;
        let minutes = self.config.window.as_secs_f64() / 60.0;
        let rate = if minutes > 0.0 {
            total as f64 / minutes
        } else {
            0.0
        };

        let mut by_kind: HashMap<ErrorKind, u64> = HashMap::new();
        let mut by_operation: HashMap<String, u64> = HashMap::new();
        let mut critical = 0u64;
        for event in events.iter() {
            *by_kind.entry(event.kind).or_default() += 1;
            *by_operation.entry(event.operation.clone()).or_default() += 1;
            if is_critical(event.code) {
                critical += 1;
            }
        }
        let most_frequent_kind = by_kind
            .into_iter()
            .max_by_key(|(_, count)| *count)
            .map(|(kind, _)| kind);

        ErrorStats {
            total_in_window: total,
            errors_per_minute: rate,
            critical_in_window: critical,
            most_frequent_kind,
            by_operation,
        }
    }

    /// Alert strings for thresholds currently exceeded
    pub fn check_thresholds(&self) -> Vec<String> {
        let stats = self.stats();
        let mut alerts = Vec::new();
        if stats.errors_per_minute > self.config.max_error_rate {
            alerts.push(format!(
                "error rate {:.1}/min exceeds limit {:.1}/min",
                stats.errors_per_minute, self.config.max_error_rate
            ));
        }
        if stats.critical_in_window > self.config.max_critical_errors {
            alerts.push(format!(
                "{} critical errors in the last {}s (limit {})",
                stats.critical_in_window,
                self.config.window.as_secs(),
                self.config.max_critical_errors
            ));
        }
        alerts
    }

    pub fn clear(&self) {
        self.events.lock().expect("aggregator lock poisoned").clear();
    }
}
