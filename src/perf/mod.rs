//! Performance Layer - monitored execution over pooled connections
//!
//! Composes the query cache, statement optimizer, execution monitor,
//! resource manager and profiler behind one service. Every execute
//! operation times the call, records it with the monitor, and - for reads
//! only - consults and populates the result cache. Two background loops run
//! independently of caller requests: a periodic optimization pass and a
//! periodic leaked-resource cleanup.

pub mod cache;
pub mod memory;
pub mod monitor;
pub mod optimizer;
pub mod profiler;
pub mod resources;

pub use cache::{QueryCache, QueryCacheStats};
pub use monitor::{MonitorSnapshot, PerformanceMonitor, QueryMetrics, SlowQuery};
pub use optimizer::{OptimizedQuery, QueryOptimizer};
pub use profiler::{PerformanceProfiler, ProfileReport, ProfilerThresholds};
pub use resources::{ResourceKind, ResourceLeak, ResourceManager};

use rusqlite::Connection;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PerformanceConfig;
use crate::error::ServiceError;
use crate::pool::ConnectionPool;
use crate::statement::{self, Row, RunResult};

/// Everything a report consumer needs in one structure
#[derive(Debug, Clone, serde::Serialize)]
pub struct PerformanceReport {
    pub total_queries: u64,
    pub average_execution_time_ms: f64,
    pub slow_queries: u64,
    pub top_slow_queries: Vec<SlowQuery>,
    pub connection_pool: crate::pool::ConnectionPoolStats,
    pub memory_usage_bytes: u64,
    pub cache: QueryCacheStats,
    pub error_rate: f64,
    pub total_failures: u64,
}

/// Monitored query/run/transaction execution plus background maintenance
pub struct PerformanceService {
    config: Mutex<PerformanceConfig>,
    pool: Arc<ConnectionPool>,
    cache: Mutex<QueryCache>,
    optimizer: Mutex<QueryOptimizer>,
    monitor: Mutex<PerformanceMonitor>,
    resources: Mutex<ResourceManager>,
    profiler: Mutex<PerformanceProfiler>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PerformanceService {
    pub fn new(config: PerformanceConfig, pool: Arc<ConnectionPool>) -> Self {
        let leak_threshold = config.monitoring.leak_age_threshold();
        Self {
            cache: Mutex::new(QueryCache::new(config.query_cache.clone())),
            optimizer: Mutex::new(QueryOptimizer::new(config.plan_cache.clone())),
            monitor: Mutex::new(PerformanceMonitor::new(config.monitoring.clone())),
            resources: Mutex::new(ResourceManager::new(leak_threshold)),
            profiler: Mutex::new(PerformanceProfiler::new(ProfilerThresholds::default())),
            config: Mutex::new(config),
            pool,
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn record(
        &self,
        statement_text: &str,
        duration: Duration,
        success: bool,
        row_count: usize,
        error: Option<&ServiceError>,
    ) {
        self.monitor.lock().expect("monitor lock poisoned").record(
            statement_text,
            duration,
            success,
            row_count,
            error.map(|e| e.code),
        );
        self.profiler
            .lock()
            .expect("profiler lock poisoned")
            .record_query_all(statement_text, duration);
    }

    /// Execute a read statement, serving and populating the result cache
    pub fn execute_query(
        &self,
        conn: &Connection,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<Row>, ServiceError> {
        let started = Instant::now();
        let cacheable = statement::is_read_statement(sql);
        let key = cacheable.then(|| QueryCache::key(sql, params));

        if let Some(key) = &key
            && let Some(rows) = self.cache.lock().expect("cache lock poisoned").get(key)
        {
            self.record(sql, started.elapsed(), true, rows.len(), None);
            return Ok((*rows).clone());
        }

        let optimized = self
            .optimizer
            .lock()
            .expect("optimizer lock poisoned")
            .optimize(conn, sql);

        match statement::query_rows(conn, &optimized.sql, params) {
            Ok(rows) => {
                self.record(sql, started.elapsed(), true, rows.len(), None);
                if let Some(key) = key {
                    self.cache
                        .lock()
                        .expect("cache lock poisoned")
                        .put(key, Arc::new(rows.clone()));
                }
                Ok(rows)
            }
            Err(err) => {
                let classified = ServiceError::from_sqlite("execute_query", &err)
                    .with_context(crate::error::ErrorContext::Database {
                        statement: sql.to_string(),
                        params: params.to_vec(),
                    });
                self.record(sql, started.elapsed(), false, 0, Some(&classified));
                Err(classified)
            }
        }
    }

    /// Execute a read statement expecting at most one row
    pub fn execute_one(
        &self,
        conn: &Connection,
        sql: &str,
        params: &[Value],
    ) -> Result<Option<Row>, ServiceError> {
        Ok(self.execute_query(conn, sql, params)?.into_iter().next())
    }

    /// Execute a write statement. Writes never touch the cache.
    pub fn execute_run(
        &self,
        conn: &Connection,
        sql: &str,
        params: &[Value],
    ) -> Result<RunResult, ServiceError> {
        let started = Instant::now();
        match statement::run(conn, sql, params) {
            Ok(result) => {
                self.record(sql, started.elapsed(), true, result.changes, None);
                Ok(result)
            }
            Err(err) => {
                let classified = ServiceError::from_sqlite("execute_run", &err).with_context(
                    crate::error::ErrorContext::Database {
                        statement: sql.to_string(),
                        params: params.to_vec(),
                    },
                );
                self.record(sql, started.elapsed(), false, 0, Some(&classified));
                Err(classified)
            }
        }
    }

    /// Run a callback inside an engine transaction, rolling back on error
    pub fn execute_transaction<T>(
        &self,
        conn: &Connection,
        f: impl FnOnce(&Connection) -> Result<T, ServiceError>,
    ) -> Result<T, ServiceError> {
        let started = Instant::now();
        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| ServiceError::from_sqlite("execute_transaction", &e))?;
        match f(conn) {
            Ok(value) => {
                conn.execute_batch("COMMIT")
                    .map_err(|e| ServiceError::from_sqlite("execute_transaction", &e))?;
                self.record("transaction", started.elapsed(), true, 0, None);
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                    warn!(error = %rollback_err, "transaction rollback failed");
                }
                let classified = ServiceError::transaction_failed(
                    "execute_transaction",
                    err.message.clone(),
                );
                self.record("transaction", started.elapsed(), false, 0, Some(&classified));
                Err(classified)
            }
        }
    }

    /// Execute a multi-statement batch (DDL, maintenance)
    pub fn execute_batch(&self, conn: &Connection, sql: &str) -> Result<(), ServiceError> {
        let started = Instant::now();
        match conn.execute_batch(sql) {
            Ok(()) => {
                self.record(sql, started.elapsed(), true, 0, None);
                // Schema may have changed under the cached plans
                self.optimizer
                    .lock()
                    .expect("optimizer lock poisoned")
                    .mark_all_stale();
                Ok(())
            }
            Err(err) => {
                let classified = ServiceError::from_sqlite("execute_batch", &err);
                self.record(sql, started.elapsed(), false, 0, Some(&classified));
                Err(classified)
            }
        }
    }

    /// Insert many rows through one prepared statement in one transaction
    pub fn bulk_insert(
        &self,
        conn: &Connection,
        table: &str,
        columns: &[&str],
        rows: &[Vec<Value>],
    ) -> Result<usize, ServiceError> {
        if !is_identifier(table) || columns.iter().any(|c| !is_identifier(c)) {
            return Err(ServiceError::validation(
                "bulk_insert",
                "table",
                format!("invalid table or column identifier for bulk insert into {table}"),
            ));
        }
        if columns.is_empty() {
            return Err(ServiceError::validation(
                "bulk_insert",
                "columns",
                "bulk insert requires at least one column",
            ));
        }

        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {table} ({}) VALUES ({})",
            columns.join(", "),
            placeholders.join(", ")
        );

        let started = Instant::now();
        let inserted = self.execute_transaction(conn, |conn| {
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| ServiceError::from_sqlite("bulk_insert", &e))?;
            let mut inserted = 0usize;
            for row in rows {
                if row.len() != columns.len() {
                    return Err(ServiceError::validation(
                        "bulk_insert",
                        "rows",
                        format!(
                            "row has {} values but {} columns were named",
                            row.len(),
                            columns.len()
                        ),
                    ));
                }
                let bound = statement::bind_params(row);
                stmt.execute(rusqlite::params_from_iter(bound))
                    .map_err(|e| ServiceError::from_sqlite("bulk_insert", &e))?;
                inserted += 1;
            }
            Ok(inserted)
        })?;
        debug!(
            table,
            rows = inserted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "bulk insert committed"
        );
        Ok(inserted)
    }

    // ========== Profiling ==========

    pub fn start_profile(&self, name: impl Into<String>) -> u64 {
        self.profiler
            .lock()
            .expect("profiler lock poisoned")
            .start_profile(name)
    }

    pub fn end_profile(&self, id: u64) -> Option<ProfileReport> {
        self.profiler
            .lock()
            .expect("profiler lock poisoned")
            .end_profile(id)
    }

    // ========== Resource tracking ==========

    pub fn register_resource(&self, kind: ResourceKind, size_bytes: u64) -> u64 {
        self.resources
            .lock()
            .expect("resources lock poisoned")
            .register(kind, size_bytes)
    }

    pub fn touch_resource(&self, id: u64) {
        self.resources
            .lock()
            .expect("resources lock poisoned")
            .touch(id);
    }

    pub fn unregister_resource(&self, id: u64) {
        self.resources
            .lock()
            .expect("resources lock poisoned")
            .unregister(id);
    }

    pub fn detect_resource_leaks(&self) -> Vec<ResourceLeak> {
        self.resources
            .lock()
            .expect("resources lock poisoned")
            .detect_leaks()
    }

    // ========== Reports ==========

    pub fn get_performance_report(&self) -> PerformanceReport {
        let snapshot = self.monitor.lock().expect("monitor lock poisoned").snapshot();
        let cache_stats = self.cache.lock().expect("cache lock poisoned").stats();
        PerformanceReport {
            total_queries: snapshot.total_queries,
            average_execution_time_ms: snapshot.average_execution_time_ms,
            slow_queries: snapshot.slow_query_count,
            top_slow_queries: snapshot.top_slow_queries,
            connection_pool: self.pool.stats(),
            memory_usage_bytes: memory::current_rss_bytes(),
            cache: cache_stats,
            error_rate: snapshot.error_rate,
            total_failures: snapshot.total_failures,
        }
    }

    pub fn monitor_snapshot(&self) -> MonitorSnapshot {
        self.monitor.lock().expect("monitor lock poisoned").snapshot()
    }

    /// Invalidate plan freshness after out-of-band schema changes
    /// (migrations run outside the monitored execute path)
    pub fn mark_plans_stale(&self) {
        self.optimizer
            .lock()
            .expect("optimizer lock poisoned")
            .mark_all_stale();
    }

    /// Alert strings from live aggregates against configured limits
    pub fn check_thresholds(&self) -> Vec<String> {
        self.monitor
            .lock()
            .expect("monitor lock poisoned")
            .check_thresholds(&self.pool.stats(), memory::current_rss_bytes())
    }

    /// Size of the database file behind this connection, in bytes
    pub fn database_size_bytes(&self, conn: &Connection) -> Result<u64, ServiceError> {
        let page_count: u64 = conn
            .query_row("PRAGMA page_count", [], |row| row.get(0))
            .map_err(|e| ServiceError::from_sqlite("database_size", &e))?;
        let page_size: u64 = conn
            .query_row("PRAGMA page_size", [], |row| row.get(0))
            .map_err(|e| ServiceError::from_sqlite("database_size", &e))?;
        Ok(page_count * page_size)
    }

    // ========== Background loops ==========

    /// Spawn the optimization and leak-cleanup loops. Idempotent per call
    /// site: the façade calls this once at initialization.
    pub fn start_background_loops(self: &Arc<Self>) {
        let (retention, memory_check) = {
            let config = self.config.lock().expect("config lock poisoned");
            (
                config.monitoring.metrics_retention(),
                config.monitoring.memory_check_interval(),
            )
        };
        let mut tasks = self.tasks.lock().expect("tasks lock poisoned");

        let service = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(retention);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                service.run_optimization_pass().await;
            }
        }));

        let service = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(memory_check);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                service.run_cleanup_pass();
            }
        }));
        debug!(
            optimization_interval_ms = retention.as_millis() as u64,
            cleanup_interval_ms = memory_check.as_millis() as u64,
            "performance background loops started"
        );
    }

    /// Re-analyze and free stale plans and metrics. Never holds a pooled
    /// connection across an await.
    pub async fn run_optimization_pass(&self) {
        let retention = self
            .config
            .lock()
            .expect("config lock poisoned")
            .monitoring
            .metrics_retention();
        self.monitor
            .lock()
            .expect("monitor lock poisoned")
            .prune(retention);
        self.cache.lock().expect("cache lock poisoned").prune_expired();
        self.optimizer
            .lock()
            .expect("optimizer lock poisoned")
            .mark_all_stale();

        match self.pool.acquire().await {
            Ok(conn) => {
                if let Err(err) = conn.execute_batch("PRAGMA optimize") {
                    debug!(error = %err, "engine optimize pass skipped");
                }
                self.pool.release(conn);
            }
            Err(err) => debug!(error = %err, "optimization pass could not borrow a connection"),
        }
        debug!("optimization pass complete");
    }

    /// Close high-severity leaked resources
    pub fn run_cleanup_pass(&self) {
        let removed = self
            .resources
            .lock()
            .expect("resources lock poisoned")
            .cleanup_leaked();
        if !removed.is_empty() {
            info!(closed = removed.len(), "leaked resources closed");
        }
    }

    /// Validate and apply a new configuration atomically
    ///
    /// An invalid configuration is rejected without any partial
    /// application. Caches whose sizing or TTL changed are cleared, and
    /// background loops are restarted when their intervals changed.
    pub fn update_config(
        self: &Arc<Self>,
        new_config: PerformanceConfig,
    ) -> Result<(), ServiceError> {
        new_config.validate()?;

        let old_config = {
            let mut config = self.config.lock().expect("config lock poisoned");
            let old = config.clone();
            *config = new_config.clone();
            old
        };

        if old_config.query_cache != new_config.query_cache {
            self.cache
                .lock()
                .expect("cache lock poisoned")
                .reconfigure(new_config.query_cache.clone());
        }
        if old_config.plan_cache != new_config.plan_cache {
            self.optimizer
                .lock()
                .expect("optimizer lock poisoned")
                .reconfigure(new_config.plan_cache.clone());
        }
        if old_config.monitoring != new_config.monitoring {
            self.monitor
                .lock()
                .expect("monitor lock poisoned")
                .reconfigure(new_config.monitoring.clone());
            self.resources
                .lock()
                .expect("resources lock poisoned")
                .set_leak_age_threshold(new_config.monitoring.leak_age_threshold());
        }
        if old_config.pool != new_config.pool {
            warn!("pool sizing changes require service reconstruction, ignoring");
        }

        let intervals_changed = old_config.monitoring.metrics_retention_ms
            != new_config.monitoring.metrics_retention_ms
            || old_config.monitoring.memory_check_interval_ms
                != new_config.monitoring.memory_check_interval_ms;
        if intervals_changed {
            self.stop_background_loops();
            self.start_background_loops();
        }

        info!(profile = %new_config.profile, "performance configuration updated");
        Ok(())
    }

    pub fn current_config(&self) -> PerformanceConfig {
        self.config.lock().expect("config lock poisoned").clone()
    }

    fn stop_background_loops(&self) {
        let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    /// Stop loops and run one final maintenance pass
    pub async fn shutdown(&self) {
        self.stop_background_loops();
        let retention = self
            .config
            .lock()
            .expect("config lock poisoned")
            .monitoring
            .metrics_retention();
        self.monitor
            .lock()
            .expect("monitor lock poisoned")
            .prune(retention);
        self.cache.lock().expect("cache lock poisoned").prune_expired();
        self.run_cleanup_pass();
        info!("performance service shut down");
    }
}

impl std::fmt::Debug for PerformanceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceService")
            .field("profile", &self.config.lock().expect("config lock poisoned").profile)
            .finish()
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
