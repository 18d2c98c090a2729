//! DatabaseService - the façade external callers use
//!
//! Composes the connection pool, migration manager, performance service and
//! the resilience framework. Connection acquisition and initialization run
//! under a circuit breaker; every failure is classified before it crosses
//! this boundary and fed to the rolling error aggregator that health checks
//! poll for alerts.

use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{self, DatabaseConfig};
use crate::error::{ErrorContext, ServiceError};
use crate::migration::{Migration, MigrationManager, MigrationResult};
use crate::perf::{MonitorSnapshot, PerformanceReport, PerformanceService};
use crate::pool::{ConnectionPool, PoolHealth, PoolStatus, PooledConnection};
use crate::resilience::{
    AggregatorConfig, CircuitBreaker, CircuitBreakerConfig, ErrorAggregator,
};
use crate::statement::{Row, RunResult};

/// Headline numbers for dashboards
#[derive(Debug, Clone, serde::Serialize)]
pub struct DatabaseStats {
    pub connections: u32,
    pub queries: u64,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Composite health view across pool, queries and error aggregation
#[derive(Debug, Clone, serde::Serialize)]
pub struct DatabaseHealth {
    pub status: HealthStatus,
    pub accessible: bool,
    pub pool: PoolHealth,
    pub performance: MonitorSnapshot,
    pub alerts: Vec<String>,
}

/// Options for [`DatabaseService::backup`]
#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub destination: std::path::PathBuf,
    /// Compact while copying (`VACUUM INTO`); otherwise checkpoint and copy
    /// the file as-is
    pub vacuum: bool,
}

impl BackupOptions {
    pub fn new(destination: impl Into<std::path::PathBuf>) -> Self {
        Self {
            destination: destination.into(),
            vacuum: true,
        }
    }
}

/// Outcome of a backup attempt
#[derive(Debug, Clone, serde::Serialize)]
pub struct BackupResult {
    pub success: bool,
    pub size_bytes: u64,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The storage façade: initialize, execute, migrate, backup, observe,
/// shut down
pub struct DatabaseService {
    config: DatabaseConfig,
    pool: Arc<ConnectionPool>,
    migrations: Mutex<MigrationManager>,
    perf: Mutex<Option<Arc<PerformanceService>>>,
    breaker: CircuitBreaker,
    aggregator: ErrorAggregator,
    initialized: AtomicBool,
    shutting_down: AtomicBool,
    init_lock: tokio::sync::Mutex<()>,
}

impl DatabaseService {
    /// Build the service. No connections are opened until
    /// [`initialize`](Self::initialize).
    pub fn new(
        config: DatabaseConfig,
        migrations: Vec<Migration>,
    ) -> Result<Self, ServiceError> {
        config.performance.validate()?;
        let manager = MigrationManager::with_migrations(migrations)?;

        let pool = if config.path.as_os_str() == ":memory:" {
            ConnectionPool::in_memory(config.pragmas.clone(), config.performance.pool.clone())
        } else {
            ConnectionPool::new(
                &config.path,
                config.pragmas.clone(),
                config.performance.pool.clone(),
            )
        };

        let aggregator = ErrorAggregator::new(AggregatorConfig {
            window: Duration::from_secs(60),
            max_error_rate: config.performance.monitoring.max_error_rate,
            max_critical_errors: 1,
        });

        Ok(Self {
            config,
            pool: Arc::new(pool),
            migrations: Mutex::new(manager),
            perf: Mutex::new(None),
            breaker: CircuitBreaker::new("database", CircuitBreakerConfig::default()),
            aggregator,
            initialized: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            init_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Prepare storage: ensure the directory exists, run pending
    /// migrations, start the performance service. Idempotent.
    pub async fn initialize(&self) -> Result<(), ServiceError> {
        let _guard = self.init_lock.lock().await;
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(ServiceError::connection_failed(
                "initialize",
                "service is shutting down",
            ));
        }

        if self.config.path.as_os_str() != ":memory:" {
            config::ensure_db_dir(&self.config.path)
                .map_err(|e| ServiceError::from_io("initialize", &e))?;
        }

        let mut conn = self.acquire("initialize").await?;
        let manager = self.migrations.lock().expect("migrations lock poisoned").clone();

        let migration_outcome = async {
            manager.initialize(&conn)?;
            manager.migrate(&mut conn).await
        }
        .await;

        match migration_outcome {
            Ok(results) => {
                if !results.is_empty() {
                    info!(applied = results.len(), "schema migrations applied");
                }
            }
            Err(err) => {
                self.pool.release(conn);
                self.aggregator.record(&err);
                return Err(err.with_operation("initialize"));
            }
        }

        let service = Arc::new(PerformanceService::new(
            self.config.performance.clone(),
            Arc::clone(&self.pool),
        ));
        service.start_background_loops();
        *self.perf.lock().expect("perf lock poisoned") = Some(service);

        self.pool.release(conn);
        self.initialized.store(true, Ordering::Release);
        info!(
            path = %self.config.path.display(),
            profile = %self.config.performance.profile,
            "database service initialized"
        );
        Ok(())
    }

    /// Guard shared by every public operation
    fn ensure_ready(&self, operation: &str) -> Result<Arc<PerformanceService>, ServiceError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(ServiceError::connection_failed(
                operation,
                "service is shutting down",
            ));
        }
        if !self.initialized.load(Ordering::Acquire) {
            return Err(ServiceError::connection_failed(
                operation,
                "service is not initialized",
            ));
        }
        self.perf
            .lock()
            .expect("perf lock poisoned")
            .clone()
            .ok_or_else(|| {
                ServiceError::connection_failed(operation, "performance service missing")
            })
    }

    /// Circuit-protected pool acquisition
    async fn acquire(&self, operation: &str) -> Result<PooledConnection, ServiceError> {
        let result = self
            .breaker
            .call(operation, || self.pool.acquire())
            .await;
        if let Err(err) = &result {
            self.aggregator.record(err);
        }
        result
    }

    fn fail(&self, err: ServiceError) -> ServiceError {
        self.aggregator.record(&err);
        err
    }

    // ========== Query operations ==========

    pub async fn execute_query(
        &self,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<Row>, ServiceError> {
        let perf = self.ensure_ready("execute_query")?;
        let conn = self.acquire("execute_query").await?;
        let result = perf.execute_query(&conn, sql, params);
        self.pool.release(conn);
        result.map_err(|e| self.fail(e))
    }

    pub async fn execute_one(
        &self,
        sql: &str,
        params: &[Value],
    ) -> Result<Option<Row>, ServiceError> {
        let perf = self.ensure_ready("execute_one")?;
        let conn = self.acquire("execute_one").await?;
        let result = perf.execute_one(&conn, sql, params);
        self.pool.release(conn);
        result.map_err(|e| self.fail(e))
    }

    pub async fn execute_run(
        &self,
        sql: &str,
        params: &[Value],
    ) -> Result<RunResult, ServiceError> {
        let perf = self.ensure_ready("execute_run")?;
        let conn = self.acquire("execute_run").await?;
        let result = perf.execute_run(&conn, sql, params);
        self.pool.release(conn);
        result.map_err(|e| self.fail(e))
    }

    pub async fn execute_batch(&self, sql: &str) -> Result<(), ServiceError> {
        let perf = self.ensure_ready("execute_batch")?;
        let conn = self.acquire("execute_batch").await?;
        let result = perf.execute_batch(&conn, sql);
        self.pool.release(conn);
        result.map_err(|e| self.fail(e))
    }

    pub async fn bulk_insert(
        &self,
        table: &str,
        columns: &[&str],
        rows: &[Vec<Value>],
    ) -> Result<usize, ServiceError> {
        let perf = self.ensure_ready("bulk_insert")?;
        let conn = self.acquire("bulk_insert").await?;
        let result = perf.bulk_insert(&conn, table, columns, rows);
        self.pool.release(conn);
        result.map_err(|e| self.fail(e))
    }

    /// Run a callback inside an engine transaction
    ///
    /// The configured transaction timeout (or `timeout` here, which takes
    /// precedence) converts an overrun into a Timeout error. The engine
    /// cannot preempt a running callback, so the overrun is detected when
    /// the callback finishes; the handle is then treated as unhealthy and
    /// destroyed rather than returned to the pool.
    pub async fn execute_transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Connection) -> Result<T, ServiceError>,
        timeout: Option<Duration>,
    ) -> Result<T, ServiceError> {
        let perf = self.ensure_ready("execute_transaction")?;
        let conn = self.acquire("execute_transaction").await?;
        let budget = timeout.or_else(|| self.config.transaction_timeout());

        let started = Instant::now();
        let result = perf.execute_transaction(&conn, f);
        let elapsed = started.elapsed();

        if let Some(budget) = budget
            && elapsed > budget
        {
            // The transaction already ran to completion; report the overrun
            // and dispose of the handle whose state we no longer trust
            self.pool.invalidate(conn);
            let err = ServiceError::timeout("execute_transaction", budget, elapsed);
            return Err(self.fail(err));
        }

        self.pool.release(conn);
        result.map_err(|e| self.fail(e))
    }

    // ========== Migrations ==========

    /// Register an additional migration before or after initialization
    pub fn add_migration(&self, migration: Migration) -> Result<(), ServiceError> {
        self.migrations
            .lock()
            .expect("migrations lock poisoned")
            .add_migration(migration)
    }

    /// Apply all pending migrations
    pub async fn migrate(&self) -> Result<Vec<MigrationResult>, ServiceError> {
        let perf = self.ensure_ready("migrate")?;
        let mut conn = self.acquire("migrate").await?;
        let manager = self.migrations.lock().expect("migrations lock poisoned").clone();
        let result = async {
            manager.initialize(&conn)?;
            manager.migrate(&mut conn).await
        }
        .await;
        self.pool.release(conn);
        if result.is_ok() {
            perf.mark_plans_stale();
        }
        result.map_err(|e| self.fail(e))
    }

    /// Migrate up or roll back down to an exact version
    pub async fn migrate_to(&self, target: i64) -> Result<Vec<MigrationResult>, ServiceError> {
        let perf = self.ensure_ready("migrate_to")?;
        let mut conn = self.acquire("migrate_to").await?;
        let manager = self.migrations.lock().expect("migrations lock poisoned").clone();
        let result = async {
            manager.initialize(&conn)?;
            manager.migrate_to(&mut conn, target).await
        }
        .await;
        self.pool.release(conn);
        if result.is_ok() {
            perf.mark_plans_stale();
        }
        result.map_err(|e| self.fail(e))
    }

    /// Current schema version per the ledger
    pub async fn current_version(&self) -> Result<i64, ServiceError> {
        self.ensure_ready("current_version")?;
        let conn = self.acquire("current_version").await?;
        let manager = self.migrations.lock().expect("migrations lock poisoned").clone();
        let result = manager.initialize(&conn).and_then(|()| manager.current_version(&conn));
        self.pool.release(conn);
        result.map_err(|e| self.fail(e))
    }

    // ========== Backup ==========

    /// Copy the live database to `options.destination`, creating parent
    /// directories as needed
    pub async fn backup(&self, options: BackupOptions) -> Result<BackupResult, ServiceError> {
        self.ensure_ready("backup")?;
        if self.config.path.as_os_str() == ":memory:" {
            return Err(ServiceError::validation(
                "backup",
                "path",
                "cannot back up an in-memory database",
            ));
        }

        let conn = self.acquire("backup").await?;
        let started = Instant::now();
        let outcome = Self::copy_database(&conn, &self.config.path, &options);
        self.pool.release(conn);

        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(size_bytes) => {
                info!(
                    destination = %options.destination.display(),
                    size_bytes,
                    duration_ms,
                    "backup complete"
                );
                Ok(BackupResult {
                    success: true,
                    size_bytes,
                    duration_ms,
                    error: None,
                })
            }
            Err(err) => {
                let err = self.fail(err.with_context(ErrorContext::FileSystem {
                    path: options.destination.display().to_string(),
                }));
                warn!(error = %err, "backup failed");
                Ok(BackupResult {
                    success: false,
                    size_bytes: 0,
                    duration_ms,
                    error: Some(err.message.clone()),
                })
            }
        }
    }

    fn copy_database(
        conn: &rusqlite::Connection,
        source: &Path,
        options: &BackupOptions,
    ) -> Result<u64, ServiceError> {
        if let Some(parent) = options.destination.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ServiceError::from_io("backup", &e))?;
            }
        }
        // VACUUM INTO refuses to overwrite
        let _ = std::fs::remove_file(&options.destination);

        if options.vacuum {
            conn.execute(
                "VACUUM INTO ?1",
                [options.destination.to_string_lossy().as_ref()],
            )
            .map_err(|e| ServiceError::from_sqlite("backup", &e))?;
        } else {
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)")
                .map_err(|e| ServiceError::from_sqlite("backup", &e))?;
            std::fs::copy(source, &options.destination)
                .map_err(|e| ServiceError::from_io("backup", &e))?;
        }

        let size_bytes = std::fs::metadata(&options.destination)
            .map(|m| m.len())
            .map_err(|e| ServiceError::from_io("backup", &e))?;
        Ok(size_bytes)
    }

    // ========== Observation ==========

    /// Compose pool health, query aggregates and error alerts
    pub async fn health_check(&self) -> Result<DatabaseHealth, ServiceError> {
        let perf = self.ensure_ready("health_check")?;

        let accessible = match self.acquire("health_check").await {
            Ok(conn) => {
                let ok = conn
                    .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                    .is_ok();
                self.pool.release(conn);
                ok
            }
            Err(_) => false,
        };

        let pool_health = self.pool.health_check();
        let performance = perf.monitor_snapshot();
        let mut alerts = perf.check_thresholds();
        alerts.extend(self.aggregator.check_thresholds());

        let critical_errors = self.aggregator.stats().critical_in_window > 0;
        let status = if !accessible || pool_health.status == PoolStatus::Critical || critical_errors
        {
            HealthStatus::Unhealthy
        } else if pool_health.status == PoolStatus::Warning || !alerts.is_empty() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        debug!(?status, alerts = alerts.len(), "health check");
        Ok(DatabaseHealth {
            status,
            accessible,
            pool: pool_health,
            performance,
            alerts,
        })
    }

    pub async fn get_stats(&self) -> Result<DatabaseStats, ServiceError> {
        let perf = self.ensure_ready("get_stats")?;
        let conn = self.acquire("get_stats").await?;
        let size_bytes = perf.database_size_bytes(&conn);
        self.pool.release(conn);

        Ok(DatabaseStats {
            connections: self.pool.stats().size,
            queries: perf.monitor_snapshot().total_queries,
            size_bytes: size_bytes.map_err(|e| self.fail(e))?,
        })
    }

    pub fn get_performance_report(&self) -> Result<PerformanceReport, ServiceError> {
        Ok(self.ensure_ready("get_performance_report")?.get_performance_report())
    }

    /// The composed performance service, for profiling and resource
    /// tracking
    pub fn performance(&self) -> Result<Arc<PerformanceService>, ServiceError> {
        self.ensure_ready("performance")
    }

    pub fn pool_stats(&self) -> crate::pool::ConnectionPoolStats {
        self.pool.stats()
    }

    /// Swap the performance configuration at runtime (validated first,
    /// applied atomically)
    pub fn update_performance_config(
        &self,
        new_config: crate::config::PerformanceConfig,
    ) -> Result<(), ServiceError> {
        let perf = self.ensure_ready("update_performance_config")?;
        perf.update_config(new_config)
    }

    // ========== Shutdown ==========

    /// Stop accepting work, flush the performance service within half the
    /// budget, then close the pool. Falls back to an immediate hard close
    /// when the graceful path overruns.
    pub async fn graceful_shutdown(&self, timeout: Duration) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(budget_ms = timeout.as_millis() as u64, "graceful shutdown started");

        let perf = self.perf.lock().expect("perf lock poisoned").clone();
        if let Some(perf) = perf {
            let graceful = tokio::time::timeout(timeout / 2, perf.shutdown()).await;
            if graceful.is_err() {
                warn!("performance service shutdown overran its budget, hard closing");
            }
        }

        self.pool.close_all();
        info!("database service shut down");
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for DatabaseService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseService")
            .field("path", &self.config.path)
            .field("initialized", &self.is_initialized())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PerformanceConfig;
    use crate::error::ErrorCode;

    fn init_tracing() {
        use tracing_subscriber::{EnvFilter, fmt};
        let _ = fmt().with_env_filter(EnvFilter::from_default_env()).try_init();
    }

    fn sample_migrations() -> Vec<Migration> {
        vec![
            Migration::new(
                1,
                "create_files",
                "CREATE TABLE files (id INTEGER PRIMARY KEY, path TEXT NOT NULL, size INTEGER)",
                "DROP TABLE files",
            ),
            Migration::new(
                2,
                "index_files_path",
                "CREATE INDEX idx_files_path ON files(path)",
                "DROP INDEX idx_files_path",
            ),
        ]
    }

    fn memory_service() -> DatabaseService {
        let config = DatabaseConfig::new(":memory:").with_profile(PerformanceConfig::testing());
        DatabaseService::new(config, sample_migrations()).unwrap()
    }

    #[tokio::test]
    async fn test_operations_require_initialization() {
        let service = memory_service();
        let err = service.execute_query("SELECT 1", &[]).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ConnectionFailed);
    }

    #[tokio::test]
    async fn test_initialize_runs_migrations_and_is_idempotent() {
        init_tracing();
        let service = memory_service();
        service.initialize().await.unwrap();
        service.initialize().await.unwrap();

        assert!(service.is_initialized());
        assert_eq!(service.current_version().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_failing_migration_fails_initialization() {
        let config = DatabaseConfig::new(":memory:").with_profile(PerformanceConfig::testing());
        let service = DatabaseService::new(
            config,
            vec![Migration::new(1, "broken", "CREATE TABLE oops (", "SELECT 1")],
        )
        .unwrap();

        let err = service.initialize().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::MigrationFailed);
        assert!(!service.is_initialized());
    }

    #[tokio::test]
    async fn test_query_run_roundtrip() {
        let service = memory_service();
        service.initialize().await.unwrap();

        let inserted = service
            .execute_run(
                "INSERT INTO files (path, size) VALUES (?1, ?2)",
                &[Value::from("src/lib.rs"), Value::from(2048)],
            )
            .await
            .unwrap();
        assert_eq!(inserted.changes, 1);

        let row = service
            .execute_one("SELECT path, size FROM files WHERE id = ?1", &[Value::from(1)])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["path"], Value::from("src/lib.rs"));
        assert_eq!(row["size"], Value::from(2048));
    }

    #[tokio::test]
    async fn test_transaction_commits_and_rolls_back() {
        let service = memory_service();
        service.initialize().await.unwrap();

        service
            .execute_transaction(
                |conn| {
                    conn.execute(
                        "INSERT INTO files (path, size) VALUES ('a.rs', 1)",
                        [],
                    )
                    .map_err(|e| ServiceError::from_sqlite("test", &e))?;
                    Ok(())
                },
                None,
            )
            .await
            .unwrap();

        let result: Result<(), _> = service
            .execute_transaction(
                |conn| {
                    conn.execute(
                        "INSERT INTO files (path, size) VALUES ('b.rs', 2)",
                        [],
                    )
                    .map_err(|e| ServiceError::from_sqlite("test", &e))?;
                    Err(ServiceError::internal("test", "abort"))
                },
                None,
            )
            .await;
        assert!(result.is_err());

        let rows = service.execute_query("SELECT path FROM files", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["path"], Value::from("a.rs"));
    }

    #[tokio::test]
    async fn test_transaction_overrun_becomes_timeout() {
        let service = memory_service();
        service.initialize().await.unwrap();

        let err = service
            .execute_transaction(
                |_conn| {
                    std::thread::sleep(Duration::from_millis(30));
                    Ok(())
                },
                Some(Duration::from_millis(1)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::OperationTimeout);

        // The poisoned handle was destroyed, the pool recovers
        assert!(service.pool_stats().destroyed >= 1);
        let rows = service.execute_query("SELECT 1 AS one", &[]).await.unwrap();
        assert_eq!(rows[0]["one"], Value::from(1));
    }

    #[tokio::test]
    async fn test_migrate_to_round_trip_through_facade() {
        let service = memory_service();
        service.initialize().await.unwrap();
        assert_eq!(service.current_version().await.unwrap(), 2);

        service.migrate_to(1).await.unwrap();
        assert_eq!(service.current_version().await.unwrap(), 1);

        service.migrate_to(2).await.unwrap();
        assert_eq!(service.current_version().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_health_check_healthy_service() {
        let service = memory_service();
        service.initialize().await.unwrap();
        service.execute_query("SELECT 1 AS one", &[]).await.unwrap();

        let health = service.health_check().await.unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.accessible);
        assert!(health.alerts.is_empty(), "alerts: {:?}", health.alerts);
    }

    #[tokio::test]
    async fn test_stats_report_counts() {
        let service = memory_service();
        service.initialize().await.unwrap();
        for _ in 0..3 {
            service.execute_query("SELECT 1 AS one", &[]).await.unwrap();
        }

        let stats = service.get_stats().await.unwrap();
        assert_eq!(stats.queries, 3);
        assert!(stats.connections >= 1);
        assert!(stats.size_bytes > 0);

        let report = service.get_performance_report().unwrap();
        assert_eq!(report.total_queries, 3);
        assert_eq!(report.cache.hits, 2);
    }

    #[tokio::test]
    async fn test_backup_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig::new(dir.path().join("index.db"))
            .with_profile(PerformanceConfig::testing());
        let service = DatabaseService::new(config, sample_migrations()).unwrap();
        service.initialize().await.unwrap();
        service
            .execute_run(
                "INSERT INTO files (path, size) VALUES ('a.rs', 1)",
                &[],
            )
            .await
            .unwrap();

        let destination = dir.path().join("backups").join("index.bak.db");
        let result = service
            .backup(BackupOptions::new(&destination))
            .await
            .unwrap();
        assert!(result.success, "backup error: {:?}", result.error);
        assert!(result.size_bytes > 0);

        // The copy is a valid database containing the row
        let copy = rusqlite::Connection::open(&destination).unwrap();
        let count: i64 = copy
            .query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_backup_rejected_for_memory_database() {
        let service = memory_service();
        service.initialize().await.unwrap();
        let err = service
            .backup(BackupOptions::new("/tmp/nope.db"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationFailed);
    }

    #[tokio::test]
    async fn test_graceful_shutdown_blocks_new_work() {
        init_tracing();
        let service = memory_service();
        service.initialize().await.unwrap();
        service.graceful_shutdown(Duration::from_millis(500)).await;

        let err = service.execute_query("SELECT 1", &[]).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ConnectionFailed);
        assert!(service.is_shutting_down());

        // Second shutdown is a no-op
        service.graceful_shutdown(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn test_duplicate_migration_rejected_through_facade() {
        let service = memory_service();
        let err = service
            .add_migration(Migration::new(1, "dup", "SELECT 1", "SELECT 1"))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationFailed);
    }
}
