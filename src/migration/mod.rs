//! Versioned schema migrations with a checksummed ledger
//!
//! Applied migrations are recorded in the `schema_migrations` table:
//! version, name, a blake3 fingerprint of the up/down SQL, and the
//! execution timestamp. The fingerprint is re-verified before every batch
//! so silent edits to an already-applied migration abort loudly instead of
//! diverging schemas. One `migrate()`/`migrate_to()` call runs all selected
//! migrations inside a single transaction: all-or-nothing.

use rusqlite::Connection;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ErrorCode, ServiceError};
use crate::resilience::retry::{RetryPolicy, backoff_delay};

/// SQL to create the migration ledger
const CREATE_LEDGER_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    checksum TEXT NOT NULL,
    executed_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
)
"#;

/// A versioned, immutable schema change
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub name: String,
    pub up_sql: String,
    pub down_sql: String,
}

impl Migration {
    pub fn new(
        version: i64,
        name: impl Into<String>,
        up_sql: impl Into<String>,
        down_sql: impl Into<String>,
    ) -> Self {
        Self {
            version,
            name: name.into(),
            up_sql: up_sql.into(),
            down_sql: down_sql.into(),
        }
    }

    /// Content fingerprint over both directions of the migration
    pub fn checksum(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.up_sql.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.down_sql.as_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

/// Outcome of one attempted migration, never retroactively mutated
#[derive(Debug, Clone, serde::Serialize)]
pub struct MigrationResult {
    pub version: i64,
    pub name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

/// Registry of known migrations plus the ledger operations
///
/// Operates on a single borrowed engine handle; the caller (the façade)
/// owns acquisition and release.
#[derive(Debug, Clone)]
pub struct MigrationManager {
    migrations: Vec<Migration>,
    retry: RetryPolicy,
}

impl Default for MigrationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationManager {
    pub fn new() -> Self {
        Self {
            migrations: Vec::new(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_migrations(migrations: Vec<Migration>) -> Result<Self, ServiceError> {
        let mut manager = Self::new();
        for migration in migrations {
            manager.add_migration(migration)?;
        }
        Ok(manager)
    }

    /// Register a migration; duplicate versions are rejected
    pub fn add_migration(&mut self, migration: Migration) -> Result<(), ServiceError> {
        if self.migrations.iter().any(|m| m.version == migration.version) {
            return Err(ServiceError::validation(
                "add_migration",
                "version",
                format!("duplicate migration version {}", migration.version),
            ));
        }
        self.migrations.push(migration);
        self.migrations.sort_by_key(|m| m.version);
        Ok(())
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Ensure the ledger table exists. Idempotent.
    pub fn initialize(&self, conn: &Connection) -> Result<(), ServiceError> {
        conn.execute_batch(CREATE_LEDGER_TABLE)
            .map_err(|e| ServiceError::from_sqlite("migration.initialize", &e))?;
        debug!(known_migrations = self.migrations.len(), "migration ledger ready");
        Ok(())
    }

    /// Highest version present in the ledger, 0 when none
    pub fn current_version(&self, conn: &Connection) -> Result<i64, ServiceError> {
        conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| ServiceError::from_sqlite("migration.current_version", &e))
    }

    /// Registered migrations newer than the current version, ascending
    pub fn pending(&self, conn: &Connection) -> Result<Vec<&Migration>, ServiceError> {
        let current = self.current_version(conn)?;
        Ok(self
            .migrations
            .iter()
            .filter(|m| m.version > current)
            .collect())
    }

    /// Verify that every registered migration already in the ledger still
    /// has the checksum recorded at apply time. Drift is fatal.
    fn verify_checksums(&self, conn: &Connection) -> Result<(), ServiceError> {
        let mut stmt = conn
            .prepare("SELECT version, checksum FROM schema_migrations")
            .map_err(|e| ServiceError::from_sqlite("migration.verify", &e))?;
        let ledger = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| ServiceError::from_sqlite("migration.verify", &e))?
            .collect::<rusqlite::Result<Vec<(i64, String)>>>()
            .map_err(|e| ServiceError::from_sqlite("migration.verify", &e))?;

        for (version, recorded) in ledger {
            if let Some(migration) = self.migrations.iter().find(|m| m.version == version) {
                let actual = migration.checksum();
                if actual != recorded {
                    return Err(ServiceError::migration_failed(
                        version,
                        format!(
                            "checksum drift for migration {version} ({}): ledger has {recorded}, current content is {actual}",
                            migration.name
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Apply all pending migrations inside one transaction
    pub async fn migrate(&self, conn: &mut Connection) -> Result<Vec<MigrationResult>, ServiceError> {
        let current = self.current_version(conn)?;
        let target = self.migrations.last().map(|m| m.version).unwrap_or(current);
        self.run_batch(conn, current, target.max(current)).await
    }

    /// Apply up to `target` when ahead of the ledger, or roll back above it
    /// when behind, each direction inside one transaction
    pub async fn migrate_to(
        &self,
        conn: &mut Connection,
        target: i64,
    ) -> Result<Vec<MigrationResult>, ServiceError> {
        let current = self.current_version(conn)?;
        self.run_batch(conn, current, target).await
    }

    async fn run_batch(
        &self,
        conn: &mut Connection,
        current: i64,
        target: i64,
    ) -> Result<Vec<MigrationResult>, ServiceError> {
        self.verify_checksums(conn)?;

        if target == current {
            return Ok(Vec::new());
        }

        let batch: Vec<&Migration> = if target > current {
            self.migrations
                .iter()
                .filter(|m| m.version > current && m.version <= target)
                .collect()
        } else {
            let mut down: Vec<&Migration> = self
                .migrations
                .iter()
                .filter(|m| m.version > target && m.version <= current)
                .collect();
            down.reverse();
            down
        };
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let rolling_back = target < current;

        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| ServiceError::from_sqlite("migration.begin", &e))?;

        let mut results = Vec::with_capacity(batch.len());
        let mut failure: Option<ServiceError> = None;

        for migration in batch {
            let started = Instant::now();
            let outcome = if rolling_back {
                self.apply_with_retry(conn, migration, true).await
            } else {
                self.apply_with_retry(conn, migration, false).await
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(()) => {
                    info!(
                        version = migration.version,
                        name = %migration.name,
                        direction = if rolling_back { "down" } else { "up" },
                        elapsed_ms,
                        "migration step applied"
                    );
                    results.push(MigrationResult {
                        version: migration.version,
                        name: migration.name.clone(),
                        success: true,
                        error: None,
                        execution_time_ms: elapsed_ms,
                    });
                }
                Err(err) => {
                    warn!(
                        version = migration.version,
                        name = %migration.name,
                        error = %err,
                        "migration step failed, aborting batch"
                    );
                    results.push(MigrationResult {
                        version: migration.version,
                        name: migration.name.clone(),
                        success: false,
                        error: Some(err.message.clone()),
                        execution_time_ms: elapsed_ms,
                    });
                    failure = Some(err);
                    break;
                }
            }
        }

        if let Some(err) = failure {
            // Roll the whole batch back; earlier per-step results stay in
            // the returned diagnostics even though their effects are gone
            if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                warn!(error = %rollback_err, "rollback after failed batch also failed");
            }
            let mut batch_err = ServiceError::new(
                ErrorCode::MigrationFailed,
                "migration.batch",
                err.message.clone(),
            );
            batch_err.context = err.context.clone();
            return Err(batch_err);
        }

        conn.execute_batch("COMMIT")
            .map_err(|e| ServiceError::from_sqlite("migration.commit", &e))?;
        Ok(results)
    }

    /// One migration step with bounded exponential backoff for transient
    /// failures. Non-retryable errors fail immediately.
    async fn apply_with_retry(
        &self,
        conn: &mut Connection,
        migration: &Migration,
        rollback: bool,
    ) -> Result<(), ServiceError> {
        let mut attempt = 0u32;
        loop {
            let result = if rollback {
                self.rollback_step(conn, migration)
            } else {
                self.apply_step(conn, migration)
            };
            match result {
                Ok(()) => return Ok(()),
                Err(err) => {
                    attempt += 1;
                    if !err.retryable || attempt >= self.retry.max_attempts {
                        return Err(err);
                    }
                    let delay = backoff_delay(&self.retry, attempt - 1);
                    debug!(
                        version = migration.version,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying migration step"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn apply_step(&self, conn: &Connection, migration: &Migration) -> Result<(), ServiceError> {
        conn.execute_batch(&migration.up_sql).map_err(|e| {
            ServiceError::from_sqlite(format!("migration v{}", migration.version), &e)
        })?;
        conn.execute(
            "INSERT OR REPLACE INTO schema_migrations (version, name, checksum) VALUES (?1, ?2, ?3)",
            rusqlite::params![migration.version, migration.name, migration.checksum()],
        )
        .map_err(|e| ServiceError::from_sqlite(format!("migration v{}", migration.version), &e))?;
        Ok(())
    }

    fn rollback_step(&self, conn: &Connection, migration: &Migration) -> Result<(), ServiceError> {
        conn.execute_batch(&migration.down_sql).map_err(|e| {
            ServiceError::from_sqlite(format!("migration v{} rollback", migration.version), &e)
        })?;
        conn.execute(
            "DELETE FROM schema_migrations WHERE version = ?1",
            rusqlite::params![migration.version],
        )
        .map_err(|e| {
            ServiceError::from_sqlite(format!("migration v{} rollback", migration.version), &e)
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_migrations() -> Vec<Migration> {
        vec![
            Migration::new(
                1,
                "create_files",
                "CREATE TABLE files (id INTEGER PRIMARY KEY, path TEXT NOT NULL)",
                "DROP TABLE files",
            ),
            Migration::new(
                2,
                "create_symbols",
                "CREATE TABLE symbols (id INTEGER PRIMARY KEY, file_id INTEGER REFERENCES files(id), name TEXT)",
                "DROP TABLE symbols",
            ),
            Migration::new(
                3,
                "index_symbols_name",
                "CREATE INDEX idx_symbols_name ON symbols(name)",
                "DROP INDEX idx_symbols_name",
            ),
        ]
    }

    fn manager() -> MigrationManager {
        MigrationManager::with_migrations(sample_migrations()).unwrap()
    }

    fn conn() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get::<_, i64>(0),
        )
        .unwrap()
            > 0
    }

    #[test]
    fn test_duplicate_version_rejected() {
        let mut manager = manager();
        let err = manager
            .add_migration(Migration::new(2, "dup", "SELECT 1", "SELECT 1"))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationFailed);
    }

    #[test]
    fn test_initialize_idempotent() {
        let conn = conn();
        let manager = manager();
        manager.initialize(&conn).unwrap();
        manager.initialize(&conn).unwrap();
        assert_eq!(manager.current_version(&conn).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_migrate_applies_all_ascending() {
        let mut conn = conn();
        let manager = manager();
        manager.initialize(&conn).unwrap();

        let results = manager.migrate(&mut conn).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.success));
        let versions: Vec<i64> = results.iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(manager.current_version(&conn).unwrap(), 3);
        assert!(table_exists(&conn, "files"));
        assert!(table_exists(&conn, "symbols"));
    }

    #[tokio::test]
    async fn test_migrate_idempotent() {
        let mut conn = conn();
        let manager = manager();
        manager.initialize(&conn).unwrap();
        manager.migrate(&mut conn).await.unwrap();

        let second = manager.migrate(&mut conn).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(manager.current_version(&conn).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_migrate_to_round_trip() {
        let mut conn = conn();
        let manager = manager();
        manager.initialize(&conn).unwrap();
        manager.migrate(&mut conn).await.unwrap();

        let down = manager.migrate_to(&mut conn, 1).await.unwrap();
        let versions: Vec<i64> = down.iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![3, 2], "rollback must run descending");
        assert_eq!(manager.current_version(&conn).unwrap(), 1);
        assert!(!table_exists(&conn, "symbols"));
        assert!(table_exists(&conn, "files"));

        let up = manager.migrate_to(&mut conn, 3).await.unwrap();
        assert_eq!(up.len(), 2);
        assert_eq!(manager.current_version(&conn).unwrap(), 3);
        assert!(table_exists(&conn, "symbols"));
    }

    #[tokio::test]
    async fn test_checksum_drift_fails_and_preserves_ledger() {
        let mut conn = conn();
        let manager = manager();
        manager.initialize(&conn).unwrap();
        manager.migrate(&mut conn).await.unwrap();

        // Same versions, edited content for v2
        let mut drifted = sample_migrations();
        drifted[1].up_sql.push_str(" -- edited");
        let drifted = MigrationManager::with_migrations(drifted).unwrap();

        let err = drifted.migrate(&mut conn).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::MigrationFailed);
        assert!(!err.retryable);

        // Ledger untouched
        assert_eq!(manager.current_version(&conn).unwrap(), 3);
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_failed_batch_rolls_back_everything() {
        let mut conn = conn();
        let manager = MigrationManager::with_migrations(vec![
            Migration::new(
                1,
                "good",
                "CREATE TABLE files (id INTEGER PRIMARY KEY)",
                "DROP TABLE files",
            ),
            Migration::new(2, "broken", "CREATE TABLE oops (", "SELECT 1"),
        ])
        .unwrap();
        manager.initialize(&conn).unwrap();

        let err = manager.migrate(&mut conn).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::MigrationFailed);

        // v1 was applied inside the batch but the transaction rolled back
        assert_eq!(manager.current_version(&conn).unwrap(), 0);
        assert!(!table_exists(&conn, "files"));
    }

    #[tokio::test]
    async fn test_ledger_records_checksums() {
        let mut conn = conn();
        let manager = manager();
        manager.initialize(&conn).unwrap();
        manager.migrate(&mut conn).await.unwrap();

        let recorded: String = conn
            .query_row(
                "SELECT checksum FROM schema_migrations WHERE version = 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(recorded, manager.migrations()[0].checksum());
    }

    #[test]
    fn test_checksum_covers_both_directions() {
        let a = Migration::new(1, "m", "CREATE TABLE t (id)", "DROP TABLE t");
        let mut b = a.clone();
        b.down_sql = "DROP TABLE IF EXISTS t".to_string();
        assert_ne!(a.checksum(), b.checksum());
    }
}
