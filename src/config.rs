//! Typed configuration structs and performance profiles
//!
//! All components receive their configuration at construction; there are no
//! ambient globals. Profiles are immutable templates - the constructors
//! hand out fresh deep copies, never shared references. Overrides are
//! applied through explicit per-struct merge functions with typed optional
//! fields, so unknown settings are rejected at compile time.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ServiceError;

/// Engine tuning applied to every connection at creation time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PragmaConfig {
    pub journal_mode: String,
    pub synchronous: String,
    /// Negative values are KiB, positive values are pages (engine semantics)
    pub cache_size: i64,
    pub temp_store: String,
    pub locking_mode: String,
    pub foreign_keys: bool,
    pub busy_timeout_ms: u64,
    pub mmap_size: u64,
}

impl Default for PragmaConfig {
    fn default() -> Self {
        Self {
            journal_mode: "WAL".to_string(),
            synchronous: "NORMAL".to_string(),
            cache_size: -64000,
            temp_store: "MEMORY".to_string(),
            locking_mode: "NORMAL".to_string(),
            foreign_keys: true,
            busy_timeout_ms: 5000,
            mmap_size: 268_435_456,
        }
    }
}

impl PragmaConfig {
    /// Render as a batch of PRAGMA statements in application order
    pub fn to_sql(&self) -> String {
        format!(
            "PRAGMA journal_mode={}; \
             PRAGMA synchronous={}; \
             PRAGMA cache_size={}; \
             PRAGMA temp_store={}; \
             PRAGMA locking_mode={}; \
             PRAGMA foreign_keys={}; \
             PRAGMA busy_timeout={}; \
             PRAGMA mmap_size={};",
            self.journal_mode,
            self.synchronous,
            self.cache_size,
            self.temp_store,
            self.locking_mode,
            if self.foreign_keys { "ON" } else { "OFF" },
            self.busy_timeout_ms,
            self.mmap_size,
        )
    }
}

/// Connection pool sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout_ms: 5000,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Query result cache sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryCacheConfig {
    pub enabled: bool,
    pub max_entries: usize,
    pub ttl_ms: u64,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 500,
            ttl_ms: 60_000,
        }
    }
}

impl QueryCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Prepared-plan cache sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanCacheConfig {
    pub max_entries: usize,
}

impl Default for PlanCacheConfig {
    fn default() -> Self {
        Self { max_entries: 200 }
    }
}

/// Monitoring thresholds, retention and memory limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub slow_query_threshold_ms: u64,
    pub slow_query_log_size: usize,
    /// Also the period of the background optimization pass
    pub metrics_retention_ms: u64,
    /// Errors per minute before an alert is raised
    pub max_error_rate: f64,
    /// Pool utilization in [0,1] before an alert is raised
    pub max_pool_utilization: f64,
    pub max_memory_bytes: u64,
    /// Also the period of the background leak-cleanup pass
    pub memory_check_interval_ms: u64,
    /// Age and idle time a tracked resource must both exceed to count as a
    /// leak candidate
    pub leak_age_threshold_ms: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            slow_query_threshold_ms: 100,
            slow_query_log_size: 50,
            metrics_retention_ms: 300_000,
            max_error_rate: 10.0,
            max_pool_utilization: 0.8,
            max_memory_bytes: 512 * 1024 * 1024,
            memory_check_interval_ms: 30_000,
            leak_age_threshold_ms: 60_000,
        }
    }
}

impl MonitoringConfig {
    pub fn slow_query_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_query_threshold_ms)
    }

    pub fn metrics_retention(&self) -> Duration {
        Duration::from_millis(self.metrics_retention_ms)
    }

    pub fn memory_check_interval(&self) -> Duration {
        Duration::from_millis(self.memory_check_interval_ms)
    }

    pub fn leak_age_threshold(&self) -> Duration {
        Duration::from_millis(self.leak_age_threshold_ms)
    }
}

/// A named bundle of pool/cache/monitoring settings tuned for a deployment
/// scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub profile: String,
    pub pool: PoolConfig,
    pub query_cache: QueryCacheConfig,
    pub plan_cache: PlanCacheConfig,
    pub monitoring: MonitoringConfig,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self::development()
    }
}

impl PerformanceConfig {
    /// Small pool, short TTLs, aggressive slow-query threshold
    pub fn development() -> Self {
        Self {
            profile: "development".to_string(),
            pool: PoolConfig {
                max_connections: 5,
                acquire_timeout_ms: 5000,
            },
            query_cache: QueryCacheConfig {
                enabled: true,
                max_entries: 500,
                ttl_ms: 60_000,
            },
            plan_cache: PlanCacheConfig { max_entries: 200 },
            monitoring: MonitoringConfig::default(),
        }
    }

    pub fn production() -> Self {
        Self {
            profile: "production".to_string(),
            pool: PoolConfig {
                max_connections: 10,
                acquire_timeout_ms: 10_000,
            },
            query_cache: QueryCacheConfig {
                enabled: true,
                max_entries: 2000,
                ttl_ms: 300_000,
            },
            plan_cache: PlanCacheConfig { max_entries: 500 },
            monitoring: MonitoringConfig {
                slow_query_threshold_ms: 500,
                slow_query_log_size: 100,
                metrics_retention_ms: 3_600_000,
                max_error_rate: 5.0,
                max_pool_utilization: 0.85,
                max_memory_bytes: 2 * 1024 * 1024 * 1024,
                memory_check_interval_ms: 60_000,
                leak_age_threshold_ms: 300_000,
            },
        }
    }

    /// Tiny pool and near-immediate expiry so tests exercise eviction paths
    pub fn testing() -> Self {
        Self {
            profile: "testing".to_string(),
            pool: PoolConfig {
                max_connections: 2,
                acquire_timeout_ms: 1000,
            },
            query_cache: QueryCacheConfig {
                enabled: true,
                max_entries: 100,
                ttl_ms: 5000,
            },
            plan_cache: PlanCacheConfig { max_entries: 50 },
            monitoring: MonitoringConfig {
                slow_query_threshold_ms: 50,
                slow_query_log_size: 20,
                metrics_retention_ms: 60_000,
                max_error_rate: 100.0,
                max_pool_utilization: 0.9,
                max_memory_bytes: 1024 * 1024 * 1024,
                memory_check_interval_ms: 5000,
                leak_age_threshold_ms: 10_000,
            },
        }
    }

    pub fn large_repository() -> Self {
        Self {
            profile: "large-repository".to_string(),
            pool: PoolConfig {
                max_connections: 16,
                acquire_timeout_ms: 15_000,
            },
            query_cache: QueryCacheConfig {
                enabled: true,
                max_entries: 5000,
                ttl_ms: 600_000,
            },
            plan_cache: PlanCacheConfig { max_entries: 1000 },
            monitoring: MonitoringConfig {
                slow_query_threshold_ms: 1000,
                slow_query_log_size: 200,
                metrics_retention_ms: 3_600_000,
                max_error_rate: 5.0,
                max_pool_utilization: 0.85,
                max_memory_bytes: 4 * 1024 * 1024 * 1024,
                memory_check_interval_ms: 60_000,
                leak_age_threshold_ms: 300_000,
            },
        }
    }

    pub fn low_memory() -> Self {
        Self {
            profile: "low-memory".to_string(),
            pool: PoolConfig {
                max_connections: 2,
                acquire_timeout_ms: 5000,
            },
            query_cache: QueryCacheConfig {
                enabled: true,
                max_entries: 100,
                ttl_ms: 30_000,
            },
            plan_cache: PlanCacheConfig { max_entries: 50 },
            monitoring: MonitoringConfig {
                slow_query_threshold_ms: 200,
                slow_query_log_size: 20,
                metrics_retention_ms: 120_000,
                max_error_rate: 10.0,
                max_pool_utilization: 0.8,
                max_memory_bytes: 128 * 1024 * 1024,
                memory_check_interval_ms: 15_000,
                leak_age_threshold_ms: 60_000,
            },
        }
    }

    pub fn cicd() -> Self {
        Self {
            profile: "cicd".to_string(),
            pool: PoolConfig {
                max_connections: 4,
                acquire_timeout_ms: 5000,
            },
            query_cache: QueryCacheConfig {
                enabled: true,
                max_entries: 200,
                ttl_ms: 30_000,
            },
            plan_cache: PlanCacheConfig { max_entries: 100 },
            monitoring: MonitoringConfig {
                slow_query_threshold_ms: 200,
                slow_query_log_size: 50,
                metrics_retention_ms: 300_000,
                max_error_rate: 20.0,
                max_pool_utilization: 0.9,
                max_memory_bytes: 512 * 1024 * 1024,
                memory_check_interval_ms: 30_000,
                leak_age_threshold_ms: 60_000,
            },
        }
    }

    /// Look up a profile by name
    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "development" => Some(Self::development()),
            "production" => Some(Self::production()),
            "testing" => Some(Self::testing()),
            "large-repository" => Some(Self::large_repository()),
            "low-memory" => Some(Self::low_memory()),
            "cicd" => Some(Self::cicd()),
            _ => None,
        }
    }

    /// Map repository size to a profile name
    pub fn recommended_profile(file_count: u64) -> &'static str {
        if file_count < 1000 {
            "development"
        } else if file_count < 10_000 {
            "production"
        } else {
            "large-repository"
        }
    }

    /// Reject zero or contradictory sizing before it reaches a component
    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.pool.max_connections == 0 {
            return Err(ServiceError::configuration(
                "validate_config",
                "pool.max_connections must be at least 1",
            ));
        }
        if self.pool.acquire_timeout_ms == 0 {
            return Err(ServiceError::configuration(
                "validate_config",
                "pool.acquire_timeout_ms must be positive",
            ));
        }
        if self.query_cache.enabled && self.query_cache.max_entries == 0 {
            return Err(ServiceError::configuration(
                "validate_config",
                "query_cache.max_entries must be positive when the cache is enabled",
            ));
        }
        if self.query_cache.enabled && self.query_cache.ttl_ms == 0 {
            return Err(ServiceError::configuration(
                "validate_config",
                "query_cache.ttl_ms must be positive when the cache is enabled",
            ));
        }
        if self.plan_cache.max_entries == 0 {
            return Err(ServiceError::configuration(
                "validate_config",
                "plan_cache.max_entries must be positive",
            ));
        }
        if !(0.0..=1.0).contains(&self.monitoring.max_pool_utilization) {
            return Err(ServiceError::configuration(
                "validate_config",
                "monitoring.max_pool_utilization must be within [0, 1]",
            ));
        }
        if self.monitoring.metrics_retention_ms == 0
            || self.monitoring.memory_check_interval_ms == 0
        {
            return Err(ServiceError::configuration(
                "validate_config",
                "monitoring intervals must be positive",
            ));
        }
        Ok(())
    }

    /// Apply typed overrides, returning the merged copy
    pub fn merge(&self, overrides: PerformanceOverrides) -> Self {
        let mut merged = self.clone();
        if let Some(max) = overrides.max_connections {
            merged.pool.max_connections = max;
        }
        if let Some(timeout) = overrides.acquire_timeout_ms {
            merged.pool.acquire_timeout_ms = timeout;
        }
        if let Some(enabled) = overrides.query_cache_enabled {
            merged.query_cache.enabled = enabled;
        }
        if let Some(entries) = overrides.query_cache_entries {
            merged.query_cache.max_entries = entries;
        }
        if let Some(ttl) = overrides.query_cache_ttl_ms {
            merged.query_cache.ttl_ms = ttl;
        }
        if let Some(entries) = overrides.plan_cache_entries {
            merged.plan_cache.max_entries = entries;
        }
        if let Some(threshold) = overrides.slow_query_threshold_ms {
            merged.monitoring.slow_query_threshold_ms = threshold;
        }
        if let Some(limit) = overrides.max_memory_bytes {
            merged.monitoring.max_memory_bytes = limit;
        }
        merged
    }
}

/// Optional overrides for [`PerformanceConfig::merge`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceOverrides {
    pub max_connections: Option<u32>,
    pub acquire_timeout_ms: Option<u64>,
    pub query_cache_enabled: Option<bool>,
    pub query_cache_entries: Option<usize>,
    pub query_cache_ttl_ms: Option<u64>,
    pub plan_cache_entries: Option<usize>,
    pub slow_query_threshold_ms: Option<u64>,
    pub max_memory_bytes: Option<u64>,
}

/// Top-level configuration for the storage service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub pragmas: PragmaConfig,
    /// When set, transactions exceeding this budget fail with a timeout
    pub transaction_timeout_ms: Option<u64>,
    pub performance: PerformanceConfig,
}

impl DatabaseConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pragmas: PragmaConfig::default(),
            transaction_timeout_ms: None,
            performance: PerformanceConfig::default(),
        }
    }

    pub fn with_profile(mut self, profile: PerformanceConfig) -> Self {
        self.performance = profile;
        self
    }

    pub fn transaction_timeout(&self) -> Option<Duration> {
        self.transaction_timeout_ms.map(Duration::from_millis)
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("indexstore.toml")
}

/// Load a [`DatabaseConfig`] from a TOML file, `Ok(None)` if absent
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Option<DatabaseConfig>> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&path)?;
    let config: DatabaseConfig = toml::from_str(&contents)?;
    Ok(Some(config))
}

pub fn write_config(path: &Path, config: &DatabaseConfig, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("config already exists at {} (use force to overwrite)", path.display());
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Create the parent directory of the database file if missing
pub fn ensure_db_dir(db_path: &Path) -> std::io::Result<()> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profiles_are_deep_copies() {
        let mut a = PerformanceConfig::production();
        let b = PerformanceConfig::production();
        a.pool.max_connections = 99;
        assert_eq!(b.pool.max_connections, 10);
    }

    #[test]
    fn test_profile_lookup() {
        for name in [
            "development",
            "production",
            "testing",
            "large-repository",
            "low-memory",
            "cicd",
        ] {
            let profile = PerformanceConfig::by_name(name).unwrap();
            assert_eq!(profile.profile, name);
            profile.validate().unwrap();
        }
        assert!(PerformanceConfig::by_name("staging").is_none());
    }

    #[test]
    fn test_recommended_profile_boundaries() {
        assert_eq!(PerformanceConfig::recommended_profile(0), "development");
        assert_eq!(PerformanceConfig::recommended_profile(999), "development");
        assert_eq!(PerformanceConfig::recommended_profile(1000), "production");
        assert_eq!(PerformanceConfig::recommended_profile(9999), "production");
        assert_eq!(
            PerformanceConfig::recommended_profile(10_000),
            "large-repository"
        );
    }

    #[test]
    fn test_validate_rejects_zero_pool() {
        let mut config = PerformanceConfig::development();
        config.pool.max_connections = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_utilization() {
        let mut config = PerformanceConfig::development();
        config.monitoring.max_pool_utilization = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_merge_is_selective() {
        let base = PerformanceConfig::development();
        let merged = base.merge(PerformanceOverrides {
            max_connections: Some(8),
            query_cache_ttl_ms: Some(123),
            ..Default::default()
        });
        assert_eq!(merged.pool.max_connections, 8);
        assert_eq!(merged.query_cache.ttl_ms, 123);
        // Untouched fields keep the template values
        assert_eq!(merged.plan_cache.max_entries, base.plan_cache.max_entries);
    }

    #[test]
    fn test_pragma_sql_render() {
        let sql = PragmaConfig::default().to_sql();
        assert!(sql.contains("PRAGMA journal_mode=WAL"));
        assert!(sql.contains("PRAGMA foreign_keys=ON"));
        assert!(sql.contains("PRAGMA busy_timeout=5000"));
    }

    #[test]
    fn test_config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("indexstore.toml");
        let config = DatabaseConfig::new("/tmp/index.db")
            .with_profile(PerformanceConfig::testing());
        write_config(&path, &config, false).unwrap();
        let loaded = load_config(Some(&path)).unwrap().unwrap();
        assert_eq!(loaded.performance.profile, "testing");
        assert_eq!(loaded.path, PathBuf::from("/tmp/index.db"));
    }
}
