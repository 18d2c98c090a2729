//! # Indexstore - storage and resilience core for code indexing
//!
//! The database engine underneath a code-indexing service.
//!
//! Indexstore provides:
//! - Connection pool over embedded SQLite with FIFO waiting and
//!   utilization-based health
//! - Checksummed, transactional schema migrations with rollback
//! - Query/result caching, statement optimization, execution monitoring,
//!   leak detection and profiling under configurable performance profiles
//! - A typed, retry-aware error taxonomy with circuit breaking and
//!   error-rate aggregation
//! - A façade service composing all of the above for external callers

pub mod config;
pub mod error;
pub mod migration;
pub mod perf;
pub mod pool;
pub mod resilience;
pub mod service;
pub mod statement;

// Re-exports for convenient access
pub use config::{DatabaseConfig, PerformanceConfig, PragmaConfig};
pub use error::{ErrorCode, ErrorContext, ErrorKind, ErrorResponse, ServiceError};
pub use migration::{Migration, MigrationManager, MigrationResult};
pub use perf::{PerformanceReport, PerformanceService};
pub use pool::{ConnectionPool, ConnectionPoolStats, PooledConnection};
pub use resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use service::{
    BackupOptions, BackupResult, DatabaseHealth, DatabaseService, DatabaseStats, HealthStatus,
};
pub use statement::{Row, RunResult};

/// Result type alias for storage operations
pub type Result<T> = std::result::Result<T, ServiceError>;
