//! Typed error taxonomy shared by every storage component
//!
//! Every failure that crosses a component boundary is a [`ServiceError`]:
//! a kind/code pair, a human-readable message, the operation that failed,
//! a retryability flag, and a typed context payload. Raw failures from the
//! engine or the filesystem are converted through [`ServiceError::classify`]
//! so callers never see an unclassified error.

use serde::Serialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Broad failure categories (the `type` axis of an error)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Parsing,
    FileSystem,
    Network,
    Timeout,
    Resource,
    Database,
    Configuration,
    Service,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Parsing => "parsing",
            ErrorKind::FileSystem => "file_system",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Resource => "resource",
            ErrorKind::Database => "database",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Service => "service",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Specific failure codes (the `code` axis of an error)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationFailed,
    ParseFailed,
    FileSystemError,
    NetworkError,
    OperationTimeout,
    ResourceExhausted,
    ConnectionFailed,
    QueryFailed,
    TransactionFailed,
    MigrationFailed,
    ConstraintViolation,
    DatabaseCorruption,
    PermissionDenied,
    ConfigurationInvalid,
    ServiceUnavailable,
    CircuitOpen,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::ParseFailed => "PARSE_FAILED",
            ErrorCode::FileSystemError => "FILE_SYSTEM_ERROR",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::OperationTimeout => "OPERATION_TIMEOUT",
            ErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::QueryFailed => "QUERY_FAILED",
            ErrorCode::TransactionFailed => "TRANSACTION_FAILED",
            ErrorCode::MigrationFailed => "MIGRATION_FAILED",
            ErrorCode::ConstraintViolation => "CONSTRAINT_VIOLATION",
            ErrorCode::DatabaseCorruption => "DATABASE_CORRUPTION",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::ConfigurationInvalid => "CONFIGURATION_INVALID",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::CircuitOpen => "CIRCUIT_OPEN",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    /// Kind this code belongs to
    pub fn kind(&self) -> ErrorKind {
        match self {
            ErrorCode::ValidationFailed => ErrorKind::Validation,
            ErrorCode::ParseFailed => ErrorKind::Parsing,
            ErrorCode::FileSystemError | ErrorCode::PermissionDenied => ErrorKind::FileSystem,
            ErrorCode::NetworkError => ErrorKind::Network,
            ErrorCode::OperationTimeout => ErrorKind::Timeout,
            ErrorCode::ResourceExhausted => ErrorKind::Resource,
            ErrorCode::ConnectionFailed
            | ErrorCode::QueryFailed
            | ErrorCode::TransactionFailed
            | ErrorCode::MigrationFailed
            | ErrorCode::ConstraintViolation
            | ErrorCode::DatabaseCorruption => ErrorKind::Database,
            ErrorCode::ConfigurationInvalid => ErrorKind::Configuration,
            ErrorCode::ServiceUnavailable | ErrorCode::CircuitOpen | ErrorCode::Internal => {
                ErrorKind::Service
            }
        }
    }

    /// Default retryability per code. Connection faults and timeouts are
    /// transient; constraint violations, corruption and permission errors
    /// will not heal on retry.
    pub fn default_retryable(&self) -> bool {
        match self {
            ErrorCode::ConnectionFailed
            | ErrorCode::OperationTimeout
            | ErrorCode::NetworkError
            | ErrorCode::ResourceExhausted
            | ErrorCode::ServiceUnavailable => true,
            ErrorCode::QueryFailed | ErrorCode::TransactionFailed => false,
            ErrorCode::ValidationFailed
            | ErrorCode::ParseFailed
            | ErrorCode::FileSystemError
            | ErrorCode::MigrationFailed
            | ErrorCode::ConstraintViolation
            | ErrorCode::DatabaseCorruption
            | ErrorCode::PermissionDenied
            | ErrorCode::ConfigurationInvalid
            | ErrorCode::CircuitOpen
            | ErrorCode::Internal => false,
        }
    }

    /// Base delay before the first retry of an error with this code.
    /// Exponential backoff doubles from here, capped by the caller.
    pub fn base_retry_delay(&self) -> Duration {
        match self {
            ErrorCode::NetworkError | ErrorCode::ConnectionFailed => Duration::from_millis(100),
            ErrorCode::OperationTimeout | ErrorCode::ServiceUnavailable => {
                Duration::from_millis(250)
            }
            ErrorCode::ResourceExhausted => Duration::from_millis(1000),
            _ => Duration::from_millis(500),
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed context payload carried by an error, one shape per failure family
#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "snake_case", tag = "context")]
pub enum ErrorContext {
    #[default]
    None,
    Database {
        statement: String,
        params: Vec<serde_json::Value>,
    },
    Timeout {
        operation: String,
        timeout_ms: u64,
        elapsed_ms: u64,
    },
    Resource {
        resource: String,
        current_usage: u64,
        limit: u64,
    },
    Validation {
        field: String,
        value: String,
    },
    FileSystem {
        path: String,
    },
}

/// A classified, retry-aware error
///
/// Instances are created at the failure site and flow upward immutably;
/// [`with_context`](ServiceError::with_context) and friends return enriched
/// copies rather than mutating in place.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code} in {operation}: {message}")]
pub struct ServiceError {
    pub kind: ErrorKind,
    pub code: ErrorCode,
    pub message: String,
    pub timestamp: SystemTime,
    pub operation: String,
    pub retryable: bool,
    pub retry_after: Option<Duration>,
    pub context: ErrorContext,
}

impl ServiceError {
    /// Build an error from a code, inheriting the code's kind and default
    /// retryability
    pub fn new(code: ErrorCode, operation: impl Into<String>, message: impl Into<String>) -> Self {
        let retryable = code.default_retryable();
        let retry_after = retryable.then(|| code.base_retry_delay());
        Self {
            kind: code.kind(),
            code,
            message: message.into(),
            timestamp: SystemTime::now(),
            operation: operation.into(),
            retryable,
            retry_after,
            context: ErrorContext::None,
        }
    }

    // ========== Static constructors for common failure shapes ==========

    pub fn connection_failed(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConnectionFailed, operation, message)
    }

    pub fn query_failed(operation: impl Into<String>, statement: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::QueryFailed, operation, message).with_context(ErrorContext::Database {
            statement: statement.to_string(),
            params: Vec::new(),
        })
    }

    pub fn transaction_failed(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TransactionFailed, operation, message)
    }

    pub fn migration_failed(version: i64, message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::MigrationFailed,
            format!("migration v{version}"),
            message,
        )
    }

    pub fn timeout(operation: impl Into<String>, timeout: Duration, elapsed: Duration) -> Self {
        let operation = operation.into();
        Self::new(
            ErrorCode::OperationTimeout,
            operation.clone(),
            format!(
                "operation timed out after {}ms (limit {}ms)",
                elapsed.as_millis(),
                timeout.as_millis()
            ),
        )
        .with_context(ErrorContext::Timeout {
            operation,
            timeout_ms: timeout.as_millis() as u64,
            elapsed_ms: elapsed.as_millis() as u64,
        })
    }

    pub fn resource_exhausted(
        operation: impl Into<String>,
        resource: impl Into<String>,
        current_usage: u64,
        limit: u64,
    ) -> Self {
        let resource = resource.into();
        Self::new(
            ErrorCode::ResourceExhausted,
            operation,
            format!("{resource} exhausted ({current_usage}/{limit})"),
        )
        .with_context(ErrorContext::Resource {
            resource,
            current_usage,
            limit,
        })
    }

    pub fn constraint_violation(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConstraintViolation, operation, message)
    }

    pub fn corruption(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DatabaseCorruption, operation, message)
    }

    pub fn permission_denied(operation: impl Into<String>, path: &str) -> Self {
        Self::new(
            ErrorCode::PermissionDenied,
            operation,
            format!("permission denied: {path}"),
        )
        .with_context(ErrorContext::FileSystem {
            path: path.to_string(),
        })
    }

    pub fn validation(
        operation: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let field = field.into();
        let message = message.into();
        Self::new(ErrorCode::ValidationFailed, operation, message.clone()).with_context(
            ErrorContext::Validation {
                field,
                value: message,
            },
        )
    }

    pub fn configuration(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationInvalid, operation, message)
    }

    pub fn circuit_open(operation: impl Into<String>, retry_after: Duration) -> Self {
        let mut err = Self::new(
            ErrorCode::CircuitOpen,
            operation,
            "circuit breaker is open, failing fast",
        );
        err.retry_after = Some(retry_after);
        err
    }

    pub fn internal(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, operation, message)
    }

    // ========== Copy-with enrichment ==========

    /// Return a copy carrying the given typed context
    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = context;
        self
    }

    /// Return a copy attributed to a different operation
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    /// Return a copy with retryability overridden at the call site
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self.retry_after = retryable.then(|| self.code.base_retry_delay());
        self
    }

    /// Classify an engine error into the taxonomy
    ///
    /// Busy/locked contention is a retryable connection-class fault;
    /// constraint violations, corruption and permission problems map to
    /// their dedicated non-retryable codes.
    pub fn from_sqlite(operation: impl Into<String>, err: &rusqlite::Error) -> Self {
        use rusqlite::ffi::ErrorCode as Sqlite;
        let operation = operation.into();
        if let rusqlite::Error::SqliteFailure(ffi, detail) = err {
            let message = detail.clone().unwrap_or_else(|| ffi.to_string());
            return match ffi.code {
                Sqlite::DatabaseBusy | Sqlite::DatabaseLocked => {
                    Self::connection_failed(operation, message)
                }
                Sqlite::ConstraintViolation => Self::constraint_violation(operation, message),
                Sqlite::DatabaseCorrupt | Sqlite::NotADatabase => {
                    Self::corruption(operation, message)
                }
                Sqlite::PermissionDenied | Sqlite::ReadOnly => {
                    Self::new(ErrorCode::PermissionDenied, operation, message)
                }
                Sqlite::CannotOpen => Self::new(ErrorCode::FileSystemError, operation, message),
                Sqlite::OutOfMemory | Sqlite::DiskFull => {
                    Self::new(ErrorCode::ResourceExhausted, operation, message)
                }
                _ => Self::new(ErrorCode::QueryFailed, operation, message),
            };
        }
        Self::new(ErrorCode::QueryFailed, operation, err.to_string())
    }

    /// Classify an IO error into the taxonomy
    pub fn from_io(operation: impl Into<String>, err: &std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        let operation = operation.into();
        match err.kind() {
            Io::PermissionDenied => {
                Self::new(ErrorCode::PermissionDenied, operation, err.to_string())
            }
            Io::TimedOut => Self::new(ErrorCode::OperationTimeout, operation, err.to_string()),
            Io::ConnectionRefused | Io::ConnectionReset | Io::ConnectionAborted => {
                Self::new(ErrorCode::NetworkError, operation, err.to_string())
            }
            _ => Self::new(ErrorCode::FileSystemError, operation, err.to_string()),
        }
    }

    /// Classify an arbitrary raw failure
    ///
    /// Checks for an existing `ServiceError`, then known source types, then
    /// falls back to keyword matching on the message. Unrecognizable
    /// failures become a generic non-retryable service error.
    pub fn classify(operation: impl Into<String>, err: &(dyn std::error::Error + 'static)) -> Self {
        let operation = operation.into();
        if let Some(service) = err.downcast_ref::<ServiceError>() {
            return service.clone();
        }
        if let Some(sqlite) = err.downcast_ref::<rusqlite::Error>() {
            return Self::from_sqlite(operation, sqlite);
        }
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            return Self::from_io(operation, io);
        }
        Self::classify_message(operation, &err.to_string())
    }

    /// Keyword fallback for failures with no recognizable source type
    pub fn classify_message(operation: impl Into<String>, message: &str) -> Self {
        let operation = operation.into();
        let lower = message.to_lowercase();
        let code = if lower.contains("timeout") || lower.contains("timed out") {
            ErrorCode::OperationTimeout
        } else if lower.contains("permission") || lower.contains("access denied") {
            ErrorCode::PermissionDenied
        } else if lower.contains("no such file") || lower.contains("file") {
            ErrorCode::FileSystemError
        } else if lower.contains("network") || lower.contains("socket") {
            ErrorCode::NetworkError
        } else if lower.contains("connection") || lower.contains("connect") {
            ErrorCode::ConnectionFailed
        } else if lower.contains("constraint") {
            ErrorCode::ConstraintViolation
        } else if lower.contains("corrupt") || lower.contains("malformed") {
            ErrorCode::DatabaseCorruption
        } else {
            ErrorCode::Internal
        };
        Self::new(code, operation, message)
    }

    /// Structured response suitable for returning to an external caller.
    /// Carries no stack traces or internal detail beyond the message.
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            error_type: self.kind.as_str(),
            code: self.code.as_str(),
            message: self.message.clone(),
            timestamp_ms: self
                .timestamp
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO)
                .as_millis() as u64,
            operation: self.operation.clone(),
            retryable: self.retryable,
            retry_after_ms: self.retry_after.map(|d| d.as_millis() as u64),
        }
    }
}

impl From<rusqlite::Error> for ServiceError {
    fn from(err: rusqlite::Error) -> Self {
        ServiceError::from_sqlite("database", &err)
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        ServiceError::from_io("io", &err)
    }
}

/// Wire-ready error view
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    #[serde(rename = "type")]
    pub error_type: &'static str,
    pub code: &'static str,
    pub message: String,
    pub timestamp_ms: u64,
    pub operation: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_kind_mapping() {
        assert_eq!(ErrorCode::MigrationFailed.kind(), ErrorKind::Database);
        assert_eq!(ErrorCode::OperationTimeout.kind(), ErrorKind::Timeout);
        assert_eq!(ErrorCode::PermissionDenied.kind(), ErrorKind::FileSystem);
        assert_eq!(ErrorCode::CircuitOpen.kind(), ErrorKind::Service);
    }

    #[test]
    fn test_default_retryability() {
        assert!(ErrorCode::ConnectionFailed.default_retryable());
        assert!(ErrorCode::OperationTimeout.default_retryable());
        assert!(!ErrorCode::ConstraintViolation.default_retryable());
        assert!(!ErrorCode::DatabaseCorruption.default_retryable());
        assert!(!ErrorCode::PermissionDenied.default_retryable());
    }

    #[test]
    fn test_retry_delay_table() {
        assert!(
            ErrorCode::ConnectionFailed.base_retry_delay()
                < ErrorCode::ResourceExhausted.base_retry_delay()
        );
    }

    #[test]
    fn test_retryable_override() {
        let err = ServiceError::connection_failed("acquire", "busy").with_retryable(false);
        assert!(!err.retryable);
        assert!(err.retry_after.is_none());
    }

    #[test]
    fn test_sqlite_busy_is_retryable_connection_error() {
        let raw = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ffi::ErrorCode::DatabaseBusy,
                extended_code: 5,
            },
            Some("database is locked".to_string()),
        );
        let err = ServiceError::from_sqlite("execute_query", &raw);
        assert_eq!(err.code, ErrorCode::ConnectionFailed);
        assert!(err.retryable);
    }

    #[test]
    fn test_sqlite_constraint_is_not_retryable() {
        let raw = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ffi::ErrorCode::ConstraintViolation,
                extended_code: 19,
            },
            Some("UNIQUE constraint failed".to_string()),
        );
        let err = ServiceError::from_sqlite("execute_run", &raw);
        assert_eq!(err.code, ErrorCode::ConstraintViolation);
        assert!(!err.retryable);
    }

    #[test]
    fn test_keyword_classification() {
        let err = ServiceError::classify_message("op", "request timed out");
        assert_eq!(err.code, ErrorCode::OperationTimeout);

        let err = ServiceError::classify_message("op", "permission denied on /tmp/x");
        assert_eq!(err.code, ErrorCode::PermissionDenied);

        let err = ServiceError::classify_message("op", "could not connect to engine");
        assert_eq!(err.code, ErrorCode::ConnectionFailed);

        let err = ServiceError::classify_message("op", "something inexplicable");
        assert_eq!(err.code, ErrorCode::Internal);
        assert!(!err.retryable);
    }

    #[test]
    fn test_classify_passes_through_service_error() {
        let original = ServiceError::migration_failed(3, "checksum drift");
        let classified = ServiceError::classify("other_op", &original);
        assert_eq!(classified.code, ErrorCode::MigrationFailed);
        // Passthrough keeps the original operation attribution
        assert_eq!(classified.operation, "migration v3");
    }

    #[test]
    fn test_timeout_context() {
        let err = ServiceError::timeout(
            "acquire",
            Duration::from_millis(50),
            Duration::from_millis(61),
        );
        match &err.context {
            ErrorContext::Timeout {
                operation,
                timeout_ms,
                elapsed_ms,
            } => {
                assert_eq!(operation, "acquire");
                assert_eq!(*timeout_ms, 50);
                assert_eq!(*elapsed_ms, 61);
            }
            other => panic!("unexpected context: {other:?}"),
        }
    }

    #[test]
    fn test_response_shape() {
        let err = ServiceError::query_failed("execute_query", "SELECT 1", "syntax error");
        let resp = err.to_response();
        assert_eq!(resp.code, "QUERY_FAILED");
        assert_eq!(resp.error_type, "database");
        assert!(!resp.retryable);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["type"], "database");
        assert!(json.get("retry_after_ms").is_none());
    }
}
