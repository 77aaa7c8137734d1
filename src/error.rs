//! Error types for the datasource router.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Registry, routing and transaction failures each get their own variant so callers
//! can tell a missing datasource from a broken alias chain or an aborted transaction.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("DataSource '{name}' not found")]
    NotFound { name: String },

    #[error("DataSource '{name}' already exists with a different identity (existing url: {existing_url})")]
    DuplicateName { name: String, existing_url: String },

    #[error("Alias cycle detected while resolving '{name}': {}", .chain.join(" -> "))]
    Cycle { name: String, chain: Vec<String> },

    #[error("Failed to initialize provider '{engine}' for datasource '{name}'")]
    ProviderInit {
        name: String,
        engine: String,
        #[source]
        source: Box<DbError>,
    },

    #[error("Transaction error: {message}")]
    Transaction { message: String },

    #[error("Transaction error: rollback failed ({rollback}) after: {cause}")]
    TransactionRollback {
        cause: Box<DbError>,
        rollback: Box<DbError>,
    },

    #[error("Failed to acquire a connection for '{name}' after {attempts} attempts: {last_error}")]
    AcquireExhausted {
        name: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u32,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a not found error for a datasource or alias name.
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    /// Create a duplicate name error.
    pub fn duplicate_name(name: impl Into<String>, existing_url: impl Into<String>) -> Self {
        Self::DuplicateName {
            name: name.into(),
            existing_url: existing_url.into(),
        }
    }

    /// Create an alias cycle error from the chain walked so far.
    pub fn cycle(name: impl Into<String>, chain: Vec<String>) -> Self {
        Self::Cycle {
            name: name.into(),
            chain,
        }
    }

    /// Wrap an engine failure raised while building a provider.
    pub fn provider_init(name: impl Into<String>, engine: impl Into<String>, source: DbError) -> Self {
        Self::ProviderInit {
            name: name.into(),
            engine: engine.into(),
            source: Box::new(source),
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }

    /// Report a failed rollback together with the failure that triggered it.
    pub fn transaction_rollback(cause: DbError, rollback: DbError) -> Self {
        Self::TransactionRollback {
            cause: Box::new(cause),
            rollback: Box::new(rollback),
        }
    }

    /// Create an acquire exhausted error.
    pub fn acquire_exhausted(name: impl Into<String>, attempts: u32, last_error: &DbError) -> Self {
        Self::AcquireExhausted {
            name: name.into(),
            attempts,
            last_error: last_error.to_string(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u32) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::Cycle { .. } => Some("Check the link mapping for aliases that point back at themselves"),
            Self::NotFound { .. } => Some("Register the datasource or add it to the configuration"),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    ///
    /// Only transient acquisition failures qualify; the bounded acquire retry
    /// loop is the single place that consults this.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// True for both plain transaction errors and failed rollbacks.
    pub fn is_transaction(&self) -> bool {
        matches!(self, Self::Transaction { .. } | Self::TransactionRollback { .. })
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => DbError::timeout("connection pool acquire", 30),
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_display() {
        let err = DbError::connection("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_error_suggestion() {
        let err = DbError::database(
            "Syntax error",
            Some("42601".to_string()),
            "Check SQL syntax",
        );
        assert_eq!(err.suggestion(), Some("Check SQL syntax"));
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::timeout("acquire", 30).is_retryable());
        assert!(DbError::connection("err", "sugg").is_retryable());
        assert!(!DbError::not_found("ds").is_retryable());
        assert!(!DbError::transaction("boom").is_retryable());
    }

    #[test]
    fn test_cycle_display_shows_chain() {
        let err = DbError::cycle("a", vec!["a".into(), "b".into(), "a".into()]);
        assert!(err.to_string().contains("a -> b -> a"));
    }

    #[test]
    fn test_provider_init_keeps_source() {
        let err = DbError::provider_init(
            "orders",
            "sqlx-pool",
            DbError::connection("refused", "start the server"),
        );
        assert!(err.to_string().contains("orders"));
        let source = err.source().expect("source should be kept");
        assert!(source.to_string().contains("refused"));
    }

    #[test]
    fn test_transaction_rollback_mentions_both_causes() {
        let err = DbError::transaction_rollback(
            DbError::database("commit failed", None, "retry"),
            DbError::connection("socket closed", "reconnect"),
        );
        let msg = err.to_string();
        assert!(msg.contains("commit failed"));
        assert!(msg.contains("socket closed"));
        assert!(err.is_transaction());
    }

    #[test]
    fn test_acquire_exhausted_records_last_error() {
        let last = DbError::timeout("connection pool acquire", 30);
        let err = DbError::acquire_exhausted("orders", 3, &last);
        assert!(err.to_string().contains("3 attempts"));
        assert!(err.to_string().contains("connection pool acquire"));
        assert!(!err.is_retryable());
    }
}
