//! Datasource-related data models.
//!
//! This module defines the per-datasource configuration record held by the
//! registry and the identity used to detect two names pointing at the same
//! physical database.

use crate::config::{PoolOptions, RetryPolicy};
use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Supported database types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    PostgreSQL,
    /// Includes MariaDB
    MySQL,
    SQLite,
}

impl DatabaseType {
    /// Parse database type from a connection string.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else if lower.starts_with("sqlite://") || lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    /// Get the display name for this database type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        }
    }

    /// Whether the engine can take part in a real two-phase commit.
    pub fn supports_two_phase_commit(&self) -> bool {
        !matches!(self, Self::SQLite)
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Which provider implementation backs a datasource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderEngine {
    /// sqlx's built-in connection pool.
    #[default]
    SqlxPool,
    /// No pooling: every acquire opens a new physical connection.
    Direct,
}

impl ProviderEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SqlxPool => "sqlx-pool",
            Self::Direct => "direct",
        }
    }
}

impl std::fmt::Display for ProviderEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderEngine {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlx-pool" | "sqlx_pool" | "pool" => Ok(Self::SqlxPool),
            "direct" | "none" => Ok(Self::Direct),
            other => Err(DbError::invalid_config(format!(
                "Unknown provider engine '{}'. Expected 'sqlx-pool' or 'direct'",
                other
            ))),
        }
    }
}

/// The physical target of a datasource: url without query string, user and password.
///
/// Two identities are equal when all three parts compare equal ignoring case.
#[derive(Clone)]
pub struct ConnectionIdentity {
    pub url: String,
    pub user: String,
    pub password: String,
}

impl ConnectionIdentity {
    pub fn new(url: &str, user: &str, password: &str) -> Self {
        let url = match url.rfind('?') {
            Some(idx) => &url[..idx],
            None => url,
        };
        Self {
            url: url.to_string(),
            user: user.to_string(),
            password: password.to_string(),
        }
    }
}

impl PartialEq for ConnectionIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.url.eq_ignore_ascii_case(&other.url)
            && self.user.eq_ignore_ascii_case(&other.user)
            && self.password.eq_ignore_ascii_case(&other.password)
    }
}

impl Eq for ConnectionIdentity {}

impl std::fmt::Debug for ConnectionIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionIdentity")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("password", &"****")
            .finish()
    }
}

/// Configuration for one named datasource.
///
/// Names are trimmed and lower-cased on construction. The record is immutable
/// once handed to the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourceConfig {
    pub name: String,
    /// Detected from the url scheme when absent.
    #[serde(default)]
    pub driver: Option<DatabaseType>,
    /// Contains sensitive data in query parameters - never log unmasked
    pub url: String,
    #[serde(default)]
    pub user: String,
    #[serde(default, skip_serializing)]
    pub password: String,
    #[serde(default)]
    pub pool: PoolOptions,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub dialect: Option<String>,
    #[serde(default)]
    pub engine: ProviderEngine,
    #[serde(default)]
    pub load_on_startup: bool,
    #[serde(default)]
    pub show_sql: bool,
    /// Free-form attributes passed through untouched.
    #[serde(default)]
    pub custom: BTreeMap<String, String>,
}

impl DataSourceConfig {
    /// Create a new datasource configuration with default pool and retry settings.
    pub fn new(name: impl AsRef<str>, url: impl Into<String>) -> DbResult<Self> {
        let config = Self {
            name: normalize_name(name.as_ref()),
            driver: None,
            url: url.into(),
            user: String::new(),
            password: String::new(),
            pool: PoolOptions::default(),
            retry: RetryPolicy::default(),
            dialect: None,
            engine: ProviderEngine::default(),
            load_on_startup: false,
            show_sql: false,
            custom: BTreeMap::new(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn with_pool(mut self, pool: PoolOptions) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_engine(mut self, engine: ProviderEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_dialect(mut self, dialect: impl Into<String>) -> Self {
        self.dialect = Some(dialect.into());
        self
    }

    pub fn with_load_on_startup(mut self, load_on_startup: bool) -> Self {
        self.load_on_startup = load_on_startup;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom.insert(key.into(), value.into());
        self
    }

    /// Normalize the name and check the record is usable.
    ///
    /// Records deserialized from a config file go through this before registration.
    pub fn normalized(mut self) -> DbResult<Self> {
        self.name = normalize_name(&self.name);
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> DbResult<()> {
        if self.name.is_empty() {
            return Err(DbError::invalid_config("Datasource name cannot be empty"));
        }
        if self.url.trim().is_empty() {
            return Err(DbError::invalid_config(format!(
                "Datasource '{}' has an empty url",
                self.name
            )));
        }
        self.database_type()?;
        self.pool.validate().map_err(|msg| {
            DbError::invalid_config(format!("Datasource '{}': {}", self.name, msg))
        })?;
        Ok(())
    }

    /// The driver, falling back to the url scheme.
    pub fn database_type(&self) -> DbResult<DatabaseType> {
        self.driver
            .or_else(|| DatabaseType::from_connection_string(&self.url))
            .ok_or_else(|| {
                DbError::invalid_config(format!(
                    "Unknown database type for datasource '{}': {}",
                    self.name,
                    self.masked_url()
                ))
            })
    }

    pub fn identity(&self) -> ConnectionIdentity {
        ConnectionIdentity::new(&self.url, &self.user, &self.password)
    }

    /// Get a display-safe version of the url (credentials masked).
    pub fn masked_url(&self) -> String {
        if let Some(at_pos) = self.url.find('@') {
            if let Some(colon_pos) = self.url[..at_pos].rfind(':') {
                // user without password: the only colon is the scheme separator
                if !self.url[colon_pos..].starts_with("://") {
                    let prefix = &self.url[..colon_pos + 1];
                    let suffix = &self.url[at_pos..];
                    return format!("{}****{}", prefix, suffix);
                }
            }
        }
        self.url.clone()
    }
}

/// Datasource and alias names are compared case-insensitively.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}
