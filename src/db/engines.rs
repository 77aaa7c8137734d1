//! Concrete provider engines backed by sqlx.
//!
//! - [`SqlxPoolProvider`] keeps a database-specific sqlx pool
//!   (`MySqlPool`, `PgPool`, `SqlitePool`) to ensure full type support.
//! - [`DirectProvider`] opens one physical connection per acquire and closes
//!   it on release.
//!
//! Both hand out [`SqlxConnection`], which implements manual commit and the
//! two-phase commit statements of each engine.

use crate::db::connection::{Connection, ConnectionRef, Xid};
use crate::db::provider::{ProviderHandle, ProviderState, ProviderStateCell};
use crate::error::{DbError, DbResult};
use crate::models::{DataSourceConfig, DatabaseType, ProviderEngine};
use async_trait::async_trait;
use sqlx::Connection as _;
use sqlx::pool::PoolConnection;
use sqlx::{
    MySql, MySqlConnection, MySqlPool, PgConnection, PgPool, Postgres, Sqlite, SqliteConnection,
    SqlitePool, mysql::MySqlConnectOptions, mysql::MySqlPoolOptions, postgres::PgConnectOptions,
    postgres::PgPoolOptions, sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions,
};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Database-specific connection pool (avoids AnyPool limitations).
#[derive(Debug, Clone)]
pub enum DbPool {
    MySql(MySqlPool),
    Postgres(PgPool),
    SQLite(SqlitePool),
}

impl DbPool {
    /// Close the connection pool.
    ///
    /// Waits until every checked-out connection has been returned.
    pub async fn close(&self) {
        match self {
            DbPool::MySql(pool) => pool.close().await,
            DbPool::Postgres(pool) => pool.close().await,
            DbPool::SQLite(pool) => pool.close().await,
        }
    }

    /// Get the database type for this pool.
    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbPool::MySql(_) => DatabaseType::MySQL,
            DbPool::Postgres(_) => DatabaseType::PostgreSQL,
            DbPool::SQLite(_) => DatabaseType::SQLite,
        }
    }

    async fn acquire(&self) -> DbResult<SqlxHandle> {
        Ok(match self {
            DbPool::MySql(pool) => SqlxHandle::MySql(pool.acquire().await?),
            DbPool::Postgres(pool) => SqlxHandle::Postgres(pool.acquire().await?),
            DbPool::SQLite(pool) => SqlxHandle::SQLite(pool.acquire().await?),
        })
    }
}

/// Driver-level connect options with credentials applied.
#[derive(Clone)]
pub enum ConnectOptions {
    MySql(MySqlConnectOptions),
    Postgres(PgConnectOptions),
    SQLite(SqliteConnectOptions),
}

impl ConnectOptions {
    /// Parse the datasource url and apply the configured credentials.
    pub fn from_config(config: &DataSourceConfig) -> DbResult<Self> {
        let db_type = config.database_type()?;
        match db_type {
            DatabaseType::MySQL => {
                let mut options = MySqlConnectOptions::from_str(&config.url)
                    .map_err(|e| {
                        DbError::connection(
                            format!("Invalid MySQL connection string: {}", e),
                            "Check the connection URL format: mysql://host:port/database",
                        )
                    })?
                    .charset("utf8mb4");
                if !config.user.is_empty() {
                    options = options.username(&config.user);
                }
                if !config.password.is_empty() {
                    options = options.password(&config.password);
                }
                Ok(Self::MySql(options))
            }
            DatabaseType::PostgreSQL => {
                let mut options = PgConnectOptions::from_str(&config.url).map_err(|e| {
                    DbError::connection(
                        format!("Invalid PostgreSQL connection string: {}", e),
                        "Check the connection URL format: postgres://host:5432/database",
                    )
                })?;
                if !config.user.is_empty() {
                    options = options.username(&config.user);
                }
                if !config.password.is_empty() {
                    options = options.password(&config.password);
                }
                Ok(Self::Postgres(options))
            }
            DatabaseType::SQLite => {
                let options = SqliteConnectOptions::from_str(&config.url)
                    .map_err(|e| {
                        DbError::connection(
                            format!("Invalid SQLite connection string: {}", e),
                            "Check the connection URL format: sqlite:path/to/db.sqlite",
                        )
                    })?
                    .create_if_missing(true);
                Ok(Self::SQLite(options))
            }
        }
    }

    pub fn db_type(&self) -> DatabaseType {
        match self {
            Self::MySql(_) => DatabaseType::MySQL,
            Self::Postgres(_) => DatabaseType::PostgreSQL,
            Self::SQLite(_) => DatabaseType::SQLite,
        }
    }

    async fn connect(&self) -> DbResult<SqlxHandle> {
        Ok(match self {
            Self::MySql(o) => SqlxHandle::DirectMySql(MySqlConnection::connect_with(o).await?),
            Self::Postgres(o) => SqlxHandle::DirectPostgres(PgConnection::connect_with(o).await?),
            Self::SQLite(o) => SqlxHandle::DirectSQLite(SqliteConnection::connect_with(o).await?),
        })
    }
}

impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // connect options carry the password
        f.debug_tuple("ConnectOptions").field(&self.db_type()).finish()
    }
}

/// Settings for [`SqlxPoolProvider`], translated field by field from the datasource record.
#[derive(Debug, Clone)]
pub struct SqlxPoolSettings {
    pub connect: ConnectOptions,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub max_lifetime: Option<Duration>,
    pub test_before_acquire: bool,
    pub show_sql: bool,
}

impl SqlxPoolSettings {
    pub fn from_config(config: &DataSourceConfig) -> DbResult<Self> {
        let connect = ConnectOptions::from_config(config)?;
        let pool_opts = &config.pool;
        let is_sqlite = connect.db_type() == DatabaseType::SQLite;
        Ok(Self {
            connect,
            max_connections: pool_opts.max_connections_or_default(is_sqlite),
            min_connections: pool_opts.min_connections_or_default(is_sqlite),
            acquire_timeout: Duration::from_secs(pool_opts.acquire_timeout_or_default()),
            idle_timeout: Some(Duration::from_secs(pool_opts.idle_timeout_or_default())),
            max_lifetime: Some(Duration::from_secs(pool_opts.max_lifetime_or_default())),
            test_before_acquire: pool_opts.test_before_acquire_or_default(),
            show_sql: config.show_sql,
        })
    }

    /// Build the pool without opening any connection yet.
    fn build_pool(&self) -> DbPool {
        match &self.connect {
            ConnectOptions::MySql(options) => DbPool::MySql(
                MySqlPoolOptions::new()
                    .min_connections(self.min_connections)
                    .max_connections(self.max_connections)
                    .acquire_timeout(self.acquire_timeout)
                    .idle_timeout(self.idle_timeout)
                    .max_lifetime(self.max_lifetime)
                    .test_before_acquire(self.test_before_acquire)
                    .connect_lazy_with(options.clone()),
            ),
            ConnectOptions::Postgres(options) => DbPool::Postgres(
                PgPoolOptions::new()
                    .min_connections(self.min_connections)
                    .max_connections(self.max_connections)
                    .acquire_timeout(self.acquire_timeout)
                    .idle_timeout(self.idle_timeout)
                    .max_lifetime(self.max_lifetime)
                    .test_before_acquire(self.test_before_acquire)
                    .connect_lazy_with(options.clone()),
            ),
            ConnectOptions::SQLite(options) => DbPool::SQLite(
                SqlitePoolOptions::new()
                    .min_connections(self.min_connections)
                    .max_connections(self.max_connections)
                    .acquire_timeout(self.acquire_timeout)
                    .idle_timeout(self.idle_timeout)
                    .max_lifetime(self.max_lifetime)
                    .test_before_acquire(self.test_before_acquire)
                    .connect_lazy_with(options.clone()),
            ),
        }
    }
}

/// Settings for [`DirectProvider`].
#[derive(Debug, Clone)]
pub struct DirectSettings {
    pub connect: ConnectOptions,
    pub connect_timeout: Duration,
    pub test_before_acquire: bool,
    pub test_sql: String,
    pub show_sql: bool,
}

impl DirectSettings {
    pub fn from_config(config: &DataSourceConfig) -> DbResult<Self> {
        Ok(Self {
            connect: ConnectOptions::from_config(config)?,
            connect_timeout: Duration::from_secs(config.pool.acquire_timeout_or_default()),
            test_before_acquire: config.pool.test_before_acquire_or_default(),
            test_sql: config.pool.test_sql_or_default().to_string(),
            show_sql: config.show_sql,
        })
    }
}

/// Provider backed by a sqlx pool.
#[derive(Debug)]
pub struct SqlxPoolProvider {
    name: String,
    db_type: DatabaseType,
    state: ProviderStateCell,
    pool: RwLock<Option<(DbPool, bool)>>,
}

impl SqlxPoolProvider {
    pub fn new(name: impl Into<String>, db_type: DatabaseType) -> Self {
        Self {
            name: name.into(),
            db_type,
            state: ProviderStateCell::new(),
            pool: RwLock::new(None),
        }
    }

    pub fn db_type(&self) -> DatabaseType {
        self.db_type
    }
}

#[async_trait]
impl ProviderHandle for SqlxPoolProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn engine(&self) -> ProviderEngine {
        ProviderEngine::SqlxPool
    }

    fn state(&self) -> ProviderState {
        self.state.get()
    }

    async fn configure(&self, config: &DataSourceConfig) -> DbResult<()> {
        let settings = SqlxPoolSettings::from_config(config)?;
        let mut slot = self.pool.write().await;
        if self.state.get() != ProviderState::Uninitialized {
            return Err(DbError::internal(format!(
                "Provider for datasource '{}' is already configured",
                self.name
            )));
        }
        debug!(
            datasource = %self.name,
            max_connections = settings.max_connections,
            min_connections = settings.min_connections,
            "Configuring sqlx pool"
        );
        *slot = Some((settings.build_pool(), settings.show_sql));
        self.state.set(ProviderState::Configured);
        Ok(())
    }

    async fn acquire(&self) -> DbResult<ConnectionRef> {
        self.state.ensure_usable(&self.name)?;
        let (pool, show_sql) = {
            let slot = self.pool.read().await;
            slot.clone().ok_or_else(|| {
                DbError::invalid_input(format!(
                    "Provider for datasource '{}' has been shut down",
                    self.name
                ))
            })?
        };

        let handle = pool.acquire().await?;
        if self
            .state
            .transition(ProviderState::Configured, ProviderState::Active)
        {
            info!(datasource = %self.name, db_type = %self.db_type, "Connection pool active");
        }
        Ok(Arc::new(SqlxConnection::new(&self.name, show_sql, handle)))
    }

    async fn release(&self, conn: ConnectionRef) -> DbResult<()> {
        conn.close().await
    }

    async fn shutdown(&self) -> DbResult<()> {
        if !self.state.shut_down() {
            return Ok(());
        }
        let pool = self.pool.write().await.take();
        if let Some((pool, _)) = pool {
            info!(datasource = %self.name, "Closing connection pool");
            pool.close().await;
        }
        Ok(())
    }
}

/// Provider without pooling.
#[derive(Debug)]
pub struct DirectProvider {
    name: String,
    db_type: DatabaseType,
    state: ProviderStateCell,
    settings: RwLock<Option<DirectSettings>>,
    opened: AtomicU64,
}

impl DirectProvider {
    pub fn new(name: impl Into<String>, db_type: DatabaseType) -> Self {
        Self {
            name: name.into(),
            db_type,
            state: ProviderStateCell::new(),
            settings: RwLock::new(None),
            opened: AtomicU64::new(0),
        }
    }

    pub fn db_type(&self) -> DatabaseType {
        self.db_type
    }

    /// Physical connections opened so far.
    pub fn opened_count(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ProviderHandle for DirectProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn engine(&self) -> ProviderEngine {
        ProviderEngine::Direct
    }

    fn state(&self) -> ProviderState {
        self.state.get()
    }

    async fn configure(&self, config: &DataSourceConfig) -> DbResult<()> {
        let settings = DirectSettings::from_config(config)?;
        let mut slot = self.settings.write().await;
        if self.state.get() != ProviderState::Uninitialized {
            return Err(DbError::internal(format!(
                "Provider for datasource '{}' is already configured",
                self.name
            )));
        }
        *slot = Some(settings);
        self.state.set(ProviderState::Configured);
        Ok(())
    }

    async fn acquire(&self) -> DbResult<ConnectionRef> {
        self.state.ensure_usable(&self.name)?;
        let settings = self.settings.read().await.clone().ok_or_else(|| {
            DbError::internal(format!(
                "Provider for datasource '{}' has no settings",
                self.name
            ))
        })?;

        let handle = tokio::time::timeout(settings.connect_timeout, settings.connect.connect())
            .await
            .map_err(|_| {
                DbError::timeout(
                    "direct connect",
                    settings.connect_timeout.as_secs().min(u32::MAX as u64) as u32,
                )
            })??;
        self.opened.fetch_add(1, Ordering::Relaxed);

        let conn = SqlxConnection::new(&self.name, settings.show_sql, handle);
        if settings.test_before_acquire {
            if let Err(e) = conn.execute(&settings.test_sql).await {
                warn!(datasource = %self.name, error = %e, "Connection test failed");
                if let Err(close_err) = conn.close().await {
                    debug!(datasource = %self.name, error = %close_err, "Failed to close tested connection");
                }
                return Err(e);
            }
        }

        if self
            .state
            .transition(ProviderState::Configured, ProviderState::Active)
        {
            info!(datasource = %self.name, db_type = %self.db_type, "Direct provider active");
        }
        Ok(Arc::new(conn))
    }

    async fn release(&self, conn: ConnectionRef) -> DbResult<()> {
        conn.close().await
    }

    async fn shutdown(&self) -> DbResult<()> {
        if self.state.shut_down() {
            self.settings.write().await.take();
            info!(datasource = %self.name, opened = self.opened_count(), "Direct provider shut down");
        }
        Ok(())
    }
}

/// A checked-out pooled connection or an owned direct connection.
enum SqlxHandle {
    MySql(PoolConnection<MySql>),
    Postgres(PoolConnection<Postgres>),
    SQLite(PoolConnection<Sqlite>),
    DirectMySql(MySqlConnection),
    DirectPostgres(PgConnection),
    DirectSQLite(SqliteConnection),
}

impl SqlxHandle {
    fn db_type(&self) -> DatabaseType {
        match self {
            Self::MySql(_) | Self::DirectMySql(_) => DatabaseType::MySQL,
            Self::Postgres(_) | Self::DirectPostgres(_) => DatabaseType::PostgreSQL,
            Self::SQLite(_) | Self::DirectSQLite(_) => DatabaseType::SQLite,
        }
    }

    /// Return a pooled connection or close a direct one. `discard` drops a
    /// pooled connection instead of returning it.
    async fn finish(self, discard: bool) -> DbResult<()> {
        match self {
            Self::MySql(c) if discard => c.close().await?,
            Self::Postgres(c) if discard => c.close().await?,
            Self::SQLite(c) if discard => c.close().await?,
            Self::MySql(_) | Self::Postgres(_) | Self::SQLite(_) => {}
            Self::DirectMySql(c) => c.close().await?,
            Self::DirectPostgres(c) => c.close().await?,
            Self::DirectSQLite(c) => c.close().await?,
        }
        Ok(())
    }
}

/// Dispatch one expression over the concrete sqlx connection type.
macro_rules! with_session {
    ($handle:expr, $conn:ident => $body:expr) => {
        match $handle {
            SqlxHandle::MySql(c) => {
                let $conn: &mut MySqlConnection = c;
                $body
            }
            SqlxHandle::Postgres(c) => {
                let $conn: &mut PgConnection = c;
                $body
            }
            SqlxHandle::SQLite(c) => {
                let $conn: &mut SqliteConnection = c;
                $body
            }
            SqlxHandle::DirectMySql(c) => {
                let $conn: &mut MySqlConnection = c;
                $body
            }
            SqlxHandle::DirectPostgres(c) => {
                let $conn: &mut PgConnection = c;
                $body
            }
            SqlxHandle::DirectSQLite(c) => {
                let $conn: &mut SqliteConnection = c;
                $body
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum XaPhase {
    Active,
    Prepared,
}

struct Session {
    handle: Option<SqlxHandle>,
    auto_commit: bool,
    /// A local transaction was opened with BEGIN.
    local_open: bool,
    xa: Option<(Xid, XaPhase)>,
}

impl Session {
    async fn run(&mut self, datasource: &str, sql: &str) -> DbResult<u64> {
        let handle = self.handle.as_mut().ok_or_else(|| closed_error(datasource))?;
        let result = with_session!(handle, conn => sqlx::Executor::execute(conn, sqlx::raw_sql(sql)).await?.rows_affected());
        Ok(result)
    }

    fn db_type(&self, datasource: &str) -> DbResult<DatabaseType> {
        self.handle
            .as_ref()
            .map(SqlxHandle::db_type)
            .ok_or_else(|| closed_error(datasource))
    }

    fn expect_xa(&self, xid: &Xid) -> DbResult<XaPhase> {
        match &self.xa {
            Some((current, phase)) if current == xid => Ok(*phase),
            Some((current, _)) => Err(DbError::transaction(format!(
                "Connection is in branch {} but {} was requested",
                current, xid
            ))),
            None => Err(DbError::transaction(format!(
                "Connection has no active branch for {}",
                xid
            ))),
        }
    }
}

fn closed_error(datasource: &str) -> DbError {
    DbError::connection(
        format!("Connection to '{}' is closed", datasource),
        "Acquire a new connection through the router",
    )
}

/// A session on one of the supported engines.
pub struct SqlxConnection {
    datasource: String,
    show_sql: bool,
    closed: AtomicBool,
    session: Mutex<Session>,
}

impl SqlxConnection {
    fn new(datasource: &str, show_sql: bool, handle: SqlxHandle) -> Self {
        Self {
            datasource: datasource.to_string(),
            show_sql,
            closed: AtomicBool::new(false),
            session: Mutex::new(Session {
                handle: Some(handle),
                auto_commit: true,
                local_open: false,
                xa: None,
            }),
        }
    }

    async fn end_local(&self, sql: &str) -> DbResult<()> {
        let mut session = self.session.lock().await;
        if session.xa.is_some() {
            return Err(DbError::transaction(format!(
                "Cannot {} '{}' locally while it takes part in a global transaction",
                sql.to_lowercase(),
                self.datasource
            )));
        }
        if session.local_open {
            // the transaction is over even if the statement fails
            session.local_open = false;
            session.run(&self.datasource, sql).await?;
            debug!(datasource = %self.datasource, statement = sql, "Ended local transaction");
        }
        Ok(())
    }
}

impl std::fmt::Debug for SqlxConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlxConnection")
            .field("datasource", &self.datasource)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl Connection for SqlxConnection {
    fn datasource(&self) -> &str {
        &self.datasource
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn set_auto_commit(&self, auto_commit: bool) -> DbResult<()> {
        let mut session = self.session.lock().await;
        if auto_commit && session.local_open {
            session.local_open = false;
            session.run(&self.datasource, "COMMIT").await?;
        }
        session.auto_commit = auto_commit;
        Ok(())
    }

    async fn execute(&self, sql: &str) -> DbResult<u64> {
        let mut session = self.session.lock().await;
        if !session.auto_commit && !session.local_open && session.xa.is_none() {
            session.run(&self.datasource, "BEGIN").await?;
            session.local_open = true;
        }
        if self.show_sql {
            info!(datasource = %self.datasource, sql = %sql, "Executing statement");
        }
        session.run(&self.datasource, sql).await
    }

    async fn commit(&self) -> DbResult<()> {
        self.end_local("COMMIT").await
    }

    async fn rollback(&self) -> DbResult<()> {
        self.end_local("ROLLBACK").await
    }

    async fn close(&self) -> DbResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut session = self.session.lock().await;
        let mut dirty = false;
        if let Some((xid, phase)) = session.xa.clone() {
            warn!(datasource = %self.datasource, xid = %xid, "Closing connection with an unfinished branch");
            let statements = xa_rollback_statements(session.db_type(&self.datasource)?, &xid, phase);
            for sql in statements {
                if let Err(e) = session.run(&self.datasource, &sql).await {
                    error!(datasource = %self.datasource, error = %e, "Branch rollback on close failed");
                    dirty = true;
                    break;
                }
            }
            session.xa = None;
        } else if session.local_open {
            session.local_open = false;
            if let Err(e) = session.run(&self.datasource, "ROLLBACK").await {
                error!(datasource = %self.datasource, error = %e, "Rollback on close failed");
                dirty = true;
            }
        }
        match session.handle.take() {
            Some(handle) => handle.finish(dirty).await,
            None => Ok(()),
        }
    }

    async fn xa_start(&self, xid: &Xid) -> DbResult<()> {
        let mut session = self.session.lock().await;
        if session.local_open || session.xa.is_some() {
            return Err(DbError::transaction(format!(
                "Cannot start branch {} on '{}': a transaction is already in progress",
                xid, self.datasource
            )));
        }
        let sql = match session.db_type(&self.datasource)? {
            DatabaseType::MySQL => format!("XA START {}", xid.mysql_xid()),
            DatabaseType::PostgreSQL | DatabaseType::SQLite => "BEGIN".to_string(),
        };
        session.run(&self.datasource, &sql).await?;
        session.auto_commit = false;
        session.xa = Some((xid.clone(), XaPhase::Active));
        debug!(datasource = %self.datasource, xid = %xid, "Started branch");
        Ok(())
    }

    async fn xa_prepare(&self, xid: &Xid) -> DbResult<()> {
        let mut session = self.session.lock().await;
        if session.expect_xa(xid)? == XaPhase::Prepared {
            return Ok(());
        }
        let statements = match session.db_type(&self.datasource)? {
            DatabaseType::MySQL => vec![
                format!("XA END {}", xid.mysql_xid()),
                format!("XA PREPARE {}", xid.mysql_xid()),
            ],
            DatabaseType::PostgreSQL => vec![format!("PREPARE TRANSACTION '{}'", xid.gid())],
            // no two-phase commit: the branch commits locally in phase two
            DatabaseType::SQLite => Vec::new(),
        };
        for sql in statements {
            session.run(&self.datasource, &sql).await?;
        }
        session.xa = Some((xid.clone(), XaPhase::Prepared));
        Ok(())
    }

    async fn xa_commit(&self, xid: &Xid) -> DbResult<()> {
        let mut session = self.session.lock().await;
        let phase = session.expect_xa(xid)?;
        let statements = match (session.db_type(&self.datasource)?, phase) {
            (DatabaseType::MySQL, XaPhase::Prepared) => {
                vec![format!("XA COMMIT {}", xid.mysql_xid())]
            }
            (DatabaseType::MySQL, XaPhase::Active) => vec![
                format!("XA END {}", xid.mysql_xid()),
                format!("XA COMMIT {} ONE PHASE", xid.mysql_xid()),
            ],
            (DatabaseType::PostgreSQL, XaPhase::Prepared) => {
                vec![format!("COMMIT PREPARED '{}'", xid.gid())]
            }
            (DatabaseType::PostgreSQL, XaPhase::Active) | (DatabaseType::SQLite, _) => {
                vec!["COMMIT".to_string()]
            }
        };
        for sql in statements {
            session.run(&self.datasource, &sql).await?;
        }
        session.xa = None;
        Ok(())
    }

    async fn xa_rollback(&self, xid: &Xid) -> DbResult<()> {
        let mut session = self.session.lock().await;
        let phase = session.expect_xa(xid)?;
        let statements = xa_rollback_statements(session.db_type(&self.datasource)?, xid, phase);
        // the branch is finished either way; a failed rollback is reported
        session.xa = None;
        for sql in statements {
            session.run(&self.datasource, &sql).await?;
        }
        Ok(())
    }
}

fn xa_rollback_statements(db_type: DatabaseType, xid: &Xid, phase: XaPhase) -> Vec<String> {
    match (db_type, phase) {
        (DatabaseType::MySQL, XaPhase::Active) => vec![
            format!("XA END {}", xid.mysql_xid()),
            format!("XA ROLLBACK {}", xid.mysql_xid()),
        ],
        (DatabaseType::MySQL, XaPhase::Prepared) => {
            vec![format!("XA ROLLBACK {}", xid.mysql_xid())]
        }
        (DatabaseType::PostgreSQL, XaPhase::Prepared) => {
            vec![format!("ROLLBACK PREPARED '{}'", xid.gid())]
        }
        (DatabaseType::PostgreSQL, XaPhase::Active) | (DatabaseType::SQLite, _) => {
            vec!["ROLLBACK".to_string()]
        }
    }
}
