//! Connection providers.
//!
//! A provider owns the physical connections of exactly one real datasource.
//! The registry creates providers through a [`ProviderFactory`], configures
//! them once, and shuts them down on eviction or registry shutdown.

use crate::config::RetryPolicy;
use crate::db::connection::ConnectionRef;
use crate::db::engines::{DirectProvider, SqlxPoolProvider};
use crate::db::global::GlobalTransaction;
use crate::error::{DbError, DbResult};
use crate::models::{DataSourceConfig, ProviderEngine};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::{debug, info, warn};

/// Lifecycle of a provider handle.
///
/// `Uninitialized -> Configured -> Active -> ShutDown`. A shut-down handle is
/// never reused; the registry builds a new one instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProviderState {
    Uninitialized = 0,
    Configured = 1,
    /// At least one acquire succeeded.
    Active = 2,
    ShutDown = 3,
}

impl ProviderState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Uninitialized,
            1 => Self::Configured,
            2 => Self::Active,
            _ => Self::ShutDown,
        }
    }

    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Configured | Self::Active)
    }
}

impl std::fmt::Display for ProviderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Configured => "configured",
            Self::Active => "active",
            Self::ShutDown => "shut_down",
        };
        f.write_str(s)
    }
}

/// Lock-free holder for a [`ProviderState`].
#[derive(Debug)]
pub struct ProviderStateCell(AtomicU8);

impl ProviderStateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(ProviderState::Uninitialized as u8))
    }

    pub fn get(&self) -> ProviderState {
        ProviderState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ProviderState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move from `from` to `to`; false if the current state was something else.
    pub fn transition(&self, from: ProviderState, to: ProviderState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Mark shut down and report whether this call did it.
    pub fn shut_down(&self) -> bool {
        self.0.swap(ProviderState::ShutDown as u8, Ordering::AcqRel) != ProviderState::ShutDown as u8
    }

    /// Error out unless the provider can hand out connections.
    pub fn ensure_usable(&self, name: &str) -> DbResult<()> {
        let state = self.get();
        if state.is_usable() {
            return Ok(());
        }
        if state == ProviderState::Uninitialized {
            return Err(DbError::internal(format!(
                "Provider for datasource '{}' was not configured",
                name
            )));
        }
        Err(DbError::invalid_input(format!(
            "Provider for datasource '{}' has been shut down",
            name
        )))
    }
}

impl Default for ProviderStateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to the connection source of one real datasource.
#[async_trait]
pub trait ProviderHandle: Send + Sync + std::fmt::Debug {
    /// Real (resolved) datasource name.
    fn name(&self) -> &str;

    fn engine(&self) -> ProviderEngine;

    fn state(&self) -> ProviderState;

    /// Translate the datasource record into engine settings. Called once by the registry.
    async fn configure(&self, config: &DataSourceConfig) -> DbResult<()>;

    /// Hand out a connection in auto-commit mode.
    async fn acquire(&self) -> DbResult<ConnectionRef>;

    /// Hand out a connection already enrolled as a branch of `tx`.
    async fn acquire_for_global_transaction(
        &self,
        tx: &GlobalTransaction,
    ) -> DbResult<ConnectionRef> {
        let conn = self.acquire().await?;
        if let Err(e) = conn.xa_start(&tx.branch_xid(self.name())).await {
            if let Err(release_err) = self.release(conn).await {
                warn!(datasource = %self.name(), error = %release_err, "Failed to release connection after xa start failure");
            }
            return Err(e);
        }
        Ok(conn)
    }

    /// Give a connection back. Open local work on it is rolled back.
    async fn release(&self, conn: ConnectionRef) -> DbResult<()>;

    /// Close every resource. Repeated calls are no-ops.
    async fn shutdown(&self) -> DbResult<()>;
}

/// Shared handle to a [`ProviderHandle`].
pub type ProviderRef = Arc<dyn ProviderHandle>;

/// Builds an unconfigured provider for a datasource record.
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    async fn create(&self, config: &DataSourceConfig) -> DbResult<ProviderRef>;
}

/// Factory dispatching on [`DataSourceConfig::engine`].
#[derive(Debug, Clone, Default)]
pub struct EngineProviderFactory;

impl EngineProviderFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProviderFactory for EngineProviderFactory {
    async fn create(&self, config: &DataSourceConfig) -> DbResult<ProviderRef> {
        let db_type = config.database_type()?;
        debug!(datasource = %config.name, engine = %config.engine, db_type = %db_type, "Creating provider");
        let provider: ProviderRef = match config.engine {
            ProviderEngine::SqlxPool => Arc::new(SqlxPoolProvider::new(&config.name, db_type)),
            ProviderEngine::Direct => Arc::new(DirectProvider::new(&config.name, db_type)),
        };
        Ok(provider)
    }
}

/// Run an acquire operation under a bounded retry policy.
///
/// Only errors for which [`DbError::is_retryable`] holds are retried, with a
/// fixed delay in between. When the attempts run out the last transient error
/// is reported as [`DbError::AcquireExhausted`].
pub async fn with_retry<F, Fut>(name: &str, retry: &RetryPolicy, mut op: F) -> DbResult<ConnectionRef>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DbResult<ConnectionRef>>,
{
    let attempts = retry.attempts_or_default();
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(conn) => {
                if attempt > 1 {
                    info!(datasource = %name, attempt, "Acquired connection after retry");
                }
                return Ok(conn);
            }
            Err(e) if e.is_retryable() && attempt < attempts => {
                warn!(
                    datasource = %name,
                    attempt,
                    max_attempts = attempts,
                    error = %e,
                    "Connection acquire failed, retrying"
                );
                tokio::time::sleep(retry.delay()).await;
                attempt += 1;
            }
            Err(e) if e.is_retryable() => {
                return Err(DbError::acquire_exhausted(name, attempts, &e));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Acquire an auto-commit connection from `provider` under `retry`.
pub async fn acquire_with_retry(
    provider: &dyn ProviderHandle,
    retry: &RetryPolicy,
) -> DbResult<ConnectionRef> {
    with_retry(provider.name(), retry, || provider.acquire()).await
}
