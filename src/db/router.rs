//! Connection routing.
//!
//! The router resolves a datasource name through the registry and hands out a
//! [`Lease`] according to the transaction mode of the caller's
//! [`TransactionContext`]:
//!
//! - no transaction: a fresh auto-commit connection, returned to its pool on release
//! - single: the connection bound to the transaction, binding one on first use
//! - multi: the connection enlisted for that datasource, enlisting one on first use

use crate::config::RetryPolicy;
use crate::db::connection::ConnectionRef;
use crate::db::global::GlobalTransactionManager;
use crate::db::provider::{ProviderRef, acquire_with_retry, with_retry};
use crate::db::registry::Registry;
use crate::db::transaction::{ForeignDataSourcePolicy, TransactionContext, TxState};
use crate::error::{DbError, DbResult};
use crate::models::normalize_name;
use std::sync::Arc;
use tracing::{debug, warn};

/// A connection handed out by the [`Router`].
///
/// Managed leases belong to a transaction and stay open until the outermost
/// close; releasing them does nothing.
#[derive(Debug, Clone)]
pub struct Lease {
    datasource: String,
    conn: ConnectionRef,
    provider: ProviderRef,
    managed: bool,
}

impl Lease {
    /// Real name of the datasource.
    pub fn datasource(&self) -> &str {
        &self.datasource
    }

    pub fn connection(&self) -> &ConnectionRef {
        &self.conn
    }

    pub fn is_managed(&self) -> bool {
        self.managed
    }

    pub async fn execute(&self, sql: &str) -> DbResult<u64> {
        self.conn.execute(sql).await
    }
}

#[derive(Debug)]
struct RouterInner {
    registry: Arc<Registry>,
    tm: GlobalTransactionManager,
    policy: ForeignDataSourcePolicy,
}

/// Routes connection requests to datasource providers.
///
/// Cloning is cheap and clones share the registry.
#[derive(Debug, Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                registry,
                tm: GlobalTransactionManager::new(),
                policy: ForeignDataSourcePolicy::default(),
            }),
        }
    }

    pub fn with_foreign_policy(self, policy: ForeignDataSourcePolicy) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                registry: Arc::clone(&self.inner.registry),
                tm: self.inner.tm.clone(),
                policy,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn transaction_manager(&self) -> &GlobalTransactionManager {
        &self.inner.tm
    }

    pub fn foreign_policy(&self) -> ForeignDataSourcePolicy {
        self.inner.policy
    }

    /// A fresh context sharing this router's global transaction manager.
    pub fn new_context(&self) -> TransactionContext {
        TransactionContext::with_manager(self.inner.tm.clone())
    }

    pub fn in_transaction(&self, ctx: &TransactionContext) -> bool {
        ctx.in_transaction()
    }

    /// Get a connection for `name` in the mode of `ctx`.
    ///
    /// A connection the transaction already holds is returned before the
    /// registry is asked for a provider, so it survives eviction of its
    /// datasource until the outermost close.
    pub async fn acquire(&self, ctx: &mut TransactionContext, name: &str) -> DbResult<Lease> {
        if ctx.in_transaction() {
            let held_name = match self.inner.registry.resolve_alias(name).await {
                Ok(real) => real,
                Err(DbError::NotFound { .. }) => normalize_name(name),
                Err(e) => return Err(e),
            };
            if let Some((conn, provider)) = ctx.held_connection(&held_name) {
                debug!(datasource = %held_name, "Reusing transaction connection");
                return Ok(lease(held_name, conn, provider, true));
            }
        }

        let provider = self.inner.registry.get_or_create_provider(name).await?;
        let real = provider.name().to_string();
        let retry = self.retry_policy(&real).await;

        match ctx.state_mut() {
            TxState::Absent => {
                debug!(datasource = %real, "Routing to auto-commit connection");
                let conn = acquire_with_retry(provider.as_ref(), &retry).await?;
                Ok(lease(real, conn, provider, false))
            }
            TxState::Single(coordinator) => {
                if let Some((conn, held)) = coordinator.bound_connection(&real) {
                    return Ok(lease(real, conn, held, true));
                }
                if let Some(bound) = coordinator.bound_datasource() {
                    return match self.inner.policy {
                        ForeignDataSourcePolicy::Reject => Err(DbError::transaction(format!(
                            "Transaction is bound to '{}'; '{}' needs a multi-datasource transaction",
                            bound, real
                        ))),
                        ForeignDataSourcePolicy::Unmanaged => {
                            warn!(
                                datasource = %real,
                                bound = %bound,
                                "Datasource outside the single-datasource transaction, using an auto-commit connection"
                            );
                            let conn = acquire_with_retry(provider.as_ref(), &retry).await?;
                            Ok(lease(real, conn, provider, false))
                        }
                    };
                }

                let conn = acquire_with_retry(provider.as_ref(), &retry).await?;
                if let Err(e) = conn.set_auto_commit(false).await {
                    release_quietly(&provider, conn).await;
                    return Err(e);
                }
                coordinator.bind(&real, conn.clone(), Arc::clone(&provider));
                Ok(lease(real, conn, provider, true))
            }
            TxState::Multi(coordinator) => {
                if let Some((conn, held)) = coordinator.connection_for(&real) {
                    return Ok(lease(real, conn, held, true));
                }

                if let Some(Ok(engine)) = self
                    .inner
                    .registry
                    .config(&real)
                    .await
                    .map(|config| config.database_type())
                {
                    if !engine.supports_two_phase_commit() {
                        warn!(
                            datasource = %real,
                            engine = %engine,
                            "Engine has no two-phase commit, its branch commits locally in phase two"
                        );
                    }
                }

                let conn = {
                    let global = coordinator.global();
                    with_retry(&real, &retry, || {
                        provider.acquire_for_global_transaction(global)
                    })
                    .await?
                };
                if let Err(e) = coordinator.enlist(&real, conn.clone(), Arc::clone(&provider)) {
                    release_quietly(&provider, conn).await;
                    return Err(e);
                }
                Ok(lease(real, conn, provider, true))
            }
        }
    }

    /// Get an auto-commit connection for `name` regardless of any transaction.
    pub async fn acquire_independent(&self, name: &str) -> DbResult<Lease> {
        let provider = self.inner.registry.get_or_create_provider(name).await?;
        let real = provider.name().to_string();
        let retry = self.retry_policy(&real).await;
        let conn = acquire_with_retry(provider.as_ref(), &retry).await?;
        Ok(lease(real, conn, provider, false))
    }

    /// Return an unmanaged lease to its pool. Managed leases are left to the
    /// transaction.
    pub async fn release(&self, ctx: &TransactionContext, lease: Lease) -> DbResult<()> {
        if lease.managed {
            debug!(
                datasource = %lease.datasource,
                depth = ctx.depth(),
                "Leaving transaction connection open"
            );
            return Ok(());
        }
        lease.provider.release(lease.conn).await
    }

    async fn retry_policy(&self, real: &str) -> RetryPolicy {
        self.inner
            .registry
            .config(real)
            .await
            .map(|config| config.retry.clone())
            .unwrap_or_default()
    }
}

fn lease(datasource: String, conn: ConnectionRef, provider: ProviderRef, managed: bool) -> Lease {
    Lease {
        datasource,
        conn,
        provider,
        managed,
    }
}

async fn release_quietly(provider: &ProviderRef, conn: ConnectionRef) {
    if let Err(e) = provider.release(conn).await {
        warn!(datasource = %provider.name(), error = %e, "Failed to release connection");
    }
}
