//! Transaction coordination.
//!
//! A [`TransactionContext`] is owned by one unit of work and passed to the
//! router explicitly. Nested `begin`/`commit`/`close` calls are counted so the
//! whole nest ends in exactly one physical commit or rollback:
//!
//! - `begin` increments the depth and the transaction count
//! - `commit` increments the commit count and commits physically once both counts match
//! - `close` decrements the depth; the outermost close rolls back unless every
//!   begin was matched by a commit, then releases the connections
//!
//! Single mode binds one datasource connection. Multi mode enlists one
//! connection per datasource in a global transaction committed in two phases.

use crate::db::connection::ConnectionRef;
use crate::db::global::{GlobalStatus, GlobalTransaction, GlobalTransactionManager};
use crate::db::provider::ProviderRef;
use crate::error::{DbError, DbResult};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What a single-datasource transaction does when code touches another datasource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ForeignDataSourcePolicy {
    /// Fail with a transaction error.
    #[default]
    Reject,
    /// Hand out an ordinary auto-commit connection outside the transaction.
    Unmanaged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    None,
    Single,
    Multi,
}

impl std::fmt::Display for TransactionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Single => "single",
            Self::Multi => "multi",
        };
        f.write_str(s)
    }
}

/// A connection held by a coordinator together with the provider it goes back to.
#[derive(Debug)]
pub(crate) struct Held {
    pub(crate) conn: ConnectionRef,
    pub(crate) provider: ProviderRef,
}

impl Held {
    fn parts(&self) -> (ConnectionRef, ProviderRef) {
        (self.conn.clone(), Arc::clone(&self.provider))
    }
}

/// Coordinator for a transaction on one datasource.
#[derive(Debug)]
pub struct SingleCoordinator {
    depth: u32,
    tx_count: u32,
    commit_count: u32,
    bound: Option<(String, Held)>,
}

impl SingleCoordinator {
    fn new() -> Self {
        Self {
            depth: 1,
            tx_count: 1,
            commit_count: 0,
            bound: None,
        }
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn tx_count(&self) -> u32 {
        self.tx_count
    }

    pub fn commit_count(&self) -> u32 {
        self.commit_count
    }

    /// Every begin has been matched by a commit.
    pub fn is_fully_executed(&self) -> bool {
        self.commit_count >= self.tx_count
    }

    /// Real name of the datasource the transaction is bound to.
    pub fn bound_datasource(&self) -> Option<&str> {
        self.bound.as_ref().map(|(name, _)| name.as_str())
    }

    pub(crate) fn bound_connection(&self, datasource: &str) -> Option<(ConnectionRef, ProviderRef)> {
        self.bound
            .as_ref()
            .filter(|(name, _)| name == datasource)
            .map(|(_, held)| held.parts())
    }

    pub(crate) fn bind(&mut self, datasource: &str, conn: ConnectionRef, provider: ProviderRef) {
        debug!(datasource = %datasource, depth = self.depth, "Bound connection to transaction");
        self.bound = Some((datasource.to_string(), Held { conn, provider }));
    }

    fn begin_nested(&mut self) {
        self.depth += 1;
        self.tx_count += 1;
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.commit_count += 1;
        if self.commit_count != self.tx_count {
            debug!(
                commit_count = self.commit_count,
                tx_count = self.tx_count,
                "Deferring commit to the outermost transaction"
            );
            return Ok(());
        }
        let Some((name, held)) = &self.bound else {
            debug!("Commit with no bound connection");
            return Ok(());
        };

        match held.conn.commit().await {
            Ok(()) => {
                info!(datasource = %name, "Committed transaction");
                Ok(())
            }
            Err(e) => {
                warn!(datasource = %name, error = %e, "Commit failed, rolling back");
                match held.conn.rollback().await {
                    Ok(()) => Err(DbError::transaction(format!(
                        "Commit on '{}' failed and was rolled back: {}",
                        name, e
                    ))),
                    Err(rollback_err) => {
                        error!(datasource = %name, error = %rollback_err, "Rollback after failed commit failed");
                        Err(DbError::transaction_rollback(e, rollback_err))
                    }
                }
            }
        }
    }

    /// Outermost close: roll back unless fully executed, then release.
    async fn finish(self) -> DbResult<()> {
        let fully_executed = self.is_fully_executed();
        let Some((name, held)) = self.bound else {
            return Ok(());
        };

        let mut result = Ok(());
        if !fully_executed {
            match held.conn.rollback().await {
                Ok(()) => info!(datasource = %name, "Rolled back transaction"),
                Err(e) => {
                    error!(datasource = %name, error = %e, "Rollback failed");
                    result = Err(DbError::transaction(format!(
                        "Rollback on '{}' failed: {}",
                        name, e
                    )));
                }
            }
        }
        release_held(&name, held).await;
        result
    }
}

/// Coordinator for a transaction spanning several datasources.
#[derive(Debug)]
pub struct MultiCoordinator {
    depth: u32,
    tx_count: u32,
    commit_count: u32,
    global: GlobalTransaction,
    enlisted: BTreeMap<String, Held>,
}

impl MultiCoordinator {
    fn new(global: GlobalTransaction) -> Self {
        Self {
            depth: 1,
            tx_count: 1,
            commit_count: 0,
            global,
            enlisted: BTreeMap::new(),
        }
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn tx_count(&self) -> u32 {
        self.tx_count
    }

    pub fn commit_count(&self) -> u32 {
        self.commit_count
    }

    pub fn is_fully_executed(&self) -> bool {
        self.commit_count >= self.tx_count
    }

    pub fn global(&self) -> &GlobalTransaction {
        &self.global
    }

    /// Real names of the enlisted datasources, sorted.
    pub fn enlisted_datasources(&self) -> Vec<String> {
        self.enlisted.keys().cloned().collect()
    }

    pub(crate) fn connection_for(&self, datasource: &str) -> Option<(ConnectionRef, ProviderRef)> {
        self.enlisted.get(datasource).map(Held::parts)
    }

    /// Enlist a connection whose branch was started for this global transaction.
    pub(crate) fn enlist(
        &mut self,
        datasource: &str,
        conn: ConnectionRef,
        provider: ProviderRef,
    ) -> DbResult<()> {
        if self.enlisted.contains_key(datasource) {
            return Err(DbError::transaction(format!(
                "Datasource '{}' is already enlisted",
                datasource
            )));
        }
        self.global.register(datasource, conn.clone())?;
        self.enlisted
            .insert(datasource.to_string(), Held { conn, provider });
        debug!(datasource = %datasource, xid = %self.global.xid(), "Enlisted connection");
        Ok(())
    }

    /// Nested begin. A global transaction that already completed is replaced
    /// by a fresh one and every enlisted connection joins it.
    async fn begin_nested(&mut self, tm: &GlobalTransactionManager) -> DbResult<()> {
        self.depth += 1;
        self.tx_count += 1;
        if self.global.status() == GlobalStatus::Active {
            return Ok(());
        }
        let mut global = tm.begin();
        for (name, held) in &self.enlisted {
            held.conn.xa_start(&global.branch_xid(name)).await?;
            global.register(name, held.conn.clone())?;
        }
        self.global = global;
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.commit_count += 1;
        if self.commit_count != self.tx_count {
            debug!(
                commit_count = self.commit_count,
                tx_count = self.tx_count,
                "Deferring commit to the outermost transaction"
            );
            return Ok(());
        }

        match self.global.commit().await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(xid = %self.global.xid(), error = %e, "Global commit failed, rolling back");
                match self.global.rollback().await {
                    Ok(()) => Err(e),
                    Err(rollback_err) => Err(DbError::transaction_rollback(e, rollback_err)),
                }
            }
        }
    }

    async fn finish(mut self) -> DbResult<()> {
        let mut result = Ok(());
        if !self.is_fully_executed() && self.global.status() == GlobalStatus::Active {
            if let Err(e) = self.global.rollback().await {
                error!(xid = %self.global.xid(), error = %e, "Global rollback failed");
                result = Err(DbError::transaction(format!(
                    "Rollback of global transaction {} failed: {}",
                    self.global.xid(),
                    e
                )));
            }
        }
        for (name, held) in std::mem::take(&mut self.enlisted) {
            release_held(&name, held).await;
        }
        result
    }
}

async fn release_held(datasource: &str, held: Held) {
    if let Err(e) = held.provider.release(held.conn).await {
        warn!(datasource = %datasource, error = %e, "Failed to release transaction connection");
    }
}

#[derive(Debug, Default)]
pub(crate) enum TxState {
    #[default]
    Absent,
    Single(SingleCoordinator),
    Multi(MultiCoordinator),
}

/// Transaction state of one unit of work.
///
/// ```ignore
/// let mut ctx = router.new_context();
/// ctx.begin().await?;
/// let lease = router.acquire(&mut ctx, "orders").await?;
/// lease.execute("UPDATE stock SET qty = qty - 1").await?;
/// ctx.commit().await?;
/// ctx.close().await?;
/// ```
///
/// Dropping a context with an open transaction rolls it back on a
/// background task.
#[derive(Debug, Default)]
pub struct TransactionContext {
    state: TxState,
    tm: GlobalTransactionManager,
}

impl TransactionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context whose multi-datasource transactions come from `tm`.
    pub fn with_manager(tm: GlobalTransactionManager) -> Self {
        Self {
            state: TxState::Absent,
            tm,
        }
    }

    pub fn mode(&self) -> TransactionMode {
        match self.state {
            TxState::Absent => TransactionMode::None,
            TxState::Single(_) => TransactionMode::Single,
            TxState::Multi(_) => TransactionMode::Multi,
        }
    }

    pub fn in_transaction(&self) -> bool {
        !matches!(self.state, TxState::Absent)
    }

    /// Current nesting depth, 0 outside a transaction.
    pub fn depth(&self) -> u32 {
        match &self.state {
            TxState::Absent => 0,
            TxState::Single(c) => c.depth(),
            TxState::Multi(c) => c.depth(),
        }
    }

    pub fn single(&self) -> Option<&SingleCoordinator> {
        match &self.state {
            TxState::Single(c) => Some(c),
            _ => None,
        }
    }

    pub fn multi(&self) -> Option<&MultiCoordinator> {
        match &self.state {
            TxState::Multi(c) => Some(c),
            _ => None,
        }
    }

    pub(crate) fn state_mut(&mut self) -> &mut TxState {
        &mut self.state
    }

    /// Connection this context already holds for `datasource`, with its provider.
    pub(crate) fn held_connection(&self, datasource: &str) -> Option<(ConnectionRef, ProviderRef)> {
        match &self.state {
            TxState::Absent => None,
            TxState::Single(c) => c.bound_connection(datasource),
            TxState::Multi(c) => c.connection_for(datasource),
        }
    }

    /// Begin a single-datasource transaction, or nest into the current one.
    ///
    /// Inside a multi-datasource transaction this nests into it instead.
    pub async fn begin(&mut self) -> DbResult<()> {
        match &mut self.state {
            TxState::Absent => {
                self.state = TxState::Single(SingleCoordinator::new());
                debug!("Began single-datasource transaction");
            }
            TxState::Single(c) => c.begin_nested(),
            TxState::Multi(c) => c.begin_nested(&self.tm).await?,
        }
        Ok(())
    }

    /// Begin a multi-datasource transaction, or nest into the current one.
    pub async fn begin_multi(&mut self) -> DbResult<()> {
        match &mut self.state {
            TxState::Absent => {
                let global = self.tm.begin();
                debug!(xid = %global.xid(), "Began multi-datasource transaction");
                self.state = TxState::Multi(MultiCoordinator::new(global));
            }
            TxState::Multi(c) => c.begin_nested(&self.tm).await?,
            TxState::Single(_) => {
                return Err(DbError::transaction(
                    "Incompatible transaction mode: cannot begin a multi-datasource transaction inside a single-datasource one",
                ));
            }
        }
        Ok(())
    }

    /// Count a commit; the physical commit runs once every begin is matched.
    pub async fn commit(&mut self) -> DbResult<()> {
        match &mut self.state {
            TxState::Absent => Err(no_active_transaction("commit")),
            TxState::Single(c) => c.commit().await,
            TxState::Multi(c) => c.commit().await,
        }
    }

    /// Leave one nesting level. The outermost close ends the transaction.
    ///
    /// Connections are released even when the rollback fails.
    pub async fn close(&mut self) -> DbResult<()> {
        match &mut self.state {
            TxState::Absent => return Err(no_active_transaction("close")),
            TxState::Single(c) if c.depth > 1 => {
                c.depth -= 1;
                return Ok(());
            }
            TxState::Multi(c) if c.depth > 1 => {
                c.depth -= 1;
                return Ok(());
            }
            _ => {}
        }
        finish_state(std::mem::take(&mut self.state)).await
    }
}

fn no_active_transaction(operation: &str) -> DbError {
    DbError::transaction(format!("Cannot {}: no active transaction", operation))
}

async fn finish_state(state: TxState) -> DbResult<()> {
    match state {
        TxState::Absent => Ok(()),
        TxState::Single(c) => c.finish().await,
        TxState::Multi(c) => c.finish().await,
    }
}

impl Drop for TransactionContext {
    fn drop(&mut self) {
        let state = std::mem::take(&mut self.state);
        if matches!(state, TxState::Absent) {
            return;
        }
        warn!("Transaction context dropped with an open transaction");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = finish_state(state).await {
                        error!(error = %e, "Failed to clean up dropped transaction");
                    }
                });
            }
            Err(_) => error!("No async runtime to roll back dropped transaction"),
        }
    }
}
