//! Two-phase commit across datasources.
//!
//! [`GlobalTransaction`] tracks one branch per enlisted datasource. Commit
//! prepares every branch and only then commits them; if any prepare fails the
//! caller is expected to roll the whole transaction back.
//!
//! Engine support follows [`Connection`](crate::db::Connection)'s `xa_*`
//! methods: PostgreSQL uses prepared transactions, MySQL uses XA statements,
//! SQLite has no two-phase commit and prepares as a no-op.

use crate::db::connection::{ConnectionRef, Xid};
use crate::error::{DbError, DbResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info};

/// Status of one branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchState {
    Active,
    Prepared,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalStatus {
    Active,
    Preparing,
    Committed,
    RolledBack,
    /// Phase two failed for at least one branch.
    Heuristic,
}

#[derive(Debug)]
struct Branch {
    datasource: String,
    xid: Xid,
    conn: ConnectionRef,
    state: BranchState,
}

/// Creates global transactions and keeps simple outcome counters.
#[derive(Debug, Clone, Default)]
pub struct GlobalTransactionManager {
    stats: Arc<GlobalStats>,
}

#[derive(Debug, Default)]
struct GlobalStats {
    committed: AtomicU64,
    rolled_back: AtomicU64,
}

impl GlobalTransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a global transaction with a fresh id.
    pub fn begin(&self) -> GlobalTransaction {
        let tx = GlobalTransaction {
            xid: Xid::new_global(),
            branches: Vec::new(),
            status: GlobalStatus::Active,
            stats: Arc::clone(&self.stats),
        };
        debug!(xid = %tx.xid, "Started global transaction");
        tx
    }

    pub fn committed_count(&self) -> u64 {
        self.stats.committed.load(Ordering::Relaxed)
    }

    pub fn rolled_back_count(&self) -> u64 {
        self.stats.rolled_back.load(Ordering::Relaxed)
    }
}

/// One global transaction and its enlisted branches.
#[derive(Debug)]
pub struct GlobalTransaction {
    xid: Xid,
    branches: Vec<Branch>,
    status: GlobalStatus,
    stats: Arc<GlobalStats>,
}

impl GlobalTransaction {
    pub fn xid(&self) -> &Xid {
        &self.xid
    }

    /// Branch id a provider must start for `datasource`: its existing branch,
    /// or the one [`register`](Self::register) will record next.
    pub fn branch_xid(&self, datasource: &str) -> Xid {
        self.branches
            .iter()
            .find(|b| b.datasource == datasource)
            .map(|b| b.xid.clone())
            .unwrap_or_else(|| self.xid.branch(self.branches.len() + 1, datasource))
    }

    pub fn status(&self) -> GlobalStatus {
        self.status
    }

    pub fn participant_count(&self) -> usize {
        self.branches.len()
    }

    pub fn branch_state(&self, datasource: &str) -> Option<BranchState> {
        self.branches
            .iter()
            .find(|b| b.datasource == datasource)
            .map(|b| b.state)
    }

    /// Record a connection whose branch was already started.
    pub fn register(&mut self, datasource: &str, conn: ConnectionRef) -> DbResult<()> {
        if self.status != GlobalStatus::Active {
            return Err(DbError::transaction(format!(
                "Cannot enlist '{}' in global transaction {} after it completed",
                datasource, self.xid
            )));
        }
        if self.branches.iter().any(|b| b.datasource == datasource) {
            return Err(DbError::transaction(format!(
                "Datasource '{}' is already enlisted in global transaction {}",
                datasource, self.xid
            )));
        }
        let xid = self.branch_xid(datasource);
        self.branches.push(Branch {
            datasource: datasource.to_string(),
            xid,
            conn,
            state: BranchState::Active,
        });
        Ok(())
    }

    /// Prepare every branch, then commit every branch.
    ///
    /// A prepare failure returns immediately and leaves the transaction for
    /// [`rollback`](Self::rollback). Commit failures in phase two are collected
    /// across all branches and reported together.
    pub async fn commit(&mut self) -> DbResult<()> {
        if self.status != GlobalStatus::Active {
            return Err(DbError::transaction(format!(
                "Global transaction {} is not active",
                self.xid
            )));
        }
        self.status = GlobalStatus::Preparing;

        for branch in &mut self.branches {
            branch.conn.xa_prepare(&branch.xid).await.map_err(|e| {
                DbError::transaction(format!(
                    "Prepare failed for '{}' in global transaction {}: {}",
                    branch.datasource, self.xid, e
                ))
            })?;
            branch.state = BranchState::Prepared;
        }

        let mut failures = Vec::new();
        for branch in &mut self.branches {
            match branch.conn.xa_commit(&branch.xid).await {
                Ok(()) => branch.state = BranchState::Committed,
                Err(e) => {
                    error!(xid = %branch.xid, datasource = %branch.datasource, error = %e, "Branch commit failed");
                    failures.push(format!("{}: {}", branch.datasource, e));
                }
            }
        }

        if failures.is_empty() {
            self.status = GlobalStatus::Committed;
            self.stats.committed.fetch_add(1, Ordering::Relaxed);
            info!(xid = %self.xid, branches = self.branches.len(), "Committed global transaction");
            Ok(())
        } else {
            self.status = GlobalStatus::Heuristic;
            Err(DbError::transaction(format!(
                "Global transaction {} partially failed to commit: {}",
                self.xid,
                failures.join("; ")
            )))
        }
    }

    /// Roll back every branch that has not completed yet.
    ///
    /// Every branch is attempted; the first failure is returned afterwards.
    pub async fn rollback(&mut self) -> DbResult<()> {
        let mut first_err = None;
        for branch in &mut self.branches {
            if matches!(branch.state, BranchState::Committed | BranchState::RolledBack) {
                continue;
            }
            match branch.conn.xa_rollback(&branch.xid).await {
                Ok(()) => branch.state = BranchState::RolledBack,
                Err(e) => {
                    error!(xid = %branch.xid, datasource = %branch.datasource, error = %e, "Branch rollback failed");
                    first_err.get_or_insert(e);
                }
            }
        }
        if self.status != GlobalStatus::Heuristic {
            self.status = GlobalStatus::RolledBack;
        }
        self.stats.rolled_back.fetch_add(1, Ordering::Relaxed);
        info!(xid = %self.xid, branches = self.branches.len(), "Rolled back global transaction");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Connection;
    use crate::db::test_support::MockConnection;

    fn enlisted(tx: &mut GlobalTransaction, name: &str) -> Arc<MockConnection> {
        let conn = Arc::new(MockConnection::new(name));
        tx.register(name, conn.clone()).unwrap();
        conn
    }

    #[tokio::test]
    async fn test_commit_prepares_then_commits_all() {
        let tm = GlobalTransactionManager::new();
        let mut tx = tm.begin();
        let a = enlisted(&mut tx, "a");
        let b = enlisted(&mut tx, "b");

        tx.commit().await.unwrap();

        assert_eq!(tx.status(), GlobalStatus::Committed);
        assert_eq!(a.prepares(), 1);
        assert_eq!(b.prepares(), 1);
        assert_eq!(a.commits(), 1);
        assert_eq!(b.commits(), 1);
        assert_eq!(tm.committed_count(), 1);
    }

    #[tokio::test]
    async fn test_prepare_failure_commits_nothing() {
        let tm = GlobalTransactionManager::new();
        let mut tx = tm.begin();
        let a = enlisted(&mut tx, "a");
        let b = enlisted(&mut tx, "b");
        b.fail_prepare();

        assert!(tx.commit().await.is_err());
        assert_eq!(a.commits(), 0);
        assert_eq!(b.commits(), 0);

        tx.rollback().await.unwrap();
        assert_eq!(a.rollbacks(), 1);
        assert_eq!(b.rollbacks(), 1);
        assert_eq!(tx.status(), GlobalStatus::RolledBack);
    }

    #[tokio::test]
    async fn test_rollback_skips_committed_branches() {
        let tm = GlobalTransactionManager::new();
        let mut tx = tm.begin();
        let a = enlisted(&mut tx, "a");
        let b = enlisted(&mut tx, "b");
        b.fail_commit();

        assert!(tx.commit().await.is_err());
        assert_eq!(tx.status(), GlobalStatus::Heuristic);
        assert_eq!(tx.branch_state("a"), Some(BranchState::Committed));

        tx.rollback().await.unwrap();
        assert_eq!(a.rollbacks(), 0);
        assert_eq!(b.rollbacks(), 1);
    }

    #[test]
    fn test_branch_ids_are_unique_per_participant() {
        let tm = GlobalTransactionManager::new();
        let mut tx = tm.begin();
        let expected = tx.branch_xid("orders db");
        enlisted(&mut tx, "orders db");
        enlisted(&mut tx, "ordersdb");
        enlisted(&mut tx, "заказы");
        enlisted(&mut tx, "счета");

        assert_eq!(tx.branch_xid("orders db"), expected);
        let gids: std::collections::HashSet<_> = tx.branches.iter().map(|b| b.xid.gid()).collect();
        assert_eq!(gids.len(), 4);
        assert!(tx.branches.iter().all(|b| b.xid.global_id() == tx.xid().global_id()));
    }

    #[tokio::test]
    async fn test_duplicate_enlistment_rejected() {
        let tm = GlobalTransactionManager::new();
        let mut tx = tm.begin();
        enlisted(&mut tx, "a");
        let again = Arc::new(MockConnection::new("a"));
        assert!(tx.register("a", again).is_err());
        assert_eq!(tx.participant_count(), 1);
    }

    #[tokio::test]
    async fn test_commit_twice_rejected() {
        let tm = GlobalTransactionManager::new();
        let mut tx = tm.begin();
        let a = enlisted(&mut tx, "a");
        tx.commit().await.unwrap();
        assert!(tx.commit().await.is_err());
        assert_eq!(a.commits(), 1);
        assert!(!a.is_closed());
    }
}
