//! Connection abstraction shared by every provider engine.
//!
//! A [`Connection`] is one physical database session. Providers hand them out
//! as [`ConnectionRef`] so a transaction coordinator and the calling code can
//! hold the same session at once; all methods take `&self` and implementations
//! serialize access internally.

use crate::error::DbResult;
use async_trait::async_trait;
use std::sync::Arc;

const MAX_BRANCH_LEN: usize = 64;

/// Identifier of one branch of a global transaction.
///
/// `global_id` is shared by every participant; `branch` tells them apart so
/// two branches on the same server never collide. The branch qualifier starts
/// with the participant's position, which keeps it unique whatever the
/// datasource name sanitizes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Xid {
    global_id: String,
    branch: String,
}

impl Xid {
    /// Generate a fresh global id with an empty branch qualifier.
    pub fn new_global() -> Self {
        Self {
            global_id: uuid::Uuid::new_v4().to_string(),
            branch: String::new(),
        }
    }

    /// Derive the branch id for participant `index` of this global
    /// transaction. `label` is kept as a readable suffix, reduced to
    /// characters that are safe inside quoted SQL and capped so the whole
    /// qualifier fits MySQL's 64-byte `bqual`.
    pub fn branch(&self, index: usize, label: &str) -> Self {
        let mut branch = format!("{}.", index);
        let room = MAX_BRANCH_LEN.saturating_sub(branch.len());
        branch.extend(
            label
                .chars()
                .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
                .take(room),
        );
        Self {
            global_id: self.global_id.clone(),
            branch,
        }
    }

    pub fn global_id(&self) -> &str {
        &self.global_id
    }

    pub fn branch_qualifier(&self) -> &str {
        &self.branch
    }

    /// Single-string form used as a PostgreSQL prepared transaction gid.
    pub fn gid(&self) -> String {
        if self.branch.is_empty() {
            self.global_id.clone()
        } else {
            format!("{}:{}", self.global_id, self.branch)
        }
    }

    /// `'gtrid','bqual'` form used by MySQL XA statements.
    pub fn mysql_xid(&self) -> String {
        format!("'{}','{}'", self.global_id, self.branch)
    }
}

impl std::fmt::Display for Xid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.gid())
    }
}

/// One physical database session.
///
/// In manual-commit mode a local transaction is opened lazily by the first
/// statement and ended by [`commit`](Connection::commit) or
/// [`rollback`](Connection::rollback). The `xa_*` methods drive a branch of a
/// global transaction; the defaults map them onto the local transaction, which
/// is what engines without two-phase commit get.
#[async_trait]
pub trait Connection: Send + Sync + std::fmt::Debug {
    /// Real name of the datasource this session belongs to.
    fn datasource(&self) -> &str;

    fn is_closed(&self) -> bool;

    /// Switch between auto-commit and manual commit.
    ///
    /// Turning auto-commit back on while a local transaction is open commits it.
    async fn set_auto_commit(&self, auto_commit: bool) -> DbResult<()>;

    /// Run a statement verbatim and return the affected row count.
    async fn execute(&self, sql: &str) -> DbResult<u64>;

    async fn commit(&self) -> DbResult<()>;

    async fn rollback(&self) -> DbResult<()>;

    /// End the session. An open local transaction is rolled back first.
    /// Closing twice is a no-op.
    async fn close(&self) -> DbResult<()>;

    async fn xa_start(&self, _xid: &Xid) -> DbResult<()> {
        self.set_auto_commit(false).await
    }

    async fn xa_prepare(&self, _xid: &Xid) -> DbResult<()> {
        Ok(())
    }

    async fn xa_commit(&self, _xid: &Xid) -> DbResult<()> {
        self.commit().await
    }

    async fn xa_rollback(&self, _xid: &Xid) -> DbResult<()> {
        self.rollback().await
    }
}

/// Shared handle to a [`Connection`].
pub type ConnectionRef = Arc<dyn Connection>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branches_share_global_id() {
        let xid = Xid::new_global();
        let a = xid.branch(1, "orders");
        let b = xid.branch(2, "billing");
        assert_eq!(a.global_id(), b.global_id());
        assert_ne!(a, b);
        assert_ne!(a.gid(), b.gid());
    }

    #[test]
    fn test_branch_qualifier_is_sanitized() {
        let xid = Xid::new_global().branch(1, "o'rders; drop");
        assert_eq!(xid.branch_qualifier(), "1.ordersdrop");
        assert!(!xid.mysql_xid().contains(';'));
    }

    #[test]
    fn test_names_that_sanitize_alike_get_distinct_branches() {
        let xid = Xid::new_global();
        let long_a = format!("{}a", "x".repeat(80));
        let long_b = format!("{}b", "x".repeat(80));
        let pairs = [
            ("orders db", "ordersdb"),
            ("заказы", "счета"),
            (long_a.as_str(), long_b.as_str()),
        ];
        for (left, right) in pairs {
            let a = xid.branch(1, left);
            let b = xid.branch(2, right);
            assert_ne!(a.gid(), b.gid(), "{left} vs {right}");
            assert_ne!(a.mysql_xid(), b.mysql_xid());
        }
    }

    #[test]
    fn test_branch_qualifier_fits_mysql_limit() {
        let xid = Xid::new_global().branch(12345, &"n".repeat(200));
        assert_eq!(xid.branch_qualifier().len(), 64);
        assert!(xid.branch_qualifier().starts_with("12345."));
        assert_eq!(Xid::new_global().branch(3, "").branch_qualifier(), "3.");
    }

    #[test]
    fn test_global_xids_are_unique() {
        assert_ne!(Xid::new_global(), Xid::new_global());
    }

    #[test]
    fn test_mysql_xid_format() {
        let xid = Xid::new_global().branch(1, "main");
        let formatted = xid.mysql_xid();
        assert!(formatted.starts_with('\''));
        assert!(formatted.ends_with(",'1.main'"));
    }
}
