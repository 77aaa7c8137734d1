//! Batch statement execution.
//!
//! Statements run in chunks on one leased connection. Outside a transaction
//! each chunk is its own local transaction whenever `rollback` is requested or
//! chunking is on; a failing chunk is recorded and the remaining chunks still
//! run. Inside a transaction the batch joins it and a failing chunk aborts the
//! batch so the coordinator decides the outcome.

use crate::db::connection::ConnectionRef;
use crate::db::router::{Lease, Router};
use crate::db::transaction::TransactionContext;
use crate::error::{DbError, DbResult};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Outcome of [`BatchExecutor::execute`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchUpdateResult {
    /// No chunk failed.
    pub success: bool,
    /// 1-based numbers of the chunks that failed.
    pub error_batches: Vec<usize>,
    /// Affected row counts of the statements whose work was kept.
    pub rows: Vec<u64>,
}

impl BatchUpdateResult {
    pub fn total_rows(&self) -> u64 {
        self.rows.iter().sum()
    }
}

#[derive(Debug, Clone, Copy)]
struct BatchPlan {
    chunk_size: usize,
    in_transaction: bool,
    rollback: bool,
    manual_commit: bool,
}

/// Runs statement batches through a [`Router`].
#[derive(Debug, Clone)]
pub struct BatchExecutor {
    router: Router,
    chunk_size: usize,
}

impl BatchExecutor {
    pub fn new(router: Router) -> Self {
        Self {
            router,
            chunk_size: 0,
        }
    }

    /// Statements per chunk; 0 runs the whole batch as one chunk.
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Number of chunks `statements` statements are split into.
    pub fn chunk_count(&self, statements: usize) -> usize {
        if self.chunk_size == 0 || statements == 0 {
            return usize::from(statements > 0);
        }
        statements.div_ceil(self.chunk_size)
    }

    /// Run `statements` against datasource `name`.
    ///
    /// Blank statements are skipped. An active transaction in `ctx` forces
    /// `rollback` on.
    pub async fn execute<S: AsRef<str>>(
        &self,
        ctx: &mut TransactionContext,
        name: &str,
        statements: &[S],
        rollback: bool,
    ) -> DbResult<BatchUpdateResult> {
        let statements: Vec<&str> = statements
            .iter()
            .map(|s| s.as_ref().trim())
            .filter(|s| !s.is_empty())
            .collect();
        if statements.is_empty() {
            return Err(DbError::invalid_input("Batch contains no statements"));
        }

        let in_transaction = ctx.in_transaction();
        let rollback = rollback || in_transaction;
        let chunk_size = match self.chunk_size {
            0 => statements.len(),
            n => n,
        };
        let plan = BatchPlan {
            chunk_size,
            in_transaction,
            rollback,
            manual_commit: !in_transaction && (rollback || self.chunk_size > 0),
        };

        let lease = self.router.acquire(ctx, name).await?;
        debug!(
            datasource = %lease.datasource(),
            statements = statements.len(),
            chunks = self.chunk_count(statements.len()),
            rollback,
            in_transaction,
            "Executing batch"
        );

        let outcome = self.run(&lease, &statements, plan).await;

        if plan.manual_commit {
            if let Err(e) = lease.connection().set_auto_commit(true).await {
                warn!(datasource = %lease.datasource(), error = %e, "Failed to restore auto-commit after batch");
            }
        }
        let datasource = lease.datasource().to_string();
        if let Err(e) = self.router.release(ctx, lease).await {
            warn!(datasource = %datasource, error = %e, "Failed to release batch connection");
        }

        let result = outcome?;
        info!(
            datasource = %datasource,
            success = result.success,
            failed_chunks = result.error_batches.len(),
            rows = result.total_rows(),
            "Batch finished"
        );
        Ok(result)
    }

    async fn run(
        &self,
        lease: &Lease,
        statements: &[&str],
        plan: BatchPlan,
    ) -> DbResult<BatchUpdateResult> {
        let conn = lease.connection();
        if plan.manual_commit {
            conn.set_auto_commit(false).await?;
        }

        let mut result = BatchUpdateResult {
            success: true,
            ..Default::default()
        };
        for (index, chunk) in statements.chunks(plan.chunk_size).enumerate() {
            let number = index + 1;
            let mut rows = Vec::with_capacity(chunk.len());
            match run_chunk(conn, chunk, plan.manual_commit, &mut rows).await {
                Ok(()) => result.rows.extend(rows),
                Err(e) if plan.in_transaction => {
                    warn!(datasource = %lease.datasource(), batch = number, error = %e, "Batch chunk failed inside transaction");
                    return Err(e);
                }
                Err(e) => {
                    warn!(datasource = %lease.datasource(), batch = number, error = %e, "Batch chunk failed");
                    result.success = false;
                    result.error_batches.push(number);
                    if plan.rollback {
                        conn.rollback().await?;
                    } else {
                        if plan.manual_commit {
                            conn.commit().await?;
                        }
                        result.rows.extend(rows);
                    }
                }
            }
        }
        Ok(result)
    }
}

async fn run_chunk(
    conn: &ConnectionRef,
    chunk: &[&str],
    commit: bool,
    rows: &mut Vec<u64>,
) -> DbResult<()> {
    for sql in chunk {
        rows.push(conn.execute(sql).await?);
    }
    if commit {
        conn.commit().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Connection;
    use crate::db::registry::Registry;
    use crate::db::test_support::{MockConnection, MockFactory, MockProvider};
    use crate::models::DataSourceConfig;
    use std::sync::Arc;

    async fn executor(chunk_size: usize) -> (Arc<MockFactory>, Router, BatchExecutor) {
        let factory = Arc::new(MockFactory::new());
        let registry = Arc::new(Registry::new(factory.clone()));
        registry
            .register(DataSourceConfig::new("main", "sqlite:main.db").unwrap())
            .await
            .unwrap();
        let router = Router::new(registry);
        let executor = BatchExecutor::new(router.clone()).chunk_size(chunk_size);
        (factory, router, executor)
    }

    fn only(factory: &MockFactory) -> (Arc<MockProvider>, Arc<MockConnection>) {
        let provider = factory.created_for("main")[0].clone();
        let conn = provider.connections()[0].clone();
        (provider, conn)
    }

    #[test]
    fn test_chunk_count() {
        let router = Router::new(Arc::new(Registry::new(Arc::new(MockFactory::new()))));
        assert_eq!(BatchExecutor::new(router.clone()).chunk_count(7), 1);
        assert_eq!(BatchExecutor::new(router.clone()).chunk_count(0), 0);
        assert_eq!(BatchExecutor::new(router.clone()).chunk_size(3).chunk_count(7), 3);
        assert_eq!(BatchExecutor::new(router).chunk_size(3).chunk_count(6), 2);
    }

    #[tokio::test]
    async fn test_empty_batch_rejected() {
        let (_, router, executor) = executor(0).await;
        let mut ctx = router.new_context();
        let err = executor
            .execute(&mut ctx, "main", &["", "  "], false)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn test_single_chunk_auto_commit() {
        let (factory, router, executor) = executor(0).await;
        let mut ctx = router.new_context();
        let result = executor
            .execute(&mut ctx, "main", &["INSERT a", "INSERT b"], false)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.rows, vec![1, 1]);
        let (provider, conn) = only(&factory);
        assert_eq!(conn.commits(), 0);
        assert_eq!(provider.releases(), 1);
    }

    #[tokio::test]
    async fn test_failed_chunk_rolled_back_and_others_kept() {
        let (factory, router, executor) = executor(2).await;
        let mut ctx = router.new_context();
        let statements = ["INSERT 1", "INSERT 2", "INSERT 3", "FAIL 4", "INSERT 5"];
        let result = executor
            .execute(&mut ctx, "main", &statements, true)
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.error_batches, vec![2]);
        assert_eq!(result.rows, vec![1, 1, 1]);
        let (_, conn) = only(&factory);
        assert_eq!(conn.commits(), 2);
        assert_eq!(conn.rollbacks(), 1);
        assert!(conn.auto_commit());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_failed_chunk_without_rollback_keeps_partial_work() {
        let (factory, router, executor) = executor(2).await;
        let mut ctx = router.new_context();
        let result = executor
            .execute(&mut ctx, "main", &["INSERT 1", "FAIL 2", "INSERT 3"], false)
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.error_batches, vec![1]);
        assert_eq!(result.rows, vec![1, 1]);
        let (_, conn) = only(&factory);
        assert_eq!(conn.rollbacks(), 0);
        assert_eq!(conn.commits(), 2);
    }

    #[tokio::test]
    async fn test_failure_inside_transaction_propagates() {
        let (factory, router, executor) = executor(0).await;
        let mut ctx = router.new_context();
        ctx.begin().await.unwrap();

        let err = executor
            .execute(&mut ctx, "main", &["INSERT 1", "FAIL 2"], false)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Database { .. }));
        assert!(ctx.in_transaction());

        let (provider, conn) = only(&factory);
        assert_eq!(provider.releases(), 0);
        assert!(!conn.auto_commit());

        ctx.close().await.unwrap();
        assert_eq!(conn.rollbacks(), 1);
        assert_eq!(provider.releases(), 1);
    }

    #[tokio::test]
    async fn test_batch_joins_transaction() {
        let (factory, router, executor) = executor(1).await;
        let mut ctx = router.new_context();
        ctx.begin().await.unwrap();
        let result = executor
            .execute(&mut ctx, "main", &["INSERT 1", "INSERT 2"], false)
            .await
            .unwrap();
        assert!(result.success);

        let (_, conn) = only(&factory);
        assert_eq!(conn.commits(), 0);
        ctx.commit().await.unwrap();
        ctx.close().await.unwrap();
        assert_eq!(conn.commits(), 1);
    }
}
