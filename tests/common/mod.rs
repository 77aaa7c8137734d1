//! In-memory providers and connections shared by the unit and integration
//! tests.
//!
//! The crate's own test modules include this file as `db::test_support`, so
//! every path goes through the `datasource_router` crate name.

#![allow(dead_code)]

use async_trait::async_trait;
use datasource_router::config::RetryPolicy;
use datasource_router::db::provider::ProviderStateCell;
use datasource_router::db::{
    Connection, ConnectionRef, ProviderFactory, ProviderHandle, ProviderRef, ProviderState,
    Registry, Router, Xid,
};
use datasource_router::error::{DbError, DbResult};
use datasource_router::models::{DataSourceConfig, ProviderEngine};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct MockConnection {
    datasource: String,
    closed: AtomicBool,
    auto_commit: AtomicBool,
    executes: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    prepares: AtomicUsize,
    fail_commit: AtomicBool,
    fail_rollback: AtomicBool,
    fail_prepare: AtomicBool,
    executed: Mutex<Vec<String>>,
}

impl MockConnection {
    pub fn new(datasource: &str) -> Self {
        Self {
            datasource: datasource.to_string(),
            auto_commit: AtomicBool::new(true),
            ..Default::default()
        }
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    pub fn prepares(&self) -> usize {
        self.prepares.load(Ordering::SeqCst)
    }

    pub fn executes(&self) -> usize {
        self.executes.load(Ordering::SeqCst)
    }

    pub fn auto_commit(&self) -> bool {
        self.auto_commit.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn fail_commit(&self) {
        self.fail_commit.store(true, Ordering::SeqCst);
    }

    pub fn fail_rollback(&self) {
        self.fail_rollback.store(true, Ordering::SeqCst);
    }

    pub fn fail_prepare(&self) {
        self.fail_prepare.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn datasource(&self) -> &str {
        &self.datasource
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn set_auto_commit(&self, auto_commit: bool) -> DbResult<()> {
        self.auto_commit.store(auto_commit, Ordering::SeqCst);
        Ok(())
    }

    /// Statements containing `FAIL` error out.
    async fn execute(&self, sql: &str) -> DbResult<u64> {
        if self.is_closed() {
            return Err(DbError::connection("closed", "reconnect"));
        }
        self.executes.fetch_add(1, Ordering::SeqCst);
        self.executed.lock().unwrap().push(sql.to_string());
        if sql.contains("FAIL") {
            return Err(DbError::database("statement failed", None, "fix it"));
        }
        Ok(1)
    }

    async fn commit(&self) -> DbResult<()> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(DbError::database("commit failed", None, "retry"));
        }
        Ok(())
    }

    async fn rollback(&self) -> DbResult<()> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        if self.fail_rollback.load(Ordering::SeqCst) {
            return Err(DbError::connection("rollback failed", "reconnect"));
        }
        Ok(())
    }

    async fn close(&self) -> DbResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn xa_prepare(&self, _xid: &Xid) -> DbResult<()> {
        self.prepares.fetch_add(1, Ordering::SeqCst);
        if self.fail_prepare.load(Ordering::SeqCst) {
            return Err(DbError::database("prepare failed", None, "retry"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub enum FailMode {
    Transient,
    Permanent,
}

#[derive(Debug)]
pub struct MockProvider {
    name: String,
    state: ProviderStateCell,
    acquire_calls: AtomicUsize,
    releases: AtomicUsize,
    shutdowns: AtomicUsize,
    fail_remaining: AtomicU32,
    fail_mode: Mutex<Option<FailMode>>,
    /// Prepare fails on every connection handed out from now on.
    fail_prepare: AtomicBool,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockProvider {
    pub fn new(name: &str) -> Self {
        let state = ProviderStateCell::new();
        state.set(ProviderState::Configured);
        Self {
            name: name.to_string(),
            state,
            acquire_calls: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
            fail_remaining: AtomicU32::new(0),
            fail_mode: Mutex::new(None),
            fail_prepare: AtomicBool::new(false),
            connections: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_next_acquires(&self, count: u32, mode: FailMode) {
        self.fail_remaining.store(count, Ordering::SeqCst);
        *self.fail_mode.lock().unwrap() = Some(mode);
    }

    pub fn fail_prepare(&self) {
        self.fail_prepare.store(true, Ordering::SeqCst);
    }

    pub fn acquire_calls(&self) -> usize {
        self.acquire_calls.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.connections.lock().unwrap().clone()
    }

    pub fn last_connection(&self) -> Arc<MockConnection> {
        self.connections().last().cloned().expect("no connection handed out")
    }
}

#[async_trait]
impl ProviderHandle for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn engine(&self) -> ProviderEngine {
        ProviderEngine::Direct
    }

    fn state(&self) -> ProviderState {
        self.state.get()
    }

    async fn configure(&self, _config: &DataSourceConfig) -> DbResult<()> {
        Ok(())
    }

    async fn acquire(&self) -> DbResult<ConnectionRef> {
        self.acquire_calls.fetch_add(1, Ordering::SeqCst);
        self.state.ensure_usable(&self.name)?;
        let remaining = self.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(match *self.fail_mode.lock().unwrap() {
                Some(FailMode::Permanent) => DbError::database("access denied", None, "check grants"),
                _ => DbError::timeout("connection pool acquire", 1),
            });
        }
        self.state
            .transition(ProviderState::Configured, ProviderState::Active);
        let conn = Arc::new(MockConnection::new(&self.name));
        if self.fail_prepare.load(Ordering::SeqCst) {
            conn.fail_prepare();
        }
        self.connections.lock().unwrap().push(conn.clone());
        Ok(conn)
    }

    async fn release(&self, conn: ConnectionRef) -> DbResult<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        conn.close().await
    }

    async fn shutdown(&self) -> DbResult<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.state.shut_down();
        Ok(())
    }
}

/// Factory that records every provider it builds.
#[derive(Debug, Default)]
pub struct MockFactory {
    created: Mutex<Vec<Arc<MockProvider>>>,
    failing: Mutex<HashSet<String>>,
    delay: Option<Duration>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slow down creation so concurrent callers overlap.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn fail_for(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    pub fn heal(&self, name: &str) {
        self.failing.lock().unwrap().remove(name);
    }

    pub fn created(&self) -> Vec<Arc<MockProvider>> {
        self.created.lock().unwrap().clone()
    }

    pub fn created_for(&self, name: &str) -> Vec<Arc<MockProvider>> {
        self.created()
            .into_iter()
            .filter(|p| p.name() == name)
            .collect()
    }

    /// Most recently built provider for `name`.
    pub fn provider(&self, name: &str) -> Arc<MockProvider> {
        self.created_for(name)
            .pop()
            .expect("provider was never created")
    }
}

#[async_trait]
impl ProviderFactory for MockFactory {
    async fn create(&self, config: &DataSourceConfig) -> DbResult<ProviderRef> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().contains(&config.name) {
            return Err(DbError::connection("connection refused", "start the server"));
        }
        let provider = Arc::new(MockProvider::new(&config.name));
        self.created.lock().unwrap().push(provider.clone());
        Ok(provider)
    }
}

/// Datasource record with a fast retry policy.
pub fn datasource(name: &str, url: &str) -> DataSourceConfig {
    DataSourceConfig::new(name, url)
        .unwrap()
        .with_retry(RetryPolicy {
            attempts: Some(2),
            delay_ms: Some(1),
        })
}

/// Router over a registry holding one `sqlite:<name>.db` datasource per name.
pub async fn router(names: &[&str]) -> (Arc<MockFactory>, Router) {
    let factory = Arc::new(MockFactory::new());
    let registry = Arc::new(Registry::new(factory.clone()));
    for name in names {
        registry
            .register(datasource(name, &format!("sqlite:{}.db", name)))
            .await
            .unwrap();
    }
    (factory, Router::new(registry))
}
