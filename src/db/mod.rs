//! Database access layer.
//!
//! This module provides datasource routing functionality:
//! - Connection and provider abstractions over sqlx engines
//! - Named datasource registry with alias links
//! - Connection routing by transaction mode
//! - Nested single- and multi-datasource transaction coordination
//! - Chunked batch execution

pub mod batch;
pub mod connection;
pub mod engines;
pub mod global;
pub mod provider;
pub mod registry;
pub mod router;
pub mod transaction;

#[cfg(test)]
#[path = "../../tests/common/mod.rs"]
pub(crate) mod test_support;

pub use batch::{BatchExecutor, BatchUpdateResult};
pub use connection::{Connection, ConnectionRef, Xid};
pub use engines::{DirectProvider, SqlxConnection, SqlxPoolProvider};
pub use global::{BranchState, GlobalStatus, GlobalTransaction, GlobalTransactionManager};
pub use provider::{
    EngineProviderFactory, ProviderFactory, ProviderHandle, ProviderRef, ProviderState,
    acquire_with_retry,
};
pub use registry::{
    ConfigSource, JsonFileConfigSource, Registry, SourceSnapshot, StaticConfigSource,
};
pub use router::{Lease, Router};
pub use transaction::{
    ForeignDataSourcePolicy, MultiCoordinator, SingleCoordinator, TransactionContext,
    TransactionMode,
};
