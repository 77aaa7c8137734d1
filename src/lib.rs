//! Datasource Router Library
//!
//! This library keeps a registry of named SQL datasources (SQLite, PostgreSQL,
//! MySQL), routes connection requests through alias links, and coordinates
//! nested transactions on one or several datasources.

// Lets the shared test mocks name this crate the way integration tests do.
#[cfg(test)]
extern crate self as datasource_router;

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::Config;
pub use db::{BatchExecutor, Registry, Router, TransactionContext};
pub use error::{DbError, DbResult};
