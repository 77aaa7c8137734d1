//! Data models for the datasource router.
//!
//! This module re-exports all model types used throughout the library.

pub mod datasource;

// Re-export commonly used types
pub use datasource::{
    ConnectionIdentity, DataSourceConfig, DatabaseType, ProviderEngine, normalize_name,
};
