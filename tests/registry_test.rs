//! Integration tests for the datasource registry and alias resolution.

mod common;

use common::{MockFactory, datasource};
use datasource_router::db::{ProviderState, Registry, StaticConfigSource};
use datasource_router::error::DbError;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_alias_chain_terminates_or_reports_cycle() {
    let registry = Registry::new(Arc::new(MockFactory::new()));
    registry
        .register(datasource("main", "sqlite:main.db"))
        .await
        .unwrap();
    registry.add_link("replica", "main").await.unwrap();
    registry.add_link("reports", "replica").await.unwrap();
    registry.add_link("Analytics", "REPORTS").await.unwrap();

    assert_eq!(registry.resolve_alias("analytics").await.unwrap(), "main");
    assert_eq!(
        registry.aliases_of("main").await,
        vec!["analytics", "replica", "reports"]
    );

    registry.add_link("x", "y").await.unwrap();
    registry.add_link("y", "x").await.unwrap();
    match registry.resolve_alias("x").await.unwrap_err() {
        DbError::Cycle { chain, .. } => assert_eq!(chain, vec!["x", "y", "x"]),
        other => panic!("expected cycle error, got {other:?}"),
    }

    registry.add_link("ghost", "nowhere").await.unwrap();
    assert!(matches!(
        registry.resolve_alias("ghost").await.unwrap_err(),
        DbError::NotFound { .. }
    ));
}

#[tokio::test]
async fn test_identity_aliasing_returns_same_provider() {
    let factory = Arc::new(MockFactory::new());
    let registry = Registry::new(factory.clone());

    let first = registry
        .register(datasource("orders", "postgres://app:pw@db/shop?sslmode=require"))
        .await
        .unwrap();
    let second = registry
        .register(datasource("billing", "postgres://app:pw@db/shop"))
        .await
        .unwrap();
    assert_eq!(first, "orders");
    assert_eq!(second, "orders");

    let a = registry.get_or_create_provider("orders").await.unwrap();
    let b = registry.get_or_create_provider("billing").await.unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(factory.created().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_build_one_provider() {
    let factory = Arc::new(MockFactory::with_delay(Duration::from_millis(50)));
    let registry = Arc::new(Registry::new(factory.clone()));
    registry
        .register(datasource("main", "sqlite:main.db"))
        .await
        .unwrap();
    registry.add_link("primary", "main").await.unwrap();

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let registry = Arc::clone(&registry);
            let name = if i % 2 == 0 { "main" } else { "primary" };
            tokio::spawn(async move { registry.get_or_create_provider(name).await })
        })
        .collect();

    let mut providers = Vec::new();
    for handle in handles {
        providers.push(handle.await.unwrap().unwrap());
    }
    assert_eq!(factory.created().len(), 1);
    assert!(providers.iter().all(|p| Arc::ptr_eq(p, &providers[0])));
    assert_eq!(registry.provider_count().await, 1);
}

#[tokio::test]
async fn test_evict_non_complete_rebuilds_provider() {
    let factory = Arc::new(MockFactory::new());
    let registry = Registry::new(factory.clone());
    registry
        .register(datasource("main", "sqlite:main.db"))
        .await
        .unwrap();
    registry.add_link("primary", "main").await.unwrap();

    let old = registry.get_or_create_provider("main").await.unwrap();
    registry.evict("main", false).await.unwrap();
    assert_eq!(old.state(), ProviderState::ShutDown);
    assert!(old.acquire().await.is_err());

    assert_eq!(registry.resolve_alias("primary").await.unwrap(), "main");
    let fresh = registry.get_or_create_provider("primary").await.unwrap();
    assert!(!Arc::ptr_eq(&old, &fresh));
    assert_eq!(factory.created().len(), 2);
}

#[tokio::test]
async fn test_evict_complete_removes_datasource_and_aliases() {
    let factory = Arc::new(MockFactory::new());
    let registry = Registry::new(factory.clone());
    registry
        .register(datasource("main", "sqlite:main.db"))
        .await
        .unwrap();
    registry.add_link("primary", "main").await.unwrap();
    registry.add_link("legacy", "primary").await.unwrap();
    registry.get_or_create_provider("main").await.unwrap();

    registry.evict("main", true).await.unwrap();
    assert_eq!(factory.provider("main").shutdowns(), 1);
    for name in ["main", "primary", "legacy"] {
        assert!(matches!(
            registry.resolve_alias(name).await.unwrap_err(),
            DbError::NotFound { .. }
        ));
    }
    assert!(registry.datasource_names().await.is_empty());
}

#[tokio::test]
async fn test_start_and_shutdown_lifecycle() {
    let factory = Arc::new(MockFactory::new());
    factory.fail_for("broken");
    let source = StaticConfigSource::new(
        vec![
            datasource("main", "sqlite:main.db").with_load_on_startup(true),
            datasource("broken", "sqlite:broken.db").with_load_on_startup(true),
            datasource("lazy", "sqlite:lazy.db"),
        ],
        vec![("primary".to_string(), "main".to_string())],
    );
    let registry = Registry::new(factory.clone()).with_source(Arc::new(source));

    registry.start().await.unwrap();
    registry.start().await.unwrap();
    assert!(registry.is_started().await);
    assert_eq!(registry.provider_count().await, 1);
    assert_eq!(registry.resolve_alias("primary").await.unwrap(), "main");

    let err = registry.get_or_create_provider("broken").await.unwrap_err();
    assert!(matches!(err, DbError::ProviderInit { .. }));

    registry.get_or_create_provider("lazy").await.unwrap();
    registry.shutdown().await.unwrap();
    registry.shutdown().await.unwrap();
    assert_eq!(factory.provider("main").shutdowns(), 1);
    assert_eq!(factory.provider("lazy").shutdowns(), 1);
    assert!(!registry.is_started().await);
}
