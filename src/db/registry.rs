//! DataSource registry.
//!
//! The registry owns three maps: datasource configs keyed by real name, alias
//! links, and lazily created providers. Provider creation is single-flight per
//! real name.
//!
//! # Concurrency Safety
//!
//! - Locks are always taken in the order configs, links, providers
//! - No map lock is held across provider creation, configuration or shutdown
//! - `OnceCell` per real name ensures concurrent first callers build one provider;
//!   a failed build leaves the cell empty for the next caller
//! - `start`/`shutdown` are serialized by a mutex and are idempotent
//! - A creation that finishes after its cell was evicted shuts the new
//!   provider down and starts over, so every live provider stays reachable
//!   from `evict` and `shutdown`

use crate::db::provider::{EngineProviderFactory, ProviderFactory, ProviderRef};
use crate::error::{DbError, DbResult};
use crate::models::{DataSourceConfig, normalize_name};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tracing::{debug, error, info, warn};

/// Datasources and alias links delivered by a [`ConfigSource`].
#[derive(Debug, Clone, Default)]
pub struct SourceSnapshot {
    pub datasources: Vec<DataSourceConfig>,
    /// `(alias, target)` pairs.
    pub links: Vec<(String, String)>,
}

/// Where the registry loads datasources from on `start` and on a lookup miss.
///
/// Records are expected to be merged with defaults already.
#[async_trait]
pub trait ConfigSource: Send + Sync + std::fmt::Debug {
    async fn load(&self) -> DbResult<SourceSnapshot>;
}

/// Fixed, in-memory source.
#[derive(Debug, Clone, Default)]
pub struct StaticConfigSource {
    snapshot: SourceSnapshot,
}

impl StaticConfigSource {
    pub fn new(datasources: Vec<DataSourceConfig>, links: Vec<(String, String)>) -> Self {
        Self {
            snapshot: SourceSnapshot { datasources, links },
        }
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn load(&self) -> DbResult<SourceSnapshot> {
        Ok(self.snapshot.clone())
    }
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    #[serde(default)]
    datasources: Vec<DataSourceConfig>,
    #[serde(default)]
    links: BTreeMap<String, String>,
}

/// JSON file source: `{ "datasources": [...], "links": { "alias": "target" } }`.
#[derive(Debug, Clone)]
pub struct JsonFileConfigSource {
    path: PathBuf,
}

impl JsonFileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigSource for JsonFileConfigSource {
    async fn load(&self) -> DbResult<SourceSnapshot> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            DbError::invalid_config(format!("Cannot read {}: {}", self.path.display(), e))
        })?;
        let file: FileConfig = serde_json::from_str(&raw).map_err(|e| {
            DbError::invalid_config(format!("Invalid JSON in {}: {}", self.path.display(), e))
        })?;
        let datasources = file
            .datasources
            .into_iter()
            .map(DataSourceConfig::normalized)
            .collect::<DbResult<Vec<_>>>()?;
        let links = file
            .links
            .into_iter()
            .map(|(alias, target)| (normalize_name(&alias), normalize_name(&target)))
            .collect();
        debug!(path = %self.path.display(), datasources = datasources.len(), "Loaded datasource file");
        Ok(SourceSnapshot { datasources, links })
    }
}

/// Named datasource registry.
///
/// Many registries may coexist; nothing is global.
pub struct Registry {
    factory: Arc<dyn ProviderFactory>,
    sources: Vec<Arc<dyn ConfigSource>>,
    configs: RwLock<HashMap<String, Arc<DataSourceConfig>>>,
    /// alias -> target; a real datasource maps to itself.
    links: RwLock<HashMap<String, String>>,
    providers: RwLock<HashMap<String, Arc<OnceCell<ProviderRef>>>>,
    started: Mutex<bool>,
    reload: Mutex<()>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new(factory: Arc<dyn ProviderFactory>) -> Self {
        Self {
            factory,
            sources: Vec::new(),
            configs: RwLock::new(HashMap::new()),
            links: RwLock::new(HashMap::new()),
            providers: RwLock::new(HashMap::new()),
            started: Mutex::new(false),
            reload: Mutex::new(()),
        }
    }

    /// Registry building sqlx-backed providers.
    pub fn with_engines() -> Self {
        Self::new(Arc::new(EngineProviderFactory::new()))
    }

    /// Attach a config source. Sources are loaded in the order added.
    pub fn with_source(mut self, source: Arc<dyn ConfigSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Register a datasource and return the real name it is reachable under.
    ///
    /// Re-registering the same name with the same identity is a no-op. A new
    /// name whose identity matches an existing datasource becomes an alias of
    /// it and shares its provider.
    pub async fn register(&self, config: DataSourceConfig) -> DbResult<String> {
        config.validate()?;
        let name = normalize_name(&config.name);
        let identity = config.identity();

        let mut configs = self.configs.write().await;
        let mut links = self.links.write().await;

        if let Some(existing) = configs.get(&name) {
            if existing.identity() == identity {
                debug!(datasource = %name, "Datasource already registered");
                return Ok(name);
            }
            return Err(DbError::duplicate_name(&name, existing.masked_url()));
        }

        if links.contains_key(&name) {
            let real = resolve_in(&links, &name)?;
            return match configs.get(&real) {
                Some(existing) if existing.identity() == identity => Ok(real),
                Some(existing) => Err(DbError::duplicate_name(&name, existing.masked_url())),
                None => Err(DbError::duplicate_name(&name, format!("alias of '{}'", real))),
            };
        }

        if let Some(real) = configs
            .values()
            .find(|existing| existing.identity() == identity)
            .map(|existing| existing.name.clone())
        {
            links.insert(name.clone(), real.clone());
            info!(alias = %name, datasource = %real, "Datasource shares identity, registered as alias");
            return Ok(real);
        }

        info!(
            datasource = %name,
            url = %config.masked_url(),
            engine = %config.engine,
            "Registered datasource"
        );
        links.insert(name.clone(), name.clone());
        configs.insert(name.clone(), Arc::new(DataSourceConfig { name: name.clone(), ..config }));
        Ok(name)
    }

    /// Follow alias links until a name maps to itself.
    pub async fn resolve_alias(&self, name: &str) -> DbResult<String> {
        let links = self.links.read().await;
        resolve_in(&links, &normalize_name(name))
    }

    /// Insert or overwrite an alias edge. The target is not checked here; see
    /// [`validate_links`](Self::validate_links).
    ///
    /// A registered datasource cannot be turned into an alias of another one.
    pub async fn add_link(&self, alias: &str, target: &str) -> DbResult<()> {
        let (alias, target) = (normalize_name(alias), normalize_name(target));
        if alias.is_empty() || target.is_empty() {
            return Err(DbError::invalid_config("Alias and target cannot be empty"));
        }
        let configs = self.configs.read().await;
        let mut links = self.links.write().await;
        if configs.contains_key(&alias) && alias != target {
            return Err(DbError::invalid_config(format!(
                "'{}' is a registered datasource and cannot alias '{}'",
                alias, target
            )));
        }
        match links.insert(alias.clone(), target.clone()) {
            Some(previous) if previous != target => {
                warn!(alias = %alias, previous = %previous, target = %target, "Overwriting alias link");
            }
            _ => debug!(alias = %alias, target = %target, "Added alias link"),
        }
        Ok(())
    }

    /// Check every link resolves to a datasource with a stored config.
    pub async fn validate_links(&self) -> DbResult<()> {
        let configs = self.configs.read().await;
        let links = self.links.read().await;
        let mut aliases: Vec<&String> = links.keys().collect();
        aliases.sort();
        for alias in aliases {
            let target = &links[alias];
            let real = resolve_in(&links, alias).map_err(|e| {
                DbError::invalid_config(format!("Link '{}' -> '{}' is invalid: {}", alias, target, e))
            })?;
            if !configs.contains_key(&real) {
                return Err(DbError::invalid_config(format!(
                    "Link '{}' -> '{}' resolves to '{}', which has no configuration",
                    alias, target, real
                )));
            }
        }
        Ok(())
    }

    /// Return the provider for `name`, creating and configuring it on first use.
    ///
    /// Concurrent first callers for the same real name wait for a single
    /// creation. An unknown name triggers one reload from the config sources.
    pub async fn get_or_create_provider(&self, name: &str) -> DbResult<ProviderRef> {
        loop {
            let real = match self.resolve_alias(name).await {
                Ok(real) => real,
                Err(DbError::NotFound { .. }) if !self.sources.is_empty() => {
                    debug!(datasource = %name, "Datasource unknown, reloading config sources");
                    self.load_sources().await?;
                    self.resolve_alias(name).await?
                }
                Err(e) => return Err(e),
            };
            let config = self
                .configs
                .read()
                .await
                .get(&real)
                .cloned()
                .ok_or_else(|| DbError::not_found(&real))?;

            let cell = self.provider_cell(&real).await;
            let provider = Arc::clone(
                cell.get_or_try_init(|| self.build_provider(&config))
                    .await?,
            );

            let installed = self
                .providers
                .read()
                .await
                .get(&real)
                .is_some_and(|current| Arc::ptr_eq(current, &cell));
            if installed {
                return Ok(provider);
            }
            warn!(datasource = %real, "Provider was evicted while being created, shutting it down");
            if let Err(e) = provider.shutdown().await {
                warn!(datasource = %real, error = %e, "Failed to shut down orphaned provider");
            }
        }
    }

    /// Get or create the `OnceCell` for a real name.
    async fn provider_cell(&self, real: &str) -> Arc<OnceCell<ProviderRef>> {
        let providers = self.providers.read().await;
        if let Some(cell) = providers.get(real) {
            return Arc::clone(cell);
        }
        drop(providers);
        let mut providers = self.providers.write().await;
        // Double-check after acquiring write lock
        if let Some(cell) = providers.get(real) {
            return Arc::clone(cell);
        }
        let cell = Arc::new(OnceCell::new());
        providers.insert(real.to_string(), Arc::clone(&cell));
        cell
    }

    async fn build_provider(&self, config: &DataSourceConfig) -> DbResult<ProviderRef> {
        let engine = config.engine.as_str();
        let provider = self
            .factory
            .create(config)
            .await
            .map_err(|e| DbError::provider_init(&config.name, engine, e))?;
        if let Err(e) = provider.configure(config).await {
            if let Err(shutdown_err) = provider.shutdown().await {
                debug!(datasource = %config.name, error = %shutdown_err, "Failed to shut down unconfigured provider");
            }
            return Err(DbError::provider_init(&config.name, engine, e));
        }
        info!(datasource = %config.name, engine, "Created provider");
        Ok(provider)
    }

    /// Drop the provider of a datasource, and with `complete` its config and aliases.
    ///
    /// - real name: the provider is shut down and forgotten. With `complete`
    ///   the config and every alias resolving to it are removed too.
    /// - alias: with `complete` the alias and every alias pointing at it are
    ///   removed; otherwise nothing happens.
    ///
    /// After a non-complete evict the name still resolves and the next
    /// [`get_or_create_provider`](Self::get_or_create_provider) builds a fresh handle.
    pub async fn evict(&self, name: &str, complete: bool) -> DbResult<()> {
        let name = normalize_name(name);
        let real = self.resolve_alias(&name).await?;

        if real == name {
            let cell = self.providers.write().await.remove(&real);
            match cell.as_ref().and_then(|cell| cell.get()) {
                Some(provider) => {
                    if let Err(e) = provider.shutdown().await {
                        warn!(datasource = %real, error = %e, "Provider shutdown failed during evict");
                    }
                    info!(datasource = %real, complete, "Evicted provider");
                }
                None => warn!(datasource = %real, "No provider to shut down during evict"),
            }
            if complete {
                let mut configs = self.configs.write().await;
                let mut links = self.links.write().await;
                configs.remove(&real);
                for alias in dependents_of(&links, &real) {
                    links.remove(&alias);
                }
                info!(datasource = %real, "Removed datasource configuration");
            }
        } else if complete {
            let mut links = self.links.write().await;
            for alias in dependents_of(&links, &name) {
                links.remove(&alias);
            }
            info!(alias = %name, datasource = %real, "Removed alias");
        } else {
            debug!(alias = %name, "Non-complete evict of an alias is a no-op");
        }
        Ok(())
    }

    /// Load every source, register its configs and add its links.
    ///
    /// A record that fails to register or link is logged and skipped so the
    /// rest stay available. Returns how many records were skipped; only an
    /// unreadable source is an error.
    async fn load_sources(&self) -> DbResult<usize> {
        let _guard = self.reload.lock().await;
        let mut skipped = 0;
        for source in &self.sources {
            let snapshot = source.load().await?;
            for config in snapshot.datasources {
                let name = config.name.clone();
                if let Err(e) = self.register(config).await {
                    error!(datasource = %name, error = %e, "Skipping datasource that failed to register");
                    skipped += 1;
                }
            }
            for (alias, target) in snapshot.links {
                if let Err(e) = self.add_link(&alias, &target).await {
                    error!(alias = %alias, target = %target, error = %e, "Skipping alias link");
                    skipped += 1;
                }
            }
        }
        if skipped > 0 {
            warn!(skipped, "Some datasource records were not loaded");
        }
        Ok(skipped)
    }

    /// Bulk startup: load sources, validate links and build eager providers.
    ///
    /// A provider that fails to build is logged and skipped. Calling `start`
    /// on a started registry does nothing.
    pub async fn start(&self) -> DbResult<()> {
        let mut started = self.started.lock().await;
        if *started {
            debug!("Registry already started");
            return Ok(());
        }

        let skipped = self.load_sources().await?;
        self.validate_links().await?;

        let eager: Vec<String> = {
            let configs = self.configs.read().await;
            let mut names: Vec<String> = configs
                .values()
                .filter(|c| c.load_on_startup)
                .map(|c| c.name.clone())
                .collect();
            names.sort();
            names
        };
        for name in &eager {
            if let Err(e) = self.get_or_create_provider(name).await {
                error!(datasource = %name, error = %e, "Failed to create provider on startup");
            }
        }

        *started = true;
        info!(
            datasources = self.configs.read().await.len(),
            eager = eager.len(),
            skipped,
            "Registry started"
        );
        Ok(())
    }

    /// Shut down every installed provider once and clear all state.
    pub async fn shutdown(&self) -> DbResult<()> {
        let mut started = self.started.lock().await;

        // Drain under lock, shut down outside lock
        let cells: Vec<(String, Arc<OnceCell<ProviderRef>>)> = {
            let mut providers = self.providers.write().await;
            providers.drain().collect()
        };
        for (name, cell) in cells {
            match cell.get() {
                Some(provider) => match provider.shutdown().await {
                    Ok(()) => info!(datasource = %name, "Provider shut down"),
                    Err(e) => warn!(datasource = %name, error = %e, "Provider shutdown failed"),
                },
                None => debug!(datasource = %name, "Skipping provider that was never created"),
            }
        }

        self.configs.write().await.clear();
        self.links.write().await.clear();
        if *started {
            info!("Registry shut down");
        }
        *started = false;
        Ok(())
    }

    pub async fn is_started(&self) -> bool {
        *self.started.lock().await
    }

    /// Config of the datasource `name` resolves to.
    pub async fn config(&self, name: &str) -> Option<Arc<DataSourceConfig>> {
        let real = self.resolve_alias(name).await.ok()?;
        self.configs.read().await.get(&real).cloned()
    }

    /// True when `name` resolves to a configured datasource.
    pub async fn contains(&self, name: &str) -> bool {
        self.config(name).await.is_some()
    }

    /// Sorted real datasource names.
    pub async fn datasource_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Sorted aliases that resolve to `real`, excluding `real` itself.
    pub async fn aliases_of(&self, real: &str) -> Vec<String> {
        let real = normalize_name(real);
        let links = self.links.read().await;
        let mut aliases: Vec<String> = links
            .keys()
            .filter(|alias| **alias != real)
            .filter(|alias| resolve_in(&links, alias).is_ok_and(|r| r == real))
            .cloned()
            .collect();
        aliases.sort();
        aliases
    }

    /// Number of providers that have been built.
    pub async fn provider_count(&self) -> usize {
        let providers = self.providers.read().await;
        providers.values().filter(|cell| cell.get().is_some()).count()
    }

    /// The installed provider for `name`, without creating one.
    pub async fn provider(&self, name: &str) -> Option<ProviderRef> {
        let real = self.resolve_alias(name).await.ok()?;
        let providers = self.providers.read().await;
        providers.get(&real).and_then(|cell| cell.get().cloned())
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("sources", &self.sources)
            .finish_non_exhaustive()
    }
}

/// Walk `links` from `name` until a self-mapped entry.
fn resolve_in(links: &HashMap<String, String>, name: &str) -> DbResult<String> {
    let mut seen = HashSet::new();
    let mut chain = Vec::new();
    let mut current = name.to_string();
    loop {
        chain.push(current.clone());
        if !seen.insert(current.clone()) {
            return Err(DbError::cycle(name, chain));
        }
        match links.get(&current) {
            Some(next) if *next == current => return Ok(current),
            Some(next) => current = next.clone(),
            None => return Err(DbError::not_found(name)),
        }
    }
}

/// `target` plus every alias whose chain passes through it.
fn dependents_of(links: &HashMap<String, String>, target: &str) -> Vec<String> {
    links
        .keys()
        .filter(|alias| {
            let mut seen = HashSet::new();
            let mut current = alias.as_str();
            loop {
                if current == target {
                    return true;
                }
                if !seen.insert(current) {
                    return false;
                }
                match links.get(current) {
                    Some(next) if next != current => current = next,
                    _ => return false,
                }
            }
        })
        .cloned()
        .collect()
}
