//! Persistent entity-component-system runtime on PostgreSQL.
//!
//! Entities are opaque ids carrying dynamic sets of typed components stored
//! in per-type partitions. The runtime layers a compositional query engine,
//! archetypes, lifecycle hooks, a distributed scheduler, and an adaptive
//! cache on top of that storage model.

pub mod archetype;
pub mod cache;
pub mod component;
pub mod config;
pub mod entity;
pub mod error;
pub mod hooks;
pub mod lifecycle;
pub mod lock;
pub mod query;
pub mod registry;
pub mod scheduler;
pub mod schema;

pub use component::{Component, ComponentDescriptor, FieldDescriptor, FieldKind, IndexKind, IndexSpec, TypeId};
pub use entity::store::EntityStore;
pub use entity::Entity;
pub use error::{Result, StratumError};
pub use query::Query;

use cache::adaptive::AdaptiveTtlCache;
use cache::memory::MemoryCache;
use cache::redis::RedisCache;
use cache::{CacheProvider, NoopCache};
use config::RuntimeConfig;
use hooks::HookDispatcher;
use lifecycle::{Lifecycle, Phase};
use lock::DistributedLock;
use registry::Registry;
use scheduler::Scheduler;
use schema::SchemaManager;
use std::sync::Arc;
use std::time::Duration;

/// The assembled runtime: owns the pool and every subsystem.
///
/// Boot sequence: open the database and ensure base tables (`DbReady`),
/// register all declared components so partitions and indexes exist
/// (`ComponentsReady`), then start the scheduler (`AppReady`).
pub struct Runtime {
    config: RuntimeConfig,
    pool: sqlx::PgPool,
    lifecycle: Arc<Lifecycle>,
    registry: Arc<Registry>,
    schema: Arc<SchemaManager>,
    hooks: Arc<HookDispatcher>,
    store: EntityStore,
    lock: Arc<DistributedLock>,
    scheduler: Arc<Scheduler>,
    cache: Arc<dyn CacheProvider>,
}

impl Runtime {
    /// Connects, bootstraps the base schema, and signals `DbReady`.
    pub async fn open(config: RuntimeConfig) -> Result<Self> {
        let pool = config.connect().await?;
        let lifecycle = Arc::new(Lifecycle::new());
        let registry = Arc::new(Registry::new());
        let schema = Arc::new(SchemaManager::new(pool.clone()));
        schema.ensure_base_schema().await?;
        lifecycle.advance(Phase::DbReady)?;

        let hooks = Arc::new(HookDispatcher::new(registry.clone()));
        let store = EntityStore::new(pool.clone(), registry.clone(), hooks.clone());
        let lock = Arc::new(DistributedLock::new(pool.clone(), config.lock.clone()));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            lock.clone(),
            config.scheduler.clone(),
        ));
        let cache = build_cache(&config).await?;

        Ok(Self {
            config,
            pool,
            lifecycle,
            registry,
            schema,
            hooks,
            store,
            lock,
            scheduler,
            cache,
        })
    }

    /// Registers a component class and provisions its partition and indexes.
    pub async fn register_component<C: Component>(&self) -> Result<TypeId> {
        self.register_descriptor(C::descriptor()).await
    }

    pub async fn register_descriptor(&self, descriptor: ComponentDescriptor) -> Result<TypeId> {
        self.lifecycle.require(Phase::DbReady)?;
        let type_id = self.registry.register_component(descriptor)?;
        let registered = self
            .registry
            .component_by_type_id(&type_id)
            .ok_or_else(|| StratumError::UnknownComponent(type_id.to_string()))?;
        self.schema.provision_component(&registered).await?;
        Ok(type_id)
    }

    /// Seals registration and signals `ComponentsReady`. Hooks and scheduler
    /// tasks may register from here on.
    pub fn finish_registration(&self) -> Result<()> {
        self.lifecycle.advance(Phase::ComponentsReady)
    }

    /// Starts the scheduler and signals `AppReady`.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.lifecycle.require(Phase::ComponentsReady)?;
        self.scheduler.start();
        self.lifecycle.advance(Phase::AppReady)
    }

    /// Stops the scheduler, releases advisory locks, and closes the pool.
    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        if let Err(err) = self.lock.release_all().await {
            log::warn!("shutdown: releasing locks failed: {}", err);
        }
        self.pool.close().await;
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn schema(&self) -> &Arc<SchemaManager> {
        &self.schema
    }

    pub fn hooks(&self) -> &Arc<HookDispatcher> {
        &self.hooks
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn lock(&self) -> &Arc<DistributedLock> {
        &self.lock
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn cache(&self) -> &Arc<dyn CacheProvider> {
        &self.cache
    }
}

async fn build_cache(config: &RuntimeConfig) -> Result<Arc<dyn CacheProvider>> {
    if !config.cache.enabled {
        return Ok(Arc::new(NoopCache));
    }
    let base: Arc<dyn CacheProvider> = match config.cache.provider.as_str() {
        "memory" => {
            let cache = Arc::new(MemoryCache::new(
                config.cache.max_entries,
                config.cache.max_memory_bytes,
            ));
            cache.start_sweeper(Duration::from_secs(30));
            cache
        }
        "redis" => Arc::new(RedisCache::connect(&config.cache.redis_url, "stratum:invalidate").await?),
        "noop" => Arc::new(NoopCache),
        other => {
            return Err(StratumError::Config(format!(
                "unknown cache provider '{}'",
                other
            )))
        }
    };
    match config.cache.strategy.as_str() {
        "adaptive" => Ok(Arc::new(AdaptiveTtlCache::new(base, config.default_ttl()))),
        "fixed" => Ok(base),
        other => Err(StratumError::Config(format!(
            "unknown cache strategy '{}'",
            other
        ))),
    }
}
