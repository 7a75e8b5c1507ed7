//! End-to-end tests against a real PostgreSQL instance.
//!
//! Set `STRATUM_TEST_DATABASE_URL` to run these; without it every test
//! skips. Schema bootstrap is serialized across parallel tests through an
//! advisory lock so concurrent DDL cannot race.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use stratum::component::{FieldDescriptor, FieldKind, IndexKind, IndexSpec};
use stratum::config::{LockConfig, SchedulerConfig};
use stratum::entity::store::EntityStore;
use stratum::hooks::{ComponentTarget, EventKind, HookDispatcher, HookOptions};
use stratum::lock::DistributedLock;
use stratum::query::filter::Filter;
use stratum::query::sql::SortDirection;
use stratum::registry::Registry;
use stratum::scheduler::{
    EntitySelection, Interval, Scheduler, SchedulerEvent, TaskDefinition, TaskOptions,
};
use stratum::schema::SchemaManager;
use stratum::{Component, ComponentDescriptor};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Tag {
    value: String,
}

impl Component for Tag {
    const NAME: &'static str = "Tag";

    fn descriptor() -> ComponentDescriptor {
        ComponentDescriptor::new(Self::NAME)
            .field(FieldDescriptor::new("value", FieldKind::String).indexed())
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Score {
    value: f64,
}

impl Component for Score {
    const NAME: &'static str = "Score";

    fn descriptor() -> ComponentDescriptor {
        ComponentDescriptor::new(Self::NAME)
            .field(FieldDescriptor::new("value", FieldKind::Real).indexed())
            .index(IndexSpec::single("value", IndexKind::Numeric))
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct User {
    name: String,
}

impl Component for User {
    const NAME: &'static str = "User";

    fn descriptor() -> ComponentDescriptor {
        ComponentDescriptor::new(Self::NAME)
            .field(FieldDescriptor::new("name", FieldKind::String).indexed())
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Other {
    flag: bool,
}

impl Component for Other {
    const NAME: &'static str = "Other";

    fn descriptor() -> ComponentDescriptor {
        ComponentDescriptor::new(Self::NAME)
            .field(FieldDescriptor::new("flag", FieldKind::Boolean))
    }
}

struct Ctx {
    pool: PgPool,
    registry: Arc<Registry>,
    hooks: Arc<HookDispatcher>,
    store: EntityStore,
}

const SETUP_LOCK_KEY: i64 = 0x5354_5241;

async fn setup() -> Option<Ctx> {
    let Ok(url) = std::env::var("STRATUM_TEST_DATABASE_URL") else {
        eprintln!("skipping: STRATUM_TEST_DATABASE_URL not set");
        return None;
    };
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(8)
        .connect(&url)
        .await
        .expect("test database unreachable");

    // Serialize bootstrap DDL across parallel test binaries.
    let mut guard = pool.acquire().await.unwrap();
    sqlx::query("SELECT pg_advisory_lock($1)")
        .bind(SETUP_LOCK_KEY)
        .execute(guard.as_mut())
        .await
        .unwrap();

    let schema = SchemaManager::new(pool.clone());
    schema.ensure_base_schema().await.unwrap();

    let registry = Arc::new(Registry::new());
    for descriptor in [
        Tag::descriptor(),
        Score::descriptor(),
        User::descriptor(),
        Other::descriptor(),
    ] {
        let type_id = registry.register_component(descriptor.clone()).unwrap();
        let registered = registry.component_by_type_id(&type_id).unwrap();
        schema.provision_component(&registered).await.unwrap();
    }

    sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
        .bind(SETUP_LOCK_KEY)
        .fetch_one(guard.as_mut())
        .await
        .unwrap();
    drop(guard);

    let hooks = Arc::new(HookDispatcher::new(registry.clone()));
    let store = EntityStore::new(pool.clone(), registry.clone(), hooks.clone());
    Some(Ctx {
        pool,
        registry,
        hooks,
        store,
    })
}

fn unique(label: &str) -> String {
    format!("{}-{}", label, Uuid::now_v7())
}

#[tokio::test]
async fn create_query_soft_delete() {
    let Some(ctx) = setup().await else { return };
    let marker = unique("alpha");

    let mut entity = ctx.store.create();
    entity.add(&Tag { value: marker.clone() }).unwrap();
    ctx.store.save(&mut entity).await.unwrap();

    let found = ctx
        .store
        .query()
        .with_filters::<Tag>(vec![Filter::eq("value", serde_json::json!(marker.clone()))])
        .exec()
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id(), entity.id());

    ctx.store.delete(&mut entity, false).await.unwrap();

    let after = ctx
        .store
        .query()
        .with_filters::<Tag>(vec![Filter::eq("value", serde_json::json!(marker))])
        .exec()
        .await
        .unwrap();
    assert!(after.is_empty());

    let deleted_at: Option<chrono::DateTime<chrono::Utc>> =
        sqlx::query_scalar("SELECT deleted_at FROM entities WHERE id = $1")
            .bind(entity.id())
            .fetch_one(&ctx.pool)
            .await
            .unwrap();
    assert!(deleted_at.is_some());
}

#[tokio::test]
async fn mirror_rows_track_component_rows() {
    let Some(ctx) = setup().await else { return };

    let mut entity = ctx.store.create();
    entity.add(&Tag { value: unique("mirror") }).unwrap();
    ctx.store.save(&mut entity).await.unwrap();

    let mirror: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM entity_components \
         WHERE entity_id = $1 AND type_id = $2 AND deleted_at IS NULL",
    )
    .bind(entity.id())
    .bind(Tag::type_id().as_str())
    .fetch_one(&ctx.pool)
    .await
    .unwrap();
    assert_eq!(mirror, 1);

    entity.remove::<Tag>();
    ctx.store.save(&mut entity).await.unwrap();

    let (components, mirrors): (i64, i64) = (
        sqlx::query_scalar("SELECT COUNT(*) FROM components WHERE entity_id = $1")
            .bind(entity.id())
            .fetch_one(&ctx.pool)
            .await
            .unwrap(),
        sqlx::query_scalar("SELECT COUNT(*) FROM entity_components WHERE entity_id = $1")
            .bind(entity.id())
            .fetch_one(&ctx.pool)
            .await
            .unwrap(),
    );
    assert_eq!(components, 0);
    assert_eq!(mirrors, 0);
}

#[tokio::test]
async fn set_patches_and_get_hydrates() {
    let Some(ctx) = setup().await else { return };

    let mut entity = ctx.store.create();
    entity.add(&User { name: "ada".into() }).unwrap();
    ctx.store.save(&mut entity).await.unwrap();

    entity.set(&User { name: "lovelace".into() }).unwrap();
    ctx.store.save(&mut entity).await.unwrap();

    let mut reloaded = ctx.store.find_by_id(entity.id()).await.unwrap().unwrap();
    let user: User = reloaded.get().unwrap().unwrap();
    assert_eq!(user.name, "lovelace");

    // Single-row fetch path with caching on the entity.
    let mut bare = ctx
        .store
        .query()
        .with::<User>()
        .find_by_id(entity.id())
        .exec()
        .await
        .unwrap()
        .remove(0);
    assert!(bare.get_component("User").is_none());
    let data = ctx.store.component(&mut bare, "User").await.unwrap();
    assert_eq!(data.unwrap()["name"], serde_json::json!("lovelace"));
    assert!(bare.get_component("User").is_some());
}

#[tokio::test]
async fn exclusion_and_count() {
    let Some(ctx) = setup().await else { return };
    let marker = unique("excl");

    for with_other in [false, false, true] {
        let mut entity = ctx.store.create();
        entity.add(&Tag { value: marker.clone() }).unwrap();
        if with_other {
            entity.add(&Other { flag: true }).unwrap();
        }
        ctx.store.save(&mut entity).await.unwrap();
    }

    let all = ctx
        .store
        .query()
        .with_filters::<Tag>(vec![Filter::eq("value", serde_json::json!(marker.clone()))])
        .exec()
        .await
        .unwrap();
    assert_eq!(all.len(), 3);

    let without_other = ctx
        .store
        .query()
        .with_filters::<Tag>(vec![Filter::eq("value", serde_json::json!(marker.clone()))])
        .without::<Other>()
        .exec()
        .await
        .unwrap();
    assert_eq!(without_other.len(), 2);

    let count = ctx
        .store
        .query()
        .with_filters::<Tag>(vec![Filter::eq("value", serde_json::json!(marker.clone()))])
        .with::<Other>()
        .count()
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn numeric_between_filter() {
    let Some(ctx) = setup().await else { return };
    let marker = unique("score");

    for i in 0..20 {
        let mut entity = ctx.store.create();
        entity.add(&Tag { value: marker.clone() }).unwrap();
        entity.add(&Score { value: i as f64 }).unwrap();
        ctx.store.save(&mut entity).await.unwrap();
    }

    let count = ctx
        .store
        .query()
        .with_filters::<Tag>(vec![Filter::eq("value", serde_json::json!(marker))])
        .with_filters::<Score>(vec![Filter::between(
            "value",
            serde_json::json!(5),
            serde_json::json!(9),
        )])
        .count()
        .await
        .unwrap();
    assert_eq!(count, 5);
}

#[tokio::test]
async fn cursor_pagination_is_stable_under_insertion() {
    let Some(ctx) = setup().await else { return };
    let marker = unique("page");

    let save_user = |name: String| {
        let store = ctx.store.clone();
        let marker = marker.clone();
        async move {
            let mut entity = store.create();
            entity.add(&Tag { value: marker }).unwrap();
            entity.add(&User { name }).unwrap();
            store.save(&mut entity).await.unwrap();
            entity
        }
    };

    for i in 0..30 {
        save_user(format!("m-{:03}", i)).await;
    }

    let page = |cursor: Option<Uuid>| {
        let store = ctx.store.clone();
        let marker = marker.clone();
        async move {
            let mut query = store
                .query()
                .with_filters::<Tag>(vec![Filter::eq("value", serde_json::json!(marker))])
                .with::<User>()
                .sort_by::<User>("name", SortDirection::Asc)
                .take(10)
                .populate();
            if let Some(cursor) = cursor {
                query = query.cursor(cursor);
            }
            query.exec().await.unwrap()
        }
    };

    let page1 = page(None).await;
    assert_eq!(page1.len(), 10);
    let last_id = page1.last().unwrap().id();
    let last_name = page1
        .last()
        .unwrap()
        .get_component("User")
        .unwrap()["name"]
        .as_str()
        .unwrap()
        .to_string();

    // New rows sorting before the cursor must not leak into later pages.
    for i in 0..5 {
        save_user(format!("a-{:03}", i)).await;
    }

    let page2 = page(Some(last_id)).await;
    assert_eq!(page2.len(), 10);
    let page1_ids: Vec<Uuid> = page1.iter().map(|e| e.id()).collect();
    for entity in &page2 {
        let name = entity.get_component("User").unwrap()["name"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(name > last_name, "{} should sort after {}", name, last_name);
        assert!(!page1_ids.contains(&entity.id()));
    }

    // Concatenated pages equal the unpaginated query over the same filter.
    let mut collected: Vec<Uuid> = Vec::new();
    let mut cursor = None;
    loop {
        let batch = page(cursor).await;
        if batch.is_empty() {
            break;
        }
        cursor = Some(batch.last().unwrap().id());
        collected.extend(batch.iter().map(|e| e.id()));
    }
    let full = ctx
        .store
        .query()
        .with_filters::<Tag>(vec![Filter::eq("value", serde_json::json!(marker.clone()))])
        .with::<User>()
        .sort_by::<User>("name", SortDirection::Asc)
        .exec()
        .await
        .unwrap();
    assert_eq!(collected.len(), full.len());
    let full_ids: Vec<Uuid> = full.iter().map(|e| e.id()).collect();
    assert_eq!(collected, full_ids);
}

#[tokio::test]
async fn hooks_fire_after_save_with_targeting() {
    let Some(ctx) = setup().await else { return };
    let ran = Arc::new(parking_lot::Mutex::new(Vec::<&'static str>::new()));

    for (label, priority, target) in [
        ("tag-hook", 10, Tag::type_id()),
        ("other-hook", 1, Other::type_id()),
    ] {
        let ran = ran.clone();
        ctx.hooks.register(
            EventKind::EntityCreated,
            HookOptions::default()
                .priority(priority)
                .named(label)
                .target(ComponentTarget::new().include(target)),
            move |_event| {
                let ran = ran.clone();
                async move {
                    ran.lock().push(label);
                    Ok(())
                }
            },
        );
    }

    let mut tagged = ctx.store.create();
    tagged.add(&Tag { value: unique("hook") }).unwrap();
    ctx.store.save(&mut tagged).await.unwrap();
    assert_eq!(*ran.lock(), vec!["tag-hook"]);

    ran.lock().clear();
    let mut both = ctx.store.create();
    both.add(&Tag { value: unique("hook") }).unwrap();
    both.add(&Other { flag: false }).unwrap();
    ctx.store.save(&mut both).await.unwrap();
    assert_eq!(*ran.lock(), vec!["tag-hook", "other-hook"]);
}

#[tokio::test]
async fn advisory_lock_excludes_across_sessions() {
    let Some(ctx) = setup().await else { return };
    let task_id = unique("lock-task");

    let config = LockConfig::default();
    let lock_a = DistributedLock::new(ctx.pool.clone(), config.clone());
    let lock_b = DistributedLock::new(ctx.pool.clone(), config);

    assert!(lock_a.try_acquire(&task_id).await.unwrap());
    assert!(!lock_b.try_acquire(&task_id).await.unwrap());

    assert!(lock_a.release(&task_id).await.unwrap());
    assert!(lock_b.try_acquire(&task_id).await.unwrap());
    lock_b.release_all().await.unwrap();
}

#[tokio::test]
async fn scheduler_runs_task_under_lock() {
    let Some(ctx) = setup().await else { return };
    let marker = unique("sched");

    let mut entity = ctx.store.create();
    entity.add(&Tag { value: marker.clone() }).unwrap();
    ctx.store.save(&mut entity).await.unwrap();

    let lock = Arc::new(DistributedLock::new(ctx.pool.clone(), LockConfig::default()));
    let scheduler = Arc::new(Scheduler::new(
        ctx.store.clone(),
        lock,
        SchedulerConfig {
            enable_logging: false,
            ..Default::default()
        },
    ));

    let processed = Arc::new(parking_lot::Mutex::new(0usize));
    let task_id = unique("count-tags");
    {
        let processed = processed.clone();
        let marker = marker.clone();
        scheduler
            .register(
                TaskDefinition::new(
                    task_id.clone(),
                    "count tagged entities",
                    Interval::Minute,
                    EntitySelection::Query(Arc::new(move |store: &EntityStore| {
                        store.query().with_filters::<Tag>(vec![Filter::eq(
                            "value",
                            serde_json::json!(marker.clone()),
                        )])
                    })),
                    move |entities| {
                        let processed = processed.clone();
                        async move {
                            *processed.lock() += entities.len();
                            Ok(())
                        }
                    },
                )
                .with_options(TaskOptions {
                    timeout: Some(Duration::from_secs(10)),
                    ..Default::default()
                }),
            )
            .unwrap();
    }

    let mut events = scheduler.subscribe();
    scheduler.trigger_now(&task_id).await.unwrap();
    assert_eq!(*processed.lock(), 1);
    match events.try_recv() {
        Ok(SchedulerEvent::TaskExecuted { entity_count, .. }) => assert_eq!(entity_count, 1),
        other => panic!("expected an executed event, got {:?}", other),
    }
    assert_eq!(scheduler.metrics().completed, 1);
    assert_eq!(scheduler.metrics().lock_acquired, 1);
}

#[tokio::test]
async fn unregistered_component_writes_are_rejected() {
    let Some(ctx) = setup().await else { return };

    let mut entity = ctx.store.create();
    entity
        .add_component("NeverRegistered", serde_json::json!({"x": 1}))
        .unwrap();
    let err = ctx.store.save(&mut entity).await.unwrap_err();
    assert!(matches!(err, stratum::StratumError::UnknownComponent(_)));
    assert!(entity.is_dirty());
}

#[tokio::test]
async fn hard_delete_removes_rows() {
    let Some(ctx) = setup().await else { return };

    let mut entity = ctx.store.create();
    entity.add(&Tag { value: unique("hard") }).unwrap();
    ctx.store.save(&mut entity).await.unwrap();
    let id = entity.id();

    ctx.store.delete(&mut entity, true).await.unwrap();

    let remaining: i64 = sqlx::query_scalar(
        "SELECT (SELECT COUNT(*) FROM entities WHERE id = $1) \
             + (SELECT COUNT(*) FROM components WHERE entity_id = $1) \
             + (SELECT COUNT(*) FROM entity_components WHERE entity_id = $1)",
    )
    .bind(id)
    .fetch_one(&ctx.pool)
    .await
    .unwrap();
    assert_eq!(remaining, 0);
}
