//! Durable persistence for entities and their components.
//!
//! A save drains the entity's buffered changes in one transaction: the
//! entity row is inserted if absent, tombstoned components are deleted from
//! their partition and the presence mirror, dirty components are upserted
//! into both. Hooks fire only after the commit.

use crate::component::TypeId;
use crate::entity::{Entity, PendingEvent};
use crate::error::{Result, StratumError};
use crate::hooks::{EventKind, HookDispatcher, HookEvent};
use crate::query::Query;
use crate::registry::Registry;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const DEFAULT_SAVE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(sqlx::FromRow)]
struct EntityRow {
    id: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct ComponentRow {
    component_id: Uuid,
    entity_id: Uuid,
    type_id: String,
    name: String,
    data: Value,
}

/// Persists entities and hydrates them back.
#[derive(Clone)]
pub struct EntityStore {
    pool: PgPool,
    registry: Arc<Registry>,
    hooks: Arc<HookDispatcher>,
    save_timeout: Duration,
}

impl EntityStore {
    pub fn new(pool: PgPool, registry: Arc<Registry>, hooks: Arc<HookDispatcher>) -> Self {
        Self {
            pool,
            registry,
            hooks,
            save_timeout: DEFAULT_SAVE_TIMEOUT,
        }
    }

    pub fn with_save_timeout(mut self, timeout: Duration) -> Self {
        self.save_timeout = timeout;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn hooks(&self) -> &Arc<HookDispatcher> {
        &self.hooks
    }

    /// Creates a new in-memory entity (unpersisted, dirty).
    pub fn create(&self) -> Entity {
        Entity::new()
    }

    /// Starts a declarative query against this store.
    pub fn query(&self) -> Query {
        Query::new(self.clone())
    }

    /// Atomically persists every buffered change of the entity, then emits
    /// hook events. A failure rolls the transaction back and leaves the
    /// entity dirty; exceeding the wall-clock budget fails with
    /// [`StratumError::SaveTimeout`].
    pub async fn save(&self, entity: &mut Entity) -> Result<()> {
        for slot in entity.dirty_slots().chain(entity.tombstones()) {
            if !self.registry.is_registered(&slot.type_id) {
                return Err(StratumError::UnknownComponent(slot.name.clone()));
            }
        }
        let was_new = !entity.is_persisted();
        let changed = entity.changed_type_ids();

        match tokio::time::timeout(self.save_timeout, self.save_tx(entity)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(StratumError::SaveTimeout(
                    self.save_timeout.as_millis() as u64
                ))
            }
        }

        let id = entity.id();
        let pending = entity.mark_saved(Utc::now());
        let composition = entity.composition();

        let mut events = Vec::with_capacity(pending.len() + 1);
        if was_new {
            events.push(HookEvent::new(EventKind::EntityCreated, id, composition.clone()));
        } else {
            events.push(
                HookEvent::new(EventKind::EntityUpdated, id, composition.clone())
                    .with_changed(changed),
            );
        }
        for pe in pending {
            events.push(match pe {
                PendingEvent::Added { type_id, data } => {
                    HookEvent::new(EventKind::ComponentAdded, id, composition.clone())
                        .with_component(type_id)
                        .with_data(None, Some(data))
                }
                PendingEvent::Updated { type_id, old, new } => {
                    HookEvent::new(EventKind::ComponentUpdated, id, composition.clone())
                        .with_component(type_id)
                        .with_data(Some(old), Some(new))
                }
                PendingEvent::Removed { type_id } => {
                    HookEvent::new(EventKind::ComponentRemoved, id, composition.clone())
                        .with_component(type_id)
                }
            });
        }
        // Hook outcomes never abort a committed save.
        self.hooks.dispatch_batch(events).await;
        Ok(())
    }

    async fn save_tx(&self, entity: &Entity) -> Result<()> {
        let id = entity.id();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO entities (id) VALUES ($1) \
             ON CONFLICT (id) DO UPDATE SET updated_at = now()",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        for tombstone in entity.tombstones() {
            sqlx::query("DELETE FROM components WHERE entity_id = $1 AND type_id = $2")
                .bind(id)
                .bind(tombstone.type_id.as_str())
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM entity_components WHERE entity_id = $1 AND type_id = $2")
                .bind(id)
                .bind(tombstone.type_id.as_str())
                .execute(&mut *tx)
                .await?;
        }

        for slot in entity.dirty_slots() {
            sqlx::query(
                "INSERT INTO components (component_id, entity_id, type_id, name, data) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (component_id, type_id, entity_id) \
                 DO UPDATE SET data = EXCLUDED.data, updated_at = now(), deleted_at = NULL",
            )
            .bind(slot.component_id)
            .bind(id)
            .bind(slot.type_id.as_str())
            .bind(&slot.name)
            .bind(&slot.data)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "INSERT INTO entity_components (entity_id, type_id) VALUES ($1, $2) \
                 ON CONFLICT (entity_id, type_id) DO UPDATE SET deleted_at = NULL",
            )
            .bind(id)
            .bind(slot.type_id.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Deletes an entity. Soft delete stamps `deleted_at` on the entity, its
    /// components, and the mirror rows; `force` removes them physically.
    pub async fn delete(&self, entity: &mut Entity, force: bool) -> Result<()> {
        let id = entity.id();
        let mut tx = self.pool.begin().await?;
        if force {
            sqlx::query("DELETE FROM components WHERE entity_id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM entity_components WHERE entity_id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM entities WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        } else {
            sqlx::query(
                "UPDATE entities SET deleted_at = now(), updated_at = now() WHERE id = $1",
            )
            .bind(id)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "UPDATE components SET deleted_at = now() \
                 WHERE entity_id = $1 AND deleted_at IS NULL",
            )
            .bind(id)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "UPDATE entity_components SET deleted_at = now() \
                 WHERE entity_id = $1 AND deleted_at IS NULL",
            )
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        entity.mark_deleted(if force { None } else { Some(Utc::now()) });
        let event = HookEvent::new(EventKind::EntityDeleted, id, entity.composition())
            .soft_delete(!force);
        self.hooks.dispatch(event).await;
        Ok(())
    }

    /// Loads several entities with all their live components in two round
    /// trips. Missing or soft-deleted ids are skipped; order follows the
    /// input.
    pub async fn load_multiple(&self, ids: &[Uuid]) -> Result<Vec<Entity>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let id_vec: Vec<Uuid> = ids.to_vec();
        let entity_rows: Vec<EntityRow> = sqlx::query_as(
            "SELECT id, created_at, updated_at, deleted_at FROM entities \
             WHERE id = ANY($1) AND deleted_at IS NULL",
        )
        .bind(&id_vec)
        .fetch_all(&self.pool)
        .await?;

        let component_rows: Vec<ComponentRow> = sqlx::query_as(
            "SELECT component_id, entity_id, type_id, name, data FROM components \
             WHERE entity_id = ANY($1) AND deleted_at IS NULL",
        )
        .bind(&id_vec)
        .fetch_all(&self.pool)
        .await?;

        let mut by_id: std::collections::HashMap<Uuid, Entity> = entity_rows
            .into_iter()
            .map(|row| {
                (
                    row.id,
                    Entity::from_row(row.id, row.created_at, row.updated_at, row.deleted_at),
                )
            })
            .collect();
        for row in component_rows {
            if let Some(entity) = by_id.get_mut(&row.entity_id) {
                entity.attach_loaded(
                    row.component_id,
                    TypeId::from_hex(row.type_id),
                    row.name,
                    row.data,
                );
            }
        }
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    /// Loads one entity with its components, or `None`.
    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Entity>> {
        Ok(self.load_multiple(&[id]).await?.into_iter().next())
    }

    /// Returns a component's data, fetching the single row from its
    /// partition when it is not in memory; the result is cached on the
    /// entity.
    pub async fn component(&self, entity: &mut Entity, name: &str) -> Result<Option<Value>> {
        if let Some(value) = entity.get_component(name) {
            return Ok(Some(value.clone()));
        }
        let type_id = TypeId::of(name);
        let row: Option<ComponentRow> = sqlx::query_as(
            "SELECT component_id, entity_id, type_id, name, data FROM components \
             WHERE entity_id = $1 AND type_id = $2 AND deleted_at IS NULL",
        )
        .bind(entity.id())
        .bind(type_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let data = row.data.clone();
                entity.attach_loaded(
                    row.component_id,
                    TypeId::from_hex(row.type_id),
                    row.name,
                    row.data,
                );
                Ok(Some(data))
            }
            None => Ok(None),
        }
    }
}
