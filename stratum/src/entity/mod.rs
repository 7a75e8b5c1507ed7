//! In-memory entity representation with dirty tracking.
//!
//! An entity accumulates component changes in program order; nothing touches
//! the database until [`EntityStore::save`](crate::entity::store::EntityStore)
//! flushes the whole batch in one transaction. Removals are buffered as
//! tombstones and realized in the same transaction as upserts.

pub mod store;

use crate::component::{Component, TypeId};
use crate::error::{Result, StratumError};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Persistence state of one attached component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// New in memory, not yet in the database.
    Added,
    /// Persisted before, changed since.
    Dirty,
    /// Persisted and unchanged.
    Clean,
}

/// One component attached to an entity.
#[derive(Debug, Clone)]
pub struct ComponentSlot {
    pub component_id: Uuid,
    pub type_id: TypeId,
    pub name: String,
    pub data: Value,
    state: SlotState,
}

impl ComponentSlot {
    pub(crate) fn is_dirty(&self) -> bool {
        self.state != SlotState::Clean
    }

    fn was_persisted(&self) -> bool {
        self.state != SlotState::Added
    }
}

/// Component-level mutation buffered for post-commit hook dispatch.
#[derive(Debug, Clone)]
pub(crate) enum PendingEvent {
    Added { type_id: TypeId, data: Value },
    Updated { type_id: TypeId, old: Value, new: Value },
    Removed { type_id: TypeId },
}

/// An entity: an opaque identifier carrying a dynamic set of components.
#[derive(Debug, Clone)]
pub struct Entity {
    id: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
    slots: HashMap<TypeId, ComponentSlot>,
    tombstones: HashMap<TypeId, ComponentSlot>,
    persisted: bool,
    pending_events: Vec<PendingEvent>,
}

impl Entity {
    /// Creates a new unpersisted entity with a time-ordered v7 id.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            slots: HashMap::new(),
            tombstones: HashMap::new(),
            persisted: false,
            pending_events: Vec::new(),
        }
    }

    pub(crate) fn from_row(
        id: Uuid,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        deleted_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id,
            created_at,
            updated_at,
            deleted_at,
            slots: HashMap::new(),
            tombstones: HashMap::new(),
            persisted: true,
            pending_events: Vec::new(),
        }
    }

    /// Lightweight persisted handle carrying only the id; components are
    /// loaded on demand.
    pub(crate) fn handle(id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            slots: HashMap::new(),
            tombstones: HashMap::new(),
            persisted: true,
            pending_events: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    /// True when any component change is waiting for a save, or the entity
    /// row itself has never been written.
    pub fn is_dirty(&self) -> bool {
        !self.persisted
            || !self.tombstones.is_empty()
            || self.slots.values().any(|s| s.is_dirty())
    }

    /// Attaches a typed component. Fails when the class is already attached;
    /// use [`Entity::set`] for upsert semantics.
    pub fn add<C: Component>(&mut self, component: &C) -> Result<()> {
        self.add_component(C::NAME, serde_json::to_value(component)?)
    }

    /// Attaches a component by class name.
    pub fn add_component(&mut self, name: &str, data: Value) -> Result<()> {
        let type_id = TypeId::of(name);
        if self.slots.contains_key(&type_id) {
            return Err(StratumError::Validation(format!(
                "component '{}' already attached to entity {}; use set",
                name, self.id
            )));
        }
        // Re-adding a tombstoned component revives the slot with fresh data.
        let component_id = self
            .tombstones
            .remove(&type_id)
            .map(|t| t.component_id)
            .unwrap_or_else(Uuid::now_v7);
        self.slots.insert(
            type_id.clone(),
            ComponentSlot {
                component_id,
                type_id: type_id.clone(),
                name: name.to_string(),
                data: data.clone(),
                state: SlotState::Added,
            },
        );
        self.pending_events.push(PendingEvent::Added { type_id, data });
        Ok(())
    }

    /// Upserts a typed component: patches fields when attached, attaches
    /// otherwise.
    pub fn set<C: Component>(&mut self, component: &C) -> Result<()> {
        self.set_component(C::NAME, serde_json::to_value(component)?)
    }

    /// Upserts a component by class name. Object values are merged key by
    /// key over the current data; any other value replaces it.
    pub fn set_component(&mut self, name: &str, data: Value) -> Result<()> {
        let type_id = TypeId::of(name);
        match self.slots.get_mut(&type_id) {
            Some(slot) => {
                let old = slot.data.clone();
                match (&mut slot.data, data) {
                    (Value::Object(current), Value::Object(patch)) => {
                        for (key, value) in patch {
                            current.insert(key, value);
                        }
                    }
                    (current, other) => *current = other,
                }
                if slot.state == SlotState::Clean {
                    slot.state = SlotState::Dirty;
                }
                let new = slot.data.clone();
                self.pending_events
                    .push(PendingEvent::Updated { type_id, old, new });
                Ok(())
            }
            None => self.add_component(name, data),
        }
    }

    /// Detaches a typed component. The database row is deleted at the next
    /// save.
    pub fn remove<C: Component>(&mut self) {
        self.remove_component(C::NAME);
    }

    /// Detaches a component by class name. A no-op when not attached.
    pub fn remove_component(&mut self, name: &str) {
        let type_id = TypeId::of(name);
        if let Some(slot) = self.slots.remove(&type_id) {
            if slot.was_persisted() {
                self.tombstones.insert(type_id.clone(), slot);
            }
            self.pending_events.push(PendingEvent::Removed { type_id });
        }
    }

    /// Returns the in-memory instance of a typed component, if attached.
    pub fn get<C: Component>(&self) -> Result<Option<C>> {
        match self.slots.get(&C::type_id()) {
            Some(slot) => Ok(Some(serde_json::from_value(slot.data.clone())?)),
            None => Ok(None),
        }
    }

    /// Returns the raw data of a component by class name, if attached.
    pub fn get_component(&self, name: &str) -> Option<&Value> {
        self.slots.get(&TypeId::of(name)).map(|s| &s.data)
    }

    pub fn has_component(&self, name: &str) -> bool {
        self.slots.contains_key(&TypeId::of(name))
    }

    /// Live component composition: the type ids currently attached.
    pub fn composition(&self) -> Vec<TypeId> {
        self.slots.keys().cloned().collect()
    }

    /// Names of all attached components.
    pub fn component_names(&self) -> Vec<String> {
        self.slots.values().map(|s| s.name.clone()).collect()
    }

    /// Type ids of components with unsaved changes.
    pub fn changed_type_ids(&self) -> Vec<TypeId> {
        self.slots
            .values()
            .filter(|s| s.is_dirty())
            .map(|s| s.type_id.clone())
            .collect()
    }

    pub(crate) fn slots(&self) -> impl Iterator<Item = &ComponentSlot> {
        self.slots.values()
    }

    pub(crate) fn dirty_slots(&self) -> impl Iterator<Item = &ComponentSlot> {
        self.slots.values().filter(|s| s.is_dirty())
    }

    pub(crate) fn tombstones(&self) -> impl Iterator<Item = &ComponentSlot> {
        self.tombstones.values()
    }

    /// Installs a component loaded from storage as clean.
    pub(crate) fn attach_loaded(
        &mut self,
        component_id: Uuid,
        type_id: TypeId,
        name: String,
        data: Value,
    ) {
        self.slots.insert(
            type_id.clone(),
            ComponentSlot {
                component_id,
                type_id,
                name,
                data,
                state: SlotState::Clean,
            },
        );
    }

    /// Clears dirty bits and tombstones after a committed save and hands the
    /// buffered component events to the caller.
    pub(crate) fn mark_saved(&mut self, at: DateTime<Utc>) -> Vec<PendingEvent> {
        for slot in self.slots.values_mut() {
            slot.state = SlotState::Clean;
        }
        self.tombstones.clear();
        self.persisted = true;
        self.updated_at = at;
        std::mem::take(&mut self.pending_events)
    }

    pub(crate) fn mark_deleted(&mut self, at: Option<DateTime<Utc>>) {
        self.deleted_at = at;
    }
}

impl Default for Entity {
    fn default() -> Self {
        Self::new()
    }
}
