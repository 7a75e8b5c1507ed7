//! Canonical directory of component classes and archetypes.
//!
//! Registration happens during boot, serialized by the lifecycle phase;
//! lookups afterwards are read-mostly.

use crate::archetype::ArchetypeDescriptor;
use crate::component::{Component, ComponentDescriptor, FieldDescriptor, TypeId};
use crate::error::{Result, StratumError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of component class and archetype metadata.
///
/// Components and archetypes are stored by name and referred to by name or
/// type id everywhere else; resolution is always a lookup.
pub struct Registry {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    by_name: HashMap<String, Arc<ComponentDescriptor>>,
    by_type_id: HashMap<TypeId, Arc<ComponentDescriptor>>,
    archetypes: HashMap<String, Arc<ArchetypeDescriptor>>,
    /// Registration order, preserved for deterministic provisioning.
    order: Vec<TypeId>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Registers a component class and returns its type id.
    ///
    /// Idempotent: re-registering the same name with the same field set is a
    /// no-op. Re-registering with a divergent field set fails.
    pub fn register_component(&self, descriptor: ComponentDescriptor) -> Result<TypeId> {
        let type_id = descriptor.type_id();
        let mut inner = self.inner.write();
        if let Some(existing) = inner.by_name.get(&descriptor.name) {
            if existing.fields != descriptor.fields {
                return Err(StratumError::MetadataConflict {
                    name: descriptor.name.clone(),
                    detail: "re-registration with a divergent field set".into(),
                });
            }
            return Ok(type_id);
        }
        log::debug!(
            "registry: component '{}' -> {}",
            descriptor.name,
            type_id
        );
        let descriptor = Arc::new(descriptor);
        inner
            .by_name
            .insert(descriptor.name.clone(), descriptor.clone());
        inner.by_type_id.insert(type_id.clone(), descriptor);
        inner.order.push(type_id.clone());
        Ok(type_id)
    }

    /// Registers a typed component class.
    pub fn register<C: Component>(&self) -> Result<TypeId> {
        self.register_component(C::descriptor())
    }

    pub fn component_by_name(&self, name: &str) -> Option<Arc<ComponentDescriptor>> {
        self.inner.read().by_name.get(name).cloned()
    }

    pub fn component_by_type_id(&self, type_id: &TypeId) -> Option<Arc<ComponentDescriptor>> {
        self.inner.read().by_type_id.get(type_id).cloned()
    }

    /// Field descriptors for a registered class.
    pub fn properties(&self, type_id: &TypeId) -> Result<Vec<FieldDescriptor>> {
        self.component_by_type_id(type_id)
            .map(|d| d.fields.clone())
            .ok_or_else(|| StratumError::UnknownComponent(type_id.to_string()))
    }

    /// Keys of fields declared `indexed`.
    pub fn indexed_fields(&self, type_id: &TypeId) -> Result<Vec<String>> {
        self.component_by_type_id(type_id)
            .map(|d| {
                d.fields
                    .iter()
                    .filter(|f| f.indexed)
                    .map(|f| f.key.clone())
                    .collect()
            })
            .ok_or_else(|| StratumError::UnknownComponent(type_id.to_string()))
    }

    /// Returns all registered component descriptors in registration order.
    pub fn components(&self) -> Vec<Arc<ComponentDescriptor>> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.by_type_id.get(id).cloned())
            .collect()
    }

    /// True once the class behind the type id has been registered. Writes for
    /// unregistered type ids are rejected upstream.
    pub fn is_registered(&self, type_id: &TypeId) -> bool {
        self.inner.read().by_type_id.contains_key(type_id)
    }

    pub fn register_archetype(&self, descriptor: ArchetypeDescriptor) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.archetypes.get(&descriptor.name) {
            if **existing != descriptor {
                return Err(StratumError::MetadataConflict {
                    name: descriptor.name.clone(),
                    detail: "archetype re-registration with a divergent shape".into(),
                });
            }
            return Ok(());
        }
        inner
            .archetypes
            .insert(descriptor.name.clone(), Arc::new(descriptor));
        Ok(())
    }

    pub fn archetype(&self, name: &str) -> Option<Arc<ArchetypeDescriptor>> {
        self.inner.read().archetypes.get(name).cloned()
    }

    pub fn archetypes(&self) -> Vec<Arc<ArchetypeDescriptor>> {
        self.inner.read().archetypes.values().cloned().collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{FieldKind, IndexKind, IndexSpec};
    use pretty_assertions::assert_eq;

    fn tag_descriptor() -> ComponentDescriptor {
        ComponentDescriptor::new("Tag")
            .field(FieldDescriptor::new("value", FieldKind::String).indexed())
            .index(IndexSpec::single("value", IndexKind::BTree))
    }

    #[test]
    fn registration_is_idempotent() {
        let registry = Registry::new();
        let id1 = registry.register_component(tag_descriptor()).unwrap();
        let id2 = registry.register_component(tag_descriptor()).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(registry.components().len(), 1);
    }

    #[test]
    fn divergent_reregistration_conflicts() {
        let registry = Registry::new();
        registry.register_component(tag_descriptor()).unwrap();
        let divergent = ComponentDescriptor::new("Tag")
            .field(FieldDescriptor::new("value", FieldKind::Integer));
        let err = registry.register_component(divergent).unwrap_err();
        assert!(matches!(err, StratumError::MetadataConflict { .. }));
    }

    #[test]
    fn lookups() {
        let registry = Registry::new();
        let id = registry.register_component(tag_descriptor()).unwrap();
        assert!(registry.component_by_name("Tag").is_some());
        assert!(registry.component_by_type_id(&id).is_some());
        assert!(registry.is_registered(&id));
        assert_eq!(registry.indexed_fields(&id).unwrap(), vec!["value"]);
        assert_eq!(registry.properties(&id).unwrap().len(), 1);
        assert!(!registry.is_registered(&TypeId::of("Missing")));
        assert!(registry.properties(&TypeId::of("Missing")).is_err());
    }
}
