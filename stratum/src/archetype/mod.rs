//! Archetypes: named bundles of components with relations and a validation
//! shape.
//!
//! An archetype projects between the external record of an entity and its
//! per-component rows: `fill` distributes an input record over component
//! writes, `unwrap` reassembles the record from attached components.

pub mod schema;

use crate::entity::store::EntityStore;
use crate::entity::Entity;
use crate::error::{Result, StratumError};
use crate::query::filter::{Filter, FilterOp};
use crate::registry::Registry;
use self::schema::{ArchetypeSchema, UNION_DISCRIMINATOR};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    HasOne,
    HasMany,
    BelongsTo,
    BelongsToMany,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RelationOpts {
    /// Dotted `Component.field` path holding the reference. On the owning
    /// side for `BelongsTo`, on the target side for `HasMany`.
    pub foreign_key: Option<String>,
    /// Join archetype for `BelongsToMany`.
    pub through: Option<String>,
    pub nullable: bool,
    pub cascade: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationSpec {
    pub target: String,
    pub kind: RelationKind,
    pub opts: RelationOpts,
}

/// Declared metadata for one archetype.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchetypeDescriptor {
    pub name: String,
    /// record field -> component class, in declaration order.
    pub component_map: Vec<(String, String)>,
    /// record field -> candidate component classes.
    pub union_map: Vec<(String, Vec<String>)>,
    /// record field -> relation.
    pub relation_map: Vec<(String, RelationSpec)>,
}

impl ArchetypeDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            component_map: Vec::new(),
            union_map: Vec::new(),
            relation_map: Vec::new(),
        }
    }

    pub fn component(mut self, field: impl Into<String>, class: impl Into<String>) -> Self {
        self.component_map.push((field.into(), class.into()));
        self
    }

    pub fn union(mut self, field: impl Into<String>, classes: Vec<String>) -> Self {
        self.union_map.push((field.into(), classes));
        self
    }

    pub fn relation(mut self, field: impl Into<String>, spec: RelationSpec) -> Self {
        self.relation_map.push((field.into(), spec));
        self
    }

    /// Component classes declared through the component map.
    pub fn component_names(&self) -> impl Iterator<Item = &str> {
        self.component_map.iter().map(|(_, class)| class.as_str())
    }
}

/// Options for [`Archetype::entity_by_id`].
#[derive(Debug, Clone, Default)]
pub struct FetchOpts {
    /// When non-empty, only these component classes are required/loaded.
    pub include_components: Vec<String>,
    pub exclude_components: Vec<String>,
    /// Resolve relations eagerly into the record.
    pub resolve_relations: bool,
}

/// A registered archetype with its compiled schema.
pub struct Archetype {
    descriptor: Arc<ArchetypeDescriptor>,
    registry: Arc<Registry>,
    schema: ArchetypeSchema,
}

impl Archetype {
    /// Compiles the schema and registers the descriptor.
    pub fn new(descriptor: ArchetypeDescriptor, registry: Arc<Registry>) -> Result<Self> {
        let schema = schema::compile_schema(&descriptor, &registry)?;
        registry.register_archetype(descriptor.clone())?;
        Ok(Self {
            descriptor: Arc::new(descriptor),
            registry,
            schema,
        })
    }

    /// Rebuilds an archetype from registry metadata.
    pub fn from_registry(name: &str, registry: Arc<Registry>) -> Result<Self> {
        let descriptor = registry
            .archetype(name)
            .ok_or_else(|| StratumError::UnknownArchetype(name.to_string()))?;
        let schema = schema::compile_schema(&descriptor, &registry)?;
        Ok(Self {
            descriptor,
            registry,
            schema,
        })
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ArchetypeDescriptor {
        &self.descriptor
    }

    pub fn schema(&self) -> &ArchetypeSchema {
        &self.schema
    }

    /// External filter schema consumed by API layers.
    pub fn filter_schema(&self) -> Value {
        schema::filter_schema(&self.schema)
    }

    /// Creates a blank in-memory entity for this archetype.
    pub fn create_entity(&self) -> Entity {
        Entity::new()
    }

    /// Fills an entity and persists it in one step.
    pub async fn create_and_save_entity(
        &self,
        store: &EntityStore,
        input: &Value,
    ) -> Result<Entity> {
        let mut entity = self.create_entity();
        self.fill(&mut entity, input, true)?;
        store.save(&mut entity).await?;
        Ok(entity)
    }

    /// Projects an external record into per-component writes on the entity.
    /// Unknown fields raise `Validation` in strict mode and are skipped
    /// otherwise.
    pub fn fill(&self, entity: &mut Entity, input: &Value, strict: bool) -> Result<()> {
        let object = input.as_object().ok_or_else(|| {
            StratumError::Validation(format!("archetype '{}' takes an object", self.name()))
        })?;
        for (key, value) in object {
            if key == "id" {
                continue;
            }
            if let Some((_, class)) = self
                .descriptor
                .component_map
                .iter()
                .find(|(field, _)| field == key)
            {
                self.fill_component(entity, class, value, strict)?;
            } else if let Some((_, variants)) = self
                .descriptor
                .union_map
                .iter()
                .find(|(field, _)| field == key)
            {
                self.fill_union(entity, variants, value, strict)?;
            } else if let Some((_, relation)) = self
                .descriptor
                .relation_map
                .iter()
                .find(|(field, _)| field == key)
            {
                self.fill_relation(entity, key, relation, value)?;
            } else if strict {
                return Err(StratumError::Validation(format!(
                    "unknown field '{}' for archetype '{}'",
                    key,
                    self.name()
                )));
            }
        }
        Ok(())
    }

    fn fill_component(
        &self,
        entity: &mut Entity,
        class: &str,
        value: &Value,
        strict: bool,
    ) -> Result<()> {
        let component = self
            .registry
            .component_by_name(class)
            .ok_or_else(|| StratumError::UnknownComponent(class.to_string()))?;
        let data = match schema::unwrapped_primitive(&component.fields) {
            Some(kind) => {
                if !value.is_null() && !schema::check_kind(value, kind) {
                    return Err(StratumError::Validation(format!(
                        "'{}' expects {:?}",
                        class, kind
                    )));
                }
                json!({ "value": value })
            }
            None => {
                schema::validate_component_object(class, &component.fields, value, strict)?;
                value.clone()
            }
        };
        entity.set_component(class, data)
    }

    fn fill_union(
        &self,
        entity: &mut Entity,
        variants: &[String],
        value: &Value,
        strict: bool,
    ) -> Result<()> {
        let class = self.classify_union(variants, value)?;
        let component = self
            .registry
            .component_by_name(&class)
            .ok_or_else(|| StratumError::UnknownComponent(class.clone()))?;
        let mut data = value.clone();
        if let Some(object) = data.as_object_mut() {
            object.remove(UNION_DISCRIMINATOR);
        }
        schema::validate_component_object(&class, &component.fields, &data, strict)?;
        entity.set_component(&class, data)
    }

    /// Picks the union variant: by discriminator when present, otherwise by
    /// property shape. An ambiguous or unmatched value is an error rather
    /// than silently landing in the first declared variant.
    fn classify_union(&self, variants: &[String], value: &Value) -> Result<String> {
        let object = value
            .as_object()
            .ok_or_else(|| StratumError::Validation("union value must be an object".into()))?;
        if let Some(discriminator) = object.get(UNION_DISCRIMINATOR).and_then(|v| v.as_str()) {
            if variants.iter().any(|v| v == discriminator) {
                return Ok(discriminator.to_string());
            }
            return Err(StratumError::Validation(format!(
                "'{}' is not a variant of this union",
                discriminator
            )));
        }
        let keys: HashSet<&String> = object
            .keys()
            .filter(|k| k.as_str() != UNION_DISCRIMINATOR)
            .collect();
        let mut matched = Vec::new();
        for class in variants {
            let Some(component) = self.registry.component_by_name(class) else {
                continue;
            };
            let declared: HashSet<&String> = component.fields.iter().map(|f| &f.key).collect();
            if keys.iter().all(|k| declared.contains(*k)) {
                matched.push(class.clone());
            }
        }
        match matched.as_slice() {
            [single] => Ok(single.clone()),
            [] => Err(StratumError::Validation(
                "union value matches no declared variant".into(),
            )),
            _ => Err(StratumError::Validation(
                "union value without discriminator matches several variants".into(),
            )),
        }
    }

    fn fill_relation(
        &self,
        entity: &mut Entity,
        field: &str,
        relation: &RelationSpec,
        value: &Value,
    ) -> Result<()> {
        match relation.kind {
            RelationKind::BelongsTo | RelationKind::HasOne => {
                let (class, fk_field) = self.foreign_key_path(field, relation)?;
                let reference = if value.is_null() {
                    if !relation.opts.nullable {
                        return Err(StratumError::Validation(format!(
                            "relation '{}' is not nullable",
                            field
                        )));
                    }
                    Value::Null
                } else {
                    let id = value.as_str().ok_or_else(|| {
                        StratumError::Validation(format!(
                            "relation '{}' takes an entity id string",
                            field
                        ))
                    })?;
                    json!(id)
                };
                let mut data = Map::new();
                data.insert(fk_field, reference);
                entity.set_component(&class, Value::Object(data))
            }
            // Plural references live on the other side; they are written by
            // filling the target archetype.
            RelationKind::HasMany | RelationKind::BelongsToMany => Ok(()),
        }
    }

    fn foreign_key_path(&self, field: &str, relation: &RelationSpec) -> Result<(String, String)> {
        let fk = relation.opts.foreign_key.as_deref().ok_or_else(|| {
            StratumError::Validation(format!("relation '{}' declares no foreign key", field))
        })?;
        match fk.split_once('.') {
            Some((class, fk_field)) => Ok((class.to_string(), fk_field.to_string())),
            None => Err(StratumError::Validation(format!(
                "foreign key '{}' must use the dotted component.field form",
                fk
            ))),
        }
    }

    /// Reassembles the external record from the entity's attached
    /// components. `exclude` drops record fields by name.
    pub fn unwrap(&self, entity: &Entity, exclude: &[&str]) -> Result<Value> {
        let mut out = Map::new();
        out.insert("id".to_string(), json!(entity.id().to_string()));

        for (field, class) in &self.descriptor.component_map {
            if exclude.contains(&field.as_str()) {
                continue;
            }
            let Some(data) = entity.get_component(class) else {
                continue;
            };
            let component = self
                .registry
                .component_by_name(class)
                .ok_or_else(|| StratumError::UnknownComponent(class.clone()))?;
            let value = match schema::unwrapped_primitive(&component.fields) {
                Some(_) => data.get("value").cloned().unwrap_or(Value::Null),
                None => data.clone(),
            };
            out.insert(field.clone(), value);
        }

        for (field, variants) in &self.descriptor.union_map {
            if exclude.contains(&field.as_str()) {
                continue;
            }
            for class in variants {
                if let Some(data) = entity.get_component(class) {
                    let mut value = data.clone();
                    if let Some(object) = value.as_object_mut() {
                        object.insert(UNION_DISCRIMINATOR.to_string(), json!(class));
                    }
                    out.insert(field.clone(), value);
                    break;
                }
            }
        }

        for (field, relation) in &self.descriptor.relation_map {
            if exclude.contains(&field.as_str()) {
                continue;
            }
            if matches!(relation.kind, RelationKind::BelongsTo | RelationKind::HasOne) {
                if let Ok((class, fk_field)) = self.foreign_key_path(field, relation) {
                    let reference = entity
                        .get_component(&class)
                        .and_then(|data| data.get(&fk_field))
                        .cloned()
                        .unwrap_or(Value::Null);
                    out.insert(field.clone(), reference);
                }
            }
        }

        Ok(Value::Object(out))
    }

    /// Loads the entity with the declared components. Non-nullable declared
    /// components are required; nullable ones hydrate when present.
    pub async fn entity_by_id(
        &self,
        store: &EntityStore,
        id: Uuid,
        opts: &FetchOpts,
    ) -> Result<Option<Entity>> {
        let mut query = store.query().find_by_id(id).populate();
        for (field, class) in &self.descriptor.component_map {
            if !opts.include_components.is_empty() && !opts.include_components.contains(class) {
                continue;
            }
            if opts.exclude_components.contains(class) {
                continue;
            }
            let nullable = self
                .schema
                .field(field)
                .map(|f| f.nullable)
                .unwrap_or(false);
            if !nullable {
                query = query.with_component(class, Vec::new());
            }
        }
        Ok(query.exec().await?.into_iter().next())
    }

    /// Loads and unwraps the record, optionally resolving relations one
    /// level deep: `BelongsTo` through the owning component's foreign key,
    /// `HasMany` by scanning the target archetype on its foreign key.
    pub async fn record_by_id(
        &self,
        store: &EntityStore,
        id: Uuid,
        opts: &FetchOpts,
    ) -> Result<Option<Value>> {
        let Some(entity) = self.entity_by_id(store, id, opts).await? else {
            return Ok(None);
        };
        let mut record = self.unwrap(&entity, &[])?;
        if !opts.resolve_relations {
            return Ok(Some(record));
        }
        for (field, relation) in &self.descriptor.relation_map {
            match relation.kind {
                RelationKind::BelongsTo | RelationKind::HasOne => {
                    let Some(reference) = record.get(field.as_str()).and_then(|v| v.as_str())
                    else {
                        continue;
                    };
                    let Ok(target_id) = Uuid::parse_str(reference) else {
                        continue;
                    };
                    let target =
                        Archetype::from_registry(&relation.target, self.registry.clone())?;
                    if let Some(target_entity) = store.find_by_id(target_id).await? {
                        record[field.as_str()] = target.unwrap(&target_entity, &[])?;
                    }
                }
                RelationKind::HasMany => {
                    let Ok((class, fk_field)) = self.foreign_key_path(field, relation) else {
                        continue;
                    };
                    let target =
                        Archetype::from_registry(&relation.target, self.registry.clone())?;
                    let related = store
                        .query()
                        .with_component(
                            &class,
                            vec![Filter::new(
                                fk_field,
                                FilterOp::Eq,
                                json!(entity.id().to_string()),
                            )],
                        )
                        .populate()
                        .exec()
                        .await?;
                    let records: Result<Vec<Value>> = related
                        .iter()
                        .map(|e| target.unwrap(e, &[]))
                        .collect();
                    record[field.as_str()] = Value::Array(records?);
                }
                RelationKind::BelongsToMany => {}
            }
        }
        Ok(Some(record))
    }

    /// Compiles end-user filter input into per-component filter lists for
    /// the query engine.
    pub fn build_filter_branches(&self, input: &Value) -> Result<Vec<(String, Vec<Filter>)>> {
        let object = input
            .as_object()
            .ok_or_else(|| StratumError::Validation("filter input must be an object".into()))?;
        let mut branches: Vec<(String, Vec<Filter>)> = Vec::new();
        for (key, spec) in object {
            let Some((_, class)) = self
                .descriptor
                .component_map
                .iter()
                .find(|(field, _)| field == key)
            else {
                return Err(StratumError::Validation(format!(
                    "'{}' is not a filterable field of archetype '{}'",
                    key,
                    self.name()
                )));
            };
            let component = self
                .registry
                .component_by_name(class)
                .ok_or_else(|| StratumError::UnknownComponent(class.clone()))?;
            let mut filters = Vec::new();
            match schema::unwrapped_primitive(&component.fields) {
                Some(_) => filters.extend(predicates("value", spec)?),
                None => {
                    let nested = spec.as_object().ok_or_else(|| {
                        StratumError::Validation(format!(
                            "'{}' filters must be an object of fields",
                            key
                        ))
                    })?;
                    for (nested_field, nested_spec) in nested {
                        filters.extend(predicates(nested_field, nested_spec)?);
                    }
                }
            }
            match branches.iter_mut().find(|(name, _)| name == class) {
                Some((_, existing)) => existing.extend(filters),
                None => branches.push((class.clone(), filters)),
            }
        }
        Ok(branches)
    }
}

/// Expands one field's filter spec. A scalar means equality; an object maps
/// operator keys to operands.
fn predicates(field: &str, spec: &Value) -> Result<Vec<Filter>> {
    let Some(object) = spec.as_object() else {
        return Ok(vec![Filter::eq(field, spec.clone())]);
    };
    let mut filters = Vec::new();
    for (op_key, operand) in object {
        let filter = match op_key.as_str() {
            "eq" => Filter::eq(field, operand.clone()),
            "neq" => Filter::neq(field, operand.clone()),
            "gt" => Filter::gt(field, operand.clone()),
            "gte" => Filter::gte(field, operand.clone()),
            "lt" => Filter::lt(field, operand.clone()),
            "lte" => Filter::lte(field, operand.clone()),
            "like" => Filter::new(field, FilterOp::Like, operand.clone()),
            "in" => Filter::new(field, FilterOp::In, operand.clone()),
            "notIn" => Filter::new(field, FilterOp::NotIn, operand.clone()),
            "between" => Filter::new(field, FilterOp::Between, operand.clone()),
            "isNull" => {
                if operand.as_bool().unwrap_or(true) {
                    Filter::is_null(field)
                } else {
                    Filter::is_not_null(field)
                }
            }
            "isNotNull" => {
                if operand.as_bool().unwrap_or(true) {
                    Filter::is_not_null(field)
                } else {
                    Filter::is_null(field)
                }
            }
            other => {
                return Err(StratumError::Validation(format!(
                    "unknown filter operator '{}'",
                    other
                )))
            }
        };
        filters.push(filter);
    }
    Ok(filters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ComponentDescriptor, FieldDescriptor, FieldKind};
    use pretty_assertions::assert_eq;

    fn registry() -> Arc<Registry> {
        let registry = Arc::new(Registry::new());
        registry
            .register_component(
                ComponentDescriptor::new("Name")
                    .field(FieldDescriptor::new("value", FieldKind::String)),
            )
            .unwrap();
        registry
            .register_component(
                ComponentDescriptor::new("Profile")
                    .field(FieldDescriptor::new("bio", FieldKind::String).nullable())
                    .field(FieldDescriptor::new("age", FieldKind::Integer))
                    .field(FieldDescriptor::new("org_id", FieldKind::String).nullable()),
            )
            .unwrap();
        registry
            .register_component(
                ComponentDescriptor::new("EmailContact")
                    .field(FieldDescriptor::new("address", FieldKind::String)),
            )
            .unwrap();
        registry
            .register_component(
                ComponentDescriptor::new("PhoneContact")
                    .field(FieldDescriptor::new("number", FieldKind::String)),
            )
            .unwrap();
        registry
    }

    fn archetype(registry: Arc<Registry>) -> Archetype {
        let descriptor = ArchetypeDescriptor::new("User")
            .component("name", "Name")
            .component("profile", "Profile")
            .union(
                "contact",
                vec!["EmailContact".into(), "PhoneContact".into()],
            )
            .relation(
                "organization",
                RelationSpec {
                    target: "Organization".into(),
                    kind: RelationKind::BelongsTo,
                    opts: RelationOpts {
                        foreign_key: Some("Profile.org_id".into()),
                        nullable: true,
                        ..Default::default()
                    },
                },
            );
        Archetype::new(descriptor, registry).unwrap()
    }

    #[test]
    fn fill_then_unwrap_round_trips() {
        let registry = registry();
        let archetype = archetype(registry);
        let mut entity = archetype.create_entity();
        let input = json!({
            "name": "ada",
            "profile": {"bio": "pioneer", "age": 36},
            "contact": {"type": "EmailContact", "address": "ada@example.org"},
        });
        archetype.fill(&mut entity, &input, true).unwrap();

        assert!(entity.has_component("Name"));
        assert!(entity.has_component("Profile"));
        assert!(entity.has_component("EmailContact"));
        assert_eq!(
            entity.get_component("Name").unwrap(),
            &json!({"value": "ada"})
        );

        let record = archetype.unwrap(&entity, &[]).unwrap();
        assert_eq!(record["name"], json!("ada"));
        assert_eq!(record["profile"]["age"], json!(36));
        assert_eq!(record["contact"]["type"], json!("EmailContact"));
        assert_eq!(record["contact"]["address"], json!("ada@example.org"));
        assert_eq!(record["id"], json!(entity.id().to_string()));
    }

    #[test]
    fn unwrap_excludes_fields() {
        let archetype = archetype(registry());
        let mut entity = archetype.create_entity();
        archetype
            .fill(&mut entity, &json!({"name": "ada"}), true)
            .unwrap();
        let record = archetype.unwrap(&entity, &["name"]).unwrap();
        assert!(record.get("name").is_none());
    }

    #[test]
    fn strict_fill_rejects_unknown_fields() {
        let archetype = archetype(registry());
        let mut entity = archetype.create_entity();
        let input = json!({"name": "ada", "nickname": "al"});
        assert!(archetype.fill(&mut entity, &input, true).is_err());
        archetype.fill(&mut entity, &input, false).unwrap();
        assert!(entity.has_component("Name"));
    }

    #[test]
    fn union_classifies_by_shape_when_discriminator_is_absent() {
        let archetype = archetype(registry());
        let mut entity = archetype.create_entity();
        archetype
            .fill(
                &mut entity,
                &json!({"contact": {"number": "+43 1"}}),
                true,
            )
            .unwrap();
        assert!(entity.has_component("PhoneContact"));
        assert!(!entity.has_component("EmailContact"));
    }

    #[test]
    fn unmatched_union_value_is_rejected() {
        let archetype = archetype(registry());
        let mut entity = archetype.create_entity();
        let result = archetype.fill(
            &mut entity,
            &json!({"contact": {"fax": "nope"}}),
            true,
        );
        assert!(result.is_err());
    }

    #[test]
    fn unknown_discriminator_is_rejected() {
        let archetype = archetype(registry());
        let mut entity = archetype.create_entity();
        let result = archetype.fill(
            &mut entity,
            &json!({"contact": {"type": "Carrier", "address": "x"}}),
            true,
        );
        assert!(result.is_err());
    }

    #[test]
    fn belongs_to_writes_the_foreign_key() {
        let archetype = archetype(registry());
        let mut entity = archetype.create_entity();
        let org_id = Uuid::now_v7().to_string();
        archetype
            .fill(&mut entity, &json!({"organization": org_id}), true)
            .unwrap();
        assert_eq!(
            entity.get_component("Profile").unwrap()["org_id"],
            json!(org_id)
        );

        let record = archetype.unwrap(&entity, &[]).unwrap();
        assert_eq!(record["organization"], json!(org_id));
    }

    #[test]
    fn filter_branches_split_per_component() {
        let archetype = archetype(registry());
        let branches = archetype
            .build_filter_branches(&json!({
                "name": {"like": "%ada%"},
                "profile": {"age": {"gte": 18, "lt": 100}},
            }))
            .unwrap();
        assert_eq!(branches.len(), 2);
        let (class, filters) = branches.iter().find(|(c, _)| c == "Name").unwrap();
        assert_eq!(class, "Name");
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].field, "value");
        let (_, profile_filters) = branches.iter().find(|(c, _)| c == "Profile").unwrap();
        assert_eq!(profile_filters.len(), 2);
        assert!(profile_filters.iter().all(|f| f.field == "age"));
    }

    #[test]
    fn scalar_filter_spec_means_equality() {
        let archetype = archetype(registry());
        let branches = archetype
            .build_filter_branches(&json!({"name": "ada"}))
            .unwrap();
        assert_eq!(branches[0].1[0].op, FilterOp::Eq);
    }

    #[test]
    fn unknown_filter_field_is_rejected() {
        let archetype = archetype(registry());
        assert!(archetype
            .build_filter_branches(&json!({"nickname": "al"}))
            .is_err());
    }
}
