//! Compiled validation schemas for archetypes.
//!
//! At registration time an archetype's declared components, unions, and
//! relations compile into the shape of its entity-facing record: components
//! with a single `value` field unwrap to their primitive, complex components
//! appear as nested objects, unions expose a discriminator, relations are id
//! references.

use crate::archetype::{ArchetypeDescriptor, RelationKind};
use crate::component::{FieldDescriptor, FieldKind};
use crate::error::{Result, StratumError};
use crate::registry::Registry;
use serde_json::{json, Value};

/// Discriminator key used to classify union values.
pub const UNION_DISCRIMINATOR: &str = "type";

/// Shape of one field in an archetype's external record.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldShape {
    /// A component with a single `value` field, surfaced as that primitive.
    Primitive(FieldKind),
    /// A multi-field component, surfaced as a nested object.
    Object(Vec<FieldDescriptor>),
    /// One of several components, discriminated by [`UNION_DISCRIMINATOR`].
    Union { variants: Vec<String> },
    /// A relation: a string id reference, or an array of them.
    Reference { plural: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchemaField {
    pub name: String,
    pub shape: FieldShape,
    pub nullable: bool,
}

/// The full compiled shape of an archetype's record.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchetypeSchema {
    pub archetype: String,
    pub fields: Vec<SchemaField>,
}

impl ArchetypeSchema {
    pub fn field(&self, name: &str) -> Option<&SchemaField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Compiles the schema for a descriptor. Every referenced component class
/// must already be registered.
pub fn compile_schema(
    descriptor: &ArchetypeDescriptor,
    registry: &Registry,
) -> Result<ArchetypeSchema> {
    let mut fields = Vec::new();

    for (field, class) in &descriptor.component_map {
        let component = registry
            .component_by_name(class)
            .ok_or_else(|| StratumError::UnknownComponent(class.clone()))?;
        let shape = match unwrapped_primitive(&component.fields) {
            Some(kind) => FieldShape::Primitive(kind.clone()),
            None => FieldShape::Object(component.fields.clone()),
        };
        let nullable = component.fields.iter().all(|f| f.nullable);
        fields.push(SchemaField {
            name: field.clone(),
            shape,
            nullable,
        });
    }

    for (field, variants) in &descriptor.union_map {
        for class in variants {
            if registry.component_by_name(class).is_none() {
                return Err(StratumError::UnknownComponent(class.clone()));
            }
        }
        fields.push(SchemaField {
            name: field.clone(),
            shape: FieldShape::Union {
                variants: variants.clone(),
            },
            nullable: true,
        });
    }

    for (field, relation) in &descriptor.relation_map {
        let plural = matches!(
            relation.kind,
            RelationKind::HasMany | RelationKind::BelongsToMany
        );
        fields.push(SchemaField {
            name: field.clone(),
            shape: FieldShape::Reference { plural },
            nullable: relation.opts.nullable,
        });
    }

    Ok(ArchetypeSchema {
        archetype: descriptor.name.clone(),
        fields,
    })
}

/// A component unwraps to its primitive when it declares exactly one field
/// named `value`.
pub fn unwrapped_primitive(fields: &[FieldDescriptor]) -> Option<&FieldKind> {
    match fields {
        [only] if only.key == "value" => Some(&only.kind),
        _ => None,
    }
}

/// Checks a JSON value against a declared field kind.
pub fn check_kind(value: &Value, kind: &FieldKind) -> bool {
    match kind {
        FieldKind::String => value.is_string(),
        FieldKind::Integer => value.is_i64() || value.is_u64(),
        FieldKind::Real => value.is_number(),
        FieldKind::Boolean => value.is_boolean(),
        // Timestamps travel as ISO-8601 strings.
        FieldKind::Timestamp => value.is_string(),
        FieldKind::Enum => value.is_string() || value.is_number(),
        FieldKind::Array(element) => value
            .as_array()
            .map(|items| items.iter().all(|v| check_kind(v, element)))
            .unwrap_or(false),
        FieldKind::Object => value.is_object(),
    }
}

/// Validates an object against component field descriptors. Unknown keys are
/// rejected in strict mode; declared non-nullable fields must be present.
pub fn validate_component_object(
    class: &str,
    fields: &[FieldDescriptor],
    value: &Value,
    strict: bool,
) -> Result<()> {
    let object = value.as_object().ok_or_else(|| {
        StratumError::Validation(format!("component '{}' takes an object", class))
    })?;
    for (key, item) in object {
        match fields.iter().find(|f| f.key == *key) {
            Some(descriptor) => {
                if item.is_null() {
                    if !descriptor.nullable {
                        return Err(StratumError::Validation(format!(
                            "{}.{} is not nullable",
                            class, key
                        )));
                    }
                    continue;
                }
                if !check_kind(item, &descriptor.kind) {
                    return Err(StratumError::Validation(format!(
                        "{}.{} expects {:?}",
                        class, key, descriptor.kind
                    )));
                }
                if descriptor.kind == FieldKind::Enum
                    && !descriptor.enum_values.is_empty()
                    && !descriptor.enum_values.contains(item)
                {
                    return Err(StratumError::Validation(format!(
                        "{}.{}: '{}' is not an allowed enum value",
                        class, key, item
                    )));
                }
            }
            None if strict => {
                return Err(StratumError::Validation(format!(
                    "unknown field {}.{}",
                    class, key
                )))
            }
            None => {}
        }
    }
    for descriptor in fields.iter().filter(|f| !f.nullable) {
        if !object.contains_key(&descriptor.key) {
            return Err(StratumError::Validation(format!(
                "{}.{} is required",
                class, descriptor.key
            )));
        }
    }
    Ok(())
}

/// Renders the external filter schema: which record fields accept filter
/// input and which operators apply.
pub fn filter_schema(schema: &ArchetypeSchema) -> Value {
    let mut fields = serde_json::Map::new();
    for field in &schema.fields {
        let entry = match &field.shape {
            FieldShape::Primitive(kind) => json!({
                "kind": kind_name(kind),
                "ops": ops_for(kind),
            }),
            FieldShape::Object(descriptors) => {
                let mut nested = serde_json::Map::new();
                for d in descriptors {
                    nested.insert(
                        d.key.clone(),
                        json!({ "kind": kind_name(&d.kind), "ops": ops_for(&d.kind) }),
                    );
                }
                Value::Object(nested)
            }
            FieldShape::Union { .. } | FieldShape::Reference { .. } => continue,
        };
        fields.insert(field.name.clone(), entry);
    }
    json!({ "archetype": schema.archetype, "fields": fields })
}

fn kind_name(kind: &FieldKind) -> &'static str {
    match kind {
        FieldKind::String => "string",
        FieldKind::Integer => "integer",
        FieldKind::Real => "real",
        FieldKind::Boolean => "boolean",
        FieldKind::Timestamp => "timestamp",
        FieldKind::Enum => "enum",
        FieldKind::Array(_) => "array",
        FieldKind::Object => "object",
    }
}

fn ops_for(kind: &FieldKind) -> Vec<&'static str> {
    match kind {
        FieldKind::Integer | FieldKind::Real | FieldKind::Timestamp => vec![
            "eq", "neq", "gt", "gte", "lt", "lte", "in", "notIn", "between", "isNull", "isNotNull",
        ],
        FieldKind::String | FieldKind::Enum => vec![
            "eq", "neq", "like", "in", "notIn", "isNull", "isNotNull",
        ],
        FieldKind::Boolean => vec!["eq", "neq", "isNull", "isNotNull"],
        FieldKind::Array(_) | FieldKind::Object => vec!["isNull", "isNotNull"],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archetype::{RelationOpts, RelationSpec};
    use crate::component::ComponentDescriptor;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

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
                    .field(FieldDescriptor::new("age", FieldKind::Integer)),
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

    fn descriptor() -> ArchetypeDescriptor {
        ArchetypeDescriptor::new("User")
            .component("name", "Name")
            .component("profile", "Profile")
            .union("contact", vec!["EmailContact".into(), "PhoneContact".into()])
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
            )
    }

    #[test]
    fn single_value_components_unwrap_to_primitives() {
        let schema = compile_schema(&descriptor(), &registry()).unwrap();
        assert_eq!(
            schema.field("name").unwrap().shape,
            FieldShape::Primitive(FieldKind::String)
        );
        assert!(matches!(
            schema.field("profile").unwrap().shape,
            FieldShape::Object(_)
        ));
    }

    #[test]
    fn unions_and_relations_compile() {
        let schema = compile_schema(&descriptor(), &registry()).unwrap();
        assert_eq!(
            schema.field("contact").unwrap().shape,
            FieldShape::Union {
                variants: vec!["EmailContact".into(), "PhoneContact".into()]
            }
        );
        assert_eq!(
            schema.field("organization").unwrap().shape,
            FieldShape::Reference { plural: false }
        );
        assert!(schema.field("organization").unwrap().nullable);
    }

    #[test]
    fn unknown_component_fails_compilation() {
        let bad = ArchetypeDescriptor::new("Broken").component("x", "Missing");
        assert!(compile_schema(&bad, &registry()).is_err());
    }

    #[test]
    fn component_object_validation() {
        let registry = registry();
        let profile = registry.component_by_name("Profile").unwrap();
        let ok = serde_json::json!({"bio": "hi", "age": 3});
        validate_component_object("Profile", &profile.fields, &ok, true).unwrap();

        let unknown = serde_json::json!({"bio": "hi", "age": 3, "extra": 1});
        assert!(validate_component_object("Profile", &profile.fields, &unknown, true).is_err());
        validate_component_object("Profile", &profile.fields, &unknown, false).unwrap();

        let missing_required = serde_json::json!({"bio": "hi"});
        assert!(
            validate_component_object("Profile", &profile.fields, &missing_required, true)
                .is_err()
        );

        let wrong_kind = serde_json::json!({"bio": "hi", "age": "three"});
        assert!(validate_component_object("Profile", &profile.fields, &wrong_kind, true).is_err());
    }

    #[test]
    fn kind_checks() {
        assert!(check_kind(&serde_json::json!("x"), &FieldKind::String));
        assert!(check_kind(&serde_json::json!(3), &FieldKind::Integer));
        assert!(!check_kind(&serde_json::json!(3.5), &FieldKind::Integer));
        assert!(check_kind(&serde_json::json!(3.5), &FieldKind::Real));
        assert!(check_kind(
            &serde_json::json!(["a", "b"]),
            &FieldKind::Array(Box::new(FieldKind::String))
        ));
        assert!(!check_kind(
            &serde_json::json!(["a", 2]),
            &FieldKind::Array(Box::new(FieldKind::String))
        ));
    }

    #[test]
    fn filter_schema_lists_primitive_and_nested_fields() {
        let schema = compile_schema(&descriptor(), &registry()).unwrap();
        let fs = filter_schema(&schema);
        assert_eq!(fs["archetype"], "User");
        assert_eq!(fs["fields"]["name"]["kind"], "string");
        assert_eq!(fs["fields"]["profile"]["age"]["kind"], "integer");
        assert!(fs["fields"].get("organization").is_none());
    }
}
