//! Component metadata and the component trait.
//!
//! A component is a typed record attached to exactly one entity. Its shape is
//! declared once through a [`ComponentDescriptor`]; the data itself travels as
//! a JSON document and is stored in a per-type partition.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Stable identifier of a component class: the lowercase hex SHA-256 of the
/// class name. Identical across processes and runs, write-once per name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeId(String);

impl TypeId {
    /// Computes the type id for a component class name.
    pub fn of(name: &str) -> Self {
        let digest = Sha256::digest(name.as_bytes());
        let mut hex = String::with_capacity(64);
        for byte in digest {
            use fmt::Write;
            write!(hex, "{:02x}", byte).expect("writing to a String cannot fail");
        }
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wraps an already-computed 64-hex-char id (e.g. read back from a row).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Scalar or structured kind of a component field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    String,
    Integer,
    Real,
    Boolean,
    Timestamp,
    /// String- or integer-coded enumeration.
    Enum,
    /// Ordered sequence of one element kind.
    Array(Box<FieldKind>),
    /// Nested document.
    Object,
}

/// Declared metadata for one component field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub key: String,
    pub kind: FieldKind,
    pub nullable: bool,
    pub indexed: bool,
    /// Allowed values when `kind` is [`FieldKind::Enum`].
    pub enum_values: Vec<serde_json::Value>,
}

impl FieldDescriptor {
    pub fn new(key: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            key: key.into(),
            kind,
            nullable: false,
            indexed: false,
            enum_values: Vec::new(),
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn with_enum_values(mut self, values: Vec<serde_json::Value>) -> Self {
        self.enum_values = values;
        self
    }
}

/// Physical index kind over a JSONB field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    /// `jsonb_path_ops` GIN for containment queries.
    Gin,
    /// B-Tree over the text projection, for equality and text ranges.
    BTree,
    Hash,
    /// Partial functional index over a numeric cast, for numeric ranges.
    Numeric,
    /// Multi-field B-Tree.
    Composite,
}

/// Declared index over one or more fields of a component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub fields: Vec<String>,
    pub kind: IndexKind,
}

impl IndexSpec {
    pub fn single(field: impl Into<String>, kind: IndexKind) -> Self {
        Self {
            fields: vec![field.into()],
            kind,
        }
    }

    pub fn composite(fields: Vec<String>) -> Self {
        Self {
            fields,
            kind: IndexKind::Composite,
        }
    }
}

/// Complete declared shape of a component class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentDescriptor {
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
    pub indexes: Vec<IndexSpec>,
}

impl ComponentDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            indexes: Vec::new(),
        }
    }

    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    pub fn index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn type_id(&self) -> TypeId {
        TypeId::of(&self.name)
    }

    pub fn field_descriptor(&self, key: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.key == key)
    }
}

/// A component class that can be attached to entities.
///
/// Implementations declare their name and field/index metadata in one place;
/// startup walks those declarations and provisions storage for each.
pub trait Component: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Class name. Must be unique across the application; the type id is
    /// derived from it and is stable forever.
    const NAME: &'static str;

    /// Field and index metadata for this class.
    fn descriptor() -> ComponentDescriptor;

    /// Type id of this class.
    fn type_id() -> TypeId {
        TypeId::of(Self::NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn type_id_is_deterministic_sha256() {
        // Precomputed: echo -n "Position" | sha256sum
        let id = TypeId::of("Position");
        assert_eq!(id.as_str().len(), 64);
        assert_eq!(id, TypeId::of("Position"));
        assert_ne!(id, TypeId::of("position"));
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert!(id.as_str().chars().all(|c| !c.is_ascii_uppercase()));
    }

    #[test]
    fn known_digest() {
        // sha256("Tag")
        assert_eq!(
            TypeId::of("Tag").as_str(),
            "1503916a2ab2b0fd6768d3455fd8f2d9aa3b31333a8507dadcad983704a975d7"
        );
    }

    #[test]
    fn descriptor_builder() {
        let desc = ComponentDescriptor::new("Score")
            .field(FieldDescriptor::new("value", FieldKind::Real).indexed())
            .index(IndexSpec::single("value", IndexKind::Numeric));
        assert_eq!(desc.fields.len(), 1);
        assert_eq!(desc.indexes[0].kind, IndexKind::Numeric);
        assert_eq!(desc.type_id(), TypeId::of("Score"));
        assert!(desc.field_descriptor("value").is_some());
        assert!(desc.field_descriptor("missing").is_none());
    }
}
