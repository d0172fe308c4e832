//! Mapped forms: where an entity and its properties live in a key-value store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::property::Property;

/// Per-property mapping onto a native record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyValueMapping {
    /// Record key; `None` means "use the property name".
    pub key: Option<String>,
    pub nullable: bool,
    /// Maintain a secondary property-value index for equality lookups.
    pub index: bool,
    /// Backend-specific extras, opaque to the engine.
    pub attributes: BTreeMap<String, String>,
}

impl Default for KeyValueMapping {
    fn default() -> Self {
        Self {
            key: None,
            nullable: true,
            index: false,
            attributes: BTreeMap::new(),
        }
    }
}

/// Per-entity mapping: the family (bucket, table, collection) records live in.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FamilyMapping {
    pub family: Option<String>,
    pub keyspace: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

impl FamilyMapping {
    pub fn named(family: impl Into<String>) -> Self {
        Self {
            family: Some(family.into()),
            ..Self::default()
        }
    }
}

/// Resolves declared mappings into the mapped forms an entity is built with.
pub trait MappingFactory: Send + Sync {
    /// Complete the entity-level mapping for `entity`.
    fn create_mapped_form(&self, entity: &str, declared: &FamilyMapping) -> FamilyMapping;

    /// Complete the property-level mapping for `property` of `entity`.
    fn create_property_mapping(&self, entity: &str, property: &Property) -> KeyValueMapping;
}

/// Default factory: family defaults to the entity name, record keys to the
/// property name, and an optional keyspace is stamped onto every family.
#[derive(Clone, Debug, Default)]
pub struct KeyValueMappingFactory {
    keyspace: Option<String>,
}

impl KeyValueMappingFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keyspace(keyspace: impl Into<String>) -> Self {
        Self {
            keyspace: Some(keyspace.into()),
        }
    }
}

impl MappingFactory for KeyValueMappingFactory {
    fn create_mapped_form(&self, entity: &str, declared: &FamilyMapping) -> FamilyMapping {
        FamilyMapping {
            family: Some(declared.family.clone().unwrap_or_else(|| entity.to_string())),
            keyspace: declared.keyspace.clone().or_else(|| self.keyspace.clone()),
            attributes: declared.attributes.clone(),
        }
    }

    fn create_property_mapping(&self, _entity: &str, property: &Property) -> KeyValueMapping {
        let mut mapping = property.mapping.clone();
        if mapping.key.is_none() {
            mapping.key = Some(property.name.clone());
        }
        mapping
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::PropertyKind;
    use kvmap_types::ValueType;

    #[test]
    fn factory_fills_defaults() {
        let factory = KeyValueMappingFactory::with_keyspace("app");
        let form = factory.create_mapped_form("test.Author", &FamilyMapping::default());
        assert_eq!(form.family.as_deref(), Some("test.Author"));
        assert_eq!(form.keyspace.as_deref(), Some("app"));

        let declared = FamilyMapping::named("authors");
        assert_eq!(
            factory
                .create_mapped_form("test.Author", &declared)
                .family
                .as_deref(),
            Some("authors")
        );
    }

    #[test]
    fn property_key_defaults_to_name() {
        let factory = KeyValueMappingFactory::new();
        let p = Property::new("name", PropertyKind::Simple(ValueType::Text));
        let mapping = factory.create_property_mapping("test.Author", &p);
        assert_eq!(mapping.key.as_deref(), Some("name"));
        assert!(mapping.nullable);
        assert!(!mapping.index);
    }

    #[test]
    fn mapping_deserializes_with_defaults() {
        let mapping: KeyValueMapping = serde_json::from_str(r#"{"index": true}"#).unwrap();
        assert!(mapping.index);
        assert!(mapping.nullable);
        assert!(mapping.key.is_none());
    }
}
