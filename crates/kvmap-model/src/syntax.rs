//! Discovery of entity metadata.
//!
//! A [`MappingSyntaxStrategy`] answers "what does type X declare". How it
//! finds out (annotations, conventions, generated tables) is its own
//! business; [`DeclaredSyntaxStrategy`] serves declarations built with
//! [`EntityBuilder`](crate::EntityBuilder).

use std::collections::HashMap;
use std::sync::Arc;

use crate::builder::EntityDeclaration;
use crate::error::{ModelError, ModelResult};
use crate::mapping::FamilyMapping;
use crate::object::InstanceFactory;
use crate::property::Property;

/// Source of per-type mapping metadata.
pub trait MappingSyntaxStrategy: Send + Sync {
    /// Every type the strategy knows about, in declaration order.
    fn declared_types(&self) -> Vec<String>;

    fn is_persistent(&self, name: &str) -> bool;

    /// The identity property of `name`.
    fn identity(&self, name: &str) -> ModelResult<Property>;

    /// All non-identity persistent properties of `name`, in declaration order.
    fn persistent_properties(&self, name: &str) -> ModelResult<Vec<Property>>;

    /// The declared (not yet completed) entity-level mapping.
    fn mapped_form(&self, name: &str) -> ModelResult<FamilyMapping>;

    /// How to allocate an empty instance; `None` if the type cannot be
    /// instantiated by the engine.
    fn instance_factory(&self, name: &str) -> Option<InstanceFactory>;
}

/// Serves pre-built [`EntityDeclaration`]s.
#[derive(Debug, Default)]
pub struct DeclaredSyntaxStrategy {
    order: Vec<String>,
    declarations: HashMap<String, Arc<EntityDeclaration>>,
}

impl DeclaredSyntaxStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a declaration. Replacing keeps the original position.
    pub fn declare(&mut self, declaration: EntityDeclaration) {
        let name = declaration.name.clone();
        if self
            .declarations
            .insert(name.clone(), Arc::new(declaration))
            .is_none()
        {
            self.order.push(name);
        }
    }

    /// Builder-style [`declare`](Self::declare).
    pub fn with(mut self, declaration: EntityDeclaration) -> Self {
        self.declare(declaration);
        self
    }

    fn declaration(&self, name: &str) -> ModelResult<&EntityDeclaration> {
        self.declarations
            .get(name)
            .map(Arc::as_ref)
            .ok_or_else(|| ModelError::NotDeclared {
                name: name.to_string(),
            })
    }
}

impl MappingSyntaxStrategy for DeclaredSyntaxStrategy {
    fn declared_types(&self) -> Vec<String> {
        self.order.clone()
    }

    fn is_persistent(&self, name: &str) -> bool {
        self.declarations.contains_key(name)
    }

    fn identity(&self, name: &str) -> ModelResult<Property> {
        Ok(self.declaration(name)?.identity.clone())
    }

    fn persistent_properties(&self, name: &str) -> ModelResult<Vec<Property>> {
        Ok(self.declaration(name)?.properties.clone())
    }

    fn mapped_form(&self, name: &str) -> ModelResult<FamilyMapping> {
        Ok(self.declaration(name)?.mapped_form.clone())
    }

    fn instance_factory(&self, name: &str) -> Option<InstanceFactory> {
        self.declarations.get(name).and_then(|d| d.factory.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{EntityBuilder, PropertyBuilder};
    use kvmap_types::ValueType;

    fn declaration(name: &str, extra: &str) -> EntityDeclaration {
        EntityBuilder::new(name)
            .identity(PropertyBuilder::identity("id", ValueType::Int))
            .property(PropertyBuilder::simple(extra, ValueType::Text))
            .build()
            .unwrap()
    }

    #[test]
    fn serves_declarations_in_order() {
        let strategy = DeclaredSyntaxStrategy::new()
            .with(declaration("test.B", "x"))
            .with(declaration("test.A", "y"));
        assert_eq!(strategy.declared_types(), vec!["test.B", "test.A"]);
        assert!(strategy.is_persistent("test.A"));
        assert_eq!(strategy.identity("test.A").unwrap().name, "id");
        assert_eq!(strategy.persistent_properties("test.A").unwrap()[0].name, "y");
        assert!(strategy.instance_factory("test.A").is_none());
    }

    #[test]
    fn redeclaring_keeps_position() {
        let strategy = DeclaredSyntaxStrategy::new()
            .with(declaration("test.A", "x"))
            .with(declaration("test.B", "x"))
            .with(declaration("test.A", "z"));
        assert_eq!(strategy.declared_types(), vec!["test.A", "test.B"]);
        assert_eq!(strategy.persistent_properties("test.A").unwrap()[0].name, "z");
    }

    #[test]
    fn undeclared_type_is_an_error() {
        let strategy = DeclaredSyntaxStrategy::new();
        assert!(!strategy.is_persistent("test.Nope"));
        assert!(matches!(
            strategy.identity("test.Nope"),
            Err(ModelError::NotDeclared { .. })
        ));
    }
}
