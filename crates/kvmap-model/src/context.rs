//! The mapping context: registry of persistent entities.
//!
//! Entities live in an arena (`Vec<Arc<Entity>>`) with a name index.
//! Associations refer to their target by entity name, so there are no
//! reference cycles between entities or back to the context.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, warn};

use crate::entity::Entity;
use crate::error::{ModelError, ModelResult};
use crate::mapping::{KeyValueMappingFactory, MappingFactory};
use crate::syntax::{DeclaredSyntaxStrategy, MappingSyntaxStrategy};

#[derive(Default)]
struct Registry {
    entities: Vec<Arc<Entity>>,
    by_name: HashMap<String, usize>,
}

/// Process-scoped registry of persistent entities.
///
/// Population is expected to happen at startup; afterwards the registry is
/// read-mostly and safe to share across threads.
pub struct MappingContext {
    strategy: Arc<dyn MappingSyntaxStrategy>,
    factory: Arc<dyn MappingFactory>,
    registry: RwLock<Registry>,
}

impl MappingContext {
    pub fn new(
        strategy: Arc<dyn MappingSyntaxStrategy>,
        factory: Arc<dyn MappingFactory>,
    ) -> Self {
        Self {
            strategy,
            factory,
            registry: RwLock::new(Registry::default()),
        }
    }

    /// A context over `declarations` with the default mapping factory, with
    /// every declared entity added and the associations validated.
    pub fn from_declarations(declarations: DeclaredSyntaxStrategy) -> ModelResult<Self> {
        let context = Self::new(
            Arc::new(declarations),
            Arc::new(KeyValueMappingFactory::new()),
        );
        context.add_declared_entities()?;
        context.validate()?;
        Ok(context)
    }

    pub fn syntax_strategy(&self) -> &Arc<dyn MappingSyntaxStrategy> {
        &self.strategy
    }

    pub fn mapping_factory(&self) -> &Arc<dyn MappingFactory> {
        &self.factory
    }

    fn read(&self) -> ModelResult<RwLockReadGuard<'_, Registry>> {
        self.registry
            .read()
            .map_err(|e| ModelError::LockPoisoned(e.to_string()))
    }

    fn write(&self) -> ModelResult<RwLockWriteGuard<'_, Registry>> {
        self.registry
            .write()
            .map_err(|e| ModelError::LockPoisoned(e.to_string()))
    }

    /// Build, initialize, and register the entity for `name`.
    ///
    /// Re-adding a name replaces the existing entity in place: its arena
    /// index and position in [`persistent_entities`](Self::persistent_entities)
    /// stay the same.
    pub fn add_persistent_entity(&self, name: &str) -> ModelResult<Arc<Entity>> {
        if !self.strategy.is_persistent(name) {
            return Err(ModelError::NotDeclared {
                name: name.to_string(),
            });
        }

        let entity = Arc::new(Entity::new(name));
        entity.initialize(self.strategy.as_ref(), self.factory.as_ref())?;

        let mut registry = self.write()?;
        match registry.by_name.get(name).copied() {
            Some(index) => {
                debug!(entity = %name, index, "replacing persistent entity");
                registry.entities[index] = Arc::clone(&entity);
            }
            None => {
                let index = registry.entities.len();
                registry.entities.push(Arc::clone(&entity));
                registry.by_name.insert(name.to_string(), index);
                debug!(entity = %name, index, "added persistent entity");
            }
        }
        Ok(entity)
    }

    /// Add every type the syntax strategy declares, in declaration order.
    pub fn add_declared_entities(&self) -> ModelResult<Vec<Arc<Entity>>> {
        self.strategy
            .declared_types()
            .iter()
            .map(|name| self.add_persistent_entity(name))
            .collect()
    }

    /// The entity registered under `name`, or `None`.
    pub fn persistent_entity(&self, name: &str) -> ModelResult<Option<Arc<Entity>>> {
        let registry = self.read()?;
        Ok(registry
            .by_name
            .get(name)
            .map(|&i| Arc::clone(&registry.entities[i])))
    }

    /// Like [`persistent_entity`](Self::persistent_entity) but absence is an error.
    pub fn require_entity(&self, name: &str) -> ModelResult<Arc<Entity>> {
        self.persistent_entity(name)?
            .ok_or_else(|| ModelError::UnknownEntity {
                name: name.to_string(),
            })
    }

    /// Stable arena index of `name`.
    pub fn entity_index(&self, name: &str) -> ModelResult<Option<usize>> {
        Ok(self.read()?.by_name.get(name).copied())
    }

    pub fn entity_at(&self, index: usize) -> ModelResult<Option<Arc<Entity>>> {
        Ok(self.read()?.entities.get(index).cloned())
    }

    /// All entities in insertion order.
    pub fn persistent_entities(&self) -> ModelResult<Vec<Arc<Entity>>> {
        Ok(self.read()?.entities.clone())
    }

    pub fn is_persistent_entity(&self, name: &str) -> bool {
        self.read()
            .map(|r| r.by_name.contains_key(name))
            .unwrap_or(false)
    }

    /// Resolve the target entity of association `property` on `entity`.
    pub fn associated_entity(&self, entity: &Entity, property: &str) -> ModelResult<Arc<Entity>> {
        let prop = entity.require_property(property)?;
        let association = prop
            .association()
            .ok_or_else(|| ModelError::NotAnAssociation {
                entity: entity.name().to_string(),
                property: property.to_string(),
            })?;
        self.persistent_entity(&association.target)?
            .ok_or_else(|| ModelError::UnknownAssociationTarget {
                entity: entity.name().to_string(),
                property: property.to_string(),
                target: association.target.clone(),
            })
    }

    /// Check every association: its target must be registered, and a
    /// `mapped_by` name must exist on the target.
    pub fn validate(&self) -> ModelResult<()> {
        for entity in self.persistent_entities()? {
            for prop in entity.persistent_properties() {
                let Some(association) = prop.association() else {
                    continue;
                };
                let target = self.associated_entity(&entity, &prop.name)?;
                if let Some(mapped_by) = &association.mapped_by {
                    if target.property(mapped_by).is_none() {
                        warn!(
                            entity = %entity.name(),
                            property = %prop.name,
                            mapped_by = %mapped_by,
                            "inverse association names a missing property"
                        );
                        return Err(ModelError::UnknownInverse {
                            entity: entity.name().to_string(),
                            property: prop.name.clone(),
                            target: association.target.clone(),
                            mapped_by: mapped_by.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for MappingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .persistent_entities()
            .map(|es| es.iter().map(|e| e.name().to_string()).collect())
            .unwrap_or_default();
        f.debug_struct("MappingContext")
            .field("entities", &names)
            .finish()
    }
}
