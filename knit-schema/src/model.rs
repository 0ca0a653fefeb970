//! Static relation model: entity types, their keys and their relations.
//!
//! Every entity type is described once by a [`ModelDescriptor`] and registered
//! in a [`ModelRegistry`]. Relation targets are resolved when the registry is
//! built, so later lookups never fail on a dangling model name.
//!
//! ```rust
//! use knit_schema::model::{ModelDescriptor, ModelRegistry, RelationDescriptor, ThroughTable};
//!
//! let registry = ModelRegistry::builder()
//!     .model(
//!         ModelDescriptor::new("Person", "persons")
//!             .relation(RelationDescriptor::has_many("pets", "Animal").related(["owner_id"]))
//!             .relation(
//!                 RelationDescriptor::many_to_many(
//!                     "movies",
//!                     "Movie",
//!                     ThroughTable::new("persons_movies", ["person_id"], ["movie_id"]),
//!                 ),
//!             ),
//!     )
//!     .model(ModelDescriptor::new("Animal", "animals"))
//!     .model(ModelDescriptor::new("Movie", "movies"))
//!     .build()
//!     .unwrap();
//!
//! let pets = registry.relation("Person", "pets").unwrap();
//! assert_eq!(pets.owner_columns, vec!["id"]);
//! assert!(pets.kind.is_many());
//! ```

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::error::{SchemaError, SchemaResult};

/// Kind of relation between two entity types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationKind {
    /// The owner holds the foreign key (e.g. Animal belongs to Person).
    BelongsToOne,
    /// The related row holds the foreign key, at most one row.
    HasOne,
    /// The related rows hold the foreign key.
    HasMany,
    /// Rows are linked through a join table.
    ManyToMany,
}

impl RelationKind {
    /// Check if this relation resolves to a list of rows.
    pub fn is_many(&self) -> bool {
        matches!(self, Self::HasMany | Self::ManyToMany)
    }

    /// Check if this relation resolves to a single row.
    pub fn is_one(&self) -> bool {
        matches!(self, Self::BelongsToOne | Self::HasOne)
    }

    /// Check if the owner row owns the related rows (they hold its key).
    pub fn is_owning(&self) -> bool {
        matches!(self, Self::HasOne | Self::HasMany)
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BelongsToOne => write!(f, "n:1"),
            Self::HasOne => write!(f, "1:1"),
            Self::HasMany => write!(f, "1:n"),
            Self::ManyToMany => write!(f, "m:n"),
        }
    }
}

/// Join table of a many-to-many relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThroughTable {
    /// Name of the join table.
    pub table: SmolStr,
    /// Join-table columns referencing the owner's `owner_columns`.
    pub owner_columns: Vec<SmolStr>,
    /// Join-table columns referencing the related model's `related_columns`.
    pub related_columns: Vec<SmolStr>,
    /// Extra join-table columns exposed on the related rows.
    pub extra: Vec<SmolStr>,
}

impl ThroughTable {
    /// Create a new join table description.
    pub fn new(
        table: impl Into<SmolStr>,
        owner_columns: impl IntoIterator<Item = impl Into<SmolStr>>,
        related_columns: impl IntoIterator<Item = impl Into<SmolStr>>,
    ) -> Self {
        Self {
            table: table.into(),
            owner_columns: owner_columns.into_iter().map(Into::into).collect(),
            related_columns: related_columns.into_iter().map(Into::into).collect(),
            extra: Vec::new(),
        }
    }

    /// Expose extra join-table columns on related rows.
    pub fn extra(mut self, columns: impl IntoIterator<Item = impl Into<SmolStr>>) -> Self {
        self.extra = columns.into_iter().map(Into::into).collect();
        self
    }
}

/// Description of one relation of an entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDescriptor {
    /// Relation name (the field it is attached under).
    pub name: SmolStr,
    /// Kind of relation.
    pub kind: RelationKind,
    /// Model declaring the relation. Filled in on registration.
    pub owner_model: SmolStr,
    /// Model on the other end.
    pub related_model: SmolStr,
    /// Owner columns taking part in the join.
    pub owner_columns: Vec<SmolStr>,
    /// Related columns matched against `owner_columns` (or the join table).
    pub related_columns: Vec<SmolStr>,
    /// Join table for many-to-many relations.
    pub through: Option<ThroughTable>,
    /// Modifier applied to every query of this relation.
    pub default_modifier: Option<SmolStr>,
}

impl RelationDescriptor {
    fn new(name: impl Into<SmolStr>, kind: RelationKind, related_model: impl Into<SmolStr>) -> Self {
        Self {
            name: name.into(),
            kind,
            owner_model: SmolStr::default(),
            related_model: related_model.into(),
            owner_columns: Vec::new(),
            related_columns: Vec::new(),
            through: None,
            default_modifier: None,
        }
    }

    /// The owner holds the foreign key in `owner_columns`.
    ///
    /// `related_columns` default to the related model's id columns.
    pub fn belongs_to_one(name: impl Into<SmolStr>, related_model: impl Into<SmolStr>) -> Self {
        Self::new(name, RelationKind::BelongsToOne, related_model)
    }

    /// The related row holds the foreign key in `related_columns`.
    ///
    /// `owner_columns` default to the owner's id columns.
    pub fn has_one(name: impl Into<SmolStr>, related_model: impl Into<SmolStr>) -> Self {
        Self::new(name, RelationKind::HasOne, related_model)
    }

    /// Related rows hold the foreign key in `related_columns`.
    pub fn has_many(name: impl Into<SmolStr>, related_model: impl Into<SmolStr>) -> Self {
        Self::new(name, RelationKind::HasMany, related_model)
    }

    /// Rows linked through `through`.
    ///
    /// Both column lists default to the id columns of their model.
    pub fn many_to_many(
        name: impl Into<SmolStr>,
        related_model: impl Into<SmolStr>,
        through: ThroughTable,
    ) -> Self {
        let mut rel = Self::new(name, RelationKind::ManyToMany, related_model);
        rel.through = Some(through);
        rel
    }

    /// Set the owner columns.
    pub fn owner(mut self, columns: impl IntoIterator<Item = impl Into<SmolStr>>) -> Self {
        self.owner_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Set the related columns.
    pub fn related(mut self, columns: impl IntoIterator<Item = impl Into<SmolStr>>) -> Self {
        self.related_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Set the default modifier.
    pub fn default_modifier(mut self, modifier: impl Into<SmolStr>) -> Self {
        self.default_modifier = Some(modifier.into());
        self
    }

    /// Whether the relation points back to the model declaring it.
    pub fn is_self_referential(&self) -> bool {
        self.owner_model == self.related_model
    }
}

/// Description of an entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Model name.
    pub name: SmolStr,
    /// Backing table.
    pub table: SmolStr,
    /// Primary key columns.
    pub id_columns: Vec<SmolStr>,
    /// Relations keyed by name, in declaration order.
    pub relations: IndexMap<SmolStr, RelationDescriptor>,
}

impl ModelDescriptor {
    /// Create a model with an `id` primary key.
    pub fn new(name: impl Into<SmolStr>, table: impl Into<SmolStr>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            id_columns: vec![SmolStr::new_static("id")],
            relations: IndexMap::new(),
        }
    }

    /// Set the primary key columns.
    pub fn id(mut self, columns: impl IntoIterator<Item = impl Into<SmolStr>>) -> Self {
        self.id_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Declare a relation.
    pub fn relation(mut self, mut relation: RelationDescriptor) -> Self {
        relation.owner_model = self.name.clone();
        self.relations.insert(relation.name.clone(), relation);
        self
    }

    /// Look up a relation by name.
    pub fn get_relation(&self, name: &str) -> Option<&RelationDescriptor> {
        self.relations.get(name)
    }

    /// Check whether `field` names a relation.
    pub fn is_relation(&self, field: &str) -> bool {
        self.relations.contains_key(field)
    }
}

/// Immutable set of model descriptors with resolved relations.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: IndexMap<SmolStr, ModelDescriptor>,
}

impl ModelRegistry {
    /// Start building a registry.
    pub fn builder() -> ModelRegistryBuilder {
        ModelRegistryBuilder::default()
    }

    /// Get a model by name.
    pub fn model(&self, name: &str) -> SchemaResult<&ModelDescriptor> {
        self.models.get(name).ok_or_else(|| SchemaError::UnknownModel {
            name: name.to_string(),
        })
    }

    /// Get a relation of a model.
    pub fn relation(&self, model: &str, relation: &str) -> SchemaResult<&RelationDescriptor> {
        self.model(model)?
            .get_relation(relation)
            .ok_or_else(|| SchemaError::relation_not_found(model, relation))
    }

    /// Iterate over all models.
    pub fn models(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.models.values()
    }

    /// Number of registered models.
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// Collects model descriptors and validates them in [`build`](Self::build).
#[derive(Debug, Default)]
pub struct ModelRegistryBuilder {
    models: Vec<ModelDescriptor>,
}

impl ModelRegistryBuilder {
    /// Add a model.
    pub fn model(mut self, model: ModelDescriptor) -> Self {
        self.models.push(model);
        self
    }

    /// Resolve relation defaults and validate every relation.
    pub fn build(self) -> SchemaResult<ModelRegistry> {
        let mut models: IndexMap<SmolStr, ModelDescriptor> = IndexMap::new();
        for model in self.models {
            if model.id_columns.is_empty() {
                return Err(SchemaError::MissingId {
                    model: model.name.to_string(),
                });
            }
            if models.contains_key(&model.name) {
                return Err(SchemaError::duplicate("model", model.name.as_str()));
            }
            models.insert(model.name.clone(), model);
        }

        let id_columns: IndexMap<SmolStr, Vec<SmolStr>> = models
            .iter()
            .map(|(name, m)| (name.clone(), m.id_columns.clone()))
            .collect();

        for model in models.values_mut() {
            let owner_ids = &id_columns[&model.name];
            for relation in model.relations.values_mut() {
                let related_ids = id_columns.get(&relation.related_model).ok_or_else(|| {
                    SchemaError::invalid_relation(
                        model.name.as_str(),
                        relation.name.as_str(),
                        format!("related model `{}` is not registered", relation.related_model),
                    )
                })?;
                resolve_relation(relation, owner_ids, related_ids)?;
            }
        }

        tracing::debug!(models = models.len(), "model registry built");
        Ok(ModelRegistry { models })
    }
}

fn resolve_relation(
    relation: &mut RelationDescriptor,
    owner_ids: &[SmolStr],
    related_ids: &[SmolStr],
) -> SchemaResult<()> {
    let invalid = |relation: &RelationDescriptor, message: &str| {
        SchemaError::invalid_relation(
            relation.owner_model.as_str(),
            relation.name.as_str(),
            message,
        )
    };

    match relation.kind {
        RelationKind::BelongsToOne => {
            if relation.owner_columns.is_empty() {
                return Err(invalid(relation, "belongs-to-one relations need owner (foreign key) columns"));
            }
            if relation.related_columns.is_empty() {
                relation.related_columns = related_ids.to_vec();
            }
        }
        RelationKind::HasOne | RelationKind::HasMany => {
            if relation.related_columns.is_empty() {
                return Err(invalid(relation, "has-one/has-many relations need related (foreign key) columns"));
            }
            if relation.owner_columns.is_empty() {
                relation.owner_columns = owner_ids.to_vec();
            }
        }
        RelationKind::ManyToMany => {
            if relation.owner_columns.is_empty() {
                relation.owner_columns = owner_ids.to_vec();
            }
            if relation.related_columns.is_empty() {
                relation.related_columns = related_ids.to_vec();
            }
        }
    }

    if relation.owner_columns.len() != relation.related_columns.len() {
        return Err(invalid(relation, "owner and related column counts differ"));
    }

    match (&relation.through, relation.kind) {
        (None, RelationKind::ManyToMany) => {
            return Err(invalid(relation, "many-to-many relations need a through table"));
        }
        (Some(_), kind) if kind != RelationKind::ManyToMany => {
            return Err(invalid(relation, "only many-to-many relations take a through table"));
        }
        (Some(through), _) => {
            if through.owner_columns.len() != relation.owner_columns.len()
                || through.related_columns.len() != relation.related_columns.len()
            {
                return Err(invalid(relation, "through table column counts do not match the relation"));
            }
        }
        (None, _) => {}
    }

    Ok(())
}
