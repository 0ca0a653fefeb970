//! Relation expression tree.

use std::borrow::Cow;
use std::fmt;

use indexmap::IndexMap;
use smol_str::SmolStr;

use crate::error::{SchemaError, SchemaResult};
use crate::model::ModelRegistry;

/// Recursion marker of a relation node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recursion {
    /// `name.^`: follow the relation until no rows remain.
    Infinite,
    /// `name.^N`: follow the relation `N` levels deep.
    Depth(u32),
}

impl Recursion {
    /// Recursion left for the next level, if any.
    pub fn decrement(self) -> Option<Recursion> {
        match self {
            Self::Infinite => Some(Self::Infinite),
            Self::Depth(n) if n > 1 => Some(Self::Depth(n - 1)),
            Self::Depth(_) => None,
        }
    }
}

/// A named modifier applied to a relation query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModifierCall {
    /// Name of the modifier in the modifier registry.
    pub name: SmolStr,
}

impl ModifierCall {
    /// Create a modifier call.
    pub fn new(name: impl Into<SmolStr>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for ModifierCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A node of a relation expression.
///
/// The root node has no relation name and an empty alias; every other node
/// names a relation of its parent's model and is keyed by its alias among its
/// siblings.
///
/// ```rust
/// use knit_schema::expr::{parse_expression, RelationExpression};
///
/// let expr = parse_expression("children.[pets, movies.actors]").unwrap();
/// let children = expr.child("children").unwrap();
/// assert_eq!(children.child_aliases().collect::<Vec<_>>(), vec!["pets", "movies"]);
/// assert_eq!(expr.to_string(), "children.[pets, movies.actors]");
///
/// let built = RelationExpression::root().with_child(
///     RelationExpression::relation("children")
///         .with_child(RelationExpression::relation("pets"))
///         .with_child(RelationExpression::relation("movies").with_child(RelationExpression::relation("actors"))),
/// );
/// assert_eq!(built, expr);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RelationExpression {
    relation_name: Option<SmolStr>,
    alias: SmolStr,
    recursion: Option<Recursion>,
    modifiers: Vec<ModifierCall>,
    children: IndexMap<SmolStr, RelationExpression>,
}

impl RelationExpression {
    /// Create an empty root expression.
    pub fn root() -> Self {
        Self::default()
    }

    /// Create a node for `relation`, aliased to its own name.
    pub fn relation(relation: impl Into<SmolStr>) -> Self {
        let relation = relation.into();
        Self {
            alias: relation.clone(),
            relation_name: Some(relation),
            ..Self::default()
        }
    }

    /// Set the alias the relation is attached under.
    pub fn with_alias(mut self, alias: impl Into<SmolStr>) -> Self {
        self.alias = alias.into();
        self
    }

    /// Set the recursion marker.
    pub fn with_recursion(mut self, recursion: Recursion) -> Self {
        self.recursion = Some(recursion);
        self
    }

    /// Append a modifier.
    pub fn with_modifier(mut self, name: impl Into<SmolStr>) -> Self {
        self.push_modifier(ModifierCall::new(name));
        self
    }

    /// Add a child, merging it into an existing child with the same alias.
    ///
    /// A child naming a different relation under a taken alias replaces it.
    pub fn with_child(mut self, child: RelationExpression) -> Self {
        match self.children.get_mut(&child.alias) {
            Some(existing) => existing.absorb(&child),
            None => {
                self.children.insert(child.alias.clone(), child);
            }
        }
        self
    }

    /// Add a child, failing if a sibling already uses its alias.
    pub fn add_child(&mut self, child: RelationExpression) -> SchemaResult<()> {
        if self.children.contains_key(&child.alias) {
            return Err(SchemaError::duplicate_alias(
                child.alias.as_str(),
                self.display_name(),
            ));
        }
        self.children.insert(child.alias.clone(), child);
        Ok(())
    }

    pub(crate) fn push_modifier(&mut self, modifier: ModifierCall) {
        if !self.modifiers.contains(&modifier) {
            self.modifiers.push(modifier);
        }
    }

    pub(crate) fn set_recursion(&mut self, recursion: Option<Recursion>) {
        self.recursion = recursion;
    }

    /// Name of the relation this node loads; `None` for the root.
    pub fn relation_name(&self) -> Option<&str> {
        self.relation_name.as_deref()
    }

    /// Alias the relation is attached under. Empty for the root.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Whether this is the root node.
    pub fn is_root(&self) -> bool {
        self.relation_name.is_none()
    }

    /// Recursion marker.
    pub fn recursion(&self) -> Option<Recursion> {
        self.recursion
    }

    /// Modifiers in application order.
    pub fn modifiers(&self) -> &[ModifierCall] {
        &self.modifiers
    }

    /// Direct children in declaration order.
    pub fn children(&self) -> impl Iterator<Item = &RelationExpression> {
        self.children.values()
    }

    /// Aliases of direct children in declaration order.
    pub fn child_aliases(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(SmolStr::as_str)
    }

    /// Look up a direct child by alias.
    pub fn child(&self, alias: &str) -> Option<&RelationExpression> {
        self.children.get(alias)
    }

    /// Whether the node has no children and no recursion.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty() && self.recursion.is_none()
    }

    /// Whether the expression requests nothing.
    pub fn is_empty(&self) -> bool {
        self.is_root() && self.children.is_empty()
    }

    /// Children to load below this node's rows.
    ///
    /// A recursive node yields a copy of itself (with one level less of
    /// recursion) after its declared children, unless a declared child
    /// already uses its alias.
    pub fn expanded_children(&self) -> Vec<Cow<'_, RelationExpression>> {
        let mut out: Vec<Cow<'_, RelationExpression>> =
            self.children.values().map(Cow::Borrowed).collect();
        if let Some(next) = self.recursion.and_then(Recursion::decrement) {
            if !self.children.contains_key(&self.alias) {
                let mut again = self.clone();
                again.recursion = Some(next);
                out.push(Cow::Owned(again));
            }
        }
        out
    }

    /// Deepest nesting of the expression; `None` when it recurses infinitely.
    pub fn max_depth(&self) -> Option<usize> {
        let mut deepest = 0;
        for child in self.children.values() {
            deepest = deepest.max(child.max_depth()?);
        }
        if self.is_root() {
            return Some(deepest);
        }
        match self.recursion {
            Some(Recursion::Infinite) => None,
            Some(Recursion::Depth(n)) => Some(n as usize + deepest),
            None => Some(1 + deepest),
        }
    }

    /// Union of two expressions.
    ///
    /// Children with the same alias are merged recursively; the deeper
    /// recursion wins. Two relations under one alias are a `DuplicateAlias`.
    pub fn merge(&self, other: &RelationExpression) -> SchemaResult<RelationExpression> {
        let mut merged = self.clone();
        merged.merge_in(other)?;
        Ok(merged)
    }

    fn merge_in(&mut self, other: &RelationExpression) -> SchemaResult<()> {
        if self.relation_name != other.relation_name {
            return Err(SchemaError::duplicate_alias(
                self.alias.as_str(),
                self.relation_name.as_deref().unwrap_or("root"),
            ));
        }
        self.recursion = match (self.recursion, other.recursion) {
            (Some(Recursion::Infinite), _) | (_, Some(Recursion::Infinite)) => {
                Some(Recursion::Infinite)
            }
            (Some(Recursion::Depth(a)), Some(Recursion::Depth(b))) => Some(Recursion::Depth(a.max(b))),
            (a, b) => a.or(b),
        };
        for modifier in &other.modifiers {
            self.push_modifier(modifier.clone());
        }
        for child in other.children.values() {
            match self.children.get_mut(&child.alias) {
                Some(existing) => existing.merge_in(child)?,
                None => {
                    self.children.insert(child.alias.clone(), child.clone());
                }
            }
        }
        Ok(())
    }

    fn absorb(&mut self, other: &RelationExpression) {
        if self.merge_in(other).is_err() {
            *self = other.clone();
        }
    }

    /// Validate relation names and recursion markers against `registry`,
    /// starting from `model`.
    pub fn bind(&self, registry: &ModelRegistry, model: &str) -> SchemaResult<()> {
        registry.model(model)?;
        for child in self.children.values() {
            child.bind_relation(registry, model)?;
        }
        Ok(())
    }

    fn bind_relation(&self, registry: &ModelRegistry, owner: &str) -> SchemaResult<()> {
        let name = self.relation_name.as_deref().unwrap_or(&self.alias);
        let relation = registry.relation(owner, name)?;
        if self.recursion.is_some() && !relation.is_self_referential() {
            return Err(SchemaError::InvalidRecursion {
                model: owner.to_string(),
                relation: name.to_string(),
                related: relation.related_model.to_string(),
            });
        }
        for child in self.children.values() {
            child.bind_relation(registry, &relation.related_model)?;
        }
        Ok(())
    }

    /// Canonical string form. Parsing it yields an equal expression.
    pub fn to_expression_string(&self) -> String {
        self.to_string()
    }

    fn display_name(&self) -> &str {
        if self.is_root() { "root" } else { &self.alias }
    }

    fn write_node(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.relation_name.as_deref().unwrap_or(&self.alias);
        if self.alias != name {
            write!(f, "{}:", self.alias)?;
        }
        f.write_str(name)?;
        if !self.modifiers.is_empty() {
            f.write_str("(")?;
            for (i, modifier) in self.modifiers.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{modifier}")?;
            }
            f.write_str(")")?;
        }
        match self.recursion {
            Some(Recursion::Infinite) => f.write_str(".^")?,
            Some(Recursion::Depth(n)) => write!(f, ".^{n}")?,
            None => {}
        }
        if !self.children.is_empty() {
            f.write_str(".")?;
            self.write_children(f)?;
        }
        Ok(())
    }

    fn write_children(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.children.len() == 1 {
            if let Some(child) = self.children.values().next() {
                return child.write_node(f);
            }
        }
        f.write_str("[")?;
        for (i, child) in self.children.values().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            child.write_node(f)?;
        }
        f.write_str("]")
    }
}

impl fmt::Display for RelationExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            if self.children.is_empty() {
                return Ok(());
            }
            self.write_children(f)
        } else {
            self.write_node(f)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelDescriptor, RelationDescriptor};
    use pretty_assertions::assert_eq;

    fn registry() -> ModelRegistry {
        ModelRegistry::builder()
            .model(
                ModelDescriptor::new("Person", "persons")
                    .relation(RelationDescriptor::has_many("children", "Person").related(["parent_id"]))
                    .relation(RelationDescriptor::has_many("pets", "Animal").related(["owner_id"])),
            )
            .model(ModelDescriptor::new("Animal", "animals"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_display_aliases_and_modifiers() {
        let expr = RelationExpression::root().with_child(
            RelationExpression::relation("pets")
                .with_alias("dogs")
                .with_modifier("onlyDogs")
                .with_modifier("orderByName"),
        );
        assert_eq!(expr.to_string(), "dogs:pets(onlyDogs, orderByName)");
    }

    #[test]
    fn test_display_root_list_and_recursion() {
        let expr = RelationExpression::root()
            .with_child(RelationExpression::relation("children").with_recursion(Recursion::Depth(3)))
            .with_child(RelationExpression::relation("pets"));
        assert_eq!(expr.to_string(), "[children.^3, pets]");
        assert_eq!(RelationExpression::root().to_string(), "");
    }

    #[test]
    fn test_expanded_children_decrements_depth() {
        let node = RelationExpression::relation("children")
            .with_recursion(Recursion::Depth(2))
            .with_child(RelationExpression::relation("pets"));

        let expanded = node.expanded_children();
        assert_eq!(expanded.len(), 2);
        assert_eq!(expanded[0].alias(), "pets");
        assert_eq!(expanded[1].alias(), "children");
        assert_eq!(expanded[1].recursion(), Some(Recursion::Depth(1)));

        let last = expanded[1].expanded_children();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].alias(), "pets");
    }

    #[test]
    fn test_expanded_children_infinite() {
        let node = RelationExpression::relation("children").with_recursion(Recursion::Infinite);
        let expanded = node.expanded_children();
        assert_eq!(expanded.len(), 1);
        assert_eq!(expanded[0].recursion(), Some(Recursion::Infinite));
    }

    #[test]
    fn test_add_child_rejects_duplicate_alias() {
        let mut root = RelationExpression::root();
        root.add_child(RelationExpression::relation("pets")).unwrap();
        let err = root
            .add_child(RelationExpression::relation("children").with_alias("pets"))
            .unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateAlias { .. }));
    }

    #[test]
    fn test_merge_unions_children() {
        let a = RelationExpression::root().with_child(
            RelationExpression::relation("children").with_child(RelationExpression::relation("pets")),
        );
        let b = RelationExpression::root()
            .with_child(
                RelationExpression::relation("children")
                    .with_recursion(Recursion::Depth(2))
                    .with_child(RelationExpression::relation("movies")),
            )
            .with_child(RelationExpression::relation("pets"));

        let merged = a.merge(&b).unwrap();
        assert_eq!(merged.to_string(), "[children.^2.[pets, movies], pets]");
    }

    #[test]
    fn test_merge_conflicting_relation_under_alias() {
        let a = RelationExpression::root().with_child(RelationExpression::relation("pets").with_alias("x"));
        let b = RelationExpression::root().with_child(RelationExpression::relation("children").with_alias("x"));
        assert!(matches!(a.merge(&b), Err(SchemaError::DuplicateAlias { .. })));
    }

    #[test]
    fn test_max_depth() {
        let expr = RelationExpression::root().with_child(
            RelationExpression::relation("children").with_child(RelationExpression::relation("pets")),
        );
        assert_eq!(expr.max_depth(), Some(2));

        let recursive = RelationExpression::root()
            .with_child(RelationExpression::relation("children").with_recursion(Recursion::Infinite));
        assert_eq!(recursive.max_depth(), None);

        assert_eq!(RelationExpression::root().max_depth(), Some(0));
    }

    #[test]
    fn test_bind() {
        let registry = registry();
        let ok = RelationExpression::root().with_child(
            RelationExpression::relation("children")
                .with_recursion(Recursion::Infinite)
                .with_child(RelationExpression::relation("pets")),
        );
        ok.bind(&registry, "Person").unwrap();

        let bad_recursion = RelationExpression::root()
            .with_child(RelationExpression::relation("pets").with_recursion(Recursion::Infinite));
        assert!(matches!(
            bad_recursion.bind(&registry, "Person"),
            Err(SchemaError::InvalidRecursion { .. })
        ));

        let unknown = RelationExpression::root().with_child(
            RelationExpression::relation("pets").with_child(RelationExpression::relation("owner")),
        );
        match unknown.bind(&registry, "Person") {
            Err(SchemaError::RelationNotFound { model, relation }) => {
                assert_eq!(model, "Animal");
                assert_eq!(relation, "owner");
            }
            other => panic!("Expected RelationNotFound, got {other:?}"),
        }
    }
}
