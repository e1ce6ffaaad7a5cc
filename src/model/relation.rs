use crate::error::FieldError;
use crate::model::{Cardinality, EntityDef, FieldKind, ScalarType};
use std::collections::BTreeSet;

/// A scalar attribute exposed by a field specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalField {
    name: String,
    entity: String,
    scalar: ScalarType,
    primary_key: bool,
    required: bool,
}

impl LocalField {
    pub fn new(entity: &EntityDef, name: &str) -> Result<Self, FieldError> {
        let field = entity
            .field(name)
            .ok_or_else(|| FieldError::FieldNotInModel {
                field: name.to_string(),
                entity: entity.name().to_string(),
            })?;
        match field.kind {
            FieldKind::Scalar(scalar) => Ok(Self {
                name: field.name.clone(),
                entity: entity.name().to_string(),
                scalar,
                primary_key: field.primary_key,
                required: field.required,
            }),
            FieldKind::Relation(_) => Err(FieldError::NotAScalarField {
                field: name.to_string(),
                entity: entity.name().to_string(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn scalar_type(&self) -> ScalarType {
        self.scalar
    }

    pub fn is_primary_key(&self) -> bool {
        self.primary_key
    }

    pub fn is_required(&self) -> bool {
        self.required
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelationId(usize);

/// How the store should materialize a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchMode {
    /// Same query as the owner, no row multiplication
    Join,
    /// Separate query keyed by parent ids
    Batch,
}

/// One traversal step of a field specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    id: RelationId,
    source: String,
    target: String,
    target_key: String,
    target_key_type: ScalarType,
    attribute: String,
    cardinality: Cardinality,
    fetch_mode: FetchMode,
    qualified_name: String,
    parent: Option<RelationId>,
    daughters: Vec<RelationId>,
    nested_fields: Vec<LocalField>,
}

impl Relation {
    pub fn id(&self) -> RelationId {
        self.id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Primary key name of the target entity.
    pub fn target_key(&self) -> &str {
        &self.target_key
    }

    pub fn target_key_type(&self) -> ScalarType {
        self.target_key_type
    }

    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    pub fn cardinality(&self) -> Cardinality {
        self.cardinality
    }

    pub fn is_to_many(&self) -> bool {
        self.cardinality.is_to_many()
    }

    pub fn fetch_mode(&self) -> FetchMode {
        self.fetch_mode
    }

    /// Dot-separated path from the root entity, used as the join/prefetch key.
    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    pub fn parent(&self) -> Option<RelationId> {
        self.parent
    }

    pub fn daughters(&self) -> &[RelationId] {
        &self.daughters
    }

    pub fn nested_fields(&self) -> &[LocalField] {
        &self.nested_fields
    }
}

/// Frozen tree of relations resolved from a field specification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationGraph {
    nodes: Vec<Relation>,
    roots: Vec<RelationId>,
}

impl RelationGraph {
    pub fn get(&self, id: RelationId) -> &Relation {
        &self.nodes[id.0]
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Relation> {
        self.nodes.iter()
    }

    /// Relations without a parent.
    pub fn roots(&self) -> impl Iterator<Item = &Relation> {
        self.roots.iter().map(|id| self.get(*id))
    }

    pub fn daughters<'a>(&'a self, relation: &'a Relation) -> impl Iterator<Item = &'a Relation> {
        relation.daughters.iter().map(|id| self.get(*id))
    }

    pub fn root(&self, attribute: &str) -> Option<&Relation> {
        self.roots().find(|r| r.attribute == attribute)
    }

    pub fn by_fetch_mode(&self, mode: FetchMode) -> impl Iterator<Item = &Relation> {
        self.nodes.iter().filter(move |r| r.fetch_mode == mode)
    }

    pub fn join_fetch_paths(&self) -> BTreeSet<String> {
        self.by_fetch_mode(FetchMode::Join)
            .map(|r| r.qualified_name.clone())
            .collect()
    }

    pub fn batch_fetch_paths(&self) -> BTreeSet<String> {
        self.by_fetch_mode(FetchMode::Batch)
            .map(|r| r.qualified_name.clone())
            .collect()
    }
}

/// Mutable arena used while resolving; `finish` freezes it.
#[derive(Debug, Default)]
pub(crate) struct GraphBuilder {
    nodes: Vec<Relation>,
    roots: Vec<RelationId>,
}

impl GraphBuilder {
    /// Allocates a relation under `parent`. Anything below a to-many relation
    /// is batch fetched, whatever its own cardinality.
    pub(crate) fn open(
        &mut self,
        parent: Option<RelationId>,
        source: &EntityDef,
        attribute: &str,
        cardinality: Cardinality,
        target: &EntityDef,
    ) -> RelationId {
        let id = RelationId(self.nodes.len());
        let (qualified_name, inherited_batch) = match parent {
            Some(pid) => {
                let p = &self.nodes[pid.0];
                (
                    format!("{}.{}", p.qualified_name, attribute),
                    p.fetch_mode == FetchMode::Batch,
                )
            }
            None => (attribute.to_string(), false),
        };
        let fetch_mode = if inherited_batch || cardinality.is_to_many() {
            FetchMode::Batch
        } else {
            FetchMode::Join
        };

        self.nodes.push(Relation {
            id,
            source: source.name().to_string(),
            target: target.name().to_string(),
            target_key: target.primary_key().name.clone(),
            target_key_type: target.key_type(),
            attribute: attribute.to_string(),
            cardinality,
            fetch_mode,
            qualified_name,
            parent,
            daughters: Vec::new(),
            nested_fields: Vec::new(),
        });
        match parent {
            Some(pid) => self.nodes[pid.0].daughters.push(id),
            None => self.roots.push(id),
        }
        id
    }

    pub(crate) fn close(&mut self, id: RelationId, nested_fields: Vec<LocalField>) {
        self.nodes[id.0].nested_fields = nested_fields;
    }

    pub(crate) fn finish(self) -> RelationGraph {
        RelationGraph {
            nodes: self.nodes,
            roots: self.roots,
        }
    }
}

/// Result of resolving a field specification against a root entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldGraph {
    pub entity: String,
    pub local_fields: Vec<LocalField>,
    pub relations: RelationGraph,
}

impl FieldGraph {
    pub fn local_field(&self, name: &str) -> Option<&LocalField> {
        self.local_fields.iter().find(|f| f.name() == name)
    }
}
