use crate::error::SchemaError;
use crate::model::ScalarType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// How many related entities a relation attribute reaches, and which side stores the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    /// Foreign key or one-to-one stored on the source
    ToOneOwning,
    /// Reverse side of a one-to-one
    ToOneOwned,
    /// Many-to-many stored in a link table owned by the source
    ToManyOwning,
    /// Reverse side of a foreign key or of a many-to-many
    ToManyOwned,
}

impl Cardinality {
    pub fn is_to_many(self) -> bool {
        matches!(self, Cardinality::ToManyOwning | Cardinality::ToManyOwned)
    }

    pub fn is_to_one(self) -> bool {
        !self.is_to_many()
    }

    pub fn is_owning(self) -> bool {
        matches!(self, Cardinality::ToOneOwning | Cardinality::ToManyOwning)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDelete {
    #[default]
    Restrict,
    SetNull,
    Cascade,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDef {
    pub target: String,
    pub cardinality: Cardinality,
    /// Owning attribute on the target, required for owned relations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapped_by: Option<String>,
    /// Link table of an owning many-to-many, defaults to `<source>_<attribute>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub through: Option<String>,
    #[serde(default)]
    pub on_delete: OnDelete,
}

impl RelationDef {
    fn new(target: &str, cardinality: Cardinality) -> Self {
        Self {
            target: target.to_string(),
            cardinality,
            mapped_by: None,
            through: None,
            on_delete: OnDelete::default(),
        }
    }

    pub fn foreign_key(target: &str) -> Self {
        Self::new(target, Cardinality::ToOneOwning)
    }

    pub fn reverse_one(target: &str, mapped_by: &str) -> Self {
        Self {
            mapped_by: Some(mapped_by.to_string()),
            ..Self::new(target, Cardinality::ToOneOwned)
        }
    }

    pub fn many_to_many(target: &str) -> Self {
        Self::new(target, Cardinality::ToManyOwning)
    }

    pub fn reverse_many(target: &str, mapped_by: &str) -> Self {
        Self {
            mapped_by: Some(mapped_by.to_string()),
            ..Self::new(target, Cardinality::ToManyOwned)
        }
    }

    pub fn on_delete(mut self, on_delete: OnDelete) -> Self {
        self.on_delete = on_delete;
        self
    }

    pub fn through(mut self, table: &str) -> Self {
        self.through = Some(table.to_string());
        self
    }

    pub fn link_table(&self, source: &str, attribute: &str) -> String {
        self.through
            .clone()
            .unwrap_or_else(|| format!("{}_{}", source, attribute))
    }
}

/// Column holding the foreign key of an owning to-one relation.
pub fn foreign_key_column(attribute: &str) -> String {
    format!("{}_id", attribute)
}

pub const LINK_SOURCE_COLUMN: &str = "source_id";
pub const LINK_TARGET_COLUMN: &str = "target_id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Scalar(ScalarType),
    Relation(RelationDef),
}

/// Serialized form of a field: `{"name": "title", "type": "text"}` or
/// `{"name": "author", "relation": {...}}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
struct FieldDecl {
    name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    scalar: Option<ScalarType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    relation: Option<RelationDef>,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    primary_key: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "FieldDecl", into = "FieldDecl")]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
    pub primary_key: bool,
}

impl TryFrom<FieldDecl> for FieldDef {
    type Error = SchemaError;

    fn try_from(decl: FieldDecl) -> Result<Self, Self::Error> {
        let kind = match (decl.scalar, decl.relation) {
            (Some(scalar), None) => FieldKind::Scalar(scalar),
            (None, Some(relation)) => FieldKind::Relation(relation),
            _ => {
                return Err(SchemaError::AmbiguousField {
                    entity: String::new(),
                    field: decl.name,
                })
            }
        };
        Ok(Self {
            name: decl.name,
            kind,
            required: decl.required,
            primary_key: decl.primary_key,
        })
    }
}

impl From<FieldDef> for FieldDecl {
    fn from(def: FieldDef) -> Self {
        let (scalar, relation) = match def.kind {
            FieldKind::Scalar(scalar) => (Some(scalar), None),
            FieldKind::Relation(relation) => (None, Some(relation)),
        };
        Self {
            name: def.name,
            scalar,
            relation,
            required: def.required,
            primary_key: def.primary_key,
        }
    }
}

impl FieldDef {
    pub fn primary_key(name: &str, scalar: ScalarType) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::Scalar(scalar),
            required: false,
            primary_key: true,
        }
    }

    pub fn scalar(name: &str, scalar: ScalarType) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::Scalar(scalar),
            required: false,
            primary_key: false,
        }
    }

    pub fn relation(name: &str, relation: RelationDef) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::Relation(relation),
            required: false,
            primary_key: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn scalar_type(&self) -> Option<ScalarType> {
        match &self.kind {
            FieldKind::Scalar(scalar) => Some(*scalar),
            FieldKind::Relation(_) => None,
        }
    }

    pub fn as_relation(&self) -> Option<&RelationDef> {
        match &self.kind {
            FieldKind::Relation(relation) => Some(relation),
            FieldKind::Scalar(_) => None,
        }
    }

    pub fn is_relation(&self) -> bool {
        self.as_relation().is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct EntityDecl {
    name: String,
    fields: Vec<FieldDef>,
}

/// Descriptor table of one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "EntityDecl")]
pub struct EntityDef {
    name: String,
    fields: Vec<FieldDef>,
    pk: usize,
}

impl TryFrom<EntityDecl> for EntityDef {
    type Error = SchemaError;

    fn try_from(decl: EntityDecl) -> Result<Self, Self::Error> {
        EntityDef::new(&decl.name, decl.fields)
    }
}

impl EntityDef {
    pub fn new(name: &str, fields: Vec<FieldDef>) -> Result<Self, SchemaError> {
        let mut seen = HashSet::new();
        for field in &fields {
            if !seen.insert(field.name.as_str()) {
                return Err(SchemaError::DuplicateField {
                    entity: name.to_string(),
                    field: field.name.clone(),
                });
            }
        }

        let mut keys = fields.iter().enumerate().filter(|(_, f)| f.primary_key);
        let pk = match (keys.next(), keys.next()) {
            (Some((index, _)), None) => index,
            (None, _) => return Err(SchemaError::MissingPrimaryKey(name.to_string())),
            (Some(_), Some(_)) => return Err(SchemaError::MultiplePrimaryKeys(name.to_string())),
        };
        let key_field = &fields[pk];
        if !key_field.scalar_type().is_some_and(ScalarType::is_key_type) {
            return Err(SchemaError::InvalidPrimaryKey {
                entity: name.to_string(),
                field: key_field.name.clone(),
            });
        }

        Ok(Self {
            name: name.to_string(),
            fields,
            pk,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn primary_key(&self) -> &FieldDef {
        &self.fields[self.pk]
    }

    pub fn key_type(&self) -> ScalarType {
        self.primary_key()
            .scalar_type()
            .unwrap_or(ScalarType::Integer)
    }

    pub fn scalar_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| !f.is_relation())
    }

    pub fn relations(&self) -> impl Iterator<Item = (&FieldDef, &RelationDef)> {
        self.fields
            .iter()
            .filter_map(|f| f.as_relation().map(|rel| (f, rel)))
    }

    /// Fields that must be supplied on creation: required non-key scalars and
    /// required owning to-one relations.
    pub fn required_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| {
            f.required
                && !f.primary_key
                && f.as_relation()
                    .map_or(true, |rel| rel.cardinality == Cardinality::ToOneOwning)
        })
    }
}

/// Physical shape of one relation step from a source row to target rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Join {
    /// `source.<column> = target.pk`
    Forward { column: String },
    /// `target.<column> = source.pk`
    Reverse { column: String },
    /// `link.<source_column> = source.pk AND link.<target_column> = target.pk`
    Link {
        table: String,
        source_column: &'static str,
        target_column: &'static str,
    },
}

/// Immutable registry of every entity descriptor, built once at start-up.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    entities: BTreeMap<String, EntityDef>,
}

impl EntityRegistry {
    pub fn new(entities: Vec<EntityDef>) -> Result<Self, SchemaError> {
        let mut registry = Self::default();
        for entity in entities {
            registry.entities.insert(entity.name.clone(), entity);
        }
        registry.validate()?;
        Ok(registry)
    }

    fn validate(&self) -> Result<(), SchemaError> {
        for entity in self.entities.values() {
            for (field, relation) in entity.relations() {
                let target = self.entities.get(&relation.target).ok_or_else(|| {
                    SchemaError::UnknownTarget {
                        entity: entity.name.clone(),
                        field: field.name.clone(),
                        target: relation.target.clone(),
                    }
                })?;
                if relation.cardinality.is_owning() {
                    continue;
                }
                let mapped_by =
                    relation
                        .mapped_by
                        .as_deref()
                        .ok_or_else(|| SchemaError::MissingMappedBy {
                            entity: entity.name.clone(),
                            field: field.name.clone(),
                        })?;
                let owning = target.field(mapped_by).and_then(FieldDef::as_relation);
                let valid = match (relation.cardinality, owning) {
                    (Cardinality::ToOneOwned, Some(back)) => {
                        back.cardinality == Cardinality::ToOneOwning && back.target == entity.name
                    }
                    (Cardinality::ToManyOwned, Some(back)) => {
                        back.cardinality.is_owning() && back.target == entity.name
                    }
                    _ => false,
                };
                if !valid {
                    return Err(SchemaError::InvalidMappedBy {
                        entity: entity.name.clone(),
                        field: field.name.clone(),
                        target: relation.target.clone(),
                        mapped_by: mapped_by.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn entity(&self, name: &str) -> Option<&EntityDef> {
        self.entities.get(name)
    }

    pub fn get(&self, name: &str) -> Result<&EntityDef, SchemaError> {
        self.entity(name)
            .ok_or_else(|| SchemaError::UnknownEntity(name.to_string()))
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityDef> {
        self.entities.values()
    }

    pub fn relation(&self, source: &str, attribute: &str) -> Result<&RelationDef, SchemaError> {
        self.get(source)?
            .field(attribute)
            .and_then(FieldDef::as_relation)
            .ok_or_else(|| SchemaError::UnknownTarget {
                entity: source.to_string(),
                field: attribute.to_string(),
                target: String::new(),
            })
    }

    /// Storage layout of `source.attribute`.
    pub fn join(&self, source: &str, attribute: &str) -> Result<Join, SchemaError> {
        let relation = self.relation(source, attribute)?;
        let mapped_by = relation.mapped_by.as_deref().unwrap_or_default();
        Ok(match relation.cardinality {
            Cardinality::ToOneOwning => Join::Forward {
                column: foreign_key_column(attribute),
            },
            Cardinality::ToManyOwning => Join::Link {
                table: relation.link_table(source, attribute),
                source_column: LINK_SOURCE_COLUMN,
                target_column: LINK_TARGET_COLUMN,
            },
            Cardinality::ToOneOwned | Cardinality::ToManyOwned => {
                let back = self.relation(&relation.target, mapped_by)?;
                if back.cardinality == Cardinality::ToManyOwning {
                    Join::Link {
                        table: back.link_table(&relation.target, mapped_by),
                        source_column: LINK_TARGET_COLUMN,
                        target_column: LINK_SOURCE_COLUMN,
                    }
                } else {
                    Join::Reverse {
                        column: foreign_key_column(mapped_by),
                    }
                }
            }
        })
    }

    /// Every link table with the entities on its source and target side.
    pub fn link_tables(&self) -> Vec<(String, &str, &str)> {
        self.entities
            .values()
            .flat_map(|entity| {
                entity.relations().filter_map(move |(field, relation)| {
                    (relation.cardinality == Cardinality::ToManyOwning).then(|| {
                        (
                            relation.link_table(&entity.name, &field.name),
                            entity.name.as_str(),
                            relation.target.as_str(),
                        )
                    })
                })
            })
            .collect()
    }

    /// Owning to-one relations on any entity that point at `target`.
    pub fn references_to<'a>(
        &'a self,
        target: &'a str,
    ) -> impl Iterator<Item = (&'a EntityDef, &'a FieldDef, &'a RelationDef)> + 'a {
        self.entities.values().flat_map(move |entity| {
            entity.relations().filter_map(move |(field, relation)| {
                (relation.cardinality == Cardinality::ToOneOwning && relation.target == target)
                    .then_some((entity, field, relation))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn library() -> EntityRegistry {
        EntityRegistry::new(vec![
            EntityDef::new(
                "author",
                vec![
                    FieldDef::primary_key("id", ScalarType::Integer),
                    FieldDef::scalar("name", ScalarType::Text).required(),
                    FieldDef::relation("books", RelationDef::reverse_many("book", "author")),
                ],
            )
            .unwrap(),
            EntityDef::new(
                "book",
                vec![
                    FieldDef::primary_key("id", ScalarType::Integer),
                    FieldDef::relation("author", RelationDef::foreign_key("author")).required(),
                    FieldDef::relation("tags", RelationDef::many_to_many("tag")),
                ],
            )
            .unwrap(),
            EntityDef::new(
                "tag",
                vec![
                    FieldDef::primary_key("id", ScalarType::Integer),
                    FieldDef::relation("books", RelationDef::reverse_many("book", "tags")),
                ],
            )
            .unwrap(),
        ])
        .unwrap()
    }

    #[test]
    fn test_join_layouts() {
        let registry = library();
        assert_eq!(
            registry.join("book", "author").unwrap(),
            Join::Forward {
                column: "author_id".into()
            }
        );
        assert_eq!(
            registry.join("author", "books").unwrap(),
            Join::Reverse {
                column: "author_id".into()
            }
        );
        assert_eq!(
            registry.join("tag", "books").unwrap(),
            Join::Link {
                table: "book_tags".into(),
                source_column: LINK_TARGET_COLUMN,
                target_column: LINK_SOURCE_COLUMN,
            }
        );
        assert_eq!(registry.link_tables().len(), 1);
    }

    #[test]
    fn test_required_fields_include_owning_relations() {
        let registry = library();
        let book = registry.get("book").unwrap();
        let required: Vec<_> = book.required_fields().map(|f| f.name.as_str()).collect();
        assert_eq!(required, vec!["author"]);
    }

    #[test]
    fn test_invalid_mapped_by_is_rejected() {
        let result = EntityRegistry::new(vec![
            EntityDef::new(
                "a",
                vec![
                    FieldDef::primary_key("id", ScalarType::Integer),
                    FieldDef::relation("bs", RelationDef::reverse_many("b", "missing")),
                ],
            )
            .unwrap(),
            EntityDef::new("b", vec![FieldDef::primary_key("id", ScalarType::Integer)]).unwrap(),
        ]);
        assert!(matches!(result, Err(SchemaError::InvalidMappedBy { .. })));
    }

    #[test]
    fn test_entity_deserializes_from_declaration() {
        let entity: EntityDef = serde_json::from_value(json!({
            "name": "tag",
            "fields": [
                {"name": "id", "type": "integer", "primary_key": true},
                {"name": "label", "type": "text", "required": true},
                {"name": "books", "relation": {"target": "book", "cardinality": "to_many_owned", "mapped_by": "tags"}}
            ]
        }))
        .unwrap();
        assert_eq!(entity.primary_key().name, "id");
        assert_eq!(entity.scalar_fields().count(), 2);

        let missing_key = serde_json::from_value::<EntityDef>(json!({
            "name": "x",
            "fields": [{"name": "label", "type": "text"}]
        }));
        assert!(missing_key.is_err());
    }
}
