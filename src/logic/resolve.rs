use crate::error::FieldError;
use crate::model::{
    all_fields, EntityDef, EntityRegistry, FieldGraph, FieldSpecNode, GraphBuilder, LocalField,
    RelationId, ALL_FIELDS,
};
use log::debug;
use std::collections::{BTreeSet, HashSet};

/// Turns a declarative field specification into a frozen [`FieldGraph`].
pub struct FieldResolver<'a> {
    registry: &'a EntityRegistry,
    private_fields: &'a BTreeSet<String>,
}

impl<'a> FieldResolver<'a> {
    pub fn new(registry: &'a EntityRegistry, private_fields: &'a BTreeSet<String>) -> Self {
        Self {
            registry,
            private_fields,
        }
    }

    pub fn resolve(&self, spec: &[FieldSpecNode], entity: &str) -> Result<FieldGraph, FieldError> {
        let root = self.registry.get(entity)?;
        let mut builder = GraphBuilder::default();
        let local_fields = self.resolve_level(&mut builder, spec, root, None, "")?;
        let relations = builder.finish();
        debug!(
            "Resolved field graph for '{}': {} local fields, {} relations",
            entity,
            local_fields.len(),
            relations.len()
        );
        Ok(FieldGraph {
            entity: entity.to_string(),
            local_fields,
            relations,
        })
    }

    fn is_private(&self, path: &str) -> bool {
        self.private_fields.contains(path)
    }

    fn resolve_level(
        &self,
        builder: &mut GraphBuilder,
        spec: &[FieldSpecNode],
        entity: &EntityDef,
        parent: Option<RelationId>,
        prefix: &str,
    ) -> Result<Vec<LocalField>, FieldError> {
        let mut local = Vec::new();
        let mut seen = HashSet::new();
        // Same relation named twice in one set: children are concatenated
        let mut relations: Vec<(&str, Vec<FieldSpecNode>)> = Vec::new();

        for node in spec {
            match node {
                FieldSpecNode::All => {
                    for field in entity.scalar_fields() {
                        if self.is_private(&qualify(prefix, &field.name)) {
                            continue;
                        }
                        if seen.insert(field.name.clone()) {
                            local.push(LocalField::new(entity, &field.name)?);
                        }
                    }
                }
                FieldSpecNode::Scalar(name) => {
                    let path = qualify(prefix, name);
                    if self.is_private(&path) {
                        return Err(FieldError::FieldIsPrivated(path));
                    }
                    let field = entity
                        .field(name)
                        .ok_or_else(|| FieldError::FieldNotInModel {
                            field: name.clone(),
                            entity: entity.name().to_string(),
                        })?;
                    if field.is_relation() {
                        return Err(FieldError::InvalidFieldFormat(path));
                    }
                    if seen.insert(name.clone()) {
                        local.push(LocalField::new(entity, name)?);
                    }
                }
                FieldSpecNode::Relation(name, children) => {
                    match relations.iter_mut().find(|(n, _)| *n == name.as_str()) {
                        Some((_, merged)) => merged.extend(children.iter().cloned()),
                        None => relations.push((name.as_str(), children.clone())),
                    }
                }
            }
        }

        for (name, children) in relations {
            let path = qualify(prefix, name);
            if self.is_private(&path) {
                return Err(FieldError::FieldIsPrivated(path));
            }
            let field = entity
                .field(name)
                .ok_or_else(|| FieldError::FieldNotInModel {
                    field: name.to_string(),
                    entity: entity.name().to_string(),
                })?;
            let relation = field
                .as_relation()
                .ok_or_else(|| FieldError::InvalidRelationField(name.to_string()))?;
            let target = self.registry.get(&relation.target)?;

            let id = builder.open(parent, entity, name, relation.cardinality, target);
            let nested = self.resolve_level(builder, &children, target, Some(id), &path)?;
            builder.close(id, nested);
        }

        Ok(local)
    }
}

fn qualify(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

pub fn resolve_field_graph(
    registry: &EntityRegistry,
    spec: &[FieldSpecNode],
    entity: &str,
    private_fields: &BTreeSet<String>,
) -> Result<FieldGraph, FieldError> {
    FieldResolver::new(registry, private_fields).resolve(spec, entity)
}

/// Parses the `onlyFields` shorthand: `id,name,books.title,publisher.__all__`.
///
/// Only one level of relation is reachable through the shorthand.
pub fn resolve_only_fields(text: &str) -> Result<Option<Vec<FieldSpecNode>>, FieldError> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    if text == ALL_FIELDS {
        return Ok(Some(all_fields()));
    }

    let mut nodes = Vec::new();
    for term in text.split(',').map(str::trim) {
        let parts: Vec<&str> = term.split('.').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => nodes.push(FieldSpecNode::scalar(name)),
            [relation, field] if !relation.is_empty() && !field.is_empty() => {
                let child = FieldSpecNode::scalar(field);
                let existing = nodes.iter_mut().find_map(|node| match node {
                    FieldSpecNode::Relation(name, children) if name == relation => Some(children),
                    _ => None,
                });
                match existing {
                    Some(children) => children.push(child),
                    None => nodes.push(FieldSpecNode::relation(relation, vec![child])),
                }
            }
            [_] | [_, _] => return Err(FieldError::InvalidFieldFormat(term.to_string())),
            _ => return Err(FieldError::MultipleLevelRelation(term.to_string())),
        }
    }
    Ok(Some(nodes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::plan::build_query_plan;
    use crate::model::{Cardinality, FetchMode};
    use crate::seed::library_registry;

    fn names(graph: &FieldGraph) -> Vec<&str> {
        graph.local_fields.iter().map(|f| f.name()).collect()
    }

    fn spec(value: serde_json::Value) -> Vec<FieldSpecNode> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_all_expands_to_every_scalar_field() {
        let registry = library_registry();
        let graph = resolve_field_graph(&registry, &all_fields(), "book", &BTreeSet::new()).unwrap();
        let expected: Vec<&str> = registry
            .get("book")
            .unwrap()
            .scalar_fields()
            .map(|f| f.name.as_str())
            .collect();
        assert_eq!(names(&graph), expected);
        assert!(graph.relations.is_empty());
    }

    #[test]
    fn test_all_skips_private_fields() {
        let registry = library_registry();
        let private: BTreeSet<String> = ["email".to_string()].into();
        let graph = resolve_field_graph(&registry, &all_fields(), "author", &private).unwrap();
        assert!(!names(&graph).contains(&"email"));
        assert!(names(&graph).contains(&"name"));
    }

    #[test]
    fn test_scalar_errors() {
        let registry = library_registry();
        let private: BTreeSet<String> = ["email".to_string()].into();
        let resolve = |s: serde_json::Value| resolve_field_graph(&registry, &spec(s), "author", &private);

        assert_eq!(
            resolve(serde_json::json!(["nickname"])),
            Err(FieldError::FieldNotInModel {
                field: "nickname".into(),
                entity: "author".into()
            })
        );
        assert_eq!(
            resolve(serde_json::json!(["email"])),
            Err(FieldError::FieldIsPrivated("email".into()))
        );
        assert_eq!(
            resolve(serde_json::json!(["books"])),
            Err(FieldError::InvalidFieldFormat("books".into()))
        );
        assert_eq!(
            resolve(serde_json::json!([{"name": ["id"]}])),
            Err(FieldError::InvalidRelationField("name".into()))
        );
    }

    #[test]
    fn test_nested_private_path_is_qualified() {
        let registry = library_registry();
        let private: BTreeSet<String> = ["author.email".to_string()].into();
        let result = resolve_field_graph(
            &registry,
            &spec(serde_json::json!(["title", {"author": ["name", "email"]}])),
            "book",
            &private,
        );
        assert_eq!(result, Err(FieldError::FieldIsPrivated("author.email".into())));
    }

    #[test]
    fn test_relations_are_classified_and_nested() {
        let registry = library_registry();
        let graph = resolve_field_graph(
            &registry,
            &spec(serde_json::json!([
                "id",
                {"author": ["name", {"publisher": ["name"]}]},
                {"tags": ["label", {"books": ["title", {"author": ["name"]}]}]}
            ])),
            "book",
            &BTreeSet::new(),
        )
        .unwrap();

        let author = graph.relations.root("author").unwrap();
        assert_eq!(author.cardinality(), Cardinality::ToOneOwning);
        assert_eq!(author.fetch_mode(), FetchMode::Join);
        let publisher = graph.relations.daughters(author).next().unwrap();
        assert_eq!(publisher.qualified_name(), "author.publisher");
        assert_eq!(publisher.fetch_mode(), FetchMode::Join);

        let tags = graph.relations.root("tags").unwrap();
        assert_eq!(tags.fetch_mode(), FetchMode::Batch);
        assert_eq!(tags.nested_fields()[0].name(), "label");

        // to-one below a to-many inherits batch fetching
        let nested_author = graph
            .relations
            .iter()
            .find(|r| r.qualified_name() == "tags.books.author")
            .unwrap();
        assert_eq!(nested_author.cardinality(), Cardinality::ToOneOwning);
        assert_eq!(nested_author.fetch_mode(), FetchMode::Batch);
    }

    #[test]
    fn test_duplicate_relations_are_merged() {
        let registry = library_registry();
        let graph = resolve_field_graph(
            &registry,
            &spec(serde_json::json!([
                "title",
                "title",
                {"author": ["name"]},
                {"author": ["id", "name"]}
            ])),
            "book",
            &BTreeSet::new(),
        )
        .unwrap();
        assert_eq!(names(&graph), vec!["title"]);
        assert_eq!(graph.relations.len(), 1);
        let nested: Vec<&str> = graph
            .relations
            .root("author")
            .unwrap()
            .nested_fields()
            .iter()
            .map(|f| f.name())
            .collect();
        assert_eq!(nested, vec!["name", "id"]);
    }

    #[test]
    fn test_resolution_is_stable() {
        let registry = library_registry();
        let fields = spec(serde_json::json!([{"tags": ["label"]}, {"author": ["name"]}]));
        let first = resolve_field_graph(&registry, &fields, "book", &BTreeSet::new()).unwrap();
        let second = resolve_field_graph(&registry, &fields, "book", &BTreeSet::new()).unwrap();
        assert_eq!(build_query_plan(&first), build_query_plan(&second));
        assert_eq!(
            first.relations.join_fetch_paths(),
            second.relations.join_fetch_paths()
        );
    }

    #[test]
    fn test_only_fields_shorthand() {
        assert_eq!(resolve_only_fields("  "), Ok(None));
        assert_eq!(resolve_only_fields("__all__"), Ok(Some(all_fields())));
        assert_eq!(
            resolve_only_fields("id,author.name,title,author.__all__"),
            Ok(Some(vec![
                FieldSpecNode::scalar("id"),
                FieldSpecNode::relation(
                    "author",
                    vec![FieldSpecNode::scalar("name"), FieldSpecNode::All]
                ),
                FieldSpecNode::scalar("title"),
            ]))
        );
        assert_eq!(
            resolve_only_fields("author.publisher.name"),
            Err(FieldError::MultipleLevelRelation("author.publisher.name".into()))
        );
        assert_eq!(
            resolve_only_fields("id,,title"),
            Err(FieldError::InvalidFieldFormat("".into()))
        );
    }
}
