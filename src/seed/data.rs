use crate::error::SchemaError;
use crate::model::{
    foreign_key_column, EntityDef, EntityRegistry, FieldDef, FieldSpecNode, FieldValue, Key,
    OnDelete, PendingOperation, RelationDef, RelationMode, ResourceDef, ScalarType, WriteTarget,
    WriteUnit,
};
use crate::store::traits::EntityStore;
use anyhow::{anyhow, Context, Result};
use log::info;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Entity descriptors of the demo library: publishers, authors with an
/// optional profile, books and tags.
pub fn build_library_registry() -> Result<EntityRegistry, SchemaError> {
    EntityRegistry::new(vec![
        EntityDef::new(
            "publisher",
            vec![
                FieldDef::primary_key("id", ScalarType::Integer),
                FieldDef::scalar("name", ScalarType::Text).required(),
                FieldDef::scalar("country", ScalarType::Text),
                FieldDef::relation("authors", RelationDef::reverse_many("author", "publisher")),
            ],
        )?,
        EntityDef::new(
            "author",
            vec![
                FieldDef::primary_key("id", ScalarType::Integer),
                FieldDef::scalar("name", ScalarType::Text).required(),
                FieldDef::scalar("email", ScalarType::Text),
                FieldDef::scalar("born", ScalarType::Date),
                FieldDef::relation(
                    "publisher",
                    RelationDef::foreign_key("publisher").on_delete(OnDelete::SetNull),
                ),
                FieldDef::relation("books", RelationDef::reverse_many("book", "author")),
                FieldDef::relation("profile", RelationDef::reverse_one("profile", "author")),
            ],
        )?,
        EntityDef::new(
            "profile",
            vec![
                FieldDef::primary_key("id", ScalarType::Integer),
                FieldDef::scalar("bio", ScalarType::Text),
                FieldDef::scalar("website", ScalarType::Text),
                FieldDef::relation(
                    "author",
                    RelationDef::foreign_key("author").on_delete(OnDelete::Cascade),
                )
                .required(),
            ],
        )?,
        EntityDef::new(
            "book",
            vec![
                FieldDef::primary_key("id", ScalarType::Integer),
                FieldDef::scalar("title", ScalarType::Text).required(),
                FieldDef::scalar("pages", ScalarType::Integer),
                FieldDef::scalar("price", ScalarType::Float),
                FieldDef::scalar("published", ScalarType::Timestamp),
                FieldDef::scalar("in_print", ScalarType::Boolean),
                FieldDef::scalar("metadata", ScalarType::Json),
                FieldDef::relation("author", RelationDef::foreign_key("author")).required(),
                FieldDef::relation("tags", RelationDef::many_to_many("tag")),
            ],
        )?,
        EntityDef::new(
            "tag",
            vec![
                FieldDef::primary_key("id", ScalarType::Integer),
                FieldDef::scalar("label", ScalarType::Text).required(),
                FieldDef::relation("books", RelationDef::reverse_many("book", "tags")),
            ],
        )?,
    ])
}

/// The demo registry. Panics if the built-in descriptors are inconsistent.
pub fn library_registry() -> EntityRegistry {
    build_library_registry().expect("built-in library schema is valid")
}

/// REST resources served by the demo server.
pub fn library_resources() -> Vec<ResourceDef> {
    use FieldSpecNode as F;

    vec![
        ResourceDef::new("publishers", "publisher"),
        ResourceDef::new("authors", "author")
            .fields(vec![
                F::All,
                F::relation("publisher", vec![F::All]),
                F::relation(
                    "books",
                    vec![
                        F::scalar("id"),
                        F::scalar("title"),
                        F::relation("tags", vec![F::scalar("label")]),
                    ],
                ),
            ])
            .private(["email"]),
        ResourceDef::new("profiles", "profile")
            .fields(vec![F::All, F::relation("author", vec![F::scalar("id"), F::scalar("name")])])
            .nonupdatable(["author"]),
        ResourceDef::new("books", "book").fields(vec![
            F::All,
            F::relation("author", vec![F::scalar("id"), F::scalar("name")]),
            F::relation("tags", vec![F::scalar("id"), F::scalar("label")]),
        ]),
        ResourceDef::new("tags", "tag"),
    ]
}

/// Typed column values for one seed row. Owning to-one relations are given by
/// attribute name and stored under their foreign key column.
fn row(def: &EntityDef, registry: &EntityRegistry, data: Value) -> Result<BTreeMap<String, FieldValue>> {
    let Value::Object(data) = data else {
        return Err(anyhow!("seed row for '{}' must be an object", def.name()));
    };
    let mut values = BTreeMap::new();
    for (name, raw) in data {
        let field = def
            .field(&name)
            .with_context(|| format!("'{}' has no field '{}'", def.name(), name))?;
        let (column, scalar) = match (field.scalar_type(), field.as_relation()) {
            (Some(scalar), _) => (name.clone(), scalar),
            (None, Some(relation)) => (
                foreign_key_column(&name),
                registry.get(&relation.target)?.key_type(),
            ),
            (None, None) => continue,
        };
        let value = scalar
            .from_json(&raw)
            .with_context(|| format!("invalid seed value {} for '{}.{}'", raw, def.name(), name))?;
        values.insert(column, value);
    }
    Ok(values)
}

fn insert(
    registry: &EntityRegistry,
    entity: &str,
    data: Value,
    operations: Vec<PendingOperation>,
) -> Result<WriteUnit> {
    let def = registry.get(entity)?;
    Ok(WriteUnit {
        entity: entity.to_string(),
        target: WriteTarget::Insert,
        values: row(def, registry, data)?,
        operations,
    })
}

fn tag_link(keys: &[i64]) -> PendingOperation {
    PendingOperation::Link {
        attribute: "tags".to_string(),
        target: "tag".to_string(),
        mode: RelationMode::Set,
        keys: keys.iter().copied().map(Key::Int).collect(),
    }
}

/// Loads the demo library through the store's regular write path.
pub async fn load_seed_data<S: EntityStore + ?Sized>(store: &S) -> Result<()> {
    let registry = store.registry();

    let publishers = [
        json!({"id": 1, "name": "Chilton Books", "country": "United States"}),
        json!({"id": 2, "name": "Ace Books", "country": "United States"}),
        json!({"id": 3, "name": "Macmillan", "country": "United Kingdom"}),
    ];
    let authors = [
        json!({"id": 1, "name": "Frank Herbert", "email": "frank@arrakis.example", "born": "1920-10-08", "publisher": 1}),
        json!({"id": 2, "name": "Ursula K. Le Guin", "email": "ursula@anarres.example", "born": "1929-10-21", "publisher": 2}),
        json!({"id": 3, "name": "Iain M. Banks", "born": "1954-02-16", "publisher": 3}),
        json!({"id": 4, "name": "Octavia Butler", "born": "1947-06-22"}),
    ];
    let profiles = [json!({"id": 1, "bio": "Author of Dune", "website": "https://dune.example", "author": 1})];
    let tags = [
        json!({"id": 1, "label": "classic"}),
        json!({"id": 2, "label": "space opera"}),
        json!({"id": 3, "label": "anthropology"}),
    ];
    let books = [
        (json!({"id": 1, "title": "Dune", "pages": 412, "price": 9.99, "published": "1965-08-01", "in_print": true, "metadata": {"series": "Dune", "volume": 1}, "author": 1}), vec![1, 2]),
        (json!({"id": 2, "title": "Dune Messiah", "pages": 256, "price": 8.99, "published": "1969-10-15", "in_print": true, "metadata": {"series": "Dune", "volume": 2}, "author": 1}), vec![2]),
        (json!({"id": 3, "title": "The Left Hand of Darkness", "pages": 304, "price": 10.5, "published": "1969-03-01", "in_print": true, "author": 2}), vec![1, 3]),
        (json!({"id": 4, "title": "The Dispossessed", "pages": 387, "published": "1974-05-01", "in_print": false, "author": 2}), vec![3]),
        (json!({"id": 5, "title": "Consider Phlebas", "pages": 471, "published": "1987-04-23", "in_print": true, "author": 3}), vec![2]),
    ];

    let mut units = Vec::new();
    for data in publishers {
        units.push(insert(registry, "publisher", data, vec![])?);
    }
    for data in authors {
        units.push(insert(registry, "author", data, vec![])?);
    }
    for data in profiles {
        units.push(insert(registry, "profile", data, vec![])?);
    }
    for data in tags {
        units.push(insert(registry, "tag", data, vec![])?);
    }
    for (data, tag_keys) in books {
        units.push(insert(registry, "book", data, vec![tag_link(&tag_keys)])?);
    }

    let count = units.len();
    for unit in units {
        let entity = unit.entity.clone();
        store
            .commit(unit)
            .await
            .with_context(|| format!("Failed to seed '{}'", entity))?;
    }
    info!("Seeded {} library rows", count);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::crud::Resource;

    #[test]
    fn test_library_schema_is_valid() {
        let registry = build_library_registry().unwrap();
        assert_eq!(registry.entities().count(), 5);
        assert_eq!(
            registry.link_tables(),
            vec![("book_tags".to_string(), "book", "tag")]
        );
    }

    #[test]
    fn test_library_resources_compile() {
        let registry = library_registry();
        for def in library_resources() {
            assert!(Resource::compile(def, &registry).is_ok());
        }
    }

    #[test]
    fn test_seed_rows_map_relations_to_foreign_keys() {
        let registry = library_registry();
        let values = row(
            registry.get("book").unwrap(),
            &registry,
            json!({"title": "Dune", "author": 1, "published": "1965-08-01"}),
        )
        .unwrap();
        assert_eq!(values["author_id"], FieldValue::Int(1));
        assert!(matches!(values["published"], FieldValue::Timestamp(_)));

        assert!(row(registry.get("book").unwrap(), &registry, json!({"pages": "many"})).is_err());
    }
}
