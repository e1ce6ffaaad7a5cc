use crate::error::StoreError;
use crate::model::{FieldGraph, LocalField, Record, Related, Relation, RelationGraph};
use crate::store::EntityStore;
use futures::future::{try_join_all, BoxFuture, FutureExt};
use log::debug;
use serde_json::{Map, Value};

/// Renders `record` as plain data following `graph`.
///
/// Sibling relations, the members of a to-many relation, and the daughter
/// relations of each member are resolved concurrently. Relations that were not
/// materialized by the query plan are loaded lazily through the store.
pub async fn serialize<S: EntityStore + ?Sized>(
    store: &S,
    record: &Record,
    graph: &FieldGraph,
) -> Result<Map<String, Value>, StoreError> {
    let roots: Vec<&Relation> = graph.relations.roots().collect();
    render(store, record, &graph.local_fields, roots, &graph.relations).await
}

pub async fn serialize_all<S: EntityStore + ?Sized>(
    store: &S,
    records: &[Record],
    graph: &FieldGraph,
) -> Result<Vec<Map<String, Value>>, StoreError> {
    try_join_all(records.iter().map(|r| serialize(store, r, graph))).await
}

fn render<'a, S: EntityStore + ?Sized>(
    store: &'a S,
    record: &'a Record,
    fields: &'a [LocalField],
    relations: Vec<&'a Relation>,
    graph: &'a RelationGraph,
) -> BoxFuture<'a, Result<Map<String, Value>, StoreError>> {
    async move {
        let mut out = Map::new();
        for field in fields {
            out.insert(field.name().to_string(), record.get(field.name()).to_json());
        }

        let rendered = try_join_all(
            relations
                .into_iter()
                .map(|relation| render_relation(store, record, relation, graph)),
        )
        .await?;
        out.extend(rendered);
        Ok(out)
    }
    .boxed()
}

async fn render_relation<'a, S: EntityStore + ?Sized>(
    store: &'a S,
    record: &'a Record,
    relation: &'a Relation,
    graph: &'a RelationGraph,
) -> Result<(String, Value), StoreError> {
    let loaded;
    let related = match record.related(relation.attribute()) {
        Some(related) => related,
        None => {
            debug!(
                "Relation '{}' not materialized on '{}', loading it",
                relation.qualified_name(),
                record.entity
            );
            let rows = store
                .load_related(relation.source(), relation.attribute(), &[record])
                .await?;
            loaded = Related::from_records(
                relation.cardinality(),
                rows.into_iter().map(|(_, r)| r).collect(),
            );
            &loaded
        }
    };

    let daughters: Vec<&Relation> = graph.daughters(relation).collect();
    let value = match related {
        Related::One(None) => Value::Null,
        Related::One(Some(member)) => Value::Object(
            render(store, member, relation.nested_fields(), daughters, graph).await?,
        ),
        Related::Many(members) => {
            let rendered = try_join_all(members.iter().map(|member| {
                render(store, member, relation.nested_fields(), daughters.clone(), graph)
            }))
            .await?;
            Value::Array(rendered.into_iter().map(Value::Object).collect())
        }
    };
    Ok((relation.attribute().to_string(), value))
}
