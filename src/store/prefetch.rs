use crate::error::StoreError;
use crate::model::{EntityRegistry, Key, Record, Related};
use crate::store::EntityStore;
use itertools::Itertools;
use log::debug;
use std::collections::HashMap;

/// Entity reached by following `path` from `root`.
pub fn entity_at<'a>(
    registry: &'a EntityRegistry,
    root: &'a str,
    path: &[&str],
) -> Result<&'a str, StoreError> {
    let mut entity = root;
    for attribute in path {
        entity = &registry.relation(entity, attribute)?.target;
    }
    Ok(entity)
}

/// Records materialized at `path` below `records`.
pub fn records_at<'a>(records: &'a [Record], path: &[&str]) -> Vec<&'a Record> {
    let Some((head, rest)) = path.split_first() else {
        return records.iter().collect();
    };
    records
        .iter()
        .flat_map(|record| match record.related(head) {
            Some(Related::One(Some(member))) => records_at(std::slice::from_ref(&**member), rest),
            Some(Related::Many(members)) => records_at(members, rest),
            _ => Vec::new(),
        })
        .collect()
}

pub(crate) fn visit_mut(records: &mut [Record], path: &[&str], visit: &mut impl FnMut(&mut Record)) {
    let Some((head, rest)) = path.split_first() else {
        records.iter_mut().for_each(visit);
        return;
    };
    for record in records.iter_mut() {
        match record.related.get_mut(*head) {
            Some(Related::One(Some(member))) => {
                visit_mut(std::slice::from_mut(&mut **member), rest, visit)
            }
            Some(Related::Many(members)) => visit_mut(members, rest, visit),
            _ => {}
        }
    }
}

/// Loads every batch path with one `load_related` call and stitches the
/// results onto the parents by primary key. Paths must be given parents first.
pub async fn prefetch<S: EntityStore + ?Sized>(
    store: &S,
    entity: &str,
    records: &mut [Record],
    paths: &[&str],
) -> Result<(), StoreError> {
    let registry = store.registry();
    for path in paths {
        let segments: Vec<&str> = path.split('.').collect();
        let Some((attribute, parent_path)) = segments.split_last() else {
            continue;
        };
        let source = entity_at(registry, entity, parent_path)?;
        let relation = registry.relation(source, attribute)?;
        let source_def = registry.get(source)?;

        let parents = records_at(records, parent_path);
        if parents.is_empty() {
            continue;
        }
        let loaded = store.load_related(source, attribute, &parents).await?;
        debug!("Prefetched {} rows for '{}'", loaded.len(), path);

        let grouped: HashMap<Key, Vec<Record>> = loaded.into_iter().into_group_map();
        let cardinality = relation.cardinality;
        visit_mut(records, parent_path, &mut |parent| {
            let members = match parent.key(source_def) {
                Some(key) => grouped.get(&key).cloned().unwrap_or_default(),
                None => Vec::new(),
            };
            parent
                .related
                .insert(attribute.to_string(), Related::from_records(cardinality, members));
        });
    }
    Ok(())
}
