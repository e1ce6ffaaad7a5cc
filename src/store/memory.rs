use crate::error::StoreError;
use crate::logic::plan::QueryPlan;
use crate::logic::predicate::{Hop, RecordGraph};
use crate::model::{
    foreign_key_column, Cardinality, EntityDef, EntityRegistry, FieldValue, Join, Key,
    OnDelete, PendingOperation, Record, Related, RelationMode, ScalarType, WriteTarget, WriteUnit,
    LINK_SOURCE_COLUMN,
};
use crate::store::prefetch::{entity_at, prefetch, visit_mut};
use crate::store::traits::{EntityStore, Query};
use itertools::Itertools;
use log::{debug, info};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Rows keyed by primary key, plus link tables as `(source, target)` pairs.
#[derive(Debug, Clone, Default)]
struct Tables {
    rows: HashMap<String, BTreeMap<Key, Record>>,
    links: HashMap<String, BTreeSet<(Key, Key)>>,
}

/// Read-only view used to follow relations between stored rows.
struct View<'a> {
    registry: &'a EntityRegistry,
    tables: &'a Tables,
}

impl<'a> View<'a> {
    fn row(&self, entity: &str, key: &Key) -> Option<&'a Record> {
        self.tables.rows.get(entity).and_then(|rows| rows.get(key))
    }

    /// Rows of `target` related to `record`, in primary key order.
    fn reach(&self, record: &Record, source: &str, join: &Join, target: &str) -> Vec<&'a Record> {
        let own_key = || {
            self.registry
                .entity(source)
                .and_then(|def| record.key(def))
        };
        match join {
            Join::Forward { column } => Key::from_field(record.get(column))
                .and_then(|key| self.row(target, &key))
                .into_iter()
                .collect(),
            Join::Reverse { column } => {
                let Some(key) = own_key() else {
                    return Vec::new();
                };
                let reference = FieldValue::from(key);
                self.tables
                    .rows
                    .get(target)
                    .map(|rows| {
                        rows.values()
                            .filter(|row| row.get(column).same_as(&reference))
                            .collect()
                    })
                    .unwrap_or_default()
            }
            Join::Link {
                table,
                source_column,
                ..
            } => {
                let Some(key) = own_key() else {
                    return Vec::new();
                };
                let forward = *source_column == LINK_SOURCE_COLUMN;
                let Some(pairs) = self.tables.links.get(table) else {
                    return Vec::new();
                };
                pairs
                    .iter()
                    .filter_map(|(s, t)| match forward {
                        true if *s == key => Some(t),
                        false if *t == key => Some(s),
                        _ => None,
                    })
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .filter_map(|k| self.row(target, k))
                    .collect()
            }
        }
    }
}

impl RecordGraph for View<'_> {
    fn follow<'b>(&'b self, record: &'b Record, hop: &Hop) -> Vec<&'b Record> {
        self.reach(record, &hop.source, &hop.join, &hop.target)
    }
}

impl Tables {
    fn new(registry: &EntityRegistry) -> Self {
        Self {
            rows: registry
                .entities()
                .map(|e| (e.name().to_string(), BTreeMap::new()))
                .collect(),
            links: registry
                .link_tables()
                .into_iter()
                .map(|(table, _, _)| (table, BTreeSet::new()))
                .collect(),
        }
    }

    fn table_mut(&mut self, entity: &str) -> &mut BTreeMap<Key, Record> {
        self.rows.entry(entity.to_string()).or_default()
    }

    fn next_key(&self, def: &EntityDef) -> Result<Key, StoreError> {
        match def.key_type() {
            ScalarType::Integer => {
                let max = self
                    .rows
                    .get(def.name())
                    .and_then(|rows| {
                        rows.keys()
                            .filter_map(|k| match k {
                                Key::Int(i) => Some(*i),
                                _ => None,
                            })
                            .max()
                    })
                    .unwrap_or(0);
                Ok(Key::Int(max + 1))
            }
            ScalarType::Uuid => Ok(Key::Uuid(uuid::Uuid::new_v4())),
            _ => Err(StoreError::Integrity(format!(
                "primary key '{}' of '{}' must be supplied",
                def.primary_key().name,
                def.name()
            ))),
        }
    }

    fn apply(&mut self, registry: &EntityRegistry, unit: WriteUnit) -> Result<Key, StoreError> {
        let def = registry.get(&unit.entity)?;
        let pk = def.primary_key().name.clone();

        let key = match unit.target {
            WriteTarget::Insert => {
                let key = match unit.values.get(&pk).and_then(Key::from_field) {
                    Some(key) => key,
                    None => self.next_key(def)?,
                };
                let table = self.table_mut(def.name());
                if table.contains_key(&key) {
                    return Err(StoreError::Integrity(format!(
                        "duplicate key value {} for '{}'",
                        key,
                        def.name()
                    )));
                }
                let mut record = Record::new(def.name());
                record.values = unit.values;
                record.set(&pk, key.clone().into());
                table.insert(key.clone(), record);
                key
            }
            WriteTarget::Update(key) => {
                let record = self
                    .table_mut(def.name())
                    .get_mut(&key)
                    .ok_or_else(|| StoreError::NotFound {
                        entity: def.name().to_string(),
                        key: key.to_string(),
                    })?;
                for (column, value) in unit.values {
                    if column != pk {
                        record.set(&column, value);
                    }
                }
                key
            }
        };

        for operation in unit.operations {
            self.apply_operation(registry, def, &key, operation)?;
        }
        Ok(key)
    }

    fn apply_operation(
        &mut self,
        registry: &EntityRegistry,
        def: &EntityDef,
        own_key: &Key,
        operation: PendingOperation,
    ) -> Result<(), StoreError> {
        let attribute = operation.attribute().to_string();
        let relation = registry.relation(def.name(), &attribute)?;
        let join = registry.join(def.name(), &attribute)?;
        let own_value = FieldValue::from(own_key.clone());

        match (operation, join) {
            (PendingOperation::Repoint { key, .. }, Join::Forward { column }) => {
                let value = key.map(FieldValue::from).unwrap_or_default();
                if let Some(record) = self.table_mut(def.name()).get_mut(own_key) {
                    record.set(&column, value);
                }
            }
            (PendingOperation::Repoint { key, target, .. }, Join::Reverse { column }) => {
                let holders = self.table_mut(&target);
                for row in holders.values_mut() {
                    if row.get(&column).same_as(&own_value) {
                        row.set(&column, FieldValue::Null);
                    }
                }
                if let Some(key) = key {
                    let row = holders.get_mut(&key).ok_or_else(|| StoreError::NotFound {
                        entity: target.clone(),
                        key: key.to_string(),
                    })?;
                    row.set(&column, own_value);
                }
            }
            (
                PendingOperation::Link {
                    mode, keys, target, ..
                },
                Join::Link {
                    table,
                    source_column,
                    ..
                },
            ) => {
                let forward = source_column == LINK_SOURCE_COLUMN;
                let pair = |other: &Key| {
                    if forward {
                        (own_key.clone(), other.clone())
                    } else {
                        (other.clone(), own_key.clone())
                    }
                };
                let pairs = self.links.entry(table).or_default();
                if mode == RelationMode::Set {
                    pairs.retain(|(s, t)| if forward { s != own_key } else { t != own_key });
                }
                for key in &keys {
                    match mode {
                        RelationMode::Remove => {
                            pairs.remove(&pair(key));
                        }
                        RelationMode::Add | RelationMode::Set => {
                            pairs.insert(pair(key));
                        }
                    }
                }
                debug!("Linked {} {} rows through '{}'", keys.len(), target, attribute);
            }
            (PendingOperation::Link { mode, keys, target, .. }, Join::Reverse { column }) => {
                let members = self.table_mut(&target);
                if mode == RelationMode::Set {
                    for (key, row) in members.iter_mut() {
                        if row.get(&column).same_as(&own_value) && !keys.contains(key) {
                            row.set(&column, FieldValue::Null);
                        }
                    }
                }
                for key in &keys {
                    let row = match members.get_mut(key) {
                        Some(row) => row,
                        None if mode == RelationMode::Remove => continue,
                        None => {
                            return Err(StoreError::NotFound {
                                entity: target.clone(),
                                key: key.to_string(),
                            })
                        }
                    };
                    match mode {
                        RelationMode::Remove if row.get(&column).same_as(&own_value) => {
                            row.set(&column, FieldValue::Null)
                        }
                        RelationMode::Remove => {}
                        RelationMode::Add | RelationMode::Set => row.set(&column, own_value.clone()),
                    }
                }
            }
            (operation, join) => {
                return Err(StoreError::Backend(format!(
                    "cannot apply {:?} to '{}.{}' stored as {:?} ({:?})",
                    operation,
                    def.name(),
                    attribute,
                    join,
                    relation.cardinality
                )))
            }
        }
        Ok(())
    }

    /// Not-null and referential checks over every table.
    fn validate(&self, registry: &EntityRegistry) -> Result<(), StoreError> {
        for def in registry.entities() {
            let Some(rows) = self.rows.get(def.name()) else {
                continue;
            };
            for (key, row) in rows {
                for field in def.fields() {
                    match field.as_relation() {
                        None if field.required && !field.primary_key && row.get(&field.name).is_null() => {
                            return Err(StoreError::Integrity(format!(
                                "null value in column '{}' of '{}' {} violates not-null constraint",
                                field.name,
                                def.name(),
                                key
                            )));
                        }
                        Some(relation) if relation.cardinality == Cardinality::ToOneOwning => {
                            let column = foreign_key_column(&field.name);
                            match Key::from_field(row.get(&column)) {
                                None if field.required => {
                                    return Err(StoreError::Integrity(format!(
                                        "null value in column '{}' of '{}' {} violates not-null constraint",
                                        column,
                                        def.name(),
                                        key
                                    )))
                                }
                                Some(target)
                                    if !self
                                        .rows
                                        .get(&relation.target)
                                        .is_some_and(|t| t.contains_key(&target)) =>
                                {
                                    return Err(StoreError::Integrity(format!(
                                        "'{}' {} references missing {} {} through '{}'",
                                        def.name(),
                                        key,
                                        relation.target,
                                        target,
                                        field.name
                                    )))
                                }
                                _ => {}
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        for (table, source, target) in registry.link_tables() {
            let Some(pairs) = self.links.get(&table) else {
                continue;
            };
            let exists = |entity: &str, key: &Key| {
                self.rows.get(entity).is_some_and(|rows| rows.contains_key(key))
            };
            if let Some((s, t)) = pairs
                .iter()
                .find(|(s, t)| !exists(source, s) || !exists(target, t))
            {
                return Err(StoreError::Integrity(format!(
                    "link ({}, {}) in '{}' references a missing row",
                    s, t, table
                )));
            }
        }
        Ok(())
    }

    fn delete(&mut self, registry: &EntityRegistry, entity: &str, keys: &[Key]) -> Result<usize, StoreError> {
        let existing: Vec<Key> = keys
            .iter()
            .filter(|k| self.rows.get(entity).is_some_and(|rows| rows.contains_key(*k)))
            .unique()
            .cloned()
            .collect();

        let mut worklist: Vec<(String, Key)> =
            existing.iter().map(|k| (entity.to_string(), k.clone())).collect();
        while let Some((entity, key)) = worklist.pop() {
            if self.table_mut(&entity).remove(&key).is_none() {
                continue;
            }
            for (table, source, target) in registry.link_tables() {
                if let Some(pairs) = self.links.get_mut(&table) {
                    pairs.retain(|(s, t)| !(source == entity && *s == key) && !(target == entity && *t == key));
                }
            }
            let reference = FieldValue::from(key.clone());
            for (holder, field, relation) in registry.references_to(&entity) {
                let column = foreign_key_column(&field.name);
                let rows = self.table_mut(holder.name());
                let referencing: Vec<Key> = rows
                    .iter()
                    .filter(|(_, row)| row.get(&column).same_as(&reference))
                    .map(|(k, _)| k.clone())
                    .collect();
                match relation.on_delete {
                    // a remaining reference fails validation
                    OnDelete::Restrict => {}
                    OnDelete::SetNull => {
                        for k in &referencing {
                            if let Some(row) = rows.get_mut(k) {
                                row.set(&column, FieldValue::Null);
                            }
                        }
                    }
                    OnDelete::Cascade => worklist.extend(
                        referencing
                            .into_iter()
                            .map(|k| (holder.name().to_string(), k)),
                    ),
                }
            }
        }
        Ok(existing.len())
    }
}

/// Relational store kept in process memory.
///
/// Every commit is applied to a copy of the tables, validated, and swapped in
/// under the write lock, so a failing unit leaves nothing behind.
pub struct MemoryStore {
    registry: EntityRegistry,
    tables: RwLock<Tables>,
    related_loads: AtomicUsize,
}

impl MemoryStore {
    pub fn new(registry: EntityRegistry) -> Self {
        let tables = Tables::new(&registry);
        Self {
            registry,
            tables: RwLock::new(tables),
            related_loads: AtomicUsize::new(0),
        }
    }

    /// Number of `load_related` calls served so far.
    pub fn related_loads(&self) -> usize {
        self.related_loads.load(Ordering::Relaxed)
    }

    pub fn count(&self, entity: &str) -> usize {
        self.tables.read().rows.get(entity).map_or(0, BTreeMap::len)
    }

    /// Materializes the join paths of `plan` on `records`, parents first.
    fn attach_joins(&self, tables: &Tables, entity: &str, records: &mut [Record], plan: &QueryPlan) -> Result<(), StoreError> {
        let view = View {
            registry: &self.registry,
            tables,
        };
        for path in plan
            .paths_by_depth()
            .into_iter()
            .filter(|p| plan.join_paths.contains(*p))
        {
            let segments: Vec<&str> = path.split('.').collect();
            let Some((attribute, parent_path)) = segments.split_last() else {
                continue;
            };
            let source = entity_at(&self.registry, entity, parent_path)?;
            let relation = self.registry.relation(source, attribute)?;
            let join = self.registry.join(source, attribute)?;
            visit_mut(records, parent_path, &mut |parent| {
                let members = view
                    .reach(parent, source, &join, &relation.target)
                    .into_iter()
                    .cloned()
                    .collect();
                parent
                    .related
                    .insert(attribute.to_string(), Related::from_records(relation.cardinality, members));
            });
        }
        Ok(())
    }

    fn batch_paths(plan: &QueryPlan) -> Vec<&str> {
        plan.paths_by_depth()
            .into_iter()
            .filter(|p| plan.batch_paths.contains(*p))
            .collect()
    }
}

#[async_trait::async_trait]
impl EntityStore for MemoryStore {
    fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    async fn fetch(&self, query: &Query) -> Result<Vec<Record>, StoreError> {
        self.registry.get(&query.entity)?;
        let mut records = {
            let tables = self.tables.read();
            let view = View {
                registry: &self.registry,
                tables: &tables,
            };
            let mut records: Vec<Record> = tables
                .rows
                .get(&query.entity)
                .map(|rows| {
                    rows.values()
                        .filter(|row| query.predicate.as_ref().map_or(true, |p| p.matches(row, &view)))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            self.attach_joins(&tables, &query.entity, &mut records, &query.plan)?;
            records
        };
        prefetch(self, &query.entity, &mut records, &Self::batch_paths(&query.plan)).await?;
        debug!("Fetched {} '{}' rows", records.len(), query.entity);
        Ok(records)
    }

    async fn fetch_one(
        &self,
        entity: &str,
        key: &Key,
        plan: &QueryPlan,
    ) -> Result<Option<Record>, StoreError> {
        self.registry.get(entity)?;
        let mut records = {
            let tables = self.tables.read();
            let mut records: Vec<Record> = tables
                .rows
                .get(entity)
                .and_then(|rows| rows.get(key))
                .cloned()
                .into_iter()
                .collect();
            self.attach_joins(&tables, entity, &mut records, plan)?;
            records
        };
        prefetch(self, entity, &mut records, &Self::batch_paths(plan)).await?;
        Ok(records.pop())
    }

    async fn load_related(
        &self,
        source: &str,
        attribute: &str,
        parents: &[&Record],
    ) -> Result<Vec<(Key, Record)>, StoreError> {
        self.related_loads.fetch_add(1, Ordering::Relaxed);
        let source_def = self.registry.get(source)?;
        let relation = self.registry.relation(source, attribute)?;
        let join = self.registry.join(source, attribute)?;

        let tables = self.tables.read();
        let view = View {
            registry: &self.registry,
            tables: &tables,
        };
        let mut loaded = Vec::new();
        for parent in parents {
            let Some(key) = parent.key(source_def) else {
                continue;
            };
            for row in view.reach(parent, source, &join, &relation.target) {
                loaded.push((key.clone(), row.clone()));
            }
        }
        Ok(loaded)
    }

    async fn exists(&self, entity: &str, key: &Key) -> Result<bool, StoreError> {
        self.registry.get(entity)?;
        Ok(self
            .tables
            .read()
            .rows
            .get(entity)
            .is_some_and(|rows| rows.contains_key(key)))
    }

    async fn commit(&self, unit: WriteUnit) -> Result<Key, StoreError> {
        let entity = unit.entity.clone();
        let mut tables = self.tables.write();
        let mut staged = tables.clone();
        let key = staged.apply(&self.registry, unit)?;
        staged.validate(&self.registry)?;
        *tables = staged;
        info!("Committed {} {}", entity, key);
        Ok(key)
    }

    async fn delete_many(&self, entity: &str, keys: &[Key]) -> Result<usize, StoreError> {
        self.registry.get(entity)?;
        let mut tables = self.tables.write();
        let mut staged = tables.clone();
        let deleted = staged.delete(&self.registry, entity, keys)?;
        staged.validate(&self.registry)?;
        *tables = staged;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::filter_compiler::compile_filter;
    use crate::logic::predicate::bind;
    use crate::seed::{library_registry, load_seed_data};
    use std::collections::BTreeMap;

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new(library_registry());
        load_seed_data(&store).await.unwrap();
        store
    }

    fn ids(records: &[Record]) -> Vec<Key> {
        records
            .iter()
            .filter_map(|r| Key::from_field(r.get("id")))
            .collect()
    }

    fn update(entity: &str, key: i64, operations: Vec<PendingOperation>) -> WriteUnit {
        WriteUnit {
            entity: entity.into(),
            target: WriteTarget::Update(Key::Int(key)),
            values: BTreeMap::new(),
            operations,
        }
    }

    #[tokio::test]
    async fn test_fetch_filters_with_bound_predicate() {
        let store = seeded().await;
        let predicate = compile_filter(Some("author.name[istartswith]ursula")).unwrap().unwrap();
        let bound = bind(&predicate, store.registry(), "book").unwrap();
        let query = Query::new("book", QueryPlan::default()).with_predicate(Some(bound));
        let records = store.fetch(&query).await.unwrap();
        assert_eq!(ids(&records), vec![Key::Int(3), Key::Int(4)]);
    }

    #[tokio::test]
    async fn test_filter_through_many_to_many() {
        let store = seeded().await;
        let predicate = compile_filter(Some("tags.label[exact]anthropology")).unwrap().unwrap();
        let bound = bind(&predicate, store.registry(), "book").unwrap();
        let records = store
            .fetch(&Query::new("book", QueryPlan::default()).with_predicate(Some(bound)))
            .await
            .unwrap();
        assert_eq!(ids(&records), vec![Key::Int(3), Key::Int(4)]);
    }

    #[tokio::test]
    async fn test_insert_assigns_next_integer_key() {
        let store = seeded().await;
        let mut values = BTreeMap::new();
        values.insert("label".to_string(), FieldValue::from("cyberpunk"));
        let key = store
            .commit(WriteUnit {
                entity: "tag".into(),
                target: WriteTarget::Insert,
                values,
                operations: vec![],
            })
            .await
            .unwrap();
        assert_eq!(key, Key::Int(4));
        assert!(store.exists("tag", &key).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_unit_leaves_store_untouched() {
        let store = seeded().await;
        let mut unit = update("book", 1, vec![PendingOperation::Link {
            attribute: "tags".into(),
            target: "tag".into(),
            mode: RelationMode::Set,
            keys: vec![Key::Int(3), Key::Int(99)],
        }]);
        unit.values.insert("title".into(), FieldValue::from("Changed"));
        assert!(store.commit(unit).await.is_err());

        let book = store
            .fetch_one("book", &Key::Int(1), &QueryPlan::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(book.get("title"), &FieldValue::from("Dune"));
        let tags = store.load_related("book", "tags", &[&book]).await.unwrap();
        assert_eq!(tags.len(), 2);
    }

    #[tokio::test]
    async fn test_link_modes() {
        let store = seeded().await;
        let tag_ids = |store: &MemoryStore| {
            let tables = store.tables.read();
            tables.links["book_tags"]
                .iter()
                .filter(|(s, _)| *s == Key::Int(2))
                .map(|(_, t)| t.clone())
                .collect::<Vec<_>>()
        };
        let link = |mode, keys: Vec<i64>| PendingOperation::Link {
            attribute: "tags".into(),
            target: "tag".into(),
            mode,
            keys: keys.into_iter().map(Key::Int).collect(),
        };

        store.commit(update("book", 2, vec![link(RelationMode::Add, vec![1])])).await.unwrap();
        assert_eq!(tag_ids(&store), vec![Key::Int(1), Key::Int(2)]);
        store.commit(update("book", 2, vec![link(RelationMode::Remove, vec![2])])).await.unwrap();
        assert_eq!(tag_ids(&store), vec![Key::Int(1)]);
        store.commit(update("book", 2, vec![link(RelationMode::Set, vec![3])])).await.unwrap();
        assert_eq!(tag_ids(&store), vec![Key::Int(3)]);
    }

    #[tokio::test]
    async fn test_reverse_foreign_key_set_on_required_column_conflicts() {
        let store = seeded().await;
        // Moving Dune Messiah away from Frank Herbert would null a required column
        let unit = update("author", 1, vec![PendingOperation::Link {
            attribute: "books".into(),
            target: "book".into(),
            mode: RelationMode::Set,
            keys: vec![Key::Int(1)],
        }]);
        assert!(matches!(store.commit(unit).await, Err(StoreError::Integrity(_))));

        let unit = update("author", 4, vec![PendingOperation::Link {
            attribute: "books".into(),
            target: "book".into(),
            mode: RelationMode::Add,
            keys: vec![Key::Int(5)],
        }]);
        store.commit(unit).await.unwrap();
        let book = store
            .fetch_one("book", &Key::Int(5), &QueryPlan::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(book.get("author_id"), &FieldValue::Int(4));
    }

    #[tokio::test]
    async fn test_removing_unlinked_keys_is_a_noop() {
        let store = seeded().await;
        let remove = |attribute: &str, target: &str| PendingOperation::Link {
            attribute: attribute.into(),
            target: target.into(),
            mode: RelationMode::Remove,
            keys: vec![Key::Int(99)],
        };

        store.commit(update("author", 1, vec![remove("books", "book")])).await.unwrap();
        store.commit(update("book", 1, vec![remove("tags", "tag")])).await.unwrap();

        let author = store
            .fetch_one("author", &Key::Int(1), &QueryPlan::default())
            .await
            .unwrap()
            .unwrap();
        let books = store.load_related("author", "books", &[&author]).await.unwrap();
        assert_eq!(books.len(), 2);
        let book = store
            .fetch_one("book", &Key::Int(1), &QueryPlan::default())
            .await
            .unwrap()
            .unwrap();
        let tags = store.load_related("book", "tags", &[&book]).await.unwrap();
        assert_eq!(tags.len(), 2);
    }

    #[tokio::test]
    async fn test_owned_to_one_repoint() {
        let store = seeded().await;
        let unit = update("author", 2, vec![PendingOperation::Repoint {
            attribute: "profile".into(),
            target: "profile".into(),
            key: Some(Key::Int(1)),
        }]);
        store.commit(unit).await.unwrap();
        let profile = store
            .fetch_one("profile", &Key::Int(1), &QueryPlan::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(profile.get("author_id"), &FieldValue::Int(2));
    }

    #[tokio::test]
    async fn test_delete_policies() {
        let store = seeded().await;

        // Books restrict deleting their author
        assert!(matches!(
            store.delete_many("author", &[Key::Int(1)]).await,
            Err(StoreError::Integrity(_))
        ));
        assert_eq!(store.count("author"), 4);

        // Publisher references are nulled
        assert_eq!(store.delete_many("publisher", &[Key::Int(1)]).await.unwrap(), 1);
        let author = store
            .fetch_one("author", &Key::Int(1), &QueryPlan::default())
            .await
            .unwrap()
            .unwrap();
        assert!(author.get("publisher_id").is_null());

        // Profiles cascade with their author, links go with their book
        store.delete_many("book", &[Key::Int(1), Key::Int(2)]).await.unwrap();
        assert_eq!(store.delete_many("author", &[Key::Int(1), Key::Int(42)]).await.unwrap(), 1);
        assert_eq!(store.count("profile"), 0);
        assert!(store.tables.read().links["book_tags"]
            .iter()
            .all(|(s, _)| *s != Key::Int(1)));
    }

    #[tokio::test]
    async fn test_prefetch_stitches_nested_batches() {
        let store = seeded().await;
        let plan = QueryPlan {
            join_paths: ["publisher".to_string()].into(),
            batch_paths: ["books".to_string(), "books.tags".to_string()].into(),
        };
        let authors = store.fetch(&Query::new("author", plan)).await.unwrap();
        assert_eq!(store.related_loads(), 2);

        let herbert = &authors[0];
        let Some(Related::Many(books)) = herbert.related("books") else {
            panic!("books not prefetched");
        };
        assert_eq!(ids(books), vec![Key::Int(1), Key::Int(2)]);
        let Some(Related::Many(tags)) = books[0].related("tags") else {
            panic!("tags not prefetched");
        };
        assert_eq!(ids(tags), vec![Key::Int(1), Key::Int(2)]);
        assert!(matches!(herbert.related("publisher"), Some(Related::One(Some(_)))));
        assert!(matches!(authors[3].related("publisher"), Some(Related::One(None))));
    }
}
