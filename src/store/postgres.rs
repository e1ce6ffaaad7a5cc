use anyhow::{Context, Result};
use log::{debug, info};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use std::collections::HashMap;

use crate::error::StoreError;
use crate::logic::plan::QueryPlan;
use crate::model::{
    EntityRegistry, FieldValue, Join, Key, PendingOperation, Record, Related, RelationMode,
    ScalarType, WriteTarget, WriteUnit,
};
use crate::store::prefetch::{prefetch, visit_mut};
use crate::store::sql::{self, Selection, PARENT_LABEL};
use crate::store::traits::{EntityStore, Query};

/// Relational store backed by PostgreSQL, one table per entity and one link
/// table per owning many-to-many relation.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
    registry: EntityRegistry,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given database URL
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        registry: EntityRegistry,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self { pool, registry })
    }

    /// Create any missing entity and link tables
    pub async fn migrate(&self) -> Result<()> {
        let statements = sql::schema_statements(&self.registry)?;
        for statement in &statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to run migration statement: {}", statement))?;
        }
        info!("Applied {} schema statements", statements.len());
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn run_select(
        &self,
        mut builder: QueryBuilder<'_, Postgres>,
        selections: &[Selection],
    ) -> Result<Vec<Record>, StoreError> {
        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;
        rows.iter().map(|row| assemble(row, selections)).collect()
    }

    fn batch_paths(plan: &QueryPlan) -> Vec<&str> {
        plan.paths_by_depth()
            .into_iter()
            .filter(|p| plan.batch_paths.contains(*p))
            .collect()
    }

    async fn apply_operation(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        entity: &str,
        own_key: &Key,
        operation: PendingOperation,
    ) -> Result<(), StoreError> {
        let join = self.registry.join(entity, operation.attribute())?;
        let def = self.registry.get(entity)?;
        let own_pk = sql::ident(&def.primary_key().name);

        match (operation, join) {
            (PendingOperation::Repoint { key, .. }, Join::Forward { column }) => {
                let mut builder =
                    QueryBuilder::new(format!("UPDATE {} SET {} = ", sql::ident(entity), sql::ident(&column)));
                sql::push_value(&mut builder, &key.map(FieldValue::from).unwrap_or_default());
                builder.push(format!(" WHERE {} = ", own_pk));
                sql::push_key(&mut builder, own_key);
                execute(tx, builder).await?;
            }
            (PendingOperation::Repoint { key, target, .. }, Join::Reverse { column }) => {
                let target_pk = sql::ident(&self.registry.get(&target)?.primary_key().name);
                let mut builder = QueryBuilder::new(format!(
                    "UPDATE {} SET {} = NULL WHERE {} = ",
                    sql::ident(&target),
                    sql::ident(&column),
                    sql::ident(&column)
                ));
                sql::push_key(&mut builder, own_key);
                execute(tx, builder).await?;

                if let Some(key) = key {
                    let mut builder = QueryBuilder::new(format!(
                        "UPDATE {} SET {} = ",
                        sql::ident(&target),
                        sql::ident(&column)
                    ));
                    sql::push_key(&mut builder, own_key);
                    builder.push(format!(" WHERE {} = ", target_pk));
                    sql::push_key(&mut builder, &key);
                    if execute(tx, builder).await? == 0 {
                        return Err(StoreError::NotFound {
                            entity: target,
                            key: key.to_string(),
                        });
                    }
                }
            }
            (
                PendingOperation::Link { mode, keys, .. },
                Join::Link {
                    table,
                    source_column,
                    target_column,
                },
            ) => {
                let own = sql::ident(source_column);
                let other = sql::ident(target_column);
                if mode == RelationMode::Set || (mode == RelationMode::Remove && !keys.is_empty()) {
                    let mut builder =
                        QueryBuilder::new(format!("DELETE FROM {} WHERE {} = ", sql::ident(&table), own));
                    sql::push_key(&mut builder, own_key);
                    if mode == RelationMode::Remove {
                        builder.push(format!(" AND {} IN ", other));
                        sql::push_keys(&mut builder, &keys);
                    }
                    execute(tx, builder).await?;
                }
                if mode != RelationMode::Remove && !keys.is_empty() {
                    let mut builder = QueryBuilder::new(format!(
                        "INSERT INTO {} ({}, {}) VALUES ",
                        sql::ident(&table),
                        own,
                        other
                    ));
                    for (i, key) in keys.iter().enumerate() {
                        if i > 0 {
                            builder.push(", ");
                        }
                        builder.push("(");
                        sql::push_key(&mut builder, own_key);
                        builder.push(", ");
                        sql::push_key(&mut builder, key);
                        builder.push(")");
                    }
                    builder.push(" ON CONFLICT DO NOTHING");
                    execute(tx, builder).await?;
                }
            }
            (PendingOperation::Link { mode, keys, target, .. }, Join::Reverse { column }) => {
                let target_pk = sql::ident(&self.registry.get(&target)?.primary_key().name);
                let column = sql::ident(&column);
                if mode != RelationMode::Add {
                    let mut builder = QueryBuilder::new(format!(
                        "UPDATE {} SET {} = NULL WHERE {} = ",
                        sql::ident(&target),
                        column,
                        column
                    ));
                    sql::push_key(&mut builder, own_key);
                    match (mode, keys.is_empty()) {
                        (RelationMode::Remove, true) => return Ok(()),
                        (RelationMode::Remove, false) => {
                            builder.push(format!(" AND {} IN ", target_pk));
                            sql::push_keys(&mut builder, &keys);
                        }
                        (_, false) => {
                            builder.push(format!(" AND {} NOT IN ", target_pk));
                            sql::push_keys(&mut builder, &keys);
                        }
                        (_, true) => {}
                    }
                    execute(tx, builder).await?;
                }
                if mode != RelationMode::Remove && !keys.is_empty() {
                    let mut builder = QueryBuilder::new(format!(
                        "UPDATE {} SET {} = ",
                        sql::ident(&target),
                        column
                    ));
                    sql::push_key(&mut builder, own_key);
                    builder.push(format!(" WHERE {} IN ", target_pk));
                    sql::push_keys(&mut builder, &keys);
                    let updated = execute(tx, builder).await?;
                    if updated < keys.iter().collect::<std::collections::HashSet<_>>().len() as u64 {
                        return Err(StoreError::NotFound {
                            entity: target,
                            key: keys.iter().map(Key::to_string).collect::<Vec<_>>().join(", "),
                        });
                    }
                }
            }
            (operation, join) => {
                return Err(StoreError::Backend(format!(
                    "cannot apply {:?} to '{}' stored as {:?}",
                    operation, entity, join
                )))
            }
        }
        Ok(())
    }
}

/// Maps Postgres integrity violations (SQLSTATE class 23) to [`StoreError::Integrity`].
fn store_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.code().is_some_and(|code| code.starts_with("23")) => {
            StoreError::Integrity(db.message().to_string())
        }
        _ => StoreError::Backend(err.to_string()),
    }
}

/// Moves re-points of owning to-one relations into the inserted values, so
/// NOT NULL foreign keys are present in the INSERT itself.
fn fold_foreign_keys(registry: &EntityRegistry, unit: &mut WriteUnit) -> Result<(), StoreError> {
    let mut remaining = Vec::with_capacity(unit.operations.len());
    for operation in std::mem::take(&mut unit.operations) {
        let join = registry.join(&unit.entity, operation.attribute())?;
        match (operation, join) {
            (PendingOperation::Repoint { key, .. }, Join::Forward { column }) => {
                unit.values
                    .insert(column, key.map(FieldValue::from).unwrap_or_default());
            }
            (operation, _) => remaining.push(operation),
        }
    }
    unit.operations = remaining;
    Ok(())
}

async fn execute(
    tx: &mut Transaction<'_, Postgres>,
    mut builder: QueryBuilder<'_, Postgres>,
) -> Result<u64, StoreError> {
    debug!("{}", builder.sql());
    let result = builder
        .build()
        .execute(&mut **tx)
        .await
        .map_err(store_error)?;
    Ok(result.rows_affected())
}

fn decode(row: &PgRow, label: &str, scalar: ScalarType) -> Result<FieldValue, sqlx::Error> {
    Ok(match scalar {
        ScalarType::Text => row.try_get::<Option<String>, _>(label)?.map(FieldValue::Text),
        ScalarType::Integer => row.try_get::<Option<i64>, _>(label)?.map(FieldValue::Int),
        ScalarType::Float => row.try_get::<Option<f64>, _>(label)?.map(FieldValue::Float),
        ScalarType::Boolean => row.try_get::<Option<bool>, _>(label)?.map(FieldValue::Bool),
        ScalarType::Timestamp => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(label)?
            .map(FieldValue::Timestamp),
        ScalarType::Date => row
            .try_get::<Option<chrono::NaiveDate>, _>(label)?
            .map(FieldValue::Date),
        ScalarType::Uuid => row.try_get::<Option<uuid::Uuid>, _>(label)?.map(FieldValue::Uuid),
        ScalarType::Json => row
            .try_get::<Option<serde_json::Value>, _>(label)?
            .map(FieldValue::Json),
    }
    .unwrap_or_default())
}

/// Reads one selection out of a row, `None` when a left join found nothing.
fn read_selection(row: &PgRow, selection: &Selection) -> Result<Option<Record>, StoreError> {
    let mut record = Record::new(&selection.entity);
    for (column, scalar) in &selection.columns {
        let value = decode(row, &sql::label(&selection.alias, column), *scalar).map_err(store_error)?;
        record.set(column, value);
    }
    Ok((!record.get(&selection.primary_key).is_null()).then_some(record))
}

/// Base record of a row with its join paths attached, parents first.
fn assemble(row: &PgRow, selections: &[Selection]) -> Result<Record, StoreError> {
    let Some((root, joined)) = selections.split_first() else {
        return Err(StoreError::Backend("empty selection".into()));
    };
    let mut record = read_selection(row, root)?
        .ok_or_else(|| StoreError::Backend(format!("'{}' row without primary key", root.entity)))?;
    for selection in joined {
        let Some(path) = selection.path.as_deref() else {
            continue;
        };
        let member = read_selection(row, selection)?;
        let segments: Vec<&str> = path.split('.').collect();
        let Some((attribute, parent_path)) = segments.split_last() else {
            continue;
        };
        visit_mut(std::slice::from_mut(&mut record), parent_path, &mut |parent| {
            parent.related.insert(
                attribute.to_string(),
                Related::One(member.clone().map(Box::new)),
            );
        });
    }
    Ok(record)
}

#[async_trait::async_trait]
impl EntityStore for PostgresStore {
    fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    async fn fetch(&self, query: &Query) -> Result<Vec<Record>, StoreError> {
        let (builder, selections) = sql::select(
            &self.registry,
            &query.entity,
            &query.plan,
            query.predicate.as_ref(),
            None,
        )?;
        debug!("{}", builder.sql());
        let mut records = self.run_select(builder, &selections).await?;
        prefetch(self, &query.entity, &mut records, &Self::batch_paths(&query.plan)).await?;
        Ok(records)
    }

    async fn fetch_one(
        &self,
        entity: &str,
        key: &Key,
        plan: &QueryPlan,
    ) -> Result<Option<Record>, StoreError> {
        let (builder, selections) = sql::select(&self.registry, entity, plan, None, Some(key))?;
        let mut records = self.run_select(builder, &selections).await?;
        prefetch(self, entity, &mut records, &Self::batch_paths(plan)).await?;
        Ok(records.pop())
    }

    async fn load_related(
        &self,
        source: &str,
        attribute: &str,
        parents: &[&Record],
    ) -> Result<Vec<(Key, Record)>, StoreError> {
        let source_def = self.registry.get(source)?;
        let join = self.registry.join(source, attribute)?;

        // Forward joins look targets up by foreign key, everything else by parent key
        let lookup: Vec<(Key, Key)> = parents
            .iter()
            .filter_map(|parent| {
                let own = parent.key(source_def)?;
                let by = match &join {
                    Join::Forward { column } => Key::from_field(parent.get(column))?,
                    _ => own.clone(),
                };
                Some((own, by))
            })
            .collect();
        let mut keys: Vec<Key> = lookup.iter().map(|(_, by)| by.clone()).collect();
        keys.sort();
        keys.dedup();
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let (mut builder, selection) = sql::select_related(&self.registry, source, attribute, &keys)?;
        debug!("{}", builder.sql());
        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;

        let mut loaded = Vec::new();
        match join {
            Join::Forward { .. } => {
                let mut targets = HashMap::new();
                for row in &rows {
                    if let Some(record) = read_selection(row, &selection)? {
                        if let Some(key) = Key::from_field(record.get(&selection.primary_key)) {
                            targets.insert(key, record);
                        }
                    }
                }
                for (own, by) in lookup {
                    if let Some(record) = targets.get(&by) {
                        loaded.push((own, record.clone()));
                    }
                }
            }
            _ => {
                for row in &rows {
                    let parent = decode(row, PARENT_LABEL, source_def.key_type()).map_err(store_error)?;
                    if let (Some(parent), Some(record)) =
                        (Key::from_field(&parent), read_selection(row, &selection)?)
                    {
                        loaded.push((parent, record));
                    }
                }
            }
        }
        Ok(loaded)
    }

    async fn exists(&self, entity: &str, key: &Key) -> Result<bool, StoreError> {
        let def = self.registry.get(entity)?;
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE {} = ",
            sql::ident(entity),
            sql::ident(&def.primary_key().name)
        ));
        sql::push_key(&mut builder, key);
        builder.push(")");
        let row = builder
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)?;
        row.try_get::<bool, _>(0).map_err(store_error)
    }

    async fn commit(&self, mut unit: WriteUnit) -> Result<Key, StoreError> {
        let def = self.registry.get(&unit.entity)?;
        if unit.target == WriteTarget::Insert {
            fold_foreign_keys(&self.registry, &mut unit)?;
        }
        let pk = def.primary_key().name.clone();
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        let (builder, explicit_key) = match &unit.target {
            WriteTarget::Insert => {
                let values: Vec<_> = unit
                    .values
                    .iter()
                    .filter(|(column, value)| **column != pk || !value.is_null())
                    .collect();
                let explicit = values.iter().any(|(column, _)| **column == pk);
                (sql::insert(def, &values), explicit)
            }
            WriteTarget::Update(key) => {
                let values: Vec<_> = unit.values.iter().filter(|(column, _)| **column != pk).collect();
                (sql::update(def, key, &values), false)
            }
        };
        let mut builder = builder;
        debug!("{}", builder.sql());
        let row = builder
            .build()
            .fetch_optional(&mut *tx)
            .await
            .map_err(store_error)?;
        let key = match (row, &unit.target) {
            (Some(row), _) => {
                let value = decode(&row, &pk, def.key_type()).map_err(store_error)?;
                Key::from_field(&value)
                    .ok_or_else(|| StoreError::Backend(format!("'{}' returned no key", unit.entity)))?
            }
            (None, WriteTarget::Update(key)) => {
                return Err(StoreError::NotFound {
                    entity: unit.entity.clone(),
                    key: key.to_string(),
                })
            }
            (None, WriteTarget::Insert) => {
                return Err(StoreError::Backend(format!("insert into '{}' returned nothing", unit.entity)))
            }
        };

        // Keep the serial sequence ahead of explicitly supplied integer keys
        if explicit_key && def.key_type() == ScalarType::Integer {
            let statement = format!(
                "SELECT setval(pg_get_serial_sequence('{table}', '{pk}'), (SELECT MAX({column}) FROM {ident}))",
                table = def.name(),
                pk = pk,
                column = sql::ident(&pk),
                ident = sql::ident(def.name())
            );
            sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .map_err(store_error)?;
        }

        for operation in unit.operations {
            self.apply_operation(&mut tx, &unit.entity, &key, operation).await?;
        }
        tx.commit().await.map_err(store_error)?;
        info!("Committed {} {}", unit.entity, key);
        Ok(key)
    }

    async fn delete_many(&self, entity: &str, keys: &[Key]) -> Result<usize, StoreError> {
        let def = self.registry.get(entity)?;
        if keys.is_empty() {
            return Ok(0);
        }
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "DELETE FROM {} WHERE {} IN ",
            sql::ident(entity),
            sql::ident(&def.primary_key().name)
        ));
        sql::push_keys(&mut builder, keys);
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        let deleted = execute(&mut tx, builder).await?;
        tx.commit().await.map_err(store_error)?;
        Ok(deleted as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seed::library_registry;

    #[test]
    fn test_insert_folds_foreign_key_repoints() {
        let registry = library_registry();
        let mut unit = WriteUnit {
            entity: "book".into(),
            target: WriteTarget::Insert,
            values: [("title".to_string(), FieldValue::from("Excession"))].into(),
            operations: vec![
                PendingOperation::Repoint {
                    attribute: "author".into(),
                    target: "author".into(),
                    key: Some(Key::Int(3)),
                },
                PendingOperation::Link {
                    attribute: "tags".into(),
                    target: "tag".into(),
                    mode: RelationMode::Set,
                    keys: vec![Key::Int(2)],
                },
            ],
        };
        fold_foreign_keys(&registry, &mut unit).unwrap();
        assert_eq!(unit.values["author_id"], FieldValue::Int(3));
        assert_eq!(unit.operations.len(), 1);
        assert_eq!(unit.operations[0].attribute(), "tags");
    }
}
