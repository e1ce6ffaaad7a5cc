//! SQL rendering for the Postgres store: DDL, selects with their joins,
//! keyed relation loads and row writes, all as `QueryBuilder`s.

use crate::error::SchemaError;
use crate::logic::plan::QueryPlan;
use crate::logic::predicate::{BoundCondition, BoundPredicate, Hop, Operand};
use crate::model::{
    foreign_key_column, Cardinality, Connector, EntityDef, EntityRegistry, FieldValue, Join, Key,
    OnDelete, Operator, ScalarType,
};
use sqlx::{Postgres, QueryBuilder};

pub const ROOT_ALIAS: &str = "t0";
pub const PARENT_LABEL: &str = "__parent";

pub fn ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn column_type(scalar: ScalarType) -> &'static str {
    match scalar {
        ScalarType::Text => "TEXT",
        ScalarType::Integer => "BIGINT",
        ScalarType::Float => "DOUBLE PRECISION",
        ScalarType::Boolean => "BOOLEAN",
        ScalarType::Timestamp => "TIMESTAMPTZ",
        ScalarType::Date => "DATE",
        ScalarType::Uuid => "UUID",
        ScalarType::Json => "JSONB",
    }
}

/// Label a selected column is read back under.
pub fn label(alias: &str, column: &str) -> String {
    format!("{}__{}", alias, column)
}

/// Physical columns of an entity table: scalars, then foreign keys of owning
/// to-one relations typed after the target's primary key.
pub fn table_columns(
    registry: &EntityRegistry,
    def: &EntityDef,
) -> Result<Vec<(String, ScalarType)>, SchemaError> {
    let mut columns: Vec<(String, ScalarType)> = def
        .scalar_fields()
        .filter_map(|f| f.scalar_type().map(|t| (f.name.clone(), t)))
        .collect();
    for (field, relation) in def.relations() {
        if relation.cardinality == Cardinality::ToOneOwning {
            let target = registry.get(&relation.target)?;
            columns.push((foreign_key_column(&field.name), target.key_type()));
        }
    }
    Ok(columns)
}

fn on_delete_clause(on_delete: OnDelete) -> &'static str {
    match on_delete {
        OnDelete::Restrict => "RESTRICT",
        OnDelete::SetNull => "SET NULL",
        OnDelete::Cascade => "CASCADE",
    }
}

/// Idempotent DDL for every entity table, foreign key and link table.
pub fn schema_statements(registry: &EntityRegistry) -> Result<Vec<String>, SchemaError> {
    let mut tables = Vec::new();
    let mut constraints = Vec::new();

    for def in registry.entities() {
        let pk = def.primary_key();
        let mut definitions = vec![match def.key_type() {
            ScalarType::Integer => format!("{} BIGSERIAL PRIMARY KEY", ident(&pk.name)),
            ScalarType::Uuid => format!("{} UUID PRIMARY KEY DEFAULT gen_random_uuid()", ident(&pk.name)),
            other => format!("{} {} PRIMARY KEY", ident(&pk.name), column_type(other)),
        }];
        for field in def.fields().iter().filter(|f| !f.primary_key) {
            let (column, scalar) = match (field.scalar_type(), field.as_relation()) {
                (Some(scalar), _) => (field.name.clone(), scalar),
                (None, Some(relation)) if relation.cardinality == Cardinality::ToOneOwning => {
                    let target = registry.get(&relation.target)?;
                    constraints.push(format!(
                        "DO $$ BEGIN ALTER TABLE {table} ADD CONSTRAINT {name} FOREIGN KEY ({column}) REFERENCES {target} ({target_pk}) ON DELETE {action}; EXCEPTION WHEN duplicate_object THEN NULL; END $$",
                        table = ident(def.name()),
                        name = ident(&format!("{}_{}_fkey", def.name(), field.name)),
                        column = ident(&foreign_key_column(&field.name)),
                        target = ident(target.name()),
                        target_pk = ident(&target.primary_key().name),
                        action = on_delete_clause(relation.on_delete),
                    ));
                    (foreign_key_column(&field.name), target.key_type())
                }
                _ => continue,
            };
            definitions.push(format!(
                "{} {}{}",
                ident(&column),
                column_type(scalar),
                if field.required { " NOT NULL" } else { "" }
            ));
        }
        tables.push(format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            ident(def.name()),
            definitions.join(", ")
        ));
    }

    for (table, source, target) in registry.link_tables() {
        let source = registry.get(source)?;
        let target = registry.get(target)?;
        let side = |column: &str, def: &EntityDef| {
            format!(
                "{} {} NOT NULL REFERENCES {} ({}) ON DELETE CASCADE",
                ident(column),
                column_type(def.key_type()),
                ident(def.name()),
                ident(&def.primary_key().name)
            )
        };
        tables.push(format!(
            "CREATE TABLE IF NOT EXISTS {} ({}, {}, PRIMARY KEY ({}, {}))",
            ident(&table),
            side(crate::model::LINK_SOURCE_COLUMN, source),
            side(crate::model::LINK_TARGET_COLUMN, target),
            ident(crate::model::LINK_SOURCE_COLUMN),
            ident(crate::model::LINK_TARGET_COLUMN),
        ));
    }

    tables.extend(constraints);
    Ok(tables)
}

pub fn push_value(builder: &mut QueryBuilder<'_, Postgres>, value: &FieldValue) {
    match value.clone() {
        FieldValue::Null => builder.push("NULL"),
        FieldValue::Bool(b) => builder.push_bind(b),
        FieldValue::Int(i) => builder.push_bind(i),
        FieldValue::Float(f) => builder.push_bind(f),
        FieldValue::Text(s) => builder.push_bind(s),
        FieldValue::Timestamp(ts) => builder.push_bind(ts),
        FieldValue::Date(d) => builder.push_bind(d),
        FieldValue::Uuid(u) => builder.push_bind(u),
        FieldValue::Json(v) => builder.push_bind(sqlx::types::Json(v)),
    };
}

pub fn push_key(builder: &mut QueryBuilder<'_, Postgres>, key: &Key) {
    push_value(builder, &FieldValue::from(key.clone()));
}

fn qualified(alias: &str, column: &str) -> String {
    format!("{}.{}", alias, ident(column))
}

/// Renders bound predicates as SQL conditions over the root alias.
///
/// Conditions that cross relations become `EXISTS` subqueries, so a to-many
/// hop matches when any related row matches and never multiplies base rows.
pub struct PredicateWriter<'r> {
    registry: &'r EntityRegistry,
    next_alias: usize,
}

impl<'r> PredicateWriter<'r> {
    pub fn new(registry: &'r EntityRegistry) -> Self {
        Self {
            registry,
            next_alias: 0,
        }
    }

    fn alias(&mut self, prefix: &str) -> String {
        self.next_alias += 1;
        format!("{}{}", prefix, self.next_alias)
    }

    pub fn push(
        &mut self,
        builder: &mut QueryBuilder<'_, Postgres>,
        predicate: &BoundPredicate,
    ) -> Result<(), SchemaError> {
        match predicate {
            BoundPredicate::Leaf(condition) => self.push_leaf(builder, condition),
            BoundPredicate::Combine {
                connector,
                left,
                right,
            } => {
                builder.push("(");
                self.push(builder, left)?;
                builder.push(match connector {
                    Connector::And => " AND ",
                    Connector::Or => " OR ",
                });
                self.push(builder, right)?;
                builder.push(")");
                Ok(())
            }
        }
    }

    fn push_leaf(
        &mut self,
        builder: &mut QueryBuilder<'_, Postgres>,
        condition: &BoundCondition,
    ) -> Result<(), SchemaError> {
        // Unknown (NULL) comparisons count as no match before negation
        builder.push(if condition.negated {
            "NOT COALESCE(("
        } else {
            "COALESCE(("
        });
        if condition.hops.is_empty() {
            push_comparison(builder, &qualified(ROOT_ALIAS, &condition.column), condition);
        } else {
            self.push_exists(builder, condition)?;
        }
        builder.push("), FALSE)");
        Ok(())
    }

    fn push_exists(
        &mut self,
        builder: &mut QueryBuilder<'_, Postgres>,
        condition: &BoundCondition,
    ) -> Result<(), SchemaError> {
        let mut from = Vec::new();
        let mut joins = Vec::new();
        let mut previous = ROOT_ALIAS.to_string();
        for hop in &condition.hops {
            let alias = self.alias("h");
            self.hop_clauses(hop, &previous, &alias, &mut from, &mut joins)?;
            previous = alias;
        }
        builder.push(format!(
            "EXISTS (SELECT 1 FROM {} WHERE {} AND ",
            from.join(", "),
            joins.join(" AND ")
        ));
        push_comparison(builder, &qualified(&previous, &condition.column), condition);
        builder.push(")");
        Ok(())
    }

    fn hop_clauses(
        &mut self,
        hop: &Hop,
        previous: &str,
        alias: &str,
        from: &mut Vec<String>,
        joins: &mut Vec<String>,
    ) -> Result<(), SchemaError> {
        let registry = self.registry;
        let source_pk = &registry.get(&hop.source)?.primary_key().name;
        let target_pk = &registry.get(&hop.target)?.primary_key().name;
        from.push(format!("{} {}", ident(&hop.target), alias));
        match &hop.join {
            Join::Forward { column } => joins.push(format!(
                "{} = {}",
                qualified(alias, target_pk),
                qualified(previous, column)
            )),
            Join::Reverse { column } => joins.push(format!(
                "{} = {}",
                qualified(alias, column),
                qualified(previous, source_pk)
            )),
            Join::Link {
                table,
                source_column,
                target_column,
            } => {
                let link = self.alias("l");
                from.push(format!("{} {}", ident(table), link));
                joins.push(format!(
                    "{} = {}",
                    qualified(&link, source_column),
                    qualified(previous, source_pk)
                ));
                joins.push(format!(
                    "{} = {}",
                    qualified(&link, target_column),
                    qualified(alias, target_pk)
                ));
            }
        }
        Ok(())
    }
}

fn push_comparison(builder: &mut QueryBuilder<'_, Postgres>, column: &str, condition: &BoundCondition) {
    let text = format!("{}::text", column);
    let lower = format!("LOWER({}::text)", column);
    let temporal = if condition.scalar == ScalarType::Timestamp {
        format!("({} AT TIME ZONE 'UTC')", column)
    } else {
        column.to_string()
    };

    match (condition.operator, &condition.operand) {
        (Operator::Exact, Operand::Single(v))
        | (Operator::Gt, Operand::Single(v))
        | (Operator::Gte, Operand::Single(v))
        | (Operator::Lt, Operand::Single(v))
        | (Operator::Lte, Operand::Single(v)) => {
            let op = match condition.operator {
                Operator::Gt => ">",
                Operator::Gte => ">=",
                Operator::Lt => "<",
                Operator::Lte => "<=",
                _ => "=",
            };
            builder.push(format!("{} {} ", column, op));
            push_value(builder, v);
        }
        (Operator::In, Operand::List(values)) => {
            builder.push(format!("{} IN (", column));
            for (i, v) in values.iter().enumerate() {
                if i > 0 {
                    builder.push(", ");
                }
                push_value(builder, v);
            }
            builder.push(")");
        }
        (Operator::Range, Operand::Range(low, high)) => {
            builder.push(format!("{} BETWEEN ", column));
            push_value(builder, low);
            builder.push(" AND ");
            push_value(builder, high);
        }
        (Operator::IExact, Operand::Text(t)) => {
            builder.push(format!("{} = LOWER(", lower));
            builder.push_bind(t.clone());
            builder.push(")");
        }
        (Operator::Contains, Operand::Text(t)) => {
            builder.push(format!("STRPOS({}, ", text));
            builder.push_bind(t.clone());
            builder.push(") > 0");
        }
        (Operator::IContains, Operand::Text(t)) => {
            builder.push(format!("STRPOS({}, LOWER(", lower));
            builder.push_bind(t.clone());
            builder.push(")) > 0");
        }
        (Operator::StartsWith, Operand::Text(t)) => {
            builder.push(format!("STARTS_WITH({}, ", text));
            builder.push_bind(t.clone());
            builder.push(")");
        }
        (Operator::IStartsWith, Operand::Text(t)) => {
            builder.push(format!("STARTS_WITH({}, LOWER(", lower));
            builder.push_bind(t.clone());
            builder.push("))");
        }
        (Operator::EndsWith, Operand::Text(t)) => {
            builder.push(format!("RIGHT({}, CHAR_LENGTH(", lower));
            builder.push_bind(t.clone());
            builder.push(")) = LOWER(");
            builder.push_bind(t.clone());
            builder.push(")");
        }
        (Operator::Year, Operand::Year(year)) => {
            builder.push(format!("EXTRACT(YEAR FROM {}) = ", temporal));
            builder.push_bind(*year);
        }
        (Operator::IsoYear, Operand::Year(year)) => {
            builder.push(format!("EXTRACT(ISOYEAR FROM {}) = ", temporal));
            builder.push_bind(*year);
        }
        (Operator::Date, Operand::Date(date)) => {
            builder.push(format!("{}::date = ", temporal));
            builder.push_bind(*date);
        }
        _ => {
            builder.push("FALSE");
        }
    }
}

/// Columns read for one materialized level of a select.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// Relation path below the root, `None` for the base entity
    pub path: Option<String>,
    pub entity: String,
    pub alias: String,
    pub primary_key: String,
    pub columns: Vec<(String, ScalarType)>,
}

impl Selection {
    pub fn new(registry: &EntityRegistry, path: Option<String>, entity: &str, alias: &str) -> Result<Self, SchemaError> {
        let def = registry.get(entity)?;
        Ok(Self {
            path,
            entity: entity.to_string(),
            alias: alias.to_string(),
            primary_key: def.primary_key().name.clone(),
            columns: table_columns(registry, def)?,
        })
    }

    fn push_columns(&self, out: &mut Vec<String>) {
        for (column, _) in &self.columns {
            out.push(format!(
                "{} AS {}",
                qualified(&self.alias, column),
                ident(&label(&self.alias, column))
            ));
        }
    }
}

/// Base select with every join path of `plan` left-joined onto the root.
pub fn select<'args>(
    registry: &EntityRegistry,
    entity: &str,
    plan: &QueryPlan,
    predicate: Option<&BoundPredicate>,
    key: Option<&Key>,
) -> Result<(QueryBuilder<'args, Postgres>, Vec<Selection>), SchemaError> {
    let root = Selection::new(registry, None, entity, ROOT_ALIAS)?;
    let mut selections = vec![root.clone()];
    let mut joins = Vec::new();

    for (index, path) in plan
        .paths_by_depth()
        .into_iter()
        .filter(|p| plan.join_paths.contains(*p))
        .enumerate()
    {
        let (parent_path, attribute) = match path.rsplit_once('.') {
            Some((parent, attribute)) => (Some(parent), attribute),
            None => (None, path),
        };
        let parent = selections
            .iter()
            .find(|s| s.path.as_deref() == parent_path)
            .cloned()
            .unwrap_or_else(|| root.clone());
        let relation = registry.relation(&parent.entity, attribute)?;
        let alias = format!("j{}", index + 1);
        let selection = Selection::new(registry, Some(path.to_string()), &relation.target, &alias)?;
        let on = match registry.join(&parent.entity, attribute)? {
            Join::Forward { column } => format!(
                "{} = {}",
                qualified(&alias, &selection.primary_key),
                qualified(&parent.alias, &column)
            ),
            Join::Reverse { column } => format!(
                "{} = {}",
                qualified(&alias, &column),
                qualified(&parent.alias, &parent.primary_key)
            ),
            Join::Link {
                table,
                source_column,
                target_column,
            } => {
                let link = format!("{}l", alias);
                joins.push(format!(
                    "LEFT JOIN {} {} ON {} = {}",
                    ident(&table),
                    link,
                    qualified(&link, source_column),
                    qualified(&parent.alias, &parent.primary_key)
                ));
                format!(
                    "{} = {}",
                    qualified(&alias, &selection.primary_key),
                    qualified(&link, target_column)
                )
            }
        };
        joins.push(format!("LEFT JOIN {} {} ON {}", ident(&relation.target), alias, on));
        selections.push(selection);
    }

    let mut columns = Vec::new();
    for selection in &selections {
        selection.push_columns(&mut columns);
    }
    let mut builder = QueryBuilder::new(format!(
        "SELECT {} FROM {} {}",
        columns.join(", "),
        ident(entity),
        ROOT_ALIAS
    ));
    for join in joins {
        builder.push(" ");
        builder.push(join);
    }

    let mut conditions = 0;
    if let Some(predicate) = predicate {
        builder.push(" WHERE ");
        PredicateWriter::new(registry).push(&mut builder, predicate)?;
        conditions += 1;
    }
    if let Some(key) = key {
        builder.push(if conditions > 0 { " AND " } else { " WHERE " });
        builder.push(format!("{} = ", qualified(ROOT_ALIAS, &root.primary_key)));
        push_key(&mut builder, key);
    }
    builder.push(format!(" ORDER BY {}", qualified(ROOT_ALIAS, &root.primary_key)));
    Ok((builder, selections))
}

/// Keyed load of `source.attribute` for a set of keys.
///
/// For forward joins the keys are the parents' foreign key values; otherwise
/// they are parent primary keys and every row carries its parent under
/// [`PARENT_LABEL`].
pub fn select_related<'args>(
    registry: &EntityRegistry,
    source: &str,
    attribute: &str,
    keys: &[Key],
) -> Result<(QueryBuilder<'args, Postgres>, Selection), SchemaError> {
    let relation = registry.relation(source, attribute)?;
    let selection = Selection::new(registry, Some(attribute.to_string()), &relation.target, ROOT_ALIAS)?;
    let mut columns = Vec::new();
    selection.push_columns(&mut columns);
    let pk = qualified(ROOT_ALIAS, &selection.primary_key);

    let mut builder = match registry.join(source, attribute)? {
        Join::Forward { .. } => {
            let mut builder = QueryBuilder::new(format!(
                "SELECT {} FROM {} {} WHERE {} IN ",
                columns.join(", "),
                ident(&relation.target),
                ROOT_ALIAS,
                pk
            ));
            push_keys(&mut builder, keys);
            builder
        }
        Join::Reverse { column } => {
            let parent = qualified(ROOT_ALIAS, &column);
            let mut builder = QueryBuilder::new(format!(
                "SELECT {} AS {}, {} FROM {} {} WHERE {} IN ",
                parent,
                ident(PARENT_LABEL),
                columns.join(", "),
                ident(&relation.target),
                ROOT_ALIAS,
                parent
            ));
            push_keys(&mut builder, keys);
            builder
        }
        Join::Link {
            table,
            source_column,
            target_column,
        } => {
            let parent = qualified("l", source_column);
            let mut builder = QueryBuilder::new(format!(
                "SELECT {} AS {}, {} FROM {} l JOIN {} {} ON {} = {} WHERE {} IN ",
                parent,
                ident(PARENT_LABEL),
                columns.join(", "),
                ident(&table),
                ident(&relation.target),
                ROOT_ALIAS,
                pk,
                qualified("l", target_column),
                parent
            ));
            push_keys(&mut builder, keys);
            builder
        }
    };
    builder.push(format!(" ORDER BY {}", pk));
    Ok((builder, selection))
}

/// `(k1, k2, ...)`; callers never pass an empty slice.
pub fn push_keys(builder: &mut QueryBuilder<'_, Postgres>, keys: &[Key]) {
    builder.push("(");
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            builder.push(", ");
        }
        push_key(builder, key);
    }
    builder.push(")");
}

pub fn insert<'args>(def: &EntityDef, values: &[(&String, &FieldValue)]) -> QueryBuilder<'args, Postgres> {
    let pk = ident(&def.primary_key().name);
    if values.is_empty() {
        return QueryBuilder::new(format!(
            "INSERT INTO {} DEFAULT VALUES RETURNING {}",
            ident(def.name()),
            pk
        ));
    }
    let columns: Vec<String> = values.iter().map(|(c, _)| ident(c)).collect();
    let mut builder = QueryBuilder::new(format!(
        "INSERT INTO {} ({}) VALUES (",
        ident(def.name()),
        columns.join(", ")
    ));
    for (i, (_, value)) in values.iter().enumerate() {
        if i > 0 {
            builder.push(", ");
        }
        push_value(&mut builder, value);
    }
    builder.push(format!(") RETURNING {}", pk));
    builder
}

pub fn update<'args>(
    def: &EntityDef,
    key: &Key,
    values: &[(&String, &FieldValue)],
) -> QueryBuilder<'args, Postgres> {
    let pk = ident(&def.primary_key().name);
    let mut builder = if values.is_empty() {
        QueryBuilder::new(format!("SELECT {} FROM {} WHERE {} = ", pk, ident(def.name()), pk))
    } else {
        let mut builder = QueryBuilder::new(format!("UPDATE {} SET ", ident(def.name())));
        for (i, (column, value)) in values.iter().enumerate() {
            if i > 0 {
                builder.push(", ");
            }
            builder.push(format!("{} = ", ident(column)));
            push_value(&mut builder, value);
        }
        builder.push(format!(" WHERE {} = ", pk));
        builder
    };
    push_key(&mut builder, key);
    if !values.is_empty() {
        builder.push(format!(" RETURNING {}", pk));
    }
    builder
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::filter_compiler::compile_filter;
    use crate::logic::predicate::bind;
    use crate::seed::library_registry;

    fn bound(filter: &str, entity: &str) -> BoundPredicate {
        let predicate = compile_filter(Some(filter)).unwrap().unwrap();
        bind(&predicate, &library_registry(), entity).unwrap()
    }

    #[test]
    fn test_schema_statements_cover_tables_links_and_foreign_keys() {
        let statements = schema_statements(&library_registry()).unwrap();
        assert!(statements.iter().any(|s| s.starts_with(
            "CREATE TABLE IF NOT EXISTS \"book\" (\"id\" BIGSERIAL PRIMARY KEY, \"title\" TEXT NOT NULL"
        )));
        assert!(statements.iter().any(|s| s.contains("\"author_id\" BIGINT NOT NULL")));
        assert!(statements.iter().any(|s| s.starts_with("CREATE TABLE IF NOT EXISTS \"book_tags\"")
            && s.contains("PRIMARY KEY (\"source_id\", \"target_id\")")));
        assert!(statements
            .iter()
            .any(|s| s.contains("REFERENCES \"publisher\" (\"id\") ON DELETE SET NULL")));
        // constraints come after every table exists
        let first_constraint = statements.iter().position(|s| s.starts_with("DO $$")).unwrap();
        assert!(statements[first_constraint..]
            .iter()
            .all(|s| s.starts_with("DO $$")));
    }

    #[test]
    fn test_select_left_joins_join_paths() {
        let registry = library_registry();
        let plan = QueryPlan {
            join_paths: ["publisher".to_string(), "profile".to_string()].into(),
            batch_paths: ["books".to_string()].into(),
        };
        let (builder, selections) = select(&registry, "author", &plan, None, None).unwrap();
        let sql = builder.sql();
        assert!(sql.contains("FROM \"author\" t0 LEFT JOIN \"profile\" j1 ON j1.\"author_id\" = t0.\"id\""));
        assert!(sql.contains("LEFT JOIN \"publisher\" j2 ON j2.\"id\" = t0.\"publisher_id\""));
        assert!(sql.contains("j2.\"name\" AS \"j2__name\""));
        assert!(sql.ends_with("ORDER BY t0.\"id\""));
        assert_eq!(selections.len(), 3);
        assert_eq!(selections[1].path.as_deref(), Some("profile"));
    }

    #[test]
    fn test_select_renders_filter_and_key() {
        let registry = library_registry();
        let predicate = bound("title[icontains]dune;!pages[gt]300", "book");
        let (builder, _) =
            select(&registry, "book", &QueryPlan::default(), Some(&predicate), Some(&Key::Int(1))).unwrap();
        let sql = builder.sql();
        assert!(sql.contains(
            "WHERE (COALESCE((STRPOS(LOWER(t0.\"title\"::text), LOWER($1)) > 0), FALSE) AND NOT COALESCE((t0.\"pages\" > $2), FALSE)) AND t0.\"id\" = $3"
        ));
    }

    #[test]
    fn test_nested_paths_become_exists_subqueries() {
        let registry = library_registry();
        let predicate = bound("tags.label[exact]classic,author.publisher.name[startswith]Ace", "book");
        let mut builder = QueryBuilder::<Postgres>::new("");
        PredicateWriter::new(&registry).push(&mut builder, &predicate).unwrap();
        let sql = builder.sql();
        assert!(sql.contains(
            "EXISTS (SELECT 1 FROM \"tag\" h1, \"book_tags\" l2 WHERE l2.\"source_id\" = t0.\"id\" AND l2.\"target_id\" = h1.\"id\" AND h1.\"label\" = $1)"
        ));
        assert!(sql.contains(
            "EXISTS (SELECT 1 FROM \"author\" h3, \"publisher\" h4 WHERE h3.\"id\" = t0.\"author_id\" AND h4.\"id\" = h3.\"publisher_id\" AND STARTS_WITH(h4.\"name\"::text, $2))"
        ));
        assert!(sql.contains(" OR "));
    }

    #[test]
    fn test_select_related_for_each_join_shape() {
        let registry = library_registry();
        let keys = [Key::Int(1), Key::Int(2)];

        let (builder, _) = select_related(&registry, "author", "books", &keys).unwrap();
        assert!(builder.sql().starts_with("SELECT t0.\"author_id\" AS \"__parent\""));
        assert!(builder.sql().contains("WHERE t0.\"author_id\" IN ($1, $2)"));

        let (builder, _) = select_related(&registry, "tag", "books", &keys).unwrap();
        assert!(builder.sql().contains(
            "FROM \"book_tags\" l JOIN \"book\" t0 ON t0.\"id\" = l.\"source_id\" WHERE l.\"target_id\" IN ($1, $2)"
        ));

        let (builder, _) = select_related(&registry, "book", "author", &keys).unwrap();
        assert!(builder.sql().contains("FROM \"author\" t0 WHERE t0.\"id\" IN ($1, $2)"));
    }

    #[test]
    fn test_insert_and_update_statements() {
        let registry = library_registry();
        let def = registry.get("tag").unwrap();
        let label = "label".to_string();
        let value = FieldValue::from("classic");

        let builder = insert(def, &[(&label, &value)]);
        assert_eq!(
            builder.sql(),
            "INSERT INTO \"tag\" (\"label\") VALUES ($1) RETURNING \"id\""
        );
        let builder = update(def, &Key::Int(3), &[(&label, &FieldValue::Null)]);
        assert_eq!(
            builder.sql(),
            "UPDATE \"tag\" SET \"label\" = NULL WHERE \"id\" = $1 RETURNING \"id\""
        );
        let builder = update(def, &Key::Int(3), &[]);
        assert_eq!(builder.sql(), "SELECT \"id\" FROM \"tag\" WHERE \"id\" = $1");
    }
}
