use crate::error::{CrudError, RelationWriteError};
use crate::model::{
    foreign_key_column, Cardinality, FieldValue, Key, LocalField, PendingOperation, Record,
    Related, Relation, RelationGraph, RelationMode,
};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Missing text, null, and empty containers.
fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Blank values plus `false` and zero. Assigned scalars of this kind are stored as null.
fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        other => is_blank(other),
    }
}

/// Assigns the scalar updates present in `updates` onto `record`.
///
/// Primary keys are never assigned. With `strict_diff` only values that differ
/// from the current ones are assigned and reported; the comparison uses the
/// supplied value, so sending back a stored `false` or `0` is not a change.
/// Assigned falsy values are stored as null.
pub fn reconcile_scalar(
    record: &mut Record,
    fields: &[LocalField],
    updates: &Map<String, Value>,
    strict_diff: bool,
) -> Result<BTreeSet<String>, CrudError> {
    let mut updated = BTreeSet::new();
    for field in fields.iter().filter(|f| !f.is_primary_key()) {
        let Some(raw) = updates.get(field.name()) else {
            continue;
        };
        let supplied = if is_blank(raw) {
            FieldValue::Null
        } else {
            field
                .scalar_type()
                .from_json(raw)
                .ok_or_else(|| CrudError::InvalidFieldValue {
                    field: field.name().to_string(),
                    value: raw.to_string(),
                })?
        };

        let current = record.get(field.name());
        if strict_diff && (current == &supplied || current.same_as(&supplied)) {
            continue;
        }
        let value = if is_falsy(raw) { FieldValue::Null } else { supplied };
        record.set(field.name(), value);
        updated.insert(field.name().to_string());
    }
    Ok(updated)
}

/// Stages the relation updates present in `updates` for the top-level
/// relations of `graph`. Nothing is written here; re-points are verified and
/// applied when the unit is committed.
pub fn reconcile_relations(
    record: &Record,
    graph: &RelationGraph,
    updates: &Map<String, Value>,
) -> Result<(BTreeSet<String>, Vec<PendingOperation>), RelationWriteError> {
    let mut updated = BTreeSet::new();
    let mut operations = Vec::new();

    for relation in graph.roots() {
        let Some(payload) = updates.get(relation.attribute()) else {
            continue;
        };
        if relation.is_to_many() {
            operations.push(link_operation(relation, payload)?);
        } else {
            let key = to_one_key(relation, payload)?;
            if current_key(record, relation) == key {
                continue;
            }
            operations.push(PendingOperation::Repoint {
                attribute: relation.attribute().to_string(),
                target: relation.target().to_string(),
                key,
            });
        }
        updated.insert(relation.attribute().to_string());
    }
    Ok((updated, operations))
}

fn link_operation(relation: &Relation, payload: &Value) -> Result<PendingOperation, RelationWriteError> {
    let name = relation.attribute();
    let (mode, items) = match payload {
        Value::Array(items) => (RelationMode::Set, items),
        Value::Object(map) => {
            let to = map.get("to").unwrap_or(&Value::Null);
            if is_falsy(to) {
                return Err(RelationWriteError::EmptyToObjectsForRelate(name.to_string()));
            }
            let Value::Array(items) = to else {
                return Err(RelationWriteError::InvalidToObjectsForRelate(name.to_string()));
            };
            let mode = match map.get("mode") {
                None => RelationMode::default(),
                Some(m) if is_falsy(m) => RelationMode::default(),
                Some(Value::String(m)) => RelationMode::parse(m, name)?,
                Some(other) => RelationMode::parse(&other.to_string(), name)?,
            };
            (mode, items)
        }
        _ => return Err(RelationWriteError::InvalidRelationFormat(name.to_string())),
    };

    let keys = items
        .iter()
        .map(|item| {
            Key::from_json(item, relation.target_key_type())
                .ok_or_else(|| RelationWriteError::InvalidValueInRelationKey(name.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(PendingOperation::Link {
        attribute: name.to_string(),
        target: relation.target().to_string(),
        mode,
        keys,
    })
}

fn to_one_key(relation: &Relation, payload: &Value) -> Result<Option<Key>, RelationWriteError> {
    match payload {
        Value::Null => Ok(None),
        Value::String(_) | Value::Number(_) => Key::from_json(payload, relation.target_key_type())
            .map(Some)
            .ok_or_else(|| RelationWriteError::InvalidValueInRelationKey(relation.attribute().to_string())),
        _ => Err(RelationWriteError::InvalidRelationFormat(
            relation.attribute().to_string(),
        )),
    }
}

fn current_key(record: &Record, relation: &Relation) -> Option<Key> {
    match relation.cardinality() {
        Cardinality::ToOneOwning => {
            Key::from_field(record.get(&foreign_key_column(relation.attribute())))
        }
        _ => match record.related(relation.attribute()) {
            Some(Related::One(Some(related))) => Key::from_field(related.get(relation.target_key())),
            _ => None,
        },
    }
}
