use crate::error::{CrudError, FieldError, FilterError};
use crate::model::{
    foreign_key_column, parse_date, Cardinality, Condition, Connector, EntityRegistry, FieldKind,
    FieldValue, Join, Operator, Predicate, Record, ScalarType,
};
use chrono::{Datelike, NaiveDate};

/// One relation traversal on the way to a filtered field.
#[derive(Debug, Clone, PartialEq)]
pub struct Hop {
    pub source: String,
    pub attribute: String,
    pub target: String,
    pub cardinality: Cardinality,
    pub join: Join,
}

/// Typed right-hand side of a condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Single(FieldValue),
    List(Vec<FieldValue>),
    Range(FieldValue, FieldValue),
    Text(String),
    Year(i32),
    Date(NaiveDate),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoundCondition {
    pub hops: Vec<Hop>,
    /// Column read on the last entity of the path
    pub column: String,
    pub scalar: ScalarType,
    pub operator: Operator,
    pub operand: Operand,
    pub negated: bool,
}

/// A predicate whose paths are resolved against the registry and whose
/// values are typed, ready for evaluation by a store.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundPredicate {
    Leaf(BoundCondition),
    Combine {
        connector: Connector,
        left: Box<BoundPredicate>,
        right: Box<BoundPredicate>,
    },
}

/// Navigation over already loaded records, used to evaluate multi-hop paths.
pub trait RecordGraph {
    fn follow<'a>(&'a self, record: &'a Record, hop: &Hop) -> Vec<&'a Record>;
}

pub fn bind(
    predicate: &Predicate,
    registry: &EntityRegistry,
    entity: &str,
) -> Result<BoundPredicate, CrudError> {
    Ok(match predicate {
        Predicate::Leaf(condition) => BoundPredicate::Leaf(bind_condition(condition, registry, entity)?),
        Predicate::Combine {
            connector,
            left,
            right,
        } => BoundPredicate::Combine {
            connector: *connector,
            left: Box::new(bind(left, registry, entity)?),
            right: Box::new(bind(right, registry, entity)?),
        },
    })
}

fn bind_condition(
    condition: &Condition,
    registry: &EntityRegistry,
    entity: &str,
) -> Result<BoundCondition, CrudError> {
    let segments: Vec<&str> = condition.path.split('.').collect();
    let (last, relations) = segments
        .split_last()
        .ok_or_else(|| FieldError::InvalidFieldFormat(condition.path.clone()))?;

    let mut hops = Vec::new();
    let mut current = registry.get(entity)?;
    for attribute in relations {
        let field = current
            .field(attribute)
            .ok_or_else(|| FieldError::FieldNotInModel {
                field: attribute.to_string(),
                entity: current.name().to_string(),
            })?;
        let relation = field
            .as_relation()
            .ok_or_else(|| FieldError::InvalidRelationField(attribute.to_string()))?;
        hops.push(Hop {
            source: current.name().to_string(),
            attribute: attribute.to_string(),
            target: relation.target.clone(),
            cardinality: relation.cardinality,
            join: registry.join(current.name(), attribute)?,
        });
        current = registry.get(&relation.target)?;
    }

    let field = current
        .field(last)
        .ok_or_else(|| FieldError::FieldNotInModel {
            field: last.to_string(),
            entity: current.name().to_string(),
        })?;
    // An owning to-one relation filters on its foreign key column
    let (column, scalar) = match &field.kind {
        FieldKind::Scalar(scalar) => (field.name.clone(), *scalar),
        FieldKind::Relation(relation) if relation.cardinality == Cardinality::ToOneOwning => (
            foreign_key_column(&field.name),
            registry.get(&relation.target)?.key_type(),
        ),
        FieldKind::Relation(_) => {
            return Err(FieldError::InvalidFieldFormat(condition.path.clone()).into())
        }
    };

    let operand = operand(condition, scalar)?;
    Ok(BoundCondition {
        hops,
        column,
        scalar,
        operator: condition.operator,
        operand,
        negated: condition.negated,
    })
}

fn operand(condition: &Condition, scalar: ScalarType) -> Result<Operand, FilterError> {
    let invalid = || FilterError::InvalidFilterValue {
        field: condition.path.clone(),
        value: condition.value.clone(),
    };
    let typed = |text: &str| scalar.parse_text(text).ok_or_else(invalid);
    let temporal = matches!(scalar, ScalarType::Date | ScalarType::Timestamp);

    Ok(match condition.operator {
        Operator::Exact | Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
            Operand::Single(typed(&condition.value)?)
        }
        Operator::IExact
        | Operator::Contains
        | Operator::IContains
        | Operator::StartsWith
        | Operator::IStartsWith
        | Operator::EndsWith => Operand::Text(condition.value.clone()),
        Operator::In => Operand::List(
            condition
                .value
                .split('|')
                .map(typed)
                .collect::<Result<_, _>>()?,
        ),
        Operator::Range => match condition.value.split('|').collect::<Vec<_>>().as_slice() {
            [low, high] => Operand::Range(typed(low)?, typed(high)?),
            _ => return Err(invalid()),
        },
        Operator::Year | Operator::IsoYear if temporal => {
            Operand::Year(condition.value.trim().parse().map_err(|_| invalid())?)
        }
        Operator::Date if temporal => {
            Operand::Date(parse_date(condition.value.trim()).ok_or_else(invalid)?)
        }
        Operator::Year | Operator::IsoYear | Operator::Date => return Err(invalid()),
    })
}

impl BoundPredicate {
    pub fn matches(&self, record: &Record, graph: &impl RecordGraph) -> bool {
        match self {
            BoundPredicate::Leaf(condition) => condition.matches(record, graph),
            BoundPredicate::Combine {
                connector: Connector::And,
                left,
                right,
            } => left.matches(record, graph) && right.matches(record, graph),
            BoundPredicate::Combine {
                connector: Connector::Or,
                left,
                right,
            } => left.matches(record, graph) || right.matches(record, graph),
        }
    }
}

impl BoundCondition {
    /// Multi-valued paths match when any reachable record matches; negation
    /// applies to that outcome.
    pub fn matches(&self, record: &Record, graph: &impl RecordGraph) -> bool {
        let mut frontier = vec![record];
        for hop in &self.hops {
            frontier = frontier
                .into_iter()
                .flat_map(|r| graph.follow(r, hop))
                .collect();
        }
        let found = frontier
            .iter()
            .any(|r| test_value(r.get(&self.column), self.operator, &self.operand));
        found != self.negated
    }
}

fn test_value(value: &FieldValue, operator: Operator, operand: &Operand) -> bool {
    use std::cmp::Ordering::*;

    if value.is_null() {
        return false;
    }
    let text = || value.as_text().unwrap_or_default();
    match (operator, operand) {
        (Operator::Exact, Operand::Single(expected)) => value.same_as(expected),
        (Operator::Gt, Operand::Single(bound)) => value.compare(bound) == Some(Greater),
        (Operator::Gte, Operand::Single(bound)) => {
            matches!(value.compare(bound), Some(Greater | Equal))
        }
        (Operator::Lt, Operand::Single(bound)) => value.compare(bound) == Some(Less),
        (Operator::Lte, Operand::Single(bound)) => matches!(value.compare(bound), Some(Less | Equal)),
        (Operator::In, Operand::List(options)) => options.iter().any(|o| value.same_as(o)),
        (Operator::Range, Operand::Range(low, high)) => {
            matches!(value.compare(low), Some(Greater | Equal))
                && matches!(value.compare(high), Some(Less | Equal))
        }
        (Operator::IExact, Operand::Text(t)) => text().to_lowercase() == t.to_lowercase(),
        (Operator::Contains, Operand::Text(t)) => text().contains(t.as_str()),
        (Operator::IContains, Operand::Text(t)) => text().to_lowercase().contains(&t.to_lowercase()),
        (Operator::StartsWith, Operand::Text(t)) => text().starts_with(t.as_str()),
        (Operator::IStartsWith, Operand::Text(t)) => {
            text().to_lowercase().starts_with(&t.to_lowercase())
        }
        (Operator::EndsWith, Operand::Text(t)) => text().to_lowercase().ends_with(&t.to_lowercase()),
        (Operator::Year, Operand::Year(year)) => date_of(value).is_some_and(|d| d.year() == *year),
        (Operator::IsoYear, Operand::Year(year)) => {
            date_of(value).is_some_and(|d| d.iso_week().year() == *year)
        }
        (Operator::Date, Operand::Date(date)) => date_of(value).is_some_and(|d| d == *date),
        _ => false,
    }
}

fn date_of(value: &FieldValue) -> Option<NaiveDate> {
    match value {
        FieldValue::Date(d) => Some(*d),
        FieldValue::Timestamp(ts) => Some(ts.date_naive()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::filter_compiler::compile_filter;
    use crate::model::parse_timestamp;
    use crate::seed::library_registry;
    use std::collections::HashMap;

    /// Follows owning to-one hops only, enough for these tests.
    #[derive(Default)]
    struct Rows(HashMap<(String, i64), Record>);

    impl RecordGraph for Rows {
        fn follow<'a>(&'a self, record: &'a Record, hop: &Hop) -> Vec<&'a Record> {
            match (&hop.join, record.get(&foreign_key_column(&hop.attribute))) {
                (Join::Forward { .. }, FieldValue::Int(id)) => {
                    self.0.get(&(hop.target.clone(), *id)).into_iter().collect()
                }
                _ => Vec::new(),
            }
        }
    }

    fn bound(filter: &str, entity: &str) -> Result<BoundPredicate, CrudError> {
        let predicate = compile_filter(Some(filter))?.unwrap();
        bind(&predicate, &library_registry(), entity)
    }

    fn authors() -> Vec<Record> {
        vec![
            Record::new("author").with("id", 1i64).with("name", "Bob"),
            Record::new("author").with("id", 2i64).with("name", "Alice"),
            Record::new("author").with("id", 3i64).with("name", "bob marley"),
        ]
    }

    fn matching(filter: &str, records: &[Record], rows: &Rows) -> Vec<i64> {
        let predicate = bound(filter, &records[0].entity).unwrap();
        records
            .iter()
            .filter(|r| predicate.matches(r, rows))
            .filter_map(|r| match r.get("id") {
                FieldValue::Int(i) => Some(*i),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_exact_matches_exactly_one() {
        assert_eq!(matching("name[exact]Bob", &authors(), &Rows::default()), vec![1]);
    }

    #[test]
    fn test_text_lookups() {
        let rows = Rows::default();
        assert_eq!(matching("name[iexact]BOB", &authors(), &rows), vec![1]);
        assert_eq!(matching("name[istartswith]bob", &authors(), &rows), vec![1, 3]);
        assert_eq!(matching("name[endswith]ice", &authors(), &rows), vec![2]);
        assert_eq!(matching("name[endswith]LEY", &authors(), &rows), vec![3]);
        assert_eq!(matching("!name[icontains]b", &authors(), &rows), vec![2]);
    }

    #[test]
    fn test_numeric_lookups_and_connectors() {
        let rows = Rows::default();
        assert_eq!(matching("id[in]1|3", &authors(), &rows), vec![1, 3]);
        assert_eq!(matching("id[range]2|3", &authors(), &rows), vec![2, 3]);
        assert_eq!(matching("name[exact]Bob;id[gt]1", &authors(), &rows), Vec::<i64>::new());
        assert_eq!(matching("name[exact]Bob,id[gt]1", &authors(), &rows), vec![1, 2, 3]);
        assert_eq!(matching("id[lte]2;id[gte]2", &authors(), &rows), vec![2]);
    }

    #[test]
    fn test_temporal_lookups() {
        let published = parse_timestamp("1965-08-01T12:00:00Z").unwrap();
        let books = vec![
            Record::new("book")
                .with("id", 1i64)
                .with("published", FieldValue::Timestamp(published)),
            Record::new("book").with("id", 2i64),
        ];
        let rows = Rows::default();
        assert_eq!(matching("published[year]1965", &books, &rows), vec![1]);
        assert_eq!(matching("published[date]1965-08-01", &books, &rows), vec![1]);
        assert_eq!(matching("published[iso_year]1965", &books, &rows), vec![1]);
        assert_eq!(matching("!published[year]1965", &books, &rows), vec![2]);
    }

    #[test]
    fn test_relation_paths_follow_foreign_keys() {
        let mut rows = Rows::default();
        for author in authors() {
            let id = match author.get("id") {
                FieldValue::Int(i) => *i,
                _ => unreachable!(),
            };
            rows.0.insert(("author".into(), id), author);
        }
        let books = vec![
            Record::new("book").with("id", 10i64).with("author_id", 1i64),
            Record::new("book").with("id", 11i64).with("author_id", 2i64),
        ];
        assert_eq!(matching("author.name[exact]Alice", &books, &rows), vec![11]);
        assert_eq!(matching("author[exact]1", &books, &rows), vec![10]);
    }

    #[test]
    fn test_bind_errors() {
        assert!(matches!(
            bound("nickname[exact]x", "author"),
            Err(CrudError::Field(FieldError::FieldNotInModel { .. }))
        ));
        assert!(matches!(
            bound("id[gt]abc", "author"),
            Err(CrudError::Filter(FilterError::InvalidFilterValue { .. }))
        ));
        assert!(matches!(
            bound("id[range]1", "author"),
            Err(CrudError::Filter(FilterError::InvalidFilterValue { .. }))
        ));
        assert!(matches!(
            bound("name[year]2020", "author"),
            Err(CrudError::Filter(FilterError::InvalidFilterValue { .. }))
        ));
        assert!(matches!(
            bound("name.id[exact]1", "author"),
            Err(CrudError::Field(FieldError::InvalidRelationField(_)))
        ));
    }
}
