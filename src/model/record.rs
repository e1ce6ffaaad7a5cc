use crate::model::{Cardinality, EntityDef, FieldValue, Key};
use std::collections::{BTreeMap, HashMap};

static NULL: FieldValue = FieldValue::Null;

/// Related data materialized alongside a record by a join or batch fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum Related {
    One(Option<Box<Record>>),
    Many(Vec<Record>),
}

impl Related {
    pub fn from_records(cardinality: Cardinality, mut records: Vec<Record>) -> Self {
        if cardinality.is_to_many() {
            Related::Many(records)
        } else if records.is_empty() {
            Related::One(None)
        } else {
            Related::One(Some(Box::new(records.swap_remove(0))))
        }
    }
}

/// One entity instance: column values plus any prefetched relations.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    pub entity: String,
    pub values: BTreeMap<String, FieldValue>,
    pub related: HashMap<String, Related>,
}

impl Record {
    pub fn new(entity: &str) -> Self {
        Self {
            entity: entity.to_string(),
            ..Self::default()
        }
    }

    pub fn with(mut self, column: &str, value: impl Into<FieldValue>) -> Self {
        self.set(column, value.into());
        self
    }

    /// Absent columns read as null.
    pub fn get(&self, column: &str) -> &FieldValue {
        self.values.get(column).unwrap_or(&NULL)
    }

    pub fn set(&mut self, column: &str, value: FieldValue) {
        self.values.insert(column.to_string(), value);
    }

    pub fn key(&self, def: &EntityDef) -> Option<Key> {
        Key::from_field(self.get(&def.primary_key().name))
    }

    pub fn related(&self, attribute: &str) -> Option<&Related> {
        self.related.get(attribute)
    }
}
