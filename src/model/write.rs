use crate::error::RelationWriteError;
use crate::model::{FieldValue, Key};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Membership change applied to a to-many relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelationMode {
    Add,
    #[default]
    Set,
    Remove,
}

impl RelationMode {
    pub fn parse(mode: &str, relation: &str) -> Result<Self, RelationWriteError> {
        mode.parse().map_err(|_| RelationWriteError::InvalidRelationMode {
            mode: mode.to_string(),
            relation: relation.to_string(),
        })
    }
}

impl FromStr for RelationMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(RelationMode::Add),
            "set" => Ok(RelationMode::Set),
            "remove" => Ok(RelationMode::Remove),
            _ => Err(()),
        }
    }
}

/// Relation change staged by the reconciler and applied by the store inside
/// the same atomic unit as the scalar assignments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingOperation {
    /// Add, replace or remove members of a to-many relation
    Link {
        attribute: String,
        target: String,
        mode: RelationMode,
        keys: Vec<Key>,
    },
    /// Point a to-one relation at another row, or clear it with `None`
    Repoint {
        attribute: String,
        target: String,
        key: Option<Key>,
    },
}

impl PendingOperation {
    pub fn attribute(&self) -> &str {
        match self {
            PendingOperation::Link { attribute, .. } | PendingOperation::Repoint { attribute, .. } => {
                attribute
            }
        }
    }

    /// Rows of `target` this operation needs to exist before commit.
    pub fn referenced_keys(&self) -> Vec<(&str, &Key)> {
        match self {
            PendingOperation::Link {
                target, mode, keys, ..
            } if *mode != RelationMode::Remove => {
                keys.iter().map(|k| (target.as_str(), k)).collect()
            }
            PendingOperation::Repoint {
                target,
                key: Some(key),
                ..
            } => vec![(target.as_str(), key)],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteTarget {
    Insert,
    Update(Key),
}

/// Everything one create/update persists, committed or rolled back together.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteUnit {
    pub entity: String,
    pub target: WriteTarget,
    pub values: BTreeMap<String, FieldValue>,
    pub operations: Vec<PendingOperation>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relation_mode_parse() {
        assert_eq!(RelationMode::parse("add", "tags"), Ok(RelationMode::Add));
        assert_eq!(
            RelationMode::parse("merge", "tags"),
            Err(RelationWriteError::InvalidRelationMode {
                mode: "merge".into(),
                relation: "tags".into()
            })
        );
    }

    #[test]
    fn test_removal_references_nothing() {
        let op = PendingOperation::Link {
            attribute: "tags".into(),
            target: "tag".into(),
            mode: RelationMode::Remove,
            keys: vec![Key::Int(1)],
        };
        assert!(op.referenced_keys().is_empty());
        let clear = PendingOperation::Repoint {
            attribute: "author".into(),
            target: "author".into(),
            key: None,
        };
        assert!(clear.referenced_keys().is_empty());
    }
}
