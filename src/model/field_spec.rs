use serde::Deserialize;
use std::collections::BTreeMap;

pub const ALL_FIELDS: &str = "__all__";

/// One element of a declarative field specification.
///
/// In configuration files a scalar is a plain string, `"__all__"` expands to
/// every scalar field of the current entity, and a relation is a single-key
/// object mapping the relation name to its nested specification:
///
/// ```json
/// ["id", "name", {"books": ["title", {"tags": ["__all__"]}]}]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawNode")]
pub enum FieldSpecNode {
    All,
    Scalar(String),
    Relation(String, Vec<FieldSpecNode>),
}

impl FieldSpecNode {
    pub fn scalar(name: &str) -> Self {
        if name == ALL_FIELDS {
            FieldSpecNode::All
        } else {
            FieldSpecNode::Scalar(name.to_string())
        }
    }

    pub fn relation(name: &str, children: Vec<FieldSpecNode>) -> Self {
        FieldSpecNode::Relation(name.to_string(), children)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawNode {
    Name(String),
    Nested(BTreeMap<String, Vec<FieldSpecNode>>),
}

impl TryFrom<RawNode> for FieldSpecNode {
    type Error = String;

    fn try_from(raw: RawNode) -> Result<Self, Self::Error> {
        match raw {
            RawNode::Name(name) => Ok(FieldSpecNode::scalar(&name)),
            RawNode::Nested(map) if map.len() == 1 => {
                let (name, children) = map.into_iter().next().ok_or_else(String::new)?;
                Ok(FieldSpecNode::Relation(name, children))
            }
            RawNode::Nested(map) => Err(format!(
                "a nested field specification must name exactly one relation, got {}",
                map.len()
            )),
        }
    }
}

pub fn all_fields() -> Vec<FieldSpecNode> {
    vec![FieldSpecNode::All]
}
