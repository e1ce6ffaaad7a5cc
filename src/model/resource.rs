use crate::model::{all_fields, EntityDef, FieldSpecNode};
use serde::Deserialize;
use std::collections::BTreeSet;

fn enabled() -> bool {
    true
}

fn default_filter_param() -> String {
    "filterBy".to_string()
}

/// REST exposure of one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResourceDef {
    /// URL segment, e.g. `books`
    pub name: String,
    pub entity: String,
    /// Fields served by default, every scalar field when omitted
    #[serde(default = "all_fields")]
    pub fields: Vec<FieldSpecNode>,
    /// Dot-qualified paths that are never exposed, e.g. `email` or `author.email`
    #[serde(default)]
    pub private_fields: BTreeSet<String>,
    #[serde(default)]
    pub nonupdatable_fields: BTreeSet<String>,
    /// Honor `onlyFields` on reads
    #[serde(default = "enabled")]
    pub allow_only_fields: bool,
    /// Honor `pages` / `itemsPerPage` on lists
    #[serde(default = "enabled")]
    pub allow_pagination: bool,
    #[serde(default = "default_filter_param")]
    pub filter_param: String,
}

impl ResourceDef {
    pub fn new(name: &str, entity: &str) -> Self {
        Self {
            name: name.to_string(),
            entity: entity.to_string(),
            fields: all_fields(),
            private_fields: BTreeSet::new(),
            nonupdatable_fields: BTreeSet::new(),
            allow_only_fields: true,
            allow_pagination: true,
            filter_param: default_filter_param(),
        }
    }

    pub fn for_entity(entity: &EntityDef) -> Self {
        Self::new(entity.name(), entity.name())
    }

    pub fn fields(mut self, fields: Vec<FieldSpecNode>) -> Self {
        self.fields = fields;
        self
    }

    pub fn private<'a>(mut self, paths: impl IntoIterator<Item = &'a str>) -> Self {
        self.private_fields
            .extend(paths.into_iter().map(str::to_string));
        self
    }

    pub fn nonupdatable<'a>(mut self, names: impl IntoIterator<Item = &'a str>) -> Self {
        self.nonupdatable_fields
            .extend(names.into_iter().map(str::to_string));
        self
    }
}
