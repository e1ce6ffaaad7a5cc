use crate::model::FieldGraph;
use itertools::Itertools;
use std::collections::BTreeSet;

/// Fetch configuration handed to the store before running the base query.
///
/// Join paths are to-one relations reachable without crossing a to-many
/// relation; they never multiply base rows. Everything else is loaded with a
/// separate keyed query per path and stitched back by parent key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryPlan {
    pub join_paths: BTreeSet<String>,
    pub batch_paths: BTreeSet<String>,
}

impl QueryPlan {
    pub fn build(graph: &FieldGraph) -> Self {
        Self {
            join_paths: graph.relations.join_fetch_paths(),
            batch_paths: graph.relations.batch_fetch_paths(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.join_paths.is_empty() && self.batch_paths.is_empty()
    }

    pub fn all_paths(&self) -> impl Iterator<Item = &String> {
        self.join_paths.iter().chain(self.batch_paths.iter())
    }

    /// Every path, parents before children, so a loader can walk them in order.
    pub fn paths_by_depth(&self) -> Vec<&str> {
        self.all_paths()
            .map(String::as_str)
            .sorted_by_key(|path| (path.matches('.').count(), *path))
            .collect()
    }
}

pub fn build_query_plan(graph: &FieldGraph) -> QueryPlan {
    QueryPlan::build(graph)
}
