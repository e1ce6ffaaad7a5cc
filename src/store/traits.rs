use crate::error::StoreError;
use crate::logic::plan::QueryPlan;
use crate::logic::predicate::BoundPredicate;
use crate::model::{EntityRegistry, Key, Record, WriteUnit};

/// A base query: every row of `entity` matching `predicate`, with the
/// relations named by `plan` materialized on each record.
#[derive(Debug, Clone)]
pub struct Query {
    pub entity: String,
    pub plan: QueryPlan,
    pub predicate: Option<BoundPredicate>,
}

impl Query {
    pub fn new(entity: &str, plan: QueryPlan) -> Self {
        Self {
            entity: entity.to_string(),
            plan,
            predicate: None,
        }
    }

    pub fn with_predicate(mut self, predicate: Option<BoundPredicate>) -> Self {
        self.predicate = predicate;
        self
    }
}

/// Storage collaborator behind the generic CRUD surface.
///
/// Rows come back in primary key order. `commit` applies the scalar
/// assignments and every pending relation operation of a unit atomically.
#[async_trait::async_trait]
pub trait EntityStore: Send + Sync {
    fn registry(&self) -> &EntityRegistry;

    async fn fetch(&self, query: &Query) -> Result<Vec<Record>, StoreError>;

    async fn fetch_one(
        &self,
        entity: &str,
        key: &Key,
        plan: &QueryPlan,
    ) -> Result<Option<Record>, StoreError>;

    /// Loads `source.attribute` for every parent in one round trip. Each
    /// related record is paired with the primary key of the parent it belongs to.
    async fn load_related(
        &self,
        source: &str,
        attribute: &str,
        parents: &[&Record],
    ) -> Result<Vec<(Key, Record)>, StoreError>;

    async fn exists(&self, entity: &str, key: &Key) -> Result<bool, StoreError>;

    /// Returns the primary key of the written row.
    async fn commit(&self, unit: WriteUnit) -> Result<Key, StoreError>;

    /// Deletes the rows that exist among `keys` and reports how many did.
    async fn delete_many(&self, entity: &str, keys: &[Key]) -> Result<usize, StoreError>;
}
