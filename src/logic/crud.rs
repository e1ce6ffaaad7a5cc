use crate::error::{CrudError, FieldError, RelationWriteError};
use crate::logic::filter_compiler::compile_filter;
use crate::logic::pagination::paginate;
use crate::logic::plan::{build_query_plan, QueryPlan};
use crate::logic::predicate::bind;
use crate::logic::reconcile::{reconcile_relations, reconcile_scalar};
use crate::logic::resolve::{resolve_field_graph, resolve_only_fields};
use crate::logic::serialize::{serialize, serialize_all};
use crate::model::{
    EntityDef, EntityRegistry, FieldGraph, Key, PendingOperation, Record, ResourceDef, WriteTarget,
    WriteUnit,
};
use crate::store::{EntityStore, Query};
use futures::future::try_join_all;
use log::{debug, info};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// A resource definition compiled against the registry.
#[derive(Debug, Clone)]
pub struct Resource {
    pub def: ResourceDef,
    pub graph: Arc<FieldGraph>,
    pub plan: QueryPlan,
}

impl Resource {
    pub fn compile(def: ResourceDef, registry: &EntityRegistry) -> Result<Self, CrudError> {
        let graph = resolve_field_graph(registry, &def.fields, &def.entity, &def.private_fields)?;
        let plan = build_query_plan(&graph);
        Ok(Self {
            def,
            graph: Arc::new(graph),
            plan,
        })
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// The configured graph, or a request-scoped one built from `onlyFields`.
    pub fn graph_for(
        &self,
        registry: &EntityRegistry,
        only_fields: Option<&str>,
    ) -> Result<Arc<FieldGraph>, CrudError> {
        if !self.def.allow_only_fields {
            return Ok(self.graph.clone());
        }
        match only_fields.map(resolve_only_fields).transpose()?.flatten() {
            Some(spec) => Ok(Arc::new(resolve_field_graph(
                registry,
                &spec,
                &self.def.entity,
                &self.def.private_fields,
            )?)),
            None => Ok(self.graph.clone()),
        }
    }
}

/// Query parameters of a list request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListParams {
    pub only_fields: Option<String>,
    pub filter: Option<String>,
    pub pages: Option<usize>,
    pub items_per_page: Option<usize>,
}

impl ListParams {
    pub fn from_query(query: &HashMap<String, String>, filter_param: &str) -> Result<Self, CrudError> {
        let number = |param: &str| -> Result<Option<usize>, CrudError> {
            query
                .get(param)
                .filter(|v| !v.is_empty())
                .map(|v| {
                    v.parse().map_err(|_| CrudError::InvalidParameter {
                        param: param.to_string(),
                        value: v.clone(),
                    })
                })
                .transpose()
        };
        Ok(Self {
            only_fields: query.get("onlyFields").cloned(),
            filter: query.get(filter_param).cloned(),
            pages: number("pages")?,
            items_per_page: number("itemsPerPage")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// PUT: every required, updatable field must be supplied
    Replace,
    /// PATCH: only differing values are written, unknown keys are rejected
    Patch,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observation: Option<String>,
    #[serde(skip)]
    pub updated: Vec<String>,
    pub object: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observation: Option<String>,
    pub requested: usize,
    pub deleted: usize,
}

impl DeleteReport {
    fn new(ids: &str, requested: usize, deleted: usize) -> Self {
        if deleted < requested {
            Self {
                message: format!("Some elements identified in {} deleted successfully", ids),
                observation: Some(format!("Some elements in {} do not exist", ids)),
                requested,
                deleted,
            }
        } else {
            Self {
                message: format!("Elements identified by {} deleted successfully", ids),
                observation: None,
                requested,
                deleted,
            }
        }
    }

    pub fn is_partial(&self) -> bool {
        self.deleted < self.requested
    }
}

/// Generic CRUD operations over every configured resource.
pub struct ResourceService<S: EntityStore> {
    store: Arc<S>,
    resources: BTreeMap<String, Resource>,
}

impl<S: EntityStore> ResourceService<S> {
    pub fn new(store: Arc<S>, defs: Vec<ResourceDef>) -> Result<Self, CrudError> {
        let mut resources = BTreeMap::new();
        for def in defs {
            let resource = Resource::compile(def, store.registry())?;
            debug!(
                "Resource '{}' on '{}': join {:?}, batch {:?}",
                resource.name(),
                resource.def.entity,
                resource.plan.join_paths,
                resource.plan.batch_paths
            );
            resources.insert(resource.name().to_string(), resource);
        }
        Ok(Self { store, resources })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn registry(&self) -> &EntityRegistry {
        self.store.registry()
    }

    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    pub fn resource(&self, name: &str) -> Result<&Resource, CrudError> {
        self.resources
            .get(name)
            .ok_or_else(|| CrudError::UnknownResource(name.to_string()))
    }

    fn entity(&self, resource: &Resource) -> Result<&EntityDef, CrudError> {
        Ok(self.registry().get(&resource.def.entity)?)
    }

    fn parse_key(&self, resource: &Resource, id: &str) -> Result<Key, CrudError> {
        let entity = self.entity(resource)?;
        Key::parse(id, entity.key_type()).ok_or_else(|| CrudError::NotFound {
            resource: resource.name().to_string(),
            key: id.to_string(),
        })
    }

    async fn load(&self, resource: &Resource, key: &Key, plan: &QueryPlan) -> Result<Record, CrudError> {
        self.store
            .fetch_one(&resource.def.entity, key, plan)
            .await?
            .ok_or_else(|| CrudError::NotFound {
                resource: resource.name().to_string(),
                key: key.to_string(),
            })
    }

    pub async fn list(&self, name: &str, params: &ListParams) -> Result<Value, CrudError> {
        let resource = self.resource(name)?;
        let graph = resource.graph_for(self.registry(), params.only_fields.as_deref())?;

        let predicate = match compile_filter(params.filter.as_deref())? {
            Some(predicate) => {
                if let Some(private) = predicate
                    .conditions()
                    .into_iter()
                    .find(|c| resource.def.private_fields.contains(&c.path))
                {
                    return Err(FieldError::FieldIsPrivated(private.path.clone()).into());
                }
                debug!("Filtering '{}' by {}", name, predicate);
                Some(bind(&predicate, self.registry(), &resource.def.entity)?)
            }
            None => None,
        };

        let query = Query::new(&resource.def.entity, build_query_plan(&graph)).with_predicate(predicate);
        let records = self.store.fetch(&query).await?;
        let rendered: Vec<Value> = serialize_all(self.store.as_ref(), &records, &graph)
            .await?
            .into_iter()
            .map(Value::Object)
            .collect();

        if resource.def.allow_pagination {
            Ok(paginate(rendered, params.pages, params.items_per_page))
        } else {
            Ok(Value::Array(rendered))
        }
    }

    pub async fn retrieve(
        &self,
        name: &str,
        id: &str,
        only_fields: Option<&str>,
    ) -> Result<Map<String, Value>, CrudError> {
        let resource = self.resource(name)?;
        let graph = resource.graph_for(self.registry(), only_fields)?;
        let key = self.parse_key(resource, id)?;
        let record = self.load(resource, &key, &build_query_plan(&graph)).await?;
        Ok(serialize(self.store.as_ref(), &record, &graph).await?)
    }

    pub async fn create(&self, name: &str, body: &Value) -> Result<WriteResponse, CrudError> {
        let resource = self.resource(name)?;
        let entity = self.entity(resource)?;
        let data = body.as_object().ok_or(CrudError::InvalidBody)?;

        let missing: Vec<String> = entity
            .required_fields()
            .filter(|f| !data.contains_key(&f.name))
            .map(|f| f.name.clone())
            .collect();
        if !missing.is_empty() {
            return Err(CrudError::MissingFields(missing));
        }

        let mut record = Record::new(entity.name());
        let pk = &entity.primary_key().name;
        if let Some(raw) = data.get(pk).filter(|v| !v.is_null()) {
            let key = Key::from_json(raw, entity.key_type()).ok_or_else(|| {
                CrudError::InvalidFieldValue {
                    field: pk.clone(),
                    value: raw.to_string(),
                }
            })?;
            record.set(pk, key.into());
        }
        reconcile_scalar(&mut record, &resource.graph.local_fields, data, false)?;
        let (_, operations) = reconcile_relations(&record, &resource.graph.relations, data)?;
        self.verify_references(&operations).await?;

        let key = self
            .store
            .commit(WriteUnit {
                entity: entity.name().to_string(),
                target: WriteTarget::Insert,
                values: record.values,
                operations,
            })
            .await?;
        info!("Created {} {}", entity.name(), key);

        let stored = self.load(resource, &key, &resource.plan).await?;
        Ok(WriteResponse {
            message: format!("{} {} has been saved successfully", entity.name(), key),
            observation: None,
            updated: Vec::new(),
            object: serialize(self.store.as_ref(), &stored, &resource.graph).await?,
        })
    }

    pub async fn update(
        &self,
        name: &str,
        id: &str,
        body: &Value,
        mode: UpdateMode,
    ) -> Result<WriteResponse, CrudError> {
        let resource = self.resource(name)?;
        let entity = self.entity(resource)?;
        let data = body.as_object().ok_or(CrudError::InvalidBody)?;

        match mode {
            UpdateMode::Replace => {
                let missing: Vec<String> = entity
                    .required_fields()
                    .filter(|f| !resource.def.nonupdatable_fields.contains(&f.name))
                    .filter(|f| !data.contains_key(&f.name))
                    .map(|f| f.name.clone())
                    .collect();
                if !missing.is_empty() {
                    return Err(CrudError::MissingFields(missing));
                }
            }
            UpdateMode::Patch => {
                let invalid: Vec<String> = data
                    .keys()
                    .filter(|k| entity.field(k).is_none())
                    .cloned()
                    .collect();
                if !invalid.is_empty() {
                    return Err(CrudError::InvalidFields(invalid));
                }
            }
        }

        let updates: Map<String, Value> = data
            .iter()
            .filter(|(k, _)| !resource.def.nonupdatable_fields.contains(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let key = self.parse_key(resource, id)?;
        let mut record = self.load(resource, &key, &resource.plan).await?;
        let scalars = reconcile_scalar(
            &mut record,
            &resource.graph.local_fields,
            &updates,
            mode == UpdateMode::Patch,
        )?;
        let (relations, operations) = reconcile_relations(&record, &resource.graph.relations, &updates)?;

        if scalars.is_empty() && operations.is_empty() {
            return Ok(WriteResponse {
                message: "Nothing for update".to_string(),
                observation: None,
                updated: Vec::new(),
                object: serialize(self.store.as_ref(), &record, &resource.graph).await?,
            });
        }

        self.verify_references(&operations).await?;
        let values = scalars
            .iter()
            .map(|name| (name.clone(), record.get(name).clone()))
            .collect();
        self.store
            .commit(WriteUnit {
                entity: entity.name().to_string(),
                target: WriteTarget::Update(key.clone()),
                values,
                operations,
            })
            .await?;

        let mut updated: Vec<String> = scalars.into_iter().chain(relations).collect();
        updated.sort();
        info!("Updated {} {}: {}", entity.name(), key, updated.join(", "));

        let stored = self.load(resource, &key, &resource.plan).await?;
        Ok(WriteResponse {
            message: format!("'{} {}' updated successfully", entity.name(), key),
            observation: Some(format!("Fields updated: {}", updated.join(", "))),
            updated,
            object: serialize(self.store.as_ref(), &stored, &resource.graph).await?,
        })
    }

    pub async fn delete(&self, name: &str, ids: &[Value]) -> Result<DeleteReport, CrudError> {
        let resource = self.resource(name)?;
        let entity = self.entity(resource)?;
        let listed = Value::Array(ids.to_vec()).to_string();

        let keys: Vec<Key> = ids
            .iter()
            .filter_map(|id| Key::from_json(id, entity.key_type()))
            .collect();
        let deleted = if keys.is_empty() {
            0
        } else {
            self.store.delete_many(entity.name(), &keys).await?
        };

        if deleted == 0 {
            return Err(CrudError::NotFound {
                resource: name.to_string(),
                key: listed,
            });
        }
        info!("Deleted {} of {} {} rows", deleted, ids.len(), entity.name());
        Ok(DeleteReport::new(&listed, ids.len(), deleted))
    }

    /// Checks concurrently that every row a pending operation points at exists.
    async fn verify_references(&self, operations: &[PendingOperation]) -> Result<(), CrudError> {
        let checks = operations.iter().flat_map(|op| {
            op.referenced_keys().into_iter().map(move |(target, key)| async move {
                if self.store.exists(target, key).await? {
                    Ok::<(), CrudError>(())
                } else {
                    Err(RelationWriteError::RelatedObjectNotFound {
                        relation: op.attribute().to_string(),
                        key: key.to_string(),
                    }
                    .into())
                }
            })
        });
        try_join_all(checks).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FilterError, StoreError};
    use crate::seed::{library_registry, library_resources, load_seed_data};
    use crate::store::MemoryStore;
    use serde_json::json;

    async fn service() -> ResourceService<MemoryStore> {
        let store = Arc::new(MemoryStore::new(library_registry()));
        load_seed_data(store.as_ref()).await.unwrap();
        ResourceService::new(store, library_resources()).unwrap()
    }

    fn params(pairs: &[(&str, &str)]) -> ListParams {
        let query: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ListParams::from_query(&query, "filterBy").unwrap()
    }

    fn titles(list: &Value) -> Vec<&str> {
        list.as_array()
            .unwrap()
            .iter()
            .map(|b| b["title"].as_str().unwrap())
            .collect()
    }

    #[test]
    fn test_list_params_reject_non_numeric_pages() {
        let query: HashMap<String, String> = [("pages".to_string(), "two".to_string())].into();
        assert_eq!(
            ListParams::from_query(&query, "filterBy"),
            Err(CrudError::InvalidParameter {
                param: "pages".into(),
                value: "two".into()
            })
        );
    }

    #[tokio::test]
    async fn test_list_folds_filters_left_to_right() {
        let service = service().await;
        let list = service
            .list(
                "books",
                &params(&[
                    ("onlyFields", "title"),
                    (
                        "filterBy",
                        "author.name[exact]Frank Herbert;pages[gt]300,tags.label[exact]anthropology",
                    ),
                ]),
            )
            .await
            .unwrap();
        assert_eq!(
            titles(&list),
            vec!["Dune", "The Left Hand of Darkness", "The Dispossessed"]
        );
        assert_eq!(list[0], json!({"title": "Dune"}));
    }

    #[tokio::test]
    async fn test_list_endswith_ignores_case() {
        let service = service().await;
        let list = service
            .list(
                "books",
                &params(&[("onlyFields", "title"), ("filterBy", "title[endswith]DUNE")]),
            )
            .await
            .unwrap();
        assert_eq!(titles(&list), vec!["Dune"]);
    }

    #[tokio::test]
    async fn test_list_negation_and_owning_foreign_key() {
        let service = service().await;
        let list = service
            .list("books", &params(&[("filterBy", "author[exact]1;!in_print[exact]true")]))
            .await
            .unwrap();
        assert_eq!(list, json!([]));

        let list = service
            .list("books", &params(&[("filterBy", "author[in]2|3;published[year]1969")]))
            .await
            .unwrap();
        assert_eq!(titles(&list), vec!["The Left Hand of Darkness"]);
    }

    #[tokio::test]
    async fn test_list_rejects_private_and_unknown_filters() {
        let service = service().await;
        assert_eq!(
            service
                .list("authors", &params(&[("filterBy", "email[icontains]arrakis")]))
                .await,
            Err(CrudError::Field(FieldError::FieldIsPrivated("email".into())))
        );
        assert_eq!(
            service
                .list("books", &params(&[("filterBy", "title[like]Dune")]))
                .await,
            Err(CrudError::Filter(FilterError::UnknownFilterOperator("like".into())))
        );
        assert!(matches!(
            service.list("novels", &ListParams::default()).await,
            Err(CrudError::UnknownResource(_))
        ));
    }

    #[tokio::test]
    async fn test_list_paginates() {
        let service = service().await;
        let pages = service
            .list("tags", &params(&[("pages", "2")]))
            .await
            .unwrap();
        assert_eq!(pages["1"].as_array().unwrap().len(), 2);
        assert_eq!(pages["2"], json!([{"id": 3, "label": "anthropology"}]));

        let pages = service
            .list("books", &params(&[("itemsPerPage", "2"), ("pages", "1"), ("onlyFields", "id")]))
            .await
            .unwrap();
        assert_eq!(pages, json!({"1": [{"id": 1}, {"id": 2}]}));
    }

    #[tokio::test]
    async fn test_retrieve_renders_configured_graph() {
        let service = service().await;
        let author = service.retrieve("authors", "2", None).await.unwrap();
        assert!(author.get("email").is_none());
        assert_eq!(author["publisher"]["name"], "Ace Books");
        assert_eq!(
            author["books"][0]["tags"],
            json!([{"label": "classic"}, {"label": "anthropology"}])
        );

        let only = service.retrieve("authors", "2", Some("name,publisher.country")).await.unwrap();
        assert_eq!(
            Value::Object(only),
            json!({"name": "Ursula K. Le Guin", "publisher": {"country": "United States"}})
        );

        for id in ["99", "abc"] {
            assert!(matches!(
                service.retrieve("authors", id, None).await,
                Err(CrudError::NotFound { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_create_validates_before_writing() {
        let service = service().await;
        assert_eq!(
            service.create("books", &json!({"title": "Excession"})).await,
            Err(CrudError::MissingFields(vec!["author".into()]))
        );
        assert_eq!(
            service.create("books", &json!([1, 2])).await,
            Err(CrudError::InvalidBody)
        );
        assert_eq!(
            service
                .create("books", &json!({"title": "Excession", "author": 3, "tags": [2, 99]}))
                .await,
            Err(CrudError::Relation(RelationWriteError::RelatedObjectNotFound {
                relation: "tags".into(),
                key: "99".into()
            }))
        );
        assert_eq!(service.store().count("book"), 5);
    }

    #[tokio::test]
    async fn test_create_commits_scalars_and_relations() {
        let service = service().await;
        let created = service
            .create(
                "books",
                &json!({"title": "Excession", "pages": 451, "author": "3", "tags": [2], "price": ""}),
            )
            .await
            .unwrap();
        assert_eq!(created.message, "book 6 has been saved successfully");
        assert_eq!(created.object["author"], json!({"id": 3, "name": "Iain M. Banks"}));
        assert_eq!(created.object["tags"], json!([{"id": 2, "label": "space opera"}]));
        assert_eq!(created.object["price"], Value::Null);
    }

    #[tokio::test]
    async fn test_patch_reports_changed_fields_only() {
        let service = service().await;
        let response = service
            .update(
                "books",
                "1",
                &json!({"title": "Dune", "pages": 500, "tags": {"mode": "add", "to": [3]}}),
                UpdateMode::Patch,
            )
            .await
            .unwrap();
        assert_eq!(response.message, "'book 1' updated successfully");
        assert_eq!(response.observation.as_deref(), Some("Fields updated: pages, tags"));
        assert_eq!(response.object["pages"], 500);
        assert_eq!(response.object["tags"].as_array().unwrap().len(), 3);

        assert_eq!(
            service
                .update("books", "1", &json!({"nickname": "x"}), UpdateMode::Patch)
                .await,
            Err(CrudError::InvalidFields(vec!["nickname".into()]))
        );
        assert_eq!(
            service
                .update("books", "1", &json!({"title": "Dune"}), UpdateMode::Replace)
                .await,
            Err(CrudError::MissingFields(vec!["author".into()]))
        );
    }

    #[tokio::test]
    async fn test_rendered_scalars_patch_back_as_noop() {
        let service = service().await;
        let fields = "title,pages,price,published,in_print,metadata";
        let before = service.retrieve("books", "2", Some(fields)).await.unwrap();
        let response = service
            .update("books", "2", &Value::Object(before.clone()), UpdateMode::Patch)
            .await
            .unwrap();
        assert_eq!(response.message, "Nothing for update");
        assert!(response.updated.is_empty());
        let after = service.retrieve("books", "2", Some(fields)).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_nonupdatable_fields_are_ignored() {
        let service = service().await;
        let response = service
            .update("profiles", "1", &json!({"author": 2, "bio": "Dune"}), UpdateMode::Replace)
            .await
            .unwrap();
        assert_eq!(response.observation.as_deref(), Some("Fields updated: bio"));
        assert_eq!(response.object["author"]["id"], 1);
    }

    #[tokio::test]
    async fn test_failed_relation_write_keeps_scalars() {
        let service = service().await;
        let result = service
            .update(
                "books",
                "1",
                &json!({"title": "Children of Dune", "tags": {"mode": "sideways", "to": [1]}}),
                UpdateMode::Patch,
            )
            .await;
        assert!(matches!(
            result,
            Err(CrudError::Relation(RelationWriteError::InvalidRelationMode { .. }))
        ));
        let book = service.retrieve("books", "1", Some("title")).await.unwrap();
        assert_eq!(book["title"], "Dune");
    }

    #[tokio::test]
    async fn test_bulk_delete_reports() {
        let service = service().await;
        let report = service
            .delete("tags", &[json!(1), json!("2"), json!(99)])
            .await
            .unwrap();
        assert!(report.is_partial());
        assert_eq!(report.deleted, 2);
        assert_eq!(report.message, "Some elements identified in [1,\"2\",99] deleted successfully");

        assert!(matches!(
            service.delete("tags", &[json!(98), json!(99)]).await,
            Err(CrudError::NotFound { .. })
        ));
        assert!(matches!(
            service.delete("authors", &[json!(1)]).await,
            Err(CrudError::Store(StoreError::Integrity(_)))
        ));
    }
}
