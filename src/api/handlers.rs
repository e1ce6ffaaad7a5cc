use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::Json,
    Json as RequestJson,
};
use log::{error, warn};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{CrudError, StoreError};
use crate::logic::crud::{DeleteReport, ListParams, ResourceService, UpdateMode, WriteResponse};
use crate::store::traits::EntityStore;

pub type AppState<S> = Arc<ResourceService<S>>;

type ApiResult<T> = Result<T, (StatusCode, Json<ErrorResponse>)>;

/// Simple health check endpoint
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: &str) -> Self {
        Self {
            error: message.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ResourceSummary {
    pub name: String,
    pub entity: String,
    pub filter_param: String,
}

/// HTTP status for each failure of a CRUD operation.
pub fn status_code(err: &CrudError) -> StatusCode {
    match err {
        CrudError::UnknownResource(_)
        | CrudError::NotFound { .. }
        | CrudError::Store(StoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
        CrudError::Store(StoreError::Integrity(_)) => StatusCode::CONFLICT,
        CrudError::Store(_) | CrudError::Schema(_) => StatusCode::INTERNAL_SERVER_ERROR,
        CrudError::Field(_)
        | CrudError::Filter(_)
        | CrudError::Relation(_)
        | CrudError::InvalidBody
        | CrudError::InvalidParameter { .. }
        | CrudError::MissingFields(_)
        | CrudError::InvalidFields(_)
        | CrudError::InvalidFieldValue { .. } => StatusCode::BAD_REQUEST,
    }
}

fn error_response(err: CrudError) -> (StatusCode, Json<ErrorResponse>) {
    let status = status_code(&err);
    if status.is_server_error() {
        error!("{}", err);
    } else {
        warn!("{}", err);
    }
    (status, Json(ErrorResponse::new(&err.to_string())))
}

/// Object payloads only; anything that is not JSON is an invalid body.
fn object_body(payload: Result<RequestJson<Value>, JsonRejection>) -> ApiResult<Value> {
    match payload {
        Ok(RequestJson(body)) if body.is_object() => Ok(body),
        _ => Err(error_response(CrudError::InvalidBody)),
    }
}

pub async fn list_resources<S: EntityStore>(
    State(service): State<AppState<S>>,
) -> Json<Vec<ResourceSummary>> {
    Json(
        service
            .resources()
            .map(|r| ResourceSummary {
                name: r.def.name.clone(),
                entity: r.def.entity.clone(),
                filter_param: r.def.filter_param.clone(),
            })
            .collect(),
    )
}

pub async fn list_objects<S: EntityStore>(
    State(service): State<AppState<S>>,
    Path(resource): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let filter_param = service
        .resource(&resource)
        .map_err(error_response)?
        .def
        .filter_param
        .clone();
    let params = ListParams::from_query(&query, &filter_param).map_err(error_response)?;
    service
        .list(&resource, &params)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn get_object<S: EntityStore>(
    State(service): State<AppState<S>>,
    Path((resource, id)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult<Json<Map<String, Value>>> {
    service
        .retrieve(&resource, &id, query.get("onlyFields").map(String::as_str))
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn create_object<S: EntityStore>(
    State(service): State<AppState<S>>,
    Path(resource): Path<String>,
    payload: Result<RequestJson<Value>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<WriteResponse>)> {
    let body = object_body(payload)?;
    match service.create(&resource, &body).await {
        Ok(response) => Ok((StatusCode::CREATED, Json(response))),
        Err(e) => Err(error_response(e)),
    }
}

async fn update_object<S: EntityStore>(
    service: &ResourceService<S>,
    resource: &str,
    id: &str,
    payload: Result<RequestJson<Value>, JsonRejection>,
    mode: UpdateMode,
) -> ApiResult<Json<WriteResponse>> {
    let body = object_body(payload)?;
    service
        .update(resource, id, &body, mode)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn replace_object<S: EntityStore>(
    State(service): State<AppState<S>>,
    Path((resource, id)): Path<(String, String)>,
    payload: Result<RequestJson<Value>, JsonRejection>,
) -> ApiResult<Json<WriteResponse>> {
    update_object(&service, &resource, &id, payload, UpdateMode::Replace).await
}

pub async fn patch_object<S: EntityStore>(
    State(service): State<AppState<S>>,
    Path((resource, id)): Path<(String, String)>,
    payload: Result<RequestJson<Value>, JsonRejection>,
) -> ApiResult<Json<WriteResponse>> {
    update_object(&service, &resource, &id, payload, UpdateMode::Patch).await
}

pub async fn delete_object<S: EntityStore>(
    State(service): State<AppState<S>>,
    Path((resource, id)): Path<(String, String)>,
) -> ApiResult<Json<DeleteReport>> {
    service
        .delete(&resource, &[Value::String(id)])
        .await
        .map(Json)
        .map_err(error_response)
}

/// Bulk delete with a `{"pks": [...]}` body.
pub async fn delete_objects<S: EntityStore>(
    State(service): State<AppState<S>>,
    Path(resource): Path<String>,
    payload: Result<RequestJson<Value>, JsonRejection>,
) -> ApiResult<Json<DeleteReport>> {
    let body = object_body(payload)?;
    let Some(Value::Array(pks)) = body.get("pks") else {
        return Err(error_response(CrudError::MissingFields(vec!["pks".to_string()])));
    };
    service
        .delete(&resource, pks)
        .await
        .map(Json)
        .map_err(error_response)
}
