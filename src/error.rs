use thiserror::Error;

/// Problems in the static entity descriptor tables.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("unknown entity '{0}'")]
    UnknownEntity(String),

    #[error("entity '{entity}' declares field '{field}' more than once")]
    DuplicateField { entity: String, field: String },

    #[error("entity '{0}' has no primary key")]
    MissingPrimaryKey(String),

    #[error("entity '{0}' declares more than one primary key")]
    MultiplePrimaryKeys(String),

    #[error("field '{entity}.{field}' must declare exactly one of a scalar type or a relation")]
    AmbiguousField { entity: String, field: String },

    #[error("primary key '{entity}.{field}' must be an integer, text or uuid scalar")]
    InvalidPrimaryKey { entity: String, field: String },

    #[error("relation '{entity}.{field}' targets unknown entity '{target}'")]
    UnknownTarget {
        entity: String,
        field: String,
        target: String,
    },

    #[error("relation '{entity}.{field}' is owned and must name its owning attribute in mapped_by")]
    MissingMappedBy { entity: String, field: String },

    #[error("relation '{entity}.{field}' is mapped by '{mapped_by}', which is not an owning relation of '{target}' back to '{entity}'")]
    InvalidMappedBy {
        entity: String,
        field: String,
        target: String,
        mapped_by: String,
    },
}

/// Field specification resolution errors. All of them are caller input errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
    #[error("'{field}' is not a valid field in relation '{entity}'")]
    FieldNotInModel { field: String, entity: String },

    #[error("The requested field '{0}' is privated")]
    FieldIsPrivated(String),

    #[error("Invalid format for field expression: {0}")]
    InvalidFieldFormat(String),

    #[error("Multiple relation level in expression '{0}'")]
    MultipleLevelRelation(String),

    #[error("{0} is not a relation field")]
    InvalidRelationField(String),

    #[error("Bad configuration, {field} is a relation in entity {entity}")]
    NotAScalarField { field: String, entity: String },

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("Lookup operator '{0}' is not supported")]
    UnknownFilterOperator(String),

    #[error("Invalid value '{value}' for the filter on '{field}'")]
    InvalidFilterValue { field: String, value: String },
}

/// Relation payload errors raised while reconciling a write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelationWriteError {
    #[error("No 'to' objects for relate in {0}")]
    EmptyToObjectsForRelate(String),

    #[error("'to' objects in {0} must be a pk identifiers")]
    InvalidToObjectsForRelate(String),

    #[error("Invalid relation mode '{mode}' in {relation}. Valid are add, set, remove. Default: set")]
    InvalidRelationMode { mode: String, relation: String },

    #[error("Invalid relation format in {0}")]
    InvalidRelationFormat(String),

    #[error("the type values provided in {0} is invalid")]
    InvalidValueInRelationKey(String),

    #[error("Doesn't exists the identified {relation} with {key}")]
    RelatedObjectNotFound { relation: String, key: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("{entity} identified by {key} does not exist")]
    NotFound { entity: String, key: String },

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Everything a generic CRUD operation can fail with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CrudError {
    #[error(transparent)]
    Field(#[from] FieldError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Relation(#[from] RelationWriteError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("unknown resource '{0}'")]
    UnknownResource(String),

    #[error("The requested object identified by {key} does not exist")]
    NotFound { resource: String, key: String },

    #[error("The request has not valid body")]
    InvalidBody,

    #[error("Invalid value '{value}' for query parameter '{param}'")]
    InvalidParameter { param: String, value: String },

    #[error("Some of the fields: {} are missing in request", .0.join(", "))]
    MissingFields(Vec<String>),

    #[error("Some of the fields: {} can't be found", .0.join(", "))]
    InvalidFields(Vec<String>),

    #[error("Invalid value {value} for field '{field}'")]
    InvalidFieldValue { field: String, value: String },
}
