use thiserror::Error;

use crate::security::Operation;
use crate::storage::StorageError;

/// Fatal problems found while registering or merging model declarations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("Unknown parent or extension target: {0}")]
    UnknownParent(String),
    #[error("Selection field '{field}' repeats the option value '{value}'")]
    InvalidSelection { field: String, value: String },
    #[error("Cyclic compute dependency through field '{0}'")]
    CyclicCompute(String),
    #[error("Cyclic inheritance through model '{0}'")]
    CyclicInheritance(String),
    #[error("Model '{0}' is declared more than once without extending it")]
    DuplicateModel(String),
    #[error("Table '{table}' is claimed by both '{first}' and '{second}'")]
    DuplicateTable { table: String, first: String, second: String },
    #[error("Invalid {what} name: '{name}'")]
    InvalidName { what: &'static str, name: String },
    #[error("Field '{0}' declares compute dependencies but no compute function")]
    MissingCompute(String),
    #[error("Declaration '{name}' extends a different model '{target}'")]
    ExtensionMismatch { name: String, target: String },
    #[error("Invalid order '{order}' on model '{model}': {reason}")]
    InvalidOrder { model: String, order: String, reason: String },
    #[error("The registry has been published; no further registration is allowed")]
    RegistryPublished,
}

/// Problems with a domain expression: the caller's query is invalid.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Malformed domain expression: {0}")]
    MalformedExpression(String),
    #[error("Unknown field path: {0}")]
    UnknownField(String),
    #[error("Unknown model: {0}")]
    UnknownModel(String),
    #[error("Unknown comparator: {0}")]
    UnknownComparator(String),
    #[error("Unsupported operator '{comparator}' on '{path}'")]
    UnsupportedOperator { path: String, comparator: String },
    #[error("Invalid value for '{path} {comparator}': {reason}")]
    InvalidValue { path: String, comparator: String, reason: String },
    #[error("Invalid order: {0}")]
    InvalidOrder(String),
    #[error("Domain literal error at {line}:{col}: {message}")]
    Literal { message: String, line: usize, col: usize },
}

/// Failures of record-set operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Record sets of '{left}' and '{right}' cannot be combined")]
    ModelMismatch { left: String, right: String },
    #[error("Expected a singleton record set, got {0} records")]
    NotSingleton(usize),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Invalid domain: {0}")]
    Domain(#[from] DomainError),
    #[error("Unknown model: {0}")]
    UnknownModel(String),
    #[error("Model '{model}' has no field '{field}'")]
    UnknownField { model: String, field: String },
    #[error("Field '{field}' of '{model}' is readonly")]
    ReadonlyField { model: String, field: String },
    #[error("Required field '{field}' of '{model}' is missing")]
    MissingRequired { model: String, field: String },
    #[error("Invalid value for '{model}.{field}': {reason}")]
    InvalidValue { model: String, field: String, reason: String },
    #[error("Field '{field}' of '{model}' is not of kind {expected}")]
    FieldType { model: String, field: String, expected: &'static str },
    #[error("Record {id} of '{model}' does not exist")]
    MissingRecord { model: String, id: u64 },
    #[error("Access denied: {operation} on '{model}'")]
    AccessDenied { model: String, operation: Operation },
    #[error("Cannot delete '{model}' records still referenced by '{referrer}'")]
    Restricted { model: String, referrer: String },
    #[error("Computing '{model}.{field}' failed: {message}")]
    Compute { model: String, field: String, message: String },
}

impl EngineError {
    /// True when the failure means "the query was invalid" rather than
    /// "the operation failed downstream".
    pub fn is_invalid_query(&self) -> bool {
        matches!(self, Self::Domain(_))
    }
}
