//! Recordkit – declarative business-object models, domain expressions and record sets.
//!
//! Recordkit centers on three tightly coupled pieces:
//! * A [`registry::Registry`] holding one merged [`model::ModelSchema`] per model
//!   name, built from [`model::ModelDeclaration`]s that may extend a model in place
//!   (same-name patch) or inherit classically from parents.
//! * A [`domain::Domain`]: the nested, Polish-notation boolean query language
//!   (`['&', ('active', '=', true), ('age', '>', 18)]`) parsed into a
//!   [`domain::PredicateNode`] that is either evaluated in memory or compiled
//!   into a [`compile::StoragePredicate`] for the storage layer.
//! * A [`recordset::RecordSet`]: an ordered, deduplicated set of record
//!   identities bound to one model and an [`env::Env`], with set algebra,
//!   batched lazy field access and dependency-ordered computed fields.
//!
//! ## Modules
//! * [`value`] – record identities and the [`value::Value`] tagged union.
//! * [`field`] – field kinds and descriptors (defaults, selections, relations, compute).
//! * [`model`] – model declarations, merged schemas and ordering.
//! * [`registry`] – two-phase registration: mutable builder, then a published snapshot.
//! * [`domain`] / [`literal`] / [`compile`] – the query language, its textual
//!   literal form and its translation into storage predicates.
//! * [`storage`] / [`persist`] – the storage collaborator contract, an in-memory
//!   implementation and a SQLite one.
//! * [`security`] – the optional access-control collaborator (record rules).
//! * [`env`] / [`recordset`] – the record engine itself.
//! * [`config`] – engine configuration read through the `config` crate.
//!
//! ## Quick Start
//! ```
//! use std::sync::Arc;
//! use recordkit::{env::Env, field::FieldDescriptor, model::ModelDeclaration};
//! use recordkit::{domain::Domain, env::SearchOptions, registry::RegistryBuilder, storage::MemoryStorage, values};
//! let mut builder = RegistryBuilder::new();
//! builder.register(
//!     ModelDeclaration::new("res.partner")
//!         .field(FieldDescriptor::char("name"))
//!         .field(FieldDescriptor::integer("age")),
//! ).unwrap();
//! let registry = builder.publish().unwrap();
//! let env = Env::new(registry, Arc::new(MemoryStorage::new()));
//! env.create("res.partner", values! { "name" => "Alice", "age" => 20 }).unwrap();
//! let domain = Domain::parse_literal("[('age', '>', 18)]").unwrap();
//! let adults = env.search("res.partner", &domain, SearchOptions::default()).unwrap();
//! assert_eq!(adults.len(), 1);
//! ```
//!
//! ## License
//! Dual licensed under Apache-2.0 and MIT.

pub mod compile;
pub mod config;
pub mod domain;
pub mod env;
pub mod error;
pub mod field;
pub mod literal;
pub mod model;
pub mod persist;
pub mod recordset;
pub mod registry;
pub mod security;
pub mod storage;
pub mod value;

use core::hash::BuildHasherDefault;
use seahash::SeaHasher;
use thiserror::Error;

pub use crate::error::{DomainError, EngineError, SchemaError};
pub use crate::storage::{StorageError, Values};

// we use a fast hashing algo for maps keyed by model and field names
pub type NameHasher = BuildHasherDefault<SeaHasher>;
// and for maps keyed by record identities
pub type IdHasher = BuildHasherDefault<SeaHasher>;

#[derive(Error, Debug)]
pub enum RecordkitError {
    #[error("Config error: {0}")]
    Config(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub type Result<T> = std::result::Result<T, RecordkitError>;

impl From<StorageError> for RecordkitError {
    fn from(e: StorageError) -> Self {
        Self::Engine(EngineError::Storage(e))
    }
}

/// Builds a [`Values`] map from `"field" => value` pairs.
#[macro_export]
macro_rules! values {
    () => { $crate::Values::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut values = $crate::Values::new();
        $(
            values.insert(::std::string::String::from($key), $crate::value::Value::from($value));
        )+
        values
    }};
}
