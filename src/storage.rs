//! The storage collaborator.
//!
//! The engine never talks to a database directly; it hands compiled
//! [`StoragePredicate`]s and batched field requests to a [`Storage`]. Two
//! implementations ship with the crate: [`MemoryStorage`] here and
//! [`crate::persist::SqlitePersistor`].
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;
use tracing::trace;

use crate::compile::{Relation, StoragePredicate};
use crate::domain::compare_leaf;
use crate::field::FieldKind;
use crate::model::{Direction, ModelSchema, OrderBy};
use crate::value::{RecordId, Value};
use crate::{IdHasher, NameHasher};

/// Field name to value.
pub type Values = BTreeMap<String, Value>;
/// Record identity to the requested field values of that record.
pub type FieldRows = HashMap<RecordId, Values, IdHasher>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Backend failure: {0}")]
    Backend(String),
    #[error("No storage for model '{0}'")]
    UnknownModel(String),
    #[error("Model '{model}' has no stored field '{field}'")]
    UnknownField { model: String, field: String },
    #[error("Record {id} of '{model}' does not exist")]
    UnknownRecord { model: String, id: RecordId },
    #[error("Unsupported by this storage: {0}")]
    Unsupported(String),
    #[error("Storage call was cancelled")]
    Cancelled,
    #[error("Storage call timed out")]
    Timeout,
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Backend(e.to_string())
    }
}

/// Everything the engine needs from persistence. Implementations must be
/// shareable between threads; each call is one round trip.
pub trait Storage: Send + Sync {
    /// Reads `fields` for every record in `ids`. Records that do not exist
    /// are left out of the result.
    fn fetch_fields(
        &self,
        model: &ModelSchema,
        ids: &[RecordId],
        fields: &[String],
    ) -> Result<FieldRows, StorageError>;
    /// Identities of the records matching `predicate`, ordered by `order`
    /// with the identity as the final tie breaker.
    fn find_ids(
        &self,
        model: &ModelSchema,
        predicate: &StoragePredicate,
        order: &[OrderBy],
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<RecordId>, StorageError>;
    /// Writes the same `values` to every record in `ids`.
    fn persist_fields(&self, model: &ModelSchema, ids: &[RecordId], values: &Values) -> Result<(), StorageError>;
    fn create_record(&self, model: &ModelSchema, values: &Values) -> Result<RecordId, StorageError>;
    fn delete_records(&self, model: &ModelSchema, ids: &[RecordId]) -> Result<(), StorageError>;
}

// ------------- Memory storage -------------
#[derive(Default)]
struct MemoryTable {
    next_id: RecordId,
    rows: BTreeMap<RecordId, Values>,
}

#[derive(Default)]
struct LinkTable {
    columns: (String, String),
    pairs: Vec<(RecordId, RecordId)>,
}

#[derive(Default)]
struct MemoryState {
    tables: HashMap<String, MemoryTable, NameHasher>,
    links: HashMap<String, LinkTable, NameHasher>,
}

/// Keeps every model's records in memory. Counts fetch round trips so that
/// batching can be observed.
#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
    fetches: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
    /// Number of `fetch_fields` round trips served so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(AtomicOrdering::SeqCst)
    }
    pub fn reset_fetch_count(&self) {
        self.fetches.store(0, AtomicOrdering::SeqCst);
    }
    /// Number of stored records of a model.
    pub fn len(&self, model: &str) -> usize {
        self.lock()
            .map(|state| state.tables.get(model).map_or(0, |t| t.rows.len()))
            .unwrap_or(0)
    }
    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StorageError> {
        self.state
            .lock()
            .map_err(|_| StorageError::Backend("memory storage lock poisoned".to_string()))
    }
}

impl MemoryState {
    fn exists(&self, model: &str, id: RecordId) -> bool {
        self.tables.get(model).is_some_and(|t| t.rows.contains_key(&id))
    }
    fn linked(&self, table: &str, own: &str, id: RecordId, target_model: &str) -> Vec<RecordId> {
        let mut ids: Vec<RecordId> = match self.links.get(table) {
            Some(links) if links.columns.0 == own => {
                links.pairs.iter().filter(|(a, _)| *a == id).map(|(_, b)| *b).collect()
            }
            Some(links) => links.pairs.iter().filter(|(_, b)| *b == id).map(|(a, _)| *a).collect(),
            None => Vec::new(),
        };
        ids.retain(|target| self.exists(target_model, *target));
        ids.sort_unstable();
        ids.dedup();
        ids
    }
    fn inverse_of(&self, target_model: &str, inverse: &str, id: RecordId) -> Vec<RecordId> {
        match self.tables.get(target_model) {
            Some(table) => table
                .rows
                .iter()
                .filter(|(_, row)| row.get(inverse).and_then(Value::as_id) == Some(id))
                .map(|(rid, _)| *rid)
                .collect(),
            None => Vec::new(),
        }
    }
    fn related_ids(&self, relation: &Relation, id: RecordId, row: &Values) -> Vec<RecordId> {
        match relation.kind {
            FieldKind::Many2one => row
                .get(&relation.field)
                .and_then(|value| match value {
                    Value::Id(rid) => Some(*rid),
                    _ => None,
                })
                .into_iter()
                .collect(),
            FieldKind::One2many => match &relation.inverse {
                Some(inverse) => self.inverse_of(&relation.target_model, inverse, id),
                None => Vec::new(),
            },
            _ => match &relation.junction {
                Some(j) => self.linked(&j.table, &j.own_column, id, &relation.target_model),
                None => Vec::new(),
            },
        }
    }
    fn matches(&self, id: RecordId, row: &Values, predicate: &StoragePredicate) -> bool {
        match predicate {
            StoragePredicate::True => true,
            StoragePredicate::False => false,
            StoragePredicate::Compare { column, comparator, value } => {
                let actual = if column == "id" {
                    Value::Integer(id as i64)
                } else {
                    row.get(column).cloned().unwrap_or(Value::Null)
                };
                compare_leaf(&actual, *comparator, value)
            }
            StoragePredicate::Related { relation, inner } => {
                let table = match self.tables.get(&relation.target_model) {
                    Some(table) => table,
                    None => return false,
                };
                self.related_ids(relation, id, row).into_iter().any(|rid| {
                    table.rows.get(&rid).is_some_and(|related| self.matches(rid, related, inner))
                })
            }
            StoragePredicate::And(parts) => parts.iter().all(|p| self.matches(id, row, p)),
            StoragePredicate::Or(parts) => parts.iter().any(|p| self.matches(id, row, p)),
            StoragePredicate::Not(inner) => !self.matches(id, row, inner),
        }
    }
    fn set_links(&mut self, table: &str, own: &str, other: &str, id: RecordId, targets: &[RecordId]) {
        let links = self.links.entry(table.to_string()).or_insert_with(|| LinkTable {
            columns: (own.to_string(), other.to_string()),
            pairs: Vec::new(),
        });
        let forward = links.columns.0 == own;
        links.pairs.retain(|(a, b)| if forward { *a != id } else { *b != id });
        for target in targets {
            links.pairs.push(if forward { (id, *target) } else { (*target, id) });
        }
    }
}

fn column_value(id: RecordId, row: &Values, column: &str) -> Value {
    if column == "id" {
        Value::Integer(id as i64)
    } else {
        row.get(column).cloned().unwrap_or(Value::Null)
    }
}

impl Storage for MemoryStorage {
    fn fetch_fields(
        &self,
        model: &ModelSchema,
        ids: &[RecordId],
        fields: &[String],
    ) -> Result<FieldRows, StorageError> {
        self.fetches.fetch_add(1, AtomicOrdering::SeqCst);
        let state = self.lock()?;
        trace!("Fetching {:?} of {} '{}' records", fields, ids.len(), model.name());
        let mut rows = FieldRows::default();
        let table = match state.tables.get(model.name()) {
            Some(table) => table,
            None => return Ok(rows),
        };
        for &id in ids {
            let row = match table.rows.get(&id) {
                Some(row) => row,
                None => continue,
            };
            let mut values = Values::new();
            for name in fields {
                let value = if name == "id" {
                    Value::Integer(id as i64)
                } else {
                    let field = model.field(name).ok_or_else(|| StorageError::UnknownField {
                        model: model.name().to_string(),
                        field: name.clone(),
                    })?;
                    let target = field.relation_target().unwrap_or_default();
                    match field.kind() {
                        FieldKind::One2many => Value::Ids(
                            state.inverse_of(target, field.inverse_field().unwrap_or_default(), id),
                        ),
                        FieldKind::Many2many => match (field.junction_table(), field.junction_columns()) {
                            (Some(table), Some((own, _))) => Value::Ids(state.linked(table, own, id, target)),
                            _ => Value::Ids(Vec::new()),
                        },
                        _ => row.get(name).cloned().unwrap_or(Value::Null),
                    }
                };
                values.insert(name.clone(), value);
            }
            rows.insert(id, values);
        }
        Ok(rows)
    }

    fn find_ids(
        &self,
        model: &ModelSchema,
        predicate: &StoragePredicate,
        order: &[OrderBy],
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<RecordId>, StorageError> {
        let state = self.lock()?;
        let table = match state.tables.get(model.name()) {
            Some(table) => table,
            None => return Ok(Vec::new()),
        };
        let mut matched: Vec<(RecordId, &Values)> = table
            .rows
            .iter()
            .filter(|(id, row)| state.matches(**id, row, predicate))
            .map(|(id, row)| (*id, row))
            .collect();
        matched.sort_by(|(a, row_a), (b, row_b)| {
            for OrderBy { field, direction } in order {
                let ordering = column_value(*a, row_a, field).total_cmp(&column_value(*b, row_b, field));
                let ordering = match direction {
                    Direction::Asc => ordering,
                    Direction::Desc => ordering.reverse(),
                };
                if ordering.is_ne() {
                    return ordering;
                }
            }
            a.cmp(b)
        });
        Ok(matched
            .into_iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .map(|(id, _)| id)
            .collect())
    }

    fn persist_fields(&self, model: &ModelSchema, ids: &[RecordId], values: &Values) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        // nothing is written unless every field and every record is valid
        let mut fields = Vec::with_capacity(values.len());
        for (name, value) in values {
            let field = model.field(name).ok_or_else(|| StorageError::UnknownField {
                model: model.name().to_string(),
                field: name.clone(),
            })?;
            if field.kind() == FieldKind::One2many {
                return Err(StorageError::Unsupported(format!("'{}' is written through its inverse field", name)));
            }
            fields.push((field, name, value));
        }
        if let Some(&id) = ids.iter().find(|id| !state.exists(model.name(), **id)) {
            return Err(StorageError::UnknownRecord { model: model.name().to_string(), id });
        }
        for &id in ids {
            for (field, name, value) in &fields {
                if field.kind() == FieldKind::Many2many {
                    if let (Some(table), Some((own, other))) = (field.junction_table(), field.junction_columns()) {
                        state.set_links(table, own, other, id, &value.ids());
                    }
                } else if let Some(row) = state.tables.get_mut(model.name()).and_then(|t| t.rows.get_mut(&id)) {
                    row.insert((*name).clone(), (*value).clone());
                }
            }
        }
        Ok(())
    }

    fn create_record(&self, model: &ModelSchema, values: &Values) -> Result<RecordId, StorageError> {
        let mut state = self.lock()?;
        let table = state.tables.entry(model.name().to_string()).or_default();
        table.next_id += 1;
        let id = table.next_id;
        let mut row = Values::new();
        for field in model.columns() {
            row.insert(
                field.name().to_string(),
                values.get(field.name()).cloned().unwrap_or(Value::Null),
            );
        }
        table.rows.insert(id, row);
        for field in model.fields().filter(|f| f.kind() == FieldKind::Many2many && f.is_stored()) {
            if let (Some(value), Some(table), Some((own, other))) =
                (values.get(field.name()), field.junction_table(), field.junction_columns())
            {
                state.set_links(table, own, other, id, &value.ids());
            }
        }
        Ok(id)
    }

    fn delete_records(&self, model: &ModelSchema, ids: &[RecordId]) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        if let Some(table) = state.tables.get_mut(model.name()) {
            for id in ids {
                table.rows.remove(id);
            }
        }
        for field in model.fields().filter(|f| f.kind() == FieldKind::Many2many && f.is_stored()) {
            if let (Some(table), Some((own, other))) = (field.junction_table(), field.junction_columns()) {
                for &id in ids {
                    state.set_links(table, own, other, id, &[]);
                }
            }
        }
        Ok(())
    }
}
