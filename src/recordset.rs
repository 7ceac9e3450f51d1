//! Record sets: ordered, deduplicated ids of one model with a lazily filled
//! per-instance field cache.
//!
//! Reading a field that is not cached loads it for the whole set in one
//! storage round trip, together with every other plain column not loaded
//! yet. Relations are traversed in two explicit steps: the local field is
//! loaded, then the related records are materialized as one set of their
//! own, which is kept so that deeper paths reuse its cache.
use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::Range;
use std::rc::Rc;
use std::sync::Arc;

// used for deduplication and membership tests on ids
use roaring::RoaringTreemap;
use tracing::{debug, warn};

use chrono::{NaiveDate, NaiveDateTime};

use crate::compile::StoragePredicate;
use crate::domain::{Comparator, Condition, Domain, FieldPresence, PredicateNode, Row};
use crate::env::{Env, union_pending};
use crate::error::{DomainError, EngineError};
use crate::field::{FieldDescriptor, FieldKind, OnDelete};
use crate::model::ModelSchema;
use crate::security::Operation;
use crate::storage::Values;
use crate::value::{RecordId, Value};
use crate::{IdHasher, NameHasher};

// ------------- Cache -------------
#[derive(Clone, Debug, Default)]
struct FieldCache {
    loaded: HashSet<String, NameHasher>,
    rows: HashMap<RecordId, Values, IdHasher>,
}

impl FieldCache {
    fn is_loaded(&self, field: &str) -> bool {
        self.loaded.contains(field)
    }
    fn get(&self, id: RecordId, field: &str) -> Option<&Value> {
        self.rows.get(&id).and_then(|row| row.get(field))
    }
    fn fill(&mut self, field: &str, values: Vec<(RecordId, Value)>) {
        for (id, value) in values {
            self.rows.entry(id).or_default().insert(field.to_string(), value);
        }
        self.loaded.insert(field.to_string());
    }
    fn set_all(&mut self, ids: &[RecordId], field: &str, value: &Value) {
        for id in ids {
            self.rows.entry(*id).or_default().insert(field.to_string(), value.clone());
        }
        self.loaded.insert(field.to_string());
    }
    fn forget(&mut self, field: &str) {
        self.loaded.remove(field);
        for row in self.rows.values_mut() {
            row.remove(field);
        }
    }
    /// The part of this cache that concerns `ids`, all of which must be
    /// members of the set owning it.
    fn restrict(&self, ids: &[RecordId]) -> FieldCache {
        FieldCache {
            loaded: self.loaded.clone(),
            rows: ids
                .iter()
                .filter_map(|id| self.rows.get(id).map(|row| (*id, row.clone())))
                .collect(),
        }
    }
    /// Only fields loaded on both sides stay loaded.
    fn merge(&self, other: &FieldCache) -> FieldCache {
        let mut rows = other.rows.clone();
        for (id, row) in &self.rows {
            rows.insert(*id, row.clone());
        }
        FieldCache { loaded: self.loaded.intersection(&other.loaded).cloned().collect(), rows }
    }
}

fn is_missing(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Text(text) => text.is_empty(),
        _ => false,
    }
}

fn split_path(path: &str) -> (&str, Option<&str>) {
    match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    }
}

fn group_by_value(values: &[(RecordId, Value)]) -> Vec<(Value, Vec<RecordId>)> {
    let mut groups: Vec<(Value, Vec<RecordId>)> = Vec::new();
    for (id, value) in values {
        match groups.iter_mut().find(|(v, _)| v == value) {
            Some((_, ids)) => ids.push(*id),
            None => groups.push((value.clone(), vec![*id])),
        }
    }
    groups
}

/// Orders field values for sorting: nulls first, then by typed comparison.
#[derive(Clone, Debug)]
pub struct OrdValue(pub Value);

impl PartialEq for OrdValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for OrdValue {}
impl PartialOrd for OrdValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for OrdValue {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

// ------------- RecordSet -------------
#[derive(Clone)]
pub struct RecordSet {
    env: Env,
    model: Arc<ModelSchema>,
    ids: Vec<RecordId>,
    cache: RefCell<FieldCache>,
    related: RefCell<HashMap<String, Rc<RecordSet>, NameHasher>>,
    // read access already verified for these ids
    checked: Cell<bool>,
    readonly_writes: bool,
}

impl RecordSet {
    pub(crate) fn new(
        env: Env,
        model: Arc<ModelSchema>,
        ids: impl IntoIterator<Item = RecordId>,
        checked: bool,
    ) -> Self {
        let mut seen = RoaringTreemap::new();
        let ids = ids.into_iter().filter(|id| seen.insert(*id)).collect();
        Self {
            env,
            model,
            ids,
            cache: RefCell::default(),
            related: RefCell::default(),
            checked: Cell::new(checked),
            readonly_writes: false,
        }
    }

    /// A set over some of this set's ids, sharing what is cached for them.
    fn derive(&self, ids: Vec<RecordId>) -> RecordSet {
        let mut set = RecordSet::new(self.env.clone(), Arc::clone(&self.model), ids, self.checked.get());
        set.cache = RefCell::new(self.cache.borrow().restrict(&set.ids));
        set.readonly_writes = self.readonly_writes;
        set
    }

    pub fn env(&self) -> &Env {
        &self.env
    }
    pub fn model_name(&self) -> &str {
        self.model.name()
    }
    pub fn schema(&self) -> &Arc<ModelSchema> {
        &self.model
    }
    pub fn ids(&self) -> &[RecordId] {
        &self.ids
    }
    pub fn len(&self) -> usize {
        self.ids.len()
    }
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
    pub fn contains(&self, id: RecordId) -> bool {
        self.ids.contains(&id)
    }
    pub fn iter(&self) -> impl Iterator<Item = Record<'_>> + '_ {
        self.ids.iter().map(move |id| Record { set: self, id: *id })
    }
    pub fn get(&self, index: usize) -> Option<Record<'_>> {
        self.ids.get(index).map(|id| Record { set: self, id: *id })
    }
    pub fn first(&self) -> Option<Record<'_>> {
        self.get(0)
    }
    /// The members at positions `range`, clamped to the set's length.
    pub fn slice(&self, range: Range<usize>) -> RecordSet {
        let end = range.end.min(self.ids.len());
        let start = range.start.min(end);
        self.derive(self.ids[start..end].to_vec())
    }

    // ------------- Set algebra -------------
    fn same_model(&self, other: &RecordSet) -> Result<(), EngineError> {
        if self.model.name() != other.model.name() {
            return Err(EngineError::ModelMismatch {
                left: self.model.name().to_string(),
                right: other.model.name().to_string(),
            });
        }
        Ok(())
    }

    /// Members of either set: this set's order, then the new members of `other`.
    pub fn union(&self, other: &RecordSet) -> Result<RecordSet, EngineError> {
        self.same_model(other)?;
        let mut set = RecordSet::new(
            self.env.clone(),
            Arc::clone(&self.model),
            self.ids.iter().chain(other.ids.iter()).copied(),
            self.checked.get() && other.checked.get(),
        );
        set.cache = RefCell::new(self.cache.borrow().merge(&other.cache.borrow()));
        set.readonly_writes = self.readonly_writes;
        Ok(set)
    }

    pub fn intersect(&self, other: &RecordSet) -> Result<RecordSet, EngineError> {
        self.same_model(other)?;
        let members: RoaringTreemap = other.ids.iter().copied().collect();
        Ok(self.derive(self.ids.iter().copied().filter(|id| members.contains(*id)).collect()))
    }

    pub fn difference(&self, other: &RecordSet) -> Result<RecordSet, EngineError> {
        self.same_model(other)?;
        let members: RoaringTreemap = other.ids.iter().copied().collect();
        Ok(self.derive(self.ids.iter().copied().filter(|id| !members.contains(*id)).collect()))
    }

    // ------------- Filtering, sorting, mapping -------------
    pub fn filtered<F>(&self, mut predicate: F) -> Result<RecordSet, EngineError>
    where
        F: FnMut(&Record<'_>) -> Result<bool, EngineError>,
    {
        let mut kept = Vec::new();
        for record in self.iter() {
            if predicate(&record)? {
                kept.push(record.id);
            }
        }
        Ok(self.derive(kept))
    }

    /// Keeps the members that satisfy `domain`, evaluated on the cached
    /// values. Every path the domain mentions is loaded for the whole set first.
    pub fn filtered_domain(&self, domain: &Domain) -> Result<RecordSet, EngineError> {
        let node = domain.parse()?;
        for path in node.paths() {
            self.walk(path).map_err(|e| match e {
                EngineError::UnknownField { .. } => EngineError::Domain(DomainError::UnknownField(path.to_string())),
                other => other,
            })?;
            self.prefetch(path)?;
        }
        let matcher = node.matcher();
        let mut kept = Vec::new();
        for record in self.iter() {
            if matcher.matches(&record)? {
                kept.push(record.id);
            }
        }
        Ok(self.derive(kept))
    }

    /// Stable sort on a key; `reverse` inverts the comparison, so members
    /// with equal keys keep their relative order either way.
    pub fn sorted<K, F>(&self, mut key: F, reverse: bool) -> Result<RecordSet, EngineError>
    where
        K: Ord,
        F: FnMut(&Record<'_>) -> Result<K, EngineError>,
    {
        let mut keyed = Vec::with_capacity(self.ids.len());
        for record in self.iter() {
            keyed.push((key(&record)?, record.id));
        }
        if reverse {
            keyed.sort_by(|a, b| b.0.cmp(&a.0));
        } else {
            keyed.sort_by(|a, b| a.0.cmp(&b.0));
        }
        Ok(self.derive(keyed.into_iter().map(|(_, id)| id).collect()))
    }

    pub fn sorted_by(&self, path: &str, reverse: bool) -> Result<RecordSet, EngineError> {
        self.walk(path)?;
        self.prefetch(path)?;
        self.sorted(|record| record.get(path).map(OrdValue), reverse)
    }

    /// The values reached by `path` from every member, flattened across
    /// to-many relations. A path ending at a relational field yields the
    /// distinct related ids instead.
    pub fn mapped(&self, path: &str) -> Result<Vec<Value>, EngineError> {
        let kind = self.walk(path)?;
        self.prefetch(path)?;
        let mut values = Vec::with_capacity(self.ids.len());
        for id in &self.ids {
            match self.path_value(*id, path)? {
                Some(Value::List(items)) => values.extend(items),
                Some(value) => values.push(value),
                None => {}
            }
        }
        if kind.is_some_and(FieldKind::is_relational) {
            let mut seen = RoaringTreemap::new();
            return Ok(values
                .iter()
                .flat_map(Value::ids)
                .filter(|id| seen.insert(*id))
                .map(Value::Id)
                .collect());
        }
        Ok(values)
    }

    /// The records reached by a path of relational fields, as one set.
    pub fn mapped_records(&self, path: &str) -> Result<RecordSet, EngineError> {
        let (head, rest) = split_path(path);
        let related = self.related_set(head)?;
        let mut ids = Vec::new();
        for id in &self.ids {
            ids.extend(self.value_of(*id, head)?.ids());
        }
        let reached = related.derive(ids);
        match rest {
            Some(rest) => reached.mapped_records(rest),
            None => Ok(reached),
        }
    }

    pub fn ensure_one(&self) -> Result<Record<'_>, EngineError> {
        match self.ids.as_slice() {
            [id] => Ok(Record { set: self, id: *id }),
            ids => Err(EngineError::NotSingleton(ids.len())),
        }
    }

    pub fn display_names(&self) -> Result<Vec<String>, EngineError> {
        self.prefetch("display_name")?;
        self.ids.iter().map(|id| self.display_name(*id)).collect()
    }

    /// One map per member holding `id` and the requested fields; all
    /// non-binary fields when `fields` is empty.
    pub fn read(&self, fields: &[&str]) -> Result<Vec<Values>, EngineError> {
        let names: Vec<String> = if fields.is_empty() {
            self.model
                .fields()
                .filter(|f| f.kind() != FieldKind::Binary)
                .map(|f| f.name().to_string())
                .collect()
        } else {
            fields.iter().map(|f| f.to_string()).collect()
        };
        for name in &names {
            self.prefetch(name)?;
        }
        self.ids
            .iter()
            .map(|id| {
                let mut row = Values::new();
                row.insert("id".to_string(), self.value_of(*id, "id")?);
                for name in &names {
                    row.insert(name.clone(), self.path_value(*id, name)?.unwrap_or(Value::Null));
                }
                Ok(row)
            })
            .collect()
    }

    /// The members still present in storage.
    pub fn exists(&self) -> Result<RecordSet, EngineError> {
        if self.ids.is_empty() {
            return Ok(self.derive(Vec::new()));
        }
        let found: RoaringTreemap = self
            .env
            .storage()
            .find_ids(&self.model, &StoragePredicate::ids(&self.ids), &[], None, 0)?
            .into_iter()
            .collect();
        Ok(self.derive(self.ids.iter().copied().filter(|id| found.contains(*id)).collect()))
    }

    pub fn invalidate_cache(&self) {
        *self.cache.borrow_mut() = FieldCache::default();
        self.related.borrow_mut().clear();
    }

    pub fn invalidate_fields(&self, fields: &[&str]) {
        let mut cache = self.cache.borrow_mut();
        let mut related = self.related.borrow_mut();
        for field in fields {
            cache.forget(field);
            related.remove(*field);
        }
    }

    /// The same records, allowed to write readonly and stored computed fields.
    pub fn with_readonly_writes(&self) -> RecordSet {
        let mut set = self.clone();
        set.readonly_writes = true;
        set
    }

    // ------------- Materialization -------------
    fn descriptor(&self, name: &str) -> Result<&FieldDescriptor, EngineError> {
        self.model.field(name).ok_or_else(|| EngineError::UnknownField {
            model: self.model.name().to_string(),
            field: name.to_string(),
        })
    }

    fn invalid(&self, field: &str, reason: impl Into<String>) -> EngineError {
        EngineError::InvalidValue {
            model: self.model.name().to_string(),
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Resolves every segment of `path` through the registry without loading
    /// anything. Returns the kind of the last field, `None` for `display_name`.
    fn walk(&self, path: &str) -> Result<Option<FieldKind>, EngineError> {
        let unknown = || EngineError::UnknownField { model: self.model.name().to_string(), field: path.to_string() };
        let mut schema = Arc::clone(&self.model);
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            let last = segments.peek().is_none();
            if last && segment == "display_name" && !schema.has_field(segment) {
                return Ok(None);
            }
            let field = schema.field(segment).ok_or_else(unknown)?;
            if last {
                return Ok(Some(field.kind()));
            }
            let target = match field.relation_target() {
                Some(target) if field.kind().is_relational() => target.to_string(),
                _ => return Err(unknown()),
            };
            schema = self.env.schema(&target)?;
        }
        Err(unknown())
    }

    fn check_read(&self) -> Result<(), EngineError> {
        if !self.checked.get() {
            self.verify_access(Operation::Read)?;
            self.checked.set(true);
        }
        Ok(())
    }

    /// Fails unless every member may undergo `operation`, record rules included.
    pub(crate) fn verify_access(&self, operation: Operation) -> Result<(), EngineError> {
        let Some(domain) = self.env.access(self.model.name(), operation)? else {
            return Ok(());
        };
        if self.ids.is_empty() {
            return Ok(());
        }
        let rule = self.env.compile(&self.model, &domain.parse()?)?;
        let predicate = StoragePredicate::ids(&self.ids).and(rule);
        let allowed = self.env.storage().find_ids(&self.model, &predicate, &[], None, 0)?;
        if allowed.len() < self.ids.len() {
            warn!(
                "Record rules forbid {} on {} of {} '{}' records",
                operation,
                self.ids.len() - allowed.len(),
                self.ids.len(),
                self.model.name()
            );
            return Err(EngineError::AccessDenied { model: self.model.name().to_string(), operation });
        }
        Ok(())
    }

    /// Loads `name` for every member in one round trip, along with the
    /// other plain columns not loaded yet. Non-stored computed fields are
    /// computed for the whole set instead.
    fn ensure_loaded(&self, name: &str) -> Result<(), EngineError> {
        if name == "id" || self.cache.borrow().is_loaded(name) {
            return Ok(());
        }
        let field = self.descriptor(name)?;
        self.check_read()?;
        if field.is_computed() && !field.is_stored() {
            let values = self.compute_values(field)?;
            self.cache.borrow_mut().fill(name, values);
            return Ok(());
        }
        let mut names = vec![name.to_string()];
        {
            let cache = self.cache.borrow();
            names.extend(
                self.model
                    .columns()
                    .filter(|f| f.name() != name && f.kind() != FieldKind::Binary && !cache.is_loaded(f.name()))
                    .map(|f| f.name().to_string()),
            );
        }
        if !self.ids.is_empty() {
            let mut rows = self.env.storage().fetch_fields(&self.model, &self.ids, &names)?;
            debug!("Fetched {} fields of {} '{}' records", names.len(), self.ids.len(), self.model.name());
            let mut cache = self.cache.borrow_mut();
            for id in &self.ids {
                let mut row = rows.remove(id).ok_or_else(|| EngineError::MissingRecord {
                    model: self.model.name().to_string(),
                    id: *id,
                })?;
                let cached = cache.rows.entry(*id).or_default();
                for name in &names {
                    cached.insert(name.clone(), row.remove(name).unwrap_or(Value::Null));
                }
            }
        }
        self.cache.borrow_mut().loaded.extend(names);
        Ok(())
    }

    fn value_of(&self, id: RecordId, name: &str) -> Result<Value, EngineError> {
        if name == "id" {
            return Ok(Value::Integer(id as i64));
        }
        self.ensure_loaded(name)?;
        self.cache.borrow().get(id, name).cloned().ok_or_else(|| EngineError::MissingRecord {
            model: self.model.name().to_string(),
            id,
        })
    }

    fn display_name(&self, id: RecordId) -> Result<String, EngineError> {
        let rec_name = self.model.display_name_field();
        if rec_name != "id" {
            match self.value_of(id, rec_name)? {
                Value::Null => {}
                Value::Text(text) if text.is_empty() => {}
                Value::Text(text) => return Ok(text),
                other => return Ok(other.to_string()),
            }
        }
        Ok(format!("{},{}", self.model.name(), id))
    }

    /// The related records of a relational field, materialized once per set.
    fn related_set(&self, field: &str) -> Result<Rc<RecordSet>, EngineError> {
        if let Some(set) = self.related.borrow().get(field) {
            return Ok(Rc::clone(set));
        }
        let descriptor = self.descriptor(field)?;
        let target = match descriptor.relation_target() {
            Some(target) if descriptor.kind().is_relational() => target,
            _ => {
                return Err(EngineError::FieldType {
                    model: self.model.name().to_string(),
                    field: field.to_string(),
                    expected: "relational",
                });
            }
        };
        let schema = self.env.schema(target)?;
        self.ensure_loaded(field)?;
        let mut ids = Vec::new();
        {
            let cache = self.cache.borrow();
            for id in &self.ids {
                if let Some(value) = cache.get(*id, field) {
                    ids.extend(value.ids());
                }
            }
        }
        let set = Rc::new(RecordSet::new(self.env.clone(), schema, ids, false));
        self.related.borrow_mut().insert(field.to_string(), Rc::clone(&set));
        Ok(set)
    }

    /// Loads everything `path` needs, one batch per segment.
    pub(crate) fn prefetch(&self, path: &str) -> Result<(), EngineError> {
        let (head, rest) = split_path(path);
        if rest.is_none() && head == "display_name" && !self.model.has_field(head) {
            let rec_name = self.model.display_name_field();
            return self.ensure_loaded(rec_name);
        }
        self.ensure_loaded(head)?;
        if let Some(rest) = rest {
            self.related_set(head)?.prefetch(rest)?;
        }
        Ok(())
    }

    /// The value at `path` for one member. `None` when the path runs
    /// through an empty many-to-one; a `List` when it runs through a
    /// to-many field.
    fn path_value(&self, id: RecordId, path: &str) -> Result<Option<Value>, EngineError> {
        let (head, rest) = split_path(path);
        if rest.is_none() && head == "display_name" && !self.model.has_field(head) {
            return self.display_name(id).map(|name| Some(Value::Text(name)));
        }
        let value = self.value_of(id, head)?;
        let Some(rest) = rest else {
            return Ok(Some(value));
        };
        let related = self.related_set(head)?;
        match value {
            Value::Id(target) => related.path_value(target, rest),
            Value::Ids(targets) => {
                let mut reached = Vec::new();
                for target in targets {
                    match related.path_value(target, rest)? {
                        Some(Value::List(items)) => reached.extend(items),
                        Some(value) => reached.push(value),
                        None => {}
                    }
                }
                Ok(Some(Value::List(reached)))
            }
            _ => Ok(None),
        }
    }

    fn conform(&self, field: &FieldDescriptor, value: Value) -> Result<Value, EngineError> {
        if field.kind().is_x2many() && value.is_null() {
            return Ok(Value::Ids(Vec::new()));
        }
        let produced = value.kind_name();
        value.coerce_to(field.kind()).ok_or_else(|| EngineError::Compute {
            model: self.model.name().to_string(),
            field: field.name().to_string(),
            message: format!("produced a {} value for a {} field", produced, field.kind()),
        })
    }

    /// Computes a computed or related field for every member.
    fn compute_values(&self, field: &FieldDescriptor) -> Result<Vec<(RecordId, Value)>, EngineError> {
        if let Some(path) = field.related_path() {
            self.prefetch(path)?;
            let mut values = Vec::with_capacity(self.ids.len());
            for id in &self.ids {
                let value = match self.path_value(*id, path)? {
                    Some(Value::List(items)) => items.into_iter().next().unwrap_or(Value::Null),
                    Some(value) => value,
                    None => Value::Null,
                };
                values.push((*id, self.conform(field, value)?));
            }
            return Ok(values);
        }
        let Some(compute) = field.compute_fn() else {
            return Err(EngineError::Compute {
                model: self.model.name().to_string(),
                field: field.name().to_string(),
                message: "no compute function".to_string(),
            });
        };
        for dependency in field.compute_dependencies() {
            // unresolvable dependencies were reported when the registry was built
            if self.walk(dependency).is_ok() {
                self.prefetch(dependency)?;
            }
        }
        let mut values = Vec::with_capacity(self.ids.len());
        for id in &self.ids {
            let value = compute(&Record { set: self, id: *id })?;
            values.push((*id, self.conform(field, value)?));
        }
        Ok(values)
    }

    // ------------- Writing -------------
    fn prepare(&self, values: Values, creating: bool) -> Result<Values, EngineError> {
        let mut prepared = Values::new();
        for (name, value) in values {
            let field = self.descriptor(&name)?;
            let readonly = if field.is_computed() {
                !(self.readonly_writes && field.is_stored())
            } else {
                !creating && field.is_readonly() && !self.readonly_writes
            };
            if name == "id" || readonly {
                return Err(EngineError::ReadonlyField { model: self.model.name().to_string(), field: name });
            }
            if field.kind() == FieldKind::One2many {
                return Err(self.invalid(&name, "one2many fields are written through their inverse"));
            }
            let produced = value.kind_name();
            let value = value
                .coerce_to(field.kind())
                .ok_or_else(|| self.invalid(&name, format!("a {} value does not fit a {} field", produced, field.kind())))?;
            if let Value::Text(text) = &value {
                if field.kind() == FieldKind::Selection && !field.selection_options().iter().any(|(key, _)| key == text) {
                    return Err(self.invalid(&name, format!("'{}' is not one of the options", text)));
                }
                if let Some(size) = field.size_limit() {
                    if text.chars().count() > size {
                        return Err(self.invalid(&name, format!("longer than {} characters", size)));
                    }
                }
            }
            if !creating && field.is_required() && is_missing(&value) {
                return Err(EngineError::MissingRequired { model: self.model.name().to_string(), field: name });
            }
            prepared.insert(name, value);
        }
        Ok(prepared)
    }

    /// Writes the same values to every member, then recomputes what depends
    /// on them, here and in other models, before returning.
    pub fn write(&self, values: Values) -> Result<(), EngineError> {
        let values = self.prepare(values, false)?;
        if self.ids.is_empty() || values.is_empty() {
            return Ok(());
        }
        self.verify_access(Operation::Write)?;
        let changed: Vec<String> = values.keys().cloned().collect();
        let before = self.env.triggered(&self.model, &self.ids, &changed)?;
        self.env.storage().persist_fields(&self.model, &self.ids, &values)?;
        debug!("Wrote {:?} on {}", changed, self);
        {
            let mut cache = self.cache.borrow_mut();
            let mut related = self.related.borrow_mut();
            for (name, value) in &values {
                cache.set_all(&self.ids, name, value);
                related.remove(name);
            }
        }
        let rewritten = self.recompute(&changed, false)?;
        let mut touched = changed;
        touched.extend(rewritten);
        let after = self.env.triggered(&self.model, &self.ids, &touched)?;
        self.env.recompute_pending(union_pending(before, after), 0)
    }

    /// Recomputes the computed fields depending on `seeds`, transitively, and
    /// the seeds themselves when `include_seeds`. Stored ones are persisted;
    /// their names are returned.
    pub(crate) fn recompute(&self, seeds: &[String], include_seeds: bool) -> Result<Vec<String>, EngineError> {
        let mut affected: HashSet<String, NameHasher> = HashSet::default();
        if include_seeds {
            affected.extend(seeds.iter().cloned());
        }
        let mut frontier = seeds.to_vec();
        while let Some(field) = frontier.pop() {
            for dependent in self.model.dependents_of(&field) {
                if affected.insert(dependent.clone()) {
                    frontier.push(dependent.clone());
                }
            }
        }
        if affected.is_empty() {
            return Ok(Vec::new());
        }
        {
            let mut cache = self.cache.borrow_mut();
            for name in &affected {
                cache.forget(name);
                // relations the computation walks through may be stale too
                let paths = self.model.field(name).map(FieldDescriptor::compute_dependencies).unwrap_or_default();
                for path in paths {
                    if let Some((head, _)) = path.split_once('.') {
                        cache.forget(head);
                    }
                }
            }
            self.related.borrow_mut().clear();
        }
        let mut rewritten = Vec::new();
        for name in self.model.compute_order() {
            if !affected.contains(name) {
                continue;
            }
            let field = self.descriptor(name)?;
            if !field.is_stored() {
                continue;
            }
            let values = self.compute_values(field)?;
            for (value, ids) in group_by_value(&values) {
                let mut row = Values::new();
                row.insert(name.clone(), value);
                self.env.storage().persist_fields(&self.model, &ids, &row)?;
            }
            self.cache.borrow_mut().fill(name, values);
            rewritten.push(name.clone());
        }
        if !rewritten.is_empty() {
            debug!("Recomputed {:?} on {}", rewritten, self);
        }
        Ok(rewritten)
    }

    /// Deletes the members. Many-to-one fields elsewhere that point at them
    /// are handled per their `ondelete` policy first.
    pub fn unlink(&self) -> Result<(), EngineError> {
        if self.ids.is_empty() {
            return Ok(());
        }
        self.verify_access(Operation::Unlink)?;
        let registry = Arc::clone(self.env.registry());
        for (referrer, field) in registry.referrers(self.model.name()) {
            let node = PredicateNode::Leaf(Condition::new(field.name(), Comparator::In, Value::Ids(self.ids.clone())));
            let predicate = self.env.compile(&referrer, &node)?;
            let mut referencing = self.env.storage().find_ids(&referrer, &predicate, &[], None, 0)?;
            if referrer.name() == self.model.name() {
                referencing.retain(|id| !self.ids.contains(id));
            }
            if referencing.is_empty() {
                continue;
            }
            let dependents = RecordSet::new(self.env.sudo(), Arc::clone(&referrer), referencing, true);
            match field.on_delete() {
                OnDelete::Restrict => {
                    return Err(EngineError::Restricted {
                        model: self.model.name().to_string(),
                        referrer: referrer.name().to_string(),
                    });
                }
                OnDelete::Cascade => dependents.unlink()?,
                OnDelete::SetNull => {
                    let mut values = Values::new();
                    values.insert(field.name().to_string(), Value::Null);
                    dependents.with_readonly_writes().write(values)?;
                }
            }
        }
        let stored: Vec<String> = self.model.fields().filter(|f| f.is_stored()).map(|f| f.name().to_string()).collect();
        let pending = self.env.triggered(&self.model, &self.ids, &stored)?;
        self.env.storage().delete_records(&self.model, &self.ids)?;
        debug!("Deleted {}", self);
        self.invalidate_cache();
        self.env.recompute_pending(pending, 0)
    }

    /// Duplicates every member: copied fields are carried over, `overrides`
    /// wins over them and defaults fill the rest.
    pub fn copy(&self, overrides: Values) -> Result<RecordSet, EngineError> {
        let names: Vec<String> = self
            .model
            .fields()
            .filter(|f| f.name() != "id" && f.is_copied() && f.is_stored() && !f.is_computed())
            .map(|f| f.name().to_string())
            .collect();
        let mut created = Vec::with_capacity(self.ids.len());
        for id in &self.ids {
            let mut values = Values::new();
            for name in &names {
                values.insert(name.clone(), self.value_of(*id, name)?);
            }
            values.extend(overrides.clone());
            created.extend_from_slice(self.env.create(self.model.name(), values)?.ids());
        }
        Ok(RecordSet::new(self.env.clone(), Arc::clone(&self.model), created, true))
    }
}

pub(crate) fn create(env: &Env, model: &str, values: Values) -> Result<RecordSet, EngineError> {
    let schema = env.schema(model)?;
    env.access(model, Operation::Create)?;
    let draft = RecordSet::new(env.clone(), Arc::clone(&schema), [], true);
    let mut prepared = draft.prepare(values, true)?;
    for field in schema.fields() {
        if field.name() == "id" || field.is_computed() || !field.is_stored() || prepared.contains_key(field.name()) {
            continue;
        }
        let initial = field.initial_value();
        let produced = initial.kind_name();
        let initial = initial
            .coerce_to(field.kind())
            .ok_or_else(|| draft.invalid(field.name(), format!("the default is a {} value", produced)))?;
        prepared.insert(field.name().to_string(), initial);
    }
    for field in schema.fields() {
        if field.name() == "id" || !field.is_required() || field.is_computed() || !field.is_stored() {
            continue;
        }
        if prepared.get(field.name()).is_none_or(is_missing) {
            return Err(EngineError::MissingRequired { model: model.to_string(), field: field.name().to_string() });
        }
    }
    let id = env.storage().create_record(&schema, &prepared)?;
    let set = RecordSet::new(env.clone(), Arc::clone(&schema), [id], true);
    {
        let mut cache = set.cache.borrow_mut();
        for (name, value) in &prepared {
            cache.set_all(&[id], name, value);
        }
    }
    let stored_computed: Vec<String> = schema
        .compute_order()
        .iter()
        .filter(|name| schema.field(name).is_some_and(FieldDescriptor::is_stored))
        .cloned()
        .collect();
    let rewritten = set.recompute(&stored_computed, true)?;
    let mut touched: Vec<String> = prepared.into_keys().collect();
    touched.extend(rewritten);
    let pending = env.triggered(&schema, &[id], &touched)?;
    env.recompute_pending(pending, 0)?;
    debug!("Created {}", set);
    Ok(set)
}

impl fmt::Display for RecordSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<String> = self.ids.iter().map(|id| id.to_string()).collect();
        write!(f, "{}({})", self.model.name(), ids.join(", "))
    }
}

impl fmt::Debug for RecordSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordSet")
            .field("model", &self.model.name())
            .field("ids", &self.ids)
            .finish()
    }
}

// ------------- Record -------------
/// One member of a record set. Reads go through the set, so they load the
/// field for every member at once.
#[derive(Clone, Copy)]
pub struct Record<'a> {
    set: &'a RecordSet,
    id: RecordId,
}

impl<'a> Record<'a> {
    pub fn id(&self) -> RecordId {
        self.id
    }
    pub fn model_name(&self) -> &'a str {
        self.set.model.name()
    }
    pub fn env(&self) -> &'a Env {
        &self.set.env
    }
    /// The value at a possibly dotted path. Paths through to-many fields give
    /// a `List`; paths through an empty many-to-one give `Null`.
    pub fn get(&self, path: &str) -> Result<Value, EngineError> {
        self.set.prefetch(path)?;
        Ok(self.set.path_value(self.id, path)?.unwrap_or(Value::Null))
    }
    pub fn display_name(&self) -> Result<String, EngineError> {
        self.set.prefetch("display_name")?;
        self.set.display_name(self.id)
    }

    fn typed(&self, field: &str, expected: &'static str, accepts: fn(FieldKind) -> bool) -> Result<Value, EngineError> {
        if !accepts(self.set.descriptor(field)?.kind()) {
            return Err(EngineError::FieldType {
                model: self.set.model.name().to_string(),
                field: field.to_string(),
                expected,
            });
        }
        self.get(field)
    }
    pub fn text(&self, field: &str) -> Result<Option<String>, EngineError> {
        Ok(match self.typed(field, "char, text or selection", FieldKind::is_textual)? {
            Value::Text(text) => Some(text),
            _ => None,
        })
    }
    pub fn integer(&self, field: &str) -> Result<Option<i64>, EngineError> {
        Ok(self.typed(field, "integer", |k| k == FieldKind::Integer)?.as_i64())
    }
    pub fn float(&self, field: &str) -> Result<Option<f64>, EngineError> {
        Ok(self.typed(field, "float", |k| k == FieldKind::Float)?.as_f64())
    }
    pub fn boolean(&self, field: &str) -> Result<bool, EngineError> {
        Ok(self.typed(field, "boolean", |k| k == FieldKind::Boolean)?.as_bool().unwrap_or(false))
    }
    pub fn date(&self, field: &str) -> Result<Option<NaiveDate>, EngineError> {
        Ok(match self.typed(field, "date", |k| k == FieldKind::Date)? {
            Value::Date(date) => Some(date),
            _ => None,
        })
    }
    pub fn datetime(&self, field: &str) -> Result<Option<NaiveDateTime>, EngineError> {
        Ok(match self.typed(field, "datetime", |k| k == FieldKind::DateTime)? {
            Value::DateTime(datetime) => Some(datetime),
            _ => None,
        })
    }
    pub fn binary(&self, field: &str) -> Result<Option<Vec<u8>>, EngineError> {
        Ok(match self.typed(field, "binary", |k| k == FieldKind::Binary)? {
            Value::Binary(bytes) => Some(bytes),
            _ => None,
        })
    }
    pub fn many2one(&self, field: &str) -> Result<Option<RecordId>, EngineError> {
        Ok(self.typed(field, "many2one", |k| k == FieldKind::Many2one)?.as_id())
    }
    pub fn x2many(&self, field: &str) -> Result<Vec<RecordId>, EngineError> {
        Ok(self.typed(field, "one2many or many2many", FieldKind::is_x2many)?.ids())
    }
    /// The records a relational field of this record points at, sharing the
    /// cache of the batch they were loaded with.
    pub fn related(&self, field: &str) -> Result<RecordSet, EngineError> {
        let related = self.set.related_set(field)?;
        let ids = self.set.value_of(self.id, field)?.ids();
        Ok(related.derive(ids))
    }
}

impl Row for Record<'_> {
    type Error = EngineError;
    fn field(&self, path: &str) -> Result<FieldPresence, EngineError> {
        Ok(match self.set.path_value(self.id, path)? {
            Some(value) => FieldPresence::Present(value),
            None => FieldPresence::Missing,
        })
    }
}

impl fmt::Display for Record<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.set.model.name(), self.id)
    }
}
