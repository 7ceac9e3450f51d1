// used for persistence
use rusqlite::functions::{Context as FunctionContext, FunctionFlags};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, params_from_iter};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::compile::{Relation, StoragePredicate};
use crate::domain::Comparator;
use crate::field::{FieldDescriptor, FieldKind};
use crate::model::{Direction, ModelSchema, OrderBy};
use crate::registry::Registry;
use crate::storage::{FieldRows, Storage, StorageError, Values};
use crate::value::{RecordId, Value, parse_date, parse_datetime};

// SQLite caps the number of host parameters per statement
const CHUNK: usize = 500;

/// Storage in SQLite: one table per model, keyed by an `id` integer primary
/// key, plus one junction table per many-to-many relation.
pub struct SqlitePersistor {
    db: Mutex<Connection>,
    registry: Arc<Registry>,
}

fn column_type(kind: FieldKind) -> &'static str {
    match kind {
        FieldKind::Integer | FieldKind::Boolean | FieldKind::Many2one => "integer",
        FieldKind::Float => "real",
        FieldKind::Binary => "blob",
        _ => "text",
    }
}

impl SqlitePersistor {
    pub fn new(connection: Connection, registry: Arc<Registry>) -> Result<Self, StorageError> {
        // like must agree with the in-memory evaluator, which is case sensitive
        connection.execute_batch("pragma case_sensitive_like = on;")?;
        // ilike folds case with str::to_lowercase, as the in-memory evaluator does,
        // where the builtin lower() only folds ASCII
        connection.create_scalar_function(
            "ulower",
            1,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            |ctx: &FunctionContext<'_>| {
                Ok(match ctx.get_raw(0) {
                    ValueRef::Text(text) => Some(String::from_utf8_lossy(text).to_lowercase()),
                    _ => None,
                })
            },
        )?;
        let mut schema = String::new();
        for model in registry.models() {
            let mut columns = String::new();
            for field in model.columns() {
                columns.push_str(&format!(",\n                \"{}\" {} null", field.name(), column_type(field.kind())));
            }
            schema.push_str(&format!(
                "
            create table if not exists \"{}\" (
                id integer primary key autoincrement{}
            );",
                model.table(),
                columns
            ));
            for field in model.columns().filter(|f| f.is_indexed() || f.kind() == FieldKind::Many2one) {
                schema.push_str(&format!(
                    "
            create index if not exists \"{table}_{field}_index\" on \"{table}\" (\"{field}\");",
                    table = model.table(),
                    field = field.name()
                ));
            }
            for field in model.fields().filter(|f| f.kind() == FieldKind::Many2many && f.is_stored()) {
                if let (Some(table), Some((own, other))) = (field.junction_table(), field.junction_columns()) {
                    schema.push_str(&format!(
                        "
            create table if not exists \"{table}\" (
                \"{own}\" integer not null,
                \"{other}\" integer not null,
                constraint unique_{table} unique (\"{own}\", \"{other}\")
            );",
                        table = table,
                        own = own,
                        other = other
                    ));
                }
            }
        }
        trace!("{}", schema);
        connection.execute_batch(&schema)?;
        debug!("Prepared SQLite schema for {} models", registry.len());
        Ok(Self { db: Mutex::new(connection), registry })
    }
    pub fn open_in_memory(registry: Arc<Registry>) -> Result<Self, StorageError> {
        Self::new(Connection::open_in_memory()?, registry)
    }
    pub fn open(path: &str, registry: Arc<Registry>) -> Result<Self, StorageError> {
        Self::new(Connection::open(path)?, registry)
    }
    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.db
            .lock()
            .map_err(|_| StorageError::Backend("connection lock poisoned".to_string()))
    }
    fn target_table(&self, field: &FieldDescriptor) -> Result<&str, StorageError> {
        self.registry
            .target_of(field)
            .map(|schema| schema.table())
            .ok_or_else(|| StorageError::UnknownModel(field.relation_target().unwrap_or_default().to_string()))
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn id_params(ids: &[RecordId]) -> Vec<Value> {
    ids.iter().map(|id| Value::Integer(*id as i64)).collect()
}

fn value_from_column(kind: FieldKind, value: ValueRef<'_>) -> Result<Value, StorageError> {
    let text = |bytes: &[u8]| String::from_utf8_lossy(bytes).into_owned();
    Ok(match (kind, value) {
        (_, ValueRef::Null) => Value::Null,
        (FieldKind::Boolean, ValueRef::Integer(i)) => Value::Bool(i != 0),
        (FieldKind::Integer, ValueRef::Integer(i)) => Value::Integer(i),
        (FieldKind::Float, ValueRef::Real(f)) => Value::Float(f),
        (FieldKind::Float, ValueRef::Integer(i)) => Value::Float(i as f64),
        (FieldKind::Many2one, ValueRef::Integer(i)) => Value::Id(i as RecordId),
        (FieldKind::Date, ValueRef::Text(t)) => parse_date(&text(t))
            .map(Value::Date)
            .ok_or_else(|| StorageError::Backend(format!("bad date '{}'", text(t))))?,
        (FieldKind::DateTime, ValueRef::Text(t)) => parse_datetime(&text(t))
            .map(Value::DateTime)
            .ok_or_else(|| StorageError::Backend(format!("bad datetime '{}'", text(t))))?,
        (FieldKind::Char | FieldKind::Text | FieldKind::Selection, ValueRef::Text(t)) => Value::Text(text(t)),
        (FieldKind::Binary, ValueRef::Blob(b)) => Value::Binary(b.to_vec()),
        (kind, other) => {
            return Err(StorageError::Backend(format!(
                "a {:?} value cannot be read into a {} field",
                other.data_type(),
                kind
            )));
        }
    })
}

// ------------- Predicate rendering -------------
fn render(predicate: &StoragePredicate, params: &mut Vec<Value>) -> Result<String, StorageError> {
    Ok(match predicate {
        StoragePredicate::True => "1".to_string(),
        StoragePredicate::False => "0".to_string(),
        StoragePredicate::Compare { column, comparator, value } => {
            format!("coalesce(({}), 0)", render_compare(column, *comparator, value, params)?)
        }
        StoragePredicate::Related { relation, inner } => {
            format!("coalesce(({}), 0)", render_related(relation, inner, params)?)
        }
        StoragePredicate::And(parts) if parts.is_empty() => "1".to_string(),
        StoragePredicate::Or(parts) if parts.is_empty() => "0".to_string(),
        StoragePredicate::And(parts) | StoragePredicate::Or(parts) => {
            let glue = if matches!(predicate, StoragePredicate::And(_)) { " and " } else { " or " };
            let mut rendered = Vec::with_capacity(parts.len());
            for part in parts {
                rendered.push(render(part, params)?);
            }
            format!("({})", rendered.join(glue))
        }
        StoragePredicate::Not(inner) => format!("not ({})", render(inner, params)?),
    })
}

fn render_related(relation: &Relation, inner: &StoragePredicate, params: &mut Vec<Value>) -> Result<String, StorageError> {
    let inner = render(inner, params)?;
    match relation.kind {
        FieldKind::Many2one => Ok(format!(
            "\"{}\" in (select id from \"{}\" where {})",
            relation.field, relation.target_table, inner
        )),
        FieldKind::One2many => {
            let inverse = relation
                .inverse
                .as_deref()
                .ok_or_else(|| StorageError::Unsupported(format!("'{}' has no inverse field", relation.field)))?;
            Ok(format!(
                "id in (select \"{}\" from \"{}\" where {})",
                inverse, relation.target_table, inner
            ))
        }
        _ => {
            let junction = relation
                .junction
                .as_ref()
                .ok_or_else(|| StorageError::Unsupported(format!("'{}' has no junction table", relation.field)))?;
            Ok(format!(
                "id in (select \"{}\" from \"{}\" where \"{}\" in (select id from \"{}\" where {}))",
                junction.own_column, junction.table, junction.target_column, relation.target_table, inner
            ))
        }
    }
}

fn render_compare(
    column: &str,
    comparator: Comparator,
    value: &Value,
    params: &mut Vec<Value>,
) -> Result<String, StorageError> {
    let c = format!("\"{}\"", column);
    let mut bind = |value: Value| {
        params.push(value);
        "?"
    };
    Ok(match comparator {
        Comparator::Eq => match value {
            Value::Null => format!("{} is null", c),
            Value::Bool(false) => format!("({c} is null or {c} = 0)", c = c),
            v => format!("{} = {}", c, bind(v.clone())),
        },
        Comparator::Ne => match value {
            Value::Null => format!("{} is not null", c),
            Value::Bool(false) => format!("({c} is not null and {c} != 0)", c = c),
            v => format!("({c} is null or {c} != {p})", c = c, p = bind(v.clone())),
        },
        Comparator::Gt | Comparator::Lt | Comparator::Ge | Comparator::Le if value.is_null() => "0".to_string(),
        Comparator::Gt => format!("{} > {}", c, bind(value.clone())),
        Comparator::Lt => format!("{} < {}", c, bind(value.clone())),
        Comparator::Ge => format!("{} >= {}", c, bind(value.clone())),
        Comparator::Le => format!("{} <= {}", c, bind(value.clone())),
        Comparator::Like | Comparator::ILike | Comparator::EqLike | Comparator::EqILike => {
            let pattern = value.as_str().unwrap_or_default();
            let pattern = match comparator {
                Comparator::Like | Comparator::ILike => format!("%{}%", pattern),
                _ => pattern.to_string(),
            };
            match comparator {
                Comparator::ILike | Comparator::EqILike => {
                    format!("ulower({}) like ulower({})", c, bind(Value::Text(pattern)))
                }
                _ => format!("{} like {}", c, bind(Value::Text(pattern))),
            }
        }
        Comparator::In | Comparator::NotIn => {
            let items: Vec<Value> = match value {
                Value::List(items) => items.clone(),
                Value::Ids(ids) => ids.iter().map(|id| Value::Id(*id)).collect(),
                other => vec![other.clone()],
            };
            let mut alternatives = Vec::new();
            if items.iter().any(Value::is_falsy) {
                alternatives.push(format!("{} is null", c));
            }
            let present: Vec<Value> = items.into_iter().filter(|v| !v.is_null()).collect();
            if !present.is_empty() {
                let marks: Vec<&str> = present.into_iter().map(&mut bind).collect();
                alternatives.push(format!("{} in ({})", c, marks.join(", ")));
            }
            let positive = if alternatives.is_empty() { "0".to_string() } else { alternatives.join(" or ") };
            if comparator == Comparator::In {
                positive
            } else {
                format!("not coalesce(({}), 0)", positive)
            }
        }
        Comparator::ChildOf | Comparator::ParentOf => {
            return Err(StorageError::Unsupported(format!("'{}' on '{}'", comparator, column)));
        }
    })
}

// ------------- Storage -------------
impl Storage for SqlitePersistor {
    fn fetch_fields(
        &self,
        model: &ModelSchema,
        ids: &[RecordId],
        fields: &[String],
    ) -> Result<FieldRows, StorageError> {
        let mut columns: Vec<&FieldDescriptor> = Vec::new();
        let mut to_many: Vec<&FieldDescriptor> = Vec::new();
        for name in fields.iter().filter(|name| name.as_str() != "id") {
            let field = model.field(name).ok_or_else(|| StorageError::UnknownField {
                model: model.name().to_string(),
                field: name.clone(),
            })?;
            if field.kind().is_x2many() {
                to_many.push(field);
            } else {
                columns.push(field);
            }
        }
        let wants_id = fields.iter().any(|name| name == "id");
        let db = self.lock()?;
        let mut rows = FieldRows::default();
        for chunk in ids.chunks(CHUNK) {
            let sql = format!(
                "select id{} from \"{}\" where id in ({})",
                columns.iter().map(|f| format!(", \"{}\"", f.name())).collect::<String>(),
                model.table(),
                placeholders(chunk.len())
            );
            trace!("{}", sql);
            let mut statement = db.prepare(&sql)?;
            let mut result = statement.query(params_from_iter(id_params(chunk).iter()))?;
            while let Some(row) = result.next()? {
                let id: i64 = row.get(0)?;
                let mut values = Values::new();
                if wants_id {
                    values.insert("id".to_string(), Value::Integer(id));
                }
                for (i, field) in columns.iter().enumerate() {
                    values.insert(field.name().to_string(), value_from_column(field.kind(), row.get_ref(i + 1)?)?);
                }
                rows.insert(id as RecordId, values);
            }
        }
        let found: Vec<RecordId> = ids.iter().copied().filter(|id| rows.contains_key(id)).collect();
        for field in to_many {
            let target = self.target_table(field)?;
            let sql_for = |count: usize| -> Result<String, StorageError> {
                Ok(match field.kind() {
                    FieldKind::One2many => {
                        let inverse = field.inverse_field().unwrap_or_default();
                        format!(
                            "select \"{inverse}\", id from \"{target}\" where \"{inverse}\" in ({p}) order by id",
                            inverse = inverse,
                            target = target,
                            p = placeholders(count)
                        )
                    }
                    _ => {
                        let (table, (own, other)) = match (field.junction_table(), field.junction_columns()) {
                            (Some(table), Some(columns)) => (table, columns),
                            _ => return Err(StorageError::Unsupported(format!("'{}' has no junction table", field.name()))),
                        };
                        format!(
                            "select j.\"{own}\", j.\"{other}\" from \"{table}\" j join \"{target}\" t on t.id = j.\"{other}\" where j.\"{own}\" in ({p}) order by j.\"{other}\"",
                            own = own,
                            other = other,
                            table = table,
                            target = target,
                            p = placeholders(count)
                        )
                    }
                })
            };
            let mut grouped: HashMap<RecordId, Vec<RecordId>> = HashMap::new();
            for chunk in found.chunks(CHUNK) {
                let sql = sql_for(chunk.len())?;
                trace!("{}", sql);
                let mut statement = db.prepare(&sql)?;
                let mut result = statement.query(params_from_iter(id_params(chunk).iter()))?;
                while let Some(row) = result.next()? {
                    let owner: i64 = row.get(0)?;
                    let related: i64 = row.get(1)?;
                    grouped.entry(owner as RecordId).or_default().push(related as RecordId);
                }
            }
            for id in &found {
                if let Some(values) = rows.get_mut(id) {
                    values.insert(field.name().to_string(), Value::Ids(grouped.remove(id).unwrap_or_default()));
                }
            }
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
        let mut params = Vec::new();
        let condition = render(predicate, &mut params)?;
        let mut ordering: Vec<String> = order
            .iter()
            .map(|OrderBy { field, direction }| match direction {
                Direction::Asc => format!("\"{}\" asc", field),
                Direction::Desc => format!("\"{}\" desc", field),
            })
            .collect();
        ordering.push("id asc".to_string());
        let limit = limit.map_or(-1, |l| l as i64);
        let sql = format!(
            "select id from \"{}\" where {} order by {} limit {} offset {}",
            model.table(),
            condition,
            ordering.join(", "),
            limit,
            offset
        );
        trace!("{} -- {:?}", sql, params);
        let db = self.lock()?;
        let mut statement = db.prepare(&sql)?;
        let ids = statement
            .query_map(params_from_iter(params.iter()), |row| row.get::<_, i64>(0))?
            .map(|id| id.map(|id| id as RecordId))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn persist_fields(&self, model: &ModelSchema, ids: &[RecordId], values: &Values) -> Result<(), StorageError> {
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        let mut assignments = Vec::new();
        let mut params = Vec::new();
        let mut links = Vec::new();
        for (name, value) in values {
            let field = model.field(name).ok_or_else(|| StorageError::UnknownField {
                model: model.name().to_string(),
                field: name.clone(),
            })?;
            match field.kind() {
                FieldKind::One2many => {
                    return Err(StorageError::Unsupported(format!("'{}' is written through its inverse field", name)));
                }
                FieldKind::Many2many => links.push((field, value.ids())),
                _ => {
                    assignments.push(format!("\"{}\" = ?", name));
                    params.push(value.clone());
                }
            }
        }
        for chunk in ids.chunks(CHUNK) {
            // returning drops the transaction, rolling back earlier chunks
            if let Some(id) = first_missing(&tx, model, chunk)? {
                return Err(StorageError::UnknownRecord { model: model.name().to_string(), id });
            }
            if !assignments.is_empty() {
                let sql = format!(
                    "update \"{}\" set {} where id in ({})",
                    model.table(),
                    assignments.join(", "),
                    placeholders(chunk.len())
                );
                trace!("{}", sql);
                let mut all = params.clone();
                all.extend(id_params(chunk));
                tx.execute(&sql, params_from_iter(all.iter()))?;
            }
            for (field, targets) in &links {
                replace_links(&tx, field, chunk, targets)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn create_record(&self, model: &ModelSchema, values: &Values) -> Result<RecordId, StorageError> {
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        let mut names = Vec::new();
        let mut params = Vec::new();
        for field in model.columns() {
            if let Some(value) = values.get(field.name()) {
                names.push(format!("\"{}\"", field.name()));
                params.push(value.clone());
            }
        }
        let sql = if names.is_empty() {
            format!("insert into \"{}\" default values", model.table())
        } else {
            format!(
                "insert into \"{}\" ({}) values ({})",
                model.table(),
                names.join(", "),
                placeholders(names.len())
            )
        };
        trace!("{}", sql);
        tx.execute(&sql, params_from_iter(params.iter()))?;
        let id = tx.last_insert_rowid() as RecordId;
        for field in model.fields().filter(|f| f.kind() == FieldKind::Many2many && f.is_stored()) {
            if let Some(value) = values.get(field.name()) {
                replace_links(&tx, field, &[id], &value.ids())?;
            }
        }
        tx.commit()?;
        Ok(id)
    }

    fn delete_records(&self, model: &ModelSchema, ids: &[RecordId]) -> Result<(), StorageError> {
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        for chunk in ids.chunks(CHUNK) {
            for field in model.fields().filter(|f| f.kind() == FieldKind::Many2many && f.is_stored()) {
                replace_links(&tx, field, chunk, &[])?;
            }
            let sql = format!("delete from \"{}\" where id in ({})", model.table(), placeholders(chunk.len()));
            trace!("{}", sql);
            tx.execute(&sql, params_from_iter(id_params(chunk).iter()))?;
        }
        tx.commit()?;
        Ok(())
    }
}

/// The first of `ids` with no row in the model's table.
fn first_missing(db: &Connection, model: &ModelSchema, ids: &[RecordId]) -> Result<Option<RecordId>, StorageError> {
    let sql = format!("select id from \"{}\" where id in ({})", model.table(), placeholders(ids.len()));
    let mut statement = db.prepare(&sql)?;
    let found = statement
        .query_map(params_from_iter(id_params(ids).iter()), |row| row.get::<_, i64>(0))?
        .map(|id| id.map(|id| id as RecordId))
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(ids.iter().copied().find(|id| !found.contains(id)))
}

/// Replaces the links of every record in `ids` by links to `targets`.
fn replace_links(
    db: &Connection,
    field: &FieldDescriptor,
    ids: &[RecordId],
    targets: &[RecordId],
) -> Result<(), StorageError> {
    let (table, (own, other)) = match (field.junction_table(), field.junction_columns()) {
        (Some(table), Some(columns)) => (table, columns),
        _ => return Err(StorageError::Unsupported(format!("'{}' has no junction table", field.name()))),
    };
    let sql = format!("delete from \"{}\" where \"{}\" in ({})", table, own, placeholders(ids.len()));
    db.execute(&sql, params_from_iter(id_params(ids).iter()))?;
    let sql = format!(
        "insert or ignore into \"{}\" (\"{}\", \"{}\") values (?, ?)",
        table, own, other
    );
    let mut statement = db.prepare_cached(&sql)?;
    for id in ids {
        for target in targets {
            statement.execute([Value::Integer(*id as i64), Value::Integer(*target as i64)])?;
        }
    }
    Ok(())
}
