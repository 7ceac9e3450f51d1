// used for persistence
use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue};

// used for date and datetime field values
use chrono::{NaiveDate, NaiveDateTime};

// used to print out readable forms of a value
use std::fmt;
// used for typed comparison
use std::cmp::Ordering;

use thiserror::Error;

use crate::field::FieldKind;

/// Opaque identity of a persisted record, unique per model.
pub type RecordId = u64;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A field value or a domain operand.
///
/// `Id` is what a many-to-one field holds, `Ids` what one-to-many and
/// many-to-many fields hold. `List` only appears as the operand of `in` and
/// `not in`, or as the flattened result of traversing a to-many path.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Binary(Vec<u8>),
    Id(RecordId),
    Ids(Vec<RecordId>),
    List(Vec<Value>),
}

#[derive(Error, Debug)]
#[error("a {0} value has no single column representation")]
pub struct NotAColumnValue(&'static str);

impl Value {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Date(_) => "date",
            Value::DateTime(_) => "datetime",
            Value::Binary(_) => "binary",
            Value::Id(_) => "id",
            Value::Ids(_) => "ids",
            Value::List(_) => "list",
        }
    }
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
    /// Null and `false` both read as "not set", as they do in domains.
    pub fn is_falsy(&self) -> bool {
        matches!(self, Value::Null | Value::Bool(false))
    }
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Id(id) => i64::try_from(*id).ok(),
            _ => None,
        }
    }
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
    pub fn as_id(&self) -> Option<RecordId> {
        match self {
            Value::Id(id) => Some(*id),
            Value::Integer(i) => u64::try_from(*i).ok(),
            _ => None,
        }
    }
    /// Identities referenced by a relational value, in order.
    pub fn ids(&self) -> Vec<RecordId> {
        match self {
            Value::Id(id) => vec![*id],
            Value::Ids(ids) => ids.clone(),
            Value::List(items) => items.iter().filter_map(Value::as_id).collect(),
            _ => Vec::new(),
        }
    }

    /// Typed comparison. Integers and floats compare numerically, text by
    /// codepoint, and text coerces to a date or datetime when compared with
    /// one. Incomparable pairs (including anything against null) yield `None`.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        use Value::*;
        match (self, other) {
            (Integer(a), Integer(b)) => Some(a.cmp(b)),
            (Integer(a), Float(b)) => (*a as f64).partial_cmp(b),
            (Float(a), Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Float(a), Float(b)) => a.partial_cmp(b),
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            (Text(a), Text(b)) => Some(a.as_str().cmp(b.as_str())),
            (Date(a), Date(b)) => Some(a.cmp(b)),
            (DateTime(a), DateTime(b)) => Some(a.cmp(b)),
            (Date(a), Text(b)) => parse_date(b).map(|b| a.cmp(&b)),
            (Text(a), Date(b)) => parse_date(a).map(|a| a.cmp(b)),
            (DateTime(a), Text(b)) => parse_datetime(b).map(|b| a.cmp(&b)),
            (Text(a), DateTime(b)) => parse_datetime(a).map(|a| a.cmp(b)),
            (Binary(a), Binary(b)) => Some(a.cmp(b)),
            (Id(a), Id(b)) => Some(a.cmp(b)),
            (Id(a), Integer(b)) => Some(i128::from(*a).cmp(&i128::from(*b))),
            (Integer(a), Id(b)) => Some(i128::from(*a).cmp(&i128::from(*b))),
            _ => None,
        }
    }

    /// Equality as the domain language understands it.
    pub fn loosely_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Ids(a), Value::Ids(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loosely_equals(y))
            }
            _ => self.compare(other) == Some(Ordering::Equal),
        }
    }

    /// Total order used when sorting: nulls first, then typed comparison,
    /// falling back on the kind rank for values of unrelated kinds.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            _ => self
                .compare(other)
                .unwrap_or_else(|| self.rank().cmp(&other.rank())),
        }
    }
    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Integer(_) | Value::Float(_) | Value::Id(_) => 2,
            Value::Text(_) => 3,
            Value::Date(_) => 4,
            Value::DateTime(_) => 5,
            Value::Binary(_) => 6,
            Value::Ids(_) => 7,
            Value::List(_) => 8,
        }
    }

    /// Normalizes a value for a field of the given kind, or `None` if the
    /// value cannot be held by such a field.
    pub fn coerce_to(self, kind: FieldKind) -> Option<Value> {
        use FieldKind as K;
        match (kind, self) {
            (_, Value::Null) => Some(Value::Null),
            (K::Many2one, Value::Bool(false)) => Some(Value::Null),
            (K::Char | K::Text | K::Selection | K::Date | K::DateTime | K::Binary, Value::Bool(false)) => {
                Some(Value::Null)
            }
            (K::Char | K::Text | K::Selection, v @ Value::Text(_)) => Some(v),
            (K::Integer, v @ Value::Integer(_)) => Some(v),
            (K::Integer, Value::Id(id)) => i64::try_from(id).ok().map(Value::Integer),
            (K::Float, v @ Value::Float(_)) => Some(v),
            (K::Float, Value::Integer(i)) => Some(Value::Float(i as f64)),
            (K::Boolean, v @ Value::Bool(_)) => Some(v),
            (K::Date, v @ Value::Date(_)) => Some(v),
            (K::Date, Value::Text(s)) => parse_date(&s).map(Value::Date),
            (K::DateTime, v @ Value::DateTime(_)) => Some(v),
            (K::DateTime, Value::Text(s)) => parse_datetime(&s).map(Value::DateTime),
            (K::Binary, v @ Value::Binary(_)) => Some(v),
            (K::Many2one, v @ Value::Id(_)) => Some(v),
            (K::Many2one, Value::Integer(i)) => u64::try_from(i).ok().map(Value::Id),
            (K::One2many | K::Many2many, v @ Value::Ids(_)) => Some(v),
            (K::One2many | K::Many2many, Value::Bool(false)) => Some(Value::Ids(Vec::new())),
            (K::One2many | K::Many2many, Value::List(items)) => items
                .iter()
                .map(Value::as_id)
                .collect::<Option<Vec<_>>>()
                .map(Value::Ids),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Integer(i) => Json::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f).map_or(Json::Null, Json::Number),
            Value::Text(s) => Json::String(s.clone()),
            Value::Date(d) => Json::String(d.format(DATE_FORMAT).to_string()),
            Value::DateTime(dt) => Json::String(dt.format(DATETIME_FORMAT).to_string()),
            Value::Binary(bytes) => Json::Array(bytes.iter().map(|b| Json::from(*b)).collect()),
            Value::Id(id) => Json::from(*id),
            Value::Ids(ids) => Json::Array(ids.iter().map(|id| Json::from(*id)).collect()),
            Value::List(items) => Json::Array(items.iter().map(Value::to_json).collect()),
        }
    }
    pub fn from_json(json: &serde_json::Value) -> Value {
        use serde_json::Value as Json;
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => Value::Text(s.clone()),
            Json::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            Json::Object(_) => Value::Text(json.to_string()),
        }
    }
}

pub fn parse_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), DATE_FORMAT).ok()
}

/// Accepts `YYYY-MM-DD HH:MM:SS`, the ISO `T` separator, or a bare date (midnight).
pub fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    NaiveDateTime::parse_from_str(text, DATETIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S"))
        .ok()
        .or_else(|| parse_date(text).and_then(|d| d.and_hms_opt(0, 0, 0)))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "'{}'", s),
            Value::Date(d) => write!(f, "{}", d.format(DATE_FORMAT)),
            Value::DateTime(dt) => write!(f, "{}", dt.format(DATETIME_FORMAT)),
            Value::Binary(bytes) => write!(f, "<{} bytes>", bytes.len()),
            Value::Id(id) => write!(f, "#{}", id),
            Value::Ids(ids) => {
                let ids: Vec<String> = ids.iter().map(|id| format!("#{}", id)).collect();
                write!(f, "[{}]", ids.join(", "))
            }
            Value::List(items) => {
                let items: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", items.join(", "))
            }
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let value = match self {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
            Value::Integer(i) => SqlValue::Integer(*i),
            Value::Float(f) => SqlValue::Real(*f),
            Value::Text(s) => SqlValue::Text(s.clone()),
            Value::Date(d) => SqlValue::Text(d.format(DATE_FORMAT).to_string()),
            Value::DateTime(dt) => SqlValue::Text(dt.format(DATETIME_FORMAT).to_string()),
            Value::Binary(bytes) => SqlValue::Blob(bytes.clone()),
            Value::Id(id) => SqlValue::Integer(
                i64::try_from(*id).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
            ),
            Value::Ids(_) | Value::List(_) => {
                return Err(rusqlite::Error::ToSqlConversionFailure(Box::new(NotAColumnValue(
                    self.kind_name(),
                ))));
            }
        };
        Ok(ToSqlOutput::Owned(value))
    }
}

// ------------- Conversions --------------
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}
impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i64::from(i))
    }
}
impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}
impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}
impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}
impl From<NaiveDate> for Value {
    fn from(d: NaiveDate) -> Self {
        Value::Date(d)
    }
}
impl From<NaiveDateTime> for Value {
    fn from(dt: NaiveDateTime) -> Self {
        Value::DateTime(dt)
    }
}
impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}
impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}
