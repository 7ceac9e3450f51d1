//! Compilation of predicate trees into storage predicates.
//!
//! Every dotted path is resolved segment by segment against the registry;
//! each relational hop becomes a [`StoragePredicate::Related`] node so the
//! storage layer can run the traversal as a subquery or a nested scan.
use crate::domain::{Comparator, PredicateNode};
use crate::error::DomainError;
use crate::field::{FieldDescriptor, FieldKind};
use crate::model::ModelSchema;
use crate::registry::Registry;
use crate::value::Value;

/// How one relational field links its model to the target model.
#[derive(Clone, Debug, PartialEq)]
pub struct Relation {
    pub field: String,
    pub kind: FieldKind,
    pub target_model: String,
    pub target_table: String,
    pub inverse: Option<String>,
    pub junction: Option<Junction>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Junction {
    pub table: String,
    pub own_column: String,
    pub target_column: String,
}

impl Relation {
    pub fn of(field: &FieldDescriptor, target: &ModelSchema) -> Self {
        let junction = match (field.junction_table(), field.junction_columns()) {
            (Some(table), Some((own, other))) if field.kind() == FieldKind::Many2many => Some(Junction {
                table: table.to_string(),
                own_column: own.to_string(),
                target_column: other.to_string(),
            }),
            _ => None,
        };
        Self {
            field: field.name().to_string(),
            kind: field.kind(),
            target_model: target.name().to_string(),
            target_table: target.table().to_string(),
            inverse: field.inverse_field().map(str::to_string),
            junction,
        }
    }
}

/// A backend-neutral filter over the columns of one model's records.
#[derive(Clone, Debug, PartialEq)]
pub enum StoragePredicate {
    True,
    False,
    /// `column` is a column of the current model, `id` included.
    Compare { column: String, comparator: Comparator, value: Value },
    /// Some record reached through `relation` satisfies `inner`.
    Related { relation: Relation, inner: Box<StoragePredicate> },
    And(Vec<StoragePredicate>),
    Or(Vec<StoragePredicate>),
    Not(Box<StoragePredicate>),
}

impl StoragePredicate {
    pub fn compare(column: impl Into<String>, comparator: Comparator, value: Value) -> Self {
        StoragePredicate::Compare { column: column.into(), comparator, value }
    }
    /// Restricts to the given identities.
    pub fn ids(ids: &[u64]) -> Self {
        StoragePredicate::compare("id", Comparator::In, Value::Ids(ids.to_vec()))
    }
    pub fn and(self, other: StoragePredicate) -> Self {
        match (self, other) {
            (StoragePredicate::True, p) | (p, StoragePredicate::True) => p,
            (StoragePredicate::And(mut left), StoragePredicate::And(right)) => {
                left.extend(right);
                StoragePredicate::And(left)
            }
            (StoragePredicate::And(mut left), p) => {
                left.push(p);
                StoragePredicate::And(left)
            }
            (left, right) => StoragePredicate::And(vec![left, right]),
        }
    }
}

/// Turns one condition into a storage predicate.
pub trait LeafTranslator {
    fn translate_leaf(
        &self,
        path: &str,
        comparator: Comparator,
        value: &Value,
    ) -> Result<StoragePredicate, DomainError>;
}

impl PredicateNode {
    pub fn compile<T: LeafTranslator + ?Sized>(&self, translator: &T) -> Result<StoragePredicate, DomainError> {
        Ok(match self {
            PredicateNode::True => StoragePredicate::True,
            PredicateNode::Leaf(c) => translator.translate_leaf(&c.path, c.comparator, &c.value)?,
            PredicateNode::Not(inner) => StoragePredicate::Not(Box::new(inner.compile(translator)?)),
            PredicateNode::And(left, right) => left.compile(translator)?.and(right.compile(translator)?),
            PredicateNode::Or(left, right) => {
                let mut parts = Vec::new();
                for side in [left, right] {
                    match side.compile(translator)? {
                        StoragePredicate::Or(inner) => parts.extend(inner),
                        other => parts.push(other),
                    }
                }
                StoragePredicate::Or(parts)
            }
        })
    }
}

/// Validates paths and operands against the registry while translating.
pub struct SchemaTranslator<'r> {
    registry: &'r Registry,
    model: &'r ModelSchema,
}

impl<'r> SchemaTranslator<'r> {
    pub fn new(registry: &'r Registry, model: &'r ModelSchema) -> Self {
        Self { registry, model }
    }
}

impl LeafTranslator for SchemaTranslator<'_> {
    fn translate_leaf(
        &self,
        path: &str,
        comparator: Comparator,
        value: &Value,
    ) -> Result<StoragePredicate, DomainError> {
        translate(self.registry, self.model, path, path, comparator, value)
    }
}

fn translate(
    registry: &Registry,
    model: &ModelSchema,
    full_path: &str,
    path: &str,
    comparator: Comparator,
    value: &Value,
) -> Result<StoragePredicate, DomainError> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    let field = model
        .field(head)
        .ok_or_else(|| DomainError::UnknownField(full_path.to_string()))?;
    if field.is_computed() && !field.is_stored() {
        return Err(DomainError::UnknownField(format!("{} (not stored)", full_path)));
    }
    match rest {
        Some(rest) => {
            if !field.kind().is_relational() {
                return Err(DomainError::UnknownField(full_path.to_string()));
            }
            let relation = relation(registry, field)?;
            let target = target(registry, field)?;
            let inner = translate(registry, target, full_path, rest, comparator, value)?;
            Ok(StoragePredicate::Related { relation, inner: Box::new(inner) })
        }
        None if field.kind().is_x2many() => to_many_leaf(registry, field, full_path, comparator, value),
        None => {
            let value = operand(field, full_path, comparator, value)?;
            Ok(match (comparator, &value) {
                (Comparator::In, Value::List(items)) if items.is_empty() => StoragePredicate::False,
                (Comparator::NotIn, Value::List(items)) if items.is_empty() => StoragePredicate::True,
                _ => StoragePredicate::compare(head, comparator, value),
            })
        }
    }
}

fn target<'r>(registry: &'r Registry, field: &FieldDescriptor) -> Result<&'r ModelSchema, DomainError> {
    registry
        .target_of(field)
        .map(|schema| schema.as_ref())
        .ok_or_else(|| DomainError::UnknownModel(field.relation_target().unwrap_or_default().to_string()))
}

fn relation(registry: &Registry, field: &FieldDescriptor) -> Result<Relation, DomainError> {
    Ok(Relation::of(field, target(registry, field)?))
}

/// A condition on a to-many field itself compares the set of related identities.
fn to_many_leaf(
    registry: &Registry,
    field: &FieldDescriptor,
    path: &str,
    comparator: Comparator,
    value: &Value,
) -> Result<StoragePredicate, DomainError> {
    let relation = relation(registry, field)?;
    let related = |inner: StoragePredicate| StoragePredicate::Related {
        relation: relation.clone(),
        inner: Box::new(inner),
    };
    let invalid = |reason: &str| DomainError::InvalidValue {
        path: path.to_string(),
        comparator: comparator.to_string(),
        reason: reason.to_string(),
    };
    match comparator {
        Comparator::Eq | Comparator::Ne => {
            let positive = if value.is_falsy() {
                StoragePredicate::Not(Box::new(related(StoragePredicate::True)))
            } else {
                let id = value.as_id().ok_or_else(|| invalid("expected a record identity"))?;
                related(StoragePredicate::compare("id", Comparator::Eq, Value::Id(id)))
            };
            Ok(if comparator == Comparator::Eq {
                positive
            } else {
                StoragePredicate::Not(Box::new(positive))
            })
        }
        Comparator::In | Comparator::NotIn => {
            let ids = value.ids();
            let positive = if ids.is_empty() {
                StoragePredicate::False
            } else {
                related(StoragePredicate::compare("id", Comparator::In, Value::Ids(ids)))
            };
            Ok(if comparator == Comparator::In {
                positive
            } else {
                StoragePredicate::Not(Box::new(positive))
            })
        }
        _ => Err(DomainError::UnsupportedOperator {
            path: path.to_string(),
            comparator: comparator.to_string(),
        }),
    }
}

/// Coerces the operand to the field's kind. `false` stands for "not set" on
/// anything but a boolean field.
fn operand(
    field: &FieldDescriptor,
    path: &str,
    comparator: Comparator,
    value: &Value,
) -> Result<Value, DomainError> {
    let kind = field.kind();
    let invalid = |reason: String| DomainError::InvalidValue {
        path: path.to_string(),
        comparator: comparator.to_string(),
        reason,
    };
    let coerce = |value: &Value| -> Result<Value, DomainError> {
        match value {
            Value::Null => Ok(Value::Null),
            Value::Bool(false) if kind != FieldKind::Boolean => Ok(Value::Null),
            other => other
                .clone()
                .coerce_to(kind)
                .ok_or_else(|| invalid(format!("a {} cannot be compared with a {} field", other.kind_name(), kind))),
        }
    };
    if comparator.is_like() {
        if !kind.is_textual() {
            return Err(DomainError::UnsupportedOperator {
                path: path.to_string(),
                comparator: comparator.to_string(),
            });
        }
        return Ok(value.clone());
    }
    match comparator {
        Comparator::In | Comparator::NotIn => {
            let items: Vec<Value> = match value {
                Value::List(items) => items.clone(),
                Value::Ids(ids) => ids.iter().map(|id| Value::Id(*id)).collect(),
                _ => return Err(invalid("expected a list".to_string())),
            };
            Ok(Value::List(items.iter().map(coerce).collect::<Result<_, _>>()?))
        }
        _ => coerce(value),
    }
}
