//! The environment record sets live in: registry, storage, security and
//! the caller's context.
use std::sync::Arc;

use tracing::{debug, warn};

use crate::compile::{SchemaTranslator, StoragePredicate};
use crate::domain::{Comparator, Condition, Domain, PredicateNode};
use crate::error::{DomainError, EngineError};
use crate::model::{ModelSchema, OrderBy, parse_order};
use crate::recordset::{self, RecordSet};
use crate::registry::Registry;
use crate::security::{Context, Operation, Security};
use crate::storage::{Storage, Values};
use crate::value::{RecordId, Value};

// recompute chains longer than this are taken to be cycles across models
const MAX_RECOMPUTE_DEPTH: usize = 16;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SearchOptions {
    pub order: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl SearchOptions {
    /// Order as text, e.g. `"name desc, id"`. Falls back on the model's default.
    pub fn order(mut self, order: impl Into<String>) -> Self {
        self.order = Some(order.into());
        self
    }
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// Stored computed fields of `model` waiting to be recomputed for `ids`.
#[derive(Debug, Default)]
pub(crate) struct Pending {
    pub model: String,
    pub ids: Vec<RecordId>,
    pub fields: Vec<String>,
}

fn merge_pending(into: &mut Vec<Pending>, more: Vec<Pending>) {
    for pending in more {
        match into.iter_mut().find(|p| p.model == pending.model) {
            Some(existing) => {
                for id in pending.ids {
                    if !existing.ids.contains(&id) {
                        existing.ids.push(id);
                    }
                }
                for field in pending.fields {
                    if !existing.fields.contains(&field) {
                        existing.fields.push(field);
                    }
                }
            }
            None => into.push(pending),
        }
    }
}

#[derive(Clone)]
pub struct Env {
    registry: Arc<Registry>,
    storage: Arc<dyn Storage>,
    security: Option<Arc<dyn Security>>,
    context: Context,
    default_limit: Option<usize>,
}

impl Env {
    pub fn new(registry: Arc<Registry>, storage: Arc<dyn Storage>) -> Self {
        Self { registry, storage, security: None, context: Context::default(), default_limit: None }
    }
    pub fn with_security(mut self, security: Arc<dyn Security>) -> Self {
        self.security = Some(security);
        self
    }
    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }
    /// Limit applied to searches that do not set one.
    pub fn with_default_limit(mut self, limit: Option<usize>) -> Self {
        self.default_limit = limit;
        self
    }
    /// The same environment with every access check bypassed.
    pub fn sudo(&self) -> Env {
        Env { context: self.context.elevated(), ..self.clone() }
    }
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }
    pub fn context(&self) -> &Context {
        &self.context
    }
    pub fn schema(&self, model: &str) -> Result<Arc<ModelSchema>, EngineError> {
        self.registry
            .model(model)
            .cloned()
            .ok_or_else(|| EngineError::UnknownModel(model.to_string()))
    }

    /// Asks the security collaborator. `Ok(Some(domain))` restricts the
    /// records the operation may touch.
    pub fn access(&self, model: &str, operation: Operation) -> Result<Option<Domain>, EngineError> {
        let security = match &self.security {
            Some(security) if !self.context.is_superuser() => security,
            _ => return Ok(None),
        };
        let decision = security.check(model, operation, &self.context);
        if !decision.allowed {
            warn!("Denied {} on '{}' for user {:?}", operation, model, self.context.uid);
            return Err(EngineError::AccessDenied { model: model.to_string(), operation });
        }
        Ok(decision.domain)
    }

    pub fn browse(&self, model: &str, ids: impl IntoIterator<Item = RecordId>) -> Result<RecordSet, EngineError> {
        Ok(RecordSet::new(self.clone(), self.schema(model)?, ids, false))
    }

    pub fn search(&self, model: &str, domain: &Domain, options: SearchOptions) -> Result<RecordSet, EngineError> {
        let schema = self.schema(model)?;
        let predicate = self.restricted_predicate(&schema, domain, Operation::Read)?;
        let order = self.resolve_order(&schema, options.order.as_deref())?;
        let limit = options.limit.or(self.default_limit);
        let ids = self.storage.find_ids(&schema, &predicate, &order, limit, options.offset)?;
        debug!("Search on '{}' for {} found {} records", model, domain, ids.len());
        Ok(RecordSet::new(self.clone(), schema, ids, true))
    }

    pub fn search_count(&self, model: &str, domain: &Domain) -> Result<usize, EngineError> {
        let schema = self.schema(model)?;
        let predicate = self.restricted_predicate(&schema, domain, Operation::Read)?;
        Ok(self.storage.find_ids(&schema, &predicate, &[], None, 0)?.len())
    }

    /// Creates one record; defaults fill the fields `values` leaves out.
    pub fn create(&self, model: &str, values: Values) -> Result<RecordSet, EngineError> {
        recordset::create(self, model, values)
    }

    /// The caller's domain, ANDed with the security domain, compiled.
    fn restricted_predicate(
        &self,
        schema: &ModelSchema,
        domain: &Domain,
        operation: Operation,
    ) -> Result<StoragePredicate, EngineError> {
        let mut node = domain.parse()?;
        if let Some(rule) = self.access(schema.name(), operation)? {
            node = PredicateNode::and(node, rule.parse()?);
        }
        self.compile(schema, &node)
    }

    pub(crate) fn compile(&self, schema: &ModelSchema, node: &PredicateNode) -> Result<StoragePredicate, EngineError> {
        Ok(node.compile(&SchemaTranslator::new(&self.registry, schema))?)
    }

    fn resolve_order(&self, schema: &ModelSchema, order: Option<&str>) -> Result<Vec<OrderBy>, EngineError> {
        let order = match order {
            Some(text) => parse_order(text).map_err(DomainError::InvalidOrder)?,
            None => return Ok(schema.default_order().to_vec()),
        };
        for OrderBy { field, .. } in &order {
            let orderable = schema.field(field).is_some_and(|f| f.is_column());
            if !orderable {
                return Err(DomainError::InvalidOrder(format!("'{}' is not a stored column of '{}'", field, schema.name())).into());
            }
        }
        Ok(order)
    }

    /// Records of other models whose stored computed fields depend on
    /// `fields` of the given records.
    pub(crate) fn triggered(
        &self,
        schema: &ModelSchema,
        ids: &[RecordId],
        fields: &[String],
    ) -> Result<Vec<Pending>, EngineError> {
        let mut pending = Vec::new();
        if ids.is_empty() {
            return Ok(pending);
        }
        for field in fields {
            for trigger in self.registry.triggers(schema.name(), field) {
                let target = self.schema(&trigger.model)?;
                // non-stored fields are recomputed when next read anyway
                if !target.field(&trigger.field).is_some_and(|f| f.is_stored()) {
                    continue;
                }
                let node = PredicateNode::Leaf(Condition::new(
                    format!("{}.id", trigger.path),
                    Comparator::In,
                    Value::Ids(ids.to_vec()),
                ));
                let predicate = self.compile(&target, &node)?;
                let found = self.storage.find_ids(&target, &predicate, &[], None, 0)?;
                if !found.is_empty() {
                    merge_pending(
                        &mut pending,
                        vec![Pending { model: trigger.model.clone(), ids: found, fields: vec![trigger.field.clone()] }],
                    );
                }
            }
        }
        Ok(pending)
    }

    pub(crate) fn recompute_pending(&self, pending: Vec<Pending>, depth: usize) -> Result<(), EngineError> {
        for Pending { model, ids, fields } in pending {
            if depth > MAX_RECOMPUTE_DEPTH {
                return Err(EngineError::Compute {
                    model,
                    field: fields.join(", "),
                    message: "recomputation does not settle".to_string(),
                });
            }
            let schema = self.schema(&model)?;
            let existing = self.storage.find_ids(&schema, &StoragePredicate::ids(&ids), &[], None, 0)?;
            if existing.is_empty() {
                continue;
            }
            debug!("Recomputing {:?} of {} '{}' records", fields, existing.len(), model);
            let set = RecordSet::new(self.sudo(), schema.clone(), existing, true);
            let rewritten = set.recompute(&fields, true)?;
            if !rewritten.is_empty() {
                let next = self.triggered(&schema, set.ids(), &rewritten)?;
                self.recompute_pending(next, depth + 1)?;
            }
        }
        Ok(())
    }
}

pub(crate) fn union_pending(mut before: Vec<Pending>, after: Vec<Pending>) -> Vec<Pending> {
    merge_pending(&mut before, after);
    before
}
