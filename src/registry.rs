//! Two-phase model registration.
//!
//! Declarations are collected by a mutable [`RegistryBuilder`]. Every
//! registration re-merges all declarations seen so far, so inheritance and
//! extension may be declared in any order; references that cannot be
//! resolved yet stay pending until [`RegistryBuilder::publish`], which fails
//! on anything still unresolved. Publishing yields an immutable
//! [`Registry`] shared through an `Arc`, so readers never lock.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

// used to keep the one-to-one mapping between models and their tables
use bimap::BiMap;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::NameHasher;
use crate::error::SchemaError;
use crate::field::{FieldDescriptor, FieldKind};
use crate::model::{ModelDeclaration, ModelSchema, OrderBy, parse_order};

lazy_static! {
    static ref MODEL_NAME: Regex = Regex::new(r"^[a-z][a-z0-9_]*(\.[a-z0-9_]+)*$").unwrap();
    static ref IDENTIFIER: Regex = Regex::new(r"^[a-z_][a-z0-9_]*$").unwrap();
}

// ------------- Triggers -------------
/// A stored computed field on another model to recompute when a field changes.
///
/// `path` leads from the records of `model` to the records whose field
/// changed, so the affected records are those matching `(path.id in changed)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Trigger {
    pub model: String,
    pub field: String,
    pub path: String,
}

// ------------- Builder -------------
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    declarations: Vec<ModelDeclaration>,
    merged: HashMap<String, Arc<ModelSchema>, NameHasher>,
    published: bool,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }
    /// Validates and records a declaration, then re-merges every model.
    /// A failing declaration leaves the builder as it was.
    pub fn register(&mut self, declaration: ModelDeclaration) -> Result<(), SchemaError> {
        if self.published {
            return Err(SchemaError::RegistryPublished);
        }
        validate_declaration(&declaration)?;
        if !declaration.is_extension()
            && self
                .declarations
                .iter()
                .any(|d| !d.is_extension() && d.name == declaration.name)
        {
            return Err(SchemaError::DuplicateModel(declaration.name));
        }
        debug!(
            "Registering {} '{}'",
            if declaration.is_extension() { "extension of" } else { "model" },
            declaration.name
        );
        self.declarations.push(declaration);
        match merge(&self.declarations, false) {
            Ok(merged) => {
                self.merged = merged;
                Ok(())
            }
            Err(e) => {
                self.declarations.pop();
                Err(e)
            }
        }
    }
    /// The merged view of a model as of the latest registration.
    pub fn schema(&self, name: &str) -> Option<Arc<ModelSchema>> {
        self.merged.get(name).cloned()
    }
    /// Models that are declared but still wait for a parent or base.
    pub fn pending(&self) -> Vec<String> {
        let mut pending = Vec::new();
        for declaration in &self.declarations {
            if !self.merged.contains_key(&declaration.name) && !pending.contains(&declaration.name) {
                pending.push(declaration.name.clone());
            }
        }
        pending
    }
    pub fn len(&self) -> usize {
        self.declarations.len()
    }
    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }
    /// Freezes the registry. Unresolved parents or extension targets are fatal.
    pub fn publish(&mut self) -> Result<Arc<Registry>, SchemaError> {
        if self.published {
            return Err(SchemaError::RegistryPublished);
        }
        let merged = merge(&self.declarations, true)?;
        let mut order: Vec<String> = Vec::new();
        for declaration in &self.declarations {
            if !declaration.is_extension() {
                order.push(declaration.name.clone());
            }
        }
        let mut tables = BiMap::new();
        for name in &order {
            let schema = &merged[name];
            if let Err((model, table)) = tables.insert_no_overwrite(name.clone(), schema.table.clone()) {
                let first = tables.get_by_right(&table).cloned().unwrap_or_default();
                return Err(SchemaError::DuplicateTable { table, first, second: model });
            }
        }
        let triggers = collect_triggers(&order, &merged);
        self.merged = merged.clone();
        self.published = true;
        info!("Published registry with {} models", order.len());
        Ok(Arc::new(Registry { models: merged, order, tables, triggers }))
    }
}

fn validate_declaration(declaration: &ModelDeclaration) -> Result<(), SchemaError> {
    if !MODEL_NAME.is_match(&declaration.name) {
        return Err(SchemaError::InvalidName { what: "model", name: declaration.name.clone() });
    }
    if let Some(target) = &declaration.extends {
        if target != &declaration.name {
            return Err(SchemaError::ExtensionMismatch {
                name: declaration.name.clone(),
                target: target.clone(),
            });
        }
    }
    for parent in &declaration.parents {
        if !MODEL_NAME.is_match(parent) {
            return Err(SchemaError::InvalidName { what: "model", name: parent.clone() });
        }
        if parent == &declaration.name {
            return Err(SchemaError::CyclicInheritance(parent.clone()));
        }
    }
    if let Some(table) = &declaration.table {
        if !IDENTIFIER.is_match(table) {
            return Err(SchemaError::InvalidName { what: "table", name: table.clone() });
        }
    }
    for field in &declaration.fields {
        validate_field(field)?;
    }
    Ok(())
}

fn validate_field(field: &FieldDescriptor) -> Result<(), SchemaError> {
    if !IDENTIFIER.is_match(&field.name) {
        return Err(SchemaError::InvalidName { what: "field", name: field.name.clone() });
    }
    let mut seen = HashSet::new();
    for (value, _) in &field.selection {
        if !seen.insert(value.as_str()) {
            return Err(SchemaError::InvalidSelection {
                field: field.name.clone(),
                value: value.clone(),
            });
        }
    }
    if !field.depends.is_empty() && !field.is_computed() {
        return Err(SchemaError::MissingCompute(field.name.clone()));
    }
    if let Some(target) = &field.relation {
        if !MODEL_NAME.is_match(target) {
            return Err(SchemaError::InvalidName { what: "model", name: target.clone() });
        }
    }
    for name in field.relation_table.iter().chain(field.inverse.iter()) {
        if !IDENTIFIER.is_match(name) {
            return Err(SchemaError::InvalidName { what: "field", name: name.clone() });
        }
    }
    if let Some((own, target)) = &field.columns {
        for name in [own, target] {
            if !IDENTIFIER.is_match(name) {
                return Err(SchemaError::InvalidName { what: "column", name: name.clone() });
            }
        }
    }
    Ok(())
}

// ------------- Merging -------------
/// Field map that keeps first-declaration order while later declarations
/// replace earlier descriptors of the same name entirely.
#[derive(Default)]
struct FieldMap {
    fields: Vec<FieldDescriptor>,
    positions: HashMap<String, usize, NameHasher>,
}

impl FieldMap {
    fn overlay(&mut self, field: FieldDescriptor) {
        match self.positions.get(&field.name) {
            Some(&i) => self.fields[i] = field,
            None => {
                self.positions.insert(field.name.clone(), self.fields.len());
                self.fields.push(field);
            }
        }
    }
}

struct Merger<'a> {
    declarations: &'a [ModelDeclaration],
    bases: HashMap<&'a str, usize, NameHasher>,
    extensions: HashMap<&'a str, Vec<usize>, NameHasher>,
    merged: HashMap<String, Arc<ModelSchema>, NameHasher>,
    visiting: Vec<String>,
}

fn merge(
    declarations: &[ModelDeclaration],
    strict: bool,
) -> Result<HashMap<String, Arc<ModelSchema>, NameHasher>, SchemaError> {
    let mut merger = Merger {
        declarations,
        bases: HashMap::default(),
        extensions: HashMap::default(),
        merged: HashMap::default(),
        visiting: Vec::new(),
    };
    for (index, declaration) in declarations.iter().enumerate() {
        if declaration.is_extension() {
            merger.extensions.entry(declaration.name.as_str()).or_default().push(index);
        } else {
            merger.bases.insert(declaration.name.as_str(), index);
        }
    }
    for declaration in declarations {
        if !merger.bases.contains_key(declaration.name.as_str()) {
            if strict {
                return Err(SchemaError::UnknownParent(declaration.name.clone()));
            }
            continue;
        }
        match merger.build(&declaration.name) {
            Ok(_) => {}
            Err(SchemaError::UnknownParent(missing)) if !strict => {
                debug!("Model '{}' waits for '{}'", declaration.name, missing);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(merger.merged)
}

impl<'a> Merger<'a> {
    fn build(&mut self, name: &str) -> Result<Arc<ModelSchema>, SchemaError> {
        if let Some(schema) = self.merged.get(name) {
            return Ok(schema.clone());
        }
        if self.visiting.iter().any(|v| v == name) {
            return Err(SchemaError::CyclicInheritance(name.to_string()));
        }
        let base = match self.bases.get(name) {
            Some(&base) => base,
            None => return Err(SchemaError::UnknownParent(name.to_string())),
        };
        self.visiting.push(name.to_string());
        let assembled = self.assemble(name, base);
        self.visiting.pop();
        let schema = Arc::new(assembled?);
        self.merged.insert(name.to_string(), schema.clone());
        Ok(schema)
    }

    fn assemble(&mut self, name: &str, base: usize) -> Result<ModelSchema, SchemaError> {
        let declarations = self.declarations;
        let mut chain = vec![base];
        if let Some(extensions) = self.extensions.get(name) {
            chain.extend(extensions.iter().copied());
        }
        let mut fields = FieldMap::default();
        fields.overlay(FieldDescriptor::integer("id").label("ID").readonly());
        let mut table = None;
        let mut description = None;
        let mut order = None;
        let mut rec_name = None;
        for index in chain {
            let declaration = &declarations[index];
            for parent in &declaration.parents {
                let parent = self.build(parent)?;
                for field in parent.fields() {
                    if field.name != "id" {
                        fields.overlay(field.clone());
                    }
                }
            }
            for field in &declaration.fields {
                if field.name != "id" {
                    fields.overlay(field.clone());
                }
            }
            if declaration.table.is_some() {
                table = declaration.table.clone();
            }
            if declaration.description.is_some() {
                description = declaration.description.clone();
            }
            if declaration.order.is_some() {
                order = declaration.order.clone();
            }
            if declaration.rec_name.is_some() {
                rec_name = declaration.rec_name.clone();
            }
        }
        for field in fields.fields.iter_mut() {
            if field.kind == FieldKind::Many2many {
                junction_defaults(name, field);
            }
        }

        let rec_name = match rec_name {
            Some(rec_name) if fields.positions.contains_key(&rec_name) => rec_name,
            Some(rec_name) => {
                return Err(SchemaError::InvalidName { what: "display name field", name: rec_name });
            }
            None if fields.positions.contains_key("name") => "name".to_string(),
            None => "id".to_string(),
        };
        let order_text = order.unwrap_or_else(|| "id asc".to_string());
        let order = parse_order(&order_text).map_err(|reason| SchemaError::InvalidOrder {
            model: name.to_string(),
            order: order_text.clone(),
            reason,
        })?;
        for OrderBy { field, .. } in &order {
            let orderable = fields
                .positions
                .get(field)
                .map(|&i| fields.fields[i].is_column() || field == "id")
                .unwrap_or(false);
            if !orderable {
                return Err(SchemaError::InvalidOrder {
                    model: name.to_string(),
                    order: order_text.clone(),
                    reason: format!("'{}' is not a stored column", field),
                });
            }
        }
        let (compute_order, dependents) = compute_graph(name, &fields.fields)?;
        Ok(ModelSchema {
            name: name.to_string(),
            table: table.unwrap_or_else(|| name.replace('.', "_")),
            description: description.unwrap_or_else(|| name.to_string()),
            order,
            rec_name,
            fields: fields.fields,
            positions: fields.positions,
            compute_order,
            dependents,
        })
    }
}

fn junction_defaults(model: &str, field: &mut FieldDescriptor) {
    let own = model.replace('.', "_");
    let target = field.relation.as_deref().unwrap_or_default().replace('.', "_");
    if field.relation_table.is_none() {
        let mut pair = [own.as_str(), target.as_str()];
        pair.sort();
        field.relation_table = Some(format!("{}_{}_rel", pair[0], pair[1]));
    }
    if field.columns.is_none() {
        field.columns = if own == target {
            Some(("id1".to_string(), "id2".to_string()))
        } else {
            Some((format!("{}_id", own), format!("{}_id", target)))
        };
    }
}

/// Orders computed fields so that every field comes after the computed
/// fields it depends on, and indexes direct local dependents.
fn compute_graph(
    model: &str,
    fields: &[FieldDescriptor],
) -> Result<(Vec<String>, HashMap<String, Vec<String>, NameHasher>), SchemaError> {
    let mut dependents: HashMap<String, Vec<String>, NameHasher> = HashMap::default();
    let computed: Vec<&FieldDescriptor> = fields.iter().filter(|f| f.is_computed()).collect();
    let names: HashSet<&str> = fields.iter().map(|f| f.name.as_str()).collect();
    let mut indegree: HashMap<&str, usize> = HashMap::new();
    for field in &computed {
        let mut heads: Vec<&str> = field
            .depends
            .iter()
            .map(|path| path.split('.').next().unwrap_or(path))
            .collect();
        heads.sort();
        heads.dedup();
        let mut degree = 0;
        for head in heads {
            if !names.contains(head) {
                warn!("Field '{}.{}' depends on unknown field '{}'", model, field.name, head);
                continue;
            }
            dependents.entry(head.to_string()).or_default().push(field.name.clone());
            if computed.iter().any(|c| c.name == head) {
                degree += 1;
            }
        }
        indegree.insert(field.name.as_str(), degree);
    }
    let mut order: Vec<String> = Vec::new();
    while order.len() < computed.len() {
        let ready = computed
            .iter()
            .find(|f| indegree.get(f.name.as_str()) == Some(&0) && !order.contains(&f.name));
        let field = match ready {
            Some(field) => field,
            None => {
                let stuck = computed
                    .iter()
                    .find(|f| !order.contains(&f.name))
                    .map(|f| f.name.clone())
                    .unwrap_or_default();
                return Err(SchemaError::CyclicCompute(stuck));
            }
        };
        order.push(field.name.clone());
        for dependent in dependents.get(&field.name).into_iter().flatten() {
            if let Some(degree) = indegree.get_mut(dependent.as_str()) {
                *degree = degree.saturating_sub(1);
            }
        }
    }
    Ok((order, dependents))
}

fn collect_triggers(
    order: &[String],
    models: &HashMap<String, Arc<ModelSchema>, NameHasher>,
) -> HashMap<String, HashMap<String, Vec<Trigger>, NameHasher>, NameHasher> {
    let mut triggers: HashMap<String, HashMap<String, Vec<Trigger>, NameHasher>, NameHasher> =
        HashMap::default();
    let mut add = |model: &str, field: &str, trigger: Trigger| {
        let list = triggers
            .entry(model.to_string())
            .or_default()
            .entry(field.to_string())
            .or_default();
        if !list.contains(&trigger) {
            list.push(trigger);
        }
    };
    for name in order {
        let schema = &models[name];
        for field in schema.fields().filter(|f| f.is_computed()) {
            for dependency in &field.depends {
                let segments: Vec<&str> = dependency.split('.').collect();
                if segments.len() < 2 {
                    continue;
                }
                let mut current = schema.clone();
                for (k, segment) in segments.iter().enumerate() {
                    let descriptor = match current.field(segment) {
                        Some(descriptor) => descriptor.clone(),
                        None => {
                            warn!("Dependency '{}' of '{}.{}' cannot be resolved", dependency, name, field.name);
                            break;
                        }
                    };
                    let path = segments[..k].join(".");
                    if k > 0 {
                        add(
                            &current.name,
                            *segment,
                            Trigger { model: name.clone(), field: field.name.clone(), path: path.clone() },
                        );
                    }
                    if k == segments.len() - 1 {
                        break;
                    }
                    let target = descriptor.relation.as_deref().and_then(|t| models.get(t));
                    let target = match target {
                        Some(target) => target.clone(),
                        None => {
                            warn!("Dependency '{}' of '{}.{}' leaves the registry", dependency, name, field.name);
                            break;
                        }
                    };
                    if let Some(inverse) = descriptor.inverse.as_deref() {
                        let through = segments[..=k].join(".");
                        add(
                            &target.name,
                            inverse,
                            Trigger { model: name.clone(), field: field.name.clone(), path: through },
                        );
                    }
                    current = target;
                }
            }
        }
    }
    triggers
}

// ------------- Registry -------------
/// The published, immutable set of merged models.
#[derive(Debug)]
pub struct Registry {
    models: HashMap<String, Arc<ModelSchema>, NameHasher>,
    order: Vec<String>,
    tables: BiMap<String, String>,
    triggers: HashMap<String, HashMap<String, Vec<Trigger>, NameHasher>, NameHasher>,
}

impl Registry {
    pub fn model(&self, name: &str) -> Option<&Arc<ModelSchema>> {
        self.models.get(name)
    }
    /// Models in registration order.
    pub fn models(&self) -> impl Iterator<Item = &Arc<ModelSchema>> {
        self.order.iter().filter_map(|name| self.models.get(name))
    }
    pub fn len(&self) -> usize {
        self.order.len()
    }
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
    pub fn table_of(&self, model: &str) -> Option<&str> {
        self.tables.get_by_left(model).map(String::as_str)
    }
    pub fn model_of_table(&self, table: &str) -> Option<&str> {
        self.tables.get_by_right(table).map(String::as_str)
    }
    /// The target model of a relational field, if it is registered.
    pub fn target_of(&self, field: &FieldDescriptor) -> Option<&Arc<ModelSchema>> {
        field.relation_target().and_then(|target| self.models.get(target))
    }
    pub fn triggers(&self, model: &str, field: &str) -> &[Trigger] {
        self.triggers
            .get(model)
            .and_then(|fields| fields.get(field))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
    /// Stored many-to-one fields, on any model, that point at `model`.
    pub fn referrers(&self, model: &str) -> Vec<(Arc<ModelSchema>, FieldDescriptor)> {
        let mut referrers = Vec::new();
        for schema in self.models() {
            for field in schema.fields() {
                if field.kind() == FieldKind::Many2one
                    && field.is_stored()
                    && field.relation_target() == Some(model)
                {
                    referrers.push((schema.clone(), field.clone()));
                }
            }
        }
        referrers
    }
}

static INSTALLED: OnceLock<Arc<Registry>> = OnceLock::new();

/// Installs a published registry as the process-wide one. Only the first
/// installation succeeds.
pub fn install(registry: Arc<Registry>) -> Result<(), SchemaError> {
    INSTALLED.set(registry).map_err(|_| SchemaError::RegistryPublished)
}

pub fn installed() -> Option<Arc<Registry>> {
    INSTALLED.get().cloned()
}
