use std::collections::HashMap;
use std::fmt;

use crate::NameHasher;
use crate::field::FieldDescriptor;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self { field: field.into(), direction: Direction::Asc }
    }
    pub fn desc(field: impl Into<String>) -> Self {
        Self { field: field.into(), direction: Direction::Desc }
    }
}

impl fmt::Display for OrderBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            Direction::Asc => write!(f, "{} asc", self.field),
            Direction::Desc => write!(f, "{} desc", self.field),
        }
    }
}

/// Parses `"name asc, id desc"`. A missing direction means ascending.
pub fn parse_order(text: &str) -> Result<Vec<OrderBy>, String> {
    let mut order = Vec::new();
    for term in text.split(',') {
        let mut words = term.split_whitespace();
        let field = match words.next() {
            Some(field) => field,
            None => return Err(format!("empty term in '{}'", text)),
        };
        let direction = match words.next().map(|w| w.to_ascii_lowercase()) {
            None => Direction::Asc,
            Some(w) if w == "asc" => Direction::Asc,
            Some(w) if w == "desc" => Direction::Desc,
            Some(w) => return Err(format!("unknown direction '{}'", w)),
        };
        if words.next().is_some() {
            return Err(format!("trailing words in '{}'", term.trim()));
        }
        order.push(OrderBy { field: field.to_string(), direction });
    }
    Ok(order)
}

/// One declaration of a model, as handed to the registry.
///
/// A base declaration introduces a model. An extension (see
/// [`ModelDeclaration::extension`]) patches an already named model in place,
/// and `inherits` copies a parent's fields into this one.
#[derive(Clone, Debug, Default)]
pub struct ModelDeclaration {
    pub(crate) name: String,
    pub(crate) extends: Option<String>,
    pub(crate) parents: Vec<String>,
    pub(crate) table: Option<String>,
    pub(crate) description: Option<String>,
    pub(crate) order: Option<String>,
    pub(crate) rec_name: Option<String>,
    pub(crate) fields: Vec<FieldDescriptor>,
}

impl ModelDeclaration {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }
    /// A same-name patch of `name`.
    pub fn extension(name: impl Into<String>) -> Self {
        let name = name.into();
        Self { extends: Some(name.clone()), name, ..Default::default() }
    }
    /// Sets the extension target explicitly; it must equal the declared name.
    pub fn extends(mut self, target: impl Into<String>) -> Self {
        self.extends = Some(target.into());
        self
    }
    pub fn inherits(mut self, parent: impl Into<String>) -> Self {
        self.parents.push(parent.into());
        self
    }
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
    /// Default order as text, e.g. `"name asc, id desc"`.
    pub fn order(mut self, order: impl Into<String>) -> Self {
        self.order = Some(order.into());
        self
    }
    /// Field used as the display name of records.
    pub fn rec_name(mut self, field: impl Into<String>) -> Self {
        self.rec_name = Some(field.into());
        self
    }
    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn is_extension(&self) -> bool {
        self.extends.is_some()
    }
}

/// The merged, effective schema of one model.
#[derive(Debug)]
pub struct ModelSchema {
    pub(crate) name: String,
    pub(crate) table: String,
    pub(crate) description: String,
    pub(crate) order: Vec<OrderBy>,
    pub(crate) rec_name: String,
    pub(crate) fields: Vec<FieldDescriptor>,
    pub(crate) positions: HashMap<String, usize, NameHasher>,
    pub(crate) compute_order: Vec<String>,
    pub(crate) dependents: HashMap<String, Vec<String>, NameHasher>,
}

impl ModelSchema {
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn table(&self) -> &str {
        &self.table
    }
    pub fn description(&self) -> &str {
        &self.description
    }
    pub fn default_order(&self) -> &[OrderBy] {
        &self.order
    }
    pub fn display_name_field(&self) -> &str {
        &self.rec_name
    }
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.positions.get(name).map(|&i| &self.fields[i])
    }
    pub fn has_field(&self, name: &str) -> bool {
        self.positions.contains_key(name)
    }
    /// Fields in declaration order, inherited ones first.
    pub fn fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter()
    }
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name()).collect()
    }
    /// Computed fields, dependencies before dependents.
    pub fn compute_order(&self) -> &[String] {
        &self.compute_order
    }
    /// Computed fields of this model that directly depend on `field`.
    pub fn dependents_of(&self, field: &str) -> &[String] {
        self.dependents.get(field).map(Vec::as_slice).unwrap_or(&[])
    }
    /// Fields held in the model's own table, `id` excluded.
    pub fn columns(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| f.is_column() && f.name() != "id")
    }
}
