//! Field kinds and descriptors.
//!
//! A [`FieldDescriptor`] is assembled with chained builder calls, e.g.
//! `FieldDescriptor::char("name").required().size(64)`. Descriptors are
//! immutable once a registry is published.
use std::fmt;
use std::sync::Arc;

use crate::error::EngineError;
use crate::recordset::Record;
use crate::value::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Char,
    Text,
    Integer,
    Float,
    Boolean,
    Date,
    DateTime,
    Binary,
    Selection,
    Many2one,
    One2many,
    Many2many,
}

impl FieldKind {
    pub fn name(self) -> &'static str {
        match self {
            FieldKind::Char => "char",
            FieldKind::Text => "text",
            FieldKind::Integer => "integer",
            FieldKind::Float => "float",
            FieldKind::Boolean => "boolean",
            FieldKind::Date => "date",
            FieldKind::DateTime => "datetime",
            FieldKind::Binary => "binary",
            FieldKind::Selection => "selection",
            FieldKind::Many2one => "many2one",
            FieldKind::One2many => "one2many",
            FieldKind::Many2many => "many2many",
        }
    }
    pub fn is_relational(self) -> bool {
        matches!(self, FieldKind::Many2one | FieldKind::One2many | FieldKind::Many2many)
    }
    pub fn is_x2many(self) -> bool {
        matches!(self, FieldKind::One2many | FieldKind::Many2many)
    }
    pub fn is_textual(self) -> bool {
        matches!(self, FieldKind::Char | FieldKind::Text | FieldKind::Selection)
    }
    /// The value a field of this kind takes when nothing else is given.
    pub fn type_default(self) -> Value {
        match self {
            FieldKind::Char | FieldKind::Text => Value::Text(String::new()),
            FieldKind::Integer => Value::Integer(0),
            FieldKind::Float => Value::Float(0.0),
            FieldKind::Boolean => Value::Bool(false),
            FieldKind::One2many | FieldKind::Many2many => Value::Ids(Vec::new()),
            _ => Value::Null,
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

pub type DefaultFn = Arc<dyn Fn() -> Value + Send + Sync>;
/// Computes the value of one field for one record.
pub type ComputeFn = Arc<dyn Fn(&Record<'_>) -> Result<Value, EngineError> + Send + Sync>;

#[derive(Clone)]
pub enum FieldDefault {
    Fixed(Value),
    Producer(DefaultFn),
}

impl FieldDefault {
    pub fn produce(&self) -> Value {
        match self {
            FieldDefault::Fixed(value) => value.clone(),
            FieldDefault::Producer(producer) => producer(),
        }
    }
}

impl fmt::Debug for FieldDefault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldDefault::Fixed(value) => write!(f, "Fixed({:?})", value),
            FieldDefault::Producer(_) => write!(f, "Producer(..)"),
        }
    }
}

/// What happens to referencing records when a many-to-one target is deleted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnDelete {
    SetNull,
    Restrict,
    Cascade,
}

#[derive(Clone)]
pub struct FieldDescriptor {
    pub(crate) name: String,
    pub(crate) kind: FieldKind,
    pub(crate) string: Option<String>,
    pub(crate) help: Option<String>,
    pub(crate) required: bool,
    pub(crate) readonly: bool,
    pub(crate) index: bool,
    pub(crate) copy: bool,
    pub(crate) store: Option<bool>,
    pub(crate) default: Option<FieldDefault>,
    pub(crate) selection: Vec<(String, String)>,
    pub(crate) size: Option<usize>,
    pub(crate) relation: Option<String>,
    pub(crate) inverse: Option<String>,
    pub(crate) relation_table: Option<String>,
    pub(crate) columns: Option<(String, String)>,
    pub(crate) ondelete: OnDelete,
    pub(crate) depends: Vec<String>,
    pub(crate) compute: Option<ComputeFn>,
    pub(crate) related: Option<String>,
}

impl FieldDescriptor {
    fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            string: None,
            help: None,
            required: false,
            readonly: false,
            index: false,
            copy: kind != FieldKind::One2many,
            store: None,
            default: None,
            selection: Vec::new(),
            size: if kind == FieldKind::Char { Some(255) } else { None },
            relation: None,
            inverse: None,
            relation_table: None,
            columns: None,
            ondelete: OnDelete::SetNull,
            depends: Vec::new(),
            compute: None,
            related: None,
        }
    }
    pub fn char(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Char)
    }
    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Text)
    }
    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Integer)
    }
    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Float)
    }
    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Boolean)
    }
    pub fn date(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Date)
    }
    pub fn datetime(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::DateTime)
    }
    pub fn binary(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Binary)
    }
    /// Options are `(stored value, label)` pairs.
    pub fn selection(name: impl Into<String>, options: &[(&str, &str)]) -> Self {
        let mut field = Self::new(name, FieldKind::Selection);
        field.selection = options
            .iter()
            .map(|(value, label)| (value.to_string(), label.to_string()))
            .collect();
        field
    }
    pub fn many2one(name: impl Into<String>, target: impl Into<String>) -> Self {
        let mut field = Self::new(name, FieldKind::Many2one);
        field.relation = Some(target.into());
        field
    }
    pub fn one2many(
        name: impl Into<String>,
        target: impl Into<String>,
        inverse: impl Into<String>,
    ) -> Self {
        let mut field = Self::new(name, FieldKind::One2many);
        field.relation = Some(target.into());
        field.inverse = Some(inverse.into());
        field
    }
    pub fn many2many(name: impl Into<String>, target: impl Into<String>) -> Self {
        let mut field = Self::new(name, FieldKind::Many2many);
        field.relation = Some(target.into());
        field
    }

    // ------------- Options --------------
    pub fn label(mut self, string: impl Into<String>) -> Self {
        self.string = Some(string.into());
        self
    }
    pub fn help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
    pub fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }
    pub fn indexed(mut self) -> Self {
        self.index = true;
        self
    }
    pub fn no_copy(mut self) -> Self {
        self.copy = false;
        self
    }
    pub fn store(mut self, store: bool) -> Self {
        self.store = Some(store);
        self
    }
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(FieldDefault::Fixed(value.into()));
        self
    }
    pub fn default_with(mut self, producer: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        self.default = Some(FieldDefault::Producer(Arc::new(producer)));
        self
    }
    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }
    pub fn ondelete(mut self, ondelete: OnDelete) -> Self {
        self.ondelete = ondelete;
        self
    }
    /// Junction table of a many-to-many field; defaults to
    /// `<model_a>_<model_b>_rel` over the sorted model names.
    pub fn relation_table(mut self, table: impl Into<String>) -> Self {
        self.relation_table = Some(table.into());
        self
    }
    /// Junction columns of a many-to-many field: own side, then target side.
    pub fn columns(mut self, own: impl Into<String>, target: impl Into<String>) -> Self {
        self.columns = Some((own.into(), target.into()));
        self
    }
    /// Field paths (possibly dotted) whose change invalidates this field.
    pub fn depends<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends.extend(paths.into_iter().map(Into::into));
        self
    }
    pub fn computed(
        mut self,
        compute: impl Fn(&Record<'_>) -> Result<Value, EngineError> + Send + Sync + 'static,
    ) -> Self {
        self.compute = Some(Arc::new(compute));
        self
    }
    /// Mirrors the value found at a dotted path, e.g. `partner_id.name`.
    pub fn related(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.depends = vec![path.clone()];
        self.related = Some(path);
        self
    }

    // ------------- Accessors --------------
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn kind(&self) -> FieldKind {
        self.kind
    }
    /// Human label, derived from the name when none was given.
    pub fn string(&self) -> String {
        match &self.string {
            Some(s) => s.clone(),
            None => {
                let base = self.name.strip_suffix("_ids").or_else(|| self.name.strip_suffix("_id"));
                let words: Vec<String> = base
                    .unwrap_or(&self.name)
                    .split('_')
                    .filter(|w| !w.is_empty())
                    .map(|w| {
                        let mut chars = w.chars();
                        match chars.next() {
                            Some(first) => first.to_uppercase().chain(chars).collect(),
                            None => String::new(),
                        }
                    })
                    .collect();
                words.join(" ")
            }
        }
    }
    pub fn help_text(&self) -> Option<&str> {
        self.help.as_deref()
    }
    pub fn is_required(&self) -> bool {
        self.required
    }
    /// Computed fields without an inverse are readonly as well.
    pub fn is_readonly(&self) -> bool {
        self.readonly || self.is_computed()
    }
    pub fn is_indexed(&self) -> bool {
        self.index
    }
    pub fn is_copied(&self) -> bool {
        self.copy
    }
    pub fn is_computed(&self) -> bool {
        self.compute.is_some() || self.related.is_some()
    }
    /// One-to-many fields and computed fields are virtual unless asked otherwise.
    pub fn is_stored(&self) -> bool {
        match self.store {
            Some(store) => store && self.kind != FieldKind::One2many,
            None => !self.is_computed() && self.kind != FieldKind::One2many,
        }
    }
    /// Stored in a column of the model's own table.
    pub fn is_column(&self) -> bool {
        self.is_stored() && !self.kind.is_x2many()
    }
    pub fn default(&self) -> Option<&FieldDefault> {
        self.default.as_ref()
    }
    pub fn selection_options(&self) -> &[(String, String)] {
        &self.selection
    }
    pub fn size_limit(&self) -> Option<usize> {
        self.size
    }
    pub fn relation_target(&self) -> Option<&str> {
        self.relation.as_deref()
    }
    pub fn inverse_field(&self) -> Option<&str> {
        self.inverse.as_deref()
    }
    pub fn junction_table(&self) -> Option<&str> {
        self.relation_table.as_deref()
    }
    pub fn junction_columns(&self) -> Option<(&str, &str)> {
        self.columns.as_ref().map(|(a, b)| (a.as_str(), b.as_str()))
    }
    pub fn on_delete(&self) -> OnDelete {
        self.ondelete
    }
    pub fn compute_dependencies(&self) -> &[String] {
        &self.depends
    }
    pub fn compute_fn(&self) -> Option<&ComputeFn> {
        self.compute.as_ref()
    }
    pub fn related_path(&self) -> Option<&str> {
        self.related.as_deref()
    }
    /// The default a new record receives: the declared one, else the kind's.
    pub fn initial_value(&self) -> Value {
        match &self.default {
            Some(default) => default.produce(),
            None => self.kind.type_default(),
        }
    }
}

impl fmt::Debug for FieldDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("required", &self.required)
            .field("readonly", &self.readonly)
            .field("stored", &self.is_stored())
            .field("relation", &self.relation)
            .field("inverse", &self.inverse)
            .field("depends", &self.depends)
            .field("computed", &self.is_computed())
            .field("related", &self.related)
            .finish()
    }
}
