//! The domain query language.
//!
//! A domain is a flat sequence of tokens in Polish (prefix) notation: the
//! logical operators `&` and `|` take the next two expressions, `!` takes
//! the next one, and a condition is a `(field path, comparator, value)`
//! triple. Conditions left over without an operator are joined by `&`, so
//! `[c1, c2, c3]` means `[&, c1, &, c2, c3]`.
//!
//! Parsing produces a [`PredicateNode`] tree, which is either evaluated
//! directly against a [`Row`] or compiled for the storage layer
//! (see [`crate::compile`]).
use std::cmp::Ordering;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use regex::{Regex, RegexBuilder};
use serde::de::Error as _;
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::DomainError;
use crate::value::Value;

// ------------- Tokens -------------
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Comparator {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Like,
    ILike,
    EqLike,
    EqILike,
    In,
    NotIn,
    ChildOf,
    ParentOf,
}

impl Comparator {
    pub const ALL: [Comparator; 14] = [
        Comparator::Eq,
        Comparator::Ne,
        Comparator::Gt,
        Comparator::Lt,
        Comparator::Ge,
        Comparator::Le,
        Comparator::Like,
        Comparator::ILike,
        Comparator::EqLike,
        Comparator::EqILike,
        Comparator::In,
        Comparator::NotIn,
        Comparator::ChildOf,
        Comparator::ParentOf,
    ];
    pub fn symbol(self) -> &'static str {
        match self {
            Comparator::Eq => "=",
            Comparator::Ne => "!=",
            Comparator::Gt => ">",
            Comparator::Lt => "<",
            Comparator::Ge => ">=",
            Comparator::Le => "<=",
            Comparator::Like => "like",
            Comparator::ILike => "ilike",
            Comparator::EqLike => "=like",
            Comparator::EqILike => "=ilike",
            Comparator::In => "in",
            Comparator::NotIn => "not in",
            Comparator::ChildOf => "child_of",
            Comparator::ParentOf => "parent_of",
        }
    }
    pub fn is_like(self) -> bool {
        matches!(
            self,
            Comparator::Like | Comparator::ILike | Comparator::EqLike | Comparator::EqILike
        )
    }
    pub fn is_ordering(self) -> bool {
        matches!(self, Comparator::Gt | Comparator::Lt | Comparator::Ge | Comparator::Le)
    }
}

impl FromStr for Comparator {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "=" | "==" => Ok(Comparator::Eq),
            "!=" | "<>" => Ok(Comparator::Ne),
            ">" => Ok(Comparator::Gt),
            "<" => Ok(Comparator::Lt),
            ">=" => Ok(Comparator::Ge),
            "<=" => Ok(Comparator::Le),
            "like" => Ok(Comparator::Like),
            "ilike" => Ok(Comparator::ILike),
            "=like" => Ok(Comparator::EqLike),
            "=ilike" => Ok(Comparator::EqILike),
            "in" => Ok(Comparator::In),
            "not in" => Ok(Comparator::NotIn),
            "child_of" => Ok(Comparator::ChildOf),
            "parent_of" => Ok(Comparator::ParentOf),
            _ => Err(DomainError::UnknownComparator(s.to_string())),
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LogicOp {
    And,
    Or,
    Not,
}

impl LogicOp {
    pub fn symbol(self) -> &'static str {
        match self {
            LogicOp::And => "&",
            LogicOp::Or => "|",
            LogicOp::Not => "!",
        }
    }
    pub fn from_symbol(s: &str) -> Option<Self> {
        match s {
            "&" => Some(LogicOp::And),
            "|" => Some(LogicOp::Or),
            "!" => Some(LogicOp::Not),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Condition {
    pub path: String,
    pub comparator: Comparator,
    pub value: Value,
}

impl Condition {
    pub fn new(path: impl Into<String>, comparator: Comparator, value: impl Into<Value>) -> Self {
        Self { path: path.into(), comparator, value: value.into() }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    Op(LogicOp),
    Leaf(Condition),
}

impl Token {
    pub fn and() -> Self {
        Token::Op(LogicOp::And)
    }
    pub fn or() -> Self {
        Token::Op(LogicOp::Or)
    }
    pub fn not() -> Self {
        Token::Op(LogicOp::Not)
    }
    pub fn leaf(path: impl Into<String>, comparator: Comparator, value: impl Into<Value>) -> Self {
        Token::Leaf(Condition::new(path, comparator, value))
    }
    /// Reads one token of the JSON wire form: an operator string or a
    /// three-element `[path, comparator, value]` array.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, DomainError> {
        match json {
            serde_json::Value::String(s) => LogicOp::from_symbol(s)
                .map(Token::Op)
                .ok_or_else(|| DomainError::MalformedExpression(format!("'{}' is not an operator", s))),
            serde_json::Value::Array(items) if items.len() == 3 => {
                let path = items[0].as_str().ok_or_else(|| {
                    DomainError::MalformedExpression(format!("field path must be a string in {}", json))
                })?;
                let comparator = items[1].as_str().ok_or_else(|| {
                    DomainError::MalformedExpression(format!("comparator must be a string in {}", json))
                })?;
                Ok(Token::Leaf(Condition {
                    path: path.to_string(),
                    comparator: comparator.parse()?,
                    value: Value::from_json(&items[2]),
                }))
            }
            _ => Err(DomainError::MalformedExpression(format!("unexpected token {}", json))),
        }
    }
}

impl Serialize for Token {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Token::Op(op) => serializer.serialize_str(op.symbol()),
            Token::Leaf(condition) => {
                let mut tuple = serializer.serialize_tuple(3)?;
                tuple.serialize_element(&condition.path)?;
                tuple.serialize_element(condition.comparator.symbol())?;
                tuple.serialize_element(&condition.value.to_json())?;
                tuple.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Token {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Token::from_json(&json).map_err(D::Error::custom)
    }
}

// ------------- Domain -------------
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Domain(Vec<Token>);

impl Domain {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn from_tokens(tokens: Vec<Token>) -> Self {
        Domain(tokens)
    }
    /// A domain holding the single condition `(path, comparator, value)`.
    pub fn leaf(path: impl Into<String>, comparator: Comparator, value: impl Into<Value>) -> Self {
        Domain(vec![Token::leaf(path, comparator, value)])
    }
    pub fn push(mut self, token: Token) -> Self {
        self.0.push(token);
        self
    }
    pub fn tokens(&self) -> &[Token] {
        &self.0
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    pub fn parse(&self) -> Result<PredicateNode, DomainError> {
        parse(&self.0)
    }
    /// The canonical form with every implicit `&` made explicit.
    pub fn normalize(&self) -> Result<Domain, DomainError> {
        Ok(self.parse()?.to_domain())
    }
    pub fn and(&self, other: &Domain) -> Result<Domain, DomainError> {
        Ok(PredicateNode::and(self.parse()?, other.parse()?).to_domain())
    }
    pub fn or(&self, other: &Domain) -> Result<Domain, DomainError> {
        Ok(PredicateNode::or(self.parse()?, other.parse()?).to_domain())
    }
    /// Parses the textual literal form, e.g. `[('active', '=', True)]`.
    pub fn parse_literal(text: &str) -> Result<Domain, DomainError> {
        crate::literal::parse_literal(text)
    }
    pub fn from_json_str(text: &str) -> Result<Domain, DomainError> {
        let json: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| DomainError::MalformedExpression(e.to_string()))?;
        match json {
            serde_json::Value::Array(items) => {
                Ok(Domain(items.iter().map(Token::from_json).collect::<Result<_, _>>()?))
            }
            other => Err(DomainError::MalformedExpression(format!("a domain is a list, got {}", other))),
        }
    }
    pub fn to_json_string(&self) -> String {
        let tokens: Vec<serde_json::Value> = self
            .0
            .iter()
            .map(|token| match token {
                Token::Op(op) => serde_json::Value::from(op.symbol()),
                Token::Leaf(c) => serde_json::Value::Array(vec![
                    serde_json::Value::from(c.path.as_str()),
                    serde_json::Value::from(c.comparator.symbol()),
                    c.value.to_json(),
                ]),
            })
            .collect();
        serde_json::Value::Array(tokens).to_string()
    }
}

impl From<Vec<Token>> for Domain {
    fn from(tokens: Vec<Token>) -> Self {
        Domain(tokens)
    }
}

fn literal(value: &Value) -> String {
    fn quote(s: &str) -> String {
        format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
    }
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Float(f) => format!("{:?}", f),
        Value::Text(s) => quote(s),
        Value::Date(_) | Value::DateTime(_) => quote(&value.to_string()),
        Value::Id(id) => id.to_string(),
        Value::Binary(bytes) => {
            format!("[{}]", bytes.iter().map(|b| b.to_string()).collect::<Vec<_>>().join(", "))
        }
        Value::Ids(ids) => {
            format!("[{}]", ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(", "))
        }
        Value::List(items) => format!("[{}]", items.iter().map(literal).collect::<Vec<_>>().join(", ")),
    }
}

/// Renders the textual literal form accepted by [`Domain::parse_literal`].
impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tokens: Vec<String> = self
            .0
            .iter()
            .map(|token| match token {
                Token::Op(op) => format!("'{}'", op.symbol()),
                Token::Leaf(c) => format!("('{}', '{}', {})", c.path, c.comparator, literal(&c.value)),
            })
            .collect();
        write!(f, "[{}]", tokens.join(", "))
    }
}

// ------------- Predicate tree -------------
#[derive(Clone, Debug, PartialEq)]
pub enum PredicateNode {
    /// The empty domain: matches everything.
    True,
    Leaf(Condition),
    Not(Box<PredicateNode>),
    And(Box<PredicateNode>, Box<PredicateNode>),
    Or(Box<PredicateNode>, Box<PredicateNode>),
}

/// Rendering of `True` when it has to appear inside a token sequence.
fn true_leaf() -> Token {
    Token::leaf("id", Comparator::Ne, false)
}

fn malformed(message: &str) -> DomainError {
    DomainError::MalformedExpression(message.to_string())
}

fn validate(condition: &Condition) -> Result<(), DomainError> {
    let invalid = |reason: &str| DomainError::InvalidValue {
        path: condition.path.clone(),
        comparator: condition.comparator.to_string(),
        reason: reason.to_string(),
    };
    if condition.path.is_empty() || condition.path.split('.').any(str::is_empty) {
        return Err(malformed(&format!("invalid field path '{}'", condition.path)));
    }
    match condition.comparator {
        Comparator::ChildOf | Comparator::ParentOf => Err(DomainError::UnsupportedOperator {
            path: condition.path.clone(),
            comparator: condition.comparator.to_string(),
        }),
        Comparator::In | Comparator::NotIn => match condition.value {
            Value::List(_) | Value::Ids(_) => Ok(()),
            _ => Err(invalid("expected a list")),
        },
        c if c.is_like() => match condition.value {
            Value::Text(_) => Ok(()),
            _ => Err(invalid("expected a text pattern")),
        },
        _ => Ok(()),
    }
}

/// Parses a token sequence right to left with an operand stack.
pub fn parse(tokens: &[Token]) -> Result<PredicateNode, DomainError> {
    let mut stack: Vec<PredicateNode> = Vec::new();
    for token in tokens.iter().rev() {
        match token {
            Token::Leaf(condition) => {
                validate(condition)?;
                stack.push(PredicateNode::Leaf(condition.clone()));
            }
            Token::Op(LogicOp::Not) => {
                let operand = stack.pop().ok_or_else(|| malformed("'!' lacks an operand"))?;
                stack.push(PredicateNode::Not(Box::new(operand)));
            }
            Token::Op(op) => {
                let missing = || malformed(&format!("'{}' lacks operands", op.symbol()));
                let left = stack.pop().ok_or_else(missing)?;
                let right = stack.pop().ok_or_else(missing)?;
                stack.push(match op {
                    LogicOp::And => PredicateNode::And(Box::new(left), Box::new(right)),
                    _ => PredicateNode::Or(Box::new(left), Box::new(right)),
                });
            }
        }
    }
    // the bottom of the stack holds the rightmost expression
    let mut nodes = stack.into_iter();
    let mut folded = match nodes.next() {
        Some(node) => node,
        None => return Ok(PredicateNode::True),
    };
    for node in nodes {
        folded = PredicateNode::And(Box::new(node), Box::new(folded));
    }
    Ok(folded)
}

impl PredicateNode {
    pub fn and(left: PredicateNode, right: PredicateNode) -> PredicateNode {
        match (left, right) {
            (PredicateNode::True, other) | (other, PredicateNode::True) => other,
            (left, right) => PredicateNode::And(Box::new(left), Box::new(right)),
        }
    }
    pub fn or(left: PredicateNode, right: PredicateNode) -> PredicateNode {
        match (left, right) {
            (PredicateNode::True, _) | (_, PredicateNode::True) => PredicateNode::True,
            (left, right) => PredicateNode::Or(Box::new(left), Box::new(right)),
        }
    }
    pub fn negate(node: PredicateNode) -> PredicateNode {
        PredicateNode::Not(Box::new(node))
    }

    pub fn to_domain(&self) -> Domain {
        let mut tokens = Vec::new();
        if *self != PredicateNode::True {
            self.flatten(&mut tokens);
        }
        Domain(tokens)
    }
    fn flatten(&self, tokens: &mut Vec<Token>) {
        match self {
            PredicateNode::True => tokens.push(true_leaf()),
            PredicateNode::Leaf(condition) => tokens.push(Token::Leaf(condition.clone())),
            PredicateNode::Not(inner) => {
                tokens.push(Token::not());
                inner.flatten(tokens);
            }
            PredicateNode::And(left, right) | PredicateNode::Or(left, right) => {
                tokens.push(if matches!(self, PredicateNode::And(..)) { Token::and() } else { Token::or() });
                left.flatten(tokens);
                right.flatten(tokens);
            }
        }
    }

    pub fn conditions(&self) -> Vec<&Condition> {
        let mut conditions = Vec::new();
        self.collect(&mut conditions);
        conditions
    }
    fn collect<'a>(&'a self, conditions: &mut Vec<&'a Condition>) {
        match self {
            PredicateNode::True => {}
            PredicateNode::Leaf(condition) => conditions.push(condition),
            PredicateNode::Not(inner) => inner.collect(conditions),
            PredicateNode::And(left, right) | PredicateNode::Or(left, right) => {
                left.collect(conditions);
                right.collect(conditions);
            }
        }
    }
    /// Distinct field paths referenced by the conditions, in first-use order.
    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = Vec::new();
        for condition in self.conditions() {
            if !paths.contains(&condition.path.as_str()) {
                paths.push(&condition.path);
            }
        }
        paths
    }

    /// The tree prepared for evaluation against many rows.
    pub fn matcher(&self) -> Matcher<'_> {
        match self {
            PredicateNode::True => Matcher::True,
            PredicateNode::Leaf(condition) => {
                let pattern = match (&condition.value, condition.comparator.is_like()) {
                    (Value::Text(pattern), true) => LikePattern::new(pattern, condition.comparator),
                    _ => None,
                };
                Matcher::Leaf(condition, pattern)
            }
            PredicateNode::Not(inner) => Matcher::Not(Box::new(inner.matcher())),
            PredicateNode::And(left, right) => Matcher::And(Box::new(left.matcher()), Box::new(right.matcher())),
            PredicateNode::Or(left, right) => Matcher::Or(Box::new(left.matcher()), Box::new(right.matcher())),
        }
    }

    /// Evaluates the tree against one row.
    pub fn evaluate<R: Row + ?Sized>(&self, row: &R) -> Result<bool, R::Error> {
        self.matcher().matches(row)
    }
}

/// A predicate tree with its `like` patterns compiled, see [`PredicateNode::matcher`].
pub enum Matcher<'a> {
    True,
    Leaf(&'a Condition, Option<LikePattern>),
    Not(Box<Matcher<'a>>),
    And(Box<Matcher<'a>>, Box<Matcher<'a>>),
    Or(Box<Matcher<'a>>, Box<Matcher<'a>>),
}

impl Matcher<'_> {
    pub fn matches<R: Row + ?Sized>(&self, row: &R) -> Result<bool, R::Error> {
        Ok(match self {
            Matcher::True => true,
            Matcher::Leaf(condition, pattern) => {
                let test = |actual: &Value| match pattern {
                    Some(pattern) => matches!(actual, Value::Text(text) if pattern.matches(text)),
                    None => compare_leaf(actual, condition.comparator, &condition.value),
                };
                match row.field(&condition.path)? {
                    FieldPresence::Missing => false,
                    FieldPresence::Present(Value::List(items)) => items.iter().any(test),
                    FieldPresence::Present(actual) => test(&actual),
                }
            }
            Matcher::Not(inner) => !inner.matches(row)?,
            Matcher::And(left, right) => left.matches(row)? && right.matches(row)?,
            Matcher::Or(left, right) => left.matches(row)? || right.matches(row)?,
        })
    }
}

// ------------- Evaluation -------------
///
/// FieldPresence
///
/// What a row holds at a field path. A path that runs through an empty
/// many-to-one is `Missing`; a path that runs through a to-many field is
/// `Present(Value::List(..))` holding every value reached.
///
#[derive(Clone, Debug, PartialEq)]
pub enum FieldPresence {
    Present(Value),
    Missing,
}

pub trait Row {
    type Error;
    fn field(&self, path: &str) -> Result<FieldPresence, Self::Error>;
}

/// Rows given as plain field/value maps, with no relational traversal.
impl Row for crate::storage::Values {
    type Error = Infallible;
    fn field(&self, path: &str) -> Result<FieldPresence, Infallible> {
        Ok(match self.get(path) {
            Some(value) => FieldPresence::Present(value.clone()),
            None => FieldPresence::Missing,
        })
    }
}

/// Compares one value against a condition operand. Shared by the in-memory
/// evaluator and by [`crate::storage::MemoryStorage`], so both agree exactly.
pub fn compare_leaf(actual: &Value, comparator: Comparator, operand: &Value) -> bool {
    if let Value::Ids(ids) = actual {
        return compare_ids(ids, comparator, operand);
    }
    match comparator {
        Comparator::Eq => equals(actual, operand),
        Comparator::Ne => !equals(actual, operand),
        Comparator::Gt => actual.compare(operand) == Some(Ordering::Greater),
        Comparator::Lt => actual.compare(operand) == Some(Ordering::Less),
        Comparator::Ge => matches!(actual.compare(operand), Some(Ordering::Greater | Ordering::Equal)),
        Comparator::Le => matches!(actual.compare(operand), Some(Ordering::Less | Ordering::Equal)),
        Comparator::Like | Comparator::ILike | Comparator::EqLike | Comparator::EqILike => {
            match (actual, operand) {
                (Value::Text(text), Value::Text(pattern)) => like(text, pattern, comparator),
                _ => false,
            }
        }
        Comparator::In => contains(operand, actual),
        Comparator::NotIn => !contains(operand, actual),
        Comparator::ChildOf | Comparator::ParentOf => false,
    }
}

fn equals(actual: &Value, operand: &Value) -> bool {
    match operand {
        Value::Null => actual.is_null(),
        Value::Bool(false) => actual.is_falsy(),
        _ => actual.loosely_equals(operand),
    }
}

fn contains(list: &Value, actual: &Value) -> bool {
    let items: Vec<Value> = match list {
        Value::List(items) => items.clone(),
        Value::Ids(ids) => ids.iter().map(|id| Value::Id(*id)).collect(),
        _ => return false,
    };
    if actual.is_null() {
        items.iter().any(Value::is_falsy)
    } else {
        items.iter().any(|item| actual.loosely_equals(item))
    }
}

fn compare_ids(ids: &[u64], comparator: Comparator, operand: &Value) -> bool {
    match comparator {
        Comparator::Eq if operand.is_falsy() => ids.is_empty(),
        Comparator::Ne if operand.is_falsy() => !ids.is_empty(),
        Comparator::Eq => operand.as_id().is_some_and(|id| ids.contains(&id)),
        Comparator::Ne => !operand.as_id().is_some_and(|id| ids.contains(&id)),
        Comparator::In => operand.ids().iter().any(|id| ids.contains(id)),
        Comparator::NotIn => !operand.ids().iter().any(|id| ids.contains(id)),
        _ => false,
    }
}

/// SQL-style pattern matching: `%` is any run of characters, `_` exactly
/// one. `like` and `ilike` match the pattern anywhere in the text.
pub fn like(text: &str, pattern: &str, comparator: Comparator) -> bool {
    LikePattern::new(pattern, comparator).is_some_and(|pattern| pattern.matches(text))
}

/// A compiled `like`, `ilike`, `=like` or `=ilike` pattern. The case
/// insensitive forms compare the `str::to_lowercase` forms of pattern and
/// text, the same folding [`crate::persist::SqlitePersistor`] registers.
#[derive(Clone, Debug)]
pub struct LikePattern {
    regex: Regex,
    fold: bool,
}

impl LikePattern {
    pub fn new(pattern: &str, comparator: Comparator) -> Option<Self> {
        let fold = matches!(comparator, Comparator::ILike | Comparator::EqILike);
        let pattern = if fold { pattern.to_lowercase() } else { pattern.to_string() };
        let pattern = match comparator {
            Comparator::Like | Comparator::ILike => format!("%{}%", pattern),
            _ => pattern,
        };
        let mut expression = String::from("^");
        for ch in pattern.chars() {
            match ch {
                '%' => expression.push_str(".*"),
                '_' => expression.push('.'),
                other => expression.push_str(&regex::escape(&other.to_string())),
            }
        }
        expression.push('$');
        let regex = RegexBuilder::new(&expression).dot_matches_new_line(true).build().ok()?;
        Some(Self { regex, fold })
    }
    pub fn matches(&self, text: &str) -> bool {
        if self.fold {
            self.regex.is_match(&text.to_lowercase())
        } else {
            self.regex.is_match(text)
        }
    }
}
