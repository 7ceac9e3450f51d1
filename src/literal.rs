//! The textual literal form of domains.
//!
//! Accepts the list-of-tuples notation users type in configuration and on the
//! command line: operators are quoted strings, conditions are 3-tuples, and
//! values are quoted strings, numbers, `True`/`False`, `None` or lists.
use pest::Parser;
use pest::error::LineColLocation;
use pest::iterators::Pair;
use pest_derive::Parser;

use crate::domain::{Condition, Domain, LogicOp, Token};
use crate::error::DomainError;
use crate::value::Value;

#[derive(Parser)]
#[grammar = "literal.pest"]
struct LiteralParser;

pub fn parse_literal(text: &str) -> Result<Domain, DomainError> {
    let mut pairs = LiteralParser::parse(Rule::domain, text).map_err(|e| {
        let (line, col) = match e.line_col {
            LineColLocation::Pos(position) => position,
            LineColLocation::Span(start, _) => start,
        };
        DomainError::Literal { message: e.variant.message().to_string(), line, col }
    })?;
    let mut tokens = Vec::new();
    if let Some(domain) = pairs.next() {
        for item in domain.into_inner() {
            if item.as_rule() != Rule::item {
                continue;
            }
            for inner in item.into_inner() {
                tokens.push(token(inner)?);
            }
        }
    }
    Ok(Domain::from_tokens(tokens))
}

fn token(pair: Pair<'_, Rule>) -> Result<Token, DomainError> {
    match pair.as_rule() {
        Rule::string => {
            let text = string(pair);
            LogicOp::from_symbol(&text).map(Token::Op).ok_or_else(|| {
                DomainError::MalformedExpression(format!("'{}' is neither an operator nor a condition", text))
            })
        }
        Rule::condition => {
            let mut parts = pair.into_inner();
            let (path, comparator, value) = match (parts.next(), parts.next(), parts.next()) {
                (Some(path), Some(comparator), Some(value)) => (path, comparator, value),
                _ => return Err(DomainError::MalformedExpression("incomplete condition".to_string())),
            };
            Ok(Token::Leaf(Condition {
                path: string(path),
                comparator: string(comparator).parse()?,
                value: value_of(value)?,
            }))
        }
        other => Err(DomainError::MalformedExpression(format!("unexpected {:?}", other))),
    }
}

fn value_of(pair: Pair<'_, Rule>) -> Result<Value, DomainError> {
    match pair.as_rule() {
        Rule::value => match pair.into_inner().next() {
            Some(inner) => value_of(inner),
            None => Err(DomainError::MalformedExpression("empty value".to_string())),
        },
        Rule::string => Ok(Value::Text(string(pair))),
        Rule::number => {
            let text = pair.as_str();
            let parsed = if text.contains('.') {
                text.parse::<f64>().ok().map(Value::Float)
            } else {
                text.parse::<i64>().ok().map(Value::Integer)
            };
            parsed.ok_or_else(|| DomainError::MalformedExpression(format!("bad number '{}'", text)))
        }
        Rule::boolean => Ok(Value::Bool(pair.as_str().eq_ignore_ascii_case("true"))),
        Rule::none => Ok(Value::Null),
        Rule::list => Ok(Value::List(pair.into_inner().map(value_of).collect::<Result<_, _>>()?)),
        other => Err(DomainError::MalformedExpression(format!("unexpected {:?}", other))),
    }
}

fn string(pair: Pair<'_, Rule>) -> String {
    let raw = pair.into_inner().next().map(|inner| inner.as_str()).unwrap_or_default();
    let mut unescaped = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            unescaped.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => unescaped.push('\n'),
            Some('t') => unescaped.push('\t'),
            Some(other) => unescaped.push(other),
            None => unescaped.push('\\'),
        }
    }
    unescaped
}
