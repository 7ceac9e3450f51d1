use std::sync::Arc;

use recordkit::domain::{Comparator, Condition, Domain, FieldPresence, LikePattern, PredicateNode, Row, Token, like};
use recordkit::env::{Env, SearchOptions};
use recordkit::field::FieldDescriptor;
use recordkit::model::ModelDeclaration;
use recordkit::registry::RegistryBuilder;
use recordkit::storage::MemoryStorage;
use recordkit::{DomainError, EngineError, Values, values};

fn setup() -> Env {
    let mut builder = RegistryBuilder::new();
    builder
        .register(
            ModelDeclaration::new("res.partner")
                .field(FieldDescriptor::char("name"))
                .field(FieldDescriptor::boolean("active"))
                .field(FieldDescriptor::integer("age"))
                .field(FieldDescriptor::selection(
                    "state",
                    &[("draft", "Draft"), ("open", "Open"), ("done", "Done")],
                )),
        )
        .unwrap();
    let registry = builder.publish().unwrap();
    let env = Env::new(registry, Arc::new(MemoryStorage::new()));
    let rows: [Values; 3] = [
        values! { "name" => "Alice", "active" => true, "age" => 20, "state" => "draft" },
        values! { "name" => "Bob", "active" => false, "age" => 30, "state" => "done" },
        values! { "name" => "Carol", "active" => true, "age" => 10, "state" => "open" },
    ];
    for row in rows {
        env.create("res.partner", row).unwrap();
    }
    env
}

fn leaf(path: &str, comparator: Comparator, value: impl Into<recordkit::value::Value>) -> PredicateNode {
    PredicateNode::Leaf(Condition::new(path, comparator, value))
}

#[test]
fn implicit_conjunction_is_made_explicit() {
    let domain = Domain::parse_literal("[('active', '=', True), ('age', '>', 18)]").unwrap();
    let normalized = domain.normalize().unwrap();
    assert_eq!(
        normalized.tokens(),
        &[
            Token::and(),
            Token::leaf("active", Comparator::Eq, true),
            Token::leaf("age", Comparator::Gt, 18),
        ]
    );
    assert_eq!(normalized.to_string(), "['&', ('active', '=', True), ('age', '>', 18)]");
}

#[test]
fn leftover_conditions_fold_to_the_right() {
    let domain = Domain::from_tokens(vec![
        Token::leaf("a", Comparator::Eq, 1),
        Token::leaf("b", Comparator::Eq, 2),
        Token::leaf("c", Comparator::Eq, 3),
    ]);
    let expected = PredicateNode::And(
        Box::new(leaf("a", Comparator::Eq, 1)),
        Box::new(PredicateNode::And(
            Box::new(leaf("b", Comparator::Eq, 2)),
            Box::new(leaf("c", Comparator::Eq, 3)),
        )),
    );
    assert_eq!(domain.parse().unwrap(), expected);
    assert_eq!(
        domain.normalize().unwrap().tokens(),
        &[
            Token::and(),
            Token::leaf("a", Comparator::Eq, 1),
            Token::and(),
            Token::leaf("b", Comparator::Eq, 2),
            Token::leaf("c", Comparator::Eq, 3),
        ]
    );
}

#[test]
fn operators_consume_the_following_expressions() {
    // ['|', a, b, c] is (a or b) and c
    let domain = Domain::from_tokens(vec![
        Token::or(),
        Token::leaf("a", Comparator::Eq, 1),
        Token::leaf("b", Comparator::Eq, 2),
        Token::leaf("c", Comparator::Eq, 3),
    ]);
    let expected = PredicateNode::And(
        Box::new(PredicateNode::Or(
            Box::new(leaf("a", Comparator::Eq, 1)),
            Box::new(leaf("b", Comparator::Eq, 2)),
        )),
        Box::new(leaf("c", Comparator::Eq, 3)),
    );
    assert_eq!(domain.parse().unwrap(), expected);

    let negated = Domain::from_tokens(vec![Token::not(), Token::leaf("a", Comparator::Eq, 1), Token::leaf("b", Comparator::Eq, 2)]);
    assert_eq!(
        negated.parse().unwrap(),
        PredicateNode::And(
            Box::new(PredicateNode::Not(Box::new(leaf("a", Comparator::Eq, 1)))),
            Box::new(leaf("b", Comparator::Eq, 2)),
        )
    );
}

#[test]
fn empty_domain_matches_everything() {
    assert_eq!(Domain::new().parse().unwrap(), PredicateNode::True);
    let env = setup();
    let all = env.search("res.partner", &Domain::new(), SearchOptions::default()).unwrap();
    assert_eq!(all.ids(), &[1, 2, 3]);
    assert_eq!(env.search_count("res.partner", &Domain::new()).unwrap(), 3);
}

#[test]
fn worked_example_active_adults() {
    let env = setup();
    let domain = Domain::parse_literal("[('active','=',True),('age','>',18)]").unwrap();
    let found = env.search("res.partner", &domain, SearchOptions::default()).unwrap();
    assert_eq!(found.ids(), &[1]);

    let all = env.search("res.partner", &Domain::new(), SearchOptions::default()).unwrap();
    assert_eq!(all.filtered_domain(&domain).unwrap().ids(), &[1]);
}

#[test]
fn worked_example_draft_or_open() {
    let env = setup();
    let domain = Domain::parse_literal("['|', ('state','=','draft'), ('state','=','open')]").unwrap();
    let found = env.search("res.partner", &domain, SearchOptions::default()).unwrap();
    assert_eq!(found.ids(), &[1, 3]);

    let all = env.browse("res.partner", [3, 2, 1]).unwrap();
    assert_eq!(all.filtered_domain(&domain).unwrap().ids(), &[3, 1]);
}

#[test]
fn json_wire_form_is_stable() {
    let wire = r#"["&",["active","=",true],["age",">",18]]"#;
    let domain = Domain::from_json_str(wire).unwrap();
    assert_eq!(domain, Domain::parse_literal("['&', ('active', '=', True), ('age', '>', 18)]").unwrap());
    assert_eq!(domain.to_json_string(), wire);
    assert_eq!(serde_json::to_string(&domain).unwrap(), wire);

    let decoded: Domain = serde_json::from_str(r#"["|",["state","in",["draft","open"]],"!",["name","=",null]]"#).unwrap();
    assert_eq!(decoded.len(), 4);
    assert_eq!(decoded.tokens()[2], Token::not());
}

#[test]
fn malformed_expressions_are_rejected() {
    let missing = Domain::from_tokens(vec![Token::and(), Token::leaf("a", Comparator::Eq, 1)]);
    assert!(matches!(missing.parse(), Err(DomainError::MalformedExpression(_))));

    let bare_not = Domain::from_tokens(vec![Token::not()]);
    assert!(matches!(bare_not.parse(), Err(DomainError::MalformedExpression(_))));

    let empty_segment = Domain::leaf("partner_id..name", Comparator::Eq, "x");
    assert!(matches!(empty_segment.parse(), Err(DomainError::MalformedExpression(_))));

    let scalar_in = Domain::leaf("state", Comparator::In, "draft");
    assert!(matches!(scalar_in.parse(), Err(DomainError::InvalidValue { .. })));

    assert!(matches!(Domain::from_json_str(r#"{"a": 1}"#), Err(DomainError::MalformedExpression(_))));
    assert!(matches!(Domain::from_json_str(r#"["&&"]"#), Err(DomainError::MalformedExpression(_))));
    assert!(matches!(Domain::from_json_str(r#"[["a","~",1]]"#), Err(DomainError::UnknownComparator(_))));
}

#[test]
fn hierarchy_operators_are_unsupported() {
    let domain = Domain::leaf("parent_id", Comparator::ChildOf, 1);
    assert!(matches!(domain.parse(), Err(DomainError::UnsupportedOperator { .. })));
    let domain = Domain::from_json_str(r#"[["parent_id","parent_of",1]]"#).unwrap();
    assert!(matches!(domain.parse(), Err(DomainError::UnsupportedOperator { .. })));
}

#[test]
fn comparator_spellings() {
    assert_eq!("=".parse::<Comparator>().unwrap(), Comparator::Eq);
    assert_eq!("<>".parse::<Comparator>().unwrap(), Comparator::Ne);
    assert_eq!("NOT IN".parse::<Comparator>().unwrap(), Comparator::NotIn);
    assert_eq!("=ilike".parse::<Comparator>().unwrap(), Comparator::EqILike);
    for comparator in Comparator::ALL {
        assert_eq!(comparator.symbol().parse::<Comparator>().unwrap(), comparator);
    }
}

#[test]
fn combining_domains() {
    let active = Domain::leaf("active", Comparator::Eq, true);
    let young = Domain::leaf("age", Comparator::Lt, 18);
    assert_eq!(
        active.and(&young).unwrap().tokens(),
        &[Token::and(), Token::leaf("active", Comparator::Eq, true), Token::leaf("age", Comparator::Lt, 18)]
    );
    assert_eq!(active.or(&Domain::new()).unwrap(), Domain::new());
    assert_eq!(Domain::new().and(&young).unwrap(), young);

    let env = setup();
    let either = active.or(&young).unwrap();
    let found = env.search("res.partner", &either, SearchOptions::default()).unwrap();
    assert_eq!(found.ids(), &[1, 3]);
}

#[test]
fn invalid_queries_are_distinguishable() {
    let env = setup();
    let err = env
        .search("res.partner", &Domain::leaf("country_id.name", Comparator::Eq, "BE"), SearchOptions::default())
        .unwrap_err();
    assert!(matches!(err, EngineError::Domain(DomainError::UnknownField(_))));
    assert!(err.is_invalid_query());

    let err = env
        .search("res.partner", &Domain::leaf("age", Comparator::Like, "1"), SearchOptions::default())
        .unwrap_err();
    assert!(matches!(err, EngineError::Domain(DomainError::UnsupportedOperator { .. })));

    let err = env
        .search("res.partner", &Domain::leaf("age", Comparator::Gt, "old"), SearchOptions::default())
        .unwrap_err();
    assert!(matches!(err, EngineError::Domain(DomainError::InvalidValue { .. })));

    let err = env.search("res.unknown", &Domain::new(), SearchOptions::default()).unwrap_err();
    assert!(matches!(err, EngineError::UnknownModel(_)));
    assert!(!err.is_invalid_query());
}

#[test]
fn comparisons_by_kind() {
    let env = setup();
    let search = |literal: &str| {
        env.search("res.partner", &Domain::parse_literal(literal).unwrap(), SearchOptions::default())
            .unwrap()
            .ids()
            .to_vec()
    };
    assert_eq!(search("[('name', 'like', 'o')]"), vec![2, 3]);
    assert_eq!(search("[('name', 'ilike', 'A')]"), vec![1, 3]);
    assert_eq!(search("[('name', '=like', 'A%')]"), vec![1]);
    assert_eq!(search("[('name', '=ilike', 'b_b')]"), vec![2]);
    assert_eq!(search("[('name', '>', 'B')]"), vec![2, 3]);
    assert_eq!(search("[('age', '>=', 20), ('age', '<=', 30)]"), vec![1, 2]);
    assert_eq!(search("[('state', 'not in', ['draft', 'done'])]"), vec![3]);
    assert_eq!(search("[('state', 'in', [])]"), Vec::<u64>::new());
    assert_eq!(search("[('state', 'not in', [])]"), vec![1, 2, 3]);
    assert_eq!(search("[('active', '=', False)]"), vec![2]);
    assert_eq!(search("['!', ('active', '=', True)]"), vec![2]);
}

#[test]
fn search_order_limit_offset() {
    let env = setup();
    let options = SearchOptions::default().order("age desc").limit(2);
    let found = env.search("res.partner", &Domain::new(), options).unwrap();
    assert_eq!(found.ids(), &[2, 1]);
    let options = SearchOptions::default().order("age desc").offset(1);
    let found = env.search("res.partner", &Domain::new(), options).unwrap();
    assert_eq!(found.ids(), &[1, 3]);

    let err = env
        .search("res.partner", &Domain::new(), SearchOptions::default().order("age sideways"))
        .unwrap_err();
    assert!(matches!(err, EngineError::Domain(DomainError::InvalidOrder(_))));
    let err = env
        .search("res.partner", &Domain::new(), SearchOptions::default().order("nickname"))
        .unwrap_err();
    assert!(matches!(err, EngineError::Domain(DomainError::InvalidOrder(_))));

    let capped = env.clone().with_default_limit(Some(1));
    assert_eq!(capped.search("res.partner", &Domain::new(), SearchOptions::default()).unwrap().len(), 1);
}

struct Unreadable;

impl Row for Unreadable {
    type Error = String;
    fn field(&self, path: &str) -> Result<FieldPresence, String> {
        match path {
            "name" => Ok(FieldPresence::Present("Alice".into())),
            _ => Err(format!("'{}' unreadable", path)),
        }
    }
}

#[test]
fn row_failures_reach_the_caller() {
    let node = |literal: &str| Domain::parse_literal(literal).unwrap().parse().unwrap();
    let both = node("[('name', '=', 'Alice'), ('age', '>', 3)]");
    assert_eq!(both.evaluate(&Unreadable), Err("'age' unreadable".to_string()));
    let either = node("['|', ('name', '=', 'Alice'), ('age', '>', 3)]");
    assert_eq!(either.evaluate(&Unreadable), Ok(true));
    let negated = node("['!', ('age', '=', 3)]");
    assert!(negated.evaluate(&Unreadable).is_err());
}

#[test]
fn compiled_patterns_match_like_the_one_off_form() {
    let cases = [
        ("Alice", "li", Comparator::Like, true),
        ("Alice", "LI", Comparator::Like, false),
        ("Alice", "LI", Comparator::ILike, true),
        ("Alice", "a%", Comparator::EqLike, false),
        ("Alice", "a%", Comparator::EqILike, true),
        ("B%", "B%", Comparator::EqLike, true),
        ("Bob", "_o_", Comparator::EqLike, true),
        ("émile", "ÉMILE", Comparator::ILike, true),
        ("Émile", "émi%", Comparator::EqILike, true),
        ("Émile", "émile", Comparator::Like, false),
        ("ÅSA", "åsa", Comparator::EqILike, true),
        ("line\nbreak", "line%break", Comparator::EqLike, true),
    ];
    for (text, pattern, comparator, expected) in cases {
        let compiled = LikePattern::new(pattern, comparator).unwrap();
        assert_eq!(compiled.matches(text), expected, "{:?} {} {:?}", text, comparator, pattern);
        assert_eq!(like(text, pattern, comparator), expected, "{:?} {} {:?}", text, comparator, pattern);
    }
}

#[test]
fn one_matcher_serves_many_rows() {
    let node = Domain::parse_literal("['|', ('name', 'ilike', 'É'), ('name', '=like', '_o%')]")
        .unwrap()
        .parse()
        .unwrap();
    let matcher = node.matcher();
    let rows: Vec<Values> = ["Émile", "émilie", "Bob", "Tom", "Alice", "Zoé"]
        .into_iter()
        .map(|name| values! { "name" => name })
        .collect();
    let kept: Vec<&str> = rows
        .iter()
        .filter(|row| matcher.matches(*row).unwrap())
        .map(|row| match row.get("name") {
            Some(recordkit::value::Value::Text(name)) => name.as_str(),
            _ => "",
        })
        .collect();
    assert_eq!(kept, ["Émile", "émilie", "Bob", "Tom", "Zoé"]);
    for row in &rows {
        assert_eq!(node.evaluate(row).unwrap(), matcher.matches(row).unwrap());
    }
    assert!(!matcher.matches(&Values::new()).unwrap());
}
