use std::sync::Arc;

use proptest::prelude::*;

use recordkit::domain::{Comparator, Domain, Token};
use recordkit::env::{Env, SearchOptions};
use recordkit::field::FieldDescriptor;
use recordkit::model::ModelDeclaration;
use recordkit::persist::SqlitePersistor;
use recordkit::registry::{Registry, RegistryBuilder};
use recordkit::storage::MemoryStorage;
use recordkit::value::Value;
use recordkit::values;

fn registry() -> Arc<Registry> {
    let mut builder = RegistryBuilder::new();
    builder
        .register(
            ModelDeclaration::new("res.partner")
                .field(FieldDescriptor::char("name"))
                .field(FieldDescriptor::integer("age"))
                .field(FieldDescriptor::float("score"))
                .field(FieldDescriptor::boolean("active"))
                .field(FieldDescriptor::many2one("country_id", "res.country"))
                .field(FieldDescriptor::many2many("tag_ids", "res.partner.category")),
        )
        .unwrap();
    builder.register(ModelDeclaration::new("res.country").field(FieldDescriptor::char("name"))).unwrap();
    builder.register(ModelDeclaration::new("res.partner.category").field(FieldDescriptor::char("name"))).unwrap();
    builder.publish().unwrap()
}

fn populate(env: Env) -> Env {
    for name in ["Belgium", "bob land"] {
        env.create("res.country", values! { "name" => name }).unwrap();
    }
    for name in ["Alice", "li", "B%", "Émile"] {
        env.create("res.partner.category", values! { "name" => name }).unwrap();
    }
    let partners = vec![
        values! { "name" => "Alice", "age" => 20, "score" => 1.5, "active" => true, "country_id" => Value::Id(1), "tag_ids" => Value::Ids(vec![1, 2]) },
        values! { "name" => "alice", "age" => 35, "score" => 10.0, "country_id" => Value::Id(2) },
        values! { "name" => false, "age" => 0, "active" => true, "tag_ids" => Value::Ids(vec![3]) },
        values! { "name" => "Bob", "age" => 18, "score" => 2.25, "country_id" => Value::Id(1), "tag_ids" => Value::Ids(vec![1, 2, 3]) },
        values! { "name" => "", "age" => 40, "score" => 0.0, "active" => false },
        values! { "name" => "B%", "age" => 1, "score" => 1.0, "active" => true, "country_id" => Value::Id(2), "tag_ids" => Value::Ids(vec![2]) },
        values! { "name" => "_o_", "age" => 20 },
        values! { "name" => "émile", "age" => 27, "score" => 2.25, "country_id" => Value::Id(2), "tag_ids" => Value::Ids(vec![4]) },
    ];
    for values in partners {
        env.create("res.partner", values).unwrap();
    }
    env
}

fn setup() -> Env {
    populate(Env::new(registry(), Arc::new(MemoryStorage::new())))
}

fn sqlite_setup() -> Env {
    let registry = registry();
    let storage = SqlitePersistor::open_in_memory(registry.clone()).unwrap();
    populate(Env::new(registry, Arc::new(storage)))
}

const WORDS: [&str; 9] = ["Alice", "alice", "Bob", "", "li", "B%", "_o_", "Émile", "ÉMILE"];

fn word() -> impl Strategy<Value = Value> {
    prop::sample::select(WORDS.to_vec()).prop_map(Value::from)
}

fn text_leaf(path: &'static str) -> impl Strategy<Value = Token> {
    let word_or_false = prop_oneof![4 => word(), 1 => Just(Value::Bool(false))];
    prop_oneof![
        (
            prop::sample::select(vec![Comparator::Eq, Comparator::Ne, Comparator::Gt, Comparator::Le]),
            word()
        )
            .prop_map(move |(c, v)| Token::leaf(path, c, v)),
        (
            prop::sample::select(vec![Comparator::Like, Comparator::ILike, Comparator::EqLike, Comparator::EqILike]),
            word()
        )
            .prop_map(move |(c, v)| Token::leaf(path, c, v)),
        prop::sample::select(vec![Comparator::Eq, Comparator::Ne]).prop_map(move |c| Token::leaf(path, c, false)),
        (
            prop::sample::select(vec![Comparator::In, Comparator::NotIn]),
            prop::collection::vec(word_or_false, 0..3)
        )
            .prop_map(move |(c, items)| Token::leaf(path, c, Value::List(items))),
    ]
}

fn ordering() -> impl Strategy<Value = Comparator> {
    prop::sample::select(vec![
        Comparator::Eq,
        Comparator::Ne,
        Comparator::Gt,
        Comparator::Lt,
        Comparator::Ge,
        Comparator::Le,
    ])
}

fn membership() -> impl Strategy<Value = Comparator> {
    prop::sample::select(vec![Comparator::In, Comparator::NotIn])
}

fn number_leaf() -> impl Strategy<Value = Token> {
    prop_oneof![
        (ordering(), -1i64..45).prop_map(|(c, n)| Token::leaf("age", c, n)),
        (membership(), prop::collection::vec(0i64..45, 0..4))
            .prop_map(|(c, items)| Token::leaf("age", c, Value::List(items.into_iter().map(Value::Integer).collect()))),
        (ordering(), prop::sample::select(vec![0.0, 1.0, 1.5, 2.25, 10.0]))
            .prop_map(|(c, x)| Token::leaf("score", c, x)),
        (ordering(), 0i64..12).prop_map(|(c, n)| Token::leaf("score", c, n)),
        prop::sample::select(vec![Comparator::Eq, Comparator::Ne]).prop_map(|c| Token::leaf("age", c, false)),
    ]
}

fn relational_leaf() -> impl Strategy<Value = Token> {
    let equality = || prop::sample::select(vec![Comparator::Eq, Comparator::Ne]);
    prop_oneof![
        (equality(), any::<bool>()).prop_map(|(c, b)| Token::leaf("active", c, b)),
        (equality(), 1i64..4).prop_map(|(c, id)| Token::leaf("country_id", c, id)),
        equality().prop_map(|c| Token::leaf("country_id", c, false)),
        (membership(), prop::collection::vec(prop_oneof![(1i64..4).prop_map(Value::Integer), Just(Value::Bool(false))], 0..3))
            .prop_map(|(c, items)| Token::leaf("country_id", c, Value::List(items))),
        (equality(), 1i64..5).prop_map(|(c, id)| Token::leaf("tag_ids", c, id)),
        equality().prop_map(|c| Token::leaf("tag_ids", c, false)),
        (membership(), prop::collection::vec(1i64..5, 0..3))
            .prop_map(|(c, ids)| Token::leaf("tag_ids", c, Value::List(ids.into_iter().map(Value::Integer).collect()))),
    ]
}

fn condition() -> impl Strategy<Value = Token> {
    prop_oneof![
        text_leaf("name"),
        text_leaf("country_id.name"),
        text_leaf("tag_ids.name"),
        number_leaf(),
        relational_leaf(),
    ]
}

fn expression() -> impl Strategy<Value = Vec<Token>> {
    condition().prop_map(|token| vec![token]).prop_recursive(4, 24, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(a, b)| [vec![Token::and()], a, b].concat()),
            (inner.clone(), inner.clone()).prop_map(|(a, b)| [vec![Token::or()], a, b].concat()),
            inner.prop_map(|a| [vec![Token::not()], a].concat()),
        ]
    })
}

fn domain() -> impl Strategy<Value = Domain> {
    prop::collection::vec(expression(), 0..4).prop_map(|parts| Domain::from_tokens(parts.concat()))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn storage_and_memory_evaluation_agree(domain in domain()) {
        let memory = setup();
        let sqlite = sqlite_setup();
        let all = memory.search("res.partner", &Domain::new(), SearchOptions::default()).unwrap();
        let filtered = all.filtered_domain(&domain).unwrap();
        for env in [&memory, &sqlite] {
            let searched = env.search("res.partner", &domain, SearchOptions::default()).unwrap();
            prop_assert_eq!(searched.ids(), filtered.ids(), "domain {}", domain);
        }
    }

    #[test]
    fn normalization_preserves_meaning(domain in domain()) {
        let env = setup();
        let normalized = domain.normalize().unwrap();
        let all = env.search("res.partner", &Domain::new(), SearchOptions::default()).unwrap();
        let by_domain = all.filtered_domain(&domain).unwrap();
        let by_normalized = all.filtered_domain(&normalized).unwrap();
        prop_assert_eq!(
            by_domain.ids(),
            by_normalized.ids()
        );
        // normal form is a fixed point
        prop_assert_eq!(normalized.normalize().unwrap(), normalized);
    }

    #[test]
    fn wire_and_literal_forms_read_back(domain in domain()) {
        prop_assert_eq!(Domain::from_json_str(&domain.to_json_string()).unwrap().parse().unwrap(), domain.parse().unwrap());
        let reread = Domain::parse_literal(&domain.to_string()).unwrap();
        prop_assert_eq!(reread.parse().unwrap(), domain.parse().unwrap());
    }
}

#[test]
fn traversal_through_empty_relations() {
    let memory = setup();
    let sqlite = sqlite_setup();
    let all = memory.search("res.partner", &Domain::new(), SearchOptions::default()).unwrap();
    let search = |env: &Env, literal: &str| {
        let domain = Domain::parse_literal(literal).unwrap();
        env.search("res.partner", &domain, SearchOptions::default()).unwrap().ids().to_vec()
    };
    for env in [&memory, &sqlite] {
        for literal in [
            "[('country_id.name', '=', 'Belgium')]",
            "['!', ('country_id.name', '=', 'Belgium')]",
            "[('tag_ids.name', 'like', 'li')]",
            "[('tag_ids.name', 'ilike', 'émile')]",
            "[('tag_ids', '=', False)]",
            "[('tag_ids', 'not in', [1])]",
            "[('name', '=', False)]",
            "[('name', 'in', ['Bob', False])]",
            "[('name', '=ilike', 'ÉMILE')]",
        ] {
            let domain = Domain::parse_literal(literal).unwrap();
            assert_eq!(search(env, literal), all.filtered_domain(&domain).unwrap().ids(), "{}", literal);
        }
        assert_eq!(search(env, "[('country_id.name', '=', 'Belgium')]"), [1, 4]);
        assert_eq!(search(env, "['!', ('country_id.name', '=', 'Belgium')]"), [2, 3, 5, 6, 7, 8]);
        assert_eq!(search(env, "[('tag_ids', '=', False)]"), [2, 5, 7]);
        assert_eq!(search(env, "[('name', '=', False)]"), [3]);
        assert_eq!(search(env, "[('tag_ids.name', 'ilike', 'ÉMI')]"), [8]);
    }
}
