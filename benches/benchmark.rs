use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;

use recordkit::domain::Domain;
use recordkit::env::{Env, SearchOptions};
use recordkit::field::FieldDescriptor;
use recordkit::model::ModelDeclaration;
use recordkit::registry::RegistryBuilder;
use recordkit::storage::MemoryStorage;
use recordkit::value::Value;
use recordkit::values;

const LITERAL: &str = "['|', '&', ('active', '=', True), ('age', '>', 18), '!', ('country_id.name', 'ilike', 'bel'), ('name', 'in', ['a1', 'a2', 'a3'])]";

// ------------- Fixture -------------
fn populated(count: u64) -> Env {
    let mut builder = RegistryBuilder::new();
    builder
        .register(
            ModelDeclaration::new("res.partner")
                .field(FieldDescriptor::char("name"))
                .field(FieldDescriptor::integer("age"))
                .field(FieldDescriptor::boolean("active"))
                .field(FieldDescriptor::many2one("country_id", "res.country")),
        )
        .unwrap();
    builder.register(ModelDeclaration::new("res.country").field(FieldDescriptor::char("name"))).unwrap();
    let env = Env::new(builder.publish().unwrap(), Arc::new(MemoryStorage::new()));
    for name in ["Belgium", "France", "Chile"] {
        env.create("res.country", values! { "name" => name }).unwrap();
    }
    for i in 0..count {
        env.create(
            "res.partner",
            values! {
                "name" => format!("a{}", i),
                "age" => (i % 90) as i64,
                "active" => i % 3 != 0,
                "country_id" => Value::Id(i % 3 + 1),
            },
        )
        .unwrap();
    }
    env
}

pub fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("parse literal", |b| b.iter(|| Domain::parse_literal(black_box(LITERAL)).unwrap()));
    let domain = Domain::parse_literal(LITERAL).unwrap();
    c.bench_function("parse tree", |b| b.iter(|| black_box(&domain).parse().unwrap()));
    c.bench_function("normalize", |b| b.iter(|| black_box(&domain).normalize().unwrap()));

    let env = populated(1_000);
    let all = env.search("res.partner", &Domain::new(), SearchOptions::default()).unwrap();
    c.bench_function("filtered_domain 1k", |b| b.iter(|| all.filtered_domain(black_box(&domain)).unwrap()));
    c.bench_function("search 1k", |b| {
        b.iter(|| env.search("res.partner", black_box(&domain), SearchOptions::default()).unwrap())
    });
    let by_age = SearchOptions::default().order("age desc, name").limit(50);
    c.bench_function("search 1k ordered", |b| {
        b.iter(|| env.search("res.partner", black_box(&domain), by_age.clone()).unwrap())
    });
    let half = env.browse("res.partner", (1..=500).collect::<Vec<_>>()).unwrap();
    c.bench_function("union 1k", |b| b.iter(|| all.union(black_box(&half)).unwrap()));
    c.bench_function("mapped cold 1k", |b| {
        b.iter(|| {
            all.invalidate_cache();
            all.mapped("country_id.name").unwrap()
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
