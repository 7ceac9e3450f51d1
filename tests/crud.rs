use std::sync::Arc;

use recordkit::domain::Domain;
use recordkit::env::{Env, SearchOptions};
use recordkit::field::{FieldDescriptor, OnDelete};
use recordkit::model::ModelDeclaration;
use recordkit::registry::RegistryBuilder;
use recordkit::storage::MemoryStorage;
use recordkit::value::Value;
use recordkit::{EngineError, values};

fn setup() -> (Env, Arc<MemoryStorage>) {
    let mut builder = RegistryBuilder::new();
    builder
        .register(
            ModelDeclaration::new("res.partner")
                .field(FieldDescriptor::char("name").required().size(10))
                .field(FieldDescriptor::char("ref").readonly())
                .field(FieldDescriptor::selection("state", &[("draft", "Draft"), ("done", "Done")]).default_value("draft"))
                .field(FieldDescriptor::char("code").no_copy())
                .field(FieldDescriptor::integer("rank").default_with(|| Value::Integer(7)))
                .field(FieldDescriptor::boolean("active").default_value(true))
                .field(FieldDescriptor::many2one("country_id", "res.country").ondelete(OnDelete::Restrict))
                .field(FieldDescriptor::many2one("company_id", "res.company"))
                .field(FieldDescriptor::many2one("parent_id", "res.partner").ondelete(OnDelete::Cascade))
                .field(FieldDescriptor::one2many("child_ids", "res.partner", "parent_id"))
                .field(FieldDescriptor::many2many("tag_ids", "res.partner.category")),
        )
        .unwrap();
    for model in ["res.country", "res.company", "res.partner.category"] {
        builder.register(ModelDeclaration::new(model).field(FieldDescriptor::char("name"))).unwrap();
    }
    let registry = builder.publish().unwrap();
    let storage = Arc::new(MemoryStorage::new());
    let env = Env::new(registry, storage.clone());
    env.create("res.country", values! { "name" => "Belgium" }).unwrap();
    env.create("res.company", values! { "name" => "Acme" }).unwrap();
    env.create("res.partner.category", values! { "name" => "gold" }).unwrap();
    (env, storage)
}

fn row(env: &Env, id: u64, fields: &[&str]) -> recordkit::Values {
    env.browse("res.partner", [id]).unwrap().read(fields).unwrap().remove(0)
}

#[test]
fn create_fills_in_defaults() {
    let (env, _) = setup();
    let partner = env.create("res.partner", values! { "name" => "A" }).unwrap();
    assert_eq!(partner.ids(), &[1]);
    let values = row(&env, 1, &["state", "rank", "active", "code", "tag_ids", "country_id", "child_ids"]);
    assert_eq!(values["state"], Value::from("draft"));
    assert_eq!(values["rank"], Value::Integer(7));
    assert_eq!(values["active"], Value::Bool(true));
    assert_eq!(values["code"], Value::from(""));
    assert_eq!(values["tag_ids"], Value::Ids(vec![]));
    assert_eq!(values["country_id"], Value::Null);
    assert_eq!(values["child_ids"], Value::Ids(vec![]));
    // false on a text field means not set
    env.create("res.partner", values! { "name" => "B", "code" => false }).unwrap();
    assert_eq!(row(&env, 2, &["code"])["code"], Value::Null);
}

#[test]
fn readonly_fields_are_set_only_on_create() {
    let (env, _) = setup();
    let partner = env.create("res.partner", values! { "name" => "A", "ref" => "R1" }).unwrap();
    assert!(matches!(
        partner.write(values! { "ref" => "R2" }),
        Err(EngineError::ReadonlyField { ref field, .. }) if field == "ref"
    ));
    assert!(matches!(partner.write(values! { "id" => 5 }), Err(EngineError::ReadonlyField { .. })));
    partner.with_readonly_writes().write(values! { "ref" => "R2" }).unwrap();
    assert_eq!(row(&env, 1, &["ref"])["ref"], Value::from("R2"));
}

#[test]
fn values_are_validated() {
    let (env, _) = setup();
    let invalid = |values| matches!(env.create("res.partner", values), Err(EngineError::InvalidValue { .. }));
    assert!(invalid(values! { "name" => "A", "state" => "cancel" }));
    assert!(invalid(values! { "name" => "ABCDEFGHIJK" }));
    assert!(invalid(values! { "name" => "A", "rank" => "high" }));
    assert!(invalid(values! { "name" => "A", "country_id" => "Belgium" }));
    assert!(invalid(values! { "name" => "A", "child_ids" => Value::Ids(vec![1]) }));
    // the size counts characters
    env.create("res.partner", values! { "name" => "ÉÉÉÉÉÉÉÉÉÉ", "state" => "done" }).unwrap();
    assert!(matches!(
        env.create("res.partner", values! { "name" => "A", "nickname" => "a" }),
        Err(EngineError::UnknownField { .. })
    ));
}

fn name_missing<T>(result: Result<T, EngineError>) -> bool {
    matches!(result, Err(EngineError::MissingRequired { ref field, .. }) if field == "name")
}

#[test]
fn required_fields_must_be_set() {
    let (env, storage) = setup();
    assert!(name_missing(env.create("res.partner", values! { "rank" => 1 })));
    assert!(name_missing(env.create("res.partner", values! { "name" => "" })));
    assert_eq!(storage.len("res.partner"), 0);

    let partner = env.create("res.partner", values! { "name" => "A" }).unwrap();
    assert!(name_missing(partner.write(values! { "name" => false })));
    assert!(name_missing(partner.write(values! { "name" => "" })));
    assert_eq!(row(&env, 1, &["name"])["name"], Value::from("A"));
}

#[test]
fn restricted_references_block_deletion() {
    let (env, storage) = setup();
    let partner = env.create("res.partner", values! { "name" => "A", "country_id" => Value::Id(1) }).unwrap();
    let belgium = env.browse("res.country", [1]).unwrap();
    match belgium.unlink() {
        Err(EngineError::Restricted { model, referrer }) => {
            assert_eq!(model, "res.country");
            assert_eq!(referrer, "res.partner");
        }
        other => panic!("expected a restricted deletion, got {:?}", other),
    }
    assert_eq!(storage.len("res.country"), 1);
    partner.write(values! { "country_id" => false }).unwrap();
    belgium.unlink().unwrap();
    assert_eq!(storage.len("res.country"), 0);
}

#[test]
fn deleting_a_target_clears_references() {
    let (env, _) = setup();
    env.create("res.partner", values! { "name" => "A", "company_id" => Value::Id(1) }).unwrap();
    env.create("res.partner", values! { "name" => "B", "company_id" => Value::Id(1) }).unwrap();
    env.browse("res.company", [1]).unwrap().unlink().unwrap();
    let partners = env.browse("res.partner", [1, 2]).unwrap();
    assert!(partners.mapped("company_id").unwrap().is_empty());
    let orphans = Domain::parse_literal("[('company_id', '=', False)]").unwrap();
    assert_eq!(env.search("res.partner", &orphans, SearchOptions::default()).unwrap().ids(), &[1, 2]);
}

#[test]
fn deleting_a_parent_cascades() {
    let (env, storage) = setup();
    env.create("res.partner", values! { "name" => "Parent" }).unwrap();
    env.create("res.partner", values! { "name" => "Child", "parent_id" => Value::Id(1) }).unwrap();
    env.create("res.partner", values! { "name" => "Grandchild", "parent_id" => Value::Id(2) }).unwrap();
    env.create("res.partner", values! { "name" => "Other" }).unwrap();
    let parent = env.browse("res.partner", [1]).unwrap();
    assert_eq!(parent.mapped("child_ids").unwrap(), vec![Value::Id(2)]);
    parent.unlink().unwrap();
    assert_eq!(storage.len("res.partner"), 1);
    let left = env.search("res.partner", &Domain::new(), SearchOptions::default()).unwrap();
    assert_eq!(left.display_names().unwrap(), vec!["Other"]);
}

#[test]
fn copies_carry_copied_fields() {
    let (env, _) = setup();
    let original = env
        .create(
            "res.partner",
            values! {
                "name" => "A",
                "ref" => "R1",
                "code" => "X1",
                "state" => "done",
                "country_id" => Value::Id(1),
                "tag_ids" => Value::Ids(vec![1]),
            },
        )
        .unwrap();
    let copy = original.copy(values! { "name" => "A (copy)" }).unwrap();
    assert_eq!(copy.ids(), &[2]);
    let values = row(&env, 2, &["name", "ref", "code", "state", "country_id", "tag_ids"]);
    assert_eq!(values["name"], Value::from("A (copy)"));
    assert_eq!(values["ref"], Value::from("R1"));
    assert_eq!(values["code"], Value::from(""));
    assert_eq!(values["state"], Value::from("done"));
    assert_eq!(values["country_id"], Value::Id(1));
    assert_eq!(values["tag_ids"], Value::Ids(vec![1]));

    let both = env.browse("res.partner", [1, 2]).unwrap().copy(values! {}).unwrap();
    assert_eq!(both.ids(), &[3, 4]);
    assert_eq!(both.display_names().unwrap(), vec!["A", "A (copy)"]);
}

#[test]
fn writing_nothing_or_to_nobody_is_a_no_op() {
    let (env, storage) = setup();
    env.create("res.partner", values! { "name" => "A" }).unwrap();
    storage.reset_fetch_count();
    env.browse("res.partner", []).unwrap().write(values! { "name" => "B" }).unwrap();
    env.browse("res.partner", [1]).unwrap().write(values! {}).unwrap();
    env.browse("res.partner", []).unwrap().unlink().unwrap();
    assert_eq!(storage.fetch_count(), 0);
    assert_eq!(row(&env, 1, &["name"])["name"], Value::from("A"));
}
