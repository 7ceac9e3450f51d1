use recordkit::SchemaError;
use recordkit::field::{FieldDescriptor, FieldKind};
use recordkit::model::{Direction, ModelDeclaration, OrderBy};
use recordkit::registry::RegistryBuilder;

#[test]
fn extension_adds_fields_to_base() {
    let mut builder = RegistryBuilder::new();
    builder.register(ModelDeclaration::new("b").field(FieldDescriptor::char("y"))).unwrap();
    builder.register(ModelDeclaration::extension("b").field(FieldDescriptor::integer("x"))).unwrap();
    let registry = builder.publish().unwrap();
    let schema = registry.model("b").unwrap();
    assert!(schema.has_field("x"));
    assert!(schema.has_field("y"));
    assert!(schema.has_field("id"));
    // declaration order, the automatic id first
    assert_eq!(schema.field_names(), vec!["id", "y", "x"]);
}

#[test]
fn redeclared_field_replaces_descriptor_entirely() {
    let mut builder = RegistryBuilder::new();
    builder
        .register(ModelDeclaration::new("b").field(FieldDescriptor::char("y").required().size(10).label("Why")))
        .unwrap();
    builder.register(ModelDeclaration::extension("b").field(FieldDescriptor::text("y"))).unwrap();
    let registry = builder.publish().unwrap();
    let y = registry.model("b").unwrap().field("y").unwrap();
    assert_eq!(y.kind(), FieldKind::Text);
    assert!(!y.is_required());
    assert_eq!(y.size_limit(), None);
    assert_eq!(y.string(), "Y");
}

#[test]
fn extension_may_arrive_before_its_base() {
    let mut builder = RegistryBuilder::new();
    builder.register(ModelDeclaration::extension("res.partner").field(FieldDescriptor::char("email"))).unwrap();
    assert_eq!(builder.pending(), vec!["res.partner".to_string()]);
    assert!(builder.schema("res.partner").is_none());
    builder.register(ModelDeclaration::new("res.partner").field(FieldDescriptor::char("name"))).unwrap();
    assert!(builder.pending().is_empty());
    let schema = builder.schema("res.partner").unwrap();
    // the base is applied first, whatever the registration order
    assert_eq!(schema.field_names(), vec!["id", "name", "email"]);
}

#[test]
fn unresolved_extension_is_fatal_at_publish() {
    let mut builder = RegistryBuilder::new();
    builder.register(ModelDeclaration::extension("ghost").field(FieldDescriptor::char("name"))).unwrap();
    match builder.publish() {
        Err(SchemaError::UnknownParent(name)) => assert_eq!(name, "ghost"),
        other => panic!("expected UnknownParent, got {:?}", other.map(|r| r.len())),
    }
}

#[test]
fn classical_parent_fields_are_inherited_with_child_precedence() {
    let mut builder = RegistryBuilder::new();
    builder
        .register(
            ModelDeclaration::new("mail.thread")
                .field(FieldDescriptor::text("last_message"))
                .field(FieldDescriptor::char("name").size(8)),
        )
        .unwrap();
    builder
        .register(
            ModelDeclaration::new("res.partner")
                .inherits("mail.thread")
                .field(FieldDescriptor::char("name").size(64)),
        )
        .unwrap();
    let registry = builder.publish().unwrap();
    let partner = registry.model("res.partner").unwrap();
    assert!(partner.has_field("last_message"));
    assert_eq!(partner.field("name").unwrap().size_limit(), Some(64));
    assert_eq!(partner.table(), "res_partner");
    assert_eq!(registry.model("mail.thread").unwrap().field("name").unwrap().size_limit(), Some(8));
}

#[test]
fn parent_cycles_are_rejected() {
    let mut builder = RegistryBuilder::new();
    builder.register(ModelDeclaration::new("a.one").inherits("a.two")).unwrap();
    let err = builder.register(ModelDeclaration::new("a.two").inherits("a.one")).unwrap_err();
    assert!(matches!(err, SchemaError::CyclicInheritance(_)));
    // the failing declaration was not kept
    assert_eq!(builder.len(), 1);
}

#[test]
fn duplicate_selection_values_are_rejected() {
    let mut builder = RegistryBuilder::new();
    let err = builder
        .register(
            ModelDeclaration::new("sale.order")
                .field(FieldDescriptor::selection("state", &[("draft", "Draft"), ("draft", "Again")])),
        )
        .unwrap_err();
    assert!(matches!(err, SchemaError::InvalidSelection { .. }));
}

#[test]
fn compute_cycles_are_rejected() {
    let mut builder = RegistryBuilder::new();
    let err = builder
        .register(
            ModelDeclaration::new("loop.model")
                .field(FieldDescriptor::integer("a").depends(["b"]).computed(|r| r.get("b")))
                .field(FieldDescriptor::integer("b").depends(["a"]).computed(|r| r.get("a"))),
        )
        .unwrap_err();
    assert!(matches!(err, SchemaError::CyclicCompute(_)));
}

#[test]
fn compute_order_follows_dependencies() {
    let mut builder = RegistryBuilder::new();
    builder
        .register(
            ModelDeclaration::new("sale.order.line")
                .field(FieldDescriptor::float("total").depends(["subtotal", "tax"]).computed(|r| r.get("subtotal")))
                .field(FieldDescriptor::float("tax").depends(["subtotal"]).computed(|r| r.get("subtotal")))
                .field(FieldDescriptor::float("subtotal").depends(["price"]).computed(|r| r.get("price")))
                .field(FieldDescriptor::float("price")),
        )
        .unwrap();
    let registry = builder.publish().unwrap();
    let schema = registry.model("sale.order.line").unwrap();
    assert_eq!(schema.compute_order(), ["subtotal", "tax", "total"]);
    assert_eq!(schema.dependents_of("price"), ["subtotal"]);
}

#[test]
fn depends_without_compute_is_rejected() {
    let mut builder = RegistryBuilder::new();
    let err = builder
        .register(ModelDeclaration::new("res.partner").field(FieldDescriptor::char("name").depends(["email"])))
        .unwrap_err();
    assert!(matches!(err, SchemaError::MissingCompute(_)));
}

#[test]
fn model_defaults() {
    let mut builder = RegistryBuilder::new();
    builder
        .register(ModelDeclaration::new("res.partner").field(FieldDescriptor::char("name")))
        .unwrap();
    builder
        .register(
            ModelDeclaration::new("res.country")
                .table("country")
                .order("code desc, id")
                .rec_name("code")
                .field(FieldDescriptor::char("code")),
        )
        .unwrap();
    builder.register(ModelDeclaration::new("res.log").field(FieldDescriptor::text("message"))).unwrap();
    let registry = builder.publish().unwrap();

    let partner = registry.model("res.partner").unwrap();
    assert_eq!(partner.display_name_field(), "name");
    assert_eq!(partner.default_order(), [OrderBy::asc("id")]);
    assert_eq!(partner.description(), "res.partner");

    let country = registry.model("res.country").unwrap();
    assert_eq!(country.table(), "country");
    assert_eq!(country.display_name_field(), "code");
    assert_eq!(country.default_order()[0], OrderBy { field: "code".to_string(), direction: Direction::Desc });
    assert_eq!(registry.model_of_table("country"), Some("res.country"));

    assert_eq!(registry.model("res.log").unwrap().display_name_field(), "id");
}

#[test]
fn order_on_non_column_is_rejected() {
    let mut builder = RegistryBuilder::new();
    let err = builder
        .register(
            ModelDeclaration::new("sale.order")
                .order("line_ids")
                .field(FieldDescriptor::one2many("line_ids", "sale.order.line", "order_id")),
        )
        .unwrap_err();
    assert!(matches!(err, SchemaError::InvalidOrder { .. }));
}

#[test]
fn duplicate_tables_are_rejected() {
    let mut builder = RegistryBuilder::new();
    builder.register(ModelDeclaration::new("res.partner")).unwrap();
    builder.register(ModelDeclaration::new("res.contact").table("res_partner")).unwrap();
    let err = builder.publish().unwrap_err();
    assert!(matches!(err, SchemaError::DuplicateTable { .. }));
}

#[test]
fn publish_is_final() {
    let mut builder = RegistryBuilder::new();
    builder.register(ModelDeclaration::new("res.partner")).unwrap();
    builder.publish().unwrap();
    let err = builder.register(ModelDeclaration::new("res.country")).unwrap_err();
    assert!(matches!(err, SchemaError::RegistryPublished));
    assert!(matches!(builder.publish(), Err(SchemaError::RegistryPublished)));
}

#[test]
fn many2many_junction_defaults() {
    let mut builder = RegistryBuilder::new();
    builder
        .register(
            ModelDeclaration::new("res.partner")
                .field(FieldDescriptor::many2many("category_ids", "res.partner.category"))
                .field(FieldDescriptor::many2many("friend_ids", "res.partner")),
        )
        .unwrap();
    builder.register(ModelDeclaration::new("res.partner.category")).unwrap();
    let registry = builder.publish().unwrap();
    let partner = registry.model("res.partner").unwrap();
    let categories = partner.field("category_ids").unwrap();
    assert_eq!(categories.junction_table(), Some("res_partner_res_partner_category_rel"));
    assert_eq!(categories.junction_columns(), Some(("res_partner_id", "res_partner_category_id")));
    let friends = partner.field("friend_ids").unwrap();
    assert_eq!(friends.junction_table(), Some("res_partner_res_partner_rel"));
    assert_eq!(friends.junction_columns(), Some(("id1", "id2")));
}

#[test]
fn invalid_names_are_rejected() {
    let mut builder = RegistryBuilder::new();
    assert!(matches!(
        builder.register(ModelDeclaration::new("Bad Name")),
        Err(SchemaError::InvalidName { .. })
    ));
    assert!(matches!(
        builder.register(ModelDeclaration::new("res.partner").field(FieldDescriptor::char("1st"))),
        Err(SchemaError::InvalidName { .. })
    ));
    assert!(builder.is_empty());
}
