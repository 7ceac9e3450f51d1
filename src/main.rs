//! Demo: registers a handful of models, fills them and runs a search.
//!
//! Usage: `recordkit [domain]`, where the optional domain is a literal such as
//! `"[('amount_total', '>', 100)]"` run against `sale.order`. A
//! `recordkit.toml` in the working directory is picked up when present.
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use recordkit::config::EngineConfig;
use recordkit::domain::Domain;
use recordkit::env::{Env, SearchOptions};
use recordkit::field::{FieldDescriptor, OnDelete};
use recordkit::model::ModelDeclaration;
use recordkit::registry::{self, Registry, RegistryBuilder};
use recordkit::value::Value;
use recordkit::{RecordkitError, values};

const CONFIG_FILE: &str = "recordkit.toml";

fn declare() -> Result<Arc<Registry>, RecordkitError> {
    let mut builder = RegistryBuilder::new();
    // registration order is free, references resolve at publish
    builder.register(
        ModelDeclaration::new("sale.order")
            .description("Sales Order")
            .order("name asc")
            .field(FieldDescriptor::char("name").required())
            .field(FieldDescriptor::many2one("partner_id", "res.partner").ondelete(OnDelete::Restrict))
            .field(FieldDescriptor::selection("state", &[("draft", "Quotation"), ("sale", "Sales Order")]).default_value("draft"))
            .field(FieldDescriptor::one2many("line_ids", "sale.order.line", "order_id"))
            .field(FieldDescriptor::char("partner_name").related("partner_id.name"))
            .field(
                FieldDescriptor::float("amount_total")
                    .depends(["line_ids.subtotal"])
                    .store(true)
                    .computed(|order| {
                        let subtotals = order.get("line_ids.subtotal")?;
                        let total = match subtotals {
                            Value::List(items) => items.iter().filter_map(Value::as_f64).sum(),
                            _ => 0.0,
                        };
                        Ok(Value::Float(total))
                    }),
            ),
    )?;
    builder.register(
        ModelDeclaration::new("sale.order.line")
            .field(FieldDescriptor::many2one("order_id", "sale.order").ondelete(OnDelete::Cascade).required())
            .field(FieldDescriptor::char("product").required())
            .field(FieldDescriptor::float("price"))
            .field(FieldDescriptor::integer("quantity").default_value(1))
            .field(
                FieldDescriptor::float("subtotal")
                    .depends(["price", "quantity"])
                    .store(true)
                    .computed(|line| {
                        let price = line.float("price")?.unwrap_or(0.0);
                        let quantity = line.integer("quantity")?.unwrap_or(0);
                        Ok(Value::Float(price * quantity as f64))
                    }),
            ),
    )?;
    builder.register(
        ModelDeclaration::new("mail.thread")
            .field(FieldDescriptor::text("last_message"))
            .field(FieldDescriptor::boolean("followed")),
    )?;
    builder.register(
        ModelDeclaration::new("res.partner")
            .inherits("mail.thread")
            .field(FieldDescriptor::char("name").required().size(64))
            .field(FieldDescriptor::boolean("active").default_value(true)),
    )?;
    builder.register(
        ModelDeclaration::extension("res.partner")
            .field(FieldDescriptor::char("email").indexed())
            .field(FieldDescriptor::one2many("order_ids", "sale.order", "partner_id")),
    )?;
    let registry = builder.publish()?;
    registry::install(Arc::clone(&registry))?;
    Ok(registry)
}

fn populate(env: &Env) -> Result<(), RecordkitError> {
    let partners = [("Azure Interior", "azure@example.com"), ("Deco Addict", "deco@example.com")];
    for (index, (name, email)) in partners.iter().enumerate() {
        let partner = env.create("res.partner", values! { "name" => *name, "email" => *email })?;
        let partner_id = partner.ids()[0];
        for number in 0..3 {
            let order = env.create(
                "sale.order",
                values! { "name" => format!("S{:03}", index * 3 + number), "partner_id" => Value::Id(partner_id) },
            )?;
            for line in 0..=number {
                env.create(
                    "sale.order.line",
                    values! {
                        "order_id" => Value::Id(order.ids()[0]),
                        "product" => format!("Product {}", line),
                        "price" => 25.0 * (line + 1) as f64,
                        "quantity" => (line + 1) as i64,
                    },
                )?;
            }
        }
    }
    Ok(())
}

fn run() -> Result<(), RecordkitError> {
    let config_path = Path::new(CONFIG_FILE).exists().then_some(CONFIG_FILE);
    let config = EngineConfig::load(config_path)?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("Configuration: {:?}", config);

    let registry = declare()?;
    info!("Registered models: {:?}", registry.models().map(|m| m.name()).collect::<Vec<_>>());
    let env = config.env(registry)?;
    populate(&env)?;

    let literal = std::env::args().nth(1).unwrap_or_else(|| "[('amount_total', '>', 100)]".to_string());
    let domain = Domain::parse_literal(&literal)?;
    let orders = env.search("sale.order", &domain, SearchOptions::default().order("amount_total desc"))?;
    info!("{} matched {}", domain, orders);
    for order in orders.iter() {
        println!(
            "{:<6} {:<16} {:>8.2} {}",
            order.display_name()?,
            order.text("partner_name")?.unwrap_or_default(),
            order.float("amount_total")?.unwrap_or(0.0),
            order.text("state")?.unwrap_or_default(),
        );
    }
    let products = orders.mapped("line_ids.product")?;
    println!("{} lines sold", products.len());
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        warn!("{}", e);
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
