//! A small walkthrough: a product hierarchy, a reference column and an
//! aggregate query.
//!
//! Expects a reachable PostgreSQL server configured via
//! `conf/database.conf`, or adjust the config below.

use kindling::{
    cast_mut, cast_ref, AdapterConfig, Aggregate, EntityManager, EntityMeta, Join, JoinDirection,
    JoinType, Key, KindBuilder, Persist, Ref, Result,
};

#[derive(Default)]
struct Product {
    meta: EntityMeta,
    name: String,
    category: String,
    price: f64,
    total_quantity: i32,
}

kindling::impl_entity!(Product { meta: meta });

impl Persist for Product {
    fn kind_name() -> String {
        "grocery.product".to_string()
    }

    fn describe(b: &mut KindBuilder<Self>) {
        b.field("Name", |e: &Product| &e.name, |e: &mut Product| &mut e.name)
            .tags("label");
        b.field(
            "Category",
            |e: &Product| &e.category,
            |e: &mut Product| &mut e.category,
        );
        b.field("Price", |e: &Product| &e.price, |e: &mut Product| &mut e.price);
        b.transient(
            "TotalQuantity",
            |e: &Product| &e.total_quantity,
            |e: &mut Product| &mut e.total_quantity,
        );
    }
}

#[derive(Default)]
struct Fruit {
    product: Product,
    color: String,
}

kindling::impl_entity!(Fruit { base: product });

impl Persist for Fruit {
    fn kind_name() -> String {
        "grocery.fruit".to_string()
    }

    fn describe(b: &mut KindBuilder<Self>) {
        b.base::<Product>();
        b.field("Color", |e: &Fruit| &e.color, |e: &mut Fruit| &mut e.color);
    }
}

#[derive(Default)]
struct Sale {
    meta: EntityMeta,
    quantity: i32,
    product: Ref<Product>,
}

kindling::impl_entity!(Sale { meta: meta });

impl Persist for Sale {
    fn kind_name() -> String {
        "grocery.sale".to_string()
    }

    fn describe(b: &mut KindBuilder<Self>) {
        b.field(
            "Quantity",
            |e: &Sale| &e.quantity,
            |e: &mut Sale| &mut e.quantity,
        );
        b.reference(
            "Product",
            |e: &Sale| &e.product,
            |e: &mut Sale| &mut e.product,
        );
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let mut config = AdapterConfig::default();
    config.schema = "grocery".to_string();
    config.wipe_schema = true;
    let mut mgr = EntityManager::with_config(config).await?;

    let product_kind = mgr.register::<Product>().await?;
    let fruit_kind = mgr.register::<Fruit>().await?;
    let sale_kind = mgr.register::<Sale>().await?;

    let apple = mgr.new_entity(&fruit_kind, &Key::zero());
    {
        let mut borrowed = apple.borrow_mut();
        let fruit = cast_mut::<Fruit>(&mut *borrowed).unwrap();
        fruit.product.name = "Apple".to_string();
        fruit.product.category = "Fruit".to_string();
        fruit.product.price = 0.69;
        fruit.color = "Red".to_string();
    }
    mgr.put(&apple).await?;
    println!("stored {}", mgr.label(&apple));

    for quantity in [12, 13] {
        let sale = mgr.new_entity(&sale_kind, &Key::zero());
        {
            let mut borrowed = sale.borrow_mut();
            let s = cast_mut::<Sale>(&mut *borrowed).unwrap();
            s.quantity = quantity;
            s.product = Ref::to(apple.clone())?;
        }
        mgr.put(&sale).await?;
    }

    // Total quantity sold per product, polymorphic over the hierarchy.
    let mut query = mgr.query_for(&product_kind);
    query.with_derived(true);
    query.table.group_by = true;
    let mut join = Join::new(sale_kind.clone(), "Product");
    join.direction = JoinDirection::ReferredBy;
    join.join_type = JoinType::Left;
    join.table.add_aggregate(Aggregate {
        function: "SUM".to_string(),
        column: "Quantity".to_string(),
        name: "TotalQuantity".to_string(),
        default: Some("0".to_string()),
    });
    query.add_join(join);

    for row in mgr.execute(&query).await? {
        let Some(entity) = &row[0] else { continue };
        let borrowed = entity.borrow();
        let product = cast_ref::<Product>(&*borrowed).unwrap();
        println!(
            "{} ({}): sold {}",
            product.name,
            borrowed.meta().kind_name().unwrap_or("?"),
            product.total_quantity
        );
    }
    Ok(())
}
