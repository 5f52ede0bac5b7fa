use crate::entity::Handle;
use crate::kind::{Kind, KindBuilder, Persist};

use std::any::TypeId;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::{Arc, OnceLock, RwLock};

#[derive(Default)]
struct Registry {
    by_type: HashMap<TypeId, Arc<Kind>>,
    by_name: HashMap<String, Arc<Kind>>,
}

fn registry() -> &'static RwLock<Registry> {
    static REGISTRY: OnceLock<RwLock<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(Default::default)
}

fn make_handle_for<T: Persist>() -> Handle {
    Rc::new(RefCell::new(T::default()))
}

/// Returns the kind descriptor for `T`, building and registering it on
/// first use. Registration is idempotent: concurrent first registrations
/// insert-if-absent and agree on one descriptor.
///
/// Invalid kind definitions (duplicate columns, multiple inheritance) are
/// programmer errors and panic.
pub fn kind_of<T: Persist>() -> Arc<Kind> {
    let type_id = TypeId::of::<T>();
    if let Some(kind) = registry().read().unwrap().by_type.get(&type_id) {
        return kind.clone();
    }

    // Build outside the lock: describing a kind may register its base kind
    // or referenced kinds.
    let mut builder = KindBuilder::<T>::new();
    T::describe(&mut builder);
    let kind = Arc::new(builder.finish(type_id, make_handle_for::<T>));

    let mut reg = registry().write().unwrap();
    if let Some(existing) = reg.by_type.get(&type_id) {
        return existing.clone();
    }
    reg.by_type.insert(type_id, kind.clone());
    reg.by_name.insert(kind.name().to_string(), kind.clone());
    drop(reg);

    if let Some(base) = kind.base() {
        base.add_derived(kind.clone());
    }
    kind
}

/// Looks a kind up by name. Matching is case-insensitive, accepts `/` for
/// `.`, and falls back to basename matching.
pub fn kind_named(name: &str) -> Option<Arc<Kind>> {
    let name = name.to_ascii_lowercase().replace('/', ".");
    let reg = registry().read().unwrap();
    if let Some(kind) = reg.by_name.get(&name) {
        return Some(kind.clone());
    }
    reg.by_name
        .values()
        .find(|kind| kind.basename() == name)
        .cloned()
}

/// Looks a kind up by the concrete type id of an entity.
pub fn kind_for_type_id(type_id: TypeId) -> Option<Arc<Kind>> {
    registry().read().unwrap().by_type.get(&type_id).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityMeta, Ref};
    use crate::{cast_ref, Key};

    #[derive(Default)]
    struct Product {
        meta: EntityMeta,
        name: String,
        category: String,
        price: f64,
        total_quantity: i32,
    }

    crate::impl_entity!(Product { meta: meta });

    impl Persist for Product {
        fn kind_name() -> String {
            "demo.product".to_string()
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

    crate::impl_entity!(Fruit { base: product });

    impl Persist for Fruit {
        fn kind_name() -> String {
            "demo.fruit".to_string()
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

    crate::impl_entity!(Sale { meta: meta });

    impl Persist for Sale {
        fn kind_name() -> String {
            "demo.sale".to_string()
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

    #[test]
    fn registers_root_kind() {
        let kind = kind_of::<Product>();
        assert_eq!(kind.name(), "demo.product");
        assert_eq!(kind.basename(), "product");
        assert_eq!(kind.table_name(), "product");
        assert_eq!(kind.label_col(), Some("Name"));
        assert_eq!(kind.field_names(), vec!["Name", "Category", "Price"]);
        assert_eq!(kind.transient.len(), 1);
        // Registration is idempotent.
        assert!(Arc::ptr_eq(&kind, &kind_of::<Product>()));
    }

    #[test]
    fn derived_kind_prefixes_base_columns() {
        let product = kind_of::<Product>();
        let fruit = kind_of::<Fruit>();
        assert_eq!(
            fruit.field_names(),
            vec!["Name", "Category", "Price", "Color"]
        );
        for (ix, base_col) in product.columns.iter().enumerate() {
            let col = &fruit.columns[ix];
            assert_eq!(col.field_name, base_col.field_name);
            assert_eq!(col.base_depth, base_col.base_depth + 1);
            assert_eq!(col.owner, "demo.product");
        }
        assert_eq!(fruit.columns[3].base_depth, 0);
        assert_eq!(fruit.columns[3].owner, "demo.fruit");
        // Transient fields are inherited too.
        assert_eq!(fruit.transient.len(), 1);
        assert_eq!(fruit.transient[0].base_depth, 1);
    }

    #[test]
    fn derivation_links() {
        let product = kind_of::<Product>();
        let fruit = kind_of::<Fruit>();
        assert!(fruit.derives_from("demo.product"));
        assert!(fruit.derives_from("demo.fruit"));
        assert!(!product.derives_from("demo.fruit"));
        assert!(product
            .derived_kinds()
            .iter()
            .any(|k| k.name() == "demo.fruit"));
    }

    #[test]
    fn reference_columns() {
        let sale = kind_of::<Sale>();
        let product_col = sale.column("Product").unwrap();
        assert_eq!(
            product_col.converter.reference_kind(),
            Some("demo.product")
        );
        assert_eq!(
            product_col.converter.reference_target().unwrap().name(),
            "demo.product"
        );
        assert!(sale.column("Quantity").unwrap().converter.reference_kind().is_none());
    }

    #[test]
    fn lookup_by_name() {
        kind_of::<Product>();
        assert!(kind_named("demo.product").is_some());
        assert!(kind_named("DEMO/PRODUCT").is_some());
        assert!(kind_named("product").is_some());
        assert!(kind_named("no.such.kind").is_none());
    }

    #[test]
    fn make_binds_key() {
        let product = kind_of::<Product>();
        let parent = Key::new(&Key::zero(), "demo.product", 9);
        let handle = product.make(&parent, 42);
        let entity = handle.borrow();
        assert_eq!(entity.meta().id(), 42);
        assert_eq!(entity.meta().kind_name(), Some("demo.product"));
        assert_eq!(entity.meta().parent(), parent);
        assert!(cast_ref::<Product>(&*entity).is_some());
    }

    #[test]
    fn derived_entity_narrows_to_base() {
        let fruit = kind_of::<Fruit>();
        let handle = fruit.make(&Key::zero(), 7);
        let entity = handle.borrow();
        assert!(cast_ref::<Fruit>(&*entity).is_some());
        assert!(cast_ref::<Product>(&*entity).is_some());
        assert!(cast_ref::<Sale>(&*entity).is_none());
    }

    #[derive(Default)]
    struct Dup {
        meta: EntityMeta,
        a: i64,
    }

    crate::impl_entity!(Dup { meta: meta });

    impl Persist for Dup {
        fn describe(b: &mut KindBuilder<Self>) {
            b.field("A", |e: &Dup| &e.a, |e: &mut Dup| &mut e.a);
            b.field("A", |e: &Dup| &e.a, |e: &mut Dup| &mut e.a);
        }
    }

    #[test]
    #[should_panic(expected = "two columns with the same name")]
    fn duplicate_column_panics() {
        kind_of::<Dup>();
    }
}

